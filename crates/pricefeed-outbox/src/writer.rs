//! Outbox write path.
//!
//! An event is recorded only together with the state change it describes:
//! the domain mutation and the outbox insert share one transaction, so
//! either both are committed or neither is.

use crate::OutboxResult;
use pricefeed_database::{queries, AsyncDatabase, DatabaseResult, NewOutboxEvent, OutboxEvent};
use rusqlite::Transaction;
use tracing::debug;

/// Records outbox events alongside domain mutations.
#[derive(Clone)]
pub struct OutboxWriter {
    db: AsyncDatabase,
    default_topic: String,
}

impl OutboxWriter {
    /// `default_topic` is used for events that do not name a destination.
    pub fn new(db: AsyncDatabase, default_topic: impl Into<String>) -> Self {
        Self {
            db,
            default_topic: default_topic.into(),
        }
    }

    pub fn default_topic(&self) -> &str {
        &self.default_topic
    }

    /// Run `mutation` and insert `event` in a new transaction.
    ///
    /// If `mutation` fails nothing is written.
    pub async fn create_event<F, T>(&self, event: NewOutboxEvent, mutation: F) -> OutboxResult<(T, OutboxEvent)>
    where
        F: FnOnce(&Transaction<'_>) -> DatabaseResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let default_topic = self.default_topic.clone();
        let recorded = self
            .db
            .transaction(move |tx| record(tx, &default_topic, event, mutation))
            .await?;
        Ok(recorded)
    }

    /// Run `mutation` and insert `event` inside a caller-owned transaction.
    ///
    /// Nothing is committed here; the caller decides the transaction's fate.
    pub fn create_event_in_tx<F, T>(
        &self,
        tx: &Transaction<'_>,
        event: NewOutboxEvent,
        mutation: F,
    ) -> DatabaseResult<(T, OutboxEvent)>
    where
        F: FnOnce(&Transaction<'_>) -> DatabaseResult<T>,
    {
        record(tx, &self.default_topic, event, mutation)
    }
}

fn record<F, T>(
    tx: &Transaction<'_>,
    default_topic: &str,
    mut event: NewOutboxEvent,
    mutation: F,
) -> DatabaseResult<(T, OutboxEvent)>
where
    F: FnOnce(&Transaction<'_>) -> DatabaseResult<T>,
{
    let value = mutation(tx)?;

    if event.destination_topic.as_deref().map_or(true, str::is_empty) {
        event.destination_topic = Some(default_topic.to_string());
    }
    let stored = queries::insert_outbox_event(tx, &event)?;
    debug!(
        event_id = %stored.id,
        event_type = %stored.event_type,
        aggregate_id = %stored.aggregate_id,
        "Outbox event recorded"
    );
    Ok((value, stored))
}
