//! Outbox dispatcher.
//!
//! Two independent periodic loops drain the outbox:
//!
//! - **publish** (every `processing_interval`): takes up to `batch_size`
//!   PENDING events oldest first and handles them concurrently:
//!   PENDING -> PROCESSING -> publish -> PUBLISHED, or FAILED with the error
//!   recorded and `retry_count + 1`.
//! - **retry** (every `retry_interval`): moves FAILED events with
//!   `retry_count < max_retries` back to PENDING. Events past the budget stay
//!   FAILED for good. Events stuck in PROCESSING longer than
//!   `processing_timeout` are failed first, so they are retried too.
//!
//! Each loop skips a tick while its previous tick is still running.

use crate::{BrokerMessage, MessageBroker, OutboxError, OutboxResult};
use chrono::Utc;
use futures_util::future::join_all;
use parking_lot::Mutex;
use pricefeed_core::{PeriodicLoop, RunningFlag, TickOutcome};
use pricefeed_database::{queries, AsyncDatabase, OutboxEvent, OutboxStats};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Maximum PENDING events handled per publish tick.
    pub batch_size: usize,
    pub processing_interval: Duration,
    pub retry_interval: Duration,
    /// Failed attempts after which an event is no longer retried.
    pub max_retries: u32,
    /// Age at which a PROCESSING event is considered abandoned.
    pub processing_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            processing_interval: Duration::from_millis(1_000),
            retry_interval: Duration::from_millis(30_000),
            max_retries: 3,
            processing_timeout: Duration::from_secs(300),
        }
    }
}

/// Result of one publish tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PublishReport {
    pub fetched: usize,
    pub published: usize,
    pub failed: usize,
    /// Events another worker already claimed, or that hit a store error
    /// before being claimed. They stay as they were.
    pub skipped: usize,
}

/// Result of one retry tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetryReport {
    /// Abandoned PROCESSING events moved to FAILED.
    pub recovered: usize,
    pub requeued: usize,
    pub skipped: usize,
}

/// Dispatcher state for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct DispatcherStats {
    pub is_publishing: bool,
    pub is_retrying: bool,
    pub batch_size: usize,
    pub processing_interval_ms: u64,
    pub retry_interval_ms: u64,
    pub max_retries: u32,
    pub outbox: OutboxStats,
    /// FAILED events with no retry budget left.
    pub dead_lettered: u64,
}

enum EventOutcome {
    Published,
    Failed,
    Skipped,
}

struct DispatcherInner {
    db: AsyncDatabase,
    broker: Arc<dyn MessageBroker>,
    config: DispatcherConfig,
    publishing: RunningFlag,
    retrying: RunningFlag,
}

/// Drains the outbox into a [`MessageBroker`].
pub struct OutboxDispatcher {
    inner: Arc<DispatcherInner>,
    starting: RunningFlag,
    loops: Mutex<Vec<PeriodicLoop>>,
}

impl OutboxDispatcher {
    pub fn new(db: AsyncDatabase, broker: Arc<dyn MessageBroker>, config: DispatcherConfig) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                db,
                broker,
                config,
                publishing: RunningFlag::new(),
                retrying: RunningFlag::new(),
            }),
            starting: RunningFlag::new(),
            loops: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    /// Fail events left PROCESSING by a previous process so the retry loop
    /// picks them up. Returns how many were recovered.
    pub async fn recover(&self) -> OutboxResult<usize> {
        let recovered = self
            .inner
            .db
            .call(|conn| queries::fail_interrupted_processing_events(conn))
            .await?;
        if recovered > 0 {
            warn!(count = recovered, "Recovered outbox events interrupted mid-publish");
        }
        Ok(recovered)
    }

    /// Recover interrupted events, then start the publish and retry loops.
    pub async fn start(&self) -> OutboxResult<()> {
        let Some(_starting) = self.starting.try_begin() else {
            warn!("Outbox dispatcher is already starting");
            return Ok(());
        };
        if self.is_running() {
            warn!("Outbox dispatcher already running");
            return Ok(());
        }

        self.recover().await?;

        let config = &self.inner.config;
        let publish = {
            let inner = self.inner.clone();
            PeriodicLoop::spawn("outbox-publish", config.processing_interval, false, move || {
                let inner = inner.clone();
                async move {
                    if let Err(e) = inner.tick_publish().await {
                        error!(error = %e, "Outbox publish tick failed");
                    }
                }
            })
        };
        let retry = {
            let inner = self.inner.clone();
            PeriodicLoop::spawn("outbox-retry", config.retry_interval, false, move || {
                let inner = inner.clone();
                async move {
                    if let Err(e) = inner.tick_retry().await {
                        error!(error = %e, "Outbox retry tick failed");
                    }
                }
            })
        };

        let mut loops = self.loops.lock();
        loops.push(publish);
        loops.push(retry);

        info!(
            batch_size = config.batch_size,
            processing_interval_ms = config.processing_interval.as_millis() as u64,
            retry_interval_ms = config.retry_interval.as_millis() as u64,
            max_retries = config.max_retries,
            "Outbox dispatcher started"
        );
        Ok(())
    }

    /// Stop both loops, waiting for in-flight ticks to finish.
    pub async fn stop(&self) {
        let loops = std::mem::take(&mut *self.loops.lock());
        if loops.is_empty() {
            return;
        }

        info!("Stopping outbox dispatcher");
        for periodic in &loops {
            periodic.stop().await;
        }
        info!("Outbox dispatcher stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.loops.lock().is_empty()
    }

    /// Run one publish tick now.
    pub async fn tick_publish(&self) -> OutboxResult<TickOutcome<PublishReport>> {
        self.inner.tick_publish().await
    }

    /// Run one retry tick now.
    pub async fn tick_retry(&self) -> OutboxResult<TickOutcome<RetryReport>> {
        self.inner.tick_retry().await
    }

    pub async fn stats(&self) -> OutboxResult<DispatcherStats> {
        let max_retries = self.inner.config.max_retries;
        let (outbox, dead_lettered) = self
            .inner
            .db
            .call(move |conn| {
                Ok((
                    queries::get_outbox_stats(conn)?,
                    queries::count_dead_lettered_events(conn, max_retries)?,
                ))
            })
            .await?;

        let config = &self.inner.config;
        Ok(DispatcherStats {
            is_publishing: self.inner.publishing.is_running(),
            is_retrying: self.inner.retrying.is_running(),
            batch_size: config.batch_size,
            processing_interval_ms: config.processing_interval.as_millis() as u64,
            retry_interval_ms: config.retry_interval.as_millis() as u64,
            max_retries,
            outbox,
            dead_lettered,
        })
    }

    /// Whether the broker currently answers.
    pub async fn broker_healthy(&self) -> bool {
        self.inner.broker.health_check().await
    }

    pub fn broker_name(&self) -> &'static str {
        self.inner.broker.name()
    }
}

impl DispatcherInner {
    async fn tick_publish(&self) -> OutboxResult<TickOutcome<PublishReport>> {
        let Some(_guard) = self.publishing.try_begin() else {
            debug!("Previous publish tick still running, skipping");
            return Ok(TickOutcome::Skipped);
        };

        let limit = self.config.batch_size;
        let events = self
            .db
            .call(move |conn| queries::get_pending_outbox_events(conn, limit))
            .await?;

        let mut report = PublishReport {
            fetched: events.len(),
            ..Default::default()
        };
        if events.is_empty() {
            return Ok(TickOutcome::Completed(report));
        }

        info!(count = events.len(), "Processing pending outbox events");
        let outcomes = join_all(events.into_iter().map(|event| self.process_event(event))).await;
        for outcome in outcomes {
            match outcome {
                EventOutcome::Published => report.published += 1,
                EventOutcome::Failed => report.failed += 1,
                EventOutcome::Skipped => report.skipped += 1,
            }
        }

        debug!(
            published = report.published,
            failed = report.failed,
            skipped = report.skipped,
            "Publish tick complete"
        );
        Ok(TickOutcome::Completed(report))
    }

    async fn process_event(&self, event: OutboxEvent) -> EventOutcome {
        let event_id = event.id.clone();

        let id = event_id.clone();
        match self
            .db
            .call(move |conn| queries::mark_outbox_processing(conn, &id))
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_conflict() => {
                debug!(event_id = %event_id, "Outbox event already claimed");
                return EventOutcome::Skipped;
            }
            Err(e) => {
                error!(event_id = %event_id, error = %e, "Failed to claim outbox event");
                return EventOutcome::Skipped;
            }
        }

        match self.publish(&event).await {
            Ok(()) => {
                let id = event_id.clone();
                if let Err(e) = self
                    .db
                    .call(move |conn| queries::mark_outbox_published(conn, &id))
                    .await
                {
                    // Left PROCESSING; the retry loop fails it after `processing_timeout`.
                    error!(event_id = %event_id, error = %e, "Published but failed to mark outbox event");
                }
                debug!(event_id = %event_id, "Outbox event published");
                EventOutcome::Published
            }
            Err(publish_error) => {
                let message = publish_error.to_string();
                error!(event_id = %event_id, error = %message, "Failed to publish outbox event");

                let id = event_id.clone();
                if let Err(e) = self
                    .db
                    .call(move |conn| queries::mark_outbox_failed(conn, &id, &message))
                    .await
                {
                    error!(event_id = %event_id, error = %e, "Failed to mark outbox event as failed");
                }
                EventOutcome::Failed
            }
        }
    }

    async fn publish(&self, event: &OutboxEvent) -> OutboxResult<()> {
        let topic = event
            .destination_topic
            .as_deref()
            .filter(|topic| !topic.is_empty())
            .ok_or_else(|| OutboxError::MissingTopic(event.id.clone()))?;

        let message = BrokerMessage {
            topic: topic.to_string(),
            key: event.message_key().to_string(),
            value: serde_json::to_string(&event.payload)?,
            event_id: event.id.clone(),
        };
        self.broker.publish(&message).await?;
        Ok(())
    }

    async fn tick_retry(&self) -> OutboxResult<TickOutcome<RetryReport>> {
        let Some(_guard) = self.retrying.try_begin() else {
            debug!("Previous retry tick still running, skipping");
            return Ok(TickOutcome::Skipped);
        };

        let mut report = RetryReport::default();

        let timeout = chrono::Duration::from_std(self.config.processing_timeout)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let cutoff = Utc::now() - timeout;
        report.recovered = self
            .db
            .call(move |conn| queries::fail_stale_processing_events(conn, cutoff))
            .await?;
        if report.recovered > 0 {
            warn!(count = report.recovered, "Failed outbox events stuck in PROCESSING");
        }

        let max_retries = self.config.max_retries;
        let events = self
            .db
            .call(move |conn| queries::get_retryable_failed_events(conn, max_retries))
            .await?;

        if events.is_empty() {
            return Ok(TickOutcome::Completed(report));
        }

        info!(count = events.len(), "Retrying failed outbox events");
        for event in events {
            let id = event.id.clone();
            match self
                .db
                .call(move |conn| queries::reset_failed_event_for_retry(conn, &id))
                .await
            {
                Ok(()) => {
                    debug!(event_id = %event.id, retry_count = event.retry_count, "Outbox event requeued");
                    report.requeued += 1;
                }
                Err(e) => {
                    warn!(event_id = %event.id, error = %e, "Failed to requeue outbox event");
                    report.skipped += 1;
                }
            }
        }
        Ok(TickOutcome::Completed(report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BrokerAck, InMemoryBroker, OutboxWriter};
    use async_trait::async_trait;
    use pricefeed_database::{format_timestamp, NewOutboxEvent, OutboxStatus};
    use serde_json::json;
    use std::time::Instant;

    const TOPIC: &str = "token-price-updates";

    fn config() -> DispatcherConfig {
        DispatcherConfig {
            batch_size: 10,
            processing_interval: Duration::from_millis(20),
            retry_interval: Duration::from_millis(20),
            max_retries: 3,
            processing_timeout: Duration::from_secs(60),
        }
    }

    fn event(symbol: &str) -> NewOutboxEvent {
        NewOutboxEvent {
            event_type: "token.price.updated".to_string(),
            aggregate_id: format!("tok-{}", symbol),
            aggregate_type: "Token".to_string(),
            payload: json!({ "symbol": symbol, "newPrice": 101.0 }),
            destination_topic: None,
            partition_key: Some(symbol.to_string()),
        }
    }

    async fn enqueue(db: &AsyncDatabase, symbol: &str) -> OutboxEvent {
        let writer = OutboxWriter::new(db.clone(), TOPIC);
        let (_, stored) = writer.create_event(event(symbol), |_tx| Ok(())).await.unwrap();
        stored
    }

    async fn load(db: &AsyncDatabase, id: &str) -> OutboxEvent {
        let id = id.to_string();
        db.call(move |conn| queries::get_outbox_event(conn, &id))
            .await
            .unwrap()
            .unwrap()
    }

    async fn setup() -> (AsyncDatabase, Arc<InMemoryBroker>, OutboxDispatcher) {
        let db = AsyncDatabase::open_in_memory().await.unwrap();
        let broker = Arc::new(InMemoryBroker::new());
        let dispatcher = OutboxDispatcher::new(db.clone(), broker.clone(), config());
        (db, broker, dispatcher)
    }

    async fn wait_until<F, Fut>(mut condition: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition().await {
            assert!(Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Records the stored status of each event at the moment it is published.
    struct ObservingBroker {
        db: AsyncDatabase,
        seen: Mutex<Vec<OutboxStatus>>,
    }

    #[async_trait]
    impl MessageBroker for ObservingBroker {
        async fn publish(&self, message: &BrokerMessage) -> OutboxResult<BrokerAck> {
            let stored = load(&self.db, &message.event_id).await;
            self.seen.lock().push(stored.status);
            Ok(BrokerAck {
                topic: message.topic.clone(),
                message_id: "1-0".to_string(),
            })
        }

        async fn health_check(&self) -> bool {
            true
        }

        fn name(&self) -> &'static str {
            "observing"
        }
    }

    #[tokio::test]
    async fn test_publish_tick_publishes_pending_events() {
        let (db, broker, dispatcher) = setup().await;
        let stored = enqueue(&db, "BTC").await;

        let report = dispatcher.tick_publish().await.unwrap().completed().unwrap();
        assert_eq!(
            report,
            PublishReport {
                fetched: 1,
                published: 1,
                failed: 0,
                skipped: 0,
            }
        );

        let messages = broker.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].topic, TOPIC);
        assert_eq!(messages[0].key, "BTC");
        assert_eq!(messages[0].event_id, stored.id);
        let value: serde_json::Value = serde_json::from_str(&messages[0].value).unwrap();
        assert_eq!(value, stored.payload);

        let published = load(&db, &stored.id).await;
        assert_eq!(published.status, OutboxStatus::Published);
        assert!(published.processed_at.is_some());
        assert!(published.published_at.is_some());
    }

    #[tokio::test]
    async fn test_events_are_processing_while_published() {
        let db = AsyncDatabase::open_in_memory().await.unwrap();
        let broker = Arc::new(ObservingBroker {
            db: db.clone(),
            seen: Mutex::new(Vec::new()),
        });
        let dispatcher = OutboxDispatcher::new(db.clone(), broker.clone(), config());

        enqueue(&db, "BTC").await;
        enqueue(&db, "ETH").await;
        dispatcher.tick_publish().await.unwrap();

        assert_eq!(
            *broker.seen.lock(),
            vec![OutboxStatus::Processing, OutboxStatus::Processing]
        );
    }

    #[tokio::test]
    async fn test_one_failure_does_not_affect_siblings() {
        let (db, broker, dispatcher) = setup().await;
        let btc = enqueue(&db, "BTC").await;
        let eth = enqueue(&db, "ETH").await;
        let sol = enqueue(&db, "SOL").await;
        broker.fail_key("ETH");

        let report = dispatcher.tick_publish().await.unwrap().completed().unwrap();
        assert_eq!(report.published, 2);
        assert_eq!(report.failed, 1);

        assert_eq!(load(&db, &btc.id).await.status, OutboxStatus::Published);
        assert_eq!(load(&db, &sol.id).await.status, OutboxStatus::Published);

        let failed = load(&db, &eth.id).await;
        assert_eq!(failed.status, OutboxStatus::Failed);
        assert_eq!(failed.retry_count, 1);
        assert!(failed.last_error.unwrap().contains("ETH"));
    }

    #[tokio::test]
    async fn test_event_without_topic_fails() {
        let (db, broker, dispatcher) = setup().await;
        let stored = db
            .call(|conn| queries::insert_outbox_event(conn, &event("BTC")))
            .await
            .unwrap();
        assert!(stored.destination_topic.is_none());

        let report = dispatcher.tick_publish().await.unwrap().completed().unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(broker.published_count(), 0);

        let failed = load(&db, &stored.id).await;
        assert_eq!(failed.status, OutboxStatus::Failed);
        assert!(failed.last_error.unwrap().contains("no destination topic"));
    }

    #[tokio::test]
    async fn test_retry_requeues_until_budget_is_spent() {
        let (db, broker, dispatcher) = setup().await;
        let stored = enqueue(&db, "BTC").await;
        broker.set_failing(true);

        for attempt in 1..=3u32 {
            let publish = dispatcher.tick_publish().await.unwrap().completed().unwrap();
            assert_eq!(publish.failed, 1);
            let failed = load(&db, &stored.id).await;
            assert_eq!(failed.status, OutboxStatus::Failed);
            assert_eq!(failed.retry_count, attempt);

            let retry = dispatcher.tick_retry().await.unwrap().completed().unwrap();
            if attempt < 3 {
                assert_eq!(retry.requeued, 1);
                let requeued = load(&db, &stored.id).await;
                assert_eq!(requeued.status, OutboxStatus::Pending);
                assert_eq!(requeued.retry_count, attempt);
                assert!(requeued.last_error.is_none());
            } else {
                assert_eq!(retry.requeued, 0);
            }
        }

        // Dead letter: nothing left to publish even once the broker recovers.
        broker.clear_failures();
        let publish = dispatcher.tick_publish().await.unwrap().completed().unwrap();
        assert_eq!(publish.fetched, 0);

        let stats = dispatcher.stats().await.unwrap();
        assert_eq!(stats.outbox.failed, 1);
        assert_eq!(stats.dead_lettered, 1);
        assert_eq!(stats.max_retries, 3);
    }

    #[tokio::test]
    async fn test_busy_publish_tick_is_skipped() {
        let (db, broker, dispatcher) = setup().await;
        enqueue(&db, "BTC").await;

        let guard = dispatcher.inner.publishing.try_begin().unwrap();
        assert!(dispatcher.tick_publish().await.unwrap().is_skipped());
        assert!(dispatcher.stats().await.unwrap().is_publishing);
        drop(guard);

        assert_eq!(broker.published_count(), 0);
        let report = dispatcher.tick_publish().await.unwrap().completed().unwrap();
        assert_eq!(report.published, 1);
    }

    #[tokio::test]
    async fn test_busy_retry_tick_is_skipped() {
        let (_db, _broker, dispatcher) = setup().await;
        let _guard = dispatcher.inner.retrying.try_begin().unwrap();
        assert!(dispatcher.tick_retry().await.unwrap().is_skipped());
    }

    #[tokio::test]
    async fn test_recover_fails_interrupted_events_then_redrives_them() {
        let (db, broker, dispatcher) = setup().await;
        let stored = enqueue(&db, "BTC").await;
        let id = stored.id.clone();
        db.call(move |conn| queries::mark_outbox_processing(conn, &id))
            .await
            .unwrap();

        assert_eq!(dispatcher.recover().await.unwrap(), 1);
        let failed = load(&db, &stored.id).await;
        assert_eq!(failed.status, OutboxStatus::Failed);
        assert_eq!(failed.retry_count, 1);

        assert_eq!(dispatcher.tick_retry().await.unwrap().completed().unwrap().requeued, 1);
        assert_eq!(dispatcher.tick_publish().await.unwrap().completed().unwrap().published, 1);
        assert_eq!(broker.published_count(), 1);
    }

    #[tokio::test]
    async fn test_retry_tick_fails_abandoned_processing_events() {
        let (db, broker, dispatcher) = setup().await;
        let abandoned = enqueue(&db, "BTC").await;
        let in_flight = enqueue(&db, "ETH").await;

        let (stale_id, fresh_id) = (abandoned.id.clone(), in_flight.id.clone());
        db.call(move |conn| {
            queries::mark_outbox_processing(conn, &stale_id)?;
            queries::mark_outbox_processing(conn, &fresh_id)?;
            Ok(())
        })
        .await
        .unwrap();
        let stale_at = format_timestamp(Utc::now() - chrono::Duration::minutes(10));
        let stale_id = abandoned.id.clone();
        db.call_sqlite(move |conn| {
            conn.execute(
                "UPDATE outbox_events SET processed_at = ?1 WHERE id = ?2",
                rusqlite::params![stale_at, stale_id],
            )
        })
        .await
        .unwrap();

        let retry = dispatcher.tick_retry().await.unwrap().completed().unwrap();
        assert_eq!(retry.recovered, 1);
        assert_eq!(retry.requeued, 1);

        let requeued = load(&db, &abandoned.id).await;
        assert_eq!(requeued.status, OutboxStatus::Pending);
        assert_eq!(requeued.retry_count, 1);
        assert_eq!(load(&db, &in_flight.id).await.status, OutboxStatus::Processing);

        assert_eq!(dispatcher.tick_publish().await.unwrap().completed().unwrap().published, 1);
        assert_eq!(broker.messages()[0].event_id, abandoned.id);
    }

    #[tokio::test]
    async fn test_concurrent_start_spawns_one_loop_pair() {
        let (_db, _broker, dispatcher) = setup().await;

        let (first, second) = tokio::join!(dispatcher.start(), dispatcher.start());
        first.unwrap();
        second.unwrap();
        assert_eq!(dispatcher.loops.lock().len(), 2);

        dispatcher.stop().await;
        assert!(!dispatcher.is_running());
    }

    #[tokio::test]
    async fn test_loops_publish_and_stop() {
        let (db, broker, dispatcher) = setup().await;
        dispatcher.start().await.unwrap();
        assert!(dispatcher.is_running());
        dispatcher.start().await.unwrap();

        enqueue(&db, "BTC").await;
        enqueue(&db, "ETH").await;
        let observed = broker.clone();
        wait_until(|| {
            let observed = observed.clone();
            async move { observed.published_count() == 2 }
        })
        .await;

        dispatcher.stop().await;
        assert!(!dispatcher.is_running());
        let stats = dispatcher.stats().await.unwrap();
        assert_eq!(stats.outbox.published, 2);
        assert!(!stats.is_publishing);
    }

    #[tokio::test]
    async fn test_stop_waits_for_in_flight_publish() {
        let (db, broker, dispatcher) = setup().await;
        broker.set_delay(Some(Duration::from_millis(200)));
        let stored = enqueue(&db, "BTC").await;

        dispatcher.start().await.unwrap();
        let probe = db.clone();
        wait_until(|| {
            let probe = probe.clone();
            async move {
                probe
                    .call(|conn| queries::get_outbox_stats(conn))
                    .await
                    .map(|stats| stats.processing == 1)
                    .unwrap_or(false)
            }
        })
        .await;

        dispatcher.stop().await;
        assert_eq!(load(&db, &stored.id).await.status, OutboxStatus::Published);
    }
}
