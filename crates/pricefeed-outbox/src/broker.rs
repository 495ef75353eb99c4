//! Message broker abstraction.

use crate::{OutboxError, OutboxResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::time::Duration;
use tracing::debug;

/// A message handed to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub topic: String,
    /// Partitioning / ordering key.
    pub key: String,
    /// Serialized event payload.
    pub value: String,
    /// Outbox event id, for consumer-side deduplication.
    pub event_id: String,
}

/// Broker confirmation of a publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAck {
    pub topic: String,
    /// Broker-assigned message id.
    pub message_id: String,
}

/// Publish sink for outbox events.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Publish one message. `Err` means the broker did not confirm it.
    async fn publish(&self, message: &BrokerMessage) -> OutboxResult<BrokerAck>;

    /// Whether the broker is currently reachable.
    async fn health_check(&self) -> bool;

    /// Short name for logs and health output.
    fn name(&self) -> &'static str;
}

#[derive(Debug, Default)]
struct InMemoryState {
    messages: Vec<BrokerMessage>,
    fail_all: bool,
    failing_keys: HashSet<String>,
    delay: Option<Duration>,
}

/// Broker that keeps published messages in memory.
///
/// Used by `--broker memory` and by tests, which can script failures per
/// key or globally and add latency to each publish.
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    state: Mutex<InMemoryState>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every published message, in publish order.
    pub fn messages(&self) -> Vec<BrokerMessage> {
        self.state.lock().messages.clone()
    }

    pub fn published_count(&self) -> usize {
        self.state.lock().messages.len()
    }

    /// Reject every publish while set.
    pub fn set_failing(&self, failing: bool) {
        self.state.lock().fail_all = failing;
    }

    /// Reject publishes whose key equals `key`.
    pub fn fail_key(&self, key: impl Into<String>) {
        self.state.lock().failing_keys.insert(key.into());
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.fail_all = false;
        state.failing_keys.clear();
    }

    /// Sleep this long inside every publish.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.state.lock().delay = delay;
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn publish(&self, message: &BrokerMessage) -> OutboxResult<BrokerAck> {
        let delay = self.state.lock().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if state.fail_all || state.failing_keys.contains(&message.key) {
            return Err(OutboxError::Broker(format!(
                "in-memory broker rejected message for key {}",
                message.key
            )));
        }

        state.messages.push(message.clone());
        let message_id = format!("{}-0", state.messages.len());
        debug!(topic = %message.topic, key = %message.key, message_id = %message_id, "Message stored");

        Ok(BrokerAck {
            topic: message.topic.clone(),
            message_id,
        })
    }

    async fn health_check(&self) -> bool {
        !self.state.lock().fail_all
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
