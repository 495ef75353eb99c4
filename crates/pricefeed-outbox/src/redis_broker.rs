//! Redis Streams broker.
//!
//! Each message becomes one stream entry:
//! `XADD <topic> * key <key> value <value> event_id <id>`.

use crate::{BrokerAck, BrokerMessage, MessageBroker, OutboxError, OutboxResult};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::Client;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Publishes outbox messages to Redis Streams.
///
/// The connection is established on first use and dropped after any error,
/// so the next publish reconnects.
pub struct RedisStreamBroker {
    client: Client,
    conn: Mutex<Option<MultiplexedConnection>>,
    send_timeout: Duration,
}

impl RedisStreamBroker {
    /// Create a broker for `redis_url`. Does not connect yet.
    pub fn new(redis_url: &str, send_timeout: Duration) -> OutboxResult<Self> {
        let client = Client::open(redis_url)?;
        Ok(Self {
            client,
            conn: Mutex::new(None),
            send_timeout,
        })
    }

    async fn connection(&self) -> OutboxResult<MultiplexedConnection> {
        let mut conn = self.conn.lock().await;
        if let Some(existing) = conn.as_ref() {
            return Ok(existing.clone());
        }

        let fresh = self.client.get_multiplexed_async_connection().await?;
        info!("Connected to Redis");
        *conn = Some(fresh.clone());
        Ok(fresh)
    }

    async fn disconnect(&self) {
        if self.conn.lock().await.take().is_some() {
            warn!("Dropped Redis connection after error, will reconnect on next publish");
        }
    }

    async fn xadd(&self, message: &BrokerMessage) -> OutboxResult<String> {
        let mut conn = self.connection().await?;
        let entry_id: String = redis::cmd("XADD")
            .arg(&message.topic)
            .arg("*")
            .arg("key")
            .arg(&message.key)
            .arg("value")
            .arg(&message.value)
            .arg("event_id")
            .arg(&message.event_id)
            .query_async(&mut conn)
            .await?;
        Ok(entry_id)
    }

    /// Bound `fut` by the send timeout, dropping the connection on failure.
    async fn bounded<T>(
        &self,
        fut: impl std::future::Future<Output = OutboxResult<T>>,
    ) -> OutboxResult<T> {
        let result = match tokio::time::timeout(self.send_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(OutboxError::Broker(format!(
                "send timed out after {}ms",
                self.send_timeout.as_millis()
            ))),
        };
        if result.is_err() {
            self.disconnect().await;
        }
        result
    }
}

#[async_trait]
impl MessageBroker for RedisStreamBroker {
    async fn publish(&self, message: &BrokerMessage) -> OutboxResult<BrokerAck> {
        let entry_id = self.bounded(self.xadd(message)).await?;
        debug!(
            topic = %message.topic,
            key = %message.key,
            event_id = %message.event_id,
            entry_id = %entry_id,
            "Published to Redis stream"
        );
        Ok(BrokerAck {
            topic: message.topic.clone(),
            message_id: entry_id,
        })
    }

    async fn health_check(&self) -> bool {
        let ping = async {
            let mut conn = self.connection().await?;
            let _: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok::<(), OutboxError>(())
        };
        self.bounded(ping).await.is_ok()
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_invalid_url() {
        let result = RedisStreamBroker::new("not a url", Duration::from_millis(100));
        assert!(matches!(result, Err(OutboxError::Redis(_))));
    }

    #[tokio::test]
    async fn test_unreachable_server_fails_publish() {
        // Port 1 is never a Redis server.
        let broker = RedisStreamBroker::new("redis://127.0.0.1:1", Duration::from_millis(500)).unwrap();
        let message = BrokerMessage {
            topic: "t".to_string(),
            key: "k".to_string(),
            value: "{}".to_string(),
            event_id: "e".to_string(),
        };

        assert!(broker.publish(&message).await.is_err());
        assert!(!broker.health_check().await);
        assert!(broker.conn.lock().await.is_none());
    }
}
