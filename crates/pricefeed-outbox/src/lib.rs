//! Transactional outbox for reliable event delivery.
//!
//! This crate provides:
//! - [`OutboxWriter`]: records an event in the same SQLite transaction as the
//!   state change it describes
//! - [`OutboxDispatcher`]: publish and retry loops that drain the outbox into a
//!   [`MessageBroker`]
//! - [`RedisStreamBroker`] and [`InMemoryBroker`] broker implementations
//!
//! Delivery is at-least-once; every message carries its outbox event id so
//! consumers can deduplicate.

mod broker;
mod dispatcher;
mod error;
mod redis_broker;
mod writer;

pub use broker::{BrokerAck, BrokerMessage, InMemoryBroker, MessageBroker};
pub use dispatcher::{DispatcherConfig, DispatcherStats, OutboxDispatcher, PublishReport, RetryReport};
pub use error::{OutboxError, OutboxResult};
pub use redis_broker::RedisStreamBroker;
pub use writer::OutboxWriter;
