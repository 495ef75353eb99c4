//! Core types, configuration, and runtime primitives for pricefeed.

mod config;
mod error;
mod logging;
mod paths;
pub mod periodic;

pub use config::{
    BrokerSettings, CircuitBreakerSettings, Config, OutboxSettings, SyncSettings,
    DEFAULT_BROKER_TOPIC, DEFAULT_LOG_LEVEL, DEFAULT_REDIS_URL,
};
pub use error::{CoreError, CoreResult};
pub use logging::init_logging;
pub use paths::Paths;
pub use periodic::{PeriodicLoop, RunGuard, RunState, RunningFlag, TickOutcome};
