//! Aggregated health view of the running pipeline.

use chrono::Utc;
use circuit_breaker::{CircuitBreakerRegistry, CircuitState, CircuitStatus};
use price_sync_worker::{PriceSyncWorker, SyncStatus};
use pricefeed_database::{format_timestamp, OutboxStats};
use pricefeed_outbox::{DispatcherStats, OutboxDispatcher, OutboxResult};
use serde::Serialize;

/// PENDING plus PROCESSING events at which the outbox counts as backed up.
pub const OUTBOX_BACKLOG_LIMIT: u64 = 1_000;

#[derive(Debug, Clone, Serialize)]
pub struct BrokerHealth {
    pub name: &'static str,
    pub connected: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub healthy: bool,
    pub timestamp: String,
    pub outbox_backlog_healthy: bool,
    pub broker: BrokerHealth,
    pub circuits: Vec<CircuitState>,
    pub dispatcher: DispatcherStats,
    pub sync: SyncStatus,
}

impl HealthSnapshot {
    pub async fn collect(
        breakers: &CircuitBreakerRegistry,
        dispatcher: &OutboxDispatcher,
        sync: &PriceSyncWorker,
    ) -> OutboxResult<Self> {
        let stats = dispatcher.stats().await?;
        let broker = BrokerHealth {
            name: dispatcher.broker_name(),
            connected: dispatcher.broker_healthy().await,
        };
        let outbox_backlog_healthy = backlog_healthy(&stats.outbox);
        let circuits = breakers.states();
        let circuits_closed = circuits.iter().all(|c| c.state != CircuitStatus::Open);

        Ok(Self {
            healthy: outbox_backlog_healthy && broker.connected && circuits_closed,
            timestamp: format_timestamp(Utc::now()),
            outbox_backlog_healthy,
            broker,
            circuits,
            dispatcher: stats,
            sync: sync.status(),
        })
    }

    pub fn open_circuits(&self) -> Vec<&str> {
        self.circuits
            .iter()
            .filter(|c| c.state == CircuitStatus::Open)
            .map(|c| c.name.as_str())
            .collect()
    }
}

pub fn backlog_healthy(stats: &OutboxStats) -> bool {
    stats.in_flight() < OUTBOX_BACKLOG_LIMIT
}
