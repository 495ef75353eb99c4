//! Periodic token price synchronization.
//!
//! Every `interval` the worker loads all tokens and, in chunks of
//! `batch_size` (tokens within a chunk concurrently), fetches a fresh price
//! through the circuit breaker. A price that moved by at least
//! `threshold_percent` is written together with a `token.price.updated`
//! outbox event in one transaction. Any per-token failure keeps the last
//! stored price and never aborts the cycle.
//!
//! # Lifecycle
//!
//! 1. Create with [`PriceSyncWorker::new()`]
//! 2. [`PriceSyncWorker::start()`] runs the first cycle immediately, then on
//!    every interval
//! 3. [`PriceSyncWorker::stop()`] stops the timer and waits for a running cycle

mod source;


pub use source::{MockPriceSource, PriceSource, UpstreamError};

use chrono::Utc;
use circuit_breaker::CircuitBreakerRegistry;
use futures_util::future::join_all;
use parking_lot::Mutex;
use pricefeed_core::{PeriodicLoop, RunningFlag, TickOutcome};
use pricefeed_database::{format_timestamp, queries, AsyncDatabase, DatabaseError, NewOutboxEvent, Token};
use pricefeed_outbox::{OutboxError, OutboxWriter};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Event type for price changes.
pub const PRICE_UPDATED_EVENT: &str = "token.price.updated";
/// Aggregate type of price change events.
pub const TOKEN_AGGREGATE_TYPE: &str = "Token";
/// Partition key used when a token has no symbol.
pub const UNKNOWN_SYMBOL: &str = "UNKNOWN";
/// Default circuit guarding the price source.
pub const DEFAULT_CIRCUIT_NAME: &str = "price-source";

/// Sync worker error type.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Outbox error: {0}")]
    Outbox(#[from] OutboxError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias using SyncError.
pub type SyncResult<T> = Result<T, SyncError>;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct SyncWorkerConfig {
    pub interval: Duration,
    /// Tokens fetched concurrently per chunk.
    pub batch_size: usize,
    /// Minimum change, in percent, that is persisted.
    pub threshold_percent: f64,
    pub circuit_name: String,
}

impl Default for SyncWorkerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            batch_size: 5,
            threshold_percent: 0.1,
            circuit_name: DEFAULT_CIRCUIT_NAME.to_string(),
        }
    }
}

/// Payload of a `token.price.updated` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceUpdatePayload {
    pub token_id: String,
    pub symbol: String,
    pub old_price: f64,
    pub new_price: f64,
    /// RFC 3339 time the change was detected.
    pub timestamp: String,
}

/// Tally of one sync cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub tokens: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub below_threshold: usize,
    /// Fetch failed or circuit open; last stored price kept.
    pub fallback: usize,
    /// Invalid stored price or failed write.
    pub failed: usize,
}

impl CycleReport {
    fn record(&mut self, outcome: TokenOutcome) {
        match outcome {
            TokenOutcome::Updated => self.updated += 1,
            TokenOutcome::Unchanged => self.unchanged += 1,
            TokenOutcome::BelowThreshold => self.below_threshold += 1,
            TokenOutcome::Fallback => self.fallback += 1,
            TokenOutcome::Failed => self.failed += 1,
        }
    }
}

/// Worker state for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub is_running: bool,
    pub is_processing: bool,
    pub interval_seconds: u64,
    pub batch_size: usize,
    pub threshold_percent: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenOutcome {
    Updated,
    Unchanged,
    BelowThreshold,
    Fallback,
    Failed,
}

/// Percent change from `old` to `new`; a move away from zero counts as 100%.
pub fn percent_change(old: f64, new: f64) -> f64 {
    if old == 0.0 {
        return 100.0;
    }
    ((new - old) / old).abs() * 100.0
}

fn symbol_or_unknown(token: &Token) -> &str {
    if token.symbol.is_empty() {
        UNKNOWN_SYMBOL
    } else {
        &token.symbol
    }
}

struct WorkerInner {
    db: AsyncDatabase,
    writer: OutboxWriter,
    source: Arc<dyn PriceSource>,
    breakers: Arc<CircuitBreakerRegistry>,
    config: SyncWorkerConfig,
    processing: RunningFlag,
}

/// Periodic price synchronization worker.
pub struct PriceSyncWorker {
    inner: Arc<WorkerInner>,
    periodic: Mutex<Option<PeriodicLoop>>,
}

impl PriceSyncWorker {
    pub fn new(
        db: AsyncDatabase,
        writer: OutboxWriter,
        source: Arc<dyn PriceSource>,
        breakers: Arc<CircuitBreakerRegistry>,
        config: SyncWorkerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                db,
                writer,
                source,
                breakers,
                config,
                processing: RunningFlag::new(),
            }),
            periodic: Mutex::new(None),
        }
    }

    /// Start the sync loop. The first cycle runs immediately.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let mut periodic = self.periodic.lock();
        if periodic.is_some() {
            warn!("Price sync worker is already running");
            return;
        }

        let inner = self.inner.clone();
        *periodic = Some(PeriodicLoop::spawn(
            "price-sync",
            self.inner.config.interval,
            true,
            move || {
                let inner = inner.clone();
                async move {
                    if let Err(e) = inner.run_cycle().await {
                        error!(error = %e, "Error in price update cycle");
                    }
                }
            },
        ));

        info!(
            interval_seconds = self.inner.config.interval.as_secs(),
            batch_size = self.inner.config.batch_size,
            threshold_percent = self.inner.config.threshold_percent,
            source = self.inner.source.name(),
            "Price sync worker started"
        );
    }

    /// Stop the sync loop, waiting for a running cycle to finish.
    pub async fn stop(&self) {
        let periodic = self.periodic.lock().take();
        match periodic {
            Some(periodic) => {
                periodic.stop().await;
                info!("Price sync worker stopped");
            }
            None => warn!("Price sync worker is not running"),
        }
    }

    pub fn is_running(&self) -> bool {
        self.periodic.lock().is_some()
    }

    /// Run one sync cycle now. Skipped if a cycle is already running.
    pub async fn run_cycle(&self) -> SyncResult<TickOutcome<CycleReport>> {
        self.inner.run_cycle().await
    }

    pub fn status(&self) -> SyncStatus {
        let config = &self.inner.config;
        SyncStatus {
            is_running: self.is_running(),
            is_processing: self.inner.processing.is_running(),
            interval_seconds: config.interval.as_secs(),
            batch_size: config.batch_size,
            threshold_percent: config.threshold_percent,
        }
    }
}

impl WorkerInner {
    async fn run_cycle(&self) -> SyncResult<TickOutcome<CycleReport>> {
        let Some(_guard) = self.processing.try_begin() else {
            warn!("Price update cycle skipped: previous cycle still in progress");
            return Ok(TickOutcome::Skipped);
        };

        let tokens = self.db.call(|conn| queries::list_tokens(conn)).await?;
        let mut report = CycleReport {
            tokens: tokens.len(),
            ..Default::default()
        };
        if tokens.is_empty() {
            warn!("No tokens found to update prices");
            return Ok(TickOutcome::Completed(report));
        }

        info!(count = tokens.len(), "Updating token prices");
        for chunk in tokens.chunks(self.config.batch_size.max(1)) {
            let outcomes = join_all(chunk.iter().map(|token| self.update_token(token))).await;
            for outcome in outcomes {
                report.record(outcome);
            }
        }

        info!(
            updated = report.updated,
            unchanged = report.unchanged,
            below_threshold = report.below_threshold,
            fallback = report.fallback,
            failed = report.failed,
            "Price update cycle completed"
        );
        Ok(TickOutcome::Completed(report))
    }

    async fn update_token(&self, token: &Token) -> TokenOutcome {
        let symbol = symbol_or_unknown(token);
        let old_price = token.price;
        if !old_price.is_finite() {
            warn!(token_id = %token.id, symbol, "Invalid stored price, skipping update");
            return TokenOutcome::Failed;
        }

        let fetched = self
            .breakers
            .execute(&self.config.circuit_name, || self.source.fetch_price(token))
            .await
            .map_err(|e| e.to_string())
            .and_then(|price| {
                if price.is_finite() && price >= 0.0 {
                    Ok(price)
                } else {
                    Err(UpstreamError::InvalidPrice {
                        symbol: symbol.to_string(),
                        price,
                    }
                    .to_string())
                }
            });
        let new_price = match fetched {
            Ok(price) => price,
            Err(e) => {
                warn!(
                    token_id = %token.id,
                    symbol,
                    last_price = old_price,
                    error = %e,
                    "Price fetch failed, keeping last known price"
                );
                return TokenOutcome::Fallback;
            }
        };

        if new_price == old_price {
            debug!(symbol, "No price change detected");
            return TokenOutcome::Unchanged;
        }

        let change = percent_change(old_price, new_price);
        if change < self.config.threshold_percent {
            debug!(symbol, change_percent = %format!("{:.2}", change), "Price change too small, skipping");
            return TokenOutcome::BelowThreshold;
        }

        match self.persist_change(token, symbol, old_price, new_price).await {
            Ok(()) => {
                info!(
                    symbol,
                    old_price,
                    new_price,
                    change_percent = %format!("{:.2}", change),
                    "Price updated"
                );
                TokenOutcome::Updated
            }
            Err(e) => {
                error!(token_id = %token.id, symbol, error = %e, "Failed to update token price");
                TokenOutcome::Failed
            }
        }
    }

    /// Write the new price and its outbox event in one transaction.
    async fn persist_change(
        &self,
        token: &Token,
        symbol: &str,
        old_price: f64,
        new_price: f64,
    ) -> SyncResult<()> {
        let payload = PriceUpdatePayload {
            token_id: token.id.clone(),
            symbol: symbol.to_string(),
            old_price,
            new_price,
            timestamp: format_timestamp(Utc::now()),
        };
        let event = NewOutboxEvent {
            event_type: PRICE_UPDATED_EVENT.to_string(),
            aggregate_id: token.id.clone(),
            aggregate_type: TOKEN_AGGREGATE_TYPE.to_string(),
            payload: serde_json::to_value(&payload)?,
            destination_topic: None,
            partition_key: Some(symbol.to_string()),
        };

        let token_id = token.id.clone();
        self.writer
            .create_event(event, move |tx| {
                queries::update_token_price(tx, &token_id, new_price)
            })
            .await?;
        Ok(())
    }
}
