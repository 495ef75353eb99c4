//! Daemon wiring and lifecycle.

use crate::health::{backlog_healthy, HealthSnapshot};
use crate::BrokerKind;
use circuit_breaker::{CircuitBreakerOptions, CircuitBreakerRegistry};
use price_sync_worker::{MockPriceSource, PriceSyncWorker, SyncWorkerConfig, DEFAULT_CIRCUIT_NAME};
use pricefeed_core::{CircuitBreakerSettings, Config, OutboxSettings, Paths, SyncSettings};
use pricefeed_database::{queries, AsyncDatabase, OutboxStats};
use pricefeed_outbox::{
    DispatcherConfig, InMemoryBroker, MessageBroker, OutboxDispatcher, OutboxWriter,
    RedisStreamBroker,
};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(60);

pub fn breaker_options(settings: &CircuitBreakerSettings) -> CircuitBreakerOptions {
    CircuitBreakerOptions {
        failure_threshold: settings.failure_threshold,
        recovery_timeout: Duration::from_millis(settings.recovery_timeout_ms),
        success_threshold: settings.success_threshold,
        timeout: Duration::from_millis(settings.timeout_ms),
    }
}

pub fn dispatcher_config(settings: &OutboxSettings) -> DispatcherConfig {
    DispatcherConfig {
        batch_size: settings.batch_size,
        processing_interval: Duration::from_millis(settings.processing_interval_ms),
        retry_interval: Duration::from_millis(settings.retry_interval_ms),
        max_retries: settings.max_retries,
        processing_timeout: Duration::from_millis(settings.processing_timeout_ms),
    }
}

pub fn sync_config(settings: &SyncSettings) -> SyncWorkerConfig {
    SyncWorkerConfig {
        interval: Duration::from_secs(settings.interval_seconds),
        batch_size: settings.batch_size,
        threshold_percent: settings.threshold_percent,
        circuit_name: DEFAULT_CIRCUIT_NAME.to_string(),
    }
}

fn create_broker(config: &Config, kind: BrokerKind) -> Result<Arc<dyn MessageBroker>, Box<dyn std::error::Error>> {
    let broker: Arc<dyn MessageBroker> = match kind {
        BrokerKind::Redis => Arc::new(RedisStreamBroker::new(
            &config.broker.redis_url,
            Duration::from_millis(config.broker.send_timeout_ms),
        )?),
        BrokerKind::Memory => {
            warn!("Using in-memory broker; published events are not delivered anywhere");
            Arc::new(InMemoryBroker::new())
        }
    };
    Ok(broker)
}

/// Run the daemon until Ctrl-C.
pub async fn run_daemon(
    config: Config,
    paths: Paths,
    broker_kind: BrokerKind,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("Starting pricefeed daemon");
    paths.ensure_dirs()?;

    let db_path = config.database_path(&paths);
    let db = AsyncDatabase::open(&db_path).await?;
    info!(
        database = %db_path.display(),
        broker = ?broker_kind,
        topic = %config.broker.topic,
        "Configuration loaded"
    );

    let broker = create_broker(&config, broker_kind)?;
    if !broker.health_check().await {
        warn!(broker = broker.name(), "Broker not reachable yet; events stay queued until it is");
    }

    let breakers = Arc::new(CircuitBreakerRegistry::new());
    breakers.create_circuit(DEFAULT_CIRCUIT_NAME, breaker_options(&config.circuit_breaker));

    let dispatcher = OutboxDispatcher::new(db.clone(), broker, dispatcher_config(&config.outbox));
    let sync = PriceSyncWorker::new(
        db.clone(),
        OutboxWriter::new(db.clone(), config.broker.topic.clone()),
        Arc::new(MockPriceSource::new()),
        breakers.clone(),
        sync_config(&config.sync),
    );

    dispatcher.start().await?;
    sync.start();
    info!(pid = std::process::id(), "Daemon started");

    let mut health_ticker = interval_at(Instant::now() + HEALTH_LOG_INTERVAL, HEALTH_LOG_INTERVAL);
    health_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(e) = result {
                    error!(error = %e, "Failed to listen for shutdown signal");
                }
                info!("Received shutdown signal, stopping...");
                break;
            }
            _ = health_ticker.tick() => {
                log_health(&breakers, &dispatcher, &sync).await;
            }
        }
    }

    sync.stop().await;
    dispatcher.stop().await;
    db.close().await?;
    info!("Daemon stopped");
    Ok(())
}

async fn log_health(breakers: &CircuitBreakerRegistry, dispatcher: &OutboxDispatcher, sync: &PriceSyncWorker) {
    let snapshot = match HealthSnapshot::collect(breakers, dispatcher, sync).await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            error!(error = %e, "Failed to collect health snapshot");
            return;
        }
    };

    let outbox = &snapshot.dispatcher.outbox;
    let open_circuits = snapshot.open_circuits().join(",");
    if snapshot.healthy {
        info!(
            pending = outbox.pending,
            processing = outbox.processing,
            published = outbox.published,
            failed = outbox.failed,
            dead_lettered = snapshot.dispatcher.dead_lettered,
            open_circuits = %open_circuits,
            "Health check"
        );
    } else {
        warn!(
            pending = outbox.pending,
            processing = outbox.processing,
            failed = outbox.failed,
            outbox_backlog_healthy = snapshot.outbox_backlog_healthy,
            broker_connected = snapshot.broker.connected,
            open_circuits = %open_circuits,
            "Health check failed"
        );
    }
}

/// Outbox counts as printed by `status`.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub database: String,
    pub outbox: OutboxStats,
    pub dead_lettered: u64,
    pub outbox_backlog_healthy: bool,
}

pub async fn collect_status(db_path: &Path, max_retries: u32) -> Result<StatusReport, Box<dyn std::error::Error>> {
    let db = AsyncDatabase::open(db_path).await?;
    let (outbox, dead_lettered) = db
        .call(move |conn| {
            Ok((
                queries::get_outbox_stats(conn)?,
                queries::count_dead_lettered_events(conn, max_retries)?,
            ))
        })
        .await?;
    db.close().await?;

    Ok(StatusReport {
        database: db_path.display().to_string(),
        outbox_backlog_healthy: backlog_healthy(&outbox),
        outbox,
        dead_lettered,
    })
}

/// Print outbox counts for the configured database.
pub async fn print_status(config: &Config, paths: &Paths) -> Result<(), Box<dyn std::error::Error>> {
    let db_path = config.database_path(paths);
    if !db_path.exists() {
        println!("No database found at {}", db_path.display());
        return Ok(());
    }

    let report = collect_status(&db_path, config.outbox.max_retries).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
