//! Pricefeed daemon - periodic token price sync with transactional outbox relay.

mod app;
mod health;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use pricefeed_core::{init_logging, Config, Paths};

/// Pricefeed daemon command-line interface.
#[derive(Parser)]
#[command(name = "pricefeed-daemon")]
#[command(about = "Syncs token prices and relays price events to the message broker")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error). Defaults to the configured level
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Base directory for runtime files (config, database, logs). Defaults to ~/.pricefeed
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,

    /// Message broker to publish outbox events to
    #[arg(long, value_enum, default_value_t = BrokerKind::Redis, global = true)]
    broker: BrokerKind,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sync worker and outbox dispatcher in the foreground
    Run,
    /// Print outbox counts
    Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BrokerKind {
    /// Redis streams at the configured URL
    Redis,
    /// Keep published messages in process memory
    Memory,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let paths = match cli.base_dir {
        Some(base) => Paths::with_base_dir(base),
        None => Paths::new()?,
    };
    let config = Config::load(&paths)?;

    match cli.command {
        Some(Commands::Run) | None => {
            let level = cli.log_level.as_deref().unwrap_or(&config.log_level);
            init_logging("pricefeed-daemon", level, &paths);
            app::run_daemon(config, paths, cli.broker).await?;
        }
        Some(Commands::Status) => {
            app::print_status(&config, &paths).await?;
        }
    }

    Ok(())
}
