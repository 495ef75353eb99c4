//! Logging initialization.
//!
//! Delegates to the observability crate, which writes structured JSONL to the
//! central log file and mirrors events to stderr.

use crate::Paths;
use observability::LogConfig;

/// Initialize logging for a pricefeed service.
///
/// `level` is the default filter; `RUST_LOG` takes precedence when set.
///
/// ```ignore
/// init_logging("pricefeed-daemon", "info", &paths);
/// tracing::info!("Daemon started");
/// ```
pub fn init_logging(service_name: &str, level: &str, paths: &Paths) {
    observability::init_with_config(LogConfig {
        service_name: service_name.to_string(),
        default_level: level.to_string(),
        log_path: Some(paths.log_file()),
        also_stderr: true,
    });
}
