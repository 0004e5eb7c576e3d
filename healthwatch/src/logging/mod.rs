//! Logging setup with a reloadable filter, daily log files and live streaming.
//!
//! [`init_logging`] installs one global subscriber with:
//! - a reloadable [`EnvFilter`] (`RUST_LOG`, then the configured directive, then [`DEFAULT_LOG_FILTER`])
//! - console output with local timestamps
//! - a daily rolling file in the log directory
//! - a broadcast layer that republishes events as [`LogEvent`]s

mod layer;
mod retention;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter,
    fmt,
    layer::SubscriberExt,
    reload::{self, Handle},
    util::SubscriberInitExt,
};

use self::layer::{BroadcastLayer, LocalTimer};
use crate::{Error, Result};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "healthwatch=info";

/// File name prefix of the daily log files.
pub(crate) const LOG_FILE_PREFIX: &str = "healthwatch.log";

/// Log retention period in days.
const LOG_RETENTION_DAYS: i64 = 7;

/// Broadcast channel capacity for log events.
const LOG_BROADCAST_CAPACITY: usize = 1024;

/// Type alias for the reload handle.
pub type FilterHandle = Handle<EnvFilter, tracing_subscriber::Registry>;

/// A single log event for streaming to the control panel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub target: String,
    pub message: String,
}

/// Handle to the installed logging stack.
pub struct LoggingConfig {
    handle: FilterHandle,
    log_tx: broadcast::Sender<LogEvent>,
    log_dir: PathBuf,
}

impl LoggingConfig {
    /// Current filter directive.
    pub fn get_filter(&self) -> String {
        self.handle
            .with_current(|filter| filter.to_string())
            .unwrap_or_default()
    }

    /// Replace the filter directive at runtime, e.g. `"healthwatch::scheduler=debug"`.
    pub fn set_filter(&self, directive: &str) -> Result<()> {
        let new_filter = EnvFilter::try_new(directive)
            .map_err(|e| Error::config(format!("Invalid filter directive: {}", e)))?;

        self.handle
            .reload(new_filter)
            .map_err(|e| Error::Other(format!("Failed to reload filter: {}", e)))?;

        info!(directive = %directive, "Log filter updated");
        Ok(())
    }

    /// Receive every log event from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.log_tx.subscribe()
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Start a daily task deleting log files older than seven days.
    pub fn start_retention_cleanup(self: &Arc<Self>, cancel_token: CancellationToken) {
        let log_dir = self.log_dir.clone();

        tokio::spawn(async move {
            let cleanup_interval = Duration::from_secs(24 * 60 * 60);

            loop {
                if let Err(e) = retention::cleanup_old_logs(&log_dir, LOG_RETENTION_DAYS).await {
                    warn!(error = %e, "Failed to cleanup old logs");
                }

                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        debug!("Log retention cleanup task shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(cleanup_interval) => {}
                }
            }
        });
    }
}

/// Initialize logging.
///
/// `filter` is used when `RUST_LOG` is not set. Keep the returned guard alive
/// for the lifetime of the process or buffered file output is lost.
pub fn init_logging(log_dir: &str, filter: Option<&str>) -> Result<(Arc<LoggingConfig>, WorkerGuard)> {
    let log_path = PathBuf::from(log_dir);
    std::fs::create_dir_all(&log_path)?;

    let file_appender = tracing_appender::rolling::daily(&log_path, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let initial_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        filter
            .and_then(|directive| EnvFilter::try_new(directive).ok())
            .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER))
    });
    let (filter_layer, filter_handle) = reload::Layer::new(initial_filter);

    let (log_tx, _) = broadcast::channel(LOG_BROADCAST_CAPACITY);
    let broadcast_layer = BroadcastLayer { tx: log_tx.clone() };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer().with_ansi(true).with_timer(LocalTimer))
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_timer(LocalTimer),
        )
        .with(broadcast_layer)
        .try_init()
        .map_err(|e| Error::Other(format!("Failed to set global default subscriber: {}", e)))?;

    let config = Arc::new(LoggingConfig {
        handle: filter_handle,
        log_tx,
        log_dir: log_path,
    });

    Ok((config, guard))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter() {
        assert!(DEFAULT_LOG_FILTER.contains("healthwatch=info"));
        assert!(EnvFilter::try_new(DEFAULT_LOG_FILTER).is_ok());
    }

    /// The same layer stack as `init_logging`, minus the writers, for scoped use.
    fn scoped_stack(directive: &str) -> (impl tracing::Subscriber + Send + Sync, LoggingConfig) {
        let (filter_layer, handle) = reload::Layer::new(EnvFilter::new(directive));
        let (log_tx, _) = broadcast::channel(16);
        let subscriber = tracing_subscriber::registry()
            .with(filter_layer)
            .with(BroadcastLayer { tx: log_tx.clone() });
        let config = LoggingConfig {
            handle,
            log_tx,
            log_dir: PathBuf::from("logs"),
        };
        (subscriber, config)
    }

    #[test]
    fn test_events_are_streamed_with_fields() {
        let (subscriber, config) = scoped_stack("info");
        let mut rx = config.subscribe();

        tracing::subscriber::with_default(subscriber, || {
            info!(run_id = 7, "Run started");
            debug!("Below the filter");
        });

        let event = rx.try_recv().unwrap();
        assert_eq!(event.level, "INFO");
        assert_eq!(event.message, "Run started run_id=7");
        assert!(event.target.ends_with("logging::tests"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_set_filter_applies_at_runtime() {
        let (subscriber, config) = scoped_stack("info");
        let mut rx = config.subscribe();

        tracing::subscriber::with_default(subscriber, || {
            assert_eq!(config.get_filter().to_lowercase(), "info");
            config.set_filter("warn").unwrap();
            info!("Suppressed after reload");
            warn!(task = "disk", "Task failed");
        });

        assert_eq!(config.get_filter().to_lowercase(), "warn");
        let event = rx.try_recv().unwrap();
        assert_eq!(event.level, "WARN");
        assert_eq!(event.message, "Task failed task=disk");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_invalid_filter_is_rejected() {
        let (_subscriber, config) = scoped_stack("info");
        let err = config.set_filter("healthwatch=loud").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert_eq!(config.get_filter().to_lowercase(), "info");
    }

    #[test]
    fn test_log_event_serialization() {
        let event = LogEvent {
            timestamp: Utc::now(),
            level: "WARN".to_string(),
            target: "healthwatch::monitor".to_string(),
            message: "High CPU usage".to_string(),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("WARN"));
        assert!(json.contains("High CPU usage"));
    }
}
