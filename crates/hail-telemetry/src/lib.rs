mod logging;

pub use logging::{LogQuery, LogRecord, SqliteLogLayer, SqliteLogSink};

use std::path::PathBuf;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "hail_server::presence" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Whether to persist warn+ logs to SQLite.
    pub log_to_sqlite: bool,
    /// Path to the log database.
    pub log_db_path: PathBuf,
    /// Persisted records older than this many days are dropped at startup.
    /// `None` keeps everything.
    pub log_retention_days: Option<u32>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            log_to_sqlite: true,
            log_db_path: dirs_fallback().join("database/logs.db"),
            log_retention_days: Some(7),
        }
    }
}

impl TelemetryConfig {
    /// The filter directive used when RUST_LOG is unset.
    pub fn filter_directive(&self) -> String {
        let mut filter = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter
    }
}

/// Keeps the log sink alive for the lifetime of the process.
pub struct TelemetryGuard {
    log_sink: Option<Arc<SqliteLogSink>>,
}

impl TelemetryGuard {
    /// Access the log sink for querying persisted logs.
    pub fn logs(&self) -> Option<&SqliteLogSink> {
        self.log_sink.as_deref()
    }

    /// Shared handle to the log sink, for serving persisted logs.
    pub fn log_sink(&self) -> Option<Arc<SqliteLogSink>> {
        self.log_sink.clone()
    }
}

/// Initialize the telemetry subsystem. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directive()));

    // JSON formatting layer for stdout
    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_target(true)
        .with_span_list(true)
        .with_filter(env_filter);

    // Optional SQLite log sink for warn+ logs
    let (sqlite_layer, sqlite_sink) = if config.log_to_sqlite {
        match SqliteLogSink::new(&config.log_db_path) {
            Ok(sink) => {
                if let Some(days) = config.log_retention_days {
                    apply_retention(&sink, days);
                }
                let sink = Arc::new(sink);
                (Some(SqliteLogLayer::new(sink.clone())), Some(sink))
            }
            Err(e) => {
                eprintln!("hail-telemetry: failed to open log DB: {e}");
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(sqlite_layer)
        .init();

    TelemetryGuard { log_sink: sqlite_sink }
}

/// Runs before the subscriber is installed, so failures go to stderr.
fn apply_retention(sink: &SqliteLogSink, days: u32) -> usize {
    match sink.prune_older_than(chrono::Duration::days(i64::from(days))) {
        Ok(pruned) => pruned,
        Err(e) => {
            eprintln!("hail-telemetry: failed to prune log DB: {e}");
            0
        }
    }
}

/// Fallback home dir for default paths.
fn dirs_fallback() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".hail")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_directive_includes_module_overrides() {
        let config = TelemetryConfig {
            log_level: Level::WARN,
            module_levels: vec![("hail_server::reaper".into(), Level::DEBUG)],
            log_to_sqlite: false,
            log_db_path: PathBuf::from("/tmp/unused.db"),
            log_retention_days: None,
        };
        assert_eq!(config.filter_directive(), "warn,hail_server::reaper=debug");
    }

    #[test]
    fn default_config_logs_to_sqlite_under_hail_dir() {
        let config = TelemetryConfig::default();
        assert!(config.log_to_sqlite);
        assert!(config.log_db_path.ends_with(".hail/database/logs.db"));
        assert_eq!(config.filter_directive(), "info");
        assert_eq!(config.log_retention_days, Some(7));
    }

    #[test]
    fn retention_drops_records_past_the_window() {
        let sink = SqliteLogSink::in_memory().unwrap();
        let stale = chrono::Utc::now() - chrono::Duration::days(10);
        for (ts, message) in [(stale.to_rfc3339(), "stale"), (chrono::Utc::now().to_rfc3339(), "fresh")] {
            sink.insert(&LogRecord {
                timestamp: ts,
                level: "WARN".into(),
                target: "hail_server".into(),
                message: message.into(),
                ..Default::default()
            });
        }

        assert_eq!(apply_retention(&sink, 7), 1);
        assert_eq!(apply_retention(&sink, 7), 0);
        assert_eq!(sink.count().unwrap(), 1);
    }
}
