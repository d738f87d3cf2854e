use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use hail_server::{ReaperConfig, ServerConfig};
use hail_store::Database;
use hail_telemetry::TelemetryConfig;
use tracing::Level;

#[derive(Parser, Debug)]
#[command(name = "hail", about = "Rider and driver presence server")]
struct Cli {
    /// Host to bind.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to bind (0 for auto-assign).
    #[arg(long, default_value = "3000")]
    port: u16,

    /// Path to the `SQLite` identity database.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Browser origin allowed to call in with credentials.
    #[arg(long, env = "CLIENT_URL", default_value = "http://localhost:5173")]
    cors_origin: String,

    /// Seconds between server pings.
    #[arg(long, default_value = "25")]
    heartbeat_interval: u64,

    /// Seconds without a pong before a client is dropped.
    #[arg(long, default_value = "60")]
    heartbeat_timeout: u64,

    /// Seconds between reaper sweeps.
    #[arg(long, default_value = "60")]
    sweep_period: u64,

    /// Seconds a binding must age before the reaper may evict it.
    #[arg(long, default_value = "300")]
    stale_after: u64,

    /// Also mark reaped identities offline in the store.
    #[arg(long)]
    reaper_mark_offline: bool,

    /// Keep presence left over from the previous run instead of clearing it.
    #[arg(long)]
    keep_presence: bool,

    /// Default log level (RUST_LOG overrides).
    #[arg(long, default_value = "info")]
    log_level: Level,

    /// Days of persisted warn+ logs to keep (0 keeps everything).
    #[arg(long, default_value = "7")]
    log_retention_days: u32,
}

impl Cli {
    fn default_db_path() -> PathBuf {
        home_dir().join(".hail").join("database").join("hail.db")
    }

    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
            cors_origin: self.cors_origin.clone(),
            heartbeat_interval_secs: self.heartbeat_interval,
            heartbeat_timeout_secs: self.heartbeat_timeout,
            reset_presence_on_start: !self.keep_presence,
            reaper: ReaperConfig {
                sweep_period_secs: self.sweep_period,
                stale_after_secs: self.stale_after,
                mark_offline: self.reaper_mark_offline,
            },
            ..ServerConfig::default()
        }
    }

    fn telemetry_config(&self) -> TelemetryConfig {
        TelemetryConfig {
            log_level: self.log_level,
            log_retention_days: (self.log_retention_days > 0).then_some(self.log_retention_days),
            ..TelemetryConfig::default()
        }
    }
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let telemetry = hail_telemetry::init_telemetry(cli.telemetry_config());

    let db_path = cli.db_path.clone().unwrap_or_else(Cli::default_db_path);
    let db = Database::open(&db_path)
        .with_context(|| format!("Failed to open database: {}", db_path.display()))?;

    let handle = hail_server::start_with_telemetry(cli.server_config(), db, telemetry.log_sink())
        .await
        .context("Failed to start server")?;
    tracing::info!(port = handle.port, "Hail server ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl+c")?;

    handle.shutdown().await;
    Ok(())
}
