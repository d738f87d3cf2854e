//! Server configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the presence server.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind (default `"0.0.0.0"`).
    pub host: String,
    /// Port to bind (`0` auto-assigns).
    pub port: u16,
    /// The single browser origin allowed to call in with credentials.
    pub cors_origin: String,
    /// How often the server pings each client.
    pub heartbeat_interval_secs: u64,
    /// Close a client that has not answered a ping for this long.
    pub heartbeat_timeout_secs: u64,
    /// Outbound frames buffered per client before sends are dropped.
    pub max_send_queue: usize,
    /// Bound on how long an acknowledged send waits for its reply.
    pub ack_timeout_secs: u64,
    /// Mark every identity offline at startup, when no session can be live.
    pub reset_presence_on_start: bool,
    pub reaper: ReaperConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 3000,
            cors_origin: "http://localhost:5173".into(),
            heartbeat_interval_secs: 25,
            heartbeat_timeout_secs: 60,
            max_send_queue: 256,
            ack_timeout_secs: 10,
            reset_presence_on_start: true,
            reaper: ReaperConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn heartbeat(&self) -> Heartbeat {
        Heartbeat {
            interval: Duration::from_secs(self.heartbeat_interval_secs.max(1)),
            timeout: Duration::from_secs(self.heartbeat_timeout_secs.max(1)),
        }
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }
}

/// Ping cadence and liveness window for one connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Heartbeat {
    pub interval: Duration,
    pub timeout: Duration,
}

/// Stale-session sweep settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    pub sweep_period_secs: u64,
    /// Records bound for less than this are never swept.
    pub stale_after_secs: u64,
    /// Also write an offline projection for every evicted record.
    pub mark_offline: bool,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            sweep_period_secs: 60,
            stale_after_secs: 5 * 60,
            mark_offline: false,
        }
    }
}

impl ReaperConfig {
    pub fn sweep_period(&self) -> Duration {
        Duration::from_secs(self.sweep_period_secs.max(1))
    }

    /// Saturates at `chrono::Duration::MAX` for thresholds chrono cannot
    /// represent, which effectively disables eviction.
    pub fn stale_after(&self) -> chrono::Duration {
        i64::try_from(self.stale_after_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX)
    }
}
