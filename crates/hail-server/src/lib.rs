pub mod config;
pub mod connection;
pub mod delivery;
pub mod presence;
pub mod reaper;
pub mod registry;
pub mod rooms;
pub mod server;
#[cfg(test)]
mod testing;
pub mod transport;

pub use config::{ReaperConfig, ServerConfig};
pub use delivery::DeliveryGateway;
pub use presence::{DisconnectOutcome, PresenceStore, PresenceSynchronizer, Session};
pub use reaper::Reaper;
pub use registry::{ConnectionRecord, SessionRegistry};
pub use rooms::RoomRouter;
pub use server::{start, start_with_telemetry, ServerHandle};
pub use transport::Transport;
