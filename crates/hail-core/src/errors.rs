use std::time::Duration;

use crate::identity::{Identity, IdentityKind};
use crate::ids::{IdentityId, SessionId};

/// Failures of the join/disconnect path.
#[derive(Clone, Debug, thiserror::Error)]
pub enum PresenceError {
    /// Malformed join payload. Nothing was mutated.
    #[error("invalid join data: {0}")]
    Validation(String),
    /// The identity store has no such account. The registry was rolled back.
    #[error("{kind} {id} not found")]
    NotFound { kind: IdentityKind, id: IdentityId },
    /// The identity store rejected or failed the presence write.
    #[error("presence write failed: {0}")]
    Persistence(String),
}

impl PresenceError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::NotFound { .. } => "not_found",
            Self::Persistence(_) => "persistence_failure",
        }
    }
}

/// Outcomes of an acknowledged point-to-point send.
#[derive(Clone, Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("session {0} is not connected")]
    NotConnected(SessionId),
    /// No session is bound to the identity.
    #[error("{0} has no live session")]
    Unbound(Identity),
    #[error("session {session_id} did not acknowledge {event}")]
    NotAcknowledged {
        session_id: SessionId,
        event: String,
        reply: serde_json::Value,
    },
    #[error("no acknowledgment within {0:?}")]
    Timeout(Duration),
}

impl DeliveryError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::NotConnected(_) => "not_connected",
            Self::Unbound(_) => "unbound",
            Self::NotAcknowledged { .. } => "not_acknowledged",
            Self::Timeout(_) => "timeout",
        }
    }
}
