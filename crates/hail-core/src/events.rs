//! Wire frames exchanged with connected clients.
//!
//! Every WebSocket text message is one JSON [`Frame`]: either a named event
//! (optionally carrying an `ackId` the receiver must echo back), or an
//! acknowledgment answering a previously received `ackId`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::PresenceError;
use crate::ids::SessionId;

pub const JOIN: &str = "join";
pub const JOINED: &str = "joined";
pub const ERROR: &str = "error";

pub const JOIN_ERROR: &str = "JOIN_ERROR";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Frame {
    Ack {
        ack: u64,
        #[serde(default)]
        data: Value,
    },
    Event {
        event: String,
        #[serde(default)]
        data: Value,
        #[serde(rename = "ackId", default, skip_serializing_if = "Option::is_none")]
        ack_id: Option<u64>,
    },
}

impl Frame {
    pub fn event(name: impl Into<String>, data: Value) -> Self {
        Self::Event {
            event: name.into(),
            data,
            ack_id: None,
        }
    }

    pub fn to_json(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }
}

/// An addressed event on its way to a client.
#[derive(Clone, Debug, PartialEq)]
pub struct OutboundEvent {
    pub name: String,
    pub data: Value,
}

impl OutboundEvent {
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }

    pub fn into_frame(self, ack_id: Option<u64>) -> Frame {
        Frame::Event {
            event: self.name,
            data: self.data,
            ack_id,
        }
    }
}

/// Inbound `join` payload. Fields stay raw so that validation, not
/// deserialization, decides what is malformed.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinPayload {
    #[serde(default, alias = "userId")]
    pub identity_id: Option<String>,
    #[serde(default, alias = "userType")]
    pub identity_kind: Option<String>,
}

/// Outbound `joined` acknowledgment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Joined {
    pub success: bool,
    pub message: String,
    pub session_id: SessionId,
}

impl Joined {
    pub fn into_event(self) -> OutboundEvent {
        OutboundEvent::new(JOINED, serde_json::to_value(self).unwrap_or_default())
    }
}

/// Outbound `error` event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

impl ErrorEvent {
    pub fn join(err: &PresenceError) -> Self {
        Self {
            kind: JOIN_ERROR.into(),
            message: err.to_string(),
        }
    }

    pub fn into_event(self) -> OutboundEvent {
        OutboundEvent::new(ERROR, serde_json::to_value(self).unwrap_or_default())
    }
}

/// Whether an acknowledgment reply is positive: `{"success": true, ...}`.
pub fn is_positive_ack(reply: &Value) -> bool {
    reply.get("success").and_then(Value::as_bool).unwrap_or(false)
}
