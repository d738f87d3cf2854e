//! Identity model and the presence projection this service owns.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::PresenceError;
use crate::ids::{IdentityId, SessionId};

/// The two account types that can hold a live session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityKind {
    #[serde(alias = "user")]
    Rider,
    #[serde(alias = "captain")]
    Driver,
}

impl IdentityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rider => "rider",
            Self::Driver => "driver",
        }
    }
}

impl fmt::Display for IdentityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IdentityKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rider" | "user" => Ok(Self::Rider),
            "driver" | "captain" => Ok(Self::Driver),
            other => Err(format!("unknown identity kind: {other}")),
        }
    }
}

/// A rider or driver account. Outlives any session bound to it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub kind: IdentityKind,
    pub id: IdentityId,
}

impl Identity {
    pub fn new(kind: IdentityKind, id: IdentityId) -> Self {
        Self { kind, id }
    }

    pub fn rider(id: impl Into<String>) -> Self {
        Self::new(IdentityKind::Rider, IdentityId::from_raw(id))
    }

    pub fn driver(id: impl Into<String>) -> Self {
        Self::new(IdentityKind::Driver, IdentityId::from_raw(id))
    }

    /// Validate raw join fields. Both must be present and non-blank, and the
    /// kind must name a rider or a driver.
    pub fn parse(raw_id: Option<&str>, raw_kind: Option<&str>) -> Result<Self, PresenceError> {
        let id = raw_id
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| PresenceError::Validation("identity id is required".into()))?;
        let kind = raw_kind
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| PresenceError::Validation("identity kind is required".into()))?
            .parse::<IdentityKind>()
            .map_err(PresenceError::Validation)?;
        Ok(Self::new(kind, IdentityId::from_raw(id)))
    }

    /// The channel every session bound to this identity belongs to.
    pub fn channel(&self) -> Channel {
        Channel {
            kind: self.kind,
            id: self.id.clone(),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Identity-scoped routing channel, rendered as `kind:id`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Channel {
    pub kind: IdentityKind,
    pub id: IdentityId,
}

impl Channel {
    pub fn identity(&self) -> Identity {
        Identity::new(self.kind, self.id.clone())
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

impl FromStr for Channel {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| format!("malformed channel: {s}"))?;
        if id.is_empty() {
            return Err(format!("malformed channel: {s}"));
        }
        Ok(Self {
            kind: kind.parse()?,
            id: IdentityId::from_raw(id),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Offline,
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

impl FromStr for PresenceStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(Self::Online),
            "offline" => Ok(Self::Offline),
            other => Err(format!("unknown presence status: {other}")),
        }
    }
}

/// The slice of identity state written on join and disconnect.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceProjection {
    pub session_ref: Option<SessionId>,
    pub status: PresenceStatus,
    pub last_active_at: DateTime<Utc>,
}

impl PresenceProjection {
    pub fn online(session_id: SessionId, at: DateTime<Utc>) -> Self {
        Self {
            session_ref: Some(session_id),
            status: PresenceStatus::Online,
            last_active_at: at,
        }
    }

    pub fn offline(at: DateTime<Utc>) -> Self {
        Self {
            session_ref: None,
            status: PresenceStatus::Offline,
            last_active_at: at,
        }
    }
}
