use chrono::Utc;
use serde::Serialize;
use tracing::instrument;

use hail_core::{Identity, IdentityId, IdentityKind, PresenceProjection, PresenceStatus, SessionId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

const COLUMNS: &str = "id, kind, display_name, session_ref, status, last_active_at, presence_generation, created_at";

#[derive(Clone, Debug, Serialize)]
pub struct IdentityRow {
    pub identity: Identity,
    pub display_name: String,
    pub session_ref: Option<SessionId>,
    pub status: PresenceStatus,
    pub last_active_at: Option<String>,
    pub presence_generation: u64,
    pub created_at: String,
}

/// Result of a fenced presence write.
#[derive(Clone, Debug)]
pub enum PresenceWrite {
    Applied(IdentityRow),
    /// A write carrying a newer generation already landed; nothing changed.
    Superseded,
}

impl PresenceWrite {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

pub struct IdentityRepo {
    db: Database,
}

impl IdentityRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Register a new account with a freshly minted id.
    pub fn create(&self, kind: IdentityKind, display_name: &str) -> Result<IdentityRow, StoreError> {
        self.insert(&Identity::new(kind, IdentityId::new()), display_name)
    }

    /// Register an account under an id issued elsewhere.
    #[instrument(skip(self), fields(identity = %identity))]
    pub fn insert(&self, identity: &Identity, display_name: &str) -> Result<IdentityRow, StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO identities (id, kind, display_name, status, created_at)
                 VALUES (?1, ?2, ?3, 'offline', ?4)",
                rusqlite::params![identity.id.as_str(), identity.kind.as_str(), display_name, now],
            )?;
            Ok(IdentityRow {
                identity: identity.clone(),
                display_name: display_name.to_string(),
                session_ref: None,
                status: PresenceStatus::Offline,
                last_active_at: None,
                presence_generation: 0,
                created_at: now,
            })
        })
    }

    #[instrument(skip(self), fields(identity = %identity))]
    pub fn get(&self, identity: &Identity) -> Result<IdentityRow, StoreError> {
        self.db.with_conn(|conn| fetch(conn, identity))
    }

    /// Write a presence projection, fenced by `generation`.
    ///
    /// An online write applies only over an older generation. An offline
    /// write also applies over its own generation, so a session's disconnect
    /// can land after its own join but never after a newer session's join.
    #[instrument(skip(self, projection), fields(identity = %identity, status = %projection.status))]
    pub fn find_and_update_presence(
        &self,
        identity: &Identity,
        projection: &PresenceProjection,
        generation: u64,
    ) -> Result<PresenceWrite, StoreError> {
        let fence = match projection.status {
            PresenceStatus::Online => "presence_generation < ?6",
            PresenceStatus::Offline => "presence_generation <= ?6",
        };
        let sql = format!(
            "UPDATE identities
             SET session_ref = ?1, status = ?2, last_active_at = ?3, presence_generation = ?6
             WHERE kind = ?4 AND id = ?5 AND {fence}"
        );

        self.db.with_conn(|conn| {
            let changed = conn.execute(
                &sql,
                rusqlite::params![
                    projection.session_ref.as_ref().map(SessionId::as_str),
                    projection.status.to_string(),
                    projection.last_active_at.to_rfc3339(),
                    identity.kind.as_str(),
                    identity.id.as_str(),
                    generation as i64,
                ],
            )?;

            // Zero rows means either no such account or a newer write won.
            let row = fetch(conn, identity)?;
            if changed == 0 {
                Ok(PresenceWrite::Superseded)
            } else {
                Ok(PresenceWrite::Applied(row))
            }
        })
    }

    /// Mark every identity offline and clear its generation fence. Used at
    /// boot, when no session can be live.
    #[instrument(skip(self))]
    pub fn reset_presence(&self) -> Result<usize, StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE identities
                 SET session_ref = NULL, status = 'offline', last_active_at = ?1,
                     presence_generation = 0
                 WHERE status = 'online' OR presence_generation != 0",
                [now],
            )?;
            Ok(changed)
        })
    }

    /// Identities currently marked online, optionally filtered by kind.
    #[instrument(skip(self))]
    pub fn list_online(&self, kind: Option<IdentityKind>) -> Result<Vec<IdentityRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut results = Vec::new();
            match kind {
                Some(kind) => {
                    let sql = format!(
                        "SELECT {COLUMNS} FROM identities WHERE status = 'online' AND kind = ?1 ORDER BY id"
                    );
                    let mut stmt = conn.prepare(&sql)?;
                    let mut rows = stmt.query([kind.as_str()])?;
                    while let Some(row) = rows.next()? {
                        results.push(row_to_identity(row)?);
                    }
                }
                None => {
                    let sql =
                        format!("SELECT {COLUMNS} FROM identities WHERE status = 'online' ORDER BY kind, id");
                    let mut stmt = conn.prepare(&sql)?;
                    let mut rows = stmt.query([])?;
                    while let Some(row) = rows.next()? {
                        results.push(row_to_identity(row)?);
                    }
                }
            }
            Ok(results)
        })
    }
}

fn fetch(conn: &rusqlite::Connection, identity: &Identity) -> Result<IdentityRow, StoreError> {
    let sql = format!("SELECT {COLUMNS} FROM identities WHERE kind = ?1 AND id = ?2");
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([identity.kind.as_str(), identity.id.as_str()])?;
    match rows.next()? {
        Some(row) => row_to_identity(row),
        None => Err(StoreError::NotFound(identity.to_string())),
    }
}

fn row_to_identity(row: &rusqlite::Row<'_>) -> Result<IdentityRow, StoreError> {
    const TABLE: &str = "identities";
    let id: String = row_helpers::get(row, 0, TABLE, "id")?;
    let kind: String = row_helpers::get(row, 1, TABLE, "kind")?;
    let session_ref: Option<String> = row_helpers::get(row, 3, TABLE, "session_ref")?;
    let status: String = row_helpers::get(row, 4, TABLE, "status")?;
    let generation: i64 = row_helpers::get(row, 6, TABLE, "presence_generation")?;

    Ok(IdentityRow {
        identity: Identity::new(
            row_helpers::parse_enum(&kind, TABLE, "kind")?,
            IdentityId::from_raw(id),
        ),
        display_name: row_helpers::get(row, 2, TABLE, "display_name")?,
        session_ref: session_ref.map(SessionId::from_raw),
        status: row_helpers::parse_enum(&status, TABLE, "status")?,
        last_active_at: row_helpers::get(row, 5, TABLE, "last_active_at")?,
        presence_generation: generation.max(0) as u64,
        created_at: row_helpers::get(row, 7, TABLE, "created_at")?,
    })
}
