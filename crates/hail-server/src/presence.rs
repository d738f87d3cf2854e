//! Join and disconnect handling.
//!
//! A join swaps the identity's registry entry, drops whichever session it
//! evicted, and persists the online projection. A disconnect only writes
//! the offline projection while the session is still the identity's
//! current one. Both store writes carry the registry generation, so writes
//! arriving out of order can never regress the durable projection.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hail_core::events::{ErrorEvent, JoinPayload, Joined};
use hail_core::{Channel, Identity, PresenceError, PresenceProjection, SessionId};
use hail_store::{IdentityRepo, PresenceWrite, StoreError};
use tracing::instrument;

use crate::registry::SessionRegistry;
use crate::transport::Transport;

/// The durable side of presence: one fenced write per join or disconnect.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    async fn write_presence(
        &self,
        identity: &Identity,
        projection: &PresenceProjection,
        generation: u64,
    ) -> Result<PresenceWrite, StoreError>;
}

#[async_trait]
impl PresenceStore for IdentityRepo {
    async fn write_presence(
        &self,
        identity: &Identity,
        projection: &PresenceProjection,
        generation: u64,
    ) -> Result<PresenceWrite, StoreError> {
        self.find_and_update_presence(identity, projection, generation)
    }
}

/// One transport connection as the presence layer sees it.
#[derive(Clone, Debug)]
pub struct Session {
    pub session_id: SessionId,
    pub opened_at: DateTime<Utc>,
    bound: Option<Identity>,
}

impl Session {
    pub fn new(session_id: SessionId, opened_at: DateTime<Utc>) -> Self {
        Self {
            session_id,
            opened_at,
            bound: None,
        }
    }

    pub fn bound(&self) -> Option<&Identity> {
        self.bound.as_ref()
    }

    /// The channel this session is a member of, if any.
    pub fn channel(&self) -> Option<Channel> {
        self.bound.as_ref().map(Identity::channel)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisconnectOutcome {
    /// The session never joined.
    Unbound,
    /// A newer session already owns the identity; nothing was touched.
    Stale,
    /// The registry entry was removed. `persisted` is false when a newer
    /// write had already reached the store.
    Released { persisted: bool },
}

pub struct PresenceSynchronizer {
    registry: Arc<SessionRegistry>,
    transport: Arc<dyn Transport>,
    store: Arc<dyn PresenceStore>,
}

impl PresenceSynchronizer {
    pub fn new(
        registry: Arc<SessionRegistry>,
        transport: Arc<dyn Transport>,
        store: Arc<dyn PresenceStore>,
    ) -> Self {
        Self {
            registry,
            transport,
            store,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Handle an inbound `join` event and answer the session with either
    /// `joined` or a `JOIN_ERROR`.
    pub async fn handle_join(
        &self,
        session: &mut Session,
        payload: &JoinPayload,
    ) -> Result<Joined, PresenceError> {
        let result = match Identity::parse(
            payload.identity_id.as_deref(),
            payload.identity_kind.as_deref(),
        ) {
            Ok(identity) => self.join(session, identity).await,
            Err(e) => Err(e),
        };

        let reply = match &result {
            Ok(joined) => joined.clone().into_event(),
            Err(e) => {
                tracing::warn!(
                    session_id = %session.session_id,
                    error_kind = e.error_kind(),
                    error = %e,
                    "Join rejected"
                );
                ErrorEvent::join(e).into_event()
            }
        };
        self.transport.emit(&session.session_id, reply);
        result
    }

    /// Bind `session` to `identity`, superseding any other session that
    /// holds it.
    #[instrument(skip(self, session), fields(session_id = %session.session_id, identity_id = %identity.id, kind = %identity.kind))]
    pub async fn join(&self, session: &mut Session, identity: Identity) -> Result<Joined, PresenceError> {
        if session.bound.as_ref().is_some_and(|prev| *prev != identity) {
            if let Err(e) = self.disconnect(session).await {
                tracing::warn!(error = %e, "Failed to release previous identity");
            }
        }

        let now = Utc::now();
        let (record, evicted) =
            self.registry
                .bind(identity.clone(), session.session_id.clone(), now);

        if let Some(old) = evicted.as_ref().filter(|old| old.session_id != session.session_id) {
            let terminated = self.transport.terminate(&old.session_id).await;
            tracing::info!(superseded = %old.session_id, terminated, "Superseded previous session");
        }

        let projection = PresenceProjection::online(session.session_id.clone(), now);
        match self
            .store
            .write_presence(&identity, &projection, record.generation)
            .await
        {
            Ok(PresenceWrite::Applied(_)) => {}
            Ok(PresenceWrite::Superseded) => {
                tracing::debug!(generation = record.generation, "Newer presence already persisted");
            }
            Err(e) => {
                let restored = self.registry.restore(&identity, &record, evicted);
                tracing::warn!(error = %e, restored, "Presence write failed, rolled back registry");
                return Err(to_presence_error(&identity, e));
            }
        }

        session.bound = Some(identity.clone());
        tracing::info!("Session joined");

        Ok(Joined {
            success: true,
            message: format!("Successfully connected as {}", identity.kind),
            session_id: session.session_id.clone(),
        })
    }

    /// Release whatever `session` is bound to. A session that was already
    /// superseded leaves the registry and store untouched.
    ///
    /// A store failure still removes the registry entry and is returned as
    /// [`PresenceError::Persistence`].
    #[instrument(skip(self, session), fields(session_id = %session.session_id))]
    pub async fn disconnect(&self, session: &mut Session) -> Result<DisconnectOutcome, PresenceError> {
        let Some(identity) = session.bound.take() else {
            return Ok(DisconnectOutcome::Unbound);
        };

        let Some(record) = self
            .registry
            .get(&identity)
            .filter(|r| r.session_id == session.session_id)
        else {
            tracing::debug!(identity = %identity, "Stale disconnect ignored");
            return Ok(DisconnectOutcome::Stale);
        };

        let written = self
            .store
            .write_presence(&identity, &PresenceProjection::offline(Utc::now()), record.generation)
            .await;
        self.registry.remove_if_session(&identity, &session.session_id);

        match written {
            Ok(write) => {
                tracing::info!(identity = %identity, "Session released");
                Ok(DisconnectOutcome::Released {
                    persisted: write.is_applied(),
                })
            }
            Err(e) => {
                tracing::warn!(identity = %identity, error = %e, "Offline write failed");
                Err(to_presence_error(&identity, e))
            }
        }
    }
}

fn to_presence_error(identity: &Identity, e: StoreError) -> PresenceError {
    if e.is_not_found() {
        PresenceError::NotFound {
            kind: identity.kind,
            id: identity.id.clone(),
        }
    } else {
        PresenceError::Persistence(e.to_string())
    }
}
