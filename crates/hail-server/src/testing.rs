//! In-process transport double for unit tests.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use hail_core::events::OutboundEvent;
use hail_core::{DeliveryError, SessionId};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::transport::{AckReceiver, Transport};

#[derive(Default)]
pub struct FakeTransport {
    live: Mutex<HashSet<SessionId>>,
    terminated: Mutex<Vec<SessionId>>,
    emitted: Mutex<Vec<(SessionId, OutboundEvent)>>,
    pending: Mutex<HashMap<SessionId, oneshot::Sender<Value>>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, session: &str) -> SessionId {
        let id = SessionId::from_raw(session);
        self.live.lock().insert(id.clone());
        id
    }

    pub fn drop_silently(&self, session: &SessionId) {
        self.live.lock().remove(session);
    }

    pub fn terminated(&self) -> Vec<SessionId> {
        self.terminated.lock().clone()
    }

    pub fn emitted_to(&self, session: &SessionId) -> Vec<OutboundEvent> {
        self.emitted
            .lock()
            .iter()
            .filter(|(s, _)| s == session)
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Answer the outstanding acknowledged send to `session`.
    pub fn reply(&self, session: &SessionId, reply: Value) -> bool {
        match self.pending.lock().remove(session) {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    fn exists(&self, session_id: &SessionId) -> bool {
        self.live.lock().contains(session_id)
    }

    async fn terminate(&self, session_id: &SessionId) -> bool {
        let removed = self.live.lock().remove(session_id);
        if removed {
            self.terminated.lock().push(session_id.clone());
            self.pending.lock().remove(session_id);
        }
        removed
    }

    fn emit(&self, session_id: &SessionId, event: OutboundEvent) -> bool {
        if !self.exists(session_id) {
            return false;
        }
        self.emitted.lock().push((session_id.clone(), event));
        true
    }

    fn emit_with_ack(
        &self,
        session_id: &SessionId,
        event: OutboundEvent,
    ) -> Result<AckReceiver, DeliveryError> {
        if !self.emit(session_id, event) {
            return Err(DeliveryError::NotConnected(session_id.clone()));
        }
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(session_id.clone(), tx);
        Ok(AckReceiver::new(rx, || {}))
    }
}
