//! The capability presence code holds over live sessions.
//!
//! Nothing outside the transport inspects a session beyond these
//! operations: whether it exists, ending it, and emitting events to it.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use hail_core::events::OutboundEvent;
use hail_core::{DeliveryError, SessionId};
use serde_json::Value;
use tokio::sync::oneshot;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Whether a live transport is currently attached to `session_id`.
    fn exists(&self, session_id: &SessionId) -> bool;

    /// Forcibly close a session. Returns `false` if it was already gone.
    async fn terminate(&self, session_id: &SessionId) -> bool;

    /// Fire-and-forget emit. Returns whether the frame was queued.
    fn emit(&self, session_id: &SessionId, event: OutboundEvent) -> bool;

    /// Emit an event that the client must acknowledge.
    fn emit_with_ack(
        &self,
        session_id: &SessionId,
        event: OutboundEvent,
    ) -> Result<AckReceiver, DeliveryError>;
}

/// Resolves with the client's acknowledgment reply.
///
/// Errors if the session closes first. Dropping the receiver (for example
/// when a timeout fires) releases the slot the transport registered for it.
pub struct AckReceiver {
    rx: oneshot::Receiver<Value>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl AckReceiver {
    pub fn new(rx: oneshot::Receiver<Value>, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            rx,
            release: Some(Box::new(release)),
        }
    }
}

impl Future for AckReceiver {
    type Output = Result<Value, oneshot::error::RecvError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx).poll(cx)
    }
}

impl Drop for AckReceiver {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}
