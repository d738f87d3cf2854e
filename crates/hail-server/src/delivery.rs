//! Acknowledged point-to-point delivery.
//!
//! Unlike [`RoomRouter`](crate::rooms::RoomRouter) broadcasts, a send here
//! only succeeds once the client has confirmed the specific event.

use std::sync::Arc;
use std::time::Duration;

use hail_core::events::{is_positive_ack, OutboundEvent};
use hail_core::{DeliveryError, Identity, SessionId};
use serde_json::Value;
use tracing::instrument;

use crate::registry::SessionRegistry;
use crate::transport::Transport;

pub struct DeliveryGateway {
    transport: Arc<dyn Transport>,
    registry: Arc<SessionRegistry>,
    ack_timeout: Duration,
}

impl DeliveryGateway {
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<SessionRegistry>,
        ack_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            registry,
            ack_timeout,
        }
    }

    /// Send `event` to `session_id` and wait for a positive acknowledgment.
    ///
    /// Dropping the returned future releases the pending acknowledgment.
    #[instrument(skip(self, event), fields(session_id = %session_id, event = %event.name))]
    pub async fn send(&self, session_id: &SessionId, event: OutboundEvent) -> Result<Value, DeliveryError> {
        let name = event.name.clone();
        let ack = self.transport.emit_with_ack(session_id, event)?;

        let reply = match tokio::time::timeout(self.ack_timeout, ack).await {
            Ok(Ok(reply)) => reply,
            // The transport closed and dropped the waiter.
            Ok(Err(_)) => return Err(DeliveryError::NotConnected(session_id.clone())),
            Err(_) => {
                tracing::warn!(timeout = ?self.ack_timeout, "Delivery timed out");
                return Err(DeliveryError::Timeout(self.ack_timeout));
            }
        };

        if is_positive_ack(&reply) {
            Ok(reply)
        } else {
            Err(DeliveryError::NotAcknowledged {
                session_id: session_id.clone(),
                event: name,
                reply,
            })
        }
    }

    /// [`send`](Self::send) to whichever session currently holds `identity`.
    pub async fn send_to_identity(
        &self,
        identity: &Identity,
        event: OutboundEvent,
    ) -> Result<Value, DeliveryError> {
        match self.registry.get(identity) {
            Some(record) => self.send(&record.session_id, event).await,
            None => Err(DeliveryError::Unbound(identity.clone())),
        }
    }
}
