//! Fire-and-forget fan-out to identity channels.
//!
//! Channel membership is read from the registry on every call; the router
//! keeps no state of its own.

use std::sync::Arc;

use hail_core::events::OutboundEvent;
use hail_core::{Channel, IdentityId, IdentityKind, SessionId};

use crate::registry::SessionRegistry;
use crate::transport::Transport;

pub struct RoomRouter {
    registry: Arc<SessionRegistry>,
    transport: Arc<dyn Transport>,
}

impl RoomRouter {
    pub fn new(registry: Arc<SessionRegistry>, transport: Arc<dyn Transport>) -> Self {
        Self {
            registry,
            transport,
        }
    }

    /// Live sessions in `channel`. A record whose transport is already gone
    /// is skipped.
    pub fn members(&self, channel: &Channel) -> Vec<SessionId> {
        self.registry
            .get(&channel.identity())
            .map(|record| record.session_id)
            .filter(|session_id| self.transport.exists(session_id))
            .into_iter()
            .collect()
    }

    /// Send `event` to every session of `kind:id`. Returns how many sessions
    /// the event was queued for.
    pub fn broadcast(&self, kind: IdentityKind, id: &IdentityId, event: OutboundEvent) -> usize {
        self.broadcast_to(&Channel { kind, id: id.clone() }, event)
    }

    pub fn broadcast_to(&self, channel: &Channel, event: OutboundEvent) -> usize {
        let members = self.members(channel);
        let mut reached = 0;
        for session_id in &members {
            if self.transport.emit(session_id, event.clone()) {
                reached += 1;
            }
        }
        tracing::debug!(channel = %channel, event = %event.name, reached, "Broadcast");
        reached
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeTransport;
    use chrono::Utc;
    use hail_core::Identity;
    use serde_json::json;

    fn setup() -> (RoomRouter, Arc<SessionRegistry>, Arc<FakeTransport>) {
        let registry = Arc::new(SessionRegistry::new());
        let transport = Arc::new(FakeTransport::new());
        let router = RoomRouter::new(Arc::clone(&registry), transport.clone());
        (router, registry, transport)
    }

    #[test]
    fn broadcast_reaches_bound_session() {
        let (router, registry, transport) = setup();
        let s1 = transport.connect("s1");
        registry.bind(Identity::driver("D1"), s1.clone(), Utc::now());

        let reached = router.broadcast(
            IdentityKind::Driver,
            &IdentityId::from_raw("D1"),
            OutboundEvent::new("new-ride", json!({"rideId": "r1"})),
        );
        assert_eq!(reached, 1);
        let sent = transport.emitted_to(&s1);
        assert_eq!(sent[0].name, "new-ride");
        assert_eq!(sent[0].data["rideId"], "r1");
    }

    #[test]
    fn broadcast_to_empty_channel() {
        let (router, _, _) = setup();
        let channel: Channel = "rider:R9".parse().unwrap();
        assert_eq!(router.broadcast_to(&channel, OutboundEvent::new("x", json!(null))), 0);
        assert!(router.members(&channel).is_empty());
    }

    #[test]
    fn membership_follows_registry() {
        let (router, registry, transport) = setup();
        let channel: Channel = "driver:D1".parse().unwrap();
        let s1 = transport.connect("s1");
        let s2 = transport.connect("s2");

        registry.bind(Identity::driver("D1"), s1.clone(), Utc::now());
        assert_eq!(router.members(&channel), vec![s1]);

        registry.bind(Identity::driver("D1"), s2.clone(), Utc::now());
        assert_eq!(router.members(&channel), vec![s2.clone()]);

        registry.remove_if_session(&Identity::driver("D1"), &s2);
        assert!(router.members(&channel).is_empty());
    }

    #[test]
    fn dead_transport_is_not_a_member() {
        let (router, registry, transport) = setup();
        let s1 = transport.connect("s1");
        registry.bind(Identity::rider("R1"), s1.clone(), Utc::now());
        transport.drop_silently(&s1);

        let channel = Identity::rider("R1").channel();
        assert!(router.members(&channel).is_empty());
        assert_eq!(router.broadcast_to(&channel, OutboundEvent::new("x", json!(null))), 0);
    }

    #[test]
    fn other_kind_same_id_is_separate_channel() {
        let (router, registry, transport) = setup();
        let s1 = transport.connect("s1");
        registry.bind(Identity::driver("42"), s1, Utc::now());

        assert_eq!(
            router.broadcast(IdentityKind::Rider, &IdentityId::from_raw("42"), OutboundEvent::new("x", json!(null))),
            0
        );
    }
}
