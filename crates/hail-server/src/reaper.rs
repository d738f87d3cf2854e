//! Periodic sweep that drops registry entries for sessions whose transport
//! vanished without a disconnect ever reaching the presence layer.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use hail_core::PresenceProjection;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ReaperConfig;
use crate::presence::PresenceStore;
use crate::registry::SessionRegistry;
use crate::transport::Transport;

pub struct Reaper {
    registry: Arc<SessionRegistry>,
    transport: Arc<dyn Transport>,
    store: Option<Arc<dyn PresenceStore>>,
    config: ReaperConfig,
}

impl Reaper {
    pub fn new(
        registry: Arc<SessionRegistry>,
        transport: Arc<dyn Transport>,
        config: ReaperConfig,
    ) -> Self {
        Self {
            registry,
            transport,
            store: None,
            config,
        }
    }

    /// Store used for offline writes when `mark_offline` is set.
    pub fn with_store(mut self, store: Arc<dyn PresenceStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub async fn sweep(&self) -> usize {
        self.sweep_at(Utc::now()).await
    }

    /// Evict every record older than the staleness threshold whose session
    /// no longer has a transport. Returns the number evicted.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let stale_after = self.config.stale_after();
        let mut evicted = 0;

        for record in self.registry.snapshot() {
            if record.age(now) <= stale_after || self.transport.exists(&record.session_id) {
                continue;
            }
            // Only the exact session we inspected; a fresh join in between wins.
            let Some(removed) = self
                .registry
                .remove_if_session(&record.identity, &record.session_id)
            else {
                continue;
            };
            evicted += 1;
            tracing::info!(
                session_id = %removed.session_id,
                identity = %removed.identity,
                "Evicted stale registry entry"
            );

            if !self.config.mark_offline {
                continue;
            }
            if let Some(store) = &self.store {
                let projection = PresenceProjection::offline(now);
                if let Err(e) = store
                    .write_presence(&removed.identity, &projection, removed.generation)
                    .await
                {
                    tracing::warn!(identity = %removed.identity, error = %e, "Reaper offline write failed");
                }
            }
        }
        evicted
    }

    /// Run sweeps every `sweep_period` until `cancel` fires.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.sweep_period());
            ticker.tick().await; // consume first immediate tick
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = self.sweep().await;
                        if evicted > 0 {
                            tracing::info!(evicted, "Reaper sweep");
                        }
                    }
                    () = cancel.cancelled() => {
                        tracing::debug!("Reaper stopped");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeTransport;
    use hail_core::{Identity, PresenceStatus, SessionId};
    use hail_store::{Database, IdentityRepo};
    use std::time::Duration;

    fn setup(config: ReaperConfig) -> (Reaper, Arc<SessionRegistry>, Arc<FakeTransport>) {
        let registry = Arc::new(SessionRegistry::new());
        let transport = Arc::new(FakeTransport::new());
        let reaper = Reaper::new(Arc::clone(&registry), transport.clone(), config);
        (reaper, registry, transport)
    }

    fn minutes_ago(n: i64) -> DateTime<Utc> {
        Utc::now() - chrono::Duration::minutes(n)
    }

    #[tokio::test]
    async fn evicts_old_record_with_absent_transport() {
        let (reaper, registry, _) = setup(ReaperConfig::default());
        let d1 = Identity::driver("D1");
        registry.bind(d1.clone(), SessionId::from_raw("gone"), minutes_ago(10));

        assert_eq!(reaper.sweep().await, 1);
        assert!(registry.get(&d1).is_none());
    }

    #[tokio::test]
    async fn keeps_record_with_live_transport() {
        let (reaper, registry, transport) = setup(ReaperConfig::default());
        let s1 = transport.connect("s1");
        registry.bind(Identity::driver("D1"), s1, minutes_ago(10));

        assert_eq!(reaper.sweep().await, 0);
        assert_eq!(registry.size(), 1);
    }

    #[tokio::test]
    async fn keeps_young_record_even_without_transport() {
        let (reaper, registry, _) = setup(ReaperConfig::default());
        registry.bind(Identity::rider("R1"), SessionId::from_raw("gone"), minutes_ago(1));

        assert_eq!(reaper.sweep().await, 0);
        assert_eq!(registry.size(), 1);
    }

    #[tokio::test]
    async fn unrepresentable_threshold_never_evicts() {
        let config = ReaperConfig {
            stale_after_secs: u64::MAX,
            ..Default::default()
        };
        let (reaper, registry, _) = setup(config);
        registry.bind(Identity::driver("D1"), SessionId::from_raw("gone"), minutes_ago(60 * 24 * 365));

        assert_eq!(reaper.sweep().await, 0);
        assert_eq!(registry.size(), 1);
    }

    #[tokio::test]
    async fn sweep_at_uses_given_clock() {
        let (reaper, registry, _) = setup(ReaperConfig::default());
        let bound_at = Utc::now();
        registry.bind(Identity::rider("R1"), SessionId::from_raw("gone"), bound_at);

        assert_eq!(reaper.sweep_at(bound_at + chrono::Duration::minutes(4)).await, 0);
        assert_eq!(reaper.sweep_at(bound_at + chrono::Duration::minutes(6)).await, 1);
    }

    #[tokio::test]
    async fn leaves_store_alone_by_default() {
        let db = Database::in_memory().unwrap();
        let repo = IdentityRepo::new(db.clone());
        let d1 = Identity::driver("D1");
        repo.insert(&d1, "Dana").unwrap();

        let (reaper, registry, _) = setup(ReaperConfig::default());
        let reaper = reaper.with_store(Arc::new(IdentityRepo::new(db)));
        let (record, _) = registry.bind(d1.clone(), SessionId::from_raw("gone"), minutes_ago(10));
        repo.find_and_update_presence(
            &d1,
            &PresenceProjection::online(record.session_id.clone(), record.bound_at),
            record.generation,
        )
        .unwrap();

        assert_eq!(reaper.sweep().await, 1);
        assert_eq!(repo.get(&d1).unwrap().status, PresenceStatus::Online);
    }

    #[tokio::test]
    async fn mark_offline_writes_fenced_projection() {
        let db = Database::in_memory().unwrap();
        let repo = IdentityRepo::new(db.clone());
        let d1 = Identity::driver("D1");
        repo.insert(&d1, "Dana").unwrap();

        let config = ReaperConfig {
            mark_offline: true,
            ..Default::default()
        };
        let (reaper, registry, _) = setup(config);
        let reaper = reaper.with_store(Arc::new(IdentityRepo::new(db)));
        let (record, _) = registry.bind(d1.clone(), SessionId::from_raw("gone"), minutes_ago(10));
        repo.find_and_update_presence(
            &d1,
            &PresenceProjection::online(record.session_id.clone(), record.bound_at),
            record.generation,
        )
        .unwrap();

        assert_eq!(reaper.sweep().await, 1);
        let row = repo.get(&d1).unwrap();
        assert_eq!(row.status, PresenceStatus::Offline);
        assert!(row.session_ref.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_task_sweeps_and_stops_on_cancel() {
        let config = ReaperConfig {
            sweep_period_secs: 60,
            ..Default::default()
        };
        let (reaper, registry, _) = setup(config);
        let d1 = Identity::driver("D1");
        registry.bind(d1.clone(), SessionId::from_raw("gone"), minutes_ago(10));

        let cancel = CancellationToken::new();
        let handle = Arc::new(reaper).spawn(cancel.clone());

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(registry.get(&d1).is_none());

        cancel.cancel();
        handle.await.unwrap();
    }
}
