//! In-memory map from identity to its one live session.
//!
//! Every mutation is a per-key atomic operation on the underlying
//! [`DashMap`] shard, so operations on different identities never contend
//! and operations on the same identity are linearizable. Nothing here does
//! I/O.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use hail_core::{Identity, SessionId};
use serde::Serialize;

/// The binding between an identity and the session currently serving it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRecord {
    pub session_id: SessionId,
    pub identity: Identity,
    pub bound_at: DateTime<Utc>,
    /// Fencing token for durable writes made on behalf of this binding.
    pub generation: u64,
}

impl ConnectionRecord {
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.bound_at
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    records: DashMap<Identity, ConnectionRecord>,
    last_generation: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, identity: &Identity) -> Option<ConnectionRecord> {
        self.records.get(identity).map(|r| r.value().clone())
    }

    /// Swap in `record`, returning whatever it replaced.
    pub fn put(&self, identity: Identity, record: ConnectionRecord) -> Option<ConnectionRecord> {
        self.records.insert(identity, record)
    }

    /// Bind `session_id` to `identity`, returning the new record and the one
    /// it evicted.
    ///
    /// The generation is drawn while the entry is held, so for any one
    /// identity registry order and generation order agree.
    pub fn bind(
        &self,
        identity: Identity,
        session_id: SessionId,
        bound_at: DateTime<Utc>,
    ) -> (ConnectionRecord, Option<ConnectionRecord>) {
        let entry = self.records.entry(identity.clone());
        let record = ConnectionRecord {
            session_id,
            identity,
            bound_at,
            generation: self.next_generation(),
        };
        match entry {
            Entry::Occupied(mut occupied) => {
                let evicted = occupied.insert(record.clone());
                (record, Some(evicted))
            }
            Entry::Vacant(vacant) => {
                vacant.insert(record.clone());
                (record, None)
            }
        }
    }

    pub fn remove(&self, identity: &Identity) -> Option<ConnectionRecord> {
        self.records.remove(identity).map(|(_, r)| r)
    }

    /// Remove the entry only while it still belongs to `session_id`.
    pub fn remove_if_session(
        &self,
        identity: &Identity,
        session_id: &SessionId,
    ) -> Option<ConnectionRecord> {
        self.records
            .remove_if(identity, |_, r| &r.session_id == session_id)
            .map(|(_, r)| r)
    }

    /// Undo a [`bind`](Self::bind): put `evicted` back (or clear the entry)
    /// if the entry is still exactly `ours`. Returns `false` when a later
    /// bind already replaced it, in which case nothing changes.
    pub fn restore(
        &self,
        identity: &Identity,
        ours: &ConnectionRecord,
        evicted: Option<ConnectionRecord>,
    ) -> bool {
        match self.records.entry(identity.clone()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                if current.session_id != ours.session_id || current.generation != ours.generation {
                    return false;
                }
                match evicted {
                    Some(previous) => {
                        occupied.insert(previous);
                    }
                    None => {
                        occupied.remove();
                    }
                }
                true
            }
            Entry::Vacant(_) => false,
        }
    }

    pub fn size(&self) -> usize {
        self.records.len()
    }

    /// Point-in-time copy of every record. Each entry is read under its own
    /// shard lock; no lock is held across the whole copy.
    pub fn snapshot(&self) -> Vec<ConnectionRecord> {
        self.records.iter().map(|r| r.value().clone()).collect()
    }

    /// Next fencing token: wall-clock microseconds, bumped past the last
    /// token handed out so it stays strictly increasing even if the clock
    /// steps back. Tokens from a restarted process still order after the
    /// previous run's as long as the clock did not regress across restarts.
    pub fn next_generation(&self) -> u64 {
        let now = u64::try_from(Utc::now().timestamp_micros()).unwrap_or(0);
        let prev = self
            .last_generation
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |prev| {
                Some(now.max(prev + 1))
            })
            .unwrap_or_else(|prev| prev);
        now.max(prev + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn record(session: &str, identity: &Identity, generation: u64) -> ConnectionRecord {
        ConnectionRecord {
            session_id: SessionId::from_raw(session),
            identity: identity.clone(),
            bound_at: Utc::now(),
            generation,
        }
    }

    #[test]
    fn get_put_remove() {
        let reg = SessionRegistry::new();
        let d1 = Identity::driver("D1");
        assert!(reg.get(&d1).is_none());

        assert!(reg.put(d1.clone(), record("s1", &d1, 1)).is_none());
        let prev = reg.put(d1.clone(), record("s2", &d1, 2)).unwrap();
        assert_eq!(prev.session_id.as_str(), "s1");
        assert_eq!(reg.get(&d1).unwrap().session_id.as_str(), "s2");
        assert_eq!(reg.size(), 1);

        assert!(reg.remove(&d1).is_some());
        assert!(reg.remove(&d1).is_none());
        assert_eq!(reg.size(), 0);
    }

    #[test]
    fn same_id_different_kind_are_distinct() {
        let reg = SessionRegistry::new();
        reg.bind(Identity::driver("42"), SessionId::from_raw("s1"), Utc::now());
        reg.bind(Identity::rider("42"), SessionId::from_raw("s2"), Utc::now());
        assert_eq!(reg.size(), 2);
    }

    #[test]
    fn bind_reports_eviction() {
        let reg = SessionRegistry::new();
        let d1 = Identity::driver("D1");

        let (first, evicted) = reg.bind(d1.clone(), SessionId::from_raw("s1"), Utc::now());
        assert!(evicted.is_none());

        let (second, evicted) = reg.bind(d1.clone(), SessionId::from_raw("s2"), Utc::now());
        assert_eq!(evicted.unwrap(), first);
        assert!(second.generation > first.generation);
        assert_eq!(reg.get(&d1).unwrap(), second);
    }

    #[test]
    fn remove_if_session_ignores_stale_session() {
        let reg = SessionRegistry::new();
        let d1 = Identity::driver("D1");
        reg.bind(d1.clone(), SessionId::from_raw("s1"), Utc::now());
        reg.bind(d1.clone(), SessionId::from_raw("s2"), Utc::now());

        assert!(reg.remove_if_session(&d1, &SessionId::from_raw("s1")).is_none());
        assert_eq!(reg.get(&d1).unwrap().session_id.as_str(), "s2");

        assert!(reg.remove_if_session(&d1, &SessionId::from_raw("s2")).is_some());
        assert!(reg.get(&d1).is_none());
    }

    #[test]
    fn restore_puts_evicted_back() {
        let reg = SessionRegistry::new();
        let d1 = Identity::driver("D1");
        let (old, _) = reg.bind(d1.clone(), SessionId::from_raw("s1"), Utc::now());
        let (ours, evicted) = reg.bind(d1.clone(), SessionId::from_raw("s2"), Utc::now());

        assert!(reg.restore(&d1, &ours, evicted));
        assert_eq!(reg.get(&d1).unwrap(), old);
    }

    #[test]
    fn restore_without_evicted_clears_entry() {
        let reg = SessionRegistry::new();
        let d1 = Identity::driver("D1");
        let (ours, evicted) = reg.bind(d1.clone(), SessionId::from_raw("s1"), Utc::now());

        assert!(reg.restore(&d1, &ours, evicted));
        assert!(reg.get(&d1).is_none());
        assert_eq!(reg.size(), 0);
    }

    #[test]
    fn restore_leaves_newer_binding_alone() {
        let reg = SessionRegistry::new();
        let d1 = Identity::driver("D1");
        let (ours, evicted) = reg.bind(d1.clone(), SessionId::from_raw("s1"), Utc::now());
        let (newer, _) = reg.bind(d1.clone(), SessionId::from_raw("s2"), Utc::now());

        assert!(!reg.restore(&d1, &ours, evicted));
        assert_eq!(reg.get(&d1).unwrap(), newer);
    }

    #[test]
    fn restore_same_session_rebind_checks_generation() {
        let reg = SessionRegistry::new();
        let d1 = Identity::driver("D1");
        let (ours, evicted) = reg.bind(d1.clone(), SessionId::from_raw("s1"), Utc::now());
        let (newer, _) = reg.bind(d1.clone(), SessionId::from_raw("s1"), Utc::now());

        assert!(!reg.restore(&d1, &ours, evicted));
        assert_eq!(reg.get(&d1).unwrap(), newer);
    }

    #[test]
    fn generations_strictly_increase() {
        let reg = SessionRegistry::new();
        let mut last = 0;
        for _ in 0..1000 {
            let g = reg.next_generation();
            assert!(g > last);
            last = g;
        }
    }

    #[test]
    fn snapshot_copies_all_records() {
        let reg = SessionRegistry::new();
        reg.bind(Identity::driver("D1"), SessionId::from_raw("s1"), Utc::now());
        reg.bind(Identity::rider("R1"), SessionId::from_raw("s2"), Utc::now());

        let snap = reg.snapshot();
        assert_eq!(snap.len(), 2);
        reg.remove(&Identity::driver("D1"));
        assert_eq!(snap.len(), 2);
        assert_eq!(reg.size(), 1);
    }

    #[test]
    fn concurrent_binds_leave_one_record_from_last_swap() {
        let reg = Arc::new(SessionRegistry::new());
        let d1 = Identity::driver("D1");

        let handles: Vec<_> = (0..32)
            .map(|i| {
                let reg = Arc::clone(&reg);
                let d1 = d1.clone();
                std::thread::spawn(move || {
                    let (record, _) = reg.bind(d1, SessionId::from_raw(format!("s{i}")), Utc::now());
                    record
                })
            })
            .collect();
        let records: Vec<ConnectionRecord> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(reg.size(), 1);
        let last = records.iter().max_by_key(|r| r.generation).unwrap();
        assert_eq!(reg.get(&d1).unwrap(), *last);

        let generations: HashSet<u64> = records.iter().map(|r| r.generation).collect();
        assert_eq!(generations.len(), 32);
    }

    #[test]
    fn concurrent_bind_and_stale_remove() {
        let reg = Arc::new(SessionRegistry::new());
        let d1 = Identity::driver("D1");
        reg.bind(d1.clone(), SessionId::from_raw("s0"), Utc::now());

        let binder = {
            let reg = Arc::clone(&reg);
            let d1 = d1.clone();
            std::thread::spawn(move || {
                for i in 1..=200 {
                    reg.bind(d1.clone(), SessionId::from_raw(format!("s{i}")), Utc::now());
                }
            })
        };
        let remover = {
            let reg = Arc::clone(&reg);
            let d1 = d1.clone();
            std::thread::spawn(move || {
                for _ in 0..200 {
                    reg.remove_if_session(&d1, &SessionId::from_raw("s0"));
                }
            })
        };
        binder.join().unwrap();
        remover.join().unwrap();

        assert_eq!(reg.get(&d1).unwrap().session_id.as_str(), "s200");
    }
}
