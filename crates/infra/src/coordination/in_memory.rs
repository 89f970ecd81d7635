//! In-memory coordination store for tests/dev.
//!
//! A single mutex stands in for Redis' single-threaded script execution, and key
//! TTLs are evaluated against the injected [`Clock`], so expiry behaviour can be
//! driven with a `ManualClock`.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use feedsync_core::{Clock, IntegrationId, SystemClock, to_chrono};

use super::{
    CoordinationError, CoordinationStore, FinalHeartbeat, HeartbeatListing, HeartbeatRecord,
    HeartbeatTouch, SlotAdmission, SlotMember, SlotSnapshot,
};

#[derive(Debug, Clone)]
struct Expiring<T> {
    value: T,
    expires_at: DateTime<Utc>,
}

impl<T> Expiring<T> {
    fn new(value: T, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: now + to_chrono(ttl),
        }
    }

    fn alive(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Clone)]
enum StoredHeartbeat {
    Record(HeartbeatRecord),
    Malformed,
}

#[derive(Debug, Default)]
struct State {
    active: BTreeSet<IntegrationId>,
    expiry: HashMap<IntegrationId, DateTime<Utc>>,
    count: usize,
    heartbeats: HashMap<String, Expiring<StoredHeartbeat>>,
    finals: HashMap<IntegrationId, Expiring<FinalHeartbeat>>,
    locks: HashMap<String, Expiring<String>>,
}

impl State {
    fn remove_slot(&mut self, id: IntegrationId) {
        self.active.remove(&id);
        self.expiry.remove(&id);
    }

    fn resync_count(&mut self) -> usize {
        self.count = self.active.len();
        self.count
    }

    fn purge_expired_keys(&mut self, now: DateTime<Utc>) {
        self.heartbeats.retain(|_, v| v.alive(now));
        self.finals.retain(|_, v| v.alive(now));
        self.locks.retain(|_, v| v.alive(now));
    }
}

/// In-memory [`CoordinationStore`].
pub struct InMemoryCoordinationStore {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
    scripts_failing: AtomicBool,
}

impl std::fmt::Debug for InMemoryCoordinationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryCoordinationStore")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl InMemoryCoordinationStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock,
            scripts_failing: AtomicBool::new(false),
        }
    }

    pub fn arc(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self::with_clock(clock))
    }

    /// Make every scripted slot operation fail (simulates an unreachable script
    /// engine while plain commands still work).
    pub fn set_scripts_failing(&self, failing: bool) {
        self.scripts_failing.store(failing, Ordering::SeqCst);
    }

    /// Overwrite the cached counter, simulating drift after a partial failure.
    pub fn set_cached_count(&self, count: usize) {
        self.lock().count = count;
    }

    /// Add an active member without an expiry entry (half-written admission).
    pub fn insert_unbounded_member(&self, id: IntegrationId) {
        let mut state = self.lock();
        state.active.insert(id);
        state.count = state.active.len();
    }

    /// Store an undecodable heartbeat entry under `key`.
    pub fn insert_malformed_heartbeat(&self, key: &str, ttl: Duration) {
        let now = self.clock.now();
        self.lock()
            .heartbeats
            .insert(key.to_string(), Expiring::new(StoredHeartbeat::Malformed, now, ttl));
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn script_guard(&self, op: &str) -> Result<(), CoordinationError> {
        if self.scripts_failing.load(Ordering::SeqCst) {
            return Err(CoordinationError::Connection(format!("{op}: script engine unavailable")));
        }
        Ok(())
    }
}

impl Default for InMemoryCoordinationStore {
    fn default() -> Self {
        Self::new()
    }
}

fn heartbeat_key(id: IntegrationId) -> String {
    id.to_string()
}

#[async_trait]
impl CoordinationStore for InMemoryCoordinationStore {
    async fn acquire_slot(
        &self,
        integration_id: IntegrationId,
        now: DateTime<Utc>,
        ttl: Duration,
        max_slots: usize,
    ) -> Result<SlotAdmission, CoordinationError> {
        self.script_guard("acquire_slot")?;
        let mut state = self.lock();

        let is_member = state.active.contains(&integration_id);
        match state.expiry.get(&integration_id).copied() {
            // Own live slot: release and re-admit below.
            Some(exp) if exp > now && is_member => state.remove_slot(integration_id),
            Some(exp) if exp <= now => state.remove_slot(integration_id),
            None if is_member => return Ok(SlotAdmission::AlreadyActive),
            _ => {}
        }

        let expired: Vec<IntegrationId> = state
            .active
            .iter()
            .copied()
            .filter(|m| state.expiry.get(m).is_some_and(|e| *e <= now))
            .collect();
        for id in expired {
            state.remove_slot(id);
        }

        let live = state.active.len();
        if live >= max_slots {
            state.count = live;
            return Ok(SlotAdmission::CeilingReached { active: live });
        }

        let expires_at = now + to_chrono(ttl);
        state.active.insert(integration_id);
        state.expiry.insert(integration_id, expires_at);
        state.count = live + 1;
        Ok(SlotAdmission::Admitted {
            active: live + 1,
            expires_at,
        })
    }

    async fn release_slot(&self, integration_id: IntegrationId) -> Result<usize, CoordinationError> {
        self.script_guard("release_slot")?;
        let mut state = self.lock();
        state.remove_slot(integration_id);
        Ok(state.resync_count())
    }

    async fn release_admission(
        &self,
        integration_id: IntegrationId,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, CoordinationError> {
        self.script_guard("release_admission")?;
        let mut state = self.lock();
        if state.expiry.get(&integration_id) != Some(&expires_at) {
            return Ok(false);
        }
        state.remove_slot(integration_id);
        state.resync_count();
        Ok(true)
    }

    async fn force_release_slot(
        &self,
        integration_id: IntegrationId,
    ) -> Result<usize, CoordinationError> {
        let mut state = self.lock();
        state.remove_slot(integration_id);
        Ok(state.resync_count())
    }

    async fn evict_expired_slots(
        &self,
        now: DateTime<Utc>,
        evict_unbounded: bool,
    ) -> Result<Vec<IntegrationId>, CoordinationError> {
        self.script_guard("evict_expired_slots")?;
        let mut state = self.lock();

        let mut evicted: Vec<IntegrationId> = state
            .expiry
            .iter()
            .filter(|(_, exp)| **exp <= now)
            .map(|(id, _)| *id)
            .collect();
        if evict_unbounded {
            evicted.extend(
                state
                    .active
                    .iter()
                    .filter(|m| !state.expiry.contains_key(*m))
                    .copied(),
            );
        }
        evicted.sort();
        evicted.dedup();

        for id in &evicted {
            state.remove_slot(*id);
        }
        state.resync_count();
        Ok(evicted)
    }

    async fn slot_snapshot(&self) -> Result<SlotSnapshot, CoordinationError> {
        let state = self.lock();
        Ok(SlotSnapshot {
            members: state
                .active
                .iter()
                .map(|id| SlotMember {
                    integration_id: *id,
                    expires_at: state.expiry.get(id).copied(),
                })
                .collect(),
            cached_count: state.count,
        })
    }

    async fn put_heartbeat(
        &self,
        record: &HeartbeatRecord,
        ttl: Duration,
    ) -> Result<(), CoordinationError> {
        let now = self.clock.now();
        self.lock().heartbeats.insert(
            heartbeat_key(record.integration_id),
            Expiring::new(StoredHeartbeat::Record(record.clone()), now, ttl),
        );
        Ok(())
    }

    async fn touch_heartbeat(
        &self,
        integration_id: IntegrationId,
        touch: &HeartbeatTouch,
    ) -> Result<Option<HeartbeatRecord>, CoordinationError> {
        let now = self.clock.now();
        let mut state = self.lock();
        state.purge_expired_keys(now);

        let Some(entry) = state.heartbeats.get_mut(&heartbeat_key(integration_id)) else {
            return Ok(None);
        };
        let StoredHeartbeat::Record(record) = &mut entry.value else {
            return Err(CoordinationError::Malformed(format!(
                "heartbeat {integration_id} is not decodable"
            )));
        };

        record.last_heartbeat = touch.at;
        record.current_step = touch.step.clone();
        record.progress = touch.progress;
        record.update_count += 1;
        if let Some(ttl) = touch.extend_ttl {
            record.last_renewed_at = touch.at;
            entry.expires_at = now + to_chrono(ttl);
        }
        Ok(Some(record.clone()))
    }

    async fn get_heartbeat(
        &self,
        integration_id: IntegrationId,
    ) -> Result<Option<HeartbeatRecord>, CoordinationError> {
        let now = self.clock.now();
        let mut state = self.lock();
        state.purge_expired_keys(now);
        Ok(match state.heartbeats.get(&heartbeat_key(integration_id)) {
            Some(Expiring {
                value: StoredHeartbeat::Record(r),
                ..
            }) => Some(r.clone()),
            _ => None,
        })
    }

    async fn list_heartbeats(&self) -> Result<HeartbeatListing, CoordinationError> {
        let now = self.clock.now();
        let mut state = self.lock();
        state.purge_expired_keys(now);

        let mut listing = HeartbeatListing::default();
        for (key, entry) in &state.heartbeats {
            match &entry.value {
                StoredHeartbeat::Record(r) => listing.records.push(r.clone()),
                StoredHeartbeat::Malformed => listing.malformed_keys.push(key.clone()),
            }
        }
        listing.records.sort_by_key(|r| r.integration_id);
        Ok(listing)
    }

    async fn delete_heartbeat(
        &self,
        integration_id: IntegrationId,
    ) -> Result<bool, CoordinationError> {
        Ok(self
            .lock()
            .heartbeats
            .remove(&heartbeat_key(integration_id))
            .is_some())
    }

    async fn purge_heartbeat_key(&self, key: &str) -> Result<(), CoordinationError> {
        self.lock().heartbeats.remove(key);
        Ok(())
    }

    async fn put_final_heartbeat(
        &self,
        record: &FinalHeartbeat,
        ttl: Duration,
    ) -> Result<(), CoordinationError> {
        let now = self.clock.now();
        self.lock()
            .finals
            .insert(record.integration_id, Expiring::new(record.clone(), now, ttl));
        Ok(())
    }

    async fn get_final_heartbeat(
        &self,
        integration_id: IntegrationId,
    ) -> Result<Option<FinalHeartbeat>, CoordinationError> {
        let now = self.clock.now();
        let mut state = self.lock();
        state.purge_expired_keys(now);
        Ok(state.finals.get(&integration_id).map(|e| e.value.clone()))
    }

    async fn try_lock(
        &self,
        name: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, CoordinationError> {
        let now = self.clock.now();
        let mut state = self.lock();
        state.purge_expired_keys(now);
        if state.locks.contains_key(name) {
            return Ok(false);
        }
        state
            .locks
            .insert(name.to_string(), Expiring::new(owner.to_string(), now, ttl));
        Ok(true)
    }

    async fn unlock(&self, name: &str, owner: &str) -> Result<(), CoordinationError> {
        let mut state = self.lock();
        if state.locks.get(name).is_some_and(|l| l.value == owner) {
            state.locks.remove(name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use feedsync_core::ManualClock;

    const TTL: Duration = Duration::from_secs(1800);

    fn store() -> (Arc<ManualClock>, InMemoryCoordinationStore) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = InMemoryCoordinationStore::with_clock(clock.clone());
        (clock, store)
    }

    #[tokio::test]
    async fn acquire_respects_ceiling() {
        let (clock, store) = store();
        let now = clock.now();

        for _ in 0..2 {
            let r = store.acquire_slot(IntegrationId::new(), now, TTL, 2).await.unwrap();
            assert!(matches!(r, SlotAdmission::Admitted { .. }));
        }
        let r = store.acquire_slot(IntegrationId::new(), now, TTL, 2).await.unwrap();
        assert_eq!(r, SlotAdmission::CeilingReached { active: 2 });
    }

    #[tokio::test]
    async fn acquire_reconciles_drifted_counter() {
        let (clock, store) = store();
        let now = clock.now();
        let old = IntegrationId::new();
        store.acquire_slot(old, now, Duration::from_secs(1), 1).await.unwrap();
        store.set_cached_count(40);

        let later = now + chrono::Duration::seconds(2);
        let r = store.acquire_slot(IntegrationId::new(), later, TTL, 1).await.unwrap();
        assert!(matches!(r, SlotAdmission::Admitted { active: 1, .. }));
        assert_eq!(store.slot_snapshot().await.unwrap().cached_count, 1);
    }

    #[tokio::test]
    async fn reacquire_of_own_slot_is_idempotent() {
        let (clock, store) = store();
        let id = IntegrationId::new();
        store.acquire_slot(id, clock.now(), TTL, 1).await.unwrap();
        let r = store.acquire_slot(id, clock.now(), TTL, 1).await.unwrap();
        assert!(matches!(r, SlotAdmission::Admitted { active: 1, .. }));
    }

    #[tokio::test]
    async fn admission_release_ignores_later_admission() {
        let (clock, store) = store();
        let id = IntegrationId::new();
        let SlotAdmission::Admitted { expires_at: first, .. } =
            store.acquire_slot(id, clock.now(), TTL, 2).await.unwrap()
        else {
            panic!("first admission refused");
        };

        clock.advance(TTL + Duration::from_secs(60));
        let SlotAdmission::Admitted { expires_at: second, .. } =
            store.acquire_slot(id, clock.now(), TTL, 2).await.unwrap()
        else {
            panic!("second admission refused");
        };

        assert!(!store.release_admission(id, first).await.unwrap());
        assert!(store.slot_snapshot().await.unwrap().contains(id));
        assert!(store.release_admission(id, second).await.unwrap());
        assert!(!store.slot_snapshot().await.unwrap().contains(id));
    }

    #[tokio::test]
    async fn unbounded_member_reports_already_active() {
        let (clock, store) = store();
        let id = IntegrationId::new();
        store.insert_unbounded_member(id);
        let r = store.acquire_slot(id, clock.now(), TTL, 6).await.unwrap();
        assert_eq!(r, SlotAdmission::AlreadyActive);

        let evicted = store.evict_expired_slots(clock.now(), true).await.unwrap();
        assert_eq!(evicted, vec![id]);
    }

    #[tokio::test]
    async fn heartbeat_ttl_follows_clock() {
        let (clock, store) = store();
        let id = IntegrationId::new();
        let now = clock.now();
        let record = HeartbeatRecord {
            integration_id: id,
            worker_id: "w1".to_string(),
            started_at: now,
            last_heartbeat: now,
            last_renewed_at: now,
            current_step: "start".to_string(),
            progress: None,
            update_count: 0,
        };
        store.put_heartbeat(&record, Duration::from_secs(10)).await.unwrap();
        assert!(store.get_heartbeat(id).await.unwrap().is_some());

        clock.advance(Duration::from_secs(10));
        assert!(store.get_heartbeat(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_ttl() {
        let (clock, store) = store();
        let ttl = Duration::from_secs(30);
        assert!(store.try_lock("cleanup", "a", ttl).await.unwrap());
        assert!(!store.try_lock("cleanup", "b", ttl).await.unwrap());

        store.unlock("cleanup", "b").await.unwrap();
        assert!(!store.try_lock("cleanup", "b", ttl).await.unwrap());

        clock.advance(ttl);
        assert!(store.try_lock("cleanup", "b", ttl).await.unwrap());
    }
}
