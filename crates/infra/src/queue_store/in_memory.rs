//! In-memory queue store for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use feedsync_core::{Integration, IntegrationId, QueueEntry, QueueStatus};

use super::{QueueStore, QueueStoreError, StalledJob, TransitionFn};

#[derive(Debug, Default)]
struct State {
    rows: HashMap<IntegrationId, (Integration, QueueEntry)>,
    /// Transitions that will observe a concurrent write before their guard check.
    injected_conflicts: usize,
}

/// In-memory queue store.
///
/// Transitions are serialized by a single mutex, which gives the same
/// "lock, check version, write" behaviour as the row locks of the durable store.
#[derive(Debug, Default)]
pub struct InMemoryQueueStore {
    state: Mutex<State>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Make the next `n` guarded transitions lose against a simulated concurrent writer.
    pub fn inject_conflicts(&self, n: usize) {
        self.lock().injected_conflicts = n;
    }

    /// Overwrite a stored entry as-is (no transition checks).
    pub fn put_entry(&self, entry: QueueEntry) {
        if let Some(row) = self.lock().rows.get_mut(&entry.integration_id) {
            row.1 = entry;
        }
    }

    pub fn remove(&self, integration_id: IntegrationId) -> bool {
        self.lock().rows.remove(&integration_id).is_some()
    }

    pub fn entry(&self, integration_id: IntegrationId) -> Option<QueueEntry> {
        self.lock().rows.get(&integration_id).map(|(_, e)| e.clone())
    }

    pub fn integration(&self, integration_id: IntegrationId) -> Option<Integration> {
        self.lock().rows.get(&integration_id).map(|(i, _)| i.clone())
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn enqueue(
        &self,
        integration: &Integration,
        entry: &QueueEntry,
    ) -> Result<(), QueueStoreError> {
        let mut state = self.lock();
        if state.rows.contains_key(&integration.id) {
            return Err(QueueStoreError::AlreadyQueued(integration.id));
        }
        state
            .rows
            .insert(integration.id, (integration.clone(), entry.clone()));
        Ok(())
    }

    async fn load(
        &self,
        integration_id: IntegrationId,
    ) -> Result<Option<(Integration, QueueEntry)>, QueueStoreError> {
        Ok(self.lock().rows.get(&integration_id).cloned())
    }

    async fn transition(
        &self,
        integration_id: IntegrationId,
        observed: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        apply: TransitionFn<'_>,
    ) -> Result<(Integration, QueueEntry), QueueStoreError> {
        let mut state = self.lock();
        let inject = state.injected_conflicts > 0;
        if inject {
            state.injected_conflicts -= 1;
        }

        let (integration, entry) = state
            .rows
            .get_mut(&integration_id)
            .ok_or(QueueStoreError::NotFound(integration_id))?;

        if inject {
            entry.touch(now);
        }
        if let Some(observed) = observed {
            if entry.updated_at != observed {
                return Err(QueueStoreError::Conflict {
                    integration_id,
                    observed,
                    found: entry.updated_at,
                });
            }
        }

        let mut next_integration = integration.clone();
        let mut next_entry = entry.clone();
        apply(&mut next_integration, &mut next_entry)?;
        next_entry.touch(now);

        *integration = next_integration.clone();
        *entry = next_entry.clone();
        Ok((next_integration, next_entry))
    }

    async fn in_process_among(
        &self,
        ids: &[IntegrationId],
    ) -> Result<Vec<IntegrationId>, QueueStoreError> {
        let state = self.lock();
        Ok(ids
            .iter()
            .copied()
            .filter(|id| {
                state
                    .rows
                    .get(id)
                    .is_some_and(|(_, e)| e.status == QueueStatus::InProcess)
            })
            .collect())
    }

    async fn list_stalled(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<StalledJob>, QueueStoreError> {
        let state = self.lock();
        let mut stalled: Vec<StalledJob> = state
            .rows
            .values()
            .filter(|(_, e)| e.started_before(started_before))
            .filter_map(|(i, e)| {
                e.started_at.map(|started_at| StalledJob {
                    integration_id: i.id,
                    user_id: i.user_id,
                    started_at,
                })
            })
            .collect();
        stalled.sort_by_key(|s| s.started_at);
        Ok(stalled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use feedsync_core::{TransitionError, UserId};

    async fn seeded(store: &InMemoryQueueStore, now: DateTime<Utc>) -> IntegrationId {
        let integration = Integration::new(UserId::new(), "https://example.com/feed.xml", "generic", now);
        let entry = QueueEntry::new(integration.id, 0, now);
        store.enqueue(&integration, &entry).await.unwrap();
        integration.id
    }

    #[tokio::test]
    async fn enqueue_rejects_duplicates() {
        let store = InMemoryQueueStore::new();
        let now = Utc::now();
        let integration = Integration::new(UserId::new(), "https://a", "generic", now);
        let entry = QueueEntry::new(integration.id, 0, now);

        store.enqueue(&integration, &entry).await.unwrap();
        let err = store.enqueue(&integration, &entry).await.unwrap_err();
        assert!(matches!(err, QueueStoreError::AlreadyQueued(_)));
    }

    #[tokio::test]
    async fn stale_observed_version_conflicts() {
        let store = InMemoryQueueStore::new();
        let now = Utc::now();
        let id = seeded(&store, now).await;
        let stale = now - Duration::seconds(1);

        let result = store
            .transition(id, Some(stale), now, &|_, e| {
                e.begin_run(now);
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(QueueStoreError::Conflict { .. })));
        assert_eq!(store.entry(id).unwrap().status, QueueStatus::Pending);
    }

    #[tokio::test]
    async fn failed_mutation_leaves_rows_untouched() {
        let store = InMemoryQueueStore::new();
        let now = Utc::now();
        let id = seeded(&store, now).await;

        let before = store.entry(id).unwrap();
        let result = store
            .transition(id, Some(before.updated_at), now, &|_, _| {
                Err(TransitionError::ZeroItems)
            })
            .await;

        assert!(matches!(result, Err(QueueStoreError::Transition(TransitionError::ZeroItems))));
        assert_eq!(store.entry(id).unwrap(), before);
    }

    #[tokio::test]
    async fn transition_bumps_version_and_lists_stalled() {
        let store = InMemoryQueueStore::new();
        let now = Utc::now();
        let id = seeded(&store, now).await;

        let (_, entry) = store
            .transition(id, Some(now), now, &|i, e| {
                i.enter_processing(now);
                e.begin_run(now);
                Ok(())
            })
            .await
            .unwrap();
        assert!(entry.updated_at > now);

        assert_eq!(store.in_process_among(&[id, IntegrationId::new()]).await.unwrap(), vec![id]);
        assert_eq!(store.list_stalled(now).await.unwrap().len(), 1);
        assert!(store.list_stalled(now - Duration::seconds(1)).await.unwrap().is_empty());
    }
}
