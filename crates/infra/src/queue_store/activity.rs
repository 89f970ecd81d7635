//! Tenant write activity, used to corroborate that a silent job is still alive.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use feedsync_core::UserId;

use super::QueueStoreError;
use super::postgres::map_sqlx_error;

#[async_trait]
pub trait TenantActivity: Send + Sync {
    /// Whether the tenant wrote any data at or after `since`.
    async fn has_recent_writes(
        &self,
        user_id: UserId,
        since: DateTime<Utc>,
    ) -> Result<bool, QueueStoreError>;
}

/// Reads the tenant's `properties` rows.
pub struct PostgresTenantActivity {
    pool: Arc<PgPool>,
}

impl PostgresTenantActivity {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl TenantActivity for PostgresTenantActivity {
    async fn has_recent_writes(
        &self,
        user_id: UserId,
        since: DateTime<Utc>,
    ) -> Result<bool, QueueStoreError> {
        sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM properties
                WHERE user_id = $1 AND updated_at >= $2
            )
            "#,
        )
        .bind(user_id.as_uuid())
        .bind(since)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("has_recent_writes", e))
    }
}

/// Never corroborates; every silent job is treated as dead.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTenantActivity;

#[async_trait]
impl TenantActivity for NoTenantActivity {
    async fn has_recent_writes(
        &self,
        _user_id: UserId,
        _since: DateTime<Utc>,
    ) -> Result<bool, QueueStoreError> {
        Ok(false)
    }
}

/// Activity double: writes are recorded explicitly.
#[derive(Debug, Default)]
pub struct RecordedTenantActivity {
    last_write: Mutex<HashMap<UserId, DateTime<Utc>>>,
}

impl RecordedTenantActivity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_write(&self, user_id: UserId, at: DateTime<Utc>) {
        let mut writes = self.last_write.lock().unwrap_or_else(|p| p.into_inner());
        let slot = writes.entry(user_id).or_insert(at);
        if at > *slot {
            *slot = at;
        }
    }
}

#[async_trait]
impl TenantActivity for RecordedTenantActivity {
    async fn has_recent_writes(
        &self,
        user_id: UserId,
        since: DateTime<Utc>,
    ) -> Result<bool, QueueStoreError> {
        let writes = self.last_write.lock().unwrap_or_else(|p| p.into_inner());
        Ok(writes.get(&user_id).is_some_and(|at| *at >= since))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn recorded_activity_respects_window() {
        let activity = RecordedTenantActivity::new();
        let user = UserId::new();
        let now = Utc::now();
        activity.record_write(user, now - Duration::minutes(5));

        assert!(activity.has_recent_writes(user, now - Duration::minutes(10)).await.unwrap());
        assert!(!activity.has_recent_writes(user, now - Duration::minutes(1)).await.unwrap());
        assert!(!activity.has_recent_writes(UserId::new(), now - Duration::hours(1)).await.unwrap());
        assert!(!NoTenantActivity.has_recent_writes(user, now).await.unwrap());
    }
}
