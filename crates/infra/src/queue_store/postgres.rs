//! Postgres-backed queue store.
//!
//! Schema: `crates/infra/migrations/0001_integration_queue.sql`.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | QueueStoreError |
//! |------------|----------------------|-----------------|
//! | Database (unique violation) | `23505` | `AlreadyQueued` (enqueue only) |
//! | ColumnDecode / Decode | N/A | `Decode` |
//! | Anything else | N/A | `Storage` |
//!
//! ## Guarded transitions
//!
//! `transition()` runs one transaction that:
//! 1. locks the integration and queue rows (`SELECT … FOR UPDATE OF i, q`)
//! 2. compares the locked `updated_at` to the caller's observed version
//! 3. applies the mutation in memory
//! 4. writes both rows back, the queue row with `WHERE updated_at = $locked`

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument};

use feedsync_core::{
    Integration, IntegrationId, IntegrationStatus, QueueEntry, QueueStatus, UserId,
};

use super::{QueueStore, QueueStoreError, StalledJob, TransitionFn};

const SELECT_JOINED: &str = r#"
    SELECT
        i.id                 AS i_id,
        i.user_id            AS i_user_id,
        i.source_url         AS i_source_url,
        i.provider           AS i_provider,
        i.status             AS i_status,
        i.item_count         AS i_item_count,
        i.last_integrated_at AS i_last_integrated_at,
        i.created_at         AS i_created_at,
        i.updated_at         AS i_updated_at,
        q.integration_id,
        q.priority,
        q.status,
        q.started_at,
        q.ended_at,
        q.completed_at,
        q.execution_time_ms,
        q.attempts,
        q.error_message,
        q.last_error_step,
        q.error_details,
        q.created_at,
        q.updated_at
    FROM integration_queue q
    JOIN integrations i ON i.id = q.integration_id
    WHERE q.integration_id = $1
"#;

/// Postgres implementation of [`QueueStore`].
#[derive(Clone)]
pub struct PostgresQueueStore {
    pool: Arc<PgPool>,
}

impl PostgresQueueStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn fetch_locked(
        tx: &mut Transaction<'_, Postgres>,
        integration_id: IntegrationId,
    ) -> Result<Option<JoinedRow>, QueueStoreError> {
        let sql = format!("{SELECT_JOINED} FOR UPDATE OF i, q");
        sqlx::query_as::<_, JoinedRow>(&sql)
            .bind(integration_id.as_uuid())
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("lock_rows", e))
    }

    async fn rollback(tx: Transaction<'_, Postgres>) -> Result<(), QueueStoreError> {
        tx.rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

#[async_trait]
impl QueueStore for PostgresQueueStore {
    #[instrument(skip(self, integration, entry), fields(integration_id = %integration.id), err)]
    async fn enqueue(
        &self,
        integration: &Integration,
        entry: &QueueEntry,
    ) -> Result<(), QueueStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query(
            r#"
            INSERT INTO integrations (
                id, user_id, source_url, provider, status, item_count,
                last_integrated_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(integration.id.as_uuid())
        .bind(integration.user_id.as_uuid())
        .bind(&integration.source_url)
        .bind(&integration.provider)
        .bind(integration.status.as_str())
        .bind(integration.item_count as i64)
        .bind(integration.last_integrated_at)
        .bind(integration.created_at)
        .bind(integration.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_integration", e))?;

        sqlx::query(
            r#"
            INSERT INTO integration_queue (
                integration_id, priority, status, attempts, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(entry.integration_id.as_uuid())
        .bind(entry.priority)
        .bind(entry.status.as_str())
        .bind(entry.attempts as i32)
        .bind(entry.created_at)
        .bind(entry.updated_at.trunc_subsecs(6))
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                QueueStoreError::AlreadyQueued(entry.integration_id)
            } else {
                map_sqlx_error("insert_queue_entry", e)
            }
        })?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    #[instrument(skip(self), fields(integration_id = %integration_id), err)]
    async fn load(
        &self,
        integration_id: IntegrationId,
    ) -> Result<Option<(Integration, QueueEntry)>, QueueStoreError> {
        let row = sqlx::query_as::<_, JoinedRow>(SELECT_JOINED)
            .bind(integration_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load", e))?;

        row.map(JoinedRow::into_domain).transpose()
    }

    #[instrument(
        skip(self, apply),
        fields(
            integration_id = %integration_id,
            version_guard = observed.is_some(),
            queue_status = tracing::field::Empty
        ),
        err
    )]
    async fn transition(
        &self,
        integration_id: IntegrationId,
        observed: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        apply: TransitionFn<'_>,
    ) -> Result<(Integration, QueueEntry), QueueStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let Some(row) = Self::fetch_locked(&mut tx, integration_id).await? else {
            Self::rollback(tx).await?;
            return Err(QueueStoreError::NotFound(integration_id));
        };
        let (mut integration, mut entry) = match row.into_domain() {
            Ok(rows) => rows,
            Err(e) => {
                Self::rollback(tx).await?;
                return Err(e);
            }
        };
        let locked_version = entry.updated_at;

        if let Some(observed) = observed {
            if observed != locked_version {
                Self::rollback(tx).await?;
                return Err(QueueStoreError::Conflict {
                    integration_id,
                    observed,
                    found: locked_version,
                });
            }
        }

        if let Err(e) = apply(&mut integration, &mut entry) {
            Self::rollback(tx).await?;
            return Err(e.into());
        }
        entry.touch(now.trunc_subsecs(6));
        entry.updated_at = entry.updated_at.trunc_subsecs(6);
        // Run stamps compare `started_at`; keep it identical to the stored value.
        entry.started_at = entry.started_at.map(|t| t.trunc_subsecs(6));
        if entry.updated_at <= locked_version {
            entry.updated_at = locked_version + chrono::Duration::microseconds(1);
        }

        let updated = sqlx::query(
            r#"
            UPDATE integration_queue SET
                priority = $2,
                status = $3,
                started_at = $4,
                ended_at = $5,
                completed_at = $6,
                execution_time_ms = $7,
                attempts = $8,
                error_message = $9,
                last_error_step = $10,
                error_details = $11,
                updated_at = $12
            WHERE integration_id = $1 AND updated_at = $13
            "#,
        )
        .bind(integration_id.as_uuid())
        .bind(entry.priority)
        .bind(entry.status.as_str())
        .bind(entry.started_at)
        .bind(entry.ended_at)
        .bind(entry.completed_at)
        .bind(entry.execution_time_ms.map(|ms| ms as i64))
        .bind(entry.attempts as i32)
        .bind(&entry.error_message)
        .bind(&entry.last_error_step)
        .bind(&entry.error_details)
        .bind(entry.updated_at)
        .bind(locked_version)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update_queue_entry", e))?;

        if updated.rows_affected() == 0 {
            Self::rollback(tx).await?;
            return Err(QueueStoreError::RowVanished(integration_id));
        }

        sqlx::query(
            r#"
            UPDATE integrations SET
                status = $2,
                item_count = $3,
                last_integrated_at = $4,
                updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(integration_id.as_uuid())
        .bind(integration.status.as_str())
        .bind(integration.item_count as i64)
        .bind(integration.last_integrated_at)
        .bind(integration.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update_integration", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Span::current().record("queue_status", entry.status.as_str());
        Ok((integration, entry))
    }

    async fn in_process_among(
        &self,
        ids: &[IntegrationId],
    ) -> Result<Vec<IntegrationId>, QueueStoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let uuids = uuid_array(ids);

        let rows = sqlx::query(
            r#"
            SELECT integration_id
            FROM integration_queue
            WHERE status = 'in_process' AND integration_id = ANY($1)
            "#,
        )
        .bind(&uuids)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("in_process_among", e))?;

        rows.iter()
            .map(|row| {
                row.try_get::<uuid::Uuid, _>("integration_id")
                    .map(IntegrationId::from_uuid)
                    .map_err(|e| QueueStoreError::Decode(e.to_string()))
            })
            .collect()
    }

    #[instrument(skip(self), err)]
    async fn list_stalled(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<StalledJob>, QueueStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT q.integration_id, i.user_id, q.started_at
            FROM integration_queue q
            JOIN integrations i ON i.id = q.integration_id
            WHERE q.status = 'in_process' AND q.started_at <= $1
            ORDER BY q.started_at ASC
            "#,
        )
        .bind(started_before)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_stalled", e))?;

        rows.iter()
            .map(|row| -> Result<StalledJob, sqlx::Error> {
                Ok(StalledJob {
                    integration_id: IntegrationId::from_uuid(row.try_get("integration_id")?),
                    user_id: UserId::from_uuid(row.try_get("user_id")?),
                    started_at: row.try_get("started_at")?,
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| QueueStoreError::Decode(e.to_string()))
    }
}

/// Map SQLx errors to QueueStoreError.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> QueueStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
            QueueStoreError::Storage(format!(
                "database error in {operation} ({code}): {}",
                db_err.message()
            ))
        }
        sqlx::Error::PoolClosed => {
            QueueStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::PoolTimedOut => {
            QueueStoreError::Storage(format!("connection pool timed out in {operation}"))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            QueueStoreError::Decode(format!("{operation}: {err}"))
        }
        _ => QueueStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

/// Ids as a `uuid[]` bind parameter.
fn uuid_array(ids: &[IntegrationId]) -> Vec<uuid::Uuid> {
    ids.iter().map(|id| *id.as_uuid()).collect()
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

// SQLx row types

#[derive(Debug)]
struct JoinedRow {
    i_id: uuid::Uuid,
    i_user_id: uuid::Uuid,
    i_source_url: String,
    i_provider: String,
    i_status: String,
    i_item_count: i64,
    i_last_integrated_at: Option<DateTime<Utc>>,
    i_created_at: DateTime<Utc>,
    i_updated_at: DateTime<Utc>,
    integration_id: uuid::Uuid,
    priority: i32,
    status: String,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    execution_time_ms: Option<i64>,
    attempts: i32,
    error_message: Option<String>,
    last_error_step: Option<String>,
    error_details: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for JoinedRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(JoinedRow {
            i_id: row.try_get("i_id")?,
            i_user_id: row.try_get("i_user_id")?,
            i_source_url: row.try_get("i_source_url")?,
            i_provider: row.try_get("i_provider")?,
            i_status: row.try_get("i_status")?,
            i_item_count: row.try_get("i_item_count")?,
            i_last_integrated_at: row.try_get("i_last_integrated_at")?,
            i_created_at: row.try_get("i_created_at")?,
            i_updated_at: row.try_get("i_updated_at")?,
            integration_id: row.try_get("integration_id")?,
            priority: row.try_get("priority")?,
            status: row.try_get("status")?,
            started_at: row.try_get("started_at")?,
            ended_at: row.try_get("ended_at")?,
            completed_at: row.try_get("completed_at")?,
            execution_time_ms: row.try_get("execution_time_ms")?,
            attempts: row.try_get("attempts")?,
            error_message: row.try_get("error_message")?,
            last_error_step: row.try_get("last_error_step")?,
            error_details: row.try_get("error_details")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl JoinedRow {
    fn into_domain(self) -> Result<(Integration, QueueEntry), QueueStoreError> {
        let decode = |e: feedsync_core::DomainError| QueueStoreError::Decode(e.to_string());

        let integration = Integration {
            id: IntegrationId::from_uuid(self.i_id),
            user_id: UserId::from_uuid(self.i_user_id),
            source_url: self.i_source_url,
            provider: self.i_provider,
            status: IntegrationStatus::from_str(&self.i_status).map_err(decode)?,
            item_count: self.i_item_count.max(0) as u64,
            last_integrated_at: self.i_last_integrated_at,
            created_at: self.i_created_at,
            updated_at: self.i_updated_at,
        };
        let entry = QueueEntry {
            integration_id: IntegrationId::from_uuid(self.integration_id),
            priority: self.priority,
            status: QueueStatus::from_str(&self.status).map_err(decode)?,
            started_at: self.started_at,
            ended_at: self.ended_at,
            completed_at: self.completed_at,
            execution_time_ms: self.execution_time_ms.map(|ms| ms.max(0) as u64),
            attempts: self.attempts.max(0) as u32,
            error_message: self.error_message,
            last_error_step: self.last_error_step,
            error_details: self.error_details,
            created_at: self.created_at,
            updated_at: self.updated_at,
        };
        Ok((integration, entry))
    }
}
