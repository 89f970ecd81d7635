//! Worker process: connects both stores and runs the maintenance loop until
//! interrupted. `--once` runs a single reconciliation pass and exits.

use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use feedsync_core::SystemClock;
use feedsync_infra::{
    OrchestrationServices, OrchestratorConfig, PostgresQueueStore, PostgresTenantActivity,
    RedisCoordinationStore,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    feedsync_observability::init();

    let once = std::env::args().skip(1).any(|arg| arg == "--once");
    let config = OrchestratorConfig::from_env().context("invalid configuration")?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(config.database_url()?)
        .await
        .context("failed to connect to Postgres")?;
    let coordination =
        RedisCoordinationStore::new(&config.stores.redis_url, &config.stores.key_prefix)
            .context("failed to set up Redis client")?;

    let services = OrchestrationServices::build(
        config.clone(),
        Arc::new(coordination),
        Arc::new(PostgresQueueStore::new(pool.clone())),
        Arc::new(PostgresTenantActivity::new(pool)),
        Arc::new(SystemClock),
    );

    tracing::info!(
        worker_id = %config.heartbeat.worker_id,
        max_slots = config.slots.max_slots,
        policy = ?config.transition_policy,
        "feedsync worker starting"
    );

    if once {
        let report = services.maintenance().run_once().await;
        tracing::info!(
            expired = report.expired.evicted.len(),
            orphaned = report.orphaned.evicted.len(),
            recovered = report.recovered.len(),
            heartbeats_purged = report.heartbeats_purged,
            failed_steps = ?report.failed_steps,
            "maintenance pass done"
        );
        return Ok(());
    }

    let handle = services.maintenance().spawn(config.maintenance_interval);

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested");
    handle.shutdown().await;

    Ok(())
}
