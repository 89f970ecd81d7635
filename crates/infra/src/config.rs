//! Configuration loading and representation.
//!
//! Everything is read from environment variables with production defaults, so a
//! worker only needs `DATABASE_URL` (and usually `REDIS_URL`) to start.

use std::time::Duration;

use feedsync_core::TransitionPolicy;

use crate::retry::RetryPolicy;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Slot Manager settings.
#[derive(Debug, Clone)]
pub struct SlotConfig {
    /// Ceiling of concurrently admitted jobs across all workers.
    pub max_slots: usize,
    /// Lifetime of an admission before it is considered abandoned.
    pub slot_ttl: Duration,
    /// How long a durable record may stay in process before it counts as stalled.
    pub stall_threshold: Duration,
    /// Tenant writes newer than this prove a stalled-looking job is alive.
    pub activity_window: Duration,
    /// TTL of the mutual-exclusion lock taken by cleanup passes.
    pub cleanup_lock_ttl: Duration,
    /// TTL of the tombstone written when cleanup drops a heartbeat.
    pub final_heartbeat_ttl: Duration,
}

impl Default for SlotConfig {
    fn default() -> Self {
        Self {
            max_slots: 6,
            slot_ttl: Duration::from_secs(30 * 60),
            stall_threshold: Duration::from_secs(10 * 60),
            activity_window: Duration::from_secs(10 * 60),
            cleanup_lock_ttl: Duration::from_secs(30),
            final_heartbeat_ttl: Duration::from_secs(5 * 60),
        }
    }
}

/// Heartbeat Monitor settings.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Silence longer than this marks a job stuck. Shorter than the slot TTL.
    pub stuck_threshold: Duration,
    /// Minimum time between two TTL extensions of the same record.
    pub renew_interval: Duration,
    /// TTL of live records; records older than this are purged regardless of content.
    pub max_lifetime: Duration,
    /// TTL of the tombstone written on stop.
    pub final_ttl: Duration,
    pub activity_window: Duration,
    /// Identity written into heartbeat records.
    pub worker_id: String,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            stuck_threshold: Duration::from_secs(5 * 60),
            renew_interval: Duration::from_secs(60),
            max_lifetime: Duration::from_secs(30 * 60),
            final_ttl: Duration::from_secs(5 * 60),
            activity_window: Duration::from_secs(10 * 60),
            worker_id: default_worker_id(),
        }
    }
}

/// Connection settings for the two stores.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub database_url: Option<String>,
    pub redis_url: String,
    /// Prefix of every coordination-store key.
    pub key_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: "feedsync".to_string(),
        }
    }
}

/// Full orchestration configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub stores: StoreConfig,
    pub slots: SlotConfig,
    pub heartbeat: HeartbeatConfig,
    pub transition_policy: TransitionPolicy,
    /// Whole-operation retries of a status update after an optimistic conflict.
    pub status_conflict_retries: u32,
    /// Failed runs before a job is marked terminally failed.
    pub max_attempts: u32,
    /// Delay handed back to the queue consumer when admission is denied.
    pub retry_delay: Duration,
    pub maintenance_interval: Duration,
    /// Wrapper around every coordination-store call.
    pub coordination_retry: RetryPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            stores: StoreConfig::default(),
            slots: SlotConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            transition_policy: TransitionPolicy::Permissive,
            status_conflict_retries: 3,
            max_attempts: 5,
            retry_delay: Duration::from_secs(60),
            maintenance_interval: Duration::from_secs(60),
            coordination_retry: RetryPolicy::fixed(3, Duration::from_millis(200)),
        }
    }
}

impl OrchestratorConfig {
    /// Load from process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup (tests, config files flattened to env form).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        cfg.stores.database_url = lookup("DATABASE_URL");
        if let Some(url) = lookup("REDIS_URL") {
            cfg.stores.redis_url = url;
        }
        if let Some(prefix) = lookup("FEEDSYNC_KEY_PREFIX") {
            cfg.stores.key_prefix = prefix;
        }

        cfg.slots.max_slots = parse_or(&lookup, "FEEDSYNC_MAX_SLOTS", cfg.slots.max_slots)?;
        if cfg.slots.max_slots == 0 {
            return Err(ConfigError::Invalid {
                key: "FEEDSYNC_MAX_SLOTS",
                value: "0".to_string(),
                reason: "at least one slot is required".to_string(),
            });
        }
        cfg.slots.slot_ttl = secs_or(&lookup, "FEEDSYNC_SLOT_TTL_SECS", cfg.slots.slot_ttl)?;
        cfg.slots.stall_threshold =
            secs_or(&lookup, "FEEDSYNC_STALL_THRESHOLD_SECS", cfg.slots.stall_threshold)?;
        cfg.slots.cleanup_lock_ttl =
            secs_or(&lookup, "FEEDSYNC_CLEANUP_LOCK_TTL_SECS", cfg.slots.cleanup_lock_ttl)?;

        let activity = secs_or(&lookup, "FEEDSYNC_ACTIVITY_WINDOW_SECS", cfg.slots.activity_window)?;
        cfg.slots.activity_window = activity;
        cfg.heartbeat.activity_window = activity;

        cfg.heartbeat.stuck_threshold = secs_or(
            &lookup,
            "FEEDSYNC_HEARTBEAT_STUCK_SECS",
            cfg.heartbeat.stuck_threshold,
        )?;
        cfg.heartbeat.renew_interval = secs_or(
            &lookup,
            "FEEDSYNC_HEARTBEAT_RENEW_SECS",
            cfg.heartbeat.renew_interval,
        )?;
        cfg.heartbeat.max_lifetime = secs_or(
            &lookup,
            "FEEDSYNC_HEARTBEAT_MAX_LIFETIME_SECS",
            cfg.heartbeat.max_lifetime,
        )?;
        let final_ttl = secs_or(
            &lookup,
            "FEEDSYNC_HEARTBEAT_FINAL_TTL_SECS",
            cfg.heartbeat.final_ttl,
        )?;
        cfg.heartbeat.final_ttl = final_ttl;
        cfg.slots.final_heartbeat_ttl = final_ttl;
        if let Some(worker_id) = lookup("FEEDSYNC_WORKER_ID") {
            cfg.heartbeat.worker_id = worker_id;
        }
        if cfg.heartbeat.max_lifetime <= cfg.heartbeat.stuck_threshold {
            tracing::warn!(
                max_lifetime_secs = cfg.heartbeat.max_lifetime.as_secs(),
                stuck_threshold_secs = cfg.heartbeat.stuck_threshold.as_secs(),
                "heartbeat records expire before they can be detected as stuck"
            );
        }

        cfg.max_attempts = parse_or(&lookup, "FEEDSYNC_MAX_ATTEMPTS", cfg.max_attempts)?;
        cfg.retry_delay = secs_or(&lookup, "FEEDSYNC_RETRY_DELAY_SECS", cfg.retry_delay)?;
        cfg.maintenance_interval = secs_or(
            &lookup,
            "FEEDSYNC_MAINTENANCE_INTERVAL_SECS",
            cfg.maintenance_interval,
        )?;

        if let Some(raw) = lookup("FEEDSYNC_TRANSITION_POLICY") {
            cfg.transition_policy = raw.parse().map_err(|e: feedsync_core::DomainError| {
                ConfigError::Invalid {
                    key: "FEEDSYNC_TRANSITION_POLICY",
                    value: raw.clone(),
                    reason: e.to_string(),
                }
            })?;
        }

        Ok(cfg)
    }

    pub fn database_url(&self) -> Result<&str, ConfigError> {
        self.stores
            .database_url
            .as_deref()
            .ok_or(ConfigError::Missing("DATABASE_URL"))
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

fn secs_or<F>(lookup: &F, key: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    parse_or(lookup, key, default.as_secs()).map(Duration::from_secs)
}

fn default_worker_id() -> String {
    format!("worker-{}", std::process::id())
}
