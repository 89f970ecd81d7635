//! Redis-backed coordination store.
//!
//! ## Key layout
//!
//! - `{prefix}:slots:active`: set of admitted integration ids
//! - `{prefix}:slots:expiry`: hash id → absolute expiry (epoch ms)
//! - `{prefix}:slots:count`: cached counter
//! - `{prefix}:heartbeat:live:{id}`: hash, TTL = max lifetime
//! - `{prefix}:heartbeat:final:{id}`: JSON tombstone, short TTL
//! - `{prefix}:lock:{name}`: owner token, TTL
//!
//! Slot mutations run as Lua scripts (EVALSHA with automatic script loading), so
//! concurrent workers can never both observe room for the last slot.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::Script;
use redis::aio::MultiplexedConnection;
use tokio::sync::OnceCell;
use tracing::{instrument, warn};

use feedsync_core::IntegrationId;

use super::{
    CoordinationError, CoordinationStore, FinalHeartbeat, HeartbeatListing, HeartbeatRecord,
    HeartbeatTouch, SlotAdmission, SlotMember, SlotSnapshot,
};

/// KEYS: active, expiry, count. ARGV: id, now_ms, ttl_ms, max.
/// Returns {code, active}: 1 admitted, 0 ceiling reached, -1 already active.
const ACQUIRE_SCRIPT: &str = r#"
local id = ARGV[1]
local now = tonumber(ARGV[2])
local ttl = tonumber(ARGV[3])
local max = tonumber(ARGV[4])

local exp = redis.call('HGET', KEYS[2], id)
local member = redis.call('SISMEMBER', KEYS[1], id)
if exp and tonumber(exp) > now and member == 1 then
  redis.call('SREM', KEYS[1], id)
  redis.call('HDEL', KEYS[2], id)
elseif exp and tonumber(exp) <= now then
  redis.call('SREM', KEYS[1], id)
  redis.call('HDEL', KEYS[2], id)
elseif (not exp) and member == 1 then
  return {-1, redis.call('SCARD', KEYS[1])}
end

local live = 0
local members = redis.call('SMEMBERS', KEYS[1])
for _, m in ipairs(members) do
  local e = redis.call('HGET', KEYS[2], m)
  if e and tonumber(e) <= now then
    redis.call('SREM', KEYS[1], m)
    redis.call('HDEL', KEYS[2], m)
  else
    live = live + 1
  end
end

if live >= max then
  redis.call('SET', KEYS[3], live)
  return {0, live}
end

redis.call('SADD', KEYS[1], id)
redis.call('HSET', KEYS[2], id, now + ttl)
redis.call('SET', KEYS[3], live + 1)
return {1, live + 1}
"#;

/// KEYS: active, expiry, count. ARGV: id. Returns the resynced count.
const RELEASE_SCRIPT: &str = r#"
redis.call('SREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
local n = redis.call('SCARD', KEYS[1])
redis.call('SET', KEYS[3], n)
return n
"#;

/// KEYS: active, expiry, count. ARGV: id, expected expiry (epoch ms).
/// Returns 1 when the admission was removed, 0 when the member is gone or holds
/// a different expiry.
const RELEASE_ADMISSION_SCRIPT: &str = r#"
local exp = redis.call('HGET', KEYS[2], ARGV[1])
if (not exp) or tonumber(exp) ~= tonumber(ARGV[2]) then
  return 0
end
redis.call('SREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('SET', KEYS[3], redis.call('SCARD', KEYS[1]))
return 1
"#;

/// KEYS: active, expiry, count. ARGV: now_ms, evict_unbounded ("1"/"0").
/// Returns the evicted ids.
const EVICT_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local evicted = {}

local entries = redis.call('HGETALL', KEYS[2])
for i = 1, #entries, 2 do
  local id = entries[i]
  if tonumber(entries[i + 1]) <= now then
    redis.call('SREM', KEYS[1], id)
    redis.call('HDEL', KEYS[2], id)
    table.insert(evicted, id)
  end
end

if ARGV[2] == '1' then
  local members = redis.call('SMEMBERS', KEYS[1])
  for _, m in ipairs(members) do
    if redis.call('HEXISTS', KEYS[2], m) == 0 then
      redis.call('SREM', KEYS[1], m)
      table.insert(evicted, m)
    end
  end
end

redis.call('SET', KEYS[3], redis.call('SCARD', KEYS[1]))
return evicted
"#;

/// KEYS: heartbeat. ARGV: at_ms, step, progress, extend_ms (0 = keep TTL).
const TOUCH_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return false
end
redis.call('HSET', KEYS[1], 'last_heartbeat', ARGV[1], 'current_step', ARGV[2], 'progress', ARGV[3])
redis.call('HINCRBY', KEYS[1], 'update_count', 1)
if tonumber(ARGV[4]) > 0 then
  redis.call('HSET', KEYS[1], 'last_renewed_at', ARGV[1])
  redis.call('PEXPIRE', KEYS[1], ARGV[4])
end
return redis.call('HGETALL', KEYS[1])
"#;

/// KEYS: lock. ARGV: owner.
const UNLOCK_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

impl From<redis::RedisError> for CoordinationError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
            || err.is_timeout()
        {
            CoordinationError::Connection(err.to_string())
        } else {
            CoordinationError::Command(err.to_string())
        }
    }
}

#[derive(Debug, Clone)]
struct KeySpace {
    prefix: String,
    active: String,
    expiry: String,
    count: String,
}

impl KeySpace {
    fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            active: format!("{prefix}:slots:active"),
            expiry: format!("{prefix}:slots:expiry"),
            count: format!("{prefix}:slots:count"),
        }
    }

    fn heartbeat(&self, id: IntegrationId) -> String {
        format!("{}:heartbeat:live:{id}", self.prefix)
    }

    fn heartbeat_pattern(&self) -> String {
        format!("{}:heartbeat:live:*", self.prefix)
    }

    fn final_heartbeat(&self, id: IntegrationId) -> String {
        format!("{}:heartbeat:final:{id}", self.prefix)
    }

    fn lock(&self, name: &str) -> String {
        format!("{}:lock:{name}", self.prefix)
    }
}

/// Redis implementation of [`CoordinationStore`].
pub struct RedisCoordinationStore {
    client: redis::Client,
    conn: OnceCell<MultiplexedConnection>,
    keys: KeySpace,
    acquire: Script,
    release: Script,
    release_admission: Script,
    evict: Script,
    touch: Script,
    unlock: Script,
}

impl std::fmt::Debug for RedisCoordinationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCoordinationStore")
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}

impl RedisCoordinationStore {
    /// Create a store for `redis_url` (e.g. "redis://localhost:6379").
    ///
    /// The connection is opened lazily on first use.
    pub fn new(redis_url: impl AsRef<str>, key_prefix: &str) -> Result<Self, CoordinationError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| CoordinationError::Connection(e.to_string()))?;

        Ok(Self {
            client,
            conn: OnceCell::new(),
            keys: KeySpace::new(key_prefix),
            acquire: Script::new(ACQUIRE_SCRIPT),
            release: Script::new(RELEASE_SCRIPT),
            release_admission: Script::new(RELEASE_ADMISSION_SCRIPT),
            evict: Script::new(EVICT_SCRIPT),
            touch: Script::new(TOUCH_SCRIPT),
            unlock: Script::new(UNLOCK_SCRIPT),
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, CoordinationError> {
        let conn = self
            .conn
            .get_or_try_init(|| async {
                self.client
                    .get_multiplexed_async_connection()
                    .await
                    .map_err(|e| CoordinationError::Connection(e.to_string()))
            })
            .await?;
        Ok(conn.clone())
    }
}

fn parse_id(raw: &str) -> Option<IntegrationId> {
    match IntegrationId::from_str(raw) {
        Ok(id) => Some(id),
        Err(e) => {
            warn!(raw, error = %e, "ignoring undecodable integration id in coordination store");
            None
        }
    }
}

fn millis_to_datetime(raw: &str) -> Option<DateTime<Utc>> {
    raw.parse::<i64>().ok().and_then(DateTime::from_timestamp_millis)
}

fn record_fields(record: &HeartbeatRecord) -> Vec<(&'static str, String)> {
    vec![
        ("integration_id", record.integration_id.to_string()),
        ("worker_id", record.worker_id.clone()),
        ("started_at", record.started_at.timestamp_millis().to_string()),
        ("last_heartbeat", record.last_heartbeat.timestamp_millis().to_string()),
        ("last_renewed_at", record.last_renewed_at.timestamp_millis().to_string()),
        ("current_step", record.current_step.clone()),
        (
            "progress",
            record.progress.map(|p| p.to_string()).unwrap_or_default(),
        ),
        ("update_count", record.update_count.to_string()),
    ]
}

fn record_from_fields(fields: &HashMap<String, String>) -> Result<HeartbeatRecord, CoordinationError> {
    let get = |name: &str| {
        fields
            .get(name)
            .ok_or_else(|| CoordinationError::Malformed(format!("heartbeat missing field {name}")))
    };
    let time = |name: &str| {
        get(name).and_then(|raw| {
            millis_to_datetime(raw)
                .ok_or_else(|| CoordinationError::Malformed(format!("heartbeat field {name}: {raw}")))
        })
    };

    let integration_id = IntegrationId::from_str(get("integration_id")?)
        .map_err(|e| CoordinationError::Malformed(e.to_string()))?;
    let progress = match fields.get("progress").map(String::as_str) {
        None | Some("") => None,
        Some(raw) => Some(
            raw.parse::<u8>()
                .map_err(|_| CoordinationError::Malformed(format!("heartbeat progress: {raw}")))?,
        ),
    };
    let update_count = get("update_count")?
        .parse::<u64>()
        .map_err(|e| CoordinationError::Malformed(format!("heartbeat update_count: {e}")))?;

    Ok(HeartbeatRecord {
        integration_id,
        worker_id: get("worker_id")?.clone(),
        started_at: time("started_at")?,
        last_heartbeat: time("last_heartbeat")?,
        last_renewed_at: time("last_renewed_at")?,
        current_step: get("current_step")?.clone(),
        progress,
        update_count,
    })
}

fn pairs_to_map(flat: Vec<String>) -> HashMap<String, String> {
    let mut map = HashMap::with_capacity(flat.len() / 2);
    let mut it = flat.into_iter();
    while let (Some(k), Some(v)) = (it.next(), it.next()) {
        map.insert(k, v);
    }
    map
}

#[async_trait]
impl CoordinationStore for RedisCoordinationStore {
    #[instrument(skip(self), fields(integration_id = %integration_id), err)]
    async fn acquire_slot(
        &self,
        integration_id: IntegrationId,
        now: DateTime<Utc>,
        ttl: Duration,
        max_slots: usize,
    ) -> Result<SlotAdmission, CoordinationError> {
        let mut conn = self.connection().await?;
        let expires_ms = now.timestamp_millis() + ttl.as_millis() as i64;
        let reply: Vec<i64> = self
            .acquire
            .key(&self.keys.active)
            .key(&self.keys.expiry)
            .key(&self.keys.count)
            .arg(integration_id.to_string())
            .arg(now.timestamp_millis())
            .arg(ttl.as_millis() as i64)
            .arg(max_slots as i64)
            .invoke_async(&mut conn)
            .await?;

        let (code, active) = match reply.as_slice() {
            [code, active] => (*code, (*active).max(0) as usize),
            other => {
                return Err(CoordinationError::Malformed(format!(
                    "unexpected acquire reply: {other:?}"
                )));
            }
        };
        Ok(match code {
            1 => SlotAdmission::Admitted {
                active,
                expires_at: DateTime::from_timestamp_millis(expires_ms).ok_or_else(|| {
                    CoordinationError::Malformed(format!("slot expiry out of range: {expires_ms}"))
                })?,
            },
            0 => SlotAdmission::CeilingReached { active },
            _ => SlotAdmission::AlreadyActive,
        })
    }

    #[instrument(skip(self), fields(integration_id = %integration_id), err)]
    async fn release_slot(&self, integration_id: IntegrationId) -> Result<usize, CoordinationError> {
        let mut conn = self.connection().await?;
        let count: i64 = self
            .release
            .key(&self.keys.active)
            .key(&self.keys.expiry)
            .key(&self.keys.count)
            .arg(integration_id.to_string())
            .invoke_async(&mut conn)
            .await?;
        Ok(count.max(0) as usize)
    }

    #[instrument(skip(self), fields(integration_id = %integration_id), err)]
    async fn release_admission(
        &self,
        integration_id: IntegrationId,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, CoordinationError> {
        let mut conn = self.connection().await?;
        let removed: i64 = self
            .release_admission
            .key(&self.keys.active)
            .key(&self.keys.expiry)
            .key(&self.keys.count)
            .arg(integration_id.to_string())
            .arg(expires_at.timestamp_millis().to_string())
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    async fn force_release_slot(
        &self,
        integration_id: IntegrationId,
    ) -> Result<usize, CoordinationError> {
        let mut conn = self.connection().await?;
        let id = integration_id.to_string();

        let _: i64 = redis::cmd("SREM")
            .arg(&self.keys.active)
            .arg(&id)
            .query_async(&mut conn)
            .await?;
        let _: i64 = redis::cmd("HDEL")
            .arg(&self.keys.expiry)
            .arg(&id)
            .query_async(&mut conn)
            .await?;
        let count: i64 = redis::cmd("SCARD")
            .arg(&self.keys.active)
            .query_async(&mut conn)
            .await?;
        let _: () = redis::cmd("SET")
            .arg(&self.keys.count)
            .arg(count)
            .query_async(&mut conn)
            .await?;
        Ok(count.max(0) as usize)
    }

    #[instrument(skip(self), err)]
    async fn evict_expired_slots(
        &self,
        now: DateTime<Utc>,
        evict_unbounded: bool,
    ) -> Result<Vec<IntegrationId>, CoordinationError> {
        let mut conn = self.connection().await?;
        let evicted: Vec<String> = self
            .evict
            .key(&self.keys.active)
            .key(&self.keys.expiry)
            .key(&self.keys.count)
            .arg(now.timestamp_millis())
            .arg(if evict_unbounded { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await?;
        Ok(evicted.iter().filter_map(|raw| parse_id(raw)).collect())
    }

    async fn slot_snapshot(&self) -> Result<SlotSnapshot, CoordinationError> {
        let mut conn = self.connection().await?;
        let (members, expiry, count): (Vec<String>, HashMap<String, String>, Option<i64>) =
            redis::pipe()
                .atomic()
                .cmd("SMEMBERS")
                .arg(&self.keys.active)
                .cmd("HGETALL")
                .arg(&self.keys.expiry)
                .cmd("GET")
                .arg(&self.keys.count)
                .query_async(&mut conn)
                .await?;

        Ok(SlotSnapshot {
            members: members
                .iter()
                .filter_map(|raw| {
                    parse_id(raw).map(|id| SlotMember {
                        integration_id: id,
                        expires_at: expiry.get(raw).and_then(|e| millis_to_datetime(e)),
                    })
                })
                .collect(),
            cached_count: count.unwrap_or(0).max(0) as usize,
        })
    }

    async fn put_heartbeat(
        &self,
        record: &HeartbeatRecord,
        ttl: Duration,
    ) -> Result<(), CoordinationError> {
        let mut conn = self.connection().await?;
        let key = self.keys.heartbeat(record.integration_id);
        let _: () = redis::pipe()
            .atomic()
            .cmd("DEL")
            .arg(&key)
            .ignore()
            .hset_multiple(&key, &record_fields(record))
            .ignore()
            .cmd("PEXPIRE")
            .arg(&key)
            .arg(ttl.as_millis() as i64)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn touch_heartbeat(
        &self,
        integration_id: IntegrationId,
        touch: &HeartbeatTouch,
    ) -> Result<Option<HeartbeatRecord>, CoordinationError> {
        let mut conn = self.connection().await?;
        let reply: Option<Vec<String>> = self
            .touch
            .key(self.keys.heartbeat(integration_id))
            .arg(touch.at.timestamp_millis())
            .arg(&touch.step)
            .arg(touch.progress.map(|p| p.to_string()).unwrap_or_default())
            .arg(touch.extend_ttl.map(|t| t.as_millis() as i64).unwrap_or(0))
            .invoke_async(&mut conn)
            .await?;

        match reply {
            None => Ok(None),
            Some(flat) => record_from_fields(&pairs_to_map(flat)).map(Some),
        }
    }

    async fn get_heartbeat(
        &self,
        integration_id: IntegrationId,
    ) -> Result<Option<HeartbeatRecord>, CoordinationError> {
        let mut conn = self.connection().await?;
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.keys.heartbeat(integration_id))
            .query_async(&mut conn)
            .await?;
        if fields.is_empty() {
            return Ok(None);
        }
        record_from_fields(&fields).map(Some)
    }

    #[instrument(skip(self), err)]
    async fn list_heartbeats(&self) -> Result<HeartbeatListing, CoordinationError> {
        let mut conn = self.connection().await?;

        let mut keys = Vec::new();
        {
            let mut scan = redis::cmd("SCAN");
            scan.cursor_arg(0)
                .arg("MATCH")
                .arg(self.keys.heartbeat_pattern())
                .arg("COUNT")
                .arg(200);
            let mut iter: redis::AsyncIter<'_, String> = scan
                .iter_async(&mut conn)
                .await?;
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
        }

        let mut listing = HeartbeatListing::default();
        for key in keys {
            let fields: Result<HashMap<String, String>, redis::RedisError> = redis::cmd("HGETALL")
                .arg(&key)
                .query_async(&mut conn)
                .await;
            match fields {
                // Expired between SCAN and HGETALL.
                Ok(fields) if fields.is_empty() => {}
                Ok(fields) => match record_from_fields(&fields) {
                    Ok(record) => listing.records.push(record),
                    Err(e) => {
                        warn!(key = %key, error = %e, "malformed heartbeat record");
                        listing.malformed_keys.push(key);
                    }
                },
                Err(e) if e.kind() == redis::ErrorKind::TypeError => {
                    listing.malformed_keys.push(key);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(listing)
    }

    async fn delete_heartbeat(
        &self,
        integration_id: IntegrationId,
    ) -> Result<bool, CoordinationError> {
        let mut conn = self.connection().await?;
        let removed: i64 = redis::cmd("DEL")
            .arg(self.keys.heartbeat(integration_id))
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn purge_heartbeat_key(&self, key: &str) -> Result<(), CoordinationError> {
        let mut conn = self.connection().await?;
        let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }

    async fn put_final_heartbeat(
        &self,
        record: &FinalHeartbeat,
        ttl: Duration,
    ) -> Result<(), CoordinationError> {
        let payload = serde_json::to_string(record)
            .map_err(|e| CoordinationError::Malformed(e.to_string()))?;
        let mut conn = self.connection().await?;
        let _: () = redis::cmd("SET")
            .arg(self.keys.final_heartbeat(record.integration_id))
            .arg(payload)
            .arg("PX")
            .arg(ttl.as_millis() as i64)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_final_heartbeat(
        &self,
        integration_id: IntegrationId,
    ) -> Result<Option<FinalHeartbeat>, CoordinationError> {
        let mut conn = self.connection().await?;
        let payload: Option<String> = redis::cmd("GET")
            .arg(self.keys.final_heartbeat(integration_id))
            .query_async(&mut conn)
            .await?;
        payload
            .map(|p| serde_json::from_str(&p).map_err(|e| CoordinationError::Malformed(e.to_string())))
            .transpose()
    }

    async fn try_lock(
        &self,
        name: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, CoordinationError> {
        let mut conn = self.connection().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.keys.lock(name))
            .arg(owner)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as i64)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn unlock(&self, name: &str, owner: &str) -> Result<(), CoordinationError> {
        let mut conn = self.connection().await?;
        let _: i64 = self
            .unlock
            .key(self.keys.lock(name))
            .arg(owner)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_fields_decode() {
        let now = DateTime::from_timestamp_millis(Utc::now().timestamp_millis()).unwrap();
        let record = HeartbeatRecord {
            integration_id: IntegrationId::new(),
            worker_id: "worker-7".to_string(),
            started_at: now,
            last_heartbeat: now,
            last_renewed_at: now,
            current_step: "parse".to_string(),
            progress: Some(40),
            update_count: 3,
        };
        let fields: HashMap<String, String> = record_fields(&record)
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        assert_eq!(record_from_fields(&fields).unwrap(), record);
    }

    #[test]
    fn missing_fields_are_malformed() {
        let mut fields = HashMap::new();
        fields.insert("integration_id".to_string(), IntegrationId::new().to_string());
        assert!(matches!(
            record_from_fields(&fields),
            Err(CoordinationError::Malformed(_))
        ));
    }

    #[test]
    fn key_layout() {
        let keys = KeySpace::new("feedsync");
        let id = IntegrationId::new();
        assert_eq!(keys.active, "feedsync:slots:active");
        assert_eq!(keys.heartbeat(id), format!("feedsync:heartbeat:live:{id}"));
        assert!(keys.heartbeat_pattern().ends_with(":heartbeat:live:*"));
        assert_eq!(keys.lock("cleanup"), "feedsync:lock:cleanup");
    }
}
