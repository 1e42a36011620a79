//! Job repository backed by Redis.
//!
//! Layout under the configured prefix `P`:
//!
//! | key                      | type | content                                    |
//! |--------------------------|------|--------------------------------------------|
//! | `P:job:{id}`             | hash | `state`, `payload`, `version`, `lease`, `rank` |
//! | `P:waiting`              | zset | eligible queued jobs, score = rank         |
//! | `P:delayed`              | zset | queued jobs not yet eligible, score = run_after ms |
//! | `P:active`               | zset | leased jobs, score = last heartbeat ms     |
//! | `P:finished:{status}`    | zset | terminal jobs, score = finish time ms      |
//! | `P:status:{status}`      | set  | job ids per status                         |
//!
//! Every state change is a Lua script, so the version check, the lease check
//! and the index bookkeeping commit together.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use tracing::{debug, info, warn};
use tubeq_models::{DownloadJob, JobId, JobStatus, Priority, QueueStats};

use crate::error::{QueueError, QueueResult};
use crate::job::JobPayload;
use crate::repository::{
    keeps_lease, CleanupReport, LeaseToken, QueueRepository, Reservation, RetentionPolicy,
    Transition, MAX_CAS_ATTEMPTS,
};

/// Width of one priority band in the waiting rank.
const PRIORITY_BAND: f64 = 1e13;

/// Delayed jobs promoted per reservation attempt.
const PROMOTE_BATCH: usize = 100;

/// Storage backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueBackend {
    Redis,
    Memory,
}

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Redis URL
    pub redis_url: String,
    /// Prefix for every key and channel
    pub prefix: String,
    pub backend: QueueBackend,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            prefix: "tubeq".to_string(),
            backend: QueueBackend::Redis,
        }
    }
}

impl QueueConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            prefix: std::env::var("QUEUE_PREFIX").unwrap_or_else(|_| "tubeq".to_string()),
            backend: match std::env::var("QUEUE_BACKEND").as_deref() {
                Ok("memory") => QueueBackend::Memory,
                _ => QueueBackend::Redis,
            },
        }
    }
}

const UPDATE_SCRIPT: &str = r#"
local version = redis.call('HGET', KEYS[1], 'version')
if not version then return -1 end
if version ~= ARGV[1] then return -2 end
if ARGV[2] ~= '' and redis.call('HGET', KEYS[1], 'lease') ~= ARGV[2] then return -3 end
local next_version = tonumber(version) + 1
redis.call('HSET', KEYS[1], 'state', ARGV[4], 'version', next_version)
if ARGV[5] ~= '' then redis.call('HSET', KEYS[1], 'payload', ARGV[5]) end
if ARGV[6] ~= '' then redis.call('HSET', KEYS[1], 'rank', ARGV[6]) end
if ARGV[3] == 'drop' then redis.call('HDEL', KEYS[1], 'lease') end
local i = 7
while i + 3 <= #ARGV do
  local op, key, score, member = ARGV[i], ARGV[i + 1], ARGV[i + 2], ARGV[i + 3]
  if op == 'ZADD' then redis.call('ZADD', key, score, member)
  elseif op == 'ZREM' then redis.call('ZREM', key, member)
  elseif op == 'SADD' then redis.call('SADD', key, member)
  elseif op == 'SREM' then redis.call('SREM', key, member)
  end
  i = i + 4
end
return next_version
"#;

const RESERVE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[4]))
for _, id in ipairs(due) do
  redis.call('ZREM', KEYS[2], id)
  local rank = redis.call('HGET', ARGV[3] .. id, 'rank')
  if rank then redis.call('ZADD', KEYS[1], rank, id) end
end
while true do
  local popped = redis.call('ZPOPMIN', KEYS[1])
  if #popped == 0 then return false end
  local id = popped[1]
  local key = ARGV[3] .. id
  if redis.call('EXISTS', key) == 1 and not redis.call('HGET', key, 'lease') then
    redis.call('HSET', key, 'lease', ARGV[2])
    redis.call('ZADD', KEYS[3], ARGV[1], id)
    return {id, redis.call('HGET', key, 'state')}
  end
end
"#;

const HEARTBEAT_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'lease') ~= ARGV[1] then return false end
redis.call('ZADD', KEYS[2], 'XX', ARGV[2], ARGV[3])
return redis.call('HGET', KEYS[1], 'state')
"#;

const CLAIM_SCRIPT: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[3]))
local out = {}
for _, id in ipairs(ids) do
  local key = ARGV[4] .. id
  if redis.call('EXISTS', key) == 1 and redis.call('HGET', key, 'lease') then
    local lease = ARGV[5] .. ':' .. id
    redis.call('HSET', key, 'lease', lease)
    redis.call('ZADD', KEYS[1], ARGV[2], id)
    table.insert(out, id)
    table.insert(out, lease)
    table.insert(out, redis.call('HGET', key, 'state'))
  else
    redis.call('ZREM', KEYS[1], id)
  end
end
return out
"#;

const RELEASE_SCRIPT: &str = r#"
local lease = redis.call('HGET', KEYS[1], 'lease')
if lease and lease ~= ARGV[1] then return 0 end
if lease then redis.call('HDEL', KEYS[1], 'lease') end
redis.call('ZREM', KEYS[2], ARGV[2])
if redis.call('SISMEMBER', KEYS[4], ARGV[2]) == 1
   and not redis.call('ZSCORE', KEYS[5], ARGV[2]) then
  local rank = redis.call('HGET', KEYS[1], 'rank')
  if rank then redis.call('ZADD', KEYS[3], rank, ARGV[2]) end
end
return 1
"#;

/// One index change committed with a snapshot.
#[derive(Debug, Clone, PartialEq)]
enum IndexOp {
    ZAdd { key: String, score: f64 },
    ZRem { key: String },
    SAdd { key: String },
    SRem { key: String },
}

/// Key builder for one prefix.
#[derive(Debug, Clone)]
struct Keys {
    prefix: String,
}

impl Keys {
    fn job_prefix(&self) -> String {
        format!("{}:job:", self.prefix)
    }

    fn job(&self, id: &JobId) -> String {
        format!("{}:job:{}", self.prefix, id)
    }

    fn waiting(&self) -> String {
        format!("{}:waiting", self.prefix)
    }

    fn delayed(&self) -> String {
        format!("{}:delayed", self.prefix)
    }

    fn active(&self) -> String {
        format!("{}:active", self.prefix)
    }

    fn finished(&self, status: JobStatus) -> String {
        format!("{}:finished:{}", self.prefix, status)
    }

    fn status(&self, status: JobStatus) -> String {
        format!("{}:status:{}", self.prefix, status)
    }
}

/// Waiting rank: higher priority first, then earlier enqueue time.
///
/// `run_after` only decides when a job enters `waiting`, never its place in it.
fn rank(job: &DownloadJob) -> f64 {
    let band = (Priority::High as u8 - job.priority as u8) as f64;
    band * PRIORITY_BAND + job.created_at.timestamp_millis() as f64
}

fn millis(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64
}

/// Index changes that move `old` to `new`.
fn index_ops(keys: &Keys, old: &DownloadJob, new: &DownloadJob, now: DateTime<Utc>) -> Vec<IndexOp> {
    let mut ops = Vec::new();

    if old.status != new.status {
        ops.push(IndexOp::SRem {
            key: keys.status(old.status),
        });
        ops.push(IndexOp::SAdd {
            key: keys.status(new.status),
        });
    }

    if old.status == JobStatus::Queued {
        ops.push(IndexOp::ZRem { key: keys.waiting() });
        ops.push(IndexOp::ZRem { key: keys.delayed() });
    }
    if !new.status.is_reserved() {
        ops.push(IndexOp::ZRem { key: keys.active() });
    }

    match new.status {
        JobStatus::Queued if new.run_after <= now => ops.push(IndexOp::ZAdd {
            key: keys.waiting(),
            score: rank(new),
        }),
        JobStatus::Queued => ops.push(IndexOp::ZAdd {
            key: keys.delayed(),
            score: millis(new.run_after),
        }),
        JobStatus::Downloading | JobStatus::Paused if !old.status.is_reserved() => {
            ops.push(IndexOp::ZAdd {
                key: keys.active(),
                score: millis(now),
            })
        }
        status if status.is_terminal() => ops.push(IndexOp::ZAdd {
            key: keys.finished(status),
            score: millis(new.updated_at),
        }),
        _ => {}
    }

    ops
}

/// Snapshot read back from the hash.
struct Stored {
    job: DownloadJob,
    version: String,
    lease: Option<String>,
}

/// Redis implementation of [`QueueRepository`].
pub struct RedisQueue {
    conn: MultiplexedConnection,
    keys: Keys,
    update_script: Script,
    reserve_script: Script,
    heartbeat_script: Script,
    claim_script: Script,
    release_script: Script,
}

impl RedisQueue {
    /// Connect and verify the server answers.
    pub async fn connect(config: &QueueConfig) -> QueueResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::connection_failed(e.to_string()))?;
        redis::cmd("PING")
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| QueueError::connection_failed(e.to_string()))?;

        info!(prefix = %config.prefix, "Connected Redis job repository");
        Ok(Self {
            conn,
            keys: Keys {
                prefix: config.prefix.clone(),
            },
            update_script: Script::new(UPDATE_SCRIPT),
            reserve_script: Script::new(RESERVE_SCRIPT),
            heartbeat_script: Script::new(HEARTBEAT_SCRIPT),
            claim_script: Script::new(CLAIM_SCRIPT),
            release_script: Script::new(RELEASE_SCRIPT),
        })
    }

    /// Create from environment variables.
    pub async fn from_env() -> QueueResult<Self> {
        Self::connect(&QueueConfig::from_env()).await
    }

    fn decode(&self, id: &JobId, state: Option<&str>, payload: Option<&str>) -> QueueResult<DownloadJob> {
        if let Some(state) = state {
            match serde_json::from_str::<DownloadJob>(state) {
                Ok(job) => return Ok(job),
                Err(e) => warn!(job_id = %id, error = %e, "Unreadable job snapshot, rebuilding from payload"),
            }
        }
        let payload = payload.ok_or_else(|| QueueError::Corrupt(id.to_string()))?;
        let payload: JobPayload = serde_json::from_str(payload)?;
        Ok(payload.rebuild())
    }

    async fn load(&self, id: &JobId) -> QueueResult<Option<Stored>> {
        let mut conn = self.conn.clone();
        let (state, payload, version, lease): (
            Option<String>,
            Option<String>,
            Option<String>,
            Option<String>,
        ) = redis::cmd("HMGET")
            .arg(self.keys.job(id))
            .arg("state")
            .arg("payload")
            .arg("version")
            .arg("lease")
            .query_async(&mut conn)
            .await?;

        let Some(version) = version else {
            return Ok(None);
        };
        let job = self.decode(id, state.as_deref(), payload.as_deref())?;
        Ok(Some(Stored { job, version, lease }))
    }

    async fn load_many(&self, ids: &[String]) -> QueueResult<Vec<DownloadJob>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for id in ids {
            pipe.cmd("HMGET")
                .arg(self.keys.job(&JobId::from_string(id.clone())))
                .arg("state")
                .arg("payload");
        }
        let rows: Vec<(Option<String>, Option<String>)> = pipe.query_async(&mut conn).await?;

        let mut jobs = Vec::with_capacity(rows.len());
        for (id, (state, payload)) in ids.iter().zip(rows) {
            if state.is_none() && payload.is_none() {
                continue;
            }
            let id = JobId::from_string(id.clone());
            match self.decode(&id, state.as_deref(), payload.as_deref()) {
                Ok(job) => jobs.push(job),
                Err(e) => warn!(job_id = %id, error = %e, "Skipping unreadable job"),
            }
        }
        Ok(jobs)
    }

    fn parse_job(&self, id: &JobId, state: &str) -> QueueResult<DownloadJob> {
        self.decode(id, Some(state), None)
    }
}

#[async_trait]
impl QueueRepository for RedisQueue {
    async fn add_job(&self, job: DownloadJob) -> QueueResult<JobId> {
        let mut conn = self.conn.clone();
        let id = job.id.clone();
        let key = self.keys.job(&id);
        let state = serde_json::to_string(&job)?;
        let payload = serde_json::to_string(&JobPayload::from_job(&job))?;
        let now = Utc::now();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset_multiple(
                &key,
                &[
                    ("state", state),
                    ("payload", payload),
                    ("version", "1".to_string()),
                    ("rank", rank(&job).to_string()),
                ],
            )
            .ignore()
            .sadd(self.keys.status(job.status), id.as_str())
            .ignore();
        if job.run_after <= now {
            pipe.zadd(self.keys.waiting(), id.as_str(), rank(&job)).ignore();
        } else {
            pipe.zadd(self.keys.delayed(), id.as_str(), millis(job.run_after))
                .ignore();
        }
        pipe.query_async::<()>(&mut conn).await?;

        debug!(job_id = %id, priority = ?job.priority, "Enqueued job");
        Ok(id)
    }

    async fn get_job_by_id(&self, id: &JobId) -> QueueResult<Option<DownloadJob>> {
        Ok(self.load(id).await?.map(|stored| stored.job))
    }

    async fn get_jobs_by_status(&self, status: JobStatus) -> QueueResult<Vec<DownloadJob>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.smembers(self.keys.status(status)).await?;
        let mut jobs = self.load_many(&ids).await?;
        jobs.retain(|job| job.status == status);
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    async fn count_active(&self) -> QueueResult<usize> {
        let mut conn = self.conn.clone();
        let (queued, downloading): (usize, usize) = redis::pipe()
            .scard(self.keys.status(JobStatus::Queued))
            .scard(self.keys.status(JobStatus::Downloading))
            .query_async(&mut conn)
            .await?;
        Ok(queued + downloading)
    }

    async fn get_queue_stats(&self) -> QueueResult<QueueStats> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for status in JobStatus::ALL {
            pipe.scard(self.keys.status(status));
        }
        let counts: Vec<u64> = pipe.query_async(&mut conn).await?;

        Ok(QueueStats {
            waiting: counts[0],
            active: counts[1],
            paused: counts[2],
            completed: counts[3],
            failed: counts[4],
            cancelled: counts[5],
        })
    }

    async fn cleanup_finished(
        &self,
        retention: &RetentionPolicy,
        now: DateTime<Utc>,
    ) -> QueueResult<CleanupReport> {
        let mut conn = self.conn.clone();
        let mut report = CleanupReport::default();

        for status in [JobStatus::Completed, JobStatus::Cancelled, JobStatus::Failed] {
            let (Some((_, batch)), Some(cutoff)) =
                (retention.rule(status), retention.cutoff(status, now))
            else {
                continue;
            };
            let finished = self.keys.finished(status);

            // Exclusive upper bound: never evict a job exactly at the threshold
            let ids: Vec<String> = redis::cmd("ZRANGEBYSCORE")
                .arg(&finished)
                .arg("-inf")
                .arg(format!("({}", millis(cutoff)))
                .arg("LIMIT")
                .arg(0)
                .arg(batch)
                .query_async(&mut conn)
                .await?;
            if ids.is_empty() {
                continue;
            }

            let mut pipe = redis::pipe();
            pipe.atomic();
            for id in &ids {
                pipe.del(self.keys.job(&JobId::from_string(id.clone())))
                    .ignore()
                    .zrem(&finished, id)
                    .ignore()
                    .srem(self.keys.status(status), id)
                    .ignore();
            }
            pipe.query_async::<()>(&mut conn).await?;
            report.record(status, ids.len());
        }

        if report.total() > 0 {
            info!(
                completed = report.completed,
                failed = report.failed,
                cancelled = report.cancelled,
                "Evicted finished jobs"
            );
        }
        Ok(report)
    }

    async fn reserve_next(&self, worker: &str) -> QueueResult<Option<Reservation>> {
        let mut conn = self.conn.clone();
        let lease = LeaseToken::new();
        let now = Utc::now();

        let reserved: Option<(String, String)> = self
            .reserve_script
            .key(self.keys.waiting())
            .key(self.keys.delayed())
            .key(self.keys.active())
            .arg(now.timestamp_millis())
            .arg(lease.as_str())
            .arg(self.keys.job_prefix())
            .arg(PROMOTE_BATCH)
            .invoke_async(&mut conn)
            .await?;

        let Some((id, state)) = reserved else {
            return Ok(None);
        };
        let id = JobId::from_string(id);
        debug!(job_id = %id, worker = %worker, "Reserved job");
        Ok(Some(Reservation {
            job: self.parse_job(&id, &state)?,
            lease,
        }))
    }

    async fn modify(
        &self,
        id: &JobId,
        lease: Option<&LeaseToken>,
        transition: Transition<'_>,
    ) -> QueueResult<DownloadJob> {
        let key = self.keys.job(id);

        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let stored = self.load(id).await?.ok_or_else(|| QueueError::not_found(id))?;
            if let Some(lease) = lease {
                if stored.lease.as_deref() != Some(lease.as_str()) {
                    return Err(QueueError::lease_lost(id));
                }
            }

            let next = transition(&stored.job)?;
            let drops_lease = stored.lease.is_some() && !keeps_lease(&next);
            if next == stored.job && !drops_lease {
                return Ok(next);
            }

            let now = Utc::now();
            let state = serde_json::to_string(&next)?;
            let payload = if next.retry_count != stored.job.retry_count {
                serde_json::to_string(&JobPayload::from_job(&next))?
            } else {
                String::new()
            };
            let next_rank = if next.status == JobStatus::Queued {
                rank(&next).to_string()
            } else {
                String::new()
            };

            let mut invocation = self.update_script.key(&key);
            invocation
                .arg(&stored.version)
                .arg(lease.map(|l| l.as_str()).unwrap_or(""))
                .arg(if keeps_lease(&next) { "keep" } else { "drop" })
                .arg(&state)
                .arg(&payload)
                .arg(&next_rank);
            for op in index_ops(&self.keys, &stored.job, &next, now) {
                match op {
                    IndexOp::ZAdd { key, score } => {
                        invocation.arg("ZADD").arg(key).arg(score).arg(id.as_str())
                    }
                    IndexOp::ZRem { key } => invocation.arg("ZREM").arg(key).arg("").arg(id.as_str()),
                    IndexOp::SAdd { key } => invocation.arg("SADD").arg(key).arg("").arg(id.as_str()),
                    IndexOp::SRem { key } => invocation.arg("SREM").arg(key).arg("").arg(id.as_str()),
                };
            }

            let mut conn = self.conn.clone();
            let result: i64 = invocation.invoke_async(&mut conn).await?;
            match result {
                -1 => return Err(QueueError::not_found(id)),
                -2 => {
                    debug!(job_id = %id, attempt, "Version conflict, retrying");
                    continue;
                }
                -3 => return Err(QueueError::lease_lost(id)),
                _ => return Ok(next),
            }
        }

        Err(QueueError::Contention(id.to_string()))
    }

    async fn heartbeat(&self, id: &JobId, lease: &LeaseToken) -> QueueResult<DownloadJob> {
        let mut conn = self.conn.clone();
        let state: Option<String> = self
            .heartbeat_script
            .key(self.keys.job(id))
            .key(self.keys.active())
            .arg(lease.as_str())
            .arg(Utc::now().timestamp_millis())
            .arg(id.as_str())
            .invoke_async(&mut conn)
            .await?;

        match state {
            Some(state) => self.parse_job(id, &state),
            None => Err(QueueError::lease_lost(id)),
        }
    }

    async fn claim_stalled(
        &self,
        worker: &str,
        idle: Duration,
        limit: usize,
    ) -> QueueResult<Vec<Reservation>> {
        let mut conn = self.conn.clone();
        let now = Utc::now();
        let idle = chrono::Duration::from_std(idle).unwrap_or(chrono::Duration::zero());
        let cutoff = now - idle;

        let flat: Vec<String> = self
            .claim_script
            .key(self.keys.active())
            .arg(cutoff.timestamp_millis())
            .arg(now.timestamp_millis())
            .arg(limit)
            .arg(self.keys.job_prefix())
            .arg(LeaseToken::new().as_str())
            .invoke_async(&mut conn)
            .await?;

        let mut claimed = Vec::new();
        for chunk in flat.chunks_exact(3) {
            let id = JobId::from_string(chunk[0].clone());
            match self.parse_job(&id, &chunk[2]) {
                Ok(job) => {
                    debug!(job_id = %id, worker = %worker, "Claimed stalled job");
                    claimed.push(Reservation {
                        job,
                        lease: LeaseToken::from_string(chunk[1].clone()),
                    });
                }
                Err(e) => warn!(job_id = %id, error = %e, "Claimed job is unreadable"),
            }
        }
        Ok(claimed)
    }

    async fn release(&self, id: &JobId, lease: &LeaseToken) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = self
            .release_script
            .key(self.keys.job(id))
            .key(self.keys.active())
            .key(self.keys.waiting())
            .key(self.keys.status(JobStatus::Queued))
            .key(self.keys.delayed())
            .arg(lease.as_str())
            .arg(id.as_str())
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }
}
