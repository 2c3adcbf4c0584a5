//! Redis-backed job store.
//!
//! Layout under the configured prefix:
//!
//! - `{prefix}:job:{id}` holds the JSON-encoded job
//! - `{prefix}:pending` is a sorted set of job ids scored by fire time in
//!   milliseconds
//!
//! Writes touching both keys run in a `MULTI` block or a Lua script, so a
//! job body and its pending entry never drift apart. A job is claimed by
//! removing its id from the sorted set inside the claim script; only one
//! caller gets it.

use crate::error::{SchedulerError, SchedulerResult};
use crate::job::ScheduledJob;
use crate::store::JobStore;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::{AsyncCommands, Client, aio::ConnectionManager};
use tracing::{debug, info, warn};

// KEYS[1] = pending set, ARGV[1] = job key prefix, ARGV[2] = job id
const REMOVE_SCRIPT: &str = r#"
    if redis.call("zrem", KEYS[1], ARGV[2]) == 0 then
        return false
    end
    local key = ARGV[1] .. ARGV[2]
    local body = redis.call("get", key)
    redis.call("del", key)
    return body
"#;

// KEYS[1] = pending set, ARGV[1] = job key prefix, ARGV[2] = now in ms.
// Replies with a flat list of id, body pairs; a missing body is "".
const CLAIM_SCRIPT: &str = r#"
    local ids = redis.call("zrangebyscore", KEYS[1], "-inf", ARGV[2])
    local claimed = {}
    for _, id in ipairs(ids) do
        redis.call("zrem", KEYS[1], id)
        local key = ARGV[1] .. id
        local body = redis.call("get", key)
        redis.call("del", key)
        table.insert(claimed, id)
        table.insert(claimed, body or "")
    end
    return claimed
"#;

/// Job store backed by Redis.
#[derive(Clone)]
pub struct RedisJobStore {
    connection: ConnectionManager,
    key_prefix: String,
}

impl RedisJobStore {
    /// Connect to Redis.
    pub async fn connect(redis_url: &str, key_prefix: impl Into<String>) -> SchedulerResult<Self> {
        let key_prefix = key_prefix.into();
        info!(prefix = %key_prefix, "Connecting job store to Redis");

        let client = Client::open(redis_url).map_err(|e| SchedulerError::Config(e.to_string()))?;
        let connection = ConnectionManager::new(client).await?;

        Ok(Self {
            connection,
            key_prefix,
        })
    }

    fn job_key(&self, id: &str) -> String {
        job_key(&self.key_prefix, id)
    }

    fn pending_key(&self) -> String {
        pending_key(&self.key_prefix)
    }
}

fn job_key_prefix(prefix: &str) -> String {
    format!("{}:job:", prefix)
}

fn job_key(prefix: &str, id: &str) -> String {
    format!("{}{}", job_key_prefix(prefix), id)
}

fn pending_key(prefix: &str) -> String {
    format!("{}:pending", prefix)
}

fn encode(job: &ScheduledJob) -> SchedulerResult<String> {
    serde_json::to_string(job).map_err(|e| SchedulerError::Serialization(e.to_string()))
}

fn decode(json: &str) -> SchedulerResult<ScheduledJob> {
    serde_json::from_str(json).map_err(|e| SchedulerError::Serialization(e.to_string()))
}

/// Decode the claim script reply, dropping entries that cannot be run.
fn decode_claimed(reply: Vec<String>) -> Vec<ScheduledJob> {
    let mut due = Vec::with_capacity(reply.len() / 2);
    let mut pairs = reply.into_iter();

    while let (Some(id), Some(body)) = (pairs.next(), pairs.next()) {
        if body.is_empty() {
            warn!(job_id = %id, "Pending id without job body");
            continue;
        }
        match decode(&body) {
            Ok(job) => due.push(job),
            Err(e) => warn!(job_id = %id, error = %e, "Dropping undecodable job"),
        }
    }

    due
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn upsert(&self, job: ScheduledJob) -> SchedulerResult<Option<ScheduledJob>> {
        let mut conn = self.connection.clone();
        let job_key = self.job_key(&job.id);
        let json = encode(&job)?;

        let (previous,): (Option<String>,) = redis::pipe()
            .atomic()
            .get(&job_key)
            .set(&job_key, json)
            .ignore()
            .zadd(self.pending_key(), &job.id, job.fire_at.timestamp_millis())
            .ignore()
            .query_async(&mut conn)
            .await?;

        previous.as_deref().map(decode).transpose()
    }

    async fn remove(&self, id: &str) -> SchedulerResult<Option<ScheduledJob>> {
        let mut conn = self.connection.clone();

        let json: Option<String> = redis::Script::new(REMOVE_SCRIPT)
            .key(self.pending_key())
            .arg(job_key_prefix(&self.key_prefix))
            .arg(id)
            .invoke_async(&mut conn)
            .await?;

        json.as_deref().map(decode).transpose()
    }

    async fn get(&self, id: &str) -> SchedulerResult<Option<ScheduledJob>> {
        let mut conn = self.connection.clone();
        let json: Option<String> = conn.get(self.job_key(id)).await?;
        json.as_deref().map(decode).transpose()
    }

    async fn take_due(&self, now: DateTime<Utc>) -> SchedulerResult<Vec<ScheduledJob>> {
        let mut conn = self.connection.clone();

        let reply: Vec<String> = redis::Script::new(CLAIM_SCRIPT)
            .key(self.pending_key())
            .arg(job_key_prefix(&self.key_prefix))
            .arg(now.timestamp_millis())
            .invoke_async(&mut conn)
            .await?;

        if !reply.is_empty() {
            debug!(claimed = reply.len() / 2, "Claimed due jobs");
        }
        Ok(decode_claimed(reply))
    }

    async fn next_fire_time(&self) -> SchedulerResult<Option<DateTime<Utc>>> {
        let mut conn = self.connection.clone();
        let first: Vec<(String, i64)> = conn
            .zrange_withscores(self.pending_key(), 0, 0)
            .await?;

        Ok(first
            .first()
            .and_then(|(_, score)| Utc.timestamp_millis_opt(*score).single()))
    }

    async fn len(&self) -> SchedulerResult<usize> {
        let mut conn = self.connection.clone();
        let count: usize = conn.zcard(self.pending_key()).await?;
        Ok(count)
    }

    fn is_durable(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job(id: &str) -> ScheduledJob {
        ScheduledJob::new(id, "cat_created_handler", json!({"cat_id": 42}), Utc::now())
    }

    #[test]
    fn test_key_layout() {
        assert_eq!(job_key("catbus", "cat_created_delay_42"), "catbus:job:cat_created_delay_42");
        assert_eq!(pending_key("catbus"), "catbus:pending");
        assert!(job_key("catbus", "x").starts_with(&job_key_prefix("catbus")));
    }

    #[test]
    fn test_encoded_job_decodes() {
        let original = job("cat_created_delay_42");
        let decoded = decode(&encode(&original).unwrap()).unwrap();

        assert_eq!(decoded.id, original.id);
        assert_eq!(decoded.handler, "cat_created_handler");
        assert_eq!(decoded.args["cat_id"], 42);
        assert_eq!(
            decoded.fire_at.timestamp_millis(),
            original.fire_at.timestamp_millis()
        );
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            decode("not json"),
            Err(SchedulerError::Serialization(_))
        ));
    }

    #[test]
    fn test_claimed_reply_skips_missing_and_bad_bodies() {
        let reply = vec![
            "cat_created_delay_1".to_string(),
            encode(&job("cat_created_delay_1")).unwrap(),
            "cat_created_delay_2".to_string(),
            String::new(),
            "cat_created_delay_3".to_string(),
            "{broken".to_string(),
            "cat_deleted_delay_4".to_string(),
            encode(&job("cat_deleted_delay_4")).unwrap(),
        ];

        let ids: Vec<String> = decode_claimed(reply).into_iter().map(|job| job.id).collect();
        assert_eq!(ids, vec!["cat_created_delay_1", "cat_deleted_delay_4"]);
    }

    #[test]
    fn test_claimed_reply_ignores_dangling_id() {
        let reply = vec!["cat_created_delay_1".to_string()];
        assert!(decode_claimed(reply).is_empty());
    }
}
