//! Redis-backed transport using Lua scripts for atomicity.
//!
//! Every queue lives under `{prefix}:{queue}`:
//!
//! - `:spec` hash holding the declared [`QueueSpec`]
//! - `:seq` enqueue counter
//! - `:waiting` sorted set ordered by priority, then enqueue order
//! - `:delayed`, `:active`, `:completed`, `:failed` sorted sets scored by
//!   the relevant timestamp in milliseconds
//! - `:msg:{id}` hash per message
//!
//! Scripts derive key names from the namespace, so the namespace must map to
//! a single node or a single hash slot.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use uuid::Uuid;

use super::{
    Broker, DeathRecord, Delivery, DeliveryTag, FailureContext, MessageState, OutboundMessage,
    clamp_priority, QueueCounts, QueueInspect, QueueSpec, StaleDelivery, StallReport, StallScanner,
    StoredMessage, Transport, STALLED_REASON,
};
use crate::config::RedisConfig;
use crate::connection::Connector;
use crate::job::JobId;

/// Helpers shared by every script.
const PRELUDE: &str = r#"
local function int(n)
    return string.format('%.0f', n)
end

local function msg_key(base, id)
    return base .. ':msg:' .. id
end

local function require_queue(base, queue)
    if redis.call('EXISTS', base .. ':spec') == 0 then
        error({err = 'queue ' .. queue .. ' has not been declared'})
    end
end

-- Priorities are clamped to MAX_PRIORITY, keeping the score below 2^53.
local function waiting_score(priority, seq)
    return int(-tonumber(priority) * 1e12 + tonumber(seq))
end

local function enqueue_waiting(base, id)
    local key = msg_key(base, id)
    local fields = redis.call('HMGET', key, 'priority', 'seq')
    redis.call('HSET', key, 'state', 'waiting')
    redis.call('ZADD', base .. ':waiting', waiting_score(fields[1], fields[2]), id)
end

local function promote(base, now)
    local due = redis.call('ZRANGEBYSCORE', base .. ':delayed', '-inf', now)
    for _, id in ipairs(due) do
        redis.call('ZREM', base .. ':delayed', id)
        enqueue_waiting(base, id)
    end
end

local function held(key, consumer, delivery)
    local fields = redis.call('HMGET', key, 'state', 'consumer', 'delivery')
    if fields[1] ~= 'active' then
        return false
    end
    if consumer ~= '' and (fields[2] ~= consumer or fields[3] ~= delivery) then
        return false
    end
    return true
end

local function release(base, id)
    redis.call('ZREM', base .. ':active', id)
    redis.call('HDEL', msg_key(base, id), 'consumer', 'delivery')
    enqueue_waiting(base, id)
end

local function reject(prefix, queue, id, now, dead_id, death)
    local base = prefix .. ':' .. queue
    local key = msg_key(base, id)
    local target = redis.call('HGET', base .. ':spec', 'dead_letter')
    if target and target ~= '' and target ~= queue
        and redis.call('EXISTS', prefix .. ':' .. target .. ':spec') == 1 then
        local tbase = prefix .. ':' .. target
        local new_id = dead_id
        local attempt = 1
        while redis.call('EXISTS', msg_key(tbase, new_id)) == 1 do
            new_id = dead_id .. '-' .. attempt
            attempt = attempt + 1
        end
        local fields = redis.call('HMGET', key, 'body', 'priority', 'persistent')
        local seq = redis.call('INCR', tbase .. ':seq')
        redis.call('HSET', msg_key(tbase, new_id),
            'id', new_id, 'body', fields[1], 'priority', fields[2],
            'persistent', fields[3], 'enqueued_at', now, 'available_at', now,
            'deliveries', 0, 'stalled', 0, 'seq', seq, 'death', death)
        enqueue_waiting(tbase, new_id)
        redis.call('ZREM', base .. ':active', id)
        redis.call('DEL', key)
        return new_id
    end
    redis.call('ZREM', base .. ':active', id)
    redis.call('ZADD', base .. ':failed', now, id)
    redis.call('HSET', key, 'state', 'failed', 'finished_at', now)
    redis.call('HDEL', key, 'consumer', 'delivery')
    redis.call('HSETNX', key, 'death', death)
    return false
end

local prefix = KEYS[1]
local queue = ARGV[1]
local base = prefix .. ':' .. queue
"#;

/// ARGV: queue, durable, dead_letter, stall_timeout_ms, max_stalled,
/// retain_age_ms, retain_count
const DECLARE_SCRIPT: &str = r#"
local spec = base .. ':spec'
if redis.call('EXISTS', spec) == 1 then
    local current = redis.call('HMGET', spec, 'durable', 'dead_letter')
    if current[1] ~= ARGV[2] or current[2] ~= ARGV[3] then
        error({err = 'queue ' .. queue .. ' already declared with different arguments'})
    end
end
redis.call('HSET', spec, 'durable', ARGV[2], 'dead_letter', ARGV[3],
    'stall_timeout_ms', ARGV[4], 'max_stalled', ARGV[5],
    'retain_age_ms', ARGV[6], 'retain_count', ARGV[7])
redis.call('SADD', prefix .. ':queues', queue)
return 1
"#;

/// ARGV: queue, id, body, priority, delay_ms, now, persistent, death
const PUBLISH_SCRIPT: &str = r#"
require_queue(base, queue)
local id = ARGV[2]
local key = msg_key(base, id)
if redis.call('EXISTS', key) == 1 then
    error({err = 'job ' .. id .. ' already exists in queue ' .. queue})
end
local now = tonumber(ARGV[6])
local delay = tonumber(ARGV[5])
local seq = redis.call('INCR', base .. ':seq')
redis.call('HSET', key, 'id', id, 'body', ARGV[3], 'priority', ARGV[4],
    'persistent', ARGV[7], 'enqueued_at', ARGV[6], 'available_at', int(now + delay),
    'deliveries', 0, 'stalled', 0, 'seq', seq)
if ARGV[8] ~= '' then
    redis.call('HSET', key, 'death', ARGV[8])
end
if delay > 0 then
    redis.call('HSET', key, 'state', 'delayed')
    redis.call('ZADD', base .. ':delayed', int(now + delay), id)
else
    enqueue_waiting(base, id)
end
return id
"#;

/// ARGV: queue, consumer, delivery, now
const RECEIVE_SCRIPT: &str = r#"
require_queue(base, queue)
promote(base, ARGV[4])
local head = redis.call('ZRANGE', base .. ':waiting', 0, 0)
if #head == 0 then
    return false
end
local id = head[1]
local key = msg_key(base, id)
redis.call('ZREM', base .. ':waiting', id)
redis.call('ZADD', base .. ':active', ARGV[4], id)
redis.call('HSET', key, 'state', 'active', 'delivered_at', ARGV[4],
    'consumer', ARGV[2], 'delivery', ARGV[3])
redis.call('HINCRBY', key, 'deliveries', 1)
return redis.call('HGETALL', key)
"#;

/// ARGV: queue, id, consumer, delivery, now
const CLAIM_SCRIPT: &str = r#"
require_queue(base, queue)
promote(base, ARGV[5])
local id = ARGV[2]
local key = msg_key(base, id)
local state = redis.call('HGET', key, 'state')
if not state or state == 'active' or state == 'completed' then
    return false
end
redis.call('ZREM', base .. ':' .. state, id)
redis.call('ZADD', base .. ':active', ARGV[5], id)
redis.call('HSET', key, 'state', 'active', 'delivered_at', ARGV[5],
    'consumer', ARGV[3], 'delivery', ARGV[4])
return redis.call('HGETALL', key)
"#;

/// ARGV: queue, id, consumer, delivery, now
const ACK_SCRIPT: &str = r#"
require_queue(base, queue)
local id = ARGV[2]
local key = msg_key(base, id)
if not held(key, ARGV[3], ARGV[4]) then
    error({err = 'unknown delivery tag'})
end
local now = tonumber(ARGV[5])
redis.call('ZREM', base .. ':active', id)
redis.call('ZADD', base .. ':completed', ARGV[5], id)
redis.call('HSET', key, 'state', 'completed', 'finished_at', ARGV[5])
redis.call('HDEL', key, 'consumer', 'delivery')

local retention = redis.call('HMGET', base .. ':spec', 'retain_age_ms', 'retain_count')
local max_age = tonumber(retention[1]) or 0
local max_count = tonumber(retention[2]) or 0
local pruned = {}
if max_age > 0 then
    pruned = redis.call('ZRANGEBYSCORE', base .. ':completed', '-inf', '(' .. int(now - max_age))
end
for _, old in ipairs(pruned) do
    redis.call('ZREM', base .. ':completed', old)
    redis.call('DEL', msg_key(base, old))
end
if max_count > 0 then
    local excess = redis.call('ZCARD', base .. ':completed') - max_count
    if excess > 0 then
        local oldest = redis.call('ZRANGE', base .. ':completed', 0, excess - 1)
        for _, old in ipairs(oldest) do
            redis.call('ZREM', base .. ':completed', old)
            redis.call('DEL', msg_key(base, old))
        end
    end
end
return 1
"#;

/// ARGV: queue, id, consumer, delivery, requeue, now, dead_id, death
///
/// An empty consumer settles the message regardless of which delivery holds it.
const NACK_SCRIPT: &str = r#"
require_queue(base, queue)
local id = ARGV[2]
if not held(msg_key(base, id), ARGV[3], ARGV[4]) then
    error({err = 'unknown delivery tag'})
end
if ARGV[5] == '1' then
    release(base, id)
    return false
end
return reject(prefix, queue, id, ARGV[6], ARGV[7], ARGV[8])
"#;

/// ARGV: queue, consumer
const RECOVER_SCRIPT: &str = r#"
local recovered = 0
for _, id in ipairs(redis.call('ZRANGE', base .. ':active', 0, -1)) do
    if redis.call('HGET', msg_key(base, id), 'consumer') == ARGV[2] then
        release(base, id)
        recovered = recovered + 1
    end
end
return recovered
"#;

/// ARGV: queue, now, start, limit, states...
const LIST_SCRIPT: &str = r#"
require_queue(base, queue)
promote(base, ARGV[2])
local start = tonumber(ARGV[3])
local limit = tonumber(ARGV[4])
local ids = {}
for i = 5, #ARGV do
    local members = redis.call('ZRANGE', base .. ':' .. ARGV[i], 0, -1)
    local seqs = {}
    for _, id in ipairs(members) do
        seqs[id] = tonumber(redis.call('HGET', msg_key(base, id), 'seq'))
    end
    table.sort(members, function(a, b) return seqs[a] < seqs[b] end)
    for _, id in ipairs(members) do
        table.insert(ids, id)
    end
end
local page = {}
for i = start + 1, math.min(#ids, start + limit) do
    table.insert(page, redis.call('HGETALL', msg_key(base, ids[i])))
end
return page
"#;

/// ARGV: queue, id, now
const GET_SCRIPT: &str = r#"
require_queue(base, queue)
promote(base, ARGV[3])
local key = msg_key(base, ARGV[2])
if redis.call('EXISTS', key) == 0 then
    return false
end
return redis.call('HGETALL', key)
"#;

/// ARGV: queue, id
const REMOVE_SCRIPT: &str = r#"
require_queue(base, queue)
local id = ARGV[2]
local key = msg_key(base, id)
local state = redis.call('HGET', key, 'state')
if not state then
    return 0
end
if state == 'active' then
    error({err = 'job ' .. id .. ' is held by an active delivery'})
end
redis.call('ZREM', base .. ':' .. state, id)
redis.call('DEL', key)
return 1
"#;

/// ARGV: queue, id, now
const ARCHIVE_SCRIPT: &str = r#"
require_queue(base, queue)
local id = ARGV[2]
local key = msg_key(base, id)
local state = redis.call('HGET', key, 'state')
if not state or state == 'completed' then
    return 0
end
if state == 'active' then
    error({err = 'job ' .. id .. ' is held by an active delivery'})
end
redis.call('ZREM', base .. ':' .. state, id)
redis.call('ZADD', base .. ':completed', ARGV[3], id)
redis.call('HSET', key, 'state', 'completed', 'finished_at', ARGV[3])
return 1
"#;

/// ARGV: queue, now, states...
const PURGE_SCRIPT: &str = r#"
require_queue(base, queue)
promote(base, ARGV[2])
local removed = 0
for i = 3, #ARGV do
    if ARGV[i] ~= 'active' then
        local set = base .. ':' .. ARGV[i]
        local members = redis.call('ZRANGE', set, 0, -1)
        for _, id in ipairs(members) do
            redis.call('DEL', msg_key(base, id))
        end
        redis.call('DEL', set)
        removed = removed + #members
    end
end
return removed
"#;

/// ARGV: queue, now
const COUNTS_SCRIPT: &str = r#"
require_queue(base, queue)
promote(base, ARGV[2])
return {
    redis.call('ZCARD', base .. ':waiting'),
    redis.call('ZCARD', base .. ':delayed'),
    redis.call('ZCARD', base .. ':active'),
    redis.call('ZCARD', base .. ':completed'),
    redis.call('ZCARD', base .. ':failed'),
}
"#;

/// ARGV: queue, now
///
/// Returns the requeued ids and the ids (with delivery counts) that exceeded
/// `max_stalled`; those stay active until rejected by the caller.
const STALL_SCRIPT: &str = r#"
require_queue(base, queue)
local spec = redis.call('HMGET', base .. ':spec', 'stall_timeout_ms', 'max_stalled')
local timeout = tonumber(spec[1]) or 0
local max_stalled = tonumber(spec[2]) or 0
local overdue = redis.call('ZRANGEBYSCORE', base .. ':active', '-inf', int(tonumber(ARGV[2]) - timeout))
local requeued = {}
local exhausted = {}
local deliveries = {}
for _, id in ipairs(overdue) do
    local key = msg_key(base, id)
    local stalled = redis.call('HINCRBY', key, 'stalled', 1)
    if stalled > max_stalled then
        table.insert(exhausted, id)
        table.insert(deliveries, redis.call('HGET', key, 'deliveries'))
    else
        release(base, id)
        table.insert(requeued, id)
    end
end
return {requeued, exhausted, deliveries}
"#;

struct Scripts {
    declare: Script,
    publish: Script,
    receive: Script,
    claim: Script,
    ack: Script,
    nack: Script,
    recover: Script,
    list: Script,
    get: Script,
    remove: Script,
    archive: Script,
    purge: Script,
    counts: Script,
    stall: Script,
}

impl Scripts {
    fn load() -> Self {
        let with_prelude = |body: &str| Script::new(&format!("{PRELUDE}\n{body}"));
        Self {
            declare: with_prelude(DECLARE_SCRIPT),
            publish: with_prelude(PUBLISH_SCRIPT),
            receive: with_prelude(RECEIVE_SCRIPT),
            claim: with_prelude(CLAIM_SCRIPT),
            ack: with_prelude(ACK_SCRIPT),
            nack: with_prelude(NACK_SCRIPT),
            recover: with_prelude(RECOVER_SCRIPT),
            list: with_prelude(LIST_SCRIPT),
            get: with_prelude(GET_SCRIPT),
            remove: with_prelude(REMOVE_SCRIPT),
            archive: with_prelude(ARCHIVE_SCRIPT),
            purge: with_prelude(PURGE_SCRIPT),
            counts: with_prelude(COUNTS_SCRIPT),
            stall: with_prelude(STALL_SCRIPT),
        }
    }
}

/// Transport over a shared Redis connection manager.
#[derive(Clone)]
pub struct RedisBroker {
    conn: ConnectionManager,
    prefix: String,
    scripts: Arc<Scripts>,
    /// Consumer tags this handle has delivered to; released on close.
    consumers: Arc<Mutex<HashSet<String>>>,
}

impl fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisBroker")
            .field("prefix", &self.prefix)
            .field("consumers", &self.consumers.lock().len())
            .finish()
    }
}

fn now_millis() -> (DateTime<Utc>, i64) {
    let now = Utc::now();
    (now, now.timestamp_millis())
}

fn flag(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}

fn millis_to_datetime(field: &str, raw: &str) -> anyhow::Result<DateTime<Utc>> {
    let ms: i64 = raw
        .parse()
        .with_context(|| format!("invalid {field} timestamp {raw:?}"))?;
    DateTime::from_timestamp_millis(ms).ok_or_else(|| anyhow!("{field} timestamp {ms} out of range"))
}

/// Rebuild a [`StoredMessage`] from a flattened `HGETALL` reply.
fn decode_message(queue: &str, flat: Vec<String>) -> anyhow::Result<StoredMessage> {
    let mut fields: HashMap<String, String> = HashMap::with_capacity(flat.len() / 2);
    let mut iter = flat.into_iter();
    while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
        fields.insert(key, value);
    }

    let required = |name: &str| {
        fields
            .get(name)
            .ok_or_else(|| anyhow!("message hash in {queue} is missing {name}"))
    };
    let optional_time = |name: &str| {
        fields
            .get(name)
            .map(|raw| millis_to_datetime(name, raw))
            .transpose()
    };
    let counter = |name: &str| -> anyhow::Result<u32> {
        fields
            .get(name)
            .map_or(Ok(0), |raw| raw.parse().with_context(|| format!("invalid {name} {raw:?}")))
    };

    let death = fields
        .get("death")
        .filter(|raw| !raw.is_empty())
        .map(|raw| serde_json::from_str::<DeathRecord>(raw))
        .transpose()
        .context("invalid death record")?;

    Ok(StoredMessage {
        id: JobId(required("id")?.clone()),
        queue: queue.to_string(),
        body: required("body")?.clone(),
        priority: required("priority")?
            .parse()
            .context("invalid priority")?,
        state: required("state")?.parse()?,
        persistent: required("persistent")? == "1",
        enqueued_at: millis_to_datetime("enqueued_at", required("enqueued_at")?)?,
        available_at: millis_to_datetime("available_at", required("available_at")?)?,
        delivered_at: optional_time("delivered_at")?,
        finished_at: optional_time("finished_at")?,
        deliveries: counter("deliveries")?,
        stalled: counter("stalled")?,
        consumer: fields.get("consumer").cloned(),
        delivery: fields.get("delivery").cloned(),
        death,
    })
}

/// Surface the settle scripts' stale-tag error as [`StaleDelivery`].
fn settle_error(err: redis::RedisError, tag: &DeliveryTag) -> anyhow::Error {
    if err.to_string().contains("unknown delivery tag") {
        StaleDelivery(tag.clone()).into()
    } else {
        err.into()
    }
}

fn encode_death(
    failure: FailureContext,
    id: &JobId,
    queue: &str,
    now: DateTime<Utc>,
) -> anyhow::Result<String> {
    serde_json::to_string(&failure.into_death(id.clone(), queue, now))
        .context("failed to encode death record")
}

impl RedisBroker {
    pub fn new(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
            scripts: Arc::new(Scripts::load()),
            consumers: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn declared_queues(&self) -> anyhow::Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let queues: Vec<String> = conn
            .smembers(format!("{}:queues", self.prefix))
            .await
            .context("failed to list declared queues")?;
        Ok(queues)
    }

    async fn reject_held(
        &self,
        queue: &str,
        id: &JobId,
        consumer: &str,
        delivery: &str,
        failure: FailureContext,
    ) -> anyhow::Result<Option<String>> {
        let (now, now_ms) = now_millis();
        let death = encode_death(failure, id, queue, now)?;
        let mut conn = self.conn.clone();
        let moved: Option<String> = self
            .scripts
            .nack
            .key(&self.prefix)
            .arg(queue)
            .arg(id.as_str())
            .arg(consumer)
            .arg(delivery)
            .arg(flag(false))
            .arg(now_ms)
            .arg(JobId::dead_letter(id, now).as_str())
            .arg(death)
            .invoke_async(&mut conn)
            .await
            .map_err(|err| {
                let tag = DeliveryTag {
                    queue: queue.to_string(),
                    consumer: consumer.to_string(),
                    message_id: id.clone(),
                    delivery: delivery.to_string(),
                };
                settle_error(err, &tag)
            })
            .with_context(|| format!("failed to reject job {id} in {queue}"))?;
        Ok(moved)
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn declare_queue(&self, spec: &QueueSpec) -> anyhow::Result<()> {
        let retention = &spec.completed_retention;
        let mut conn = self.conn.clone();
        let _: i64 = self
            .scripts
            .declare
            .key(&self.prefix)
            .arg(&spec.name)
            .arg(flag(spec.durable))
            .arg(spec.dead_letter.as_deref().unwrap_or_default())
            .arg(spec.stall_timeout.as_millis() as u64)
            .arg(spec.max_stalled)
            .arg(retention.max_age.map_or(0, |age| age.as_millis() as u64))
            .arg(retention.max_count.unwrap_or(0))
            .invoke_async(&mut conn)
            .await
            .with_context(|| format!("failed to declare queue {}", spec.name))?;
        tracing::debug!(queue = %spec.name, prefix = %self.prefix, "declared redis queue");
        Ok(())
    }

    async fn publish(&self, queue: &str, message: OutboundMessage) -> anyhow::Result<JobId> {
        let (_, now_ms) = now_millis();
        let id = message.id.clone().unwrap_or_default();
        let death = message
            .death
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("failed to encode death record")?
            .unwrap_or_default();

        let mut conn = self.conn.clone();
        let _: String = self
            .scripts
            .publish
            .key(&self.prefix)
            .arg(queue)
            .arg(id.as_str())
            .arg(&message.body)
            .arg(clamp_priority(message.priority))
            .arg(message.delay.as_millis() as u64)
            .arg(now_ms)
            .arg(flag(message.persistent))
            .arg(death)
            .invoke_async(&mut conn)
            .await
            .with_context(|| format!("failed to publish job {id} to {queue}"))?;
        Ok(id)
    }

    async fn receive(&self, queue: &str, consumer: &str) -> anyhow::Result<Option<Delivery>> {
        let (_, now_ms) = now_millis();
        let delivery = Uuid::now_v7().to_string();
        let mut conn = self.conn.clone();
        let reply: Option<Vec<String>> = self
            .scripts
            .receive
            .key(&self.prefix)
            .arg(queue)
            .arg(consumer)
            .arg(&delivery)
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await
            .with_context(|| format!("failed to receive from {queue}"))?;

        let Some(flat) = reply else {
            return Ok(None);
        };
        self.consumers.lock().insert(consumer.to_string());
        let message = decode_message(queue, flat)?;
        Ok(Some(Delivery {
            tag: DeliveryTag {
                queue: queue.to_string(),
                consumer: consumer.to_string(),
                message_id: message.id.clone(),
                delivery,
            },
            message,
        }))
    }

    async fn ack(&self, tag: &DeliveryTag) -> anyhow::Result<()> {
        let (_, now_ms) = now_millis();
        let mut conn = self.conn.clone();
        let _: i64 = self
            .scripts
            .ack
            .key(&self.prefix)
            .arg(&tag.queue)
            .arg(tag.message_id.as_str())
            .arg(&tag.consumer)
            .arg(&tag.delivery)
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(|err| settle_error(err, tag))
            .with_context(|| format!("failed to ack {tag}"))?;
        Ok(())
    }

    async fn nack(
        &self,
        tag: &DeliveryTag,
        requeue: bool,
        failure: Option<FailureContext>,
    ) -> anyhow::Result<()> {
        if requeue {
            let (_, now_ms) = now_millis();
            let mut conn = self.conn.clone();
            let _: Option<String> = self
                .scripts
                .nack
                .key(&self.prefix)
                .arg(&tag.queue)
                .arg(tag.message_id.as_str())
                .arg(&tag.consumer)
                .arg(&tag.delivery)
                .arg(flag(true))
                .arg(now_ms)
                .arg("")
                .arg("")
                .invoke_async(&mut conn)
                .await
                .map_err(|err| settle_error(err, tag))
                .with_context(|| format!("failed to requeue {tag}"))?;
            return Ok(());
        }

        let failure = failure.unwrap_or_else(|| FailureContext::new("rejected"));
        let moved = self
            .reject_held(
                &tag.queue,
                &tag.message_id,
                &tag.consumer,
                &tag.delivery,
                failure,
            )
            .await?;
        if let Some(dead_id) = moved {
            tracing::debug!(
                job_id = %tag.message_id,
                dead_id = %dead_id,
                queue = %tag.queue,
                "message dead-lettered"
            );
        }
        Ok(())
    }

    async fn recover(&self, consumer: &str) -> anyhow::Result<u64> {
        let mut recovered = 0;
        for queue in self.declared_queues().await? {
            let mut conn = self.conn.clone();
            let count: u64 = self
                .scripts
                .recover
                .key(&self.prefix)
                .arg(&queue)
                .arg(consumer)
                .invoke_async(&mut conn)
                .await
                .with_context(|| format!("failed to recover {consumer} deliveries in {queue}"))?;
            recovered += count;
        }
        self.consumers.lock().remove(consumer);
        Ok(recovered)
    }

    async fn close(&self) -> anyhow::Result<()> {
        let consumers: Vec<String> = self.consumers.lock().iter().cloned().collect();
        let mut released = 0;
        for consumer in consumers {
            released += self.recover(&consumer).await?;
        }
        if released > 0 {
            tracing::info!(released, "returned unsettled deliveries on close");
        }
        Ok(())
    }
}

#[async_trait]
impl QueueInspect for RedisBroker {
    async fn list(
        &self,
        queue: &str,
        states: &[MessageState],
        start: usize,
        limit: usize,
    ) -> anyhow::Result<Vec<StoredMessage>> {
        let (_, now_ms) = now_millis();
        let mut conn = self.conn.clone();
        let mut invocation = self.scripts.list.key(&self.prefix);
        invocation.arg(queue).arg(now_ms).arg(start).arg(limit);
        for state in states {
            invocation.arg(state.as_str());
        }
        let page: Vec<Vec<String>> = invocation
            .invoke_async(&mut conn)
            .await
            .with_context(|| format!("failed to list {queue}"))?;
        page.into_iter()
            .map(|flat| decode_message(queue, flat))
            .collect()
    }

    async fn get(&self, queue: &str, id: &JobId) -> anyhow::Result<Option<StoredMessage>> {
        let (_, now_ms) = now_millis();
        let mut conn = self.conn.clone();
        let reply: Option<Vec<String>> = self
            .scripts
            .get
            .key(&self.prefix)
            .arg(queue)
            .arg(id.as_str())
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await
            .with_context(|| format!("failed to fetch job {id} from {queue}"))?;
        reply.map(|flat| decode_message(queue, flat)).transpose()
    }

    async fn claim(
        &self,
        queue: &str,
        id: &JobId,
        consumer: &str,
    ) -> anyhow::Result<Option<Delivery>> {
        let (_, now_ms) = now_millis();
        let delivery = Uuid::now_v7().to_string();
        let mut conn = self.conn.clone();
        let reply: Option<Vec<String>> = self
            .scripts
            .claim
            .key(&self.prefix)
            .arg(queue)
            .arg(id.as_str())
            .arg(consumer)
            .arg(&delivery)
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await
            .with_context(|| format!("failed to claim job {id} in {queue}"))?;

        let Some(flat) = reply else {
            return Ok(None);
        };
        self.consumers.lock().insert(consumer.to_string());
        let message = decode_message(queue, flat)?;
        Ok(Some(Delivery {
            tag: DeliveryTag {
                queue: queue.to_string(),
                consumer: consumer.to_string(),
                message_id: message.id.clone(),
                delivery,
            },
            message,
        }))
    }

    async fn remove(&self, queue: &str, id: &JobId) -> anyhow::Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .scripts
            .remove
            .key(&self.prefix)
            .arg(queue)
            .arg(id.as_str())
            .invoke_async(&mut conn)
            .await
            .with_context(|| format!("failed to remove job {id} from {queue}"))?;
        Ok(removed == 1)
    }

    async fn archive(&self, queue: &str, id: &JobId) -> anyhow::Result<bool> {
        let (_, now_ms) = now_millis();
        let mut conn = self.conn.clone();
        let archived: i64 = self
            .scripts
            .archive
            .key(&self.prefix)
            .arg(queue)
            .arg(id.as_str())
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await
            .with_context(|| format!("failed to archive job {id} in {queue}"))?;
        Ok(archived == 1)
    }

    async fn purge(&self, queue: &str, states: &[MessageState]) -> anyhow::Result<u64> {
        let (_, now_ms) = now_millis();
        let mut conn = self.conn.clone();
        let mut invocation = self.scripts.purge.key(&self.prefix);
        invocation.arg(queue).arg(now_ms);
        for state in states {
            invocation.arg(state.as_str());
        }
        let removed: u64 = invocation
            .invoke_async(&mut conn)
            .await
            .with_context(|| format!("failed to purge {queue}"))?;
        Ok(removed)
    }

    async fn counts(&self, queue: &str) -> anyhow::Result<QueueCounts> {
        let (_, now_ms) = now_millis();
        let mut conn = self.conn.clone();
        let (waiting, delayed, active, completed, failed): (u64, u64, u64, u64, u64) = self
            .scripts
            .counts
            .key(&self.prefix)
            .arg(queue)
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await
            .with_context(|| format!("failed to count {queue}"))?;
        Ok(QueueCounts {
            waiting,
            delayed,
            active,
            completed,
            failed,
        })
    }
}

#[async_trait]
impl StallScanner for RedisBroker {
    async fn requeue_stalled(&self, queue: &str) -> anyhow::Result<StallReport> {
        let (_, now_ms) = now_millis();
        let mut conn = self.conn.clone();
        let (requeued, exhausted, deliveries): (Vec<String>, Vec<String>, Vec<u32>) = self
            .scripts
            .stall
            .key(&self.prefix)
            .arg(queue)
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await
            .with_context(|| format!("failed to scan {queue} for stalled jobs"))?;

        let mut report = StallReport {
            requeued: requeued.into_iter().map(JobId).collect(),
            rejected: Vec::with_capacity(exhausted.len()),
        };
        for (id, deliveries) in exhausted.into_iter().map(JobId).zip(deliveries) {
            let failure =
                FailureContext::new(STALLED_REASON).with_attempts(deliveries, deliveries);
            // Settled by its consumer between the scan and the rejection.
            if let Err(err) = self.reject_held(queue, &id, "", "", failure).await {
                tracing::debug!(job_id = %id, queue, "stalled job settled before rejection: {err:#}");
                continue;
            }
            report.rejected.push(id);
        }
        Ok(report)
    }
}

/// Connector dialing Redis with a [`ConnectionManager`].
#[derive(Clone, Debug)]
pub struct RedisConnector {
    config: RedisConfig,
}

impl RedisConnector {
    pub fn new(config: RedisConfig) -> Self {
        Self { config }
    }
}

/// `url` with any credentials masked.
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***@{}", &url[..scheme_end], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}

#[async_trait]
impl Connector for RedisConnector {
    async fn connect(&self) -> anyhow::Result<Arc<dyn Transport>> {
        let client = redis::Client::open(self.config.url.as_str())
            .with_context(|| format!("invalid redis url {}", redact(&self.config.url)))?;
        let conn = client
            .get_connection_manager()
            .await
            .with_context(|| format!("failed to connect to {}", redact(&self.config.url)))?;
        Ok(Arc::new(RedisBroker::new(conn, self.config.key_prefix.clone())) as Arc<dyn Transport>)
    }

    fn endpoint(&self) -> String {
        redact(&self.config.url)
    }
}
