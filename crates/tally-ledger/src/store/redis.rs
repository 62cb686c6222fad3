//! Redis storage backend
//!
//! Values are JSON strings. Rollover state is a hash of `version` and
//! `state`, written by a Lua compare-and-swap. Payment transactions are
//! staged client-side and committed by one Lua script that checks every
//! guard before running any write, so a commit is all-or-nothing.
//!
//! Scripts touch keys that are not declared up front; the backend expects a
//! standalone Redis, not a cluster.

use ::redis::{aio::MultiplexedConnection, AsyncCommands, Client, RedisError, Script};
use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tally_common::{DailyAllocation, PaymentRecord, RolloverState, StoreError};
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::{PaymentStore, PaymentTransaction, RolloverScope, RolloverStore, StoreResult};

const SAVE_ROLLOVER_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], 'version')
if (current or '0') ~= ARGV[1] then
  return {0, current or '0'}
end
redis.call('HSET', KEYS[1], 'version', ARGV[2], 'state', ARGV[3])
redis.call('SADD', KEYS[2], ARGV[4])
return {1, ARGV[2]}
"#;

const COMMIT_SCRIPT: &str = r#"
local guards = cjson.decode(ARGV[1])
for _, g in ipairs(guards) do
  local value = redis.call('GET', g[2])
  if g[1] == 'absent_or' then
    if value and value ~= g[3] then
      return redis.error_reply('DUPLICATE ' .. g[2])
    end
  elseif g[1] == 'present' then
    if not value then
      return redis.error_reply('MISSING ' .. g[2])
    end
  end
end
local ops = cjson.decode(ARGV[2])
for _, op in ipairs(ops) do
  redis.call(unpack(op))
end
return #ops
"#;

/// Key layout under a prefix
#[derive(Debug, Clone)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn rollover(&self, scope: RolloverScope, id: &str) -> String {
        format!("{}:rollover:{}:{}", self.prefix, scope, id)
    }

    pub fn rollover_ids(&self, scope: RolloverScope) -> String {
        format!("{}:rollover_ids:{}", self.prefix, scope)
    }

    pub fn inactive_nodes(&self) -> String {
        format!("{}:nodes:inactive", self.prefix)
    }

    pub fn payment(&self, id: Uuid) -> String {
        format!("{}:payment:{}", self.prefix, id)
    }

    pub fn payment_window(&self, subject_id: &str, start: NaiveDate, end: NaiveDate) -> String {
        format!(
            "{}:payment_window:{}:{}:{}",
            self.prefix,
            subject_id,
            start.format("%Y%m%d"),
            end.format("%Y%m%d")
        )
    }

    pub fn subject_payments(&self, subject_id: &str) -> String {
        format!("{}:payments:{}", self.prefix, subject_id)
    }

    pub fn payment_allocations(&self, payment_id: Uuid) -> String {
        format!("{}:alloc:{}", self.prefix, payment_id)
    }

    pub fn allocation_rows(&self) -> String {
        format!("{}:alloc_rows", self.prefix)
    }

    pub fn allocations_by_day(&self) -> String {
        format!("{}:alloc_by_day", self.prefix)
    }

    /// Commands writing a batch of allocations
    pub fn insert_allocation_ops(&self, batch: &[DailyAllocation]) -> StoreResult<Vec<Vec<String>>> {
        let mut ops = Vec::with_capacity(batch.len() * 3);
        for allocation in batch {
            let id = allocation.id.to_string();
            ops.push(vec![
                "HSET".to_string(),
                self.allocation_rows(),
                id.clone(),
                serde_json::to_string(allocation)?,
            ]);
            ops.push(vec![
                "ZADD".to_string(),
                self.allocations_by_day(),
                day_score(allocation.date).to_string(),
                id.clone(),
            ]);
            ops.push(vec![
                "SADD".to_string(),
                self.payment_allocations(allocation.payment_record_id),
                id,
            ]);
        }
        Ok(ops)
    }

    /// Commands removing the given allocation ids of a payment
    pub fn delete_allocation_ops(&self, payment_id: Uuid, ids: &[String]) -> Vec<Vec<String>> {
        if ids.is_empty() {
            return Vec::new();
        }
        let mut hdel = vec!["HDEL".to_string(), self.allocation_rows()];
        hdel.extend(ids.iter().cloned());
        let mut zrem = vec!["ZREM".to_string(), self.allocations_by_day()];
        zrem.extend(ids.iter().cloned());
        vec![
            hdel,
            zrem,
            vec!["DEL".to_string(), self.payment_allocations(payment_id)],
        ]
    }
}

/// Sorted-set score of a calendar date
fn day_score(date: NaiveDate) -> i64 {
    date.num_days_from_ce() as i64
}

/// Precondition checked by the commit script
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
enum Guard {
    /// `[kind, key, value]`
    AbsentOr(&'static str, String, String),
    /// `[kind, key]`
    Present(&'static str, String),
}

impl Guard {
    fn absent_or(key: String, value: String) -> Self {
        Guard::AbsentOr("absent_or", key, value)
    }

    fn present(key: String) -> Self {
        Guard::Present("present", key)
    }
}

fn backend(context: &str, err: RedisError) -> StoreError {
    StoreError::Backend(format!("{}: {}", context, err))
}

/// Whether `err` means the connection itself is unusable
fn is_connection_error(err: &RedisError) -> bool {
    err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout()
}

/// Cached multiplexed connection, replaced after a connection-level failure
struct ConnectionSlot {
    client: Client,
    connection: RwLock<Option<MultiplexedConnection>>,
    broken: AtomicBool,
}

impl ConnectionSlot {
    fn new(client: Client, connection: Option<MultiplexedConnection>) -> Self {
        Self {
            client,
            connection: RwLock::new(connection),
            broken: AtomicBool::new(false),
        }
    }

    /// Get a connection, reconnecting if needed
    async fn get(&self) -> StoreResult<MultiplexedConnection> {
        if !self.broken.load(Ordering::Acquire) {
            let guard = self.connection.read().await;
            if let Some(conn) = guard.as_ref() {
                return Ok(conn.clone());
            }
        }

        let mut guard = self.connection.write().await;
        if self.broken.swap(false, Ordering::AcqRel) && guard.take().is_some() {
            warn!("Dropped broken Redis connection");
        }
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        let connection = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| backend("Failed to reconnect to Redis", e))?;

        *guard = Some(connection.clone());
        Ok(connection)
    }

    /// Map a command failure, marking the connection for replacement when
    /// the failure was the connection's
    fn failed(&self, context: &str, err: RedisError) -> StoreError {
        if is_connection_error(&err) {
            self.broken.store(true, Ordering::Release);
        }
        backend(context, err)
    }
}

/// Redis backend for both store contracts
pub struct RedisStore {
    slot: Arc<ConnectionSlot>,
    keys: KeySpace,
}

impl RedisStore {
    /// Connect to Redis
    pub async fn connect(redis_url: &str, prefix: &str) -> StoreResult<Self> {
        let client = Client::open(redis_url)
            .map_err(|e| backend("Failed to create Redis client", e))?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| backend("Failed to connect to Redis", e))?;

        Ok(Self {
            slot: Arc::new(ConnectionSlot::new(client, Some(connection))),
            keys: KeySpace::new(prefix),
        })
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    async fn get_connection(&self) -> StoreResult<MultiplexedConnection> {
        self.slot.get().await
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        let mut conn = self.get_connection().await?;
        let raw: Option<String> = conn
            .get(key)
            .await
            .map_err(|e| self.slot.failed("Redis GET failed", e))?;
        raw.map(|json| serde_json::from_str(&json).map_err(StoreError::from))
            .transpose()
    }

    async fn mget_json<T: serde::de::DeserializeOwned>(&self, keys: &[String]) -> StoreResult<Vec<T>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.get_connection().await?;
        let raw: Vec<Option<String>> = ::redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.slot.failed("Redis MGET failed", e))?;
        raw.into_iter()
            .flatten()
            .map(|json| serde_json::from_str(&json).map_err(StoreError::from))
            .collect()
    }

    async fn allocation_rows(&self, ids: &[String]) -> StoreResult<Vec<DailyAllocation>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.get_connection().await?;
        let raw: Vec<Option<String>> = ::redis::cmd("HMGET")
            .arg(self.keys.allocation_rows())
            .arg(ids)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.slot.failed("Redis HMGET failed", e))?;
        raw.into_iter()
            .flatten()
            .map(|json| serde_json::from_str(&json).map_err(StoreError::from))
            .collect()
    }
}

#[async_trait]
impl RolloverStore for RedisStore {
    #[instrument(skip(self))]
    async fn load_rollover_state(
        &self,
        scope: RolloverScope,
        id: &str,
    ) -> StoreResult<Option<RolloverState>> {
        let mut conn = self.get_connection().await?;
        let raw: Option<String> = conn
            .hget(self.keys.rollover(scope, id), "state")
            .await
            .map_err(|e| self.slot.failed("Redis HGET failed", e))?;
        raw.map(|json| serde_json::from_str(&json).map_err(StoreError::from))
            .transpose()
    }

    #[instrument(skip(self, state), fields(id = %state.id, version = state.version))]
    async fn save_rollover_state(
        &self,
        scope: RolloverScope,
        state: &RolloverState,
        expected_version: u64,
    ) -> StoreResult<()> {
        let json = serde_json::to_string(state)?;
        let mut conn = self.get_connection().await?;

        let (written, found): (i64, String) = Script::new(SAVE_ROLLOVER_SCRIPT)
            .key(self.keys.rollover(scope, &state.id))
            .key(self.keys.rollover_ids(scope))
            .arg(expected_version.to_string())
            .arg(state.version.to_string())
            .arg(json)
            .arg(&state.id)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| self.slot.failed("Redis rollover CAS failed", e))?;

        if written == 1 {
            debug!("Saved rollover state");
            Ok(())
        } else {
            Err(StoreError::Conflict {
                id: state.id.clone(),
                expected: expected_version,
                found: found.parse().unwrap_or_default(),
            })
        }
    }

    async fn delete_rollover_state(&self, scope: RolloverScope, id: &str) -> StoreResult<bool> {
        let mut conn = self.get_connection().await?;
        let (deleted, _): (u64, u64) = ::redis::pipe()
            .atomic()
            .del(self.keys.rollover(scope, id))
            .srem(self.keys.rollover_ids(scope), id)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.slot.failed("Redis DEL failed", e))?;
        Ok(deleted > 0)
    }

    async fn list_rollover_ids(&self, scope: RolloverScope) -> StoreResult<Vec<String>> {
        let mut conn = self.get_connection().await?;
        let mut ids: Vec<String> = conn
            .smembers(self.keys.rollover_ids(scope))
            .await
            .map_err(|e| self.slot.failed("Redis SMEMBERS failed", e))?;
        ids.sort();
        Ok(ids)
    }

    async fn set_node_active(&self, node_id: &str, active: bool) -> StoreResult<()> {
        let mut conn = self.get_connection().await?;
        let key = self.keys.inactive_nodes();
        let updated = if active {
            conn.srem::<_, _, ()>(key, node_id).await
        } else {
            conn.sadd::<_, _, ()>(key, node_id).await
        };
        updated.map_err(|e| self.slot.failed("Redis node flag update failed", e))
    }

    async fn is_node_active(&self, node_id: &str) -> StoreResult<bool> {
        let mut conn = self.get_connection().await?;
        let inactive: bool = conn
            .sismember(self.keys.inactive_nodes(), node_id)
            .await
            .map_err(|e| self.slot.failed("Redis SISMEMBER failed", e))?;
        Ok(!inactive)
    }
}

#[async_trait]
impl PaymentStore for RedisStore {
    async fn begin(&self) -> StoreResult<Box<dyn PaymentTransaction>> {
        Ok(Box::new(RedisTransaction {
            conn: self.get_connection().await?,
            slot: self.slot.clone(),
            keys: self.keys.clone(),
            guards: Vec::new(),
            ops: Vec::new(),
            staged_payments: HashSet::new(),
        }))
    }

    async fn find_payment_window(
        &self,
        subject_id: &str,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> StoreResult<Option<PaymentRecord>> {
        let window = self
            .keys
            .payment_window(subject_id, period_start, period_end);
        let mut conn = self.get_connection().await?;
        let id: Option<String> = conn
            .get(&window)
            .await
            .map_err(|e| self.slot.failed("Redis GET failed", e))?;
        match id.and_then(|id| Uuid::parse_str(&id).ok()) {
            Some(id) => self.get_payment(id).await,
            None => Ok(None),
        }
    }

    async fn get_payment(&self, id: Uuid) -> StoreResult<Option<PaymentRecord>> {
        self.get_json(&self.keys.payment(id)).await
    }

    async fn list_payments(&self, subject_id: &str) -> StoreResult<Vec<PaymentRecord>> {
        let mut conn = self.get_connection().await?;
        let ids: Vec<String> = conn
            .smembers(self.keys.subject_payments(subject_id))
            .await
            .map_err(|e| self.slot.failed("Redis SMEMBERS failed", e))?;
        let keys: Vec<String> = ids
            .iter()
            .filter_map(|id| Uuid::parse_str(id).ok())
            .map(|id| self.keys.payment(id))
            .collect();
        let mut records: Vec<PaymentRecord> = self.mget_json(&keys).await?;
        records.sort_by_key(|r| (r.period_start, r.period_end, r.created_at));
        Ok(records)
    }

    async fn allocations_for(&self, payment_id: Uuid) -> StoreResult<Vec<DailyAllocation>> {
        let mut conn = self.get_connection().await?;
        let ids: Vec<String> = conn
            .smembers(self.keys.payment_allocations(payment_id))
            .await
            .map_err(|e| self.slot.failed("Redis SMEMBERS failed", e))?;
        let mut rows = self.allocation_rows(&ids).await?;
        rows.sort_by_key(|a| a.date);
        Ok(rows)
    }

    #[instrument(skip(self))]
    async fn query_allocations(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> StoreResult<Vec<DailyAllocation>> {
        if end < start {
            return Ok(Vec::new());
        }
        let mut conn = self.get_connection().await?;
        let ids: Vec<String> = conn
            .zrangebyscore(self.keys.allocations_by_day(), day_score(start), day_score(end))
            .await
            .map_err(|e| self.slot.failed("Redis ZRANGEBYSCORE failed", e))?;
        let mut rows = self.allocation_rows(&ids).await?;
        rows.sort_by_key(|a| a.date);
        debug!(rows = rows.len(), "Loaded allocations");
        Ok(rows)
    }
}

/// Transaction staged client-side and committed by [`COMMIT_SCRIPT`]
struct RedisTransaction {
    conn: MultiplexedConnection,
    slot: Arc<ConnectionSlot>,
    keys: KeySpace,
    guards: Vec<Guard>,
    ops: Vec<Vec<String>>,
    staged_payments: HashSet<Uuid>,
}

impl RedisTransaction {
    async fn committed_record(&mut self, id: Uuid) -> StoreResult<PaymentRecord> {
        let raw: Option<String> = self
            .conn
            .get(self.keys.payment(id))
            .await
            .map_err(|e| self.slot.failed("Redis GET failed", e))?;
        match raw {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Err(StoreError::NotFound(format!("payment {}", id))),
        }
    }

    async fn committed_allocation_ids(&mut self, payment_id: Uuid) -> StoreResult<Vec<String>> {
        self.conn
            .smembers(self.keys.payment_allocations(payment_id))
            .await
            .map_err(|e| self.slot.failed("Redis SMEMBERS failed", e))
    }

    fn record_ops(&mut self, record: &PaymentRecord) -> StoreResult<()> {
        let id = record.id.to_string();
        let window = self
            .keys
            .payment_window(&record.subject_id, record.period_start, record.period_end);
        self.guards.push(Guard::absent_or(window.clone(), id.clone()));
        self.ops.push(vec![
            "SET".to_string(),
            self.keys.payment(record.id),
            serde_json::to_string(record)?,
        ]);
        self.ops.push(vec!["SET".to_string(), window, id.clone()]);
        self.ops.push(vec![
            "SADD".to_string(),
            self.keys.subject_payments(&record.subject_id),
            id,
        ]);
        Ok(())
    }
}

#[async_trait]
impl PaymentTransaction for RedisTransaction {
    async fn insert_payment_record(&mut self, record: &PaymentRecord) -> StoreResult<()> {
        self.guards
            .push(Guard::absent_or(self.keys.payment(record.id), String::new()));
        self.record_ops(record)?;
        self.staged_payments.insert(record.id);
        Ok(())
    }

    async fn update_payment_record(&mut self, record: &PaymentRecord) -> StoreResult<()> {
        let previous = self.committed_record(record.id).await?;
        self.guards.push(Guard::present(self.keys.payment(record.id)));
        if !previous.same_window(&record.subject_id, record.period_start, record.period_end) {
            self.ops.push(vec![
                "DEL".to_string(),
                self.keys
                    .payment_window(&previous.subject_id, previous.period_start, previous.period_end),
            ]);
        }
        self.record_ops(record)
    }

    async fn delete_payment_record(&mut self, id: Uuid) -> StoreResult<()> {
        let previous = self.committed_record(id).await?;
        let allocation_ids = self.committed_allocation_ids(id).await?;
        let cascade = self.keys.delete_allocation_ops(id, &allocation_ids);
        self.ops.extend(cascade);
        self.ops.push(vec!["DEL".to_string(), self.keys.payment(id)]);
        self.ops.push(vec![
            "DEL".to_string(),
            self.keys
                .payment_window(&previous.subject_id, previous.period_start, previous.period_end),
        ]);
        self.ops.push(vec![
            "SREM".to_string(),
            self.keys.subject_payments(&previous.subject_id),
            id.to_string(),
        ]);
        Ok(())
    }

    async fn insert_daily_allocations(&mut self, batch: &[DailyAllocation]) -> StoreResult<()> {
        let owners: HashSet<Uuid> = batch.iter().map(|a| a.payment_record_id).collect();
        for owner in owners {
            if !self.staged_payments.contains(&owner) {
                self.guards.push(Guard::present(self.keys.payment(owner)));
            }
        }
        let ops = self.keys.insert_allocation_ops(batch)?;
        self.ops.extend(ops);
        Ok(())
    }

    async fn delete_daily_allocations_for(&mut self, payment_id: Uuid) -> StoreResult<u64> {
        let ids = self.committed_allocation_ids(payment_id).await?;
        let ops = self.keys.delete_allocation_ops(payment_id, &ids);
        self.ops.extend(ops);
        Ok(ids.len() as u64)
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let RedisTransaction {
            mut conn,
            slot,
            guards,
            ops,
            ..
        } = *self;
        if ops.is_empty() {
            return Ok(());
        }

        let applied: Result<i64, RedisError> = Script::new(COMMIT_SCRIPT)
            .arg(serde_json::to_string(&guards)?)
            .arg(serde_json::to_string(&ops)?)
            .invoke_async(&mut conn)
            .await;

        match applied {
            Ok(count) => {
                debug!(ops = count, "Committed Redis payment transaction");
                Ok(())
            }
            Err(err) => match err.code() {
                Some("DUPLICATE") => Err(StoreError::Duplicate(err.to_string())),
                Some("MISSING") => Err(StoreError::NotFound(err.to_string())),
                _ => {
                    warn!(error = %err, "Redis payment commit failed");
                    Err(slot.failed("Redis commit failed", err))
                }
            },
        }
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        debug!(ops = self.ops.len(), "Discarded Redis payment transaction");
        Ok(())
    }
}
