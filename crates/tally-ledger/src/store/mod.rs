//! Persistence contract
//!
//! The engine only talks to storage through these traits:
//! - [`RolloverStore`]: versioned read-modify-write of rollover state
//! - [`PaymentStore`]/[`PaymentTransaction`]: all-or-nothing payment writes
//!   and the allocation read path
//!
//! Two interchangeable backends implement them: [`InMemoryStore`] and
//! [`RedisStore`].

#[cfg(test)]
mod contract;
pub mod memory;
pub mod redis;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tally_common::{DailyAllocation, PaymentRecord, RolloverState, StoreError};
use uuid::Uuid;

pub use self::memory::InMemoryStore;
pub use self::redis::RedisStore;

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Which family of rollover state an id belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RolloverScope {
    /// Per-subject counters, broken down by domain
    Subject,
    /// Per-node aggregates, broken down by subject
    Node,
}

impl RolloverScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            RolloverScope::Subject => "subject",
            RolloverScope::Node => "node",
        }
    }
}

impl fmt::Display for RolloverScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage of rollover state
#[async_trait]
pub trait RolloverStore: Send + Sync {
    /// Load the state for an id, `None` if it was never written
    async fn load_rollover_state(
        &self,
        scope: RolloverScope,
        id: &str,
    ) -> StoreResult<Option<RolloverState>>;

    /// Save `state` if the stored version still equals `expected_version`
    ///
    /// A missing record has version 0. A mismatch is reported as
    /// `StoreError::Conflict` and nothing is written.
    async fn save_rollover_state(
        &self,
        scope: RolloverScope,
        state: &RolloverState,
        expected_version: u64,
    ) -> StoreResult<()>;

    /// Remove the state for an id, returning whether it existed
    async fn delete_rollover_state(&self, scope: RolloverScope, id: &str) -> StoreResult<bool>;

    /// Ids that have rollover state in a scope
    async fn list_rollover_ids(&self, scope: RolloverScope) -> StoreResult<Vec<String>>;

    /// Set the active flag of a node
    async fn set_node_active(&self, node_id: &str, active: bool) -> StoreResult<()>;

    /// Nodes are active unless explicitly marked inactive
    async fn is_node_active(&self, node_id: &str) -> StoreResult<bool>;
}

/// Storage of payment records and their allocations
#[async_trait]
pub trait PaymentStore: Send + Sync {
    /// Start a transaction; nothing it stages is visible until commit
    async fn begin(&self) -> StoreResult<Box<dyn PaymentTransaction>>;

    /// Committed payment covering exactly this window for this subject
    async fn find_payment_window(
        &self,
        subject_id: &str,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> StoreResult<Option<PaymentRecord>>;

    async fn get_payment(&self, id: Uuid) -> StoreResult<Option<PaymentRecord>>;

    /// Payments of a subject, oldest window first
    async fn list_payments(&self, subject_id: &str) -> StoreResult<Vec<PaymentRecord>>;

    /// Allocations of one payment, by date
    async fn allocations_for(&self, payment_id: Uuid) -> StoreResult<Vec<DailyAllocation>>;

    /// Allocations dated within `[start, end]`, by date
    async fn query_allocations(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> StoreResult<Vec<DailyAllocation>>;
}

/// Staged payment writes applied all at once on commit
///
/// Window uniqueness `(subject_id, period_start, period_end)` is enforced at
/// commit time and reported as `StoreError::Duplicate`.
#[async_trait]
pub trait PaymentTransaction: Send {
    async fn insert_payment_record(&mut self, record: &PaymentRecord) -> StoreResult<()>;

    async fn update_payment_record(&mut self, record: &PaymentRecord) -> StoreResult<()>;

    async fn delete_payment_record(&mut self, id: Uuid) -> StoreResult<()>;

    async fn insert_daily_allocations(&mut self, batch: &[DailyAllocation]) -> StoreResult<()>;

    /// Stage deletion of every allocation of a payment, returning how many
    async fn delete_daily_allocations_for(&mut self, payment_id: Uuid) -> StoreResult<u64>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;

    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}

/// Storage handles shared by every engine component
///
/// Built once at startup from the selected backend.
#[derive(Clone)]
pub struct StorageContext {
    pub rollover: Arc<dyn RolloverStore>,
    pub payments: Arc<dyn PaymentStore>,
}

impl StorageContext {
    pub fn new<S>(store: Arc<S>) -> Self
    where
        S: RolloverStore + PaymentStore + 'static,
    {
        Self {
            rollover: store.clone(),
            payments: store,
        }
    }

    /// Context over a fresh in-memory store
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryStore::new()))
    }
}

impl fmt::Debug for StorageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageContext").finish_non_exhaustive()
    }
}
