//! In-memory storage backend
//!
//! Rollover state lives in a DashMap with per-entry compare-and-swap.
//! Payment tables sit behind one RwLock; a transaction stages its operations
//! and applies them under a single write lock, undoing the applied prefix if
//! any operation fails.

use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tally_common::{DailyAllocation, PaymentRecord, RolloverState, StoreError};
use tracing::debug;
use uuid::Uuid;

use super::{PaymentStore, PaymentTransaction, RolloverScope, RolloverStore, StoreResult};

type WindowKey = (String, NaiveDate, NaiveDate);

fn window_of(record: &PaymentRecord) -> WindowKey {
    (
        record.subject_id.clone(),
        record.period_start,
        record.period_end,
    )
}

#[derive(Debug, Default)]
struct PaymentTables {
    records: HashMap<Uuid, PaymentRecord>,
    windows: HashMap<WindowKey, Uuid>,
    allocations: HashMap<Uuid, DailyAllocation>,
    by_payment: HashMap<Uuid, Vec<Uuid>>,
    by_date: BTreeSet<(NaiveDate, Uuid)>,
}

impl PaymentTables {
    fn put_allocation(&mut self, allocation: DailyAllocation) {
        self.by_payment
            .entry(allocation.payment_record_id)
            .or_default()
            .push(allocation.id);
        self.by_date.insert((allocation.date, allocation.id));
        self.allocations.insert(allocation.id, allocation);
    }

    fn take_allocations(&mut self, payment_id: Uuid) -> Vec<DailyAllocation> {
        let ids = self.by_payment.remove(&payment_id).unwrap_or_default();
        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(allocation) = self.allocations.remove(&id) {
                self.by_date.remove(&(allocation.date, id));
                removed.push(allocation);
            }
        }
        removed
    }

    fn allocations_of(&self, payment_id: Uuid) -> Vec<DailyAllocation> {
        let mut rows: Vec<DailyAllocation> = self
            .by_payment
            .get(&payment_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.allocations.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default();
        rows.sort_by_key(|a| a.date);
        rows
    }

    fn apply(&mut self, op: PaymentOp) -> StoreResult<Undo> {
        match op {
            PaymentOp::InsertRecord(record) => {
                if self.records.contains_key(&record.id) {
                    return Err(StoreError::Duplicate(format!("payment {}", record.id)));
                }
                let window = window_of(&record);
                if let Some(existing) = self.windows.get(&window) {
                    return Err(StoreError::Duplicate(format!(
                        "payment window {}:{}..={} held by {}",
                        window.0, window.1, window.2, existing
                    )));
                }
                self.windows.insert(window, record.id);
                let id = record.id;
                self.records.insert(id, record);
                Ok(Undo::RemoveRecord(id))
            }
            PaymentOp::UpdateRecord(record) => {
                let previous = self
                    .records
                    .get(&record.id)
                    .cloned()
                    .ok_or_else(|| StoreError::NotFound(format!("payment {}", record.id)))?;
                let window = window_of(&record);
                if let Some(holder) = self.windows.get(&window) {
                    if *holder != record.id {
                        return Err(StoreError::Duplicate(format!(
                            "payment window {}:{}..={} held by {}",
                            window.0, window.1, window.2, holder
                        )));
                    }
                }
                self.windows.remove(&window_of(&previous));
                self.windows.insert(window, record.id);
                self.records.insert(record.id, record);
                Ok(Undo::RestoreRecord(previous))
            }
            PaymentOp::DeleteRecord(id) => {
                let previous = self
                    .records
                    .remove(&id)
                    .ok_or_else(|| StoreError::NotFound(format!("payment {}", id)))?;
                self.windows.remove(&window_of(&previous));
                // allocations never outlive their payment
                let cascaded = self.take_allocations(id);
                Ok(Undo::ReinsertRecord(previous, cascaded))
            }
            PaymentOp::InsertAllocations(batch) => {
                let mut inserted = Vec::with_capacity(batch.len());
                for allocation in &batch {
                    if !self.records.contains_key(&allocation.payment_record_id) {
                        return Err(StoreError::NotFound(format!(
                            "payment {} for allocation {}",
                            allocation.payment_record_id, allocation.id
                        )));
                    }
                    if self.allocations.contains_key(&allocation.id) {
                        return Err(StoreError::Duplicate(format!("allocation {}", allocation.id)));
                    }
                }
                for allocation in batch {
                    inserted.push((allocation.payment_record_id, allocation.id));
                    self.put_allocation(allocation);
                }
                Ok(Undo::RemoveAllocations(inserted))
            }
            PaymentOp::DeleteAllocationsFor(payment_id) => {
                Ok(Undo::RestoreAllocations(self.take_allocations(payment_id)))
            }
        }
    }

    fn undo(&mut self, undo: Undo) {
        match undo {
            Undo::RemoveRecord(id) => {
                if let Some(record) = self.records.remove(&id) {
                    self.windows.remove(&window_of(&record));
                }
            }
            Undo::RestoreRecord(previous) => {
                if let Some(current) = self.records.remove(&previous.id) {
                    self.windows.remove(&window_of(&current));
                }
                self.windows.insert(window_of(&previous), previous.id);
                self.records.insert(previous.id, previous);
            }
            Undo::ReinsertRecord(previous, allocations) => {
                self.windows.insert(window_of(&previous), previous.id);
                self.records.insert(previous.id, previous);
                for allocation in allocations {
                    self.put_allocation(allocation);
                }
            }
            Undo::RemoveAllocations(ids) => {
                for (payment_id, id) in ids {
                    if let Some(allocation) = self.allocations.remove(&id) {
                        self.by_date.remove(&(allocation.date, id));
                    }
                    if let Some(list) = self.by_payment.get_mut(&payment_id) {
                        list.retain(|a| *a != id);
                        if list.is_empty() {
                            self.by_payment.remove(&payment_id);
                        }
                    }
                }
            }
            Undo::RestoreAllocations(allocations) => {
                for allocation in allocations {
                    self.put_allocation(allocation);
                }
            }
        }
    }
}

#[derive(Debug)]
enum PaymentOp {
    InsertRecord(PaymentRecord),
    UpdateRecord(PaymentRecord),
    DeleteRecord(Uuid),
    InsertAllocations(Vec<DailyAllocation>),
    DeleteAllocationsFor(Uuid),
}

#[derive(Debug)]
enum Undo {
    RemoveRecord(Uuid),
    RestoreRecord(PaymentRecord),
    ReinsertRecord(PaymentRecord, Vec<DailyAllocation>),
    RemoveAllocations(Vec<(Uuid, Uuid)>),
    RestoreAllocations(Vec<DailyAllocation>),
}

/// In-memory backend for both store contracts
#[derive(Debug, Default)]
pub struct InMemoryStore {
    rollover: DashMap<(RolloverScope, String), RolloverState>,
    inactive_nodes: DashSet<String>,
    payments: Arc<RwLock<PaymentTables>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed allocation rows
    pub fn allocation_count(&self) -> usize {
        self.payments.read().allocations.len()
    }

    /// Number of committed payment records
    pub fn payment_count(&self) -> usize {
        self.payments.read().records.len()
    }
}

#[async_trait]
impl RolloverStore for InMemoryStore {
    async fn load_rollover_state(
        &self,
        scope: RolloverScope,
        id: &str,
    ) -> StoreResult<Option<RolloverState>> {
        Ok(self
            .rollover
            .get(&(scope, id.to_string()))
            .map(|s| s.clone()))
    }

    async fn save_rollover_state(
        &self,
        scope: RolloverScope,
        state: &RolloverState,
        expected_version: u64,
    ) -> StoreResult<()> {
        match self.rollover.entry((scope, state.id.clone())) {
            Entry::Occupied(mut entry) => {
                let found = entry.get().version;
                if found != expected_version {
                    return Err(StoreError::Conflict {
                        id: state.id.clone(),
                        expected: expected_version,
                        found,
                    });
                }
                entry.insert(state.clone());
            }
            Entry::Vacant(entry) => {
                if expected_version != 0 {
                    return Err(StoreError::Conflict {
                        id: state.id.clone(),
                        expected: expected_version,
                        found: 0,
                    });
                }
                entry.insert(state.clone());
            }
        }
        Ok(())
    }

    async fn delete_rollover_state(&self, scope: RolloverScope, id: &str) -> StoreResult<bool> {
        Ok(self.rollover.remove(&(scope, id.to_string())).is_some())
    }

    async fn list_rollover_ids(&self, scope: RolloverScope) -> StoreResult<Vec<String>> {
        let mut ids: Vec<String> = self
            .rollover
            .iter()
            .filter(|entry| entry.key().0 == scope)
            .map(|entry| entry.key().1.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn set_node_active(&self, node_id: &str, active: bool) -> StoreResult<()> {
        if active {
            self.inactive_nodes.remove(node_id);
        } else {
            self.inactive_nodes.insert(node_id.to_string());
        }
        Ok(())
    }

    async fn is_node_active(&self, node_id: &str) -> StoreResult<bool> {
        Ok(!self.inactive_nodes.contains(node_id))
    }
}

#[async_trait]
impl PaymentStore for InMemoryStore {
    async fn begin(&self) -> StoreResult<Box<dyn PaymentTransaction>> {
        Ok(Box::new(MemoryTransaction {
            tables: self.payments.clone(),
            ops: Vec::new(),
        }))
    }

    async fn find_payment_window(
        &self,
        subject_id: &str,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> StoreResult<Option<PaymentRecord>> {
        let tables = self.payments.read();
        Ok(tables
            .windows
            .get(&(subject_id.to_string(), period_start, period_end))
            .and_then(|id| tables.records.get(id).cloned()))
    }

    async fn get_payment(&self, id: Uuid) -> StoreResult<Option<PaymentRecord>> {
        Ok(self.payments.read().records.get(&id).cloned())
    }

    async fn list_payments(&self, subject_id: &str) -> StoreResult<Vec<PaymentRecord>> {
        let mut records: Vec<PaymentRecord> = self
            .payments
            .read()
            .records
            .values()
            .filter(|r| r.subject_id == subject_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| (r.period_start, r.period_end, r.created_at));
        Ok(records)
    }

    async fn allocations_for(&self, payment_id: Uuid) -> StoreResult<Vec<DailyAllocation>> {
        Ok(self.payments.read().allocations_of(payment_id))
    }

    async fn query_allocations(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> StoreResult<Vec<DailyAllocation>> {
        if end < start {
            return Ok(Vec::new());
        }
        let tables = self.payments.read();
        Ok(tables
            .by_date
            .range((start, Uuid::nil())..=(end, Uuid::from_u128(u128::MAX)))
            .filter_map(|(_, id)| tables.allocations.get(id).cloned())
            .collect())
    }
}

/// Transaction staging payment operations until commit
struct MemoryTransaction {
    tables: Arc<RwLock<PaymentTables>>,
    ops: Vec<PaymentOp>,
}

#[async_trait]
impl PaymentTransaction for MemoryTransaction {
    async fn insert_payment_record(&mut self, record: &PaymentRecord) -> StoreResult<()> {
        self.ops.push(PaymentOp::InsertRecord(record.clone()));
        Ok(())
    }

    async fn update_payment_record(&mut self, record: &PaymentRecord) -> StoreResult<()> {
        self.ops.push(PaymentOp::UpdateRecord(record.clone()));
        Ok(())
    }

    async fn delete_payment_record(&mut self, id: Uuid) -> StoreResult<()> {
        self.ops.push(PaymentOp::DeleteRecord(id));
        Ok(())
    }

    async fn insert_daily_allocations(&mut self, batch: &[DailyAllocation]) -> StoreResult<()> {
        self.ops.push(PaymentOp::InsertAllocations(batch.to_vec()));
        Ok(())
    }

    async fn delete_daily_allocations_for(&mut self, payment_id: Uuid) -> StoreResult<u64> {
        let existing = self
            .tables
            .read()
            .by_payment
            .get(&payment_id)
            .map(|ids| ids.len() as u64)
            .unwrap_or(0);
        self.ops.push(PaymentOp::DeleteAllocationsFor(payment_id));
        Ok(existing)
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let MemoryTransaction { tables, ops } = *self;
        let op_count = ops.len();
        let mut tables = tables.write();
        let mut applied = Vec::with_capacity(op_count);

        for op in ops {
            match tables.apply(op) {
                Ok(undo) => applied.push(undo),
                Err(err) => {
                    for undo in applied.into_iter().rev() {
                        tables.undo(undo);
                    }
                    debug!(error = %err, "Rolled back in-memory payment transaction");
                    return Err(err);
                }
            }
        }

        debug!(ops = op_count, "Committed in-memory payment transaction");
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        debug!(ops = self.ops.len(), "Discarded in-memory payment transaction");
        Ok(())
    }
}
