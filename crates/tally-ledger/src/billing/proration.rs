//! Payment proration
//!
//! Spreads a payment evenly across the calendar days of its service window.
//! The daily share is truncated to the currency scale and the last day takes
//! whatever is left, so the shares always add back up to the amount.

use chrono::{NaiveDate, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use std::future::Future;
use std::sync::Arc;
use tally_common::types::payment::validate_window;
use tally_common::{
    days_inclusive, DailyAllocation, PaymentRecord, PaymentRequest, PaymentUpdate, Result,
    StoreError, TallyError, DEFAULT_CURRENCY_SCALE,
};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::metering::KeyedLocks;
use crate::metrics::LedgerMetrics;
use crate::store::PaymentStore;

/// Longest service window accepted, in days
pub const MAX_SERVICE_DAYS: i64 = 36_600;

/// How an amount splits across a window
#[derive(Debug, Clone, PartialEq)]
pub struct Proration {
    pub service_days: i64,
    /// Share of every day but the last
    pub daily_amount: Decimal,
    /// `(date, share)` in date order
    pub shares: Vec<(NaiveDate, Decimal)>,
}

/// Split `amount` over `[start, end]` at `scale` decimal places
pub fn prorate(amount: Decimal, start: NaiveDate, end: NaiveDate, scale: u32) -> Result<Proration> {
    validate_window(amount, start, end)?;

    let service_days = days_inclusive(start, end);
    if service_days > MAX_SERVICE_DAYS {
        return Err(TallyError::InvalidRange(format!(
            "service window of {} days exceeds {}",
            service_days, MAX_SERVICE_DAYS
        )));
    }

    let overflow = || TallyError::Overflow(format!("prorating {} over {} days", amount, service_days));
    let days = Decimal::from(service_days);
    let daily_amount = amount
        .checked_div(days)
        .ok_or_else(overflow)?
        .round_dp_with_strategy(scale, RoundingStrategy::ToZero);
    let last_amount = daily_amount
        .checked_mul(Decimal::from(service_days - 1))
        .and_then(|spread| amount.checked_sub(spread))
        .ok_or_else(overflow)?;

    let mut shares = Vec::with_capacity(service_days as usize);
    let mut date = start;
    for day in 0..service_days {
        if day + 1 == service_days {
            shares.push((date, last_amount));
        } else {
            shares.push((date, daily_amount));
            date = date
                .succ_opt()
                .ok_or_else(|| TallyError::InvalidRange(format!("date overflow after {}", date)))?;
        }
    }

    Ok(Proration {
        service_days,
        daily_amount,
        shares,
    })
}

/// Outcome of one request in an import
#[derive(Debug)]
pub enum ImportOutcome {
    Allocated(PaymentRecord),
    /// Window already held by `existing_id`
    Duplicate { existing_id: Uuid },
    Failed(TallyError),
}

/// Per-request results of [`PaymentProrationEngine::import`], in input order
#[derive(Debug, Default)]
pub struct ImportReport {
    pub results: Vec<(PaymentRequest, ImportOutcome)>,
}

impl ImportReport {
    pub fn allocated(&self) -> usize {
        self.count(|o| matches!(o, ImportOutcome::Allocated(_)))
    }

    pub fn duplicates(&self) -> usize {
        self.count(|o| matches!(o, ImportOutcome::Duplicate { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, ImportOutcome::Failed(_)))
    }

    fn count(&self, pred: impl Fn(&ImportOutcome) -> bool) -> usize {
        self.results.iter().filter(|(_, o)| pred(o)).count()
    }
}

/// Staged write, replayed onto a fresh transaction
enum TxOp {
    InsertRecord(PaymentRecord),
    UpdateRecord(PaymentRecord),
    DeleteRecord(Uuid),
    InsertAllocations(Vec<DailyAllocation>),
    DeleteAllocationsFor(Uuid),
}

/// Turns payments into persisted day-level allocations
pub struct PaymentProrationEngine {
    store: Arc<dyn PaymentStore>,
    locks: KeyedLocks,
    currency_scale: u32,
    metrics: Option<Arc<LedgerMetrics>>,
}

impl PaymentProrationEngine {
    pub fn new(store: Arc<dyn PaymentStore>) -> Self {
        Self {
            store,
            locks: KeyedLocks::new(),
            currency_scale: DEFAULT_CURRENCY_SCALE,
            metrics: None,
        }
    }

    pub fn with_currency_scale(mut self, scale: u32) -> Self {
        self.currency_scale = scale;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<LedgerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn currency_scale(&self) -> u32 {
        self.currency_scale
    }

    /// Record a payment and write its allocations in one transaction
    #[instrument(skip(self, request), fields(subject = %request.subject_id, start = %request.period_start, end = %request.period_end))]
    pub async fn allocate(&self, request: PaymentRequest) -> Result<(PaymentRecord, Vec<DailyAllocation>)> {
        self.pruning(self.allocate_locked(request)).await
    }

    /// Change a payment and redo its allocations
    ///
    /// A remark-only change keeps the existing allocations.
    #[instrument(skip(self, update))]
    pub async fn update_payment(
        &self,
        id: Uuid,
        update: PaymentUpdate,
    ) -> Result<(PaymentRecord, Vec<DailyAllocation>)> {
        self.pruning(self.update_locked(id, update)).await
    }

    /// Delete a payment together with its allocations
    #[instrument(skip(self))]
    pub async fn delete_payment(&self, id: Uuid) -> Result<PaymentRecord> {
        self.pruning(self.delete_locked(id)).await
    }

    pub async fn get_payment(&self, id: Uuid) -> Result<Option<PaymentRecord>> {
        Ok(self.store.get_payment(id).await?)
    }

    pub async fn payments_for(&self, subject_id: &str) -> Result<Vec<PaymentRecord>> {
        Ok(self.store.list_payments(subject_id).await?)
    }

    pub async fn allocations_for(&self, payment_id: Uuid) -> Result<Vec<DailyAllocation>> {
        Ok(self.store.allocations_for(payment_id).await?)
    }

    /// Lock entries currently tracked
    pub fn lock_entries(&self) -> usize {
        self.locks.len()
    }

    /// Run a locked operation, then drop lock entries nobody holds
    async fn pruning<T>(&self, op: impl Future<Output = Result<T>>) -> Result<T> {
        let result = op.await;
        self.locks.prune();
        result
    }

    async fn allocate_locked(&self, request: PaymentRequest) -> Result<(PaymentRecord, Vec<DailyAllocation>)> {
        request.validate()?;

        let _guard = self
            .locks
            .lock(&window_lock_key(&request.subject_id, request.period_start, request.period_end))
            .await;

        if let Some(existing) = self
            .store
            .find_payment_window(&request.subject_id, request.period_start, request.period_end)
            .await?
        {
            return Err(self.duplicate(&request.subject_id, request.period_start, request.period_end, existing.id));
        }

        let proration = prorate(
            request.amount,
            request.period_start,
            request.period_end,
            self.currency_scale,
        )?;
        let now = Utc::now();
        let record = PaymentRecord {
            id: Uuid::now_v7(),
            subject_id: request.subject_id,
            amount: request.amount,
            period_start: request.period_start,
            period_end: request.period_end,
            daily_amount: proration.daily_amount,
            service_days: proration.service_days,
            remark: request.remark,
            created_at: now,
            updated_at: now,
        };
        let allocations = allocations_of(&record, &proration);

        self.execute(
            &record,
            vec![
                TxOp::InsertRecord(record.clone()),
                TxOp::InsertAllocations(allocations.clone()),
            ],
        )
        .await?;

        if let Some(metrics) = &self.metrics {
            metrics.payments_allocated.inc();
            metrics.allocation_rows.inc_by(allocations.len() as u64);
        }
        info!(
            payment = %record.id,
            days = record.service_days,
            daily = %record.daily_amount,
            "Payment allocated"
        );
        Ok((record, allocations))
    }

    async fn update_locked(
        &self,
        id: Uuid,
        update: PaymentUpdate,
    ) -> Result<(PaymentRecord, Vec<DailyAllocation>)> {
        let _guard = self.locks.lock(&payment_lock_key(id)).await;

        let current = self
            .store
            .get_payment(id)
            .await?
            .ok_or_else(|| TallyError::NotFound(format!("payment {}", id)))?;

        let amount = update.amount.unwrap_or(current.amount);
        let period_start = update.period_start.unwrap_or(current.period_start);
        let period_end = update.period_end.unwrap_or(current.period_end);
        validate_window(amount, period_start, period_end)?;

        let mut record = PaymentRecord {
            amount,
            period_start,
            period_end,
            remark: update.remark.clone().or_else(|| current.remark.clone()),
            updated_at: Utc::now(),
            ..current.clone()
        };

        if !update.reallocates() {
            self.execute(&record, vec![TxOp::UpdateRecord(record.clone())])
                .await?;
            let allocations = self.store.allocations_for(id).await?;
            debug!(payment = %id, "Payment remark updated");
            return Ok((record, allocations));
        }

        if !current.same_window(&record.subject_id, period_start, period_end) {
            if let Some(holder) = self
                .store
                .find_payment_window(&record.subject_id, period_start, period_end)
                .await?
            {
                if holder.id != id {
                    return Err(self.duplicate(&record.subject_id, period_start, period_end, holder.id));
                }
            }
        }

        let proration = prorate(amount, period_start, period_end, self.currency_scale)?;
        record.daily_amount = proration.daily_amount;
        record.service_days = proration.service_days;
        let allocations = allocations_of(&record, &proration);

        self.execute(
            &record,
            vec![
                TxOp::DeleteAllocationsFor(id),
                TxOp::UpdateRecord(record.clone()),
                TxOp::InsertAllocations(allocations.clone()),
            ],
        )
        .await?;

        if let Some(metrics) = &self.metrics {
            metrics.allocation_rows.inc_by(allocations.len() as u64);
        }
        info!(payment = %id, days = record.service_days, "Payment reallocated");
        Ok((record, allocations))
    }

    async fn delete_locked(&self, id: Uuid) -> Result<PaymentRecord> {
        let _guard = self.locks.lock(&payment_lock_key(id)).await;

        let record = self
            .store
            .get_payment(id)
            .await?
            .ok_or_else(|| TallyError::NotFound(format!("payment {}", id)))?;

        self.execute(
            &record,
            vec![TxOp::DeleteAllocationsFor(id), TxOp::DeleteRecord(id)],
        )
        .await?;

        info!(payment = %id, subject = %record.subject_id, "Payment deleted");
        Ok(record)
    }

    /// Allocate a batch of payments, one transaction each
    ///
    /// Duplicates and failures are recorded per request; the rest of the
    /// batch still runs.
    #[instrument(skip_all, fields(requests = requests.len()))]
    pub async fn import(&self, requests: Vec<PaymentRequest>) -> ImportReport {
        let mut report = ImportReport::default();

        for request in requests {
            let outcome = match self.allocate(request.clone()).await {
                Ok((record, _)) => ImportOutcome::Allocated(record),
                Err(TallyError::DuplicatePaymentWindow { existing_id, .. }) => {
                    ImportOutcome::Duplicate { existing_id }
                }
                Err(err) => {
                    warn!(subject = %request.subject_id, error = %err, "Payment import failed");
                    ImportOutcome::Failed(err)
                }
            };
            report.results.push((request, outcome));
        }

        info!(
            allocated = report.allocated(),
            duplicates = report.duplicates(),
            failed = report.failed(),
            "Payment import finished"
        );
        report
    }

    /// Stage `ops` on one transaction and commit
    async fn execute(&self, record: &PaymentRecord, ops: Vec<TxOp>) -> Result<()> {
        let mut tx = self
            .store
            .begin()
            .await
            .map_err(|e| self.transaction_failure(record, e))?;

        for op in ops {
            let staged = match op {
                TxOp::InsertRecord(r) => tx.insert_payment_record(&r).await,
                TxOp::UpdateRecord(r) => tx.update_payment_record(&r).await,
                TxOp::DeleteRecord(id) => tx.delete_payment_record(id).await,
                TxOp::InsertAllocations(batch) => tx.insert_daily_allocations(&batch).await,
                TxOp::DeleteAllocationsFor(id) => tx.delete_daily_allocations_for(id).await.map(|_| ()),
            };
            if let Err(err) = staged {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(payment = %record.id, error = %rollback_err, "Rollback failed");
                }
                return Err(self.commit_error(record, err).await);
            }
        }

        match tx.commit().await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.commit_error(record, err).await),
        }
    }

    /// Map a failed write, resolving window clashes to the holder
    async fn commit_error(&self, record: &PaymentRecord, err: StoreError) -> TallyError {
        if let StoreError::Duplicate(_) = err {
            if let Ok(Some(holder)) = self
                .store
                .find_payment_window(&record.subject_id, record.period_start, record.period_end)
                .await
            {
                if holder.id != record.id {
                    return self.duplicate(
                        &record.subject_id,
                        record.period_start,
                        record.period_end,
                        holder.id,
                    );
                }
            }
        }
        self.transaction_failure(record, err)
    }

    fn transaction_failure(&self, record: &PaymentRecord, err: StoreError) -> TallyError {
        if let Some(metrics) = &self.metrics {
            metrics.transaction_failures.inc();
        }
        error!(payment = %record.id, error = %err, "Payment transaction rolled back");
        TallyError::TransactionFailure(err.to_string())
    }

    fn duplicate(
        &self,
        subject_id: &str,
        period_start: NaiveDate,
        period_end: NaiveDate,
        existing_id: Uuid,
    ) -> TallyError {
        if let Some(metrics) = &self.metrics {
            metrics.duplicate_windows.inc();
        }
        debug!(subject = subject_id, existing = %existing_id, "Payment window already allocated");
        TallyError::DuplicatePaymentWindow {
            subject_id: subject_id.to_string(),
            period_start,
            period_end,
            existing_id,
        }
    }
}

fn allocations_of(record: &PaymentRecord, proration: &Proration) -> Vec<DailyAllocation> {
    proration
        .shares
        .iter()
        .map(|(date, share)| DailyAllocation::new(record, *date, *share))
        .collect()
}

fn window_lock_key(subject_id: &str, start: NaiveDate, end: NaiveDate) -> String {
    format!("window:{}:{}:{}", subject_id, start, end)
}

fn payment_lock_key(id: Uuid) -> String {
    format!("payment:{}", id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn engine() -> (Arc<InMemoryStore>, PaymentProrationEngine) {
        let store = Arc::new(InMemoryStore::new());
        (store.clone(), PaymentProrationEngine::new(store))
    }

    fn amounts(proration: &Proration) -> Vec<Decimal> {
        proration.shares.iter().map(|(_, a)| *a).collect()
    }

    #[test]
    fn test_even_split() {
        let p = prorate(dec!(100.00), date(2024, 1, 1), date(2024, 1, 4), 2).unwrap();
        assert_eq!(p.service_days, 4);
        assert_eq!(p.daily_amount, dec!(25.00));
        assert_eq!(amounts(&p), vec![dec!(25.00); 4]);
        assert_eq!(p.shares[3].0, date(2024, 1, 4));
    }

    #[test]
    fn test_last_day_takes_remainder() {
        let p = prorate(dec!(100.00), date(2024, 1, 1), date(2024, 1, 3), 2).unwrap();
        assert_eq!(p.daily_amount, dec!(33.33));
        assert_eq!(amounts(&p), vec![dec!(33.33), dec!(33.33), dec!(33.34)]);
    }

    #[test]
    fn test_single_day_and_zero_amount() {
        let p = prorate(dec!(9.99), date(2024, 2, 29), date(2024, 2, 29), 2).unwrap();
        assert_eq!(amounts(&p), vec![dec!(9.99)]);

        let p = prorate(Decimal::ZERO, date(2024, 1, 1), date(2024, 1, 2), 2).unwrap();
        assert_eq!(amounts(&p), vec![Decimal::ZERO, Decimal::ZERO]);
    }

    #[test]
    fn test_invalid_windows() {
        assert!(matches!(
            prorate(dec!(1), date(2024, 1, 2), date(2024, 1, 1), 2),
            Err(TallyError::InvalidRange(_))
        ));
        assert!(matches!(
            prorate(dec!(-1), date(2024, 1, 1), date(2024, 1, 1), 2),
            Err(TallyError::InvalidRange(_))
        ));
        assert!(matches!(
            prorate(dec!(1), date(1900, 1, 1), date(2024, 1, 1), 2),
            Err(TallyError::InvalidRange(_))
        ));
    }

    #[tokio::test]
    async fn test_allocate_persists_record_and_rows() {
        let (store, engine) = engine();
        let (record, rows) = engine
            .allocate(PaymentRequest::new("u1", dec!(100.00), date(2024, 1, 1), date(2024, 1, 3)).with_remark("annual"))
            .await
            .unwrap();

        assert_eq!(record.service_days, 3);
        assert_eq!(record.daily_amount, dec!(33.33));
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.payment_record_id == record.id && r.original_amount == dec!(100.00)));
        assert_eq!(rows[2].date_key, "20240103");

        assert_eq!(store.payment_count(), 1);
        assert_eq!(store.allocation_count(), 3);
        assert_eq!(engine.allocations_for(record.id).await.unwrap(), rows);
    }

    #[tokio::test]
    async fn test_duplicate_window_writes_nothing() {
        let (store, engine) = engine();
        let request = PaymentRequest::new("u1", dec!(50), date(2024, 1, 1), date(2024, 1, 5));
        let (first, _) = engine.allocate(request.clone()).await.unwrap();

        let err = engine.allocate(request).await.unwrap_err();
        match err {
            TallyError::DuplicatePaymentWindow { existing_id, .. } => assert_eq!(existing_id, first.id),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.payment_count(), 1);
        assert_eq!(store.allocation_count(), 5);
    }

    #[tokio::test]
    async fn test_invalid_request_writes_nothing() {
        let (store, engine) = engine();
        let err = engine
            .allocate(PaymentRequest::new("u1", dec!(50), date(2024, 1, 5), date(2024, 1, 1)))
            .await
            .unwrap_err();
        assert!(matches!(err, TallyError::InvalidRange(_)));
        assert_eq!(store.payment_count(), 0);
    }

    #[tokio::test]
    async fn test_update_reallocates() {
        let (store, engine) = engine();
        let (record, _) = engine
            .allocate(PaymentRequest::new("u1", dec!(100.00), date(2024, 1, 1), date(2024, 1, 4)))
            .await
            .unwrap();

        let (updated, rows) = engine
            .update_payment(
                record.id,
                PaymentUpdate {
                    amount: Some(dec!(10.00)),
                    period_end: Some(date(2024, 1, 3)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.id, record.id);
        assert_eq!(updated.created_at, record.created_at);
        assert_eq!(updated.service_days, 3);
        let shares: Vec<Decimal> = rows.iter().map(|r| r.allocated_amount).collect();
        assert_eq!(shares, vec![dec!(3.33), dec!(3.33), dec!(3.34)]);
        assert_eq!(store.allocation_count(), 3);
    }

    #[tokio::test]
    async fn test_update_remark_keeps_allocations() {
        let (_, engine) = engine();
        let (record, rows) = engine
            .allocate(PaymentRequest::new("u1", dec!(4), date(2024, 1, 1), date(2024, 1, 2)))
            .await
            .unwrap();

        let (updated, kept) = engine
            .update_payment(
                record.id,
                PaymentUpdate {
                    remark: Some("refund pending".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.remark.as_deref(), Some("refund pending"));
        assert_eq!(kept, rows);
    }

    #[tokio::test]
    async fn test_update_onto_taken_window() {
        let (_, engine) = engine();
        engine
            .allocate(PaymentRequest::new("u1", dec!(4), date(2024, 2, 1), date(2024, 2, 2)))
            .await
            .unwrap();
        let (second, _) = engine
            .allocate(PaymentRequest::new("u1", dec!(4), date(2024, 3, 1), date(2024, 3, 2)))
            .await
            .unwrap();

        let err = engine
            .update_payment(
                second.id,
                PaymentUpdate {
                    period_start: Some(date(2024, 2, 1)),
                    period_end: Some(date(2024, 2, 2)),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TallyError::DuplicatePaymentWindow { .. }));
        assert_eq!(engine.get_payment(second.id).await.unwrap().unwrap(), second);
    }

    #[tokio::test]
    async fn test_delete_cascades() {
        let (store, engine) = engine();
        let (record, _) = engine
            .allocate(PaymentRequest::new("u1", dec!(4), date(2024, 1, 1), date(2024, 1, 2)))
            .await
            .unwrap();

        engine.delete_payment(record.id).await.unwrap();
        assert_eq!(store.payment_count(), 0);
        assert_eq!(store.allocation_count(), 0);
        assert!(matches!(
            engine.delete_payment(record.id).await,
            Err(TallyError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_import_classifies_each_request() {
        let (_, engine) = engine();
        let ok = PaymentRequest::new("u1", dec!(100.00), date(2024, 1, 1), date(2024, 1, 4));
        let report = engine
            .import(vec![
                ok.clone(),
                ok.clone(),
                PaymentRequest::new("u2", dec!(-1), date(2024, 1, 1), date(2024, 1, 4)),
                PaymentRequest::new("u2", dec!(7), date(2024, 1, 1), date(2024, 1, 1)),
            ])
            .await;

        assert_eq!(report.allocated(), 2);
        assert_eq!(report.duplicates(), 1);
        assert_eq!(report.failed(), 1);
        assert!(matches!(report.results[2].1, ImportOutcome::Failed(TallyError::InvalidRange(_))));

        // re-import is idempotent
        let again = engine.import(vec![ok]).await;
        assert_eq!(again.duplicates(), 1);
        assert_eq!(engine.payments_for("u1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_lock_entries_released_after_each_call() {
        let (_, engine) = engine();
        let start = date(2024, 1, 1);
        let requests: Vec<_> = (0..200)
            .map(|i| {
                let day = start + chrono::Duration::days(i);
                PaymentRequest::new("u1", dec!(10), day, day)
            })
            .collect();

        let report = engine.import(requests.clone()).await;
        assert_eq!(report.allocated(), 200);
        assert_eq!(engine.lock_entries(), 0);

        // failures and duplicates release their entries too
        assert_eq!(engine.import(requests).await.duplicates(), 200);
        assert_eq!(engine.lock_entries(), 0);

        let (record, _) = engine
            .allocate(PaymentRequest::new("u2", dec!(4), start, date(2024, 1, 4)))
            .await
            .unwrap();
        engine
            .update_payment(
                record.id,
                PaymentUpdate {
                    amount: Some(dec!(8)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        engine.delete_payment(record.id).await.unwrap();
        assert!(engine.delete_payment(record.id).await.is_err());
        assert_eq!(engine.lock_entries(), 0);
    }

    proptest! {
        #[test]
        fn prop_shares_sum_to_amount(cents in 0i64..1_000_000_000, days in 1i64..800, scale in 0u32..4) {
            let amount = Decimal::new(cents, 2);
            let start = date(2023, 1, 1);
            let end = start + chrono::Duration::days(days - 1);
            let p = prorate(amount, start, end, scale).unwrap();

            prop_assert_eq!(p.shares.len() as i64, days);
            prop_assert_eq!(p.shares.iter().map(|(_, a)| *a).sum::<Decimal>(), amount);
            prop_assert_eq!(p.shares.last().map(|(d, _)| *d), Some(end));
            prop_assert!(p.shares.iter().all(|(_, a)| *a >= Decimal::ZERO));
        }
    }
}
