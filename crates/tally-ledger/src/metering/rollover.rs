//! Usage rollover counters
//!
//! [`RolloverEngine`] runs the read-modify-write cycle shared by subject
//! counters and node aggregates:
//! 1. take the per-id lock
//! 2. load the state (or start a fresh one)
//! 3. absorb the event into day, month and year buckets
//! 4. save with a compare-and-swap on the loaded version
//! 5. on conflict, go back to 2 until the retry budget is spent

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tally_common::{
    PeriodClock, Result, RolloverReport, RolloverState, StoreError, TallyError,
    DEFAULT_MAX_RETRIES,
};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, instrument, warn};

use super::collector::UsageEvent;
use super::locks::KeyedLocks;
use super::quota::{NoQuota, QuotaPolicy};
use crate::metrics::LedgerMetrics;
use crate::store::{RolloverScope, RolloverStore};

/// Result of one successful update
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    /// State as saved
    pub state: RolloverState,
    pub report: RolloverReport,
    /// Save attempts it took, 1 without contention
    pub attempts: u32,
}

/// Rollover read-modify-write for one scope
pub struct RolloverEngine {
    scope: RolloverScope,
    store: Arc<dyn RolloverStore>,
    clock: PeriodClock,
    locks: KeyedLocks,
    max_retries: u32,
    metrics: Option<Arc<LedgerMetrics>>,
}

impl RolloverEngine {
    pub fn new(scope: RolloverScope, store: Arc<dyn RolloverStore>, clock: PeriodClock) -> Self {
        Self {
            scope,
            store,
            clock,
            locks: KeyedLocks::new(),
            max_retries: DEFAULT_MAX_RETRIES,
            metrics: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<LedgerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn scope(&self) -> RolloverScope {
        self.scope
    }

    pub fn clock(&self) -> &PeriodClock {
        &self.clock
    }

    pub fn store(&self) -> &Arc<dyn RolloverStore> {
        &self.store
    }

    /// Absorb `delta` under `key` into the state of `id`
    pub async fn apply(
        &self,
        id: &str,
        key: &str,
        delta: i64,
        at: DateTime<Utc>,
    ) -> Result<ApplyOutcome> {
        let held = self.lock(id).await;
        self.apply_locked(&held, id, key, delta, at).await
    }

    /// Exclusive access to `id`, for checks that must not interleave with
    /// its updates
    pub async fn lock(&self, id: &str) -> OwnedMutexGuard<()> {
        self.locks.lock(id).await
    }

    /// [`apply`](Self::apply) for a caller already holding the lock of `id`
    #[instrument(skip(self, _held), fields(scope = %self.scope))]
    pub async fn apply_locked(
        &self,
        _held: &OwnedMutexGuard<()>,
        id: &str,
        key: &str,
        delta: i64,
        at: DateTime<Utc>,
    ) -> Result<ApplyOutcome> {
        let labels = self.clock.labels_for(at);
        let result = self
            .update_locked(id, |state| state.absorb(&labels, key, delta).map(Some))
            .await;

        match result {
            Ok(Some(outcome)) => {
                if let Some(metrics) = &self.metrics {
                    metrics.events_applied.inc();
                    metrics
                        .buckets_rolled
                        .inc_by(outcome.report.rolled_count() as u64);
                }
                debug!(
                    day = %outcome.state.day.current.period,
                    rolled = outcome.report.rolled_count(),
                    "Applied usage"
                );
                Ok(outcome)
            }
            Ok(None) => Err(TallyError::Internal(format!(
                "update of {} produced no state",
                id
            ))),
            Err(err @ TallyError::StaleEvent { .. }) => {
                if let Some(metrics) = &self.metrics {
                    metrics.stale_events.inc();
                }
                warn!(error = %err, "Dropped stale usage event");
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Close buckets of `id` whose period is behind `now`
    ///
    /// Returns `None` when the id has no state or nothing needed rolling.
    #[instrument(skip(self), fields(scope = %self.scope))]
    pub async fn roll_forward(&self, id: &str, now: DateTime<Utc>) -> Result<Option<ApplyOutcome>> {
        let labels = self.clock.labels_for(now);
        let outcome = self
            .update(id, |state| {
                // never-saved state: nothing to roll
                if state.version == 0 {
                    return Ok(None);
                }
                let report = state.roll_forward(&labels);
                Ok((!report.rolled.is_empty()).then_some(report))
            })
            .await?;

        if let (Some(outcome), Some(metrics)) = (&outcome, &self.metrics) {
            metrics
                .buckets_rolled
                .inc_by(outcome.report.rolled_count() as u64);
        }
        Ok(outcome)
    }

    pub async fn state(&self, id: &str) -> Result<Option<RolloverState>> {
        Ok(self.store.load_rollover_state(self.scope, id).await?)
    }

    /// Delete the state of `id`
    pub async fn remove(&self, id: &str) -> Result<bool> {
        let _guard = self.locks.lock(id).await;
        Ok(self.store.delete_rollover_state(self.scope, id).await?)
    }

    pub async fn ids(&self) -> Result<Vec<String>> {
        Ok(self.store.list_rollover_ids(self.scope).await?)
    }

    /// Release lock entries of idle ids
    pub fn prune_locks(&self) -> usize {
        self.locks.prune()
    }

    /// Serialized, retried read-modify-write of one state
    ///
    /// `mutate` returning `Ok(None)` means nothing to write.
    async fn update<F>(&self, id: &str, mutate: F) -> Result<Option<ApplyOutcome>>
    where
        F: Fn(&mut RolloverState) -> Result<Option<RolloverReport>>,
    {
        let _guard = self.locks.lock(id).await;
        self.update_locked(id, mutate).await
    }

    /// Retried read-modify-write; the caller holds the lock of `id`
    async fn update_locked<F>(&self, id: &str, mutate: F) -> Result<Option<ApplyOutcome>>
    where
        F: Fn(&mut RolloverState) -> Result<Option<RolloverReport>>,
    {
        for attempt in 1..=self.max_retries {
            let loaded = self.store.load_rollover_state(self.scope, id).await?;
            let mut state = loaded.unwrap_or_else(|| RolloverState::new(id));
            let expected = state.version;

            let Some(report) = mutate(&mut state)? else {
                return Ok(None);
            };
            state.touch();

            match self
                .store
                .save_rollover_state(self.scope, &state, expected)
                .await
            {
                Ok(()) => {
                    return Ok(Some(ApplyOutcome {
                        state,
                        report,
                        attempts: attempt,
                    }))
                }
                Err(StoreError::Conflict { found, .. }) => {
                    if let Some(metrics) = &self.metrics {
                        metrics.write_conflicts.inc();
                    }
                    debug!(id, attempt, expected, found, "Rollover save conflict, retrying");
                }
                Err(err) => return Err(err.into()),
            }
        }

        warn!(id, attempts = self.max_retries, "Rollover retry budget exhausted");
        Err(TallyError::Conflict {
            id: id.to_string(),
            attempts: self.max_retries,
        })
    }
}

/// Per-subject usage counter, broken down by domain
pub struct UsageRolloverCounter {
    engine: RolloverEngine,
    quota: Arc<dyn QuotaPolicy>,
}

impl UsageRolloverCounter {
    pub fn new(store: Arc<dyn RolloverStore>, clock: PeriodClock) -> Self {
        Self::from_engine(RolloverEngine::new(RolloverScope::Subject, store, clock))
    }

    pub fn from_engine(engine: RolloverEngine) -> Self {
        Self {
            engine,
            quota: Arc::new(NoQuota),
        }
    }

    pub fn with_quota_policy(mut self, quota: Arc<dyn QuotaPolicy>) -> Self {
        self.quota = quota;
        self
    }

    pub fn engine(&self) -> &RolloverEngine {
        &self.engine
    }

    /// Absorb a usage delta for a subject on a domain
    pub async fn apply(
        &self,
        subject_id: &str,
        domain_id: &str,
        delta: i64,
        at: DateTime<Utc>,
    ) -> Result<ApplyOutcome> {
        if subject_id.is_empty() || domain_id.is_empty() {
            return Err(TallyError::Validation(
                "subject_id and domain_id are required".into(),
            ));
        }
        if delta < 0 {
            return Err(TallyError::Validation(format!(
                "delta cannot be negative: {}",
                delta
            )));
        }

        let outcome = self.engine.apply(subject_id, domain_id, delta, at).await?;
        self.quota.on_usage(subject_id, &outcome.state).await;
        Ok(outcome)
    }

    pub async fn apply_event(&self, event: &UsageEvent) -> Result<ApplyOutcome> {
        self.apply(&event.subject_id, &event.domain_id, event.delta, event.timestamp)
            .await
    }

    pub async fn roll_forward(&self, subject_id: &str, now: DateTime<Utc>) -> Result<Option<ApplyOutcome>> {
        self.engine.roll_forward(subject_id, now).await
    }

    pub async fn state(&self, subject_id: &str) -> Result<Option<RolloverState>> {
        self.engine.state(subject_id).await
    }

    /// Total usage ever recorded for a subject
    pub async fn lifetime_total(&self, subject_id: &str) -> Result<i128> {
        Ok(self
            .engine
            .state(subject_id)
            .await?
            .map(|s| s.lifetime_total())
            .unwrap_or(0))
    }

    /// Drop all buckets of a deleted subject
    pub async fn remove_subject(&self, subject_id: &str) -> Result<bool> {
        self.engine.remove(subject_id).await
    }

    pub async fn subject_ids(&self) -> Result<Vec<String>> {
        self.engine.ids().await
    }
}
