//! Quota policy hooks
//!
//! The counter reports fresh state to a [`QuotaPolicy`] after every applied
//! event. Deciding what happens to an over-quota subject stays with the
//! caller's [`QuotaAction`].

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tally_common::RolloverState;
use tracing::{info, warn};

/// Observer of subject usage after each applied event
#[async_trait]
pub trait QuotaPolicy: Send + Sync {
    async fn on_usage(&self, subject_id: &str, state: &RolloverState);
}

/// Policy that ignores usage
#[derive(Debug, Default, Clone, Copy)]
pub struct NoQuota;

#[async_trait]
impl QuotaPolicy for NoQuota {
    async fn on_usage(&self, _subject_id: &str, _state: &RolloverState) {}
}

/// Caller-supplied reaction to a subject exceeding its quota
#[async_trait]
pub trait QuotaAction: Send + Sync {
    async fn over_quota(&self, subject_id: &str, period: &str, used: i64, limit: i64);
}

/// Monthly usage limits per subject
///
/// Fires the action once per subject per month, when the open month bucket
/// first reaches the limit.
pub struct MonthlyQuotaPolicy {
    limits: DashMap<String, i64>,
    notified: DashMap<String, String>,
    action: Arc<dyn QuotaAction>,
}

impl MonthlyQuotaPolicy {
    pub fn new(action: Arc<dyn QuotaAction>) -> Self {
        Self {
            limits: DashMap::new(),
            notified: DashMap::new(),
            action,
        }
    }

    pub fn set_limit(&self, subject_id: &str, limit: i64) {
        self.limits.insert(subject_id.to_string(), limit);
        self.notified.remove(subject_id);
    }

    pub fn clear_limit(&self, subject_id: &str) {
        self.limits.remove(subject_id);
        self.notified.remove(subject_id);
    }

    pub fn limit(&self, subject_id: &str) -> Option<i64> {
        self.limits.get(subject_id).map(|l| *l)
    }
}

#[async_trait]
impl QuotaPolicy for MonthlyQuotaPolicy {
    async fn on_usage(&self, subject_id: &str, state: &RolloverState) {
        let Some(limit) = self.limit(subject_id) else {
            return;
        };
        let month = &state.month.current;
        if month.amount < limit {
            return;
        }
        let already = self
            .notified
            .get(subject_id)
            .map(|period| *period == month.period)
            .unwrap_or(false);
        if already {
            return;
        }

        warn!(
            subject = subject_id,
            period = %month.period,
            used = month.amount,
            limit,
            "Subject reached monthly quota"
        );
        self.notified
            .insert(subject_id.to_string(), month.period.clone());
        self.action
            .over_quota(subject_id, &month.period, month.amount, limit)
            .await;
        info!(subject = subject_id, "Quota action invoked");
    }
}
