//! # Tally Ledger
//!
//! Usage accounting and billing allocation.
//!
//! ## Rollover
//!
//! ```text
//! event(subject, domain, delta, t)
//!   -> labels(t) = YYYYMMDD / YYYYMM / YYYY
//!   -> per granularity: accumulate | close into history + open | stale
//! ```
//!
//! ## Proration
//!
//! ```text
//! daily = trunc(amount / days, scale)
//! last  = amount - daily * (days - 1)
//! ```

pub mod billing;
pub mod metering;
pub mod metrics;
pub mod scheduler;
pub mod store;

use std::sync::Arc;
use tally_common::{PeriodClock, Result, DEFAULT_CURRENCY_SCALE, DEFAULT_MAX_RETRIES};

use billing::{PaymentProrationEngine, StatisticsRollup};
use metering::{
    NoQuota, NodeTrafficAggregator, QuotaPolicy, RolloverEngine, UsageMeter, UsageRolloverCounter,
};
use metrics::LedgerMetrics;
use scheduler::{Scheduler, SchedulerConfig};
use store::{RolloverScope, StorageContext};

/// Ledger configuration
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Offset east of UTC that period labels are computed in
    pub clock_offset_minutes: i32,
    /// Compare-and-swap attempts per rollover update
    pub max_retries: u32,
    /// Decimal places allocations are truncated to
    pub currency_scale: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            clock_offset_minutes: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            currency_scale: DEFAULT_CURRENCY_SCALE,
        }
    }
}

/// Engine components wired to one storage context
pub struct Ledger {
    pub counter: Arc<UsageRolloverCounter>,
    pub nodes: Arc<NodeTrafficAggregator>,
    pub billing: Arc<PaymentProrationEngine>,
    pub statistics: Arc<StatisticsRollup>,
    clock: PeriodClock,
    metrics: Option<Arc<LedgerMetrics>>,
}

impl Ledger {
    pub fn new(storage: StorageContext, config: &LedgerConfig) -> Result<Self> {
        Self::build(storage, config, None, Arc::new(NoQuota))
    }

    /// Ledger whose components report into `metrics`
    pub fn with_metrics(
        storage: StorageContext,
        config: &LedgerConfig,
        metrics: Arc<LedgerMetrics>,
        quota: Arc<dyn QuotaPolicy>,
    ) -> Result<Self> {
        Self::build(storage, config, Some(metrics), quota)
    }

    fn build(
        storage: StorageContext,
        config: &LedgerConfig,
        metrics: Option<Arc<LedgerMetrics>>,
        quota: Arc<dyn QuotaPolicy>,
    ) -> Result<Self> {
        let clock = PeriodClock::with_offset_minutes(config.clock_offset_minutes)?;

        let engine = |scope| {
            let engine = RolloverEngine::new(scope, storage.rollover.clone(), clock)
                .with_max_retries(config.max_retries);
            match &metrics {
                Some(m) => engine.with_metrics(m.clone()),
                None => engine,
            }
        };
        let counter = UsageRolloverCounter::from_engine(engine(RolloverScope::Subject))
            .with_quota_policy(quota);
        let nodes = NodeTrafficAggregator::from_engine(engine(RolloverScope::Node));

        let mut billing = PaymentProrationEngine::new(storage.payments.clone())
            .with_currency_scale(config.currency_scale);
        if let Some(m) = &metrics {
            billing = billing.with_metrics(m.clone());
        }

        Ok(Self {
            counter: Arc::new(counter),
            nodes: Arc::new(nodes),
            billing: Arc::new(billing),
            statistics: Arc::new(StatisticsRollup::new(storage.payments)),
            clock,
            metrics,
        })
    }

    pub fn clock(&self) -> &PeriodClock {
        &self.clock
    }

    /// Scheduler driving this ledger from `meter`
    pub fn scheduler(&self, meter: Arc<dyn UsageMeter>, config: SchedulerConfig) -> Result<Scheduler> {
        let scheduler = Scheduler::new(meter, self.counter.clone(), self.nodes.clone(), config)?;
        Ok(match &self.metrics {
            Some(m) => scheduler.with_metrics(m.clone()),
            None => scheduler,
        })
    }
}
