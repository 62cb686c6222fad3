//! Billing module
//!
//! Payment amortization and revenue statistics:
//! - PaymentProrationEngine: spreads payments into daily allocations
//! - StatisticsRollup: day/month/year totals over allocations

pub mod proration;
pub mod statistics;

pub use proration::{
    prorate, ImportOutcome, ImportReport, PaymentProrationEngine, Proration, MAX_SERVICE_DAYS,
};
pub use statistics::{group_allocations, AllocationStat, StatisticsRollup};
