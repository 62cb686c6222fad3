//! # Tally Common
//!
//! Shared types and errors for the Tally usage ledger.
//!
//! ## Core Types
//!
//! - [`PeriodClock`]: timestamp to `YYYYMMDDHH`/`YYYYMMDD`/`YYYYMM`/`YYYY` labels
//! - [`PeriodBucket`]/[`RolloverState`]: hierarchical usage buckets with history
//! - [`PaymentRecord`]/[`DailyAllocation`]: payment amortization ledger rows
//! - [`TallyError`]: unified error taxonomy

pub mod error;
pub mod types;

// Re-export commonly used types at crate root
pub use error::{Result, StoreError, TallyError};
pub use types::{
    bucket::{BucketSeries, PeriodBucket, RolloverReport, RolloverState},
    payment::{DailyAllocation, PaymentRecord, PaymentRequest, PaymentUpdate},
    period::{days_inclusive, Granularity, PeriodClock, PeriodLabels},
};

/// Tally version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Decimal places money is allocated at
pub const DEFAULT_CURRENCY_SCALE: u32 = 2;

/// Compare-and-swap attempts before a rollover update gives up
pub const DEFAULT_MAX_RETRIES: u32 = 5;
