//! Metering module
//!
//! Usage intake and hierarchical rollover counting:
//! - UsageMeter: upstream source of usage events
//! - UsageRolloverCounter: per-subject day/month/year buckets
//! - NodeTrafficAggregator: per-node buckets with an active flag

pub mod collector;
pub mod locks;
pub mod node;
pub mod quota;
pub mod rollover;

pub use collector::{BufferedUsageMeter, UsageBatch, UsageEvent, UsageMeter, UsageSnapshot};
pub use locks::KeyedLocks;
pub use node::NodeTrafficAggregator;
pub use quota::{MonthlyQuotaPolicy, NoQuota, QuotaAction, QuotaPolicy};
pub use rollover::{ApplyOutcome, RolloverEngine, UsageRolloverCounter};
