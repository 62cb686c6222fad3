//! Prometheus metrics for the ledger

use prometheus::{IntCounter, Registry};

/// Counters shared by the engine components
pub struct LedgerMetrics {
    pub events_applied: IntCounter,
    pub stale_events: IntCounter,
    pub rejected_events: IntCounter,
    pub inactive_node_events: IntCounter,
    pub write_conflicts: IntCounter,
    pub buckets_rolled: IntCounter,
    pub payments_allocated: IntCounter,
    pub allocation_rows: IntCounter,
    pub duplicate_windows: IntCounter,
    pub transaction_failures: IntCounter,
}

impl LedgerMetrics {
    pub fn new() -> prometheus::Result<Self> {
        Ok(Self {
            events_applied: IntCounter::new(
                "tally_usage_events_applied_total",
                "Usage events absorbed into rollover state",
            )?,
            stale_events: IntCounter::new(
                "tally_usage_events_stale_total",
                "Usage events dropped for being behind the open bucket",
            )?,
            rejected_events: IntCounter::new(
                "tally_usage_events_rejected_total",
                "Usage events failing validation",
            )?,
            inactive_node_events: IntCounter::new(
                "tally_usage_events_inactive_node_total",
                "Usage events refused because their node is inactive",
            )?,
            write_conflicts: IntCounter::new(
                "tally_rollover_write_conflicts_total",
                "Compare-and-swap conflicts on rollover saves",
            )?,
            buckets_rolled: IntCounter::new(
                "tally_buckets_rolled_total",
                "Buckets moved into history",
            )?,
            payments_allocated: IntCounter::new(
                "tally_payments_allocated_total",
                "Payment records committed",
            )?,
            allocation_rows: IntCounter::new(
                "tally_allocation_rows_total",
                "Daily allocation rows committed",
            )?,
            duplicate_windows: IntCounter::new(
                "tally_duplicate_payment_windows_total",
                "Payments skipped because their window already exists",
            )?,
            transaction_failures: IntCounter::new(
                "tally_payment_transaction_failures_total",
                "Payment transactions rolled back",
            )?,
        })
    }

    pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.events_applied.clone()))?;
        registry.register(Box::new(self.stale_events.clone()))?;
        registry.register(Box::new(self.rejected_events.clone()))?;
        registry.register(Box::new(self.inactive_node_events.clone()))?;
        registry.register(Box::new(self.write_conflicts.clone()))?;
        registry.register(Box::new(self.buckets_rolled.clone()))?;
        registry.register(Box::new(self.payments_allocated.clone()))?;
        registry.register(Box::new(self.allocation_rows.clone()))?;
        registry.register(Box::new(self.duplicate_windows.clone()))?;
        registry.register(Box::new(self.transaction_failures.clone()))?;
        Ok(())
    }
}
