//! Allocation statistics
//!
//! Rolls daily allocations up to day, month or year totals for revenue
//! reporting.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tally_common::{DailyAllocation, Granularity, Result, TallyError};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::store::PaymentStore;

/// Totals for one period key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationStat {
    /// `YYYYMMDD`, `YYYYMM` or `YYYY`
    pub key: String,
    pub total_amount: Decimal,
    /// Allocation rows in the period
    pub payment_count: u64,
    pub distinct_subject_count: u64,
}

#[derive(Default)]
struct Group<'a> {
    total: Decimal,
    rows: u64,
    subjects: HashSet<&'a str>,
}

/// Group allocations by the period key of `granularity`, ascending
pub fn group_allocations(granularity: Granularity, rows: &[DailyAllocation]) -> Vec<AllocationStat> {
    let mut groups: BTreeMap<String, Group<'_>> = BTreeMap::new();
    for row in rows {
        let group = groups
            .entry(granularity.key_for_date(row.date))
            .or_default();
        group.total += row.allocated_amount;
        group.rows += 1;
        group.subjects.insert(row.subject_id.as_str());
    }

    groups
        .into_iter()
        .map(|(key, group)| AllocationStat {
            key,
            total_amount: group.total,
            payment_count: group.rows,
            distinct_subject_count: group.subjects.len() as u64,
        })
        .collect()
}

fn check_query(granularity: Granularity, start: NaiveDate, end: NaiveDate) -> Result<()> {
    if granularity == Granularity::Hour {
        return Err(TallyError::Validation(
            "allocations are daily; hour granularity is not supported".into(),
        ));
    }
    if end < start {
        return Err(TallyError::InvalidRange(format!(
            "range end {} is before start {}",
            end, start
        )));
    }
    Ok(())
}

/// Read-only rollup over the allocation table
pub struct StatisticsRollup {
    store: Arc<dyn PaymentStore>,
}

impl StatisticsRollup {
    pub fn new(store: Arc<dyn PaymentStore>) -> Self {
        Self { store }
    }

    /// Totals per period for allocations dated in `[start, end]`
    #[instrument(skip(self))]
    pub async fn aggregate(
        &self,
        granularity: Granularity,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<AllocationStat>> {
        check_query(granularity, start, end)?;
        let rows = self.store.query_allocations(start, end).await?;
        debug!(rows = rows.len(), "Aggregating allocations");
        Ok(group_allocations(granularity, &rows))
    }

    /// Same as [`aggregate`](Self::aggregate), limited to one subject
    #[instrument(skip(self))]
    pub async fn aggregate_for_subject(
        &self,
        subject_id: &str,
        granularity: Granularity,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<AllocationStat>> {
        check_query(granularity, start, end)?;
        let rows: Vec<DailyAllocation> = self
            .store
            .query_allocations(start, end)
            .await?
            .into_iter()
            .filter(|row| row.subject_id == subject_id)
            .collect();
        Ok(group_allocations(granularity, &rows))
    }

    /// Allocation rows of one payment inside a range
    pub async fn payment_rows(
        &self,
        payment_id: Uuid,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyAllocation>> {
        if end < start {
            return Err(TallyError::InvalidRange(format!(
                "range end {} is before start {}",
                end, start
            )));
        }
        Ok(self
            .store
            .allocations_for(payment_id)
            .await?
            .into_iter()
            .filter(|row| row.date >= start && row.date <= end)
            .collect())
    }
}
