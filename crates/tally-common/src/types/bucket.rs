//! Period buckets and rollover state
//!
//! A [`RolloverState`] keeps one open bucket per granularity (day, month,
//! year) and an append-only history of the buckets it has closed. Usage is
//! absorbed into all three granularities as one unit: either every bucket is
//! updated or, on a stale or overflowing event, none is.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::period::{Granularity, PeriodLabels};
use crate::error::{Result, TallyError};

/// Accumulator for one period at one granularity
///
/// `amount` always equals the sum of `breakdown` values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodBucket {
    /// Period label, empty before the first event
    pub period: String,
    /// Total usage in the period
    pub amount: i64,
    /// Usage per domain (subject counters) or per subject (node aggregates)
    #[serde(default)]
    pub breakdown: BTreeMap<String, i64>,
}

impl PeriodBucket {
    /// Open an empty bucket for a period
    pub fn opened(period: impl Into<String>) -> Self {
        Self {
            period: period.into(),
            amount: 0,
            breakdown: BTreeMap::new(),
        }
    }

    /// Whether the bucket has been assigned a period
    pub fn is_open(&self) -> bool {
        !self.period.is_empty()
    }

    pub fn breakdown_total(&self) -> i64 {
        self.breakdown.values().sum()
    }

    /// Copy of the bucket with `delta` added under `key`, or None on overflow
    fn with_usage(&self, key: &str, delta: i64) -> Option<Self> {
        let mut next = self.clone();
        next.amount = next.amount.checked_add(delta)?;
        let slot = next.breakdown.entry(key.to_string()).or_insert(0);
        *slot = slot.checked_add(delta)?;
        Some(next)
    }
}

/// Open bucket plus closed history for one granularity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketSeries {
    pub current: PeriodBucket,
    #[serde(default)]
    pub history: Vec<PeriodBucket>,
}

impl BucketSeries {
    /// Sum of every closed bucket plus the open one
    pub fn lifetime_total(&self) -> i128 {
        self.history
            .iter()
            .map(|b| b.amount as i128)
            .sum::<i128>()
            + self.current.amount as i128
    }

    /// Closed bucket for a period, if any
    pub fn closed(&self, period: &str) -> Option<&PeriodBucket> {
        self.history.iter().find(|b| b.period == period)
    }

    /// Close the open bucket and start `next` in its place
    fn close_into(&mut self, next: PeriodBucket) {
        let closed = std::mem::replace(&mut self.current, next);
        self.history.push(closed);
    }
}

/// What one update did to the buckets
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RolloverReport {
    /// Granularities whose open bucket moved into history
    pub rolled: Vec<Granularity>,
}

impl RolloverReport {
    pub fn rolled_count(&self) -> usize {
        self.rolled.len()
    }
}

enum Step {
    Accumulate(PeriodBucket),
    Roll(PeriodBucket),
}

/// Rollover state of one subject or node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloverState {
    /// Subject or node id
    pub id: String,
    /// Compare-and-swap token, bumped on every save
    pub version: u64,
    pub day: BucketSeries,
    pub month: BucketSeries,
    pub year: BucketSeries,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RolloverState {
    /// Fresh state with no open buckets
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            version: 0,
            day: BucketSeries::default(),
            month: BucketSeries::default(),
            year: BucketSeries::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn series(&self, granularity: Granularity) -> Option<&BucketSeries> {
        match granularity {
            Granularity::Day => Some(&self.day),
            Granularity::Month => Some(&self.month),
            Granularity::Year => Some(&self.year),
            Granularity::Hour => None,
        }
    }

    fn series_mut(&mut self, granularity: Granularity) -> Option<&mut BucketSeries> {
        match granularity {
            Granularity::Day => Some(&mut self.day),
            Granularity::Month => Some(&mut self.month),
            Granularity::Year => Some(&mut self.year),
            Granularity::Hour => None,
        }
    }

    /// Total usage ever absorbed, counted at day granularity
    pub fn lifetime_total(&self) -> i128 {
        self.day.lifetime_total()
    }

    /// Absorb `delta` under `key` at the instant described by `labels`
    ///
    /// Rejects the whole event with `StaleEvent` if any label is behind the
    /// open bucket of its granularity.
    pub fn absorb(&mut self, labels: &PeriodLabels, key: &str, delta: i64) -> Result<RolloverReport> {
        let mut steps = Vec::with_capacity(Granularity::ROLLOVER.len());

        for granularity in Granularity::ROLLOVER {
            let label = labels.get(granularity);
            let current = match self.series(granularity) {
                Some(series) => &series.current,
                None => continue,
            };

            let step = if !current.is_open() {
                Step::Accumulate(PeriodBucket::opened(label))
            } else if label == current.period {
                Step::Accumulate(current.clone())
            } else if label > current.period.as_str() {
                Step::Roll(PeriodBucket::opened(label))
            } else {
                return Err(TallyError::StaleEvent {
                    id: self.id.clone(),
                    granularity,
                    label: label.to_string(),
                    current: current.period.clone(),
                });
            };

            let step = match step {
                Step::Accumulate(bucket) => Step::Accumulate(
                    bucket
                        .with_usage(key, delta)
                        .ok_or_else(|| TallyError::Overflow(self.id.clone()))?,
                ),
                Step::Roll(bucket) => Step::Roll(
                    bucket
                        .with_usage(key, delta)
                        .ok_or_else(|| TallyError::Overflow(self.id.clone()))?,
                ),
            };
            steps.push((granularity, step));
        }

        let mut report = RolloverReport::default();
        for (granularity, step) in steps {
            let Some(series) = self.series_mut(granularity) else {
                continue;
            };
            match step {
                Step::Accumulate(bucket) => series.current = bucket,
                Step::Roll(bucket) => {
                    series.close_into(bucket);
                    report.rolled.push(granularity);
                }
            }
        }

        Ok(report)
    }

    /// Close every open bucket whose label is behind `labels`
    ///
    /// Buckets that were never opened, or that are already current, are left
    /// untouched. Labels behind the open bucket are ignored.
    pub fn roll_forward(&mut self, labels: &PeriodLabels) -> RolloverReport {
        let mut report = RolloverReport::default();

        for granularity in Granularity::ROLLOVER {
            let label = labels.get(granularity).to_string();
            let Some(series) = self.series_mut(granularity) else {
                continue;
            };
            if series.current.is_open() && label > series.current.period {
                series.close_into(PeriodBucket::opened(label));
                report.rolled.push(granularity);
            }
        }

        report
    }

    /// Bump the version and modification time ahead of a save
    pub fn touch(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::period::PeriodClock;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn labels(y: i32, m: u32, d: u32) -> PeriodLabels {
        PeriodClock::utc().labels_for(Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap())
    }

    #[test]
    fn test_first_event_opens_buckets() {
        let mut state = RolloverState::new("u1");
        let report = state.absorb(&labels(2024, 3, 5), "d1", 500).unwrap();

        assert_eq!(report.rolled_count(), 0);
        assert_eq!(state.day.current.period, "20240305");
        assert_eq!(state.month.current.period, "202403");
        assert_eq!(state.year.current.period, "2024");
        assert_eq!(state.year.current.breakdown.get("d1"), Some(&500));
        assert!(state.day.history.is_empty());
    }

    #[test]
    fn test_day_rollover_keeps_month_open() {
        let mut state = RolloverState::new("n1");
        state.absorb(&labels(2024, 3, 5), "d1", 500).unwrap();
        let report = state.absorb(&labels(2024, 3, 6), "d1", 300).unwrap();

        assert_eq!(report.rolled, vec![Granularity::Day]);
        assert_eq!(state.day.history.len(), 1);
        assert_eq!(state.day.history[0].period, "20240305");
        assert_eq!(state.day.history[0].amount, 500);
        assert_eq!(state.day.current.period, "20240306");
        assert_eq!(state.day.current.amount, 300);
        assert_eq!(state.month.current.period, "202403");
        assert_eq!(state.month.current.amount, 800);
    }

    #[test]
    fn test_stale_event_leaves_state_untouched() {
        let mut state = RolloverState::new("u1");
        state.absorb(&labels(2024, 3, 6), "d1", 100).unwrap();
        let before = state.clone();

        let err = state.absorb(&labels(2024, 3, 5), "d1", 50).unwrap_err();
        assert!(matches!(
            err,
            TallyError::StaleEvent { granularity: Granularity::Day, .. }
        ));
        assert_eq!(state, before);
    }

    #[test]
    fn test_overflow_rejected_atomically() {
        let mut state = RolloverState::new("u1");
        state.absorb(&labels(2024, 3, 5), "d1", i64::MAX - 1).unwrap();
        let before = state.clone();

        let err = state.absorb(&labels(2024, 3, 5), "d2", 2).unwrap_err();
        assert!(matches!(err, TallyError::Overflow(_)));
        assert_eq!(state, before);
    }

    #[test]
    fn test_roll_forward_closes_stale_buckets() {
        let mut state = RolloverState::new("u1");
        state.absorb(&labels(2024, 12, 30), "d1", 10).unwrap();

        let report = state.roll_forward(&labels(2025, 1, 2));
        assert_eq!(report.rolled_count(), 3);
        assert_eq!(state.day.current, PeriodBucket::opened("20250102"));
        assert_eq!(state.year.history[0].amount, 10);

        // already current: nothing to do
        assert_eq!(state.roll_forward(&labels(2025, 1, 2)).rolled_count(), 0);
    }

    #[test]
    fn test_roll_forward_ignores_unopened_state() {
        let mut state = RolloverState::new("u1");
        assert_eq!(state.roll_forward(&labels(2024, 1, 1)).rolled_count(), 0);
        assert!(!state.day.current.is_open());
    }

    #[test]
    fn test_touch_bumps_version() {
        let mut state = RolloverState::new("u1");
        state.touch();
        state.touch();
        assert_eq!(state.version, 2);
    }

    fn event_stream() -> impl Strategy<Value = Vec<(i64, u8, i64)>> {
        // (hours since 2023-12-25, domain index, delta), sorted by time below
        prop::collection::vec((0i64..24 * 900, 0u8..4, 0i64..10_000), 1..80)
    }

    proptest! {
        #[test]
        fn prop_monotonic_and_consistent(mut events in event_stream()) {
            events.sort_by_key(|(h, _, _)| *h);
            let clock = PeriodClock::utc();
            let origin = Utc.with_ymd_and_hms(2023, 12, 25, 0, 0, 0).unwrap();
            let mut state = RolloverState::new("p1");
            let mut expected_total: i128 = 0;

            for (hours, domain, delta) in events {
                let before = state.clone();
                let at = origin + chrono::Duration::hours(hours);
                state.absorb(&clock.labels_for(at), &format!("d{}", domain), delta).unwrap();
                expected_total += delta as i128;

                for g in Granularity::ROLLOVER {
                    let old = before.series(g).unwrap();
                    let new = state.series(g).unwrap();
                    prop_assert!(new.current.period >= old.current.period);
                    prop_assert!(new.history.len() <= old.history.len() + 1);
                    prop_assert_eq!(new.current.amount, new.current.breakdown_total());
                    prop_assert!(new.history.iter().all(|b| b.period < new.current.period));
                }
            }

            prop_assert_eq!(state.day.lifetime_total(), expected_total);
            prop_assert_eq!(state.month.lifetime_total(), expected_total);
            prop_assert_eq!(state.year.lifetime_total(), expected_total);
        }
    }
}
