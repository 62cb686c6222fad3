//! Period clock
//!
//! Maps timestamps to canonical, fixed-width period labels:
//! - hour: `YYYYMMDDHH`
//! - day: `YYYYMMDD`
//! - month: `YYYYMM`
//! - year: `YYYY`
//!
//! Labels are zero-padded so that lexicographic order equals chronological
//! order, which the rollover algorithm relies on.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, Offset, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::TallyError;

/// Grouping resolution for buckets and statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Hour,
    Day,
    Month,
    Year,
}

impl Granularity {
    /// Granularities tracked by rollover state, finest first
    pub const ROLLOVER: [Granularity; 3] = [Granularity::Day, Granularity::Month, Granularity::Year];

    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Hour => "hour",
            Granularity::Day => "day",
            Granularity::Month => "month",
            Granularity::Year => "year",
        }
    }

    fn pattern(&self) -> &'static str {
        match self {
            Granularity::Hour => "%Y%m%d%H",
            Granularity::Day => "%Y%m%d",
            Granularity::Month => "%Y%m",
            Granularity::Year => "%Y",
        }
    }

    /// Width of every label at this granularity
    pub fn label_width(&self) -> usize {
        match self {
            Granularity::Hour => 10,
            Granularity::Day => 8,
            Granularity::Month => 6,
            Granularity::Year => 4,
        }
    }

    /// Label for an already-localized timestamp
    pub fn label(&self, local: NaiveDateTime) -> String {
        local.format(self.pattern()).to_string()
    }

    /// Key for a calendar date (hour keys start at midnight)
    pub fn key_for_date(&self, date: NaiveDate) -> String {
        date.format(self.pattern()).to_string()
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = TallyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hour" => Ok(Granularity::Hour),
            "day" => Ok(Granularity::Day),
            "month" => Ok(Granularity::Month),
            "year" => Ok(Granularity::Year),
            other => Err(TallyError::Validation(format!("unknown granularity: {}", other))),
        }
    }
}

/// All labels of a single instant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeriodLabels {
    pub hour: String,
    pub day: String,
    pub month: String,
    pub year: String,
}

impl PeriodLabels {
    pub fn get(&self, granularity: Granularity) -> &str {
        match granularity {
            Granularity::Day => &self.day,
            Granularity::Month => &self.month,
            Granularity::Year => &self.year,
            Granularity::Hour => &self.hour,
        }
    }
}

/// Timestamp to period-label mapping in a fixed UTC offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodClock {
    offset: FixedOffset,
}

impl PeriodClock {
    /// Clock labelling in UTC
    pub fn utc() -> Self {
        Self { offset: Utc.fix() }
    }

    /// Clock labelling at a fixed offset east of UTC
    pub fn with_offset_minutes(minutes: i32) -> crate::Result<Self> {
        let offset = FixedOffset::east_opt(minutes.saturating_mul(60)).ok_or_else(|| {
            TallyError::Config(format!("UTC offset out of range: {} minutes", minutes))
        })?;
        Ok(Self { offset })
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// Wall-clock time at the clock's offset
    pub fn local(&self, at: DateTime<Utc>) -> NaiveDateTime {
        at.with_timezone(&self.offset).naive_local()
    }

    /// Calendar date at the clock's offset
    pub fn local_date(&self, at: DateTime<Utc>) -> NaiveDate {
        self.local(at).date()
    }

    pub fn label_for(&self, at: DateTime<Utc>, granularity: Granularity) -> String {
        granularity.label(self.local(at))
    }

    pub fn labels_for(&self, at: DateTime<Utc>) -> PeriodLabels {
        let local = self.local(at);
        PeriodLabels {
            hour: Granularity::Hour.label(local),
            day: Granularity::Day.label(local),
            month: Granularity::Month.label(local),
            year: Granularity::Year.label(local),
        }
    }
}

impl Default for PeriodClock {
    fn default() -> Self {
        Self::utc()
    }
}

/// Inclusive number of calendar days in `[start, end]`
pub fn days_inclusive(start: NaiveDate, end: NaiveDate) -> i64 {
    (end - start).num_days() + 1
}
