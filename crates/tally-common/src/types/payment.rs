//! Payment records and their day-level allocations
//!
//! A payment covers an inclusive service window. Its amount is spread over
//! the calendar days of that window, one [`DailyAllocation`] per day, and the
//! allocations sum exactly to the payment amount.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::period::{days_inclusive, Granularity};
use crate::error::{Result, TallyError};

/// Billing input: a lump payment for a service window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub subject_id: String,
    pub amount: Decimal,
    pub period_start: NaiveDate,
    /// Inclusive
    pub period_end: NaiveDate,
    pub remark: Option<String>,
}

impl PaymentRequest {
    pub fn new(
        subject_id: impl Into<String>,
        amount: Decimal,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> Self {
        Self {
            subject_id: subject_id.into(),
            amount,
            period_start,
            period_end,
            remark: None,
        }
    }

    pub fn with_remark(mut self, remark: impl Into<String>) -> Self {
        self.remark = Some(remark.into());
        self
    }

    /// Validate the request before any write
    pub fn validate(&self) -> Result<()> {
        if self.subject_id.is_empty() {
            return Err(TallyError::Validation("subject_id is required".into()));
        }
        validate_window(self.amount, self.period_start, self.period_end)
    }
}

/// Check the amount and window of a payment
pub fn validate_window(amount: Decimal, start: NaiveDate, end: NaiveDate) -> Result<()> {
    if amount < Decimal::ZERO {
        return Err(TallyError::InvalidRange(format!(
            "amount cannot be negative: {}",
            amount
        )));
    }
    if end < start {
        return Err(TallyError::InvalidRange(format!(
            "period end {} is before start {}",
            end, start
        )));
    }
    Ok(())
}

/// Changes to an existing payment; unset fields keep their value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PaymentUpdate {
    pub amount: Option<Decimal>,
    pub period_start: Option<NaiveDate>,
    pub period_end: Option<NaiveDate>,
    pub remark: Option<String>,
}

impl PaymentUpdate {
    /// Whether the update changes how the amount is spread
    pub fn reallocates(&self) -> bool {
        self.amount.is_some() || self.period_start.is_some() || self.period_end.is_some()
    }
}

/// Committed payment with its proration parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub id: Uuid,
    pub subject_id: String,
    pub amount: Decimal,
    pub period_start: NaiveDate,
    /// Inclusive
    pub period_end: NaiveDate,
    /// Computed once at allocation time, never recomputed on read
    pub daily_amount: Decimal,
    pub service_days: i64,
    pub remark: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentRecord {
    /// Whether the record covers exactly this window for this subject
    pub fn same_window(&self, subject_id: &str, start: NaiveDate, end: NaiveDate) -> bool {
        self.subject_id == subject_id && self.period_start == start && self.period_end == end
    }

    pub fn expected_service_days(&self) -> i64 {
        days_inclusive(self.period_start, self.period_end)
    }
}

/// One calendar day's share of a payment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyAllocation {
    pub id: Uuid,
    pub payment_record_id: Uuid,
    pub subject_id: String,
    pub date: NaiveDate,
    /// `YYYYMMDD`
    pub date_key: String,
    pub allocated_amount: Decimal,
    /// Amount of the owning payment
    pub original_amount: Decimal,
    pub service_start: NaiveDate,
    pub service_end: NaiveDate,
    pub created_at: DateTime<Utc>,
}

impl DailyAllocation {
    pub fn new(record: &PaymentRecord, date: NaiveDate, allocated_amount: Decimal) -> Self {
        Self {
            id: Uuid::now_v7(),
            payment_record_id: record.id,
            subject_id: record.subject_id.clone(),
            date,
            date_key: Granularity::Day.key_for_date(date),
            allocated_amount,
            original_amount: record.amount,
            service_start: record.period_start,
            service_end: record.period_end,
            created_at: record.updated_at,
        }
    }
}
