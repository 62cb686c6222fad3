//! Error types for the Tally ledger
//!
//! Provides a unified error type plus the storage-layer error reported by
//! persistence backends.

use chrono::NaiveDate;
use thiserror::Error;
use uuid::Uuid;

use crate::types::period::Granularity;

/// Result type alias using TallyError
pub type Result<T> = std::result::Result<T, TallyError>;

/// Unified error type for Tally operations
#[derive(Debug, Error)]
pub enum TallyError {
    // Payment input errors
    #[error("Invalid range: {0}")]
    InvalidRange(String),

    // Usage event arrived behind the stored bucket
    #[error("Stale event for {id}: {granularity} label {label} is behind current {current}")]
    StaleEvent {
        id: String,
        granularity: Granularity,
        label: String,
        current: String,
    },

    // Concurrent writers kept winning the compare-and-swap
    #[error("Write conflict on {id} after {attempts} attempts")]
    Conflict { id: String, attempts: u32 },

    #[error("Duplicate payment window for {subject_id}: {period_start}..={period_end} (existing {existing_id})")]
    DuplicatePaymentWindow {
        subject_id: String,
        period_start: NaiveDate,
        period_end: NaiveDate,
        existing_id: Uuid,
    },

    #[error("Transaction failed: {0}")]
    TransactionFailure(String),

    #[error("Node is inactive: {0}")]
    NodeInactive(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Amount overflow while updating {0}")]
    Overflow(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TallyError {
    /// Whether the error only skips the item it belongs to
    pub fn is_skip(&self) -> bool {
        matches!(
            self,
            TallyError::StaleEvent { .. }
                | TallyError::DuplicatePaymentWindow { .. }
                | TallyError::NodeInactive(_)
        )
    }
}

/// Errors reported by persistence backends
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Version conflict on {id}: expected {expected}, found {found}")]
    Conflict { id: String, expected: u64, found: u64 },

    #[error("Unique constraint violated: {0}")]
    Duplicate(String),

    #[error("Transaction already closed")]
    TransactionClosed,

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for TallyError {
    fn from(err: serde_json::Error) -> Self {
        TallyError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for TallyError {
    fn from(err: anyhow::Error) -> Self {
        TallyError::Internal(err.to_string())
    }
}
