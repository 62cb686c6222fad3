//! Core data types for the Tally ledger

pub mod bucket;
pub mod payment;
pub mod period;
