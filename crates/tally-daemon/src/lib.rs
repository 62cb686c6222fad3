//! # Tally Daemon
//!
//! Runs the ledger as a service: loads [`config::TallyConfig`], opens the
//! configured store, subscribes to usage reports and drives the scheduler
//! until shutdown.

pub mod config;
pub mod meter;

pub use config::{StorageBackend, TallyConfig};
pub use meter::NatsUsageMeter;
