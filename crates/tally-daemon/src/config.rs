//! Daemon configuration
//!
//! Defaults, overridden by an optional `tally.toml` in the working directory,
//! overridden by `TALLY__SECTION__KEY` environment variables (a `.env` file
//! is loaded first if present).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tally_ledger::scheduler::SchedulerConfig;
use tally_ledger::LedgerConfig;

/// Daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TallyConfig {
    pub storage: StorageSettings,
    pub clock: ClockSettings,
    pub scheduler: SchedulerSettings,
    pub ledger: LedgerSettings,
    pub nats: NatsSettings,
}

impl TallyConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::load_from("tally")
    }

    /// Load with `file` (extension optional) as the config file
    pub fn load_from(file: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(file).required(false))
            .add_source(
                config::Environment::with_prefix("TALLY")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("building configuration")?;

        settings
            .try_deserialize()
            .context("deserializing configuration")
    }

    pub fn ledger_config(&self) -> LedgerConfig {
        LedgerConfig {
            clock_offset_minutes: self.clock.offset_minutes,
            max_retries: self.ledger.max_retries,
            currency_scale: self.ledger.currency_scale,
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            poll_interval: Duration::from_secs(self.scheduler.poll_interval_secs),
            rollover_hour: self.scheduler.rollover_hour,
            rollover_minute: self.scheduler.rollover_minute,
        }
    }
}

/// Which store backend to run on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub backend: StorageBackend,
    pub redis_url: String,
    /// Key prefix for every Redis key
    pub key_prefix: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: "tally".to_string(),
        }
    }
}

/// Offset east of UTC that periods are labelled in
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockSettings {
    pub offset_minutes: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub poll_interval_secs: u64,
    pub rollover_hour: u32,
    pub rollover_minute: u32,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        let defaults = SchedulerConfig::default();
        Self {
            poll_interval_secs: defaults.poll_interval.as_secs(),
            rollover_hour: defaults.rollover_hour,
            rollover_minute: defaults.rollover_minute,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerSettings {
    pub max_retries: u32,
    pub currency_scale: u32,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        let defaults = LedgerConfig::default();
        Self {
            max_retries: defaults.max_retries,
            currency_scale: defaults.currency_scale,
        }
    }
}

/// Usage report feed
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NatsSettings {
    /// Subscribe to the data plane's usage reports; without it the daemon
    /// only runs the daily rollover
    pub enabled: bool,
    pub url: String,
    pub subject: String,
    /// Window in which redelivered reports are dropped
    pub dedup_window_ms: u64,
}

impl Default for NatsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "nats://localhost:4222".to_string(),
            subject: "tally.usage".to_string(),
            dedup_window_ms: 60_000,
        }
    }
}
