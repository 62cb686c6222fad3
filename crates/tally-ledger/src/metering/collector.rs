//! Usage events and the upstream meter contract
//!
//! The data plane reports raw traffic numbers; the engine treats them as
//! untrusted input:
//! - Event validation and deduplication
//! - Grouping by subject and by node for serial application
//! - A buffering meter that push-based sources feed between polls

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tally_common::{Result, TallyError};
use tracing::debug;
use uuid::Uuid;

/// Usage delta reported for one subject on one domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEvent {
    /// Report id, used to drop redelivered reports
    #[serde(default = "Uuid::now_v7")]
    pub event_id: Uuid,
    /// Metered user
    pub subject_id: String,
    /// Node/domain that carried the traffic
    pub domain_id: String,
    /// Bytes (or other units) consumed since the previous report
    pub delta: i64,
    pub timestamp: DateTime<Utc>,
}

impl UsageEvent {
    pub fn new(
        subject_id: impl Into<String>,
        domain_id: impl Into<String>,
        delta: i64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            subject_id: subject_id.into(),
            domain_id: domain_id.into(),
            delta,
            timestamp,
        }
    }

    /// Validate the event
    pub fn validate(&self) -> Result<()> {
        if self.subject_id.is_empty() {
            return Err(TallyError::Validation("subject_id is required".into()));
        }
        if self.domain_id.is_empty() {
            return Err(TallyError::Validation("domain_id is required".into()));
        }
        if self.delta < 0 {
            return Err(TallyError::Validation(format!(
                "delta cannot be negative: {}",
                self.delta
            )));
        }
        Ok(())
    }
}

/// Events returned by one meter poll
#[derive(Debug, Clone, Default)]
pub struct UsageSnapshot {
    pub events: Vec<UsageEvent>,
    /// Checkpoint to pass to the next poll
    pub checkpoint: Option<DateTime<Utc>>,
}

/// Validated events of a snapshot grouped for serial application
#[derive(Debug, Clone, Default)]
pub struct UsageBatch {
    pub batch_id: Uuid,
    /// Subject id -> events in timestamp order
    pub by_subject: BTreeMap<String, Vec<UsageEvent>>,
    /// Node id -> events in timestamp order
    pub by_node: BTreeMap<String, Vec<UsageEvent>>,
    /// Events that failed validation
    pub rejected: Vec<(UsageEvent, String)>,
}

impl UsageBatch {
    pub fn from_events(events: Vec<UsageEvent>) -> Self {
        let mut batch = Self {
            batch_id: Uuid::now_v7(),
            ..Default::default()
        };

        for event in events {
            if let Err(err) = event.validate() {
                batch.rejected.push((event, err.to_string()));
                continue;
            }
            batch
                .by_node
                .entry(event.domain_id.clone())
                .or_default()
                .push(event.clone());
            batch
                .by_subject
                .entry(event.subject_id.clone())
                .or_default()
                .push(event);
        }

        // stable sort keeps report order for equal timestamps
        for events in batch.by_subject.values_mut().chain(batch.by_node.values_mut()) {
            events.sort_by_key(|e| e.timestamp);
        }

        batch
    }

    /// Number of valid events
    pub fn len(&self) -> usize {
        self.by_subject.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_subject.is_empty()
    }

    /// Total delta across valid events
    pub fn total_delta(&self) -> i128 {
        self.by_subject
            .values()
            .flatten()
            .map(|e| e.delta as i128)
            .sum()
    }
}

/// Source of usage deltas
#[async_trait]
pub trait UsageMeter: Send + Sync {
    /// Usage reported since `checkpoint` (everything available if `None`)
    async fn usage_since(&self, checkpoint: Option<DateTime<Utc>>) -> Result<UsageSnapshot>;
}

/// Meter fed by pushes and drained by polls
///
/// Reports redelivered within the dedup window are dropped.
#[derive(Debug)]
pub struct BufferedUsageMeter {
    pending: Mutex<Vec<UsageEvent>>,
    seen_events: DashMap<Uuid, i64>,
    dedup_window_ms: i64,
}

impl BufferedUsageMeter {
    pub fn new(dedup_window_ms: u64) -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            seen_events: DashMap::new(),
            dedup_window_ms: dedup_window_ms as i64,
        }
    }

    /// Queue an event; returns false if it was a duplicate
    pub fn push(&self, event: UsageEvent) -> bool {
        let now = Utc::now().timestamp_millis();
        if let Some(seen_at) = self.seen_events.get(&event.event_id) {
            if now - *seen_at < self.dedup_window_ms {
                debug!(event_id = %event.event_id, "Deduplicated usage event");
                return false;
            }
        }
        self.seen_events.insert(event.event_id, now);
        self.pending.lock().push(event);
        true
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Forget event ids older than the dedup window
    pub fn cleanup(&self) {
        let now = Utc::now().timestamp_millis();
        let window = self.dedup_window_ms;
        self.seen_events.retain(|_, seen_at| now - *seen_at < window);
    }
}

impl Default for BufferedUsageMeter {
    fn default() -> Self {
        Self::new(60_000)
    }
}

#[async_trait]
impl UsageMeter for BufferedUsageMeter {
    async fn usage_since(&self, checkpoint: Option<DateTime<Utc>>) -> Result<UsageSnapshot> {
        let events = std::mem::take(&mut *self.pending.lock());
        self.cleanup();
        let checkpoint = events
            .iter()
            .map(|e| e.timestamp)
            .max()
            .max(checkpoint);
        Ok(UsageSnapshot { events, checkpoint })
    }
}
