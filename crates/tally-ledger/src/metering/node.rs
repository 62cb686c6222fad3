//! Per-node traffic aggregation
//!
//! Same rollover rules as subject counters, keyed by node with the
//! breakdown taken per subject. Nodes marked inactive refuse new usage.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tally_common::{PeriodClock, Result, RolloverState, TallyError};
use tracing::{info, warn};

use super::collector::UsageEvent;
use super::rollover::{ApplyOutcome, RolloverEngine};
use crate::store::{RolloverScope, RolloverStore};

pub struct NodeTrafficAggregator {
    engine: RolloverEngine,
}

impl NodeTrafficAggregator {
    pub fn new(store: Arc<dyn RolloverStore>, clock: PeriodClock) -> Self {
        Self::from_engine(RolloverEngine::new(RolloverScope::Node, store, clock))
    }

    pub fn from_engine(engine: RolloverEngine) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &RolloverEngine {
        &self.engine
    }

    /// Absorb a subject's traffic into the node aggregate
    ///
    /// Fails with `NodeInactive` for nodes marked inactive.
    pub async fn apply(
        &self,
        node_id: &str,
        subject_id: &str,
        delta: i64,
        at: DateTime<Utc>,
    ) -> Result<ApplyOutcome> {
        if node_id.is_empty() || subject_id.is_empty() {
            return Err(TallyError::Validation(
                "node_id and subject_id are required".into(),
            ));
        }
        if delta < 0 {
            return Err(TallyError::Validation(format!(
                "delta cannot be negative: {}",
                delta
            )));
        }
        let held = self.engine.lock(node_id).await;
        if !self.is_active(node_id).await? {
            warn!(node = node_id, "Usage reported for inactive node");
            return Err(TallyError::NodeInactive(node_id.to_string()));
        }

        self.engine
            .apply_locked(&held, node_id, subject_id, delta, at)
            .await
    }

    pub async fn apply_event(&self, event: &UsageEvent) -> Result<ApplyOutcome> {
        self.apply(&event.domain_id, &event.subject_id, event.delta, event.timestamp)
            .await
    }

    /// Refuse usage for `node_id` from the next apply on
    ///
    /// Waits for an apply already holding the node to finish.
    pub async fn mark_inactive(&self, node_id: &str) -> Result<()> {
        let _held = self.engine.lock(node_id).await;
        self.engine.store().set_node_active(node_id, false).await?;
        info!(node = node_id, "Node marked inactive");
        Ok(())
    }

    pub async fn mark_active(&self, node_id: &str) -> Result<()> {
        let _held = self.engine.lock(node_id).await;
        self.engine.store().set_node_active(node_id, true).await?;
        info!(node = node_id, "Node marked active");
        Ok(())
    }

    pub async fn is_active(&self, node_id: &str) -> Result<bool> {
        Ok(self.engine.store().is_node_active(node_id).await?)
    }

    pub async fn roll_forward(&self, node_id: &str, now: DateTime<Utc>) -> Result<Option<ApplyOutcome>> {
        self.engine.roll_forward(node_id, now).await
    }

    pub async fn state(&self, node_id: &str) -> Result<Option<RolloverState>> {
        self.engine.state(node_id).await
    }

    pub async fn remove_node(&self, node_id: &str) -> Result<bool> {
        self.engine.remove(node_id).await
    }

    pub async fn node_ids(&self) -> Result<Vec<String>> {
        self.engine.ids().await
    }
}
