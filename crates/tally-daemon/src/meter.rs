//! NATS-fed usage meter
//!
//! The data plane publishes one JSON usage report per message. Reports are
//! decoded and buffered until the scheduler's next poll drains them.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::sync::Arc;
use tally_common::TallyError;
use tally_ledger::metering::{BufferedUsageMeter, UsageEvent, UsageMeter, UsageSnapshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Decode one usage report
pub fn decode_report(payload: &[u8]) -> tally_common::Result<UsageEvent> {
    let event: UsageEvent = serde_json::from_slice(payload)
        .map_err(|e| TallyError::Serialization(e.to_string()))?;
    Ok(event)
}

pub struct NatsUsageMeter {
    buffer: Arc<BufferedUsageMeter>,
    listener: JoinHandle<()>,
}

impl NatsUsageMeter {
    /// Connect and start buffering reports published on `subject`
    pub async fn connect(url: &str, subject: &str, dedup_window_ms: u64) -> Result<Self> {
        let client = async_nats::connect(url)
            .await
            .with_context(|| format!("connecting to NATS at {}", url))?;
        let mut subscriber = client
            .subscribe(subject.to_string())
            .await
            .with_context(|| format!("subscribing to {}", subject))?;
        info!(url, subject, "Subscribed to usage reports");

        let buffer = Arc::new(BufferedUsageMeter::new(dedup_window_ms));
        let sink = buffer.clone();
        let listener = tokio::spawn(async move {
            // the client must outlive the subscription
            let _client = client;
            while let Some(message) = subscriber.next().await {
                match decode_report(&message.payload) {
                    Ok(event) => {
                        if !sink.push(event) {
                            debug!("Dropped redelivered usage report");
                        }
                    }
                    Err(e) => warn!("Undecodable usage report: {}", e),
                }
            }
            info!("Usage report subscription closed");
        });

        Ok(Self { buffer, listener })
    }

    pub fn pending(&self) -> usize {
        self.buffer.pending_len()
    }
}

impl Drop for NatsUsageMeter {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

#[async_trait]
impl UsageMeter for NatsUsageMeter {
    async fn usage_since(&self, checkpoint: Option<DateTime<Utc>>) -> tally_common::Result<UsageSnapshot> {
        self.buffer.usage_since(checkpoint).await
    }
}
