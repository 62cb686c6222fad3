//! Tally daemon binary

use std::sync::Arc;

use anyhow::Result;
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tally_daemon::{NatsUsageMeter, StorageBackend, TallyConfig};
use tally_ledger::metering::{BufferedUsageMeter, NoQuota, UsageMeter};
use tally_ledger::metrics::LedgerMetrics;
use tally_ledger::store::{RedisStore, StorageContext};
use tally_ledger::Ledger;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Tally daemon v{}", tally_common::VERSION);

    let config = TallyConfig::load()?;
    info!("Loaded configuration: {:?}", config);

    let storage = match config.storage.backend {
        StorageBackend::Memory => {
            warn!("Using in-memory storage; state is lost on exit");
            StorageContext::in_memory()
        }
        StorageBackend::Redis => {
            let store =
                RedisStore::connect(&config.storage.redis_url, &config.storage.key_prefix).await?;
            info!("Connected to Redis at {}", config.storage.redis_url);
            StorageContext::new(Arc::new(store))
        }
    };

    let registry = Registry::new();
    let metrics = Arc::new(LedgerMetrics::new()?);
    metrics.register(&registry)?;

    let ledger = Ledger::with_metrics(
        storage,
        &config.ledger_config(),
        metrics,
        Arc::new(NoQuota),
    )?;

    let meter: Arc<dyn UsageMeter> = if config.nats.enabled {
        Arc::new(
            NatsUsageMeter::connect(
                &config.nats.url,
                &config.nats.subject,
                config.nats.dedup_window_ms,
            )
            .await?,
        )
    } else {
        info!("NATS feed disabled; only daily rollover will run");
        Arc::new(BufferedUsageMeter::new(config.nats.dedup_window_ms))
    };

    let scheduler = Arc::new(ledger.scheduler(meter, config.scheduler_config())?);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = scheduler.run(shutdown_rx);

    info!("Tally daemon running");
    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    let _ = shutdown_tx.send(true);
    if let Err(e) = handle.await {
        warn!("Scheduler task ended abnormally: {}", e);
    }

    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    info!("Final metrics:\n{}", String::from_utf8_lossy(&buffer));

    info!("Tally daemon stopped");
    Ok(())
}
