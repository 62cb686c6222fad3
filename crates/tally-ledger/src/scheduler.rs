//! Background driver
//!
//! Polls the usage meter on a fixed interval and fans each snapshot out per
//! subject and per node. Once a day, shortly after local midnight, it drains
//! the meter and then rolls stale buckets forward for every known subject and
//! node so idle ids still close their periods.

use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use tally_common::{PeriodClock, Result, TallyError};
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::metering::{NodeTrafficAggregator, UsageBatch, UsageEvent, UsageMeter, UsageRolloverCounter};
use crate::metrics::LedgerMetrics;

/// Scheduler timing
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    /// Local hour of the daily rollover
    pub rollover_hour: u32,
    pub rollover_minute: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(600),
            rollover_hour: 0,
            rollover_minute: 5,
        }
    }
}

impl SchedulerConfig {
    pub fn rollover_time(&self) -> Result<NaiveTime> {
        NaiveTime::from_hms_opt(self.rollover_hour, self.rollover_minute, 0).ok_or_else(|| {
            TallyError::Config(format!(
                "invalid rollover time {:02}:{:02}",
                self.rollover_hour, self.rollover_minute
            ))
        })
    }
}

/// First instant after `now` whose local time is `at`
pub fn next_rollover(now: DateTime<Utc>, clock: &PeriodClock, at: NaiveTime) -> DateTime<Utc> {
    let local = clock.local(now);
    let mut candidate = local.date().and_time(at);
    if candidate <= local {
        candidate += ChronoDuration::days(1);
    }
    let offset = ChronoDuration::seconds(clock.offset().local_minus_utc() as i64);
    Utc.from_utc_datetime(&(candidate - offset))
}

/// What one poll did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    pub batch_id: Uuid,
    pub events: usize,
    pub rejected: usize,
    pub subjects: GroupTally,
    pub nodes: GroupTally,
}

/// Event outcomes across the groups of one side of a batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupTally {
    pub applied: usize,
    pub stale: usize,
    /// Events for inactive nodes
    pub inactive: usize,
    pub failed: usize,
}

impl GroupTally {
    fn merge(&mut self, other: GroupTally) {
        self.applied += other.applied;
        self.stale += other.stale;
        self.inactive += other.inactive;
        self.failed += other.failed;
    }

    fn record(&mut self, id: &str, result: Result<()>) {
        match result {
            Ok(()) => self.applied += 1,
            Err(TallyError::StaleEvent { .. }) => self.stale += 1,
            Err(TallyError::NodeInactive(_)) => self.inactive += 1,
            Err(err) => {
                warn!(id, error = %err, "Usage event failed");
                self.failed += 1;
            }
        }
    }
}

/// Next daily rollover instant
///
/// Advances only after the rollover ran; an overdue deadline fires at once.
#[derive(Debug, Clone, Copy)]
struct RolloverDeadline {
    clock: PeriodClock,
    at: NaiveTime,
    next: DateTime<Utc>,
}

impl RolloverDeadline {
    fn new(now: DateTime<Utc>, clock: PeriodClock, at: NaiveTime) -> Self {
        Self {
            clock,
            at,
            next: next_rollover(now, &clock, at),
        }
    }

    fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.next - now).to_std().unwrap_or(Duration::ZERO)
    }

    fn advance(&mut self, now: DateTime<Utc>) {
        self.next = next_rollover(now.max(self.next), &self.clock, self.at);
    }
}

/// What one daily rollover did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RollReport {
    /// Buffered subject events applied before rolling
    pub drained: usize,
    pub subjects_rolled: usize,
    pub nodes_rolled: usize,
    pub failed: usize,
}

pub struct Scheduler {
    meter: Arc<dyn UsageMeter>,
    counter: Arc<UsageRolloverCounter>,
    nodes: Arc<NodeTrafficAggregator>,
    config: SchedulerConfig,
    rollover_at: NaiveTime,
    checkpoint: Mutex<Option<DateTime<Utc>>>,
    metrics: Option<Arc<LedgerMetrics>>,
}

impl Scheduler {
    pub fn new(
        meter: Arc<dyn UsageMeter>,
        counter: Arc<UsageRolloverCounter>,
        nodes: Arc<NodeTrafficAggregator>,
        config: SchedulerConfig,
    ) -> Result<Self> {
        if config.poll_interval.is_zero() {
            return Err(TallyError::Config("poll interval must be positive".into()));
        }
        let rollover_at = config.rollover_time()?;
        Ok(Self {
            meter,
            counter,
            nodes,
            config,
            rollover_at,
            checkpoint: Mutex::new(None),
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<LedgerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn checkpoint(&self) -> Option<DateTime<Utc>> {
        *self.checkpoint.lock().await
    }

    /// Pull new usage and apply it
    ///
    /// Each subject's (and node's) events are applied serially in timestamp
    /// order; different ids run concurrently.
    pub async fn poll_once(&self) -> Result<PollReport> {
        let mut checkpoint = self.checkpoint.lock().await;
        let snapshot = self.meter.usage_since(*checkpoint).await?;
        *checkpoint = snapshot.checkpoint.or(*checkpoint);

        let events = snapshot.events.len();
        let batch = UsageBatch::from_events(snapshot.events);
        for (event, reason) in &batch.rejected {
            warn!(event_id = %event.event_id, reason = %reason, "Rejected usage event");
        }
        if let Some(metrics) = &self.metrics {
            metrics.rejected_events.inc_by(batch.rejected.len() as u64);
        }

        let mut report = PollReport {
            batch_id: batch.batch_id,
            events,
            rejected: batch.rejected.len(),
            ..Default::default()
        };

        let counter = self.counter.clone();
        report.subjects = fan_out(batch.by_subject, move |subject_id, events| {
            let counter = counter.clone();
            async move {
                let mut tally = GroupTally::default();
                for event in &events {
                    let result = counter.apply_event(event).await.map(|_| ());
                    tally.record(&subject_id, result);
                }
                tally
            }
        })
        .await;

        let nodes = self.nodes.clone();
        report.nodes = fan_out(batch.by_node, move |node_id, events| {
            let nodes = nodes.clone();
            async move {
                let mut tally = GroupTally::default();
                for event in &events {
                    let result = nodes.apply_event(event).await.map(|_| ());
                    tally.record(&node_id, result);
                }
                tally
            }
        })
        .await;

        if let Some(metrics) = &self.metrics {
            metrics.inactive_node_events.inc_by(report.nodes.inactive as u64);
        }
        info!(
            batch = %report.batch_id,
            events = report.events,
            applied = report.subjects.applied,
            stale = report.subjects.stale,
            inactive = report.nodes.inactive,
            "Usage poll complete"
        );
        Ok(report)
    }

    /// Roll stale buckets of every known subject and node to `now`
    ///
    /// Usage still buffered in the meter is applied first, so events from
    /// the closing day land in its bucket instead of coming back stale.
    pub async fn roll_stale(&self, now: DateTime<Utc>) -> Result<RollReport> {
        let drained = self.poll_once().await?;
        let mut report = RollReport {
            drained: drained.subjects.applied,
            ..Default::default()
        };

        for subject_id in self.counter.subject_ids().await? {
            match self.counter.roll_forward(&subject_id, now).await {
                Ok(Some(_)) => report.subjects_rolled += 1,
                Ok(None) => {}
                Err(err) => {
                    error!(subject = %subject_id, error = %err, "Daily rollover failed");
                    report.failed += 1;
                }
            }
        }

        for node_id in self.nodes.node_ids().await? {
            match self.nodes.roll_forward(&node_id, now).await {
                Ok(Some(_)) => report.nodes_rolled += 1,
                Ok(None) => {}
                Err(err) => {
                    error!(node = %node_id, error = %err, "Daily rollover failed");
                    report.failed += 1;
                }
            }
        }

        let pruned = self.counter.engine().prune_locks() + self.nodes.engine().prune_locks();
        info!(
            drained = report.drained,
            subjects = report.subjects_rolled,
            nodes = report.nodes_rolled,
            failed = report.failed,
            pruned_locks = pruned,
            "Daily rollover complete"
        );
        Ok(report)
    }

    /// Run until `shutdown` turns true or its sender is dropped
    pub fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut poll_timer = tokio::time::interval(self.config.poll_interval);
            poll_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let clock = *self.counter.engine().clock();
            let mut deadline = RolloverDeadline::new(Utc::now(), clock, self.rollover_at);

            info!(
                poll_secs = self.config.poll_interval.as_secs(),
                rollover_at = %self.rollover_at,
                "Scheduler started"
            );

            loop {
                let until_rollover = deadline.remaining(Utc::now());

                tokio::select! {
                    _ = poll_timer.tick() => {
                        if let Err(e) = self.poll_once().await {
                            error!("Usage poll failed: {}", e);
                        }
                    }

                    _ = tokio::time::sleep(until_rollover) => {
                        let now = Utc::now();
                        if let Err(e) = self.roll_stale(now).await {
                            error!("Daily rollover failed: {}", e);
                        }
                        deadline.advance(now);
                        debug!(next = %deadline.next, "Next daily rollover scheduled");
                    }

                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Scheduler shutting down");
                            break;
                        }
                    }
                }
            }
        })
    }
}

/// Run one task per group and sum their tallies
async fn fan_out<F, Fut>(
    groups: std::collections::BTreeMap<String, Vec<UsageEvent>>,
    work: F,
) -> GroupTally
where
    F: Fn(String, Vec<UsageEvent>) -> Fut,
    Fut: std::future::Future<Output = GroupTally> + Send + 'static,
{
    let mut set = JoinSet::new();
    for (id, events) in groups {
        debug!(id = %id, events = events.len(), "Dispatching usage group");
        set.spawn(work(id, events));
    }

    let mut total = GroupTally::default();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(tally) => total.merge(tally),
            Err(e) => {
                error!("Usage group task failed: {}", e);
                total.failed += 1;
            }
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metering::BufferedUsageMeter;
    use crate::store::InMemoryStore;

    struct Fixture {
        meter: Arc<BufferedUsageMeter>,
        counter: Arc<UsageRolloverCounter>,
        nodes: Arc<NodeTrafficAggregator>,
        scheduler: Arc<Scheduler>,
    }

    fn fixture(config: SchedulerConfig) -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let meter = Arc::new(BufferedUsageMeter::default());
        let counter = Arc::new(UsageRolloverCounter::new(store.clone(), PeriodClock::utc()));
        let nodes = Arc::new(NodeTrafficAggregator::new(store, PeriodClock::utc()));
        let scheduler = Arc::new(
            Scheduler::new(meter.clone(), counter.clone(), nodes.clone(), config).unwrap(),
        );
        Fixture {
            meter,
            counter,
            nodes,
            scheduler,
        }
    }

    fn at(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, d, h, 0, 0).unwrap()
    }

    #[test]
    fn test_next_rollover() {
        let five_past = NaiveTime::from_hms_opt(0, 5, 0).unwrap();
        let utc = PeriodClock::utc();
        assert_eq!(
            next_rollover(at(5, 12), &utc, five_past),
            Utc.with_ymd_and_hms(2024, 3, 6, 0, 5, 0).unwrap()
        );
        assert_eq!(
            next_rollover(at(5, 0), &utc, five_past),
            Utc.with_ymd_and_hms(2024, 3, 5, 0, 5, 0).unwrap()
        );

        // UTC+8: local midnight is 16:00 UTC the day before
        let cst = PeriodClock::with_offset_minutes(480).unwrap();
        assert_eq!(
            next_rollover(at(5, 12), &cst, five_past),
            Utc.with_ymd_and_hms(2024, 3, 5, 16, 5, 0).unwrap()
        );
    }

    #[test]
    fn test_overdue_deadline_still_fires() {
        let five_past = NaiveTime::from_hms_opt(0, 5, 0).unwrap();
        let before = Utc.with_ymd_and_hms(2024, 3, 5, 0, 4, 59).unwrap();
        let mut deadline = RolloverDeadline::new(before, PeriodClock::utc(), five_past);
        assert_eq!(deadline.remaining(before), Duration::from_secs(1));

        // a poll running across 00:05 must not push today's rollover to tomorrow
        let after_poll = Utc.with_ymd_and_hms(2024, 3, 5, 0, 5, 2).unwrap();
        assert_eq!(deadline.remaining(after_poll), Duration::ZERO);
        assert_eq!(deadline.next, Utc.with_ymd_and_hms(2024, 3, 5, 0, 5, 0).unwrap());

        deadline.advance(after_poll);
        assert_eq!(deadline.next, Utc.with_ymd_and_hms(2024, 3, 6, 0, 5, 0).unwrap());

        // advancing from before the deadline still moves a full day
        let mut early = RolloverDeadline::new(before, PeriodClock::utc(), five_past);
        early.advance(before);
        assert_eq!(early.next, Utc.with_ymd_and_hms(2024, 3, 6, 0, 5, 0).unwrap());
    }

    #[test]
    fn test_invalid_config() {
        let bad_time = SchedulerConfig {
            rollover_hour: 24,
            ..Default::default()
        };
        assert!(matches!(bad_time.rollover_time(), Err(TallyError::Config(_))));

        let store = Arc::new(InMemoryStore::new());
        let zero = Scheduler::new(
            Arc::new(BufferedUsageMeter::default()),
            Arc::new(UsageRolloverCounter::new(store.clone(), PeriodClock::utc())),
            Arc::new(NodeTrafficAggregator::new(store, PeriodClock::utc())),
            SchedulerConfig {
                poll_interval: Duration::ZERO,
                ..Default::default()
            },
        );
        assert!(zero.is_err());
    }

    #[tokio::test]
    async fn test_poll_applies_groups() {
        let f = fixture(SchedulerConfig::default());
        f.nodes.mark_inactive("n9").await.unwrap();

        f.meter.push(UsageEvent::new("u1", "n1", 500, at(5, 1)));
        f.meter.push(UsageEvent::new("u1", "n1", 300, at(6, 1)));
        f.meter.push(UsageEvent::new("u2", "n1", 50, at(6, 2)));
        f.meter.push(UsageEvent::new("u2", "n9", 5, at(6, 3)));
        f.meter.push(UsageEvent::new("u3", "n1", -1, at(6, 3)));

        let report = f.scheduler.poll_once().await.unwrap();
        assert_eq!(report.events, 5);
        assert_eq!(report.rejected, 1);
        assert_eq!(report.subjects.applied, 4);
        assert_eq!(report.nodes.applied, 3);
        assert_eq!(report.nodes.inactive, 1);
        assert_eq!(f.scheduler.checkpoint().await, Some(at(6, 3)));

        let u1 = f.counter.state("u1").await.unwrap().unwrap();
        assert_eq!(u1.day.history[0].amount, 500);
        assert_eq!(u1.month.current.amount, 800);
        let n1 = f.nodes.state("n1").await.unwrap().unwrap();
        assert_eq!(n1.day.current.amount, 350);
        assert!(f.nodes.state("n9").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_poll_counts_stale_events() {
        let f = fixture(SchedulerConfig::default());
        f.meter.push(UsageEvent::new("u1", "n1", 10, at(6, 1)));
        f.scheduler.poll_once().await.unwrap();

        f.meter.push(UsageEvent::new("u1", "n1", 10, at(5, 1)));
        let report = f.scheduler.poll_once().await.unwrap();
        assert_eq!(report.subjects.stale, 1);
        assert_eq!(report.nodes.stale, 1);
        assert_eq!(f.counter.lifetime_total("u1").await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_roll_stale_covers_subjects_and_nodes() {
        let f = fixture(SchedulerConfig::default());
        f.counter.apply("u1", "n1", 10, at(5, 1)).await.unwrap();
        f.counter.apply("u2", "n1", 10, at(7, 1)).await.unwrap();
        f.nodes.apply("n1", "u1", 10, at(5, 1)).await.unwrap();

        let report = f.scheduler.roll_stale(at(7, 0)).await.unwrap();
        assert_eq!(report.subjects_rolled, 1);
        assert_eq!(report.nodes_rolled, 1);
        assert_eq!(report.failed, 0);

        let u1 = f.counter.state("u1").await.unwrap().unwrap();
        assert_eq!(u1.day.current.period, "20240307");
        assert_eq!(u1.day.history[0].amount, 10);
    }

    #[tokio::test]
    async fn test_rollover_applies_buffered_usage_first() {
        let f = fixture(SchedulerConfig::default());
        let late = |m: u32| Utc.with_ymd_and_hms(2024, 3, 5, 23, m, 0).unwrap();

        f.meter.push(UsageEvent::new("u1", "n1", 100, late(40)));
        f.scheduler.poll_once().await.unwrap();
        f.meter.push(UsageEvent::new("u1", "n1", 50, late(58)));

        let rolled = f
            .scheduler
            .roll_stale(Utc.with_ymd_and_hms(2024, 3, 6, 0, 5, 0).unwrap())
            .await
            .unwrap();
        assert_eq!(rolled.drained, 1);
        assert_eq!(rolled.subjects_rolled, 1);

        let report = f.scheduler.poll_once().await.unwrap();
        assert_eq!(report.subjects.stale, 0);
        assert_eq!(f.counter.lifetime_total("u1").await.unwrap(), 150);

        let u1 = f.counter.state("u1").await.unwrap().unwrap();
        assert_eq!(u1.day.history[0].period, "20240305");
        assert_eq!(u1.day.history[0].amount, 150);
        assert_eq!(u1.day.current.period, "20240306");
        let n1 = f.nodes.state("n1").await.unwrap().unwrap();
        assert_eq!(n1.day.history[0].amount, 150);
    }

    #[tokio::test]
    async fn test_inactive_events_counted_apart_from_rejected() {
        let store = Arc::new(InMemoryStore::new());
        let meter = Arc::new(BufferedUsageMeter::default());
        let metrics = Arc::new(LedgerMetrics::new().unwrap());
        let nodes = Arc::new(NodeTrafficAggregator::new(store.clone(), PeriodClock::utc()));
        let scheduler = Scheduler::new(
            meter.clone(),
            Arc::new(UsageRolloverCounter::new(store, PeriodClock::utc())),
            nodes.clone(),
            SchedulerConfig::default(),
        )
        .unwrap()
        .with_metrics(metrics.clone());
        nodes.mark_inactive("n9").await.unwrap();

        meter.push(UsageEvent::new("u1", "n9", 5, at(6, 3)));
        meter.push(UsageEvent::new("u2", "n9", 5, at(6, 3)));
        meter.push(UsageEvent::new("u3", "n1", -1, at(6, 3)));
        scheduler.poll_once().await.unwrap();

        assert_eq!(metrics.rejected_events.get(), 1);
        assert_eq!(metrics.inactive_node_events.get(), 2);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let f = fixture(SchedulerConfig {
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        });
        f.meter.push(UsageEvent::new("u1", "n1", 10, Utc::now()));

        let (tx, rx) = watch::channel(false);
        let handle = f.scheduler.clone().run(rx);
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("scheduler should stop")
            .unwrap();
        assert_eq!(f.counter.lifetime_total("u1").await.unwrap(), 10);
    }
}
