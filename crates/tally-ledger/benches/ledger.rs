//! Tally ledger benchmarks
//!
//! Hot paths:
//! - Bucket absorption and rollover
//! - Proration of long windows
//! - Statistics grouping
//! - Counter apply through the in-memory store

use chrono::{Duration as ChronoDuration, NaiveDate, TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rust_decimal::Decimal;
use std::sync::Arc;
use tally_common::{DailyAllocation, Granularity, PeriodClock, PaymentRecord, RolloverState};
use tally_ledger::billing::{group_allocations, prorate};
use tally_ledger::metering::UsageRolloverCounter;
use tally_ledger::store::InMemoryStore;
use uuid::Uuid;

// ============ ROLLOVER BENCHMARKS ============

fn bench_absorb(c: &mut Criterion) {
    let mut group = c.benchmark_group("rollover");
    let clock = PeriodClock::utc();
    let origin = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

    group.bench_function("absorb_same_day", |b| {
        let labels = clock.labels_for(origin);
        let mut state = RolloverState::new("u1");
        b.iter(|| {
            state
                .absorb(black_box(&labels), "d1", black_box(1))
                .unwrap()
        });
    });

    group.bench_function("absorb_hourly_year", |b| {
        let labels: Vec<_> = (0..24 * 365)
            .map(|h| clock.labels_for(origin + ChronoDuration::hours(h)))
            .collect();
        b.iter(|| {
            let mut state = RolloverState::new("u1");
            for l in &labels {
                state.absorb(l, "d1", 1).unwrap();
            }
            black_box(state.day.history.len())
        });
    });

    group.finish();
}

// ============ BILLING BENCHMARKS ============

fn bench_prorate(c: &mut Criterion) {
    let mut group = c.benchmark_group("proration");
    let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();

    for days in [1i64, 31, 366, 3660].iter() {
        group.throughput(Throughput::Elements(*days as u64));
        group.bench_with_input(BenchmarkId::new("days", days), days, |b, &days| {
            let end = start + ChronoDuration::days(days - 1);
            b.iter(|| prorate(black_box(Decimal::new(123_456_78, 2)), start, end, 2).unwrap());
        });
    }

    group.finish();
}

fn bench_statistics(c: &mut Criterion) {
    let mut group = c.benchmark_group("statistics");
    let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();

    let rows: Vec<DailyAllocation> = (0..1000)
        .flat_map(|i| {
            let record = PaymentRecord {
                id: Uuid::now_v7(),
                subject_id: format!("u{}", i % 50),
                amount: Decimal::new(36_500, 2),
                period_start: start,
                period_end: start + ChronoDuration::days(364),
                daily_amount: Decimal::ONE,
                service_days: 365,
                remark: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            };
            (0..365).map(move |d| {
                DailyAllocation::new(&record, start + ChronoDuration::days(d), Decimal::ONE)
            })
        })
        .collect();

    group.throughput(Throughput::Elements(rows.len() as u64));
    for granularity in [Granularity::Day, Granularity::Month, Granularity::Year] {
        group.bench_function(granularity.as_str(), |b| {
            b.iter(|| group_allocations(granularity, black_box(&rows)))
        });
    }

    group.finish();
}

// ============ STORE BENCHMARKS ============

fn bench_counter_apply(c: &mut Criterion) {
    let mut group = c.benchmark_group("counter");
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let counter = UsageRolloverCounter::new(Arc::new(InMemoryStore::new()), PeriodClock::utc());
    let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

    group.bench_function("apply_in_memory", |b| {
        b.iter(|| {
            runtime
                .block_on(counter.apply("u1", "d1", black_box(1), at))
                .unwrap()
        });
    });

    group.finish();
}

criterion_group!(rollover, bench_absorb);

criterion_group!(billing, bench_prorate, bench_statistics);

criterion_group!(store, bench_counter_apply);

criterion_main!(rollover, billing, store);
