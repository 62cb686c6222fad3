//! Behaviour every store backend must share
//!
//! Each check runs against a fresh store and goes through the traits only.

use chrono::{NaiveDate, Utc};
use rust_decimal_macros::dec;
use tally_common::{DailyAllocation, PaymentRecord, PeriodClock, RolloverState, StoreError};
use uuid::Uuid;

use super::{PaymentStore, RolloverScope, RolloverStore};

pub(crate) fn date(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
}

pub(crate) fn record(subject: &str, start: u32, end: u32) -> PaymentRecord {
    let now = Utc::now();
    PaymentRecord {
        id: Uuid::now_v7(),
        subject_id: subject.to_string(),
        amount: dec!(10),
        period_start: date(start),
        period_end: date(end),
        daily_amount: dec!(10),
        service_days: (end - start + 1) as i64,
        remark: None,
        created_at: now,
        updated_at: now,
    }
}

pub(crate) async fn rollover_compare_and_swap<S: RolloverStore>(store: &S) {
    let mut state = RolloverState::new("u1");
    state.touch();

    store
        .save_rollover_state(RolloverScope::Subject, &state, 0)
        .await
        .unwrap();

    // stale writer still believes the record is absent
    let err = store
        .save_rollover_state(RolloverScope::Subject, &state, 0)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Conflict { found: 1, .. }));

    let mut next = state.clone();
    next.absorb(&PeriodClock::utc().labels_for(Utc::now()), "d1", 5)
        .unwrap();
    next.touch();
    store
        .save_rollover_state(RolloverScope::Subject, &next, 1)
        .await
        .unwrap();

    // a writer that skipped a version is refused too
    let mut ahead = next.clone();
    ahead.touch();
    let err = store
        .save_rollover_state(RolloverScope::Subject, &ahead, 1)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Conflict { expected: 1, found: 2, .. }));

    let loaded = store
        .load_rollover_state(RolloverScope::Subject, "u1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded, next);
    assert!(store
        .load_rollover_state(RolloverScope::Node, "u1")
        .await
        .unwrap()
        .is_none());
    assert_eq!(
        store.list_rollover_ids(RolloverScope::Subject).await.unwrap(),
        vec!["u1".to_string()]
    );

    assert!(store
        .delete_rollover_state(RolloverScope::Subject, "u1")
        .await
        .unwrap());
    assert!(store
        .list_rollover_ids(RolloverScope::Subject)
        .await
        .unwrap()
        .is_empty());
}

pub(crate) async fn node_flag_defaults_active<S: RolloverStore>(store: &S) {
    assert!(store.is_node_active("n1").await.unwrap());
    store.set_node_active("n1", false).await.unwrap();
    assert!(!store.is_node_active("n1").await.unwrap());
    store.set_node_active("n1", true).await.unwrap();
    assert!(store.is_node_active("n1").await.unwrap());
}

pub(crate) async fn uncommitted_transaction_is_invisible<S: PaymentStore>(store: &S) {
    let rec = record("u1", 1, 2);

    let mut tx = store.begin().await.unwrap();
    tx.insert_payment_record(&rec).await.unwrap();
    assert!(store.get_payment(rec.id).await.unwrap().is_none());
    tx.rollback().await.unwrap();

    assert!(store.get_payment(rec.id).await.unwrap().is_none());
    assert!(store.list_payments("u1").await.unwrap().is_empty());
}

/// A commit whose allocations reference a missing payment writes nothing
pub(crate) async fn missing_owner_rolls_back<S: PaymentStore>(store: &S) {
    let rec = record("u1", 1, 2);
    let orphan = DailyAllocation::new(&record("u2", 1, 1), date(1), dec!(1));

    let mut tx = store.begin().await.unwrap();
    tx.insert_payment_record(&rec).await.unwrap();
    tx.insert_daily_allocations(&[DailyAllocation::new(&rec, date(1), dec!(5))])
        .await
        .unwrap();
    tx.insert_daily_allocations(&[orphan]).await.unwrap();

    let err = tx.commit().await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));
    assert!(store.get_payment(rec.id).await.unwrap().is_none());
    assert!(store.allocations_for(rec.id).await.unwrap().is_empty());
    assert!(store
        .find_payment_window("u1", date(1), date(2))
        .await
        .unwrap()
        .is_none());
    assert!(store
        .query_allocations(date(1), date(31))
        .await
        .unwrap()
        .is_empty());
}

pub(crate) async fn window_uniqueness_enforced_on_commit<S: PaymentStore>(store: &S) {
    let first = record("u1", 1, 3);
    let mut tx = store.begin().await.unwrap();
    tx.insert_payment_record(&first).await.unwrap();
    tx.commit().await.unwrap();

    let second = record("u1", 1, 3);
    let mut tx = store.begin().await.unwrap();
    tx.insert_payment_record(&second).await.unwrap();
    tx.insert_daily_allocations(&[DailyAllocation::new(&second, date(1), dec!(5))])
        .await
        .unwrap();
    assert!(matches!(
        tx.commit().await.unwrap_err(),
        StoreError::Duplicate(_)
    ));

    let payments = store.list_payments("u1").await.unwrap();
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].id, first.id);
    assert!(store.allocations_for(second.id).await.unwrap().is_empty());
    assert_eq!(
        store
            .find_payment_window("u1", date(1), date(3))
            .await
            .unwrap()
            .map(|r| r.id),
        Some(first.id)
    );
}

pub(crate) async fn delete_record_cascades<S: PaymentStore>(store: &S) {
    let rec = record("u1", 1, 2);

    let mut tx = store.begin().await.unwrap();
    tx.insert_payment_record(&rec).await.unwrap();
    tx.insert_daily_allocations(&[
        DailyAllocation::new(&rec, date(1), dec!(5)),
        DailyAllocation::new(&rec, date(2), dec!(5)),
    ])
    .await
    .unwrap();
    tx.commit().await.unwrap();
    assert_eq!(store.query_allocations(date(1), date(31)).await.unwrap().len(), 2);
    assert_eq!(store.query_allocations(date(2), date(2)).await.unwrap().len(), 1);

    let mut tx = store.begin().await.unwrap();
    assert_eq!(tx.delete_daily_allocations_for(rec.id).await.unwrap(), 2);
    tx.delete_payment_record(rec.id).await.unwrap();
    tx.commit().await.unwrap();

    assert!(store.get_payment(rec.id).await.unwrap().is_none());
    assert!(store.allocations_for(rec.id).await.unwrap().is_empty());
    assert!(store
        .query_allocations(date(1), date(31))
        .await
        .unwrap()
        .is_empty());
    assert!(store
        .find_payment_window("u1", date(1), date(2))
        .await
        .unwrap()
        .is_none());
    assert!(store.list_payments("u1").await.unwrap().is_empty());
}
