mod common;

use chrono::{Datelike, Duration, Utc};
use rust_decimal_macros::dec;
use std::sync::Arc;
use termfarm::adapters::MemoryStore;
use termfarm::services::SyncRateLimiter;
use termfarm::store::FarmStore;

use common::{account, connection, next_week};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn last_slot_is_granted_exactly_once() {
    let store = Arc::new(MemoryStore::new());
    let acct = account(dec!(1000));
    let conn = connection(&acct, 59, next_week());
    store.insert_connection(conn.clone()).await;
    let limiter = SyncRateLimiter::new(store.clone(), 60);
    let id = conn.id;

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.check_and_increment(id).await })
        })
        .collect();

    let mut granted = 0;
    for handle in handles {
        if handle.await.unwrap().unwrap().can_sync {
            granted += 1;
        }
    }

    assert_eq!(granted, 1);
    let stored = store.get_connection(conn.id).await.unwrap().unwrap();
    assert_eq!(stored.syncs_this_month, 60);
}

#[tokio::test]
async fn expired_window_resets_counter() {
    let store = Arc::new(MemoryStore::new());
    let acct = account(dec!(1000));
    let conn = connection(&acct, 60, Utc::now() - Duration::hours(1));
    store.insert_connection(conn.clone()).await;
    let limiter = SyncRateLimiter::new(store.clone(), 60);

    let check = limiter.check_and_increment(conn.id).await.unwrap();
    assert!(check.can_sync);
    assert!(check.reset_needed);
    assert_eq!(check.current_count, 1);

    let stored = store.get_connection(conn.id).await.unwrap().unwrap();
    assert!(stored.syncs_reset_at > Utc::now());
    assert_eq!(stored.syncs_reset_at.day(), 1);
}

#[tokio::test]
async fn full_quota_is_refused_without_incrementing() {
    let store = Arc::new(MemoryStore::new());
    let acct = account(dec!(1000));
    let conn = connection(&acct, 3, next_week());
    store.insert_connection(conn.clone()).await;
    let limiter = SyncRateLimiter::new(store.clone(), 3);

    let check = limiter.check_and_increment(conn.id).await.unwrap();
    assert!(!check.can_sync);
    assert_eq!(check.current_count, 3);
    assert_eq!(
        store.get_connection(conn.id).await.unwrap().unwrap().syncs_this_month,
        3
    );
}
