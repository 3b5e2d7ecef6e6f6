#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use kalert_queue::{ChangeQueue, ExponentialFailureRateLimiter};
use tokio::time::Instant;

fn queue() -> Arc<ChangeQueue<String>> {
    Arc::new(ChangeQueue::new(
        "retry",
        ExponentialFailureRateLimiter::new(Duration::from_millis(100), Duration::from_secs(10)),
    ))
}

#[tokio::test]
async fn shutdown_wakes_blocked_getters() {
    let q = queue();
    let mut waiters = Vec::new();
    for _ in 0..3 {
        let q = Arc::clone(&q);
        waiters.push(tokio::spawn(async move { q.get().await }));
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
    q.shut_down();
    for w in waiters {
        let got = tokio::time::timeout(Duration::from_secs(1), w).await.unwrap().unwrap();
        assert_eq!(got, None);
    }
    // Never blocks afterwards.
    assert_eq!(tokio::time::timeout(Duration::from_millis(50), q.get()).await.unwrap(), None);
}

#[tokio::test]
async fn pending_items_are_drained_exactly_once_after_shutdown() {
    let q = queue();
    q.add("ns/a".to_string());
    q.add("ns/b".to_string());
    q.shut_down();
    q.add("ns/c".to_string());

    let mut yielded = Vec::new();
    while let Some(k) = q.get().await {
        q.done(&k);
        yielded.push(k);
    }
    assert_eq!(yielded, vec!["ns/a".to_string(), "ns/b".to_string()]);
}

#[tokio::test]
async fn in_flight_dirty_key_is_replayed_even_after_shutdown() {
    let q = queue();
    q.add("ns/a".to_string());
    let k = q.get().await.unwrap();
    q.add("ns/a".to_string());
    q.shut_down();
    q.done(&k);
    assert_eq!(q.get().await.as_deref(), Some("ns/a"));
    q.done(&k);
    assert_eq!(q.get().await, None);
}

#[tokio::test(start_paused = true)]
async fn rate_limited_requeue_waits_for_growing_backoff() {
    let q = queue();
    let key = "ns/a".to_string();
    q.add(key.clone());

    let mut waits = Vec::new();
    for _ in 0..3 {
        let k = q.get().await.unwrap();
        q.add_rate_limited(k.clone());
        q.done(&k);
        let t0 = Instant::now();
        assert_eq!(q.get().await.as_deref(), Some("ns/a"));
        waits.push(t0.elapsed());
        q.done(&key);
        q.add(key.clone());
    }
    assert_eq!(q.num_requeues(&key), 3);
    assert!(waits[0] >= Duration::from_millis(100), "{waits:?}");
    assert!(waits.windows(2).all(|w| w[1] >= w[0]), "backoff must not shrink: {waits:?}");
    assert!(waits[2] >= Duration::from_millis(400), "{waits:?}");

    q.forget(&key);
    assert_eq!(q.num_requeues(&key), 0);
}

#[tokio::test(start_paused = true)]
async fn scheduled_key_is_not_yielded_early() {
    let q = queue();
    q.add_after("ns/a".to_string(), Duration::from_secs(2));
    assert!(tokio::time::timeout(Duration::from_secs(1), q.get()).await.is_err());
    assert_eq!(q.scheduled_len(), 1);
    let got = tokio::time::timeout(Duration::from_secs(2), q.get()).await.unwrap();
    assert_eq!(got.as_deref(), Some("ns/a"));
}

#[tokio::test]
async fn retry_after_shutdown_is_dropped_without_counting_a_failure() {
    let q = queue();
    let key = "ns/a".to_string();
    q.add(key.clone());
    let k = q.get().await.unwrap();
    q.shut_down();
    q.add_rate_limited(k.clone());
    q.done(&k);

    assert_eq!(q.num_requeues(&key), 0);
    assert_eq!(q.scheduled_len(), 0);
    assert_eq!(q.get().await, None);
}
