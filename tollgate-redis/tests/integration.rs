//! Runs against a live Redis when `TOLLGATE_REDIS_URL` is set; skipped otherwise.

use std::sync::Arc;
use std::time::Duration;
use tollgate::config::{RateLimitRule, ScopeKind};
use tollgate::identity::Identity;
use tollgate::rate_limit::{CounterStore, RateLimiter, RuleSet};
use tollgate_redis::RedisCounterStore;

async fn store() -> Option<RedisCounterStore> {
    let url = std::env::var("TOLLGATE_REDIS_URL").ok()?;
    let prefix = format!("tollgate-test:{}:", uuid::Uuid::new_v4());
    Some(RedisCounterStore::connect(&url).await.expect("connect to redis").with_prefix(prefix))
}

#[tokio::test]
async fn conditional_add_stops_at_the_limit() {
    let Some(store) = store().await else { return };
    let ttl = Duration::from_secs(60);

    for (i, at) in [1_000u64, 2_000, 3_000].into_iter().enumerate() {
        let admission = store.add_if_under_limit("k", &format!("m{i}"), at, 3, ttl).await.unwrap();
        assert!(admission.admitted);
        assert_eq!(admission.count, i as u64 + 1);
        assert_eq!(admission.oldest_millis, Some(1_000));
    }
    let full = store.add_if_under_limit("k", "m3", 4_000, 3, ttl).await.unwrap();
    assert!(!full.admitted);
    assert_eq!(full.count, 3);

    // Only entries strictly older than the threshold are pruned.
    store.remove_older_than("k", 2_000).await.unwrap();
    assert_eq!(store.count("k").await.unwrap(), 2);

    // One window after the oldest remaining entry it still counts.
    let boundary = store.add_if_under_limit("k", "m4", 62_000, 2, ttl).await.unwrap();
    assert!(!boundary.admitted);
    assert_eq!(boundary.oldest_millis, Some(2_000));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_limiters_share_one_quota() {
    let Some(store) = store().await else { return };
    let store: Arc<dyn CounterStore> = Arc::new(store);
    let rules = || {
        RuleSet::new([RateLimitRule::new("shared", ScopeKind::Global, 10, Duration::from_secs(60))])
    };
    let limiters: Vec<Arc<RateLimiter>> = (0..3)
        .map(|_| Arc::new(RateLimiter::builder(rules()).store(store.clone()).build().unwrap()))
        .collect();

    let mut tasks = Vec::new();
    for i in 0..30 {
        let limiter = limiters[i % limiters.len()].clone();
        tasks.push(tokio::spawn(async move {
            limiter.evaluate(&Identity::anonymous(), "/").await.is_allowed()
        }));
    }
    let mut admitted = 0;
    for task in tasks {
        if task.await.unwrap() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 10);
}
