//! XAUTOCLAIM sweeps of idle pending messages.

use super::harness::{consumer, ids, relay_config, MockRedis};
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn idle_messages_of_a_dead_consumer_are_claimed_at_startup() {
    let redis = MockRedis::new();
    for _ in 0..3 {
        redis.xadd(Some("{}"));
    }
    redis.deliver_to("relay-old", 3);
    tokio::time::advance(Duration::from_secs(301)).await;

    let mut consumer = consumer(&redis, &relay_config("relay-new")).await;

    assert_eq!(ids(&consumer.read_batch().await.unwrap()), vec!["1-0", "2-0"]);
    assert_eq!(ids(&consumer.read_batch().await.unwrap()), vec!["3-0"]);
    assert!(consumer.read_batch().await.unwrap().is_empty());

    assert!(redis
        .pending()
        .iter()
        .all(|(_, owner)| owner == "relay-new"));
    assert_eq!(redis.deliveries("3-0"), 2);
    assert_eq!(redis.count_commands("XAUTOCLAIM relay-new 0-0"), 1);
    assert_eq!(redis.count_commands("XAUTOCLAIM relay-new 3-0"), 1);
}

#[tokio::test(start_paused = true)]
async fn messages_younger_than_min_idle_are_left_alone() {
    let redis = MockRedis::new();
    redis.xadd(Some("{}"));
    redis.deliver_to("relay-old", 1);
    let mut consumer = consumer(&redis, &relay_config("relay-new")).await;

    tokio::time::advance(Duration::from_secs(100)).await;
    assert!(consumer.read_batch().await.unwrap().is_empty());
    assert_eq!(redis.pending()[0].1, "relay-old");

    tokio::time::advance(Duration::from_secs(250)).await;
    assert_eq!(ids(&consumer.read_batch().await.unwrap()), vec!["1-0"]);
    assert_eq!(redis.pending()[0].1, "relay-new");
}

#[tokio::test(start_paused = true)]
async fn sweeps_run_once_per_claim_interval() {
    let redis = MockRedis::new();
    let mut consumer = consumer(&redis, &relay_config("relay-1")).await;

    for _ in 0..5 {
        assert!(consumer.read_batch().await.unwrap().is_empty());
    }
    assert_eq!(redis.count_commands("XAUTOCLAIM"), 1);

    tokio::time::advance(Duration::from_secs(60)).await;
    assert!(consumer.read_batch().await.unwrap().is_empty());
    assert_eq!(redis.count_commands("XAUTOCLAIM"), 2);
}

#[tokio::test(start_paused = true)]
async fn own_released_messages_are_reclaimed_during_a_run() {
    let redis = MockRedis::new();
    redis.xadd(Some("{}"));
    let mut consumer = consumer(&redis, &relay_config("relay-1")).await;

    assert_eq!(ids(&consumer.read_batch().await.unwrap()), vec!["1-0"]);

    tokio::time::advance(Duration::from_secs(301)).await;
    assert_eq!(ids(&consumer.read_batch().await.unwrap()), vec!["1-0"]);
    assert_eq!(redis.deliveries("1-0"), 2);
}
