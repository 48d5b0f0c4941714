// tests/integration/pubsub_test.rs

//! Channel subscriptions and notification fan-out.

use super::test_helpers::{test_options, wait_until, MockConnector};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tidepool::Cluster;

#[tokio::test]
async fn listen_deduplicates_across_the_pool() {
    let (connector, state) = MockConnector::new();
    let cluster = Cluster::connect(test_options(), 2, connector).await.unwrap();

    cluster.listen(&["a", "b"]).await.unwrap();
    cluster.listen(&["b", "c"]).await.unwrap();
    // Re-listening covered channels is a no-op.
    cluster.listen(&["a", "b", "c"]).await.unwrap();

    assert_eq!(cluster.subscribed_channels(), ["a", "b", "c"]);
    let listens: Vec<String> = state
        .statements()
        .into_iter()
        .map(|(_, text)| text)
        .filter(|t| t.starts_with("LISTEN"))
        .collect();
    assert_eq!(listens, ["LISTEN a; LISTEN b", "LISTEN c"]);
    cluster.disconnect().await;
}

#[tokio::test]
async fn notifications_reach_the_channel_hook_in_order() {
    let (connector, state) = MockConnector::new();
    let cluster = Cluster::connect(test_options(), 1, connector).await.unwrap();

    let received: Arc<Mutex<Vec<(String, Vec<u8>, u64)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    cluster.on_notification("events", move |channel, payload, pid| {
        sink.lock().push((channel.to_string(), payload.to_vec(), pid));
    });
    cluster.listen(&["events"]).await.unwrap();

    let link = state.link_ids()[0];
    state.push_notification(link, "events", b"first", 41);
    state.push_notification(link, "events", b"second", 42);

    assert!(wait_until(|| received.lock().len() == 2, Duration::from_secs(1)).await);
    let received = received.lock();
    assert_eq!(received[0], ("events".to_string(), b"first".to_vec(), 41));
    assert_eq!(received[1], ("events".to_string(), b"second".to_vec(), 42));
    assert_eq!(cluster.stats().notifications, 2);
    cluster.disconnect().await;
}

#[tokio::test]
async fn notification_on_unhooked_channel_is_dropped_quietly() {
    let (connector, state) = MockConnector::new();
    let cluster = Cluster::connect(test_options(), 1, connector).await.unwrap();
    cluster.listen(&["noise"]).await.unwrap();

    let link = state.link_ids()[0];
    state.push_notification(link, "noise", b"payload", 1);
    assert!(wait_until(|| cluster.stats().notifications == 1, Duration::from_secs(1)).await);
    cluster.disconnect().await;
}

#[tokio::test]
async fn unlisten_targets_the_owning_connection() {
    let (connector, state) = MockConnector::new();
    let cluster = Cluster::connect(test_options(), 2, connector).await.unwrap();

    cluster.listen(&["a"]).await.unwrap();
    let owner = state
        .statements()
        .iter()
        .find(|(_, text)| text == "LISTEN a")
        .map(|(link, _)| *link)
        .unwrap();

    cluster.unlisten(&["a"]).await.unwrap();
    assert!(cluster.subscribed_channels().is_empty());
    let unlisten_link = state
        .statements()
        .iter()
        .find(|(_, text)| text == "UNLISTEN a")
        .map(|(link, _)| *link)
        .unwrap();
    assert_eq!(owner, unlisten_link);

    // Unlistening something never subscribed is a no-op.
    cluster.unlisten(&["ghost"]).await.unwrap();
    assert_eq!(state.dispatch_count("UNLISTEN ghost"), 0);
    cluster.disconnect().await;
}

#[tokio::test]
async fn unlisten_of_an_unsubscribed_channel_keeps_its_hooks() {
    let (connector, state) = MockConnector::new();
    let cluster = Cluster::connect(test_options(), 1, connector).await.unwrap();

    let received: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    cluster.on_notification("events", move |_, _, pid| sink.lock().push(pid));

    // Nothing is subscribed yet; the no-op must not tear the hook down.
    cluster.unlisten(&["events"]).await.unwrap();

    cluster.listen(&["events"]).await.unwrap();
    let link = state.link_ids()[0];
    state.push_notification(link, "events", b"x", 5);
    assert!(wait_until(|| received.lock().len() == 1, Duration::from_secs(1)).await);
    cluster.disconnect().await;
}

#[tokio::test]
async fn notification_arriving_mid_query_is_still_delivered() {
    let (connector, state) = MockConnector::new();
    let cluster = Cluster::connect(test_options(), 1, connector).await.unwrap();

    let received: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    cluster.on_notification("ticks", move |_, _, pid| sink.lock().push(pid));
    cluster.listen(&["ticks"]).await.unwrap();

    *state.reply_delay.lock() = Some(Duration::from_millis(50));
    let link = state.link_ids()[0];
    let handle = cluster.query("SELECT slow", tidepool::TtlClass::None, None);
    tokio::time::sleep(Duration::from_millis(10)).await;
    // Pushed while the query is still awaiting its reply.
    state.push_notification(link, "ticks", b"x", 7);

    handle.await.unwrap();
    assert!(wait_until(|| received.lock().len() == 1, Duration::from_secs(1)).await);
    cluster.disconnect().await;
}
