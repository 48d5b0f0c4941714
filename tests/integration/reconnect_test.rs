// tests/integration/reconnect_test.rs

//! Loss detection and transparent recovery: a dropped transport fails only
//! its own in-flight work, other connections keep serving, and the link comes
//! back with a fresh session and its channel subscriptions restored.

use super::test_helpers::{test_options, wait_until, MockConnector};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tidepool::cluster::{ClusterHooks, ConnState, ReconnectReport};
use tidepool::{Cluster, PoolError, TtlClass};

#[tokio::test]
async fn in_flight_query_fails_with_connection_lost() {
    let (connector, state) = MockConnector::new();
    // A server that never answers, so the kill races nothing.
    state.set_responder(Box::new(|_| Vec::new()));
    let cluster = Cluster::connect(test_options(), 1, connector).await.unwrap();

    let handle = cluster.query("SELECT hang", TtlClass::None, None);
    tokio::time::sleep(Duration::from_millis(20)).await;
    state.kill(0);

    assert_eq!(handle.await.unwrap_err(), PoolError::ConnectionLost);
    cluster.disconnect().await;
}

#[tokio::test]
async fn killing_one_connection_does_not_stall_the_other() {
    let (connector, state) = MockConnector::new();
    let cluster = Cluster::connect(test_options(), 2, connector).await.unwrap();

    state.kill(0);
    // Give the driver a beat to notice the loss and leave the scheduler.
    tokio::time::sleep(Duration::from_millis(10)).await;
    // Traffic keeps flowing while link 0 is down.
    for i in 0..4 {
        cluster
            .query(format!("SELECT {i}"), TtlClass::None, None)
            .await
            .unwrap();
    }

    assert!(
        wait_until(
            || cluster.stats().reconnects >= 1
                && cluster.connection_states().iter().all(|s| *s == ConnState::Idle),
            Duration::from_secs(2),
        )
        .await
    );
    // The replacement link is a brand-new one.
    assert!(state.link_ids().len() >= 3);
    cluster.disconnect().await;
}

#[tokio::test]
async fn queries_queued_during_outage_complete_after_reconnect() {
    let (connector, state) = MockConnector::new();
    let cluster = Cluster::connect(test_options(), 1, connector).await.unwrap();

    state.kill(0);
    tokio::time::sleep(Duration::from_millis(10)).await;
    // Nothing can serve this yet; it waits in the queue for the reconnect.
    let handle = cluster.query("SELECT after_outage", TtlClass::None, None);
    handle.await.unwrap();
    assert_eq!(state.dispatch_count("SELECT after_outage"), 1);
    cluster.disconnect().await;
}

#[tokio::test]
async fn reconnect_issues_a_fresh_session_id() {
    let (connector, state) = MockConnector::new();
    let cluster = Cluster::connect(test_options(), 1, connector).await.unwrap();
    let before = cluster.sessions();

    state.kill(0);
    assert!(wait_until(|| cluster.stats().reconnects >= 1, Duration::from_secs(2)).await);

    let after = cluster.sessions();
    assert_ne!(before, after);
    // The old token now names a dead session.
    let err = cluster.commit(before[0]).await.unwrap_err();
    assert_eq!(err, PoolError::SessionGone(before[0]));
    cluster.disconnect().await;
}

#[tokio::test]
async fn queued_transaction_statements_fail_when_their_session_dies() {
    let (connector, state) = MockConnector::new();
    // Hold replies so the transaction statement is still queued at kill time.
    let cluster = Cluster::connect(test_options(), 1, connector).await.unwrap();
    let token = cluster
        .begin_transaction(tidepool::cluster::IsolationLevel::ReadCommitted)
        .await
        .unwrap();

    state.set_responder(Box::new(|_| Vec::new()));
    let in_flight = cluster.query("UPDATE t SET a = 1", TtlClass::None, Some(token));
    let queued = cluster.query("UPDATE t SET a = 2", TtlClass::None, Some(token));
    tokio::time::sleep(Duration::from_millis(20)).await;
    state.kill(0);

    assert_eq!(in_flight.await.unwrap_err(), PoolError::ConnectionLost);
    assert_eq!(queued.await.unwrap_err(), PoolError::ConnectionLost);
    cluster.disconnect().await;
}

#[tokio::test]
async fn request_bound_to_a_lost_session_fails_during_the_outage() {
    let (connector, state) = MockConnector::new();
    let cluster = Cluster::connect(test_options(), 1, connector).await.unwrap();
    let token = cluster.sessions()[0];

    // Refused reconnects keep the link down while the stale token is used.
    state
        .refuse_connects
        .store(true, std::sync::atomic::Ordering::SeqCst);
    state.kill(0);
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Submitted mid-outage with the dead link's token: must resolve, not
    // sit in the queue waiting for a session id that will never come back.
    let err = cluster
        .query("SELECT stuck", TtlClass::None, Some(token))
        .await
        .unwrap_err();
    assert_eq!(err, PoolError::SessionGone(token));

    state
        .refuse_connects
        .store(false, std::sync::atomic::Ordering::SeqCst);
    assert!(wait_until(|| cluster.stats().reconnects >= 1, Duration::from_secs(2)).await);
    // The recovered link serves fresh traffic.
    cluster.query("SELECT 1", TtlClass::None, None).await.unwrap();
    cluster.disconnect().await;
}

#[tokio::test]
async fn channels_are_resubscribed_after_reconnect() {
    let (connector, state) = MockConnector::new();
    let reports: Arc<Mutex<Vec<ReconnectReport>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = reports.clone();
    let hooks = ClusterHooks {
        on_reconnect: Some(Box::new(move |report| sink.lock().push(report.clone()))),
        ..Default::default()
    };
    let cluster = Cluster::connect_with(test_options(), 1, connector, hooks, None)
        .await
        .unwrap();

    cluster.listen(&["alerts"]).await.unwrap();
    state.kill(0);
    assert!(wait_until(|| cluster.stats().reconnects >= 1, Duration::from_secs(2)).await);

    assert_eq!(state.dispatch_count("LISTEN alerts"), 2);
    assert_eq!(cluster.subscribed_channels(), ["alerts"]);
    let reports = reports.lock();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].resubscribed, ["alerts"]);
    cluster.disconnect().await;
}

#[tokio::test]
async fn resubscribe_hook_can_decline_a_channel() {
    let (connector, state) = MockConnector::new();
    let reports: Arc<Mutex<Vec<ReconnectReport>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = reports.clone();
    let hooks = ClusterHooks {
        resubscribe: Some(Box::new(|channel| channel != "stale_feed")),
        on_reconnect: Some(Box::new(move |report| sink.lock().push(report.clone()))),
        ..Default::default()
    };
    let cluster = Cluster::connect_with(test_options(), 1, connector, hooks, None)
        .await
        .unwrap();

    cluster.listen(&["alerts", "stale_feed"]).await.unwrap();
    state.kill(0);
    assert!(wait_until(|| cluster.stats().reconnects >= 1, Duration::from_secs(2)).await);

    assert_eq!(cluster.subscribed_channels(), ["alerts"]);
    let reports = reports.lock();
    assert_eq!(reports[0].skipped, ["stale_feed"]);
    assert_eq!(reports[0].resubscribed, ["alerts"]);
    cluster.disconnect().await;
}
