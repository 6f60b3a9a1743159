// tests/integration/watchdog_test.rs

//! Reconnection and pooling: lost connections are replaced, local closes are
//! final, and a shut-down pool stays shut down.

use super::test_helpers::{MockServer, test_config, wait_until};
use bytes::Bytes;
use spineldb_client::ConnectionPool;
use spineldb_client::config::ReconnectPolicy;
use spineldb_client::connection::{ConnectionInitializer, ConnectionWatchdog, WatchdogRegistry};
use spineldb_client::core::protocol::{Command, ConnectionKind, RespFrame};
use spineldb_client::core::pubsub::PushKind;
use spineldb_client::core::{ClientError, ErrorKind};
use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

const RECOVERY: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_lost_connection_fails_pending_and_is_replaced() {
    let server = MockServer::start().await;
    let pool = ConnectionPool::connect(test_config(server.address()), 1, ConnectionKind::Plain)
        .await
        .unwrap();
    let conn = pool.acquire().unwrap();
    let old_id = conn.id();

    let pending = futures::future::join_all(
        (0..3).map(|_| conn.request_with_timeout(Command::new("HANG"), None)),
    );
    let killer = async {
        assert!(wait_until(Duration::from_secs(2), || server.commands_seen() >= 3).await);
        server.kill_connections();
    };
    let (results, ()) = tokio::join!(pending, killer);

    for result in results {
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Closed);
    }
    assert!(conn.is_closed());

    // The watchdog brings a fresh connection into the pool.
    let replacement = pool.acquire_within(RECOVERY).await.unwrap();
    assert_ne!(replacement.id(), old_id);
    assert_eq!(replacement.ping().await.unwrap(), "PONG");
    assert_eq!(server.accepted(), 2);

    pool.shutdown().await;
}

#[tokio::test]
async fn test_explicit_close_is_not_reconnected() {
    let server = MockServer::start().await;
    let pool = ConnectionPool::connect(test_config(server.address()), 1, ConnectionKind::Plain)
        .await
        .unwrap();
    let conn = pool.acquire().unwrap();

    conn.close();
    conn.closed().await;
    assert!(wait_until(Duration::from_secs(1), || pool.is_empty()).await);

    // Several reconnect delays pass without a new socket.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(server.accepted(), 1);
    assert!(matches!(
        pool.acquire().unwrap_err(),
        ClientError::NoConnectionAvailable
    ));

    pool.shutdown().await;
}

#[tokio::test]
async fn test_acquire_rotates_through_connections() {
    let server = MockServer::start().await;
    let pool = ConnectionPool::connect(test_config(server.address()), 3, ConnectionKind::Plain)
        .await
        .unwrap();
    assert_eq!(pool.size(), 3);
    assert_eq!(pool.len(), 3);

    let ids: HashSet<u64> = (0..6).map(|_| pool.acquire().unwrap().id()).collect();
    assert_eq!(ids.len(), 3);

    let conn = pool.acquire().unwrap();
    conn.send(Command::new("SET").arg("shared").arg("1"))
        .await
        .unwrap();
    let other = pool.acquire().unwrap();
    assert_ne!(other.id(), conn.id());
    assert_eq!(
        other.send(Command::new("GET").arg("shared")).await.unwrap(),
        RespFrame::BulkString("1".into())
    );

    pool.shutdown().await;
}

#[tokio::test]
async fn test_every_connection_is_replaced_after_server_restart() {
    let server = MockServer::start().await;
    let pool = ConnectionPool::connect(test_config(server.address()), 2, ConnectionKind::Plain)
        .await
        .unwrap();
    let before: HashSet<u64> = (0..2).map(|_| pool.acquire().unwrap().id()).collect();
    assert_eq!(before.len(), 2);

    server.kill_connections();
    assert!(
        wait_until(RECOVERY, || {
            server.accepted() == 4 && pool.len() == 2
        })
        .await
    );
    for _ in 0..2 {
        let conn = pool.acquire().unwrap();
        assert!(!before.contains(&conn.id()));
        assert_eq!(conn.ping().await.unwrap(), "PONG");
    }

    pool.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_everything_and_stops_reconnects() {
    let server = MockServer::start().await;
    let pool = ConnectionPool::connect(test_config(server.address()), 2, ConnectionKind::Plain)
        .await
        .unwrap();
    let conn = pool.acquire().unwrap();

    pool.shutdown().await;
    assert!(pool.is_shut_down());
    assert!(conn.is_closed());
    assert!(matches!(pool.acquire().unwrap_err(), ClientError::PoolShutdown));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.accepted(), 2);

    // A second shutdown is a no-op.
    pool.shutdown().await;
}

#[tokio::test]
async fn test_zero_sized_pool_is_rejected() {
    let server = MockServer::start().await;
    let err = ConnectionPool::connect(test_config(server.address()), 0, ConnectionKind::Plain)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Config(_)));
}

#[tokio::test]
async fn test_pool_connect_fails_when_server_is_down() {
    let server = MockServer::start().await;
    let address = server.address();
    drop(server);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let config = test_config(address).with_reconnect(ReconnectPolicy::fixed(Duration::from_millis(10)));
    assert!(
        ConnectionPool::connect(config, 2, ConnectionKind::Plain)
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_pubsub_subscriptions_survive_reconnect() {
    let server = MockServer::start().await;
    let pool = ConnectionPool::connect(test_config(server.address()), 1, ConnectionKind::PubSub)
        .await
        .unwrap();
    let (_, mut rx) = pool.dispatcher().listen(PushKind::Message, "alerts");
    let conn = pool.acquire().unwrap();
    conn.subscribe(["alerts"]).await.unwrap();
    assert_eq!(server.publish("alerts", "before"), 1);
    let first = tokio::time::timeout(RECOVERY, rx.recv()).await.unwrap().unwrap();
    assert_eq!(first.payload, Bytes::from("before"));

    server.kill_connections();
    assert!(wait_until(RECOVERY, || conn.is_closed()).await);
    // The replacement subscribes again on its own.
    assert!(wait_until(RECOVERY, || server.publish("alerts", "after") == 1).await);

    let mut payloads = Vec::new();
    while let Ok(Some(msg)) = tokio::time::timeout(Duration::from_millis(500), rx.recv()).await {
        payloads.push(msg.payload);
    }
    assert!(payloads.contains(&Bytes::from("after")));

    pool.shutdown().await;
}

#[tokio::test]
async fn test_replacement_restores_only_the_lost_connections_subscriptions() {
    let server = MockServer::start().await;
    let pool = ConnectionPool::connect(test_config(server.address()), 2, ConnectionKind::PubSub)
        .await
        .unwrap();
    let (_, mut rx) = pool.dispatcher().listen(PushKind::Message, "news");
    let subscriber = pool.acquire().unwrap();
    let idle = pool.acquire().unwrap();
    assert_ne!(subscriber.id(), idle.id());

    subscriber.subscribe(["news"]).await.unwrap();
    assert_eq!(server.publish("news", "one"), 1);

    // The connection that never subscribed goes away and is replaced.
    assert!(idle.request(Command::new("HANGUP")).await.is_err());
    assert!(wait_until(RECOVERY, || server.accepted() == 3 && pool.len() == 2).await);
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(server.publish("news", "two"), 1);
    let mut payloads = Vec::new();
    while let Ok(Some(msg)) = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await {
        payloads.push(msg.payload);
    }
    assert_eq!(payloads, vec![Bytes::from("one"), Bytes::from("two")]);

    pool.shutdown().await;
}

#[tokio::test]
async fn test_unsubscribed_channels_are_not_restored() {
    let server = MockServer::start().await;
    let pool = ConnectionPool::connect(test_config(server.address()), 1, ConnectionKind::PubSub)
        .await
        .unwrap();
    // Both channels keep a listener; only the server-side subscription counts.
    let (_, _kept_rx) = pool.dispatcher().listen(PushKind::Message, "kept");
    let (_, _gone_rx) = pool.dispatcher().listen(PushKind::Message, "gone");
    let conn = pool.acquire().unwrap();
    conn.subscribe(["kept", "gone"]).await.unwrap();
    conn.unsubscribe(["gone"]).await.unwrap();
    assert_eq!(
        conn.subscriptions().channels,
        BTreeSet::from([Bytes::from("kept")])
    );

    server.kill_connections();
    assert!(wait_until(RECOVERY, || conn.is_closed()).await);
    assert!(wait_until(RECOVERY, || server.publish("kept", "after") == 1).await);
    assert_eq!(server.publish("gone", "x"), 0);

    let replacement = pool.acquire_within(RECOVERY).await.unwrap();
    assert!(
        wait_until(RECOVERY, || {
            replacement.subscriptions().channels == BTreeSet::from([Bytes::from("kept")])
        })
        .await
    );

    pool.shutdown().await;
}

#[tokio::test]
async fn test_dropped_pool_closes_its_connections() {
    let server = MockServer::start().await;
    let pool = ConnectionPool::connect(test_config(server.address()), 1, ConnectionKind::PubSub)
        .await
        .unwrap();
    let conn = pool.acquire().unwrap();
    conn.subscribe(["leak"]).await.unwrap();
    assert_eq!(server.publish("leak", "x"), 1);

    drop(conn);
    drop(pool);

    assert!(wait_until(Duration::from_secs(2), || server.publish("leak", "y") == 0).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.accepted(), 1);
}

#[tokio::test]
async fn test_closed_registry_turns_new_connections_away() {
    let server = MockServer::start().await;
    let registry = WatchdogRegistry::new();
    let (handle, _events) = ConnectionWatchdog::channel(registry.clone());
    let init = ConnectionInitializer::new(test_config(server.address()))
        .unwrap()
        .with_watchdog(handle);

    let first = init.connect(ConnectionKind::Plain).await.unwrap();
    assert!(registry.contains(first.id()));
    assert_eq!(registry.close().len(), 1);
    assert!(registry.is_closed());

    // A connection finishing its setup after the close is shut, not registered.
    let err = init.connect(ConnectionKind::Plain).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Closed);
    assert_eq!(registry.len(), 1);
    assert!(wait_until(Duration::from_secs(2), || server.accepted() == 2).await);
}
