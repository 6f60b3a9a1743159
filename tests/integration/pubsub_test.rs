// tests/integration/pubsub_test.rs

//! PubSub connections: pushes go to the dispatcher, everything else still
//! resolves the correlation queue.

use super::test_helpers::{MockServer, test_config};
use bytes::Bytes;
use spineldb_client::connection::ConnectionInitializer;
use spineldb_client::core::protocol::{Command, ConnectionKind, RespFrame};
use spineldb_client::core::pubsub::{PushKind, PushMessage};
use std::sync::Arc;
use std::time::Duration;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn test_subscribe_and_receive_message() {
    let server = MockServer::start().await;
    let init = ConnectionInitializer::new(test_config(server.address())).unwrap();
    let (_, mut rx) = init.dispatcher().listen(PushKind::Message, "news");

    let conn = init.connect(ConnectionKind::PubSub).await.unwrap();
    let acks = conn.subscribe(["news"]).await.unwrap();
    assert_eq!(acks.len(), 1);
    assert_eq!(
        acks[0],
        RespFrame::Array(vec![
            RespFrame::BulkString("subscribe".into()),
            RespFrame::BulkString("news".into()),
            RespFrame::Integer(1),
        ])
    );

    assert_eq!(server.publish("news", "hello"), 1);
    let msg = tokio::time::timeout(RECV_TIMEOUT, rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.kind, PushKind::Message);
    assert_eq!(msg.channel, Bytes::from("news"));
    assert_eq!(msg.payload, Bytes::from("hello"));
    assert!(msg.pattern.is_none());
}

#[tokio::test]
async fn test_multi_channel_subscribe_collects_every_ack() {
    let server = MockServer::start().await;
    let init = ConnectionInitializer::new(test_config(server.address())).unwrap();
    let conn = init.connect(ConnectionKind::PubSub).await.unwrap();

    let acks = conn.subscribe(["a", "b", "c"]).await.unwrap();
    assert_eq!(acks.len(), 3);
    for (i, ack) in acks.iter().enumerate() {
        let RespFrame::Array(items) = ack else {
            panic!("ack should be an array, got {ack:?}");
        };
        assert_eq!(items[2], RespFrame::Integer(i as i64 + 1));
    }

    // The queue is back in sync: the next command gets its own reply.
    assert_eq!(conn.ping().await.unwrap(), "PONG");
}

#[tokio::test]
async fn test_pattern_subscription_delivers_pmessage() {
    let server = MockServer::start().await;
    let init = ConnectionInitializer::new(test_config(server.address())).unwrap();
    let (_, mut rx) = init.dispatcher().listen(PushKind::PMessage, "news.*");

    let conn = init.connect(ConnectionKind::PubSub).await.unwrap();
    conn.psubscribe(["news.*"]).await.unwrap();

    server.publish("news.sport", "goal");
    let msg = tokio::time::timeout(RECV_TIMEOUT, rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.kind, PushKind::PMessage);
    assert_eq!(msg.pattern, Some(Bytes::from("news.*")));
    assert_eq!(msg.channel, Bytes::from("news.sport"));
    assert_eq!(msg.payload, Bytes::from("goal"));
}

#[tokio::test]
async fn test_replies_interleaved_with_pushes_stay_ordered() {
    let server = MockServer::start().await;
    let init = ConnectionInitializer::new(test_config(server.address())).unwrap();
    let (_, mut rx) = init.dispatcher().listen(PushKind::Message, "ticks");

    let conn = init.connect(ConnectionKind::PubSub).await.unwrap();
    conn.subscribe(["ticks"]).await.unwrap();

    for i in 0..20 {
        server.publish("ticks", &i.to_string());
        let reply = conn
            .send(Command::new("PING").arg(format!("p{i}")))
            .await
            .unwrap();
        assert_eq!(reply, RespFrame::BulkString(format!("p{i}").into()));
    }

    let mut received = Vec::new();
    while received.len() < 20 {
        let msg = tokio::time::timeout(RECV_TIMEOUT, rx.recv())
            .await
            .unwrap()
            .unwrap();
        received.push(String::from_utf8_lossy(&msg.payload).into_owned());
    }
    received.sort_by_key(|p| p.parse::<u32>().unwrap());
    let expected: Vec<String> = (0..20).map(|i| i.to_string()).collect();
    assert_eq!(received, expected);
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let server = MockServer::start().await;
    let init = ConnectionInitializer::new(test_config(server.address())).unwrap();
    let conn = init.connect(ConnectionKind::PubSub).await.unwrap();

    conn.subscribe(["news"]).await.unwrap();
    assert_eq!(server.publish("news", "one"), 1);

    let acks = conn.unsubscribe(["news"]).await.unwrap();
    assert_eq!(acks.len(), 1);
    assert_eq!(server.publish("news", "two"), 0);
}

#[tokio::test]
async fn test_panicking_listener_does_not_break_the_connection() {
    let server = MockServer::start().await;
    let init = ConnectionInitializer::new(test_config(server.address())).unwrap();
    init.dispatcher().add_listener(
        PushKind::Message,
        "boom",
        Arc::new(|_: PushMessage| panic!("listener bug")),
    );
    let (_, mut rx) = init.dispatcher().listen(PushKind::Message, "boom");

    let conn = init.connect(ConnectionKind::PubSub).await.unwrap();
    conn.subscribe(["boom"]).await.unwrap();
    server.publish("boom", "first");
    server.publish("boom", "second");

    // The second listener on the same channel still sees both messages.
    let mut payloads = Vec::new();
    for _ in 0..2 {
        let msg = tokio::time::timeout(RECV_TIMEOUT, rx.recv())
            .await
            .unwrap()
            .unwrap();
        payloads.push(msg.payload);
    }
    payloads.sort();
    assert_eq!(payloads, vec![Bytes::from("first"), Bytes::from("second")]);
    assert_eq!(conn.ping().await.unwrap(), "PONG");
    assert!(!conn.is_closed());
}

#[tokio::test]
async fn test_empty_subscribe_is_rejected() {
    let server = MockServer::start().await;
    let init = ConnectionInitializer::new(test_config(server.address())).unwrap();
    let conn = init.connect(ConnectionKind::PubSub).await.unwrap();

    let none: [&str; 0] = [];
    assert!(conn.subscribe(none).await.is_err());
}
