//! Integration tests for the WebSocket patch pipeline.
//!
//! These tests start a real server and talk raw protocol to it,
//! verifying acks, snapshots and broadcasts on the wire.

mod common;

use autopatch_core::{ItemKey, MessageType, OpKind, PatchPath, WireMessage};
use common::*;
use serde_json::json;
use tokio::time::Duration;

#[tokio::test]
async fn test_server_accepts_connections() {
    let server = start_test_server(1000, 100, vec![]).await;
    let result = tokio_tungstenite::connect_async(&server.url).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_subscribe_acks_then_sends_snapshot() {
    let server = start_test_server(1000, 100, vec![car(1, "Tesla"), car(2, "BMW")]).await;
    let mut ws = raw_connect(&server.url).await;

    send(&mut ws, WireMessage::subscribe(41, "Car")).await;
    let ack = recv(&mut ws).await;
    assert_eq!(ack.msg_type, MessageType::SubscribeAck);
    assert_eq!(ack.request_id, 41);
    let id = ack.subscription_id.unwrap();
    assert!(server.service.subscription(&id).is_some());

    let snapshot = recv(&mut ws).await;
    assert_eq!(snapshot.msg_type, MessageType::Snapshot);
    let ops = snapshot.operations().unwrap();
    assert_eq!(ops.len(), 2);
    assert!(ops.iter().all(|op| op.kind() == OpKind::Add));
    assert_eq!(ops[1].value().unwrap()["model"], json!("BMW"));
}

#[tokio::test]
async fn test_inserts_then_update_are_broadcast() {
    let server = start_test_server(1000, 100, vec![]).await;
    let mut ws = raw_connect(&server.url).await;
    send(&mut ws, WireMessage::subscribe(1, "Car")).await;
    assert_eq!(recv(&mut ws).await.msg_type, MessageType::SubscribeAck);
    assert!(recv(&mut ws).await.operations().unwrap().is_empty());

    server.cars.push(car(1, "Tesla Model 3")).unwrap();
    server.cars.push(car(2, "BMW i4")).unwrap();
    server.cars.push(car(3, "Audi e-tron")).unwrap();

    // Nothing before the throttle interval elapses
    assert!(recv_within(&mut ws, Duration::from_millis(200)).await.is_none());

    let patch = recv(&mut ws).await;
    assert_eq!(patch.msg_type, MessageType::Patch);
    let ops = patch.operations().unwrap();
    assert_eq!(ops.len(), 3);
    assert!(ops.iter().all(|op| *op.path() == PatchPath::Append));

    server
        .cars
        .update(&ItemKey::from(1u32), |c| c.lat = 48.21)
        .unwrap();
    let patch = recv(&mut ws).await;
    let ops = patch.operations().unwrap();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].kind(), OpKind::Replace);
    assert_eq!(ops[0].path().to_string(), "/0/lat");
    assert_eq!(ops[0].value(), Some(&json!(48.21)));
}

#[tokio::test]
async fn test_size_trigger_flushes_immediately() {
    let server = start_test_server(60_000, 3, vec![]).await;
    let mut ws = raw_connect(&server.url).await;
    send(&mut ws, WireMessage::subscribe(1, "Car")).await;
    recv(&mut ws).await;
    recv(&mut ws).await;

    for id in 1..=3 {
        server.cars.push(car(id, "x")).unwrap();
    }
    let patch = recv(&mut ws).await;
    assert_eq!(patch.operations().unwrap().len(), 3);
    assert_eq!(server.service.pending("Car").unwrap(), 0);
    assert_eq!(server.service.flush_stats("Car").unwrap().size_flushes, 1);
}

#[tokio::test]
async fn test_full_data_goes_only_to_requester() {
    let server = start_test_server(1000, 100, vec![car(1, "a"), car(2, "b"), car(3, "c")]).await;

    let mut alice = raw_connect(&server.url).await;
    let mut bob = raw_connect(&server.url).await;
    send(&mut alice, WireMessage::subscribe(1, "Car")).await;
    let alice_id = recv(&mut alice).await.subscription_id.unwrap();
    recv(&mut alice).await;
    send(&mut bob, WireMessage::subscribe(1, "Car")).await;
    recv(&mut bob).await;
    recv(&mut bob).await;

    send(&mut alice, WireMessage::request_full_data(7, alice_id)).await;
    let ack = recv(&mut alice).await;
    assert_eq!(ack.msg_type, MessageType::RequestFullDataAck);
    assert_eq!(ack.request_id, 7);
    let snapshot = recv(&mut alice).await;
    assert_eq!(snapshot.msg_type, MessageType::Snapshot);
    assert_eq!(snapshot.operations().unwrap().len(), 3);

    assert!(recv_within(&mut bob, Duration::from_millis(300)).await.is_none());
}

#[tokio::test]
async fn test_unknown_type_is_an_error() {
    let server = start_test_server(1000, 100, vec![]).await;
    let mut ws = raw_connect(&server.url).await;
    send(&mut ws, WireMessage::subscribe(9, "Truck")).await;

    let response = recv(&mut ws).await;
    assert_eq!(response.msg_type, MessageType::Error);
    assert_eq!(response.request_id, 9);
    assert!(response.error_message().unwrap().contains("Truck"));
    assert_eq!(server.service.subscription_count(), 0);
}

#[tokio::test]
async fn test_unsubscribed_connection_gets_no_patches() {
    let server = start_test_server(100, 100, vec![]).await;
    let mut ws = raw_connect(&server.url).await;
    send(&mut ws, WireMessage::subscribe(1, "Car")).await;
    let id = recv(&mut ws).await.subscription_id.unwrap();
    recv(&mut ws).await;

    send(&mut ws, WireMessage::unsubscribe(2, "Car", Some(id))).await;
    assert_eq!(recv(&mut ws).await.msg_type, MessageType::UnsubscribeAck);
    assert_eq!(server.service.subscriber_count("Car"), 0);

    server.cars.push(car(1, "a")).unwrap();
    assert!(recv_within(&mut ws, Duration::from_millis(400)).await.is_none());
}

#[tokio::test]
async fn test_disconnect_drops_subscriptions() {
    let server = start_test_server(1000, 100, vec![]).await;
    let mut ws = raw_connect(&server.url).await;
    send(&mut ws, WireMessage::subscribe(1, "Car")).await;
    recv(&mut ws).await;
    assert_eq!(server.service.subscription_count(), 1);

    drop(ws);
    for _ in 0..50 {
        if server.service.subscription_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(server.service.subscription_count(), 0);
    assert_eq!(server.service.subscriber_count("Car"), 0);
}

#[tokio::test]
async fn test_ping_pong() {
    let server = start_test_server(1000, 100, vec![]).await;
    let mut ws = raw_connect(&server.url).await;
    send(&mut ws, WireMessage::ping()).await;
    assert_eq!(recv(&mut ws).await.msg_type, MessageType::Pong);
}
