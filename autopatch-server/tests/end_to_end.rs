//! End-to-end tests: real server, real `AutopatchClient`, live mirrors.

mod common;

use autopatch_client::{
    AutopatchClient, ClientConfig, ClientError, ClientEvent, ConnectionState, Mirror,
    SubscriptionState,
};
use autopatch_core::ItemKey;
use common::*;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration, Instant};

async fn client(url: &str) -> (AutopatchClient, mpsc::Receiver<ClientEvent>) {
    let mut client = AutopatchClient::new(ClientConfig::new(url));
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    assert_eq!(next_event(&mut events).await, ClientEvent::Connected);
    (client, events)
}

async fn next_event(events: &mut mpsc::Receiver<ClientEvent>) -> ClientEvent {
    timeout(Duration::from_secs(3), events.recv())
        .await
        .expect("event within timeout")
        .expect("event channel open")
}

async fn wait_synced(events: &mut mpsc::Receiver<ClientEvent>) -> usize {
    loop {
        if let ClientEvent::Synced { items, .. } = next_event(events).await {
            return items;
        }
    }
}

/// Wait until the mirror has applied another batch.
async fn next_version(mirror: &Mirror<Car>, after: u64) -> u64 {
    let mut changes = mirror.changes();
    timeout(Duration::from_secs(3), changes.wait_for(|v| *v > after))
        .await
        .expect("batch within timeout")
        .map(|v| *v)
        .unwrap()
}

#[tokio::test]
async fn test_car_scenario() {
    let server = start_test_server(1000, 100, vec![]).await;
    let (client, mut events) = client(&server.url).await;

    let cars = client.subscribe(car_descriptor()).await.unwrap();
    assert_eq!(wait_synced(&mut events).await, 0);
    assert_eq!(client.state_of("Car"), SubscriptionState::Synced);
    let synced_version = cars.version();

    let started = Instant::now();
    server.cars.push(car(1, "Tesla Model 3")).unwrap();
    server.cars.push(car(2, "BMW i4")).unwrap();
    server.cars.push(car(3, "Audi e-tron")).unwrap();

    // All three arrive as one batch after the throttle interval
    let version = next_version(&cars, synced_version).await;
    assert_eq!(version, synced_version + 1);
    assert_eq!(cars.len(), 3);
    assert!(started.elapsed() < Duration::from_millis(2500));

    server
        .cars
        .update(&ItemKey::from(1u32), |c| c.lat = 52.52)
        .unwrap();
    next_version(&cars, version).await;
    assert_eq!(cars.get(&ItemKey::from(1u32)).unwrap().lat, 52.52);
    assert_eq!(cars.items(), server.cars.items());

    // A late full data request resyncs the whole mirror
    client.request_full_data("Car").await.unwrap();
    assert_eq!(wait_synced(&mut events).await, 3);
    assert_eq!(cars.items(), server.cars.items());
}

#[tokio::test]
async fn test_full_data_is_not_broadcast() {
    let server = start_test_server(1000, 100, vec![car(1, "a"), car(2, "b"), car(3, "c")]).await;
    let (alice, mut alice_events) = client(&server.url).await;
    let (bob, mut bob_events) = client(&server.url).await;

    let alice_cars = alice.subscribe(car_descriptor()).await.unwrap();
    let bob_cars = bob.subscribe(car_descriptor()).await.unwrap();
    assert_eq!(wait_synced(&mut alice_events).await, 3);
    assert_eq!(wait_synced(&mut bob_events).await, 3);
    let bob_version = bob_cars.version();

    alice.request_full_data("Car").await.unwrap();
    assert_eq!(wait_synced(&mut alice_events).await, 3);
    assert_eq!(alice_cars.len(), 3);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(bob_cars.version(), bob_version);
    assert!(bob_events.try_recv().is_err());
}

#[tokio::test]
async fn test_removals_and_updates_converge() {
    let server = start_test_server(100, 100, vec![car(1, "a"), car(2, "b"), car(3, "c")]).await;
    let (client, mut events) = client(&server.url).await;
    let cars = client.subscribe(car_descriptor()).await.unwrap();
    wait_synced(&mut events).await;
    let mut version = cars.version();

    server.cars.remove(&ItemKey::from(1u32)).unwrap();
    server.cars.update(&ItemKey::from(3u32), |c| c.lon = 0.5).unwrap();
    server.cars.push(car(4, "d")).unwrap();
    server.cars.update(&ItemKey::from(2u32), |c| c.model = "B".into()).unwrap();

    // The changes may straddle two ticks
    while cars.items() != server.cars.items() {
        version = next_version(&cars, version).await;
    }
    assert_eq!(cars.len(), 3);
    assert_eq!(cars.get(&ItemKey::from(2u32)).unwrap().model, "B");
}

#[tokio::test]
async fn test_shared_subscription_and_release() {
    let server = start_test_server(1000, 100, vec![car(1, "a")]).await;
    let (client, mut events) = client(&server.url).await;

    let first = client.subscribe(car_descriptor()).await.unwrap();
    let second = client.subscribe(car_descriptor()).await.unwrap();
    wait_synced(&mut events).await;
    assert_eq!(first.len(), 1);
    assert_eq!(second.len(), 1);
    assert_eq!(server.service.subscriber_count("Car"), 1);

    assert!(client.unsubscribe("Car").await.unwrap());
    assert_eq!(server.service.subscriber_count("Car"), 1);
    assert!(client.unsubscribe("Car").await.unwrap());
    assert_eq!(server.service.subscriber_count("Car"), 0);
    assert!(!client.unsubscribe("Car").await.unwrap());
}

#[tokio::test]
async fn test_unknown_type_is_rejected() {
    let server = start_test_server(1000, 100, vec![]).await;
    let (client, _events) = client(&server.url).await;

    let fields = autopatch_core::FieldTable::<Car>::builder()
        .field("id", |c| c.id, |c, v| c.id = v)
        .build();
    let trucks = autopatch_core::TypeDescriptor::new("Truck", |c: &Car| c.id, fields);
    assert!(matches!(
        client.subscribe(trucks).await,
        Err(ClientError::Rejected(_))
    ));
    assert_eq!(client.state_of("Truck"), SubscriptionState::Unsubscribed);
}

#[tokio::test]
async fn test_reconnect_restores_subscriptions() {
    let server = start_test_server(100, 100, vec![car(1, "a")]).await;
    let (mut client, mut events) = client(&server.url).await;
    let cars = client.subscribe(car_descriptor()).await.unwrap();
    wait_synced(&mut events).await;

    client.disconnect().await;
    assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    assert_eq!(client.state_of("Car"), SubscriptionState::ConnectionLost);

    // Changes made while disconnected are picked up by the fresh snapshot
    server.cars.push(car(2, "b")).unwrap();
    server.cars.remove(&ItemKey::from(1u32)).unwrap();

    assert_eq!(client.reconnect().await.unwrap(), 1);
    assert_eq!(wait_synced(&mut events).await, 1);
    assert_eq!(cars.items(), server.cars.items());
    assert_eq!(client.state_of("Car"), SubscriptionState::Synced);
}
