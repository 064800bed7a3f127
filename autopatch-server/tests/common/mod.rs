//! Shared fixtures: the `Car` type and a server on a free port.

#![allow(dead_code)]

use autopatch_core::{FieldTable, TypeDescriptor, WireMessage};
use autopatch_server::{AutopatchConfig, AutopatchService, PatchServer, TrackedCollection, TypeConfig};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Car {
    pub id: u32,
    pub model: String,
    pub lat: f64,
    pub lon: f64,
}

pub fn car(id: u32, model: &str) -> Car {
    Car {
        id,
        model: model.into(),
        lat: 48.2,
        lon: 16.3,
    }
}

pub fn car_descriptor() -> TypeDescriptor<Car> {
    let fields = FieldTable::<Car>::builder()
        .field("id", |c| c.id, |c, v| c.id = v)
        .field("model", |c| c.model.clone(), |c, v| c.model = v)
        .field("lat", |c| c.lat, |c, v| c.lat = v)
        .field("lon", |c| c.lon, |c, v| c.lon = v)
        .build();
    TypeDescriptor::new("Car", |c: &Car| c.id, fields)
}

/// Find a free port for testing.
pub async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

pub struct TestServer {
    pub url: String,
    pub service: Arc<AutopatchService>,
    pub cars: TrackedCollection<Car>,
}

/// Start a server with `Car` registered, seeded with `items`.
pub async fn start_test_server(
    throttle_ms: u64,
    max_batch_size: usize,
    items: Vec<Car>,
) -> TestServer {
    let _ = env_logger::builder().is_test(true).try_init();
    let port = free_port().await;
    let config = AutopatchConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        default_throttle_interval_ms: throttle_ms,
        max_batch_size,
    };
    let service = Arc::new(AutopatchService::new(config).unwrap());
    let cars = service
        .register_with_items(TypeConfig::new(car_descriptor()), items)
        .unwrap();

    let server = PatchServer::new(service.clone());
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    // Give server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestServer {
        url: format!("ws://127.0.0.1:{port}"),
        service,
        cars,
    }
}

pub type RawSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub async fn raw_connect(url: &str) -> RawSocket {
    let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws
}

pub async fn send(ws: &mut RawSocket, msg: WireMessage) {
    ws.send(Message::Binary(msg.encode().unwrap().into()))
        .await
        .unwrap();
}

/// Next protocol message, or `None` if nothing arrives within `wait`.
pub async fn recv_within(ws: &mut RawSocket, wait: Duration) -> Option<WireMessage> {
    loop {
        match timeout(wait, ws.next()).await {
            Ok(Some(Ok(Message::Binary(data)))) => {
                let bytes: Vec<u8> = data.into();
                return Some(WireMessage::decode(&bytes).unwrap());
            }
            Ok(Some(Ok(_))) => continue,
            _ => return None,
        }
    }
}

pub async fn recv(ws: &mut RawSocket) -> WireMessage {
    recv_within(ws, Duration::from_secs(3))
        .await
        .expect("expected a message from the server")
}
