//! WebSocket client for an autopatch server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect)
//! - Typed subscriptions backed by live mirrors
//! - Application-driven resync via `request_full_data`

use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use autopatch_core::{MessageType, ProtocolError, TypeDescriptor, WireMessage};

use crate::error::ClientError;
use crate::mirror::Mirror;
use crate::subscription::{ClientEvent, SubscriptionManager, SubscriptionState};
use crate::transport::WsTransport;

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// WebSocket URL of the server
    pub server_url: String,
    /// How long a request waits for its ack
    pub request_timeout_ms: u64,
    /// Capacity of the event channel handed out by `take_event_rx`
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:5249".to_string(),
            request_timeout_ms: 5000,
            event_capacity: 256,
        }
    }
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Self::default()
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// The autopatch client.
///
/// Owns one WebSocket connection and the subscriptions made over it. When the
/// connection drops, every subscription moves to `ConnectionLost`; call
/// [`reconnect`](Self::reconnect) to restore them with fresh snapshots.
pub struct AutopatchClient {
    config: ClientConfig,
    transport: Arc<WsTransport>,
    manager: Arc<SubscriptionManager>,
    state: Arc<RwLock<ConnectionState>>,
    event_tx: mpsc::Sender<ClientEvent>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    reader: Option<JoinHandle<()>>,
}

impl AutopatchClient {
    pub fn new(config: ClientConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let transport = Arc::new(WsTransport::new(config.request_timeout()));
        let manager = Arc::new(SubscriptionManager::new(transport.clone(), event_tx.clone()));
        Self {
            config,
            transport,
            manager,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            event_tx,
            event_rx: Some(event_rx),
            reader: None,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Connect to the server.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages. An
    /// existing connection is closed first.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        if self.reader.is_some() {
            self.disconnect().await;
        }
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(self.config.server_url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::warn!("Connect to {} failed: {e}", self.config.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed.into());
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.close().await;
        });
        self.transport.attach(out_tx);

        // Reader task: route responses and pushes
        let transport = self.transport.clone();
        let manager = self.manager.clone();
        let state = self.state.clone();
        let event_tx = self.event_tx.clone();
        self.reader = Some(tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match WireMessage::decode(&bytes) {
                            Ok(wire) => Self::route(&transport, &manager, wire).await,
                            Err(e) => log::warn!("Undecodable message from server: {e}"),
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            transport.detach();
            manager.connection_lost();
            log::info!("Disconnected from server");
            let _ = event_tx.send(ClientEvent::Disconnected).await;
        }));

        *self.state.write().await = ConnectionState::Connected;
        log::info!("Connected to {}", self.config.server_url);
        let _ = self.event_tx.send(ClientEvent::Connected).await;
        Ok(())
    }

    async fn route(transport: &WsTransport, manager: &SubscriptionManager, wire: WireMessage) {
        if wire.is_response() {
            transport.resolve(wire);
            return;
        }
        match wire.msg_type {
            MessageType::Patch | MessageType::Snapshot => manager.handle_push(&wire),
            MessageType::Ping => {
                if let Err(e) = transport.send(&WireMessage::pong()).await {
                    log::debug!("Pong not sent: {e}");
                }
            }
            MessageType::Pong => log::trace!("Pong received"),
            other => log::debug!("Unexpected {other:?} from server"),
        }
    }

    /// Close the connection and wait for the reader to wind down.
    ///
    /// Subscriptions stay registered in `ConnectionLost`.
    pub async fn disconnect(&mut self) {
        self.transport.detach();
        if let Some(mut reader) = self.reader.take() {
            if tokio::time::timeout(self.config.request_timeout(), &mut reader)
                .await
                .is_err()
            {
                log::warn!("Server did not close the connection, dropping it");
                reader.abort();
                *self.state.write().await = ConnectionState::Disconnected;
                self.manager.connection_lost();
            }
        }
    }

    /// Connect again and restore every lost subscription.
    ///
    /// Returns the number of subscriptions restored.
    pub async fn reconnect(&mut self) -> Result<usize, ClientError> {
        self.connect().await?;
        let restored = self.manager.resubscribe_all().await?;
        log::info!("Restored {restored} subscriptions");
        Ok(restored)
    }

    /// Subscribe to a type; repeated calls share one mirror.
    pub async fn subscribe<T>(&self, descriptor: TypeDescriptor<T>) -> Result<Mirror<T>, ClientError>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        self.manager.subscribe(descriptor).await
    }

    /// Release one reference to `type_name`.
    pub async fn unsubscribe(&self, type_name: &str) -> Result<bool, ClientError> {
        self.manager.unsubscribe(type_name).await
    }

    /// Ask the server for a fresh snapshot of `type_name`.
    pub async fn request_full_data(&self, type_name: &str) -> Result<(), ClientError> {
        self.manager.request_full_data(type_name).await
    }

    /// Send a ping to the server.
    pub async fn send_ping(&self) -> Result<(), ClientError> {
        self.transport.send(&WireMessage::ping()).await
    }

    pub fn mirror<T>(&self, type_name: &str) -> Result<Mirror<T>, ClientError>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        self.manager.mirror(type_name)
    }

    pub fn state_of(&self, type_name: &str) -> SubscriptionState {
        self.manager.state_of(type_name)
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn manager(&self) -> &Arc<SubscriptionManager> {
        &self.manager
    }
}

impl Drop for AutopatchClient {
    fn drop(&mut self) {
        self.transport.detach();
    }
}
