//! WebSocket front end of the autopatch service.
//!
//! Architecture:
//! ```text
//! Client A ──┐                         ┌── outbound channel A ──► Client A
//!            ├── PatchServer ── AutopatchService (router)
//! Client B ──┘                         └── outbound channel B ──► Client B
//! ```
//!
//! Each connection task owns its socket. Requests are answered inline; pushes
//! produced by flushes arrive on the connection's unbounded outbound channel
//! and are written by the same task.

use autopatch_core::{ConnectionId, MessageType, WireMessage};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::error::ServiceError;
use crate::service::AutopatchService;

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub failed_requests: u64,
}

/// The patch server.
pub struct PatchServer {
    service: Arc<AutopatchService>,
    stats: Arc<RwLock<ServerStats>>,
}

impl PatchServer {
    pub fn new(service: Arc<AutopatchService>) -> Self {
        Self {
            service,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Start listening on the configured bind address.
    ///
    /// This runs the accept loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), ServiceError> {
        let bind_addr = self.service.config().bind_addr.clone();
        let listener = TcpListener::bind(&bind_addr).await?;
        log::info!("Patch server listening on {bind_addr}");
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServiceError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let service = self.service.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, service, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        service: Arc<AutopatchService>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let connection: ConnectionId = Uuid::new_v4();
        let (tx, mut outbound) = mpsc::unbounded_channel::<Arc<Vec<u8>>>();
        service.connect(connection, tx);
        log::info!("WebSocket connection {connection} established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let result = loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += bytes.len() as u64;
                            }
                            let response = match WireMessage::decode(&bytes) {
                                Ok(request) => Self::handle_request(&service, connection, request),
                                Err(e) => {
                                    log::warn!("Failed to decode message from {addr}: {e}");
                                    Some(WireMessage::error(0, e.to_string()))
                                }
                            };
                            if let Some(response) = response {
                                if response.msg_type == MessageType::Error {
                                    stats.write().await.failed_requests += 1;
                                }
                                let encoded = match response.encode() {
                                    Ok(encoded) => encoded,
                                    Err(e) => break Err(e.into()),
                                };
                                if let Err(e) = ws_sender.send(Message::Binary(encoded.into())).await {
                                    break Err(e.into());
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection {connection} closed from {addr}");
                            break Ok(());
                        }

                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                                break Err(e.into());
                            }
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break Ok(());
                        }

                        _ => {}
                    }
                }

                pushed = outbound.recv() => {
                    let Some(data) = pushed else { break Ok(()) };
                    if let Err(e) = ws_sender.send(Message::Binary(data.to_vec().into())).await {
                        break Err(e.into());
                    }
                }
            }
        };

        service.disconnect(&connection);
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        result
    }

    /// Answer one request. Returns `None` for messages that need no reply.
    fn handle_request(
        service: &AutopatchService,
        connection: ConnectionId,
        request: WireMessage,
    ) -> Option<WireMessage> {
        let request_id = request.request_id;
        let response = match request.msg_type {
            MessageType::Subscribe => service
                .subscribe_to_type(connection, &request.type_name)
                .map(|id| WireMessage::subscribe_ack(request_id, &request.type_name, id)),

            MessageType::Unsubscribe => match request.subscription_id {
                Some(id) => {
                    service.unsubscribe_by_id(&connection, &id);
                    Ok(WireMessage::unsubscribe_ack(request_id, &request.type_name))
                }
                None => service
                    .unsubscribe(&connection, &request.type_name)
                    .map(|_| WireMessage::unsubscribe_ack(request_id, &request.type_name)),
            },

            MessageType::RequestFullData => match request.subscription_id {
                Some(id) => service
                    .request_full_data(&id, &connection)
                    .map(|()| WireMessage::request_full_data_ack(request_id, id)),
                None => {
                    return Some(WireMessage::error(
                        request_id,
                        "RequestFullData without subscription id",
                    ))
                }
            },

            MessageType::Ping => return Some(WireMessage::pong()),

            MessageType::Pong => return None,

            other => {
                log::debug!("Unhandled message type from {connection}: {other:?}");
                return Some(WireMessage::error(
                    request_id,
                    format!("Unexpected message type {other:?}"),
                ));
            }
        };

        Some(response.unwrap_or_else(|e| {
            log::warn!("Request {request_id} from {connection} failed: {e}");
            WireMessage::error(request_id, e.to_string())
        }))
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn service(&self) -> &Arc<AutopatchService> {
        &self.service
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.service.config().bind_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AutopatchConfig, TypeConfig};
    use autopatch_core::{FieldTable, TypeDescriptor};
    use serde::Serialize;

    #[derive(Clone, Serialize)]
    struct Car {
        id: u32,
    }

    fn service() -> Arc<AutopatchService> {
        let service = AutopatchService::new(AutopatchConfig::default()).unwrap();
        let fields = FieldTable::<Car>::builder()
            .field("id", |c| c.id, |c, v| c.id = v)
            .build();
        service
            .register(TypeConfig::new(TypeDescriptor::new("Car", |c: &Car| c.id, fields)))
            .unwrap();
        Arc::new(service)
    }

    fn attach(service: &AutopatchService) -> (ConnectionId, mpsc::UnboundedReceiver<Arc<Vec<u8>>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        service.connect(id, tx);
        (id, rx)
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = PatchServer::new(service());
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(server.bind_addr(), "127.0.0.1:5249");
    }

    #[tokio::test]
    async fn test_subscribe_request_is_acked() {
        let service = service();
        let (conn, _rx) = attach(&service);
        let ack = PatchServer::handle_request(&service, conn, WireMessage::subscribe(7, "Car")).unwrap();
        assert_eq!(ack.msg_type, MessageType::SubscribeAck);
        assert_eq!(ack.request_id, 7);
        assert!(ack.subscription_id.is_some());
    }

    #[tokio::test]
    async fn test_unknown_type_yields_error() {
        let service = service();
        let (conn, _rx) = attach(&service);
        let err = PatchServer::handle_request(&service, conn, WireMessage::subscribe(3, "Truck")).unwrap();
        assert_eq!(err.msg_type, MessageType::Error);
        assert_eq!(err.request_id, 3);
        assert!(err.error_message().unwrap().contains("Truck"));
    }

    #[tokio::test]
    async fn test_full_data_for_foreign_subscription_rejected() {
        let service = service();
        let (a, _a_rx) = attach(&service);
        let (b, _b_rx) = attach(&service);
        let ack = PatchServer::handle_request(&service, a, WireMessage::subscribe(1, "Car")).unwrap();
        let id = ack.subscription_id.unwrap();

        let resp = PatchServer::handle_request(&service, b, WireMessage::request_full_data(2, id)).unwrap();
        assert_eq!(resp.msg_type, MessageType::Error);

        let resp = PatchServer::handle_request(&service, a, WireMessage::request_full_data(3, id)).unwrap();
        assert_eq!(resp.msg_type, MessageType::RequestFullDataAck);
    }

    #[tokio::test]
    async fn test_ping_and_unsubscribe() {
        let service = service();
        let (conn, _rx) = attach(&service);
        let pong = PatchServer::handle_request(&service, conn, WireMessage::ping()).unwrap();
        assert_eq!(pong.msg_type, MessageType::Pong);

        // Over-unsubscribe is acknowledged
        let ack = PatchServer::handle_request(&service, conn, WireMessage::unsubscribe(4, "Car", None)).unwrap();
        assert_eq!(ack.msg_type, MessageType::UnsubscribeAck);
    }
}
