//! WebSocket implementation of [`PatchTransport`].
//!
//! Requests get a fresh request id and wait on a oneshot until the reader
//! task hands over the matching response. Dropping the connection fails all
//! pending requests with `NotConnected`.

use async_trait::async_trait;
use autopatch_core::{MessageType, ProtocolError, WireMessage};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::error::ClientError;
use crate::subscription::PatchTransport;

pub struct WsTransport {
    outgoing: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<WireMessage>>>,
    next_request_id: AtomicU64,
    timeout: Duration,
}

impl WsTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            outgoing: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
            timeout,
        }
    }

    /// Route writes to a connection's writer task.
    pub fn attach(&self, outgoing: mpsc::Sender<Vec<u8>>) {
        *self.outgoing.lock() = Some(outgoing);
    }

    /// Drop the writer channel and fail every pending request.
    pub fn detach(&self) {
        self.outgoing.lock().take();
        let dropped = std::mem::take(&mut *self.pending.lock()).len();
        if dropped > 0 {
            log::debug!("Failed {dropped} pending requests on detach");
        }
    }

    pub fn is_attached(&self) -> bool {
        self.outgoing.lock().is_some()
    }

    /// Hand a response to the request waiting for it.
    pub fn resolve(&self, response: WireMessage) {
        match self.pending.lock().remove(&response.request_id) {
            Some(waiter) => {
                let _ = waiter.send(response);
            }
            None => log::debug!("Response to unknown request {}", response.request_id),
        }
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.lock().len()
    }

    /// Send without waiting for a response.
    pub async fn send(&self, msg: &WireMessage) -> Result<(), ClientError> {
        let sender = self.outgoing.lock().clone().ok_or(ClientError::NotConnected)?;
        sender
            .send(msg.encode()?)
            .await
            .map_err(|_| ClientError::NotConnected)
    }

    async fn request(&self, mut msg: WireMessage) -> Result<WireMessage, ClientError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        msg.request_id = request_id;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id, tx);
        if let Err(e) = self.send(&msg).await {
            self.pending.lock().remove(&request_id);
            return Err(e);
        }

        let response = match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(ClientError::NotConnected),
            Err(_) => {
                self.pending.lock().remove(&request_id);
                log::warn!("Request {request_id} ({:?}) timed out", msg.msg_type);
                return Err(ClientError::Timeout);
            }
        };

        if response.msg_type == MessageType::Error {
            let message = response.error_message()?;
            return Err(ClientError::Rejected(message));
        }
        Ok(response)
    }
}

#[async_trait]
impl PatchTransport for WsTransport {
    async fn subscribe(&self, type_name: &str) -> Result<Uuid, ClientError> {
        let response = self.request(WireMessage::subscribe(0, type_name)).await?;
        match (response.msg_type, response.subscription_id) {
            (MessageType::SubscribeAck, Some(id)) => Ok(id),
            _ => Err(ProtocolError::InvalidMessageType.into()),
        }
    }

    async fn unsubscribe(&self, type_name: &str, subscription_id: Option<Uuid>) -> Result<(), ClientError> {
        let response = self
            .request(WireMessage::unsubscribe(0, type_name, subscription_id))
            .await?;
        match response.msg_type {
            MessageType::UnsubscribeAck => Ok(()),
            _ => Err(ProtocolError::InvalidMessageType.into()),
        }
    }

    async fn request_full_data(&self, subscription_id: Uuid) -> Result<(), ClientError> {
        let response = self
            .request(WireMessage::request_full_data(0, subscription_id))
            .await?;
        match response.msg_type {
            MessageType::RequestFullDataAck => Ok(()),
            _ => Err(ProtocolError::InvalidMessageType.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Answer every request with `respond`, like a server would.
    fn echo_server(
        transport: Arc<WsTransport>,
        respond: fn(WireMessage) -> Option<WireMessage>,
    ) -> tokio::task::JoinHandle<()> {
        let _ = env_logger::builder().is_test(true).try_init();
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(16);
        transport.attach(tx);
        tokio::spawn(async move {
            while let Some(bytes) = rx.recv().await {
                let request = WireMessage::decode(&bytes).unwrap();
                if let Some(response) = respond(request) {
                    transport.resolve(response);
                }
            }
        })
    }

    #[tokio::test]
    async fn test_not_connected() {
        let transport = WsTransport::new(Duration::from_secs(1));
        assert_eq!(
            transport.subscribe("Car").await,
            Err(ClientError::NotConnected)
        );
        assert_eq!(transport.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_round_trip() {
        let transport = Arc::new(WsTransport::new(Duration::from_secs(1)));
        let _server = echo_server(transport.clone(), |req| {
            Some(WireMessage::subscribe_ack(
                req.request_id,
                req.type_name,
                Uuid::from_u128(7),
            ))
        });
        assert_eq!(transport.subscribe("Car").await, Ok(Uuid::from_u128(7)));
        assert_eq!(transport.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_error_response_is_rejected() {
        let transport = Arc::new(WsTransport::new(Duration::from_secs(1)));
        let _server = echo_server(transport.clone(), |req| {
            Some(WireMessage::error(req.request_id, "Unknown type: Truck"))
        });
        assert_eq!(
            transport.subscribe("Truck").await,
            Err(ClientError::Rejected("Unknown type: Truck".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout() {
        let transport = Arc::new(WsTransport::new(Duration::from_millis(100)));
        let _server = echo_server(transport.clone(), |_| None);
        assert_eq!(
            transport.request_full_data(Uuid::new_v4()).await,
            Err(ClientError::Timeout)
        );
        assert_eq!(transport.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_detach_fails_pending() {
        let transport = Arc::new(WsTransport::new(Duration::from_secs(5)));
        let _server = echo_server(transport.clone(), |_| None);
        let waiter = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.unsubscribe("Car", None).await })
        };
        while transport.pending_requests() == 0 {
            tokio::task::yield_now().await;
        }
        transport.detach();
        assert_eq!(waiter.await.unwrap(), Err(ClientError::NotConnected));
        assert!(!transport.is_attached());
    }
}
