//! Binary wire envelope for the subscription RPC surface and patch pushes.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬────────────┬───────────┬─────────────────┬──────────┐
//! │ msg_type │ request_id │ type_name │ subscription_id │ payload  │
//! │ 1 byte   │ varint     │ string    │ option<16 B>    │ variable │
//! └──────────┴────────────┴───────────┴─────────────────┴──────────┘
//! ```
//!
//! Requests carry a client-chosen `request_id` that the server echoes in the
//! matching ack or error. Pushes (`Patch`, `Snapshot`) use request id 0 and a
//! JSON operation array as payload.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::operation::Operation;

/// Push channel name for a tracked type.
pub fn group_name(type_name: &str) -> String {
    format!("patch/{type_name}")
}

/// Message types for the patch protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Subscribe the connection to a type
    Subscribe = 1,
    /// Subscription established, carries the subscription id
    SubscribeAck = 2,
    /// Leave a type's group
    Unsubscribe = 3,
    UnsubscribeAck = 4,
    /// Ask for a connection-scoped snapshot
    RequestFullData = 5,
    RequestFullDataAck = 6,
    /// Incremental operations broadcast to the group
    Patch = 7,
    /// Full state for a single connection
    Snapshot = 8,
    /// Request failed, payload is a UTF-8 message
    Error = 9,
    /// Heartbeat ping
    Ping = 10,
    /// Heartbeat pong
    Pong = 11,
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub msg_type: MessageType,
    pub request_id: u64,
    pub type_name: String,
    pub subscription_id: Option<Uuid>,
    pub payload: Vec<u8>,
}

impl WireMessage {
    fn new(msg_type: MessageType, request_id: u64, type_name: impl Into<String>) -> Self {
        Self {
            msg_type,
            request_id,
            type_name: type_name.into(),
            subscription_id: None,
            payload: Vec::new(),
        }
    }

    fn with_subscription(mut self, subscription_id: Uuid) -> Self {
        self.subscription_id = Some(subscription_id);
        self
    }

    pub fn subscribe(request_id: u64, type_name: impl Into<String>) -> Self {
        Self::new(MessageType::Subscribe, request_id, type_name)
    }

    pub fn subscribe_ack(request_id: u64, type_name: impl Into<String>, subscription_id: Uuid) -> Self {
        Self::new(MessageType::SubscribeAck, request_id, type_name).with_subscription(subscription_id)
    }

    /// Unsubscribe by type name, or by id when one is given.
    pub fn unsubscribe(
        request_id: u64,
        type_name: impl Into<String>,
        subscription_id: Option<Uuid>,
    ) -> Self {
        Self {
            subscription_id,
            ..Self::new(MessageType::Unsubscribe, request_id, type_name)
        }
    }

    pub fn unsubscribe_ack(request_id: u64, type_name: impl Into<String>) -> Self {
        Self::new(MessageType::UnsubscribeAck, request_id, type_name)
    }

    pub fn request_full_data(request_id: u64, subscription_id: Uuid) -> Self {
        Self::new(MessageType::RequestFullData, request_id, "").with_subscription(subscription_id)
    }

    pub fn request_full_data_ack(request_id: u64, subscription_id: Uuid) -> Self {
        Self::new(MessageType::RequestFullDataAck, request_id, "").with_subscription(subscription_id)
    }

    /// Incremental push for a type's group.
    pub fn patch(type_name: impl Into<String>, ops: &[Operation]) -> Result<Self, ProtocolError> {
        Ok(Self {
            payload: Operation::encode_all(ops)?,
            ..Self::new(MessageType::Patch, 0, type_name)
        })
    }

    /// Snapshot push for one connection.
    pub fn snapshot(type_name: impl Into<String>, ops: &[Operation]) -> Result<Self, ProtocolError> {
        Ok(Self {
            payload: Operation::encode_all(ops)?,
            ..Self::new(MessageType::Snapshot, 0, type_name)
        })
    }

    pub fn error(request_id: u64, message: impl Into<String>) -> Self {
        Self {
            payload: message.into().into_bytes(),
            ..Self::new(MessageType::Error, request_id, "")
        }
    }

    pub fn ping() -> Self {
        Self::new(MessageType::Ping, 0, "")
    }

    pub fn pong() -> Self {
        Self::new(MessageType::Pong, 0, "")
    }

    /// True for messages answering a request (acks and errors).
    pub fn is_response(&self) -> bool {
        matches!(
            self.msg_type,
            MessageType::SubscribeAck
                | MessageType::UnsubscribeAck
                | MessageType::RequestFullDataAck
                | MessageType::Error
        )
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    /// Parse the operation array of a patch or snapshot push.
    pub fn operations(&self) -> Result<Vec<Operation>, ProtocolError> {
        if !matches!(self.msg_type, MessageType::Patch | MessageType::Snapshot) {
            return Err(ProtocolError::InvalidMessageType);
        }
        Operation::decode_all(&self.payload)
    }

    pub fn error_message(&self) -> Result<String, ProtocolError> {
        if self.msg_type != MessageType::Error {
            return Err(ProtocolError::InvalidMessageType);
        }
        String::from_utf8(self.payload.clone())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType,
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}
