//! Server-side error types.

use autopatch_core::{ItemKey, ProtocolError};
use std::fmt;
use uuid::Uuid;

/// Errors raised while mutating or observing a tracked collection.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackError {
    /// Two live items yield the same identity key
    DuplicateKey { type_name: String, key: ItemKey },
    /// An update tried to change an item's identity key
    KeyChanged { type_name: String, from: ItemKey, to: ItemKey },
    UnknownItem { type_name: String, key: ItemKey },
    UnknownField { type_name: String, field: String },
    IndexOutOfBounds { index: usize, len: usize },
    /// The collection is already observed
    AlreadyTracking(String),
    SerializationError(String),
}

impl fmt::Display for TrackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateKey { type_name, key } => {
                write!(f, "Duplicate identity key {key} in tracked type {type_name}")
            }
            Self::KeyChanged { type_name, from, to } => {
                write!(f, "Identity key of {type_name} changed from {from} to {to}")
            }
            Self::UnknownItem { type_name, key } => {
                write!(f, "No tracked {type_name} with key {key}")
            }
            Self::UnknownField { type_name, field } => {
                write!(f, "Type {type_name} has no tracked field {field}")
            }
            Self::IndexOutOfBounds { index, len } => {
                write!(f, "Index {index} out of bounds for collection of length {len}")
            }
            Self::AlreadyTracking(type_name) => {
                write!(f, "Collection of {type_name} is already tracked")
            }
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
        }
    }
}

impl std::error::Error for TrackError {}

/// Errors surfaced by [`crate::AutopatchService`] and the WebSocket server.
#[derive(Debug)]
pub enum ServiceError {
    /// No type registered under this name
    UnknownType(String),
    TypeAlreadyRegistered(String),
    UnknownSubscription(Uuid),
    UnknownConnection(Uuid),
    /// The type was shut down and accepts no new subscribers
    Stopped(String),
    /// Invalid global or per-type configuration
    Config(String),
    Track(TrackError),
    Protocol(ProtocolError),
    Io(std::io::Error),
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownType(name) => write!(f, "Unknown type: {name}"),
            Self::TypeAlreadyRegistered(name) => write!(f, "Type already registered: {name}"),
            Self::UnknownSubscription(id) => write!(f, "Unknown subscription: {id}"),
            Self::UnknownConnection(id) => write!(f, "Unknown connection: {id}"),
            Self::Stopped(name) => write!(f, "Type {name} is shut down"),
            Self::Config(e) => write!(f, "Configuration error: {e}"),
            Self::Track(e) => write!(f, "Tracking error: {e}"),
            Self::Protocol(e) => write!(f, "Protocol error: {e}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for ServiceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Track(e) => Some(e),
            Self::Protocol(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TrackError> for ServiceError {
    fn from(e: TrackError) -> Self {
        Self::Track(e)
    }
}

impl From<ProtocolError> for ServiceError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

impl From<std::io::Error> for ServiceError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
