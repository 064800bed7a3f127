//! Client-side errors.

use autopatch_core::ProtocolError;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum ClientError {
    Protocol(ProtocolError),
    /// The server answered a request with an error
    Rejected(String),
    NotConnected,
    /// No response within the request timeout
    Timeout,
    /// The type is already subscribed with a different item type
    TypeMismatch(String),
    NotSubscribed(String),
    /// The type's last reference is being released
    Unsubscribing(String),
    /// Every reference was released before the subscription completed
    Cancelled(String),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol(e) => write!(f, "Protocol error: {e}"),
            Self::Rejected(msg) => write!(f, "Request rejected by server: {msg}"),
            Self::NotConnected => write!(f, "Not connected"),
            Self::Timeout => write!(f, "Request timed out"),
            Self::TypeMismatch(name) => {
                write!(f, "Type {name} is subscribed with a different item type")
            }
            Self::NotSubscribed(name) => write!(f, "Not subscribed to {name}"),
            Self::Unsubscribing(name) => write!(f, "Subscription to {name} is being released"),
            Self::Cancelled(name) => write!(f, "Subscription to {name} was cancelled"),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Protocol(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ProtocolError> for ClientError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}
