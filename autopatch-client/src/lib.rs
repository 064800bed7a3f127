//! # autopatch-client: Incremental collection mirroring, client side
//!
//! Subscribes to tracked types on an autopatch server and keeps a local
//! mirror of each one up to date from the pushed patch batches.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐  Patch / Snapshot   ┌─────────────────────┐
//! │ AutopatchClient│ ──────────────────► │ SubscriptionManager │
//! │ (reader task)  │                     │ (ref counts, state) │
//! └───────┬────────┘                     └──────────┬──────────┘
//!         │ acks                                    │ per type
//!         ▼                                         ▼
//! ┌────────────────┐                     ┌─────────────────────┐
//! │  WsTransport   │ ◄── subscribe ───── │ PatchApplier → Mirror│
//! └────────────────┘                     └─────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`client`]: WebSocket connection lifecycle
//! - [`transport`]: Request/response correlation over the socket
//! - [`subscription`]: Per-type subscription state machine
//! - [`applier`]: Applies operation batches to mirrors
//! - [`mirror`]: Observe-only local replica

pub mod applier;
pub mod client;
pub mod error;
pub mod mirror;
pub mod subscription;
pub mod transport;

// Re-exports for convenience
pub use applier::{ApplyReport, Inconsistency, PatchApplier};
pub use client::{AutopatchClient, ClientConfig, ConnectionState};
pub use error::ClientError;
pub use mirror::Mirror;
pub use subscription::{ClientEvent, PatchTransport, SubscriptionManager, SubscriptionState};
pub use transport::WsTransport;
