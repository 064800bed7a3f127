//! # autopatch-server: Incremental collection mirroring, server side
//!
//! Tracks mutable in-memory collections and pushes their changes to
//! subscribed WebSocket clients as batches of patch operations.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────┐  on_inserted / on_removed / on_field_changed
//! │ TrackedCollection  │ ─────────────────────────┐
//! └────────────────────┘                          ▼
//!                                         ┌───────────────┐
//!                                         │ DiffGenerator │
//!                                         └───────┬───────┘
//!                                                 │ Operation
//!                                                 ▼
//!                                         ┌───────────────┐  timer / size / manual
//!                                         │FlushScheduler │ ───────────────┐
//!                                         └───────────────┘                ▼
//!                                                                  ┌───────────────┐
//!                                                                  │BroadcastRouter│
//!                                                                  └───────┬───────┘
//!                                                                          │ per connection
//!                                                                          ▼
//!                                                                    PatchServer (WS)
//! ```
//!
//! ## Modules
//!
//! - [`collection`]: Observable ordered collection
//! - [`diff`]: Change notifications to patch operations
//! - [`scheduler`]: Per-type batching queue with throttled flushes
//! - [`router`]: Subscription groups and snapshot-ordered fan-out
//! - [`service`]: [`AutopatchService`], the registry tying it together
//! - [`server`]: WebSocket front end
//!
//! ## Delivery
//!
//! Delivery is at most once. A batch whose handler fails is logged and
//! discarded; a client that suspects it missed something asks for a fresh
//! snapshot with `RequestFullData`.

pub mod collection;
pub mod config;
pub mod diff;
pub mod error;
pub mod router;
pub mod scheduler;
pub mod server;
pub mod service;

// Re-exports for convenience
pub use collection::{ChangeObserver, TrackedCollection};
pub use config::{AutopatchConfig, TypeConfig};
pub use diff::{DiffGenerator, OperationSink};
pub use error::{ServiceError, TrackError};
pub use router::{split_batches, BroadcastRouter, MemberState, OutboundSender, PatchEntry, RouterStats};
pub use scheduler::{FlushError, FlushMode, FlushScheduler, FlushStats, SchedulerConfig};
pub use server::{PatchServer, ServerStats};
pub use service::{AutopatchService, Subscription};
