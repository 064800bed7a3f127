//! # autopatch-core: Shared model for incremental collection mirroring
//!
//! Types that both ends of an Autopatch link agree on: the patch operation
//! model, identity keys, per-type field accessors and the binary wire envelope.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐   Vec<Operation>   ┌──────────────────┐
//! │ autopatch-server │ ─────────────────► │ autopatch-client │
//! │ (diff + batch)   │    WireMessage     │ (mirror + apply) │
//! └────────┬─────────┘                    └────────┬─────────┘
//!          │                                       │
//!          └────────── TypeDescriptor<T> ──────────┘
//!                   (key selector + FieldTable)
//! ```
//!
//! ## Modules
//!
//! - [`key`]: Identity keys resolving remove/replace targets
//! - [`path`]: `/-`, `/{index}`, `/{index}/{field}` patch paths
//! - [`operation`]: Add / Remove / Replace operations and batches
//! - [`field`]: Per-type field accessor table and type descriptor
//! - [`protocol`]: Binary wire envelope (bincode-encoded WireMessage)
//! - [`policy`]: Client change policy contract

pub mod key;
pub mod path;
pub mod operation;
pub mod field;
pub mod protocol;
pub mod policy;

// Re-exports for convenience
pub use key::ItemKey;
pub use path::{PatchPath, PathError};
pub use operation::{Batch, ConnectionId, OpKind, Operation};
pub use field::{FieldError, FieldTable, FieldTableBuilder, TypeDescriptor};
pub use protocol::{group_name, MessageType, ProtocolError, WireMessage};
pub use policy::ClientChangePolicy;
