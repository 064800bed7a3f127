use serde::{Deserialize, Serialize};

/// How client-originated edits to a tracked type are to be treated.
///
/// Only the contract lives here; no component in this workspace enforces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ClientChangePolicy {
    /// Accept and apply client changes without confirmation.
    #[default]
    AutoAccept,
    /// Client changes need confirmation before they are applied.
    ConfirmationRequired,
    /// Every client change is rejected.
    Reject,
}
