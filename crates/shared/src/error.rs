use std::fmt;

use serde::{Deserialize, Serialize};

/// Failure classes the session controller distinguishes when logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connect, restore or login against the remote network.
    Transport,
    /// QR encoding or upload while pairing.
    Pairing,
    /// Per-item failures while mirroring receipts or contacts.
    Reconciliation,
    /// Malformed inbound events.
    Decode,
    Storage,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::Pairing => "pairing",
            Self::Reconciliation => "reconciliation",
            Self::Decode => "decode",
            Self::Storage => "storage",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
