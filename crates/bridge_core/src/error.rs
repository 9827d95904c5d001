use shared::error::ErrorKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no stored session credential")]
    NoCredential,
    #[error("not connected to the remote network")]
    NotConnected,
    #[error("failed to connect: {0:#}")]
    Connect(anyhow::Error),
    #[error("failed to restore session: {0:#}")]
    Restore(anyhow::Error),
    #[error("failed to log in: {0:#}")]
    Login(anyhow::Error),
    #[error("failed to fetch contacts: {0:#}")]
    Contacts(anyhow::Error),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Contacts(_) => ErrorKind::Reconciliation,
            _ => ErrorKind::Transport,
        }
    }
}

#[derive(Debug, Error)]
pub enum PairingError {
    #[error("failed to encode QR code: {0}")]
    Encode(String),
    #[error("failed to upload QR code: {0:#}")]
    Upload(anyhow::Error),
    #[error("failed to send QR code: {0:#}")]
    Send(anyhow::Error),
}

impl PairingError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Pairing
    }

    /// Text posted to the room that asked for the pairing.
    pub fn notice(&self) -> &'static str {
        match self {
            Self::Encode(_) => "Failed to encode QR code (see logs for details)",
            Self::Upload(_) => "Failed to upload QR code (see logs for details)",
            Self::Send(_) => "Failed to send QR code (see logs for details)",
        }
    }
}
