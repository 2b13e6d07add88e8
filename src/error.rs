use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Not connected")]
    NotConnected,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Decryption failed")]
    Decryption,

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Checksum mismatch (expected {expected}, got {actual})")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Key lookup failed: {0}")]
    KeyLookup(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transfer aborted: {0}")]
    TransferAborted(String),

    #[error("Unknown transfer: {0}")]
    UnknownTransfer(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;
