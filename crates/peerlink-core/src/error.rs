//! Error types for peerlink

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("Size mismatch for {filename}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        filename: String,
        expected: u64,
        actual: u64,
    },

    #[error("Out-of-order chunk from {peer} for {filename}: expected {expected}, got {actual}")]
    ChunkOutOfOrder {
        peer: String,
        filename: String,
        expected: u64,
        actual: u64,
    },

    #[error("Incomplete transfer of {filename}: received {received} of {total} chunks")]
    IncompleteTransfer {
        filename: String,
        received: u64,
        total: u64,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Frame too large: {len} bytes (limit {max})")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Handshake timed out with {0}")]
    HandshakeTimeout(String),

    #[error("Connection rejected by {peer}: {message}")]
    ConnectionRejected { peer: String, message: String },

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Already connected to {0}")]
    AlreadyConnected(String),

    #[error("Not connected to {0}")]
    NotConnected(String),

    #[error("Peer {0} disconnected")]
    PeerDisconnected(String),

    #[error("A file transfer is already in progress with {0}")]
    TransferBusy(String),

    #[error("Transfer of {filename} with {peer} aborted")]
    TransferAborted { peer: String, filename: String },

    #[error("Transfer of {filename} with {peer} stalled")]
    TransferStalled { peer: String, filename: String },

    #[error("No pending file offer")]
    NoPendingOffer,

    #[error("Username '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Directory unreachable: {0}")]
    Unreachable(String),

    #[error("Directory error: {0}")]
    Directory(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

pub type Result<T> = std::result::Result<T, Error>;
