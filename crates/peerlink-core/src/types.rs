//! Core data types for peerlink

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which side opened a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerRole {
    /// The remote peer connected to us
    Inbound,
    /// We connected to the remote peer
    Outbound,
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerRole::Inbound => write!(f, "inbound"),
            PeerRole::Outbound => write!(f, "outbound"),
        }
    }
}

/// States of the file transfer state machine.
///
/// `Idle` is both the initial and the terminal state. Senders go through
/// `WaitingConfirmation` and `SendingChunks`, receivers through
/// `ReceivingChunks`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Idle,
    WaitingConfirmation,
    SendingChunks,
    ReceivingChunks,
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransferState::Idle => "idle",
            TransferState::WaitingConfirmation => "waiting_confirmation",
            TransferState::SendingChunks => "sending_chunks",
            TransferState::ReceivingChunks => "receiving_chunks",
        };
        f.write_str(s)
    }
}

/// Metadata describing a file offered for transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// Bare file name (no directory components)
    pub filename: String,
    /// File size in bytes
    pub size: u64,
    /// Hex-encoded BLAKE3 hash of the whole file
    pub hash: String,
    /// Extension including the leading dot, or empty
    pub extension: String,
    /// Number of chunks the sender will stream
    pub total_chunks: u64,
}

/// Seconds since the Unix epoch as a float, the timestamp format on the wire
pub fn unix_timestamp() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}
