//! Events surfaced to the UI collaborator
//!
//! The core never prompts the user itself. Anything that needs attention is
//! posted on an unbounded channel; decisions travel back through one-shot
//! replies or the node's accept/reject entrypoints.

use peerlink_core::{FileMetadata, PeerRole};
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::sync::{mpsc, oneshot};

pub type EventSender = mpsc::UnboundedSender<ClientEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<ClientEvent>;

/// Create the event channel shared by all components of a node
pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Why a transfer ended without a verified file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferFailure {
    /// The peer declined the offer
    Rejected,
    /// No answer within the confirmation deadline
    TimedOut,
    /// No chunk activity within the stall timeout
    Stalled,
    /// The connection went away mid-transfer
    PeerDisconnected,
    /// The local user aborted
    Aborted,
    /// The receiver called off a transfer already under way
    CancelledByPeer,
    /// The peer violated the transfer protocol
    Protocol(String),
    /// Local file or socket I/O failed
    Io(String),
}

impl fmt::Display for TransferFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferFailure::Rejected => write!(f, "rejected by peer"),
            TransferFailure::TimedOut => write!(f, "no answer in time"),
            TransferFailure::Stalled => write!(f, "stalled"),
            TransferFailure::PeerDisconnected => write!(f, "peer disconnected"),
            TransferFailure::Aborted => write!(f, "aborted"),
            TransferFailure::CancelledByPeer => write!(f, "cancelled by peer"),
            TransferFailure::Protocol(msg) => write!(f, "protocol error: {}", msg),
            TransferFailure::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

/// Something the user should hear about
#[derive(Debug)]
pub enum ClientEvent {
    /// A peer wants to connect; answer through the decision handle
    ConnectionRequested(ConnectionDecision),
    /// A connection was established
    PeerConnected {
        username: String,
        role: PeerRole,
        addr: SocketAddr,
    },
    /// A connection was torn down
    PeerDisconnected { username: String },
    /// A chat message arrived
    TextReceived {
        from: String,
        content: String,
        timestamp: f64,
    },
    /// A peer offered a file; answer with accept/reject on the node
    FileOffered { from: String, metadata: FileMetadata },
    /// A second offer arrived while another was pending or active
    FileOfferDeclined { from: String, filename: String },
    /// Chunks moved
    TransferProgress {
        peer: String,
        filename: String,
        chunks_done: u64,
        total_chunks: u64,
    },
    /// Our file reached the peer in full
    FileSent { peer: String, filename: String },
    /// A file was received and placed in the download directory.
    ///
    /// `verified` is false when size or hash did not match the offer; the
    /// file is kept either way.
    FileReceived {
        from: String,
        path: PathBuf,
        size: u64,
        verified: bool,
        expected_hash: String,
        actual_hash: String,
    },
    /// A transfer ended without producing a file
    TransferFailed {
        peer: String,
        filename: String,
        reason: TransferFailure,
    },
}

/// A pending inbound connection waiting for the user's answer
#[derive(Debug)]
pub struct ConnectionDecision {
    pub username: String,
    pub addr: SocketAddr,
    reply: oneshot::Sender<bool>,
}

impl ConnectionDecision {
    pub(crate) fn new(username: String, addr: SocketAddr) -> (Self, oneshot::Receiver<bool>) {
        let (reply, rx) = oneshot::channel();
        (
            Self {
                username,
                addr,
                reply,
            },
            rx,
        )
    }

    /// False once the handshake stopped waiting (timeout or dropped socket)
    pub fn is_pending(&self) -> bool {
        !self.reply.is_closed()
    }

    /// Returns false if the request had already expired
    pub fn accept(self) -> bool {
        self.reply.send(true).is_ok()
    }

    /// Returns false if the request had already expired
    pub fn reject(self) -> bool {
        self.reply.send(false).is_ok()
    }
}
