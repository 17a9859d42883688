//! peerlink client library
//!
//! Directory lookups, handshaken peer links, chat dispatch, and the file
//! transfer state machine. `Node` ties them together.

pub mod config;
pub mod connection;
pub mod directory;
pub mod dispatcher;
pub mod events;
pub mod node;
pub mod transfer;
pub mod transport;

pub use config::Config;
pub use events::{ClientEvent, ConnectionDecision, EventReceiver, TransferFailure};
pub use node::Node;
pub use transfer::{SendOutcome, TransferStatus};
