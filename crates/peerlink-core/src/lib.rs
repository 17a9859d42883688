//! peerlink core - wire protocol, framing, and file chunking
//!
//! This crate provides the building blocks shared by every peerlink peer:
//! the JSON envelope exchanged over TCP, its length-prefixed framing, and
//! the helpers that hash, split, and place transferred files.

pub mod chunk;
pub mod error;
pub mod frame;
pub mod proto;
pub mod types;

pub use error::{Error, Result};
pub use frame::{encode_frame, write_frame, FrameReader};
pub use proto::{Envelope, FileOffer, HandshakeStatus};
pub use types::*;

/// Default chunk size for file transfers: 8 KiB
pub const CHUNK_SIZE: usize = 8 * 1024;

/// Block size used when streaming a file through the hasher
pub const HASH_BLOCK_SIZE: usize = 8 * 1024;

/// Largest frame payload accepted on the wire: 16 MiB
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Largest chunk whose base64 `file_chunk` envelope still fits in a frame
pub const MAX_CHUNK_SIZE: usize = 8 * 1024 * 1024;
