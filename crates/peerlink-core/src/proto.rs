//! Wire message definitions
//!
//! Every frame on a peer connection carries one JSON object tagged by its
//! `type` field. Chunk payloads travel base64 encoded since the envelope is
//! text.

use crate::types::{unix_timestamp, FileMetadata};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Answer to a connection request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeStatus {
    Accepted,
    Rejected,
}

/// `file_info` body: the sender's proposal to transfer a file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOffer {
    pub filename: String,
    pub size: u64,
    pub hash: String,
    #[serde(default)]
    pub extension: String,
    pub total_chunks: u64,
    #[serde(default)]
    pub sender: String,
}

impl FileOffer {
    pub fn new(metadata: FileMetadata, sender: impl Into<String>) -> Self {
        Self {
            filename: metadata.filename,
            size: metadata.size,
            hash: metadata.hash,
            extension: metadata.extension,
            total_chunks: metadata.total_chunks,
            sender: sender.into(),
        }
    }

    pub fn metadata(&self) -> FileMetadata {
        FileMetadata {
            filename: self.filename.clone(),
            size: self.size,
            hash: self.hash.clone(),
            extension: self.extension.clone(),
            total_chunks: self.total_chunks,
        }
    }
}

/// Message envelope for everything exchanged between peers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    ConnectionRequest {
        username: String,
        timestamp: f64,
    },
    ConnectionResponse {
        status: HandshakeStatus,
        #[serde(default)]
        message: String,
    },
    Text {
        content: String,
        sender: String,
        timestamp: f64,
    },
    FileInfo(FileOffer),
    FileAccept {
        filename: String,
    },
    FileReject {
        filename: String,
    },
    FileChunk {
        chunk_id: u64,
        #[serde(with = "base64_data")]
        data: Vec<u8>,
        total_chunks: u64,
        #[serde(default)]
        filename: String,
    },
    FileComplete {
        filename: String,
        hash: String,
        #[serde(default)]
        total_chunks: u64,
    },
}

impl Envelope {
    /// The `type` tag as it appears on the wire
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::ConnectionRequest { .. } => "connection_request",
            Envelope::ConnectionResponse { .. } => "connection_response",
            Envelope::Text { .. } => "text",
            Envelope::FileInfo(_) => "file_info",
            Envelope::FileAccept { .. } => "file_accept",
            Envelope::FileReject { .. } => "file_reject",
            Envelope::FileChunk { .. } => "file_chunk",
            Envelope::FileComplete { .. } => "file_complete",
        }
    }

    /// Encode the envelope as JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode an envelope from JSON bytes
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(buf)?)
    }

    /// Decode a handshake opener, rejecting anything else
    pub fn expect_connection_request(buf: &[u8]) -> Result<(String, f64)> {
        match Self::from_bytes(buf)? {
            Envelope::ConnectionRequest { username, timestamp } => Ok((username, timestamp)),
            other => Err(Error::Protocol(format!(
                "expected connection_request, got {}",
                other.kind()
            ))),
        }
    }
}

/// Helper functions to create common message types

pub fn connection_request(username: &str) -> Envelope {
    Envelope::ConnectionRequest {
        username: username.to_string(),
        timestamp: unix_timestamp(),
    }
}

pub fn connection_response(status: HandshakeStatus, message: impl Into<String>) -> Envelope {
    Envelope::ConnectionResponse {
        status,
        message: message.into(),
    }
}

pub fn text(sender: &str, content: impl Into<String>) -> Envelope {
    Envelope::Text {
        content: content.into(),
        sender: sender.to_string(),
        timestamp: unix_timestamp(),
    }
}

pub fn file_chunk(chunk_id: u64, data: Vec<u8>, total_chunks: u64, filename: &str) -> Envelope {
    Envelope::FileChunk {
        chunk_id,
        data,
        total_chunks,
        filename: filename.to_string(),
    }
}

mod base64_data {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_wire_format() {
        let env = file_chunk(2, vec![0, 159, 255], 3, "report.pdf");
        let value: serde_json::Value = serde_json::from_slice(&env.to_bytes().unwrap()).unwrap();

        assert_eq!(value["type"], "file_chunk");
        assert_eq!(value["chunk_id"], 2);
        assert_eq!(value["data"], "AJ//");
        assert_eq!(value["total_chunks"], 3);

        let decoded = Envelope::from_bytes(&env.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn test_file_info_is_flat_on_the_wire() {
        let raw = br#"{"type":"file_info","filename":"a.txt","size":5,"hash":"ab",
            "extension":".txt","total_chunks":1,"sender":"alice"}"#;
        match Envelope::from_bytes(raw).unwrap() {
            Envelope::FileInfo(offer) => {
                assert_eq!(offer.filename, "a.txt");
                assert_eq!(offer.sender, "alice");
                assert_eq!(offer.metadata().total_chunks, 1);
            }
            other => panic!("Expected FileInfo, got {}", other.kind()),
        }
    }

    #[test]
    fn test_optional_fields_default() {
        let raw = br#"{"type":"file_complete","filename":"a.txt","hash":"ab"}"#;
        match Envelope::from_bytes(raw).unwrap() {
            Envelope::FileComplete { total_chunks, .. } => assert_eq!(total_chunks, 0),
            other => panic!("Expected FileComplete, got {}", other.kind()),
        }

        let raw = br#"{"type":"connection_response","status":"rejected"}"#;
        assert_eq!(
            Envelope::from_bytes(raw).unwrap(),
            connection_response(HandshakeStatus::Rejected, "")
        );
    }

    #[test]
    fn test_bad_payloads_are_decode_errors() {
        assert!(Envelope::from_bytes(b"{not json").is_err());
        assert!(Envelope::from_bytes(br#"{"type":"teleport"}"#).is_err());
        assert!(Envelope::from_bytes(
            br#"{"type":"file_chunk","chunk_id":0,"data":"***","total_chunks":1}"#
        )
        .is_err());
    }

    #[test]
    fn test_expect_connection_request() {
        let env = connection_request("alice");
        let (username, _) = Envelope::expect_connection_request(&env.to_bytes().unwrap()).unwrap();
        assert_eq!(username, "alice");

        let not_handshake = text("alice", "hi").to_bytes().unwrap();
        assert!(matches!(
            Envelope::expect_connection_request(&not_handshake),
            Err(Error::Protocol(_))
        ));
    }
}
