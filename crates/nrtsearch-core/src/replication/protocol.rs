//! Replication wire protocol
//!
//! All messages are serialized with bincode and validated with CRC32.
//!
//! Format: [message_type:1][length:4][payload:N][crc32:4]
//!
//! A replica sync is a short request/response exchange on one connection:
//!
//! ```text
//! replica                               primary
//!   Hello ───────────────────────────────►
//!         ◄─────────────────────────────── Welcome
//!   GetLatestPoint ──────────────────────►
//!         ◄─────────────────────────────── LatestPoint
//!   GetSegmentFiles { since } ───────────►
//!         ◄─────────────────────────────── TransferHeader (delta or full copy)
//!   FetchFiles { version, names } ───────►
//!         ◄─────────────────────────────── FileChunk* TransferComplete
//! ```

use crate::nrt::{ManifestDelta, NrtPoint, Version};
use crate::{Error, Result};
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest accepted payload
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Wire error codes
pub mod error_code {
    /// Malformed or unexpected message, version mismatch
    pub const PROTOCOL: u32 = 1;
    /// Write request sent to a replica
    pub const ROLE_MISMATCH: u32 = 2;
    /// Unknown index name
    pub const INDEX_NOT_FOUND: u32 = 3;
    /// Requested version is no longer retained
    pub const VERSION_PRUNED: u32 = 4;
    /// Refresh failed on the primary
    pub const COMMIT: u32 = 5;
    /// Node is shutting down
    pub const SHUTDOWN: u32 = 6;
    /// Anything else
    pub const INTERNAL: u32 = 99;
}

/// Replication message types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationMessageType {
    /// Handshake from replica
    Hello = 0x01,
    /// Handshake response
    Welcome = 0x02,
    /// Heartbeat ping
    Ping = 0x10,
    /// Heartbeat pong
    Pong = 0x11,
    /// Ask for the latest point
    GetLatestPoint = 0x20,
    /// Latest point
    LatestPoint = 0x21,
    /// Ask what changed since a version
    GetSegmentFiles = 0x30,
    /// Target point and delta
    TransferHeader = 0x31,
    /// Ask for file contents
    FetchFiles = 0x32,
    /// File data chunk
    FileChunk = 0x33,
    /// All requested files sent
    TransferComplete = 0x34,
    /// Trigger a refresh on the primary
    WriteNrtPoint = 0x40,
    /// Refresh result
    SearcherVersion = 0x41,
    /// Error message
    Error = 0xFF,
}

impl TryFrom<u8> for ReplicationMessageType {
    type Error = crate::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::Hello),
            0x02 => Ok(Self::Welcome),
            0x10 => Ok(Self::Ping),
            0x11 => Ok(Self::Pong),
            0x20 => Ok(Self::GetLatestPoint),
            0x21 => Ok(Self::LatestPoint),
            0x30 => Ok(Self::GetSegmentFiles),
            0x31 => Ok(Self::TransferHeader),
            0x32 => Ok(Self::FetchFiles),
            0x33 => Ok(Self::FileChunk),
            0x34 => Ok(Self::TransferComplete),
            0x40 => Ok(Self::WriteNrtPoint),
            0x41 => Ok(Self::SearcherVersion),
            0xFF => Ok(Self::Error),
            _ => Err(Error::replication(format!("Unknown message type: {}", value))),
        }
    }
}

/// Replication messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReplicationMessage {
    /// Hello from replica
    Hello {
        node_name: String,
        index_name: String,
        protocol_version: u32,
    },

    /// Welcome from the endpoint (primary or replica)
    Welcome {
        node_name: String,
        is_primary: bool,
        current_version: Version,
    },

    /// Heartbeat ping
    Ping { timestamp: u64 },

    /// Heartbeat pong
    Pong { timestamp: u64 },

    /// Request the latest point
    GetLatestPoint,

    /// Most recently published point
    LatestPoint { point: NrtPoint },

    /// Request the files needed to reach the latest point; `None` asks for a
    /// full copy
    GetSegmentFiles { since_version: Option<Version> },

    /// Target point of a transfer, leased until the transfer completes
    TransferHeader {
        point: NrtPoint,
        full_copy: bool,
        delta: ManifestDelta,
    },

    /// Request file contents from the leased point
    FetchFiles { version: Version, names: Vec<String> },

    /// File data chunk; `last` marks the final chunk of the file
    FileChunk {
        name: String,
        chunk_index: u32,
        last: bool,
        data: Vec<u8>,
        checksum: u32,
    },

    /// All requested files have been sent
    TransferComplete {
        version: Version,
        files: u32,
        bytes: u64,
    },

    /// Trigger a refresh on the primary
    WriteNrtPoint { index_name: String },

    /// Result of a refresh
    SearcherVersion { version: Version, did_refresh: bool },

    /// Error message
    Error { code: u32, message: String },
}

impl ReplicationMessage {
    /// Get message type
    pub fn message_type(&self) -> ReplicationMessageType {
        match self {
            Self::Hello { .. } => ReplicationMessageType::Hello,
            Self::Welcome { .. } => ReplicationMessageType::Welcome,
            Self::Ping { .. } => ReplicationMessageType::Ping,
            Self::Pong { .. } => ReplicationMessageType::Pong,
            Self::GetLatestPoint => ReplicationMessageType::GetLatestPoint,
            Self::LatestPoint { .. } => ReplicationMessageType::LatestPoint,
            Self::GetSegmentFiles { .. } => ReplicationMessageType::GetSegmentFiles,
            Self::TransferHeader { .. } => ReplicationMessageType::TransferHeader,
            Self::FetchFiles { .. } => ReplicationMessageType::FetchFiles,
            Self::FileChunk { .. } => ReplicationMessageType::FileChunk,
            Self::TransferComplete { .. } => ReplicationMessageType::TransferComplete,
            Self::WriteNrtPoint { .. } => ReplicationMessageType::WriteNrtPoint,
            Self::SearcherVersion { .. } => ReplicationMessageType::SearcherVersion,
            Self::Error { .. } => ReplicationMessageType::Error,
        }
    }

    /// Error frame for a local error
    pub fn from_error(err: &Error) -> Self {
        let code = match err {
            Error::RoleMismatch { .. } => error_code::ROLE_MISMATCH,
            Error::IndexNotFound(_) => error_code::INDEX_NOT_FOUND,
            Error::VersionPruned { .. } => error_code::VERSION_PRUNED,
            Error::Commit(_) => error_code::COMMIT,
            Error::Shutdown(_) => error_code::SHUTDOWN,
            Error::Replication(_) | Error::Encoding(_) => error_code::PROTOCOL,
            _ => error_code::INTERNAL,
        };
        Self::Error {
            code,
            message: err.to_string(),
        }
    }

    /// Encode message to bytes
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = bincode::serialize(self)
            .map_err(|e| Error::replication(format!("Serialization failed: {}", e)))?;
        if payload.len() > MAX_FRAME_SIZE {
            return Err(Error::replication(format!(
                "Message too large: {} bytes",
                payload.len()
            )));
        }

        let mut buf = Vec::with_capacity(1 + 4 + payload.len() + 4);
        buf.push(self.message_type() as u8);
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&payload);

        // CRC32 of type + length + payload
        let mut hasher = Hasher::new();
        hasher.update(&buf);
        buf.extend_from_slice(&hasher.finalize().to_le_bytes());

        Ok(buf)
    }

    /// Decode message from bytes
    pub fn decode(buf: &[u8]) -> Result<Self> {
        // min: type(1) + length(4) + crc(4)
        if buf.len() < 9 {
            return Err(Error::replication("Message too short"));
        }

        let crc_offset = buf.len() - 4;
        let stored_crc = le_u32(&buf[crc_offset..]);
        let mut hasher = Hasher::new();
        hasher.update(&buf[..crc_offset]);
        let computed_crc = hasher.finalize();
        if stored_crc != computed_crc {
            return Err(Error::replication(format!(
                "CRC mismatch: expected {:x}, got {:x}",
                stored_crc, computed_crc
            )));
        }

        let message_type = ReplicationMessageType::try_from(buf[0])?;
        let length = le_u32(&buf[1..5]) as usize;
        if buf.len() != 5 + length + 4 {
            return Err(Error::replication("Incomplete message"));
        }

        let message: Self = bincode::deserialize(&buf[5..5 + length])
            .map_err(|e| Error::replication(format!("Deserialization failed: {}", e)))?;
        if message.message_type() != message_type {
            return Err(Error::replication(format!(
                "Frame type {:?} does not match payload {:?}",
                message_type,
                message.message_type()
            )));
        }
        Ok(message)
    }

    /// Write message to async stream
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let buf = self.encode()?;
        writer.write_all(&buf).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read message from async stream
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        // Read header: type(1) + length(4)
        let mut header = [0u8; 5];
        reader.read_exact(&mut header).await?;

        let length = le_u32(&header[1..5]) as usize;
        if length > MAX_FRAME_SIZE {
            return Err(Error::replication(format!(
                "Frame length {} exceeds limit",
                length
            )));
        }

        // Read payload + CRC
        let mut buf = Vec::with_capacity(5 + length + 4);
        buf.extend_from_slice(&header);
        buf.resize(5 + length + 4, 0);
        reader.read_exact(&mut buf[5..]).await?;

        Self::decode(&buf)
    }
}

fn le_u32(bytes: &[u8]) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(word)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nrt::{Manifest, SegmentFile};

    #[test]
    fn test_message_encode_decode() {
        let msg = ReplicationMessage::Ping {
            timestamp: 1234567890,
        };

        let encoded = msg.encode().unwrap();
        let decoded = ReplicationMessage::decode(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_transfer_header_carries_manifest() {
        let file = SegmentFile::from_bytes("seg_0000000001.sgm", b"segment bytes");
        let point = NrtPoint::new(3, Manifest::new(vec![file.clone()]));
        let msg = ReplicationMessage::TransferHeader {
            point: point.clone(),
            full_copy: false,
            delta: ManifestDelta {
                added: vec![file],
                removed: Vec::new(),
            },
        };

        match ReplicationMessage::decode(&msg.encode().unwrap()).unwrap() {
            ReplicationMessage::TransferHeader {
                point: decoded,
                full_copy,
                delta,
            } => {
                assert_eq!(decoded, point);
                assert!(!full_copy);
                assert_eq!(delta.added.len(), 1);
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_crc_validation() {
        let msg = ReplicationMessage::Ping { timestamp: 123 };
        let mut encoded = msg.encode().unwrap();

        // Corrupt the payload
        encoded[5] ^= 0xFF;

        let result = ReplicationMessage::decode(&encoded);
        assert!(result.unwrap_err().to_string().contains("CRC"));
    }

    #[test]
    fn test_message_types() {
        assert_eq!(
            ReplicationMessage::GetLatestPoint.message_type(),
            ReplicationMessageType::GetLatestPoint
        );
        assert_eq!(
            ReplicationMessage::WriteNrtPoint {
                index_name: "idx".into()
            }
            .message_type(),
            ReplicationMessageType::WriteNrtPoint
        );
        assert!(ReplicationMessageType::try_from(0x7E).is_err());
    }

    #[test]
    fn test_error_frame_codes() {
        let frame = ReplicationMessage::from_error(&Error::role_mismatch("writeNRTPoint", "replica"));
        match frame {
            ReplicationMessage::Error { code, message } => {
                assert_eq!(code, error_code::ROLE_MISMATCH);
                assert!(message.contains("writeNRTPoint"));
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stream_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        let chunk = ReplicationMessage::FileChunk {
            name: "seg_0000000002.sgm".into(),
            chunk_index: 0,
            last: true,
            data: vec![7; 4096],
            checksum: crc32fast::hash(&[7; 4096]),
        };

        chunk.write_to(&mut client).await.unwrap();
        ReplicationMessage::GetLatestPoint
            .write_to(&mut client)
            .await
            .unwrap();

        assert_eq!(ReplicationMessage::read_from(&mut server).await.unwrap(), chunk);
        assert_eq!(
            ReplicationMessage::read_from(&mut server).await.unwrap(),
            ReplicationMessage::GetLatestPoint
        );
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let mut header = vec![ReplicationMessageType::FileChunk as u8];
        header.extend_from_slice(&(u32::MAX).to_le_bytes());
        client.write_all(&header).await.unwrap();

        assert!(ReplicationMessage::read_from(&mut server).await.is_err());
    }
}
