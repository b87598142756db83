//! Connection Handshake
//!
//! Fixed 26-byte record a client sends to prove its identity:
//!
//! ```text
//! ┌──────────┬──────────┬────────────┬───────────┐
//! │ peer_id  │ version  │ token      │ checksum  │
//! │ u32 LE   │ u16 LE   │ [u8; 16]   │ u32 LE    │
//! └──────────┴──────────┴────────────┴───────────┘
//! ```
//!
//! The checksum is the first four bytes (little-endian) of
//! `SHA-256(domain || peer_id || version || token)`. It detects corruption
//! and casual forgery; it is not a MAC.

use serde::{Serialize, Deserialize};
use sha2::{Digest, Sha256};

use super::peer::{PeerId, Token};

/// Domain separator mixed into every checksum.
const CHECKSUM_DOMAIN: &[u8] = b"LANE_ENGINE_HANDSHAKE_V1";

/// Handshake errors.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    /// Fewer bytes than a handshake.
    #[error("Truncated handshake: {len} bytes (need {need})")]
    Truncated {
        /// Bytes received.
        len: usize,
        /// Bytes required.
        need: usize,
    },

    /// More bytes than a handshake.
    #[error("Trailing bytes after handshake: {len} bytes (expected {expected})")]
    TrailingBytes {
        /// Bytes received.
        len: usize,
        /// Bytes expected.
        expected: usize,
    },

    /// Encoding failed.
    #[error("Handshake codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// Stored checksum does not match the fields.
    #[error("Checksum mismatch: expected {expected:#010x}, got {received:#010x}")]
    ChecksumMismatch {
        /// Checksum recomputed over the fields.
        expected: u32,
        /// Checksum carried by the record.
        received: u32,
    },

    /// Peer speaks another protocol version.
    #[error("Protocol version mismatch: expected {expected}, got {received}")]
    VersionMismatch {
        /// Local version.
        expected: u16,
        /// Version in the record.
        received: u16,
    },
}

/// Compute the handshake checksum over its fields.
pub fn compute_checksum(peer_id: PeerId, protocol_version: u16, token: &Token) -> u32 {
    let mut hasher = Sha256::new();
    hasher.update(CHECKSUM_DOMAIN);
    hasher.update(peer_id.0.to_le_bytes());
    hasher.update(protocol_version.to_le_bytes());
    hasher.update(token.as_bytes());
    let digest = hasher.finalize();
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Handshake record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    /// Claimed peer id.
    pub peer_id: PeerId,
    /// Sender's protocol version.
    pub protocol_version: u16,
    /// Connection token issued by the server.
    pub token: Token,
    /// Integrity checksum over the other fields.
    pub checksum: u32,
}

impl Handshake {
    /// Encoded size in bytes.
    pub const SERIALIZED_SIZE: usize = 4 + 2 + 16 + 4;

    /// Create a handshake with a valid checksum.
    pub fn new(peer_id: PeerId, protocol_version: u16, token: Token) -> Self {
        Self {
            peer_id,
            protocol_version,
            token,
            checksum: compute_checksum(peer_id, protocol_version, &token),
        }
    }

    /// Checksum the fields should carry.
    pub fn compute_checksum(&self) -> u32 {
        compute_checksum(self.peer_id, self.protocol_version, &self.token)
    }

    /// Check the stored checksum against the fields.
    pub fn is_valid(&self) -> bool {
        self.checksum == self.compute_checksum()
    }

    /// Check the protocol version.
    pub fn check_version(&self, expected: u16) -> Result<(), HandshakeError> {
        if self.protocol_version != expected {
            return Err(HandshakeError::VersionMismatch {
                expected,
                received: self.protocol_version,
            });
        }
        Ok(())
    }

    /// Serialize to the 26-byte wire form.
    pub fn to_bytes(&self) -> Result<Vec<u8>, HandshakeError> {
        Ok(bincode::serialize(self)?)
    }

    /// Parse the wire form without verifying the checksum.
    pub fn from_bytes(data: &[u8]) -> Result<Self, HandshakeError> {
        if data.len() < Self::SERIALIZED_SIZE {
            return Err(HandshakeError::Truncated {
                len: data.len(),
                need: Self::SERIALIZED_SIZE,
            });
        }
        if data.len() > Self::SERIALIZED_SIZE {
            return Err(HandshakeError::TrailingBytes {
                len: data.len(),
                expected: Self::SERIALIZED_SIZE,
            });
        }
        Ok(bincode::deserialize(data)?)
    }

    /// Parse the wire form and reject a bad checksum.
    pub fn decode_verified(data: &[u8]) -> Result<Self, HandshakeError> {
        let handshake = Self::from_bytes(data)?;
        let expected = handshake.compute_checksum();
        if handshake.checksum != expected {
            return Err(HandshakeError::ChecksumMismatch {
                expected,
                received: handshake.checksum,
            });
        }
        Ok(handshake)
    }
}
