//! Peer identities and connection tokens.

use std::fmt;

use serde::{Serialize, Deserialize};
use uuid::Uuid;

/// Stable small-integer identity of a remote endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(pub u32);

/// Sentinel for single-peer links where identification is unnecessary.
pub const UNIQUE_PEER: PeerId = PeerId(u32::MAX);

impl PeerId {
    /// Create a peer id.
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Check if this is the [`UNIQUE_PEER`] sentinel.
    pub fn is_unique(&self) -> bool {
        *self == UNIQUE_PEER
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unique() {
            write!(f, "peer#unique")
        } else {
            write!(f, "peer#{}", self.0)
        }
    }
}

/// 128-bit connection token exchanged in the handshake.
///
/// Lets a peer keep its identity when its address changes (e.g. NAT
/// rebinding).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Token(pub [u8; 16]);

impl Token {
    /// Generate a fresh random (v4) token.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().into_bytes())
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// View as a UUID.
    pub fn as_uuid(&self) -> Uuid {
        Uuid::from_bytes(self.0)
    }
}

impl From<Uuid> for Token {
    fn from(uuid: Uuid) -> Self {
        Self(uuid.into_bytes())
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_uuid())
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({})", self.as_uuid())
    }
}
