//! Peer Identification
//!
//! Maps the source endpoint of each received datagram to a [`PeerId`].
//!
//! Two strategies:
//! - [`OneToOneIdentificator`]: single remote peer, always [`UNIQUE_PEER`]
//! - [`TokenIdentificator`]: server-issued tokens, presented in a
//!   [`Handshake`], bind endpoints to peers
//!
//! Identificators are owned by the read loop and are single-writer; other
//! tasks reach them through the read module's handle.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use tracing::{debug, info};

use super::handshake::Handshake;
use super::peer::{PeerId, Token, UNIQUE_PEER};

/// Why a datagram could not be attributed to a peer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentificationError {
    /// No tokens or endpoints belong to this peer.
    #[error("Unknown peer: {0}")]
    UnknownPeer(PeerId),

    /// Endpoint not in the cache.
    #[error("Unknown endpoint: {0}")]
    UnknownEndpoint(String),

    /// Packet does not carry a valid handshake.
    #[error("No token found in packet: {0}")]
    NoTokenFound(String),

    /// Handshake carries a token this server never issued.
    #[error("Unknown token: {0}")]
    UnknownToken(Token),
}

/// Strategy mapping endpoints to peers.
pub trait PeerIdentificator<E>: Send {
    /// Identify the sender of `packet` (the payload after the header).
    fn identify(&mut self, endpoint: &E, packet: &[u8]) -> Result<PeerId, IdentificationError>;

    /// Issue a token for `peer`, if this strategy uses tokens.
    fn issue_token(&mut self, _peer: PeerId) -> Option<Token> {
        None
    }

    /// Forget everything known about `peer`.
    fn remove_peer(&mut self, peer: PeerId) -> Result<(), IdentificationError> {
        Err(IdentificationError::UnknownPeer(peer))
    }
}

// =============================================================================
// One-to-one
// =============================================================================

/// Identifies every datagram as [`UNIQUE_PEER`].
#[derive(Debug, Clone, Copy, Default)]
pub struct OneToOneIdentificator;

impl OneToOneIdentificator {
    /// Create the identificator.
    pub fn new() -> Self {
        Self
    }
}

impl<E> PeerIdentificator<E> for OneToOneIdentificator {
    fn identify(&mut self, _endpoint: &E, _packet: &[u8]) -> Result<PeerId, IdentificationError> {
        Ok(UNIQUE_PEER)
    }
}

// =============================================================================
// Token
// =============================================================================

/// Token-based identification.
///
/// Holds the tokens generated by [`generate_token`](Self::generate_token)
/// and a cache of endpoints already bound to a peer. A new endpoint is
/// identified by the token in its handshake; several endpoints may map to
/// one peer.
///
/// Entries are kept until [`remove_peer`](Self::remove_peer).
#[derive(Debug)]
pub struct TokenIdentificator<E> {
    generated_tokens: BTreeMap<Token, PeerId>,
    endpoint_cache: BTreeMap<E, PeerId>,
}

impl<E> Default for TokenIdentificator<E> {
    fn default() -> Self {
        Self {
            generated_tokens: BTreeMap::new(),
            endpoint_cache: BTreeMap::new(),
        }
    }
}

impl<E: Ord + Copy + fmt::Display> TokenIdentificator<E> {
    /// Create an empty identificator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate and remember a fresh token for `peer`.
    pub fn generate_token(&mut self, peer: PeerId) -> Token {
        let token = Token::generate();
        self.generated_tokens.insert(token, peer);
        info!("Issued token {} for {}", token, peer);
        token
    }

    /// Look up an endpoint in the cache.
    pub fn identify_by_endpoint(&self, endpoint: &E) -> Result<PeerId, IdentificationError> {
        self.endpoint_cache
            .get(endpoint)
            .copied()
            .ok_or_else(|| IdentificationError::UnknownEndpoint(endpoint.to_string()))
    }

    /// Identify by the handshake in `packet`, caching the endpoint on success.
    pub fn identify_by_token(&mut self, endpoint: &E, packet: &[u8]) -> Result<PeerId, IdentificationError> {
        let handshake = Handshake::decode_verified(packet)
            .map_err(|e| IdentificationError::NoTokenFound(e.to_string()))?;

        let peer = self
            .generated_tokens
            .get(&handshake.token)
            .copied()
            .ok_or(IdentificationError::UnknownToken(handshake.token))?;

        if handshake.peer_id != peer {
            debug!("Handshake claims {} but token belongs to {}", handshake.peer_id, peer);
        }

        self.cache_endpoint(*endpoint, peer);
        Ok(peer)
    }

    /// Bind `endpoint` to `peer`.
    pub fn cache_endpoint(&mut self, endpoint: E, peer: PeerId) {
        if self.endpoint_cache.insert(endpoint, peer).is_none() {
            info!("Endpoint {} bound to {}", endpoint, peer);
        }
    }

    /// Forget every token and endpoint of `peer`.
    pub fn remove_peer(&mut self, peer: PeerId) -> Result<(), IdentificationError> {
        let tokens_before = self.generated_tokens.len();
        let endpoints_before = self.endpoint_cache.len();

        self.generated_tokens.retain(|_, p| *p != peer);
        self.endpoint_cache.retain(|_, p| *p != peer);

        let removed = (tokens_before - self.generated_tokens.len())
            + (endpoints_before - self.endpoint_cache.len());
        if removed == 0 {
            return Err(IdentificationError::UnknownPeer(peer));
        }

        info!("Removed {} ({} entries)", peer, removed);
        Ok(())
    }

    /// Number of distinct peers with a token or a cached endpoint.
    pub fn peer_count(&self) -> usize {
        let peers: BTreeSet<PeerId> = self
            .generated_tokens
            .values()
            .chain(self.endpoint_cache.values())
            .copied()
            .collect();
        peers.len()
    }

    /// Number of tokens issued and not removed.
    pub fn token_count(&self) -> usize {
        self.generated_tokens.len()
    }

    /// Number of cached endpoints.
    pub fn endpoint_count(&self) -> usize {
        self.endpoint_cache.len()
    }
}

impl<E: Ord + Copy + fmt::Display + Send> PeerIdentificator<E> for TokenIdentificator<E> {
    fn identify(&mut self, endpoint: &E, packet: &[u8]) -> Result<PeerId, IdentificationError> {
        match self.identify_by_endpoint(endpoint) {
            Ok(peer) => Ok(peer),
            Err(_) => self.identify_by_token(endpoint, packet),
        }
    }

    fn issue_token(&mut self, peer: PeerId) -> Option<Token> {
        Some(self.generate_token(peer))
    }

    fn remove_peer(&mut self, peer: PeerId) -> Result<(), IdentificationError> {
        TokenIdentificator::remove_peer(self, peer)
    }
}
