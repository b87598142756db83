//! Transport Protocols
//!
//! A [`Protocol`] bundles everything the generic network modules need to know
//! about one transport: the per-packet header, the factory stamping it, the
//! endpoint type, the socket, and the size limits.
//!
//! Wire format of every datagram:
//!
//! ```text
//! ┌────────────────────────────┬──────────────────────────┐
//! │ header (HEADER_SIZE_BYTES) │ payload                  │
//! └────────────────────────────┴──────────────────────────┘
//!  ≤ MAX_PACKET_SIZE_BYTES in total
//! ```
//!
//! Headers are encoded with bincode (little-endian, fixed-width integers).

use std::fmt;
use std::hash::Hash;
use std::io;
use std::net::SocketAddr;
use std::time::Instant;

use futures_util::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde::{Serialize, Deserialize};
use tokio::net::UdpSocket;

/// Header prefixed to every packet of a protocol.
pub trait WireHeader: Serialize + DeserializeOwned + Copy + fmt::Debug + Send + Sync + 'static {
    /// Sender-side sequence number.
    fn sequence(&self) -> u32;
}

/// Stamps outgoing packets with headers.
pub trait HeaderFactory {
    /// Header type produced.
    type Header;

    /// Create the header for the next packet. Advances the sequence.
    fn create(&mut self) -> Self::Header;

    /// Sequence number of the last header created (0 if none).
    fn last_sequence(&self) -> u32;
}

/// Asynchronous datagram socket.
///
/// Futures are boxed so the network loops stay `Send` for any transport.
pub trait Transport: Send + Sync + 'static {
    /// Remote address type.
    type Endpoint: Copy + Send + Sync + 'static;

    /// Send one datagram.
    fn send_to<'a>(&'a self, buf: &'a [u8], target: Self::Endpoint) -> BoxFuture<'a, io::Result<usize>>;

    /// Receive one datagram into `buf`.
    fn recv_from<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<(usize, Self::Endpoint)>>;

    /// Local address the socket is bound to.
    fn local_endpoint(&self) -> io::Result<Self::Endpoint>;
}

/// Everything a network module needs to know about one transport.
pub trait Protocol: Send + Sync + 'static {
    /// Per-packet header.
    type Header: WireHeader;
    /// Header factory (owns the sequence counter).
    type HeaderFactory: HeaderFactory<Header = Self::Header> + Default + Send + 'static;
    /// Remote address.
    type Endpoint: Copy + Ord + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static;
    /// Socket.
    type Socket: Transport<Endpoint = Self::Endpoint>;

    /// Protocol name for logs.
    const NAME: &'static str;
    /// Cap on header + payload.
    const MAX_PACKET_SIZE_BYTES: usize;
    /// Encoded header size.
    const HEADER_SIZE_BYTES: usize;

    /// Largest payload that fits in one packet.
    fn max_payload_bytes() -> usize {
        Self::MAX_PACKET_SIZE_BYTES - Self::HEADER_SIZE_BYTES
    }
}

/// Packet framing errors.
#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    /// Header + payload exceeds the protocol limit.
    #[error("Packet too large: {size} bytes (max {max})")]
    TooLarge {
        /// Encoded size.
        size: usize,
        /// Protocol limit.
        max: usize,
    },

    /// Datagram shorter than a header.
    #[error("Runt packet: {len} bytes (header is {header})")]
    Runt {
        /// Datagram length.
        len: usize,
        /// Header size.
        header: usize,
    },

    /// Header encoding failed.
    #[error("Header codec error: {0}")]
    Codec(#[from] bincode::Error),
}

/// Encode header + payload into one datagram.
pub fn encode_packet<P: Protocol>(header: &P::Header, payload: &[u8]) -> Result<Vec<u8>, PacketError> {
    let size = P::HEADER_SIZE_BYTES + payload.len();
    if size > P::MAX_PACKET_SIZE_BYTES {
        return Err(PacketError::TooLarge { size, max: P::MAX_PACKET_SIZE_BYTES });
    }

    let mut packet = Vec::with_capacity(size);
    bincode::serialize_into(&mut packet, header)?;
    debug_assert_eq!(packet.len(), P::HEADER_SIZE_BYTES);
    packet.extend_from_slice(payload);
    Ok(packet)
}

/// Split a datagram into its header and payload.
///
/// Datagrams longer than `MAX_PACKET_SIZE_BYTES` are rejected whole.
pub fn decode_packet<P: Protocol>(datagram: &[u8]) -> Result<(P::Header, &[u8]), PacketError> {
    if datagram.len() > P::MAX_PACKET_SIZE_BYTES {
        return Err(PacketError::TooLarge { size: datagram.len(), max: P::MAX_PACKET_SIZE_BYTES });
    }
    if datagram.len() < P::HEADER_SIZE_BYTES {
        return Err(PacketError::Runt { len: datagram.len(), header: P::HEADER_SIZE_BYTES });
    }

    let (head, payload) = datagram.split_at(P::HEADER_SIZE_BYTES);
    let header = bincode::deserialize(head)?;
    Ok((header, payload))
}

// =============================================================================
// UDP
// =============================================================================

/// Header of every unreliable (UDP) packet.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct UnreliableHeader {
    /// Per-sender sequence number, starting at 1.
    pub sequence: u32,
    /// Seconds since the sending factory was created.
    pub timestamp: f32,
}

impl WireHeader for UnreliableHeader {
    #[inline]
    fn sequence(&self) -> u32 {
        self.sequence
    }
}

/// Produces [`UnreliableHeader`]s with sequence numbers 1, 2, 3, ...
///
/// The counter wraps after `u32::MAX`; receivers compare sequences with
/// wrapping arithmetic.
#[derive(Debug, Clone)]
pub struct UdpHeaderFactory {
    sequence: u32,
    epoch: Instant,
}

impl Default for UdpHeaderFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl UdpHeaderFactory {
    /// Create a factory whose first header has sequence 1.
    pub fn new() -> Self {
        Self {
            sequence: 0,
            epoch: Instant::now(),
        }
    }
}

impl HeaderFactory for UdpHeaderFactory {
    type Header = UnreliableHeader;

    fn create(&mut self) -> UnreliableHeader {
        self.sequence = self.sequence.wrapping_add(1);
        UnreliableHeader {
            sequence: self.sequence,
            timestamp: self.epoch.elapsed().as_secs_f32(),
        }
    }

    fn last_sequence(&self) -> u32 {
        self.sequence
    }
}

/// Unreliable datagram transport over UDP.
#[derive(Debug, Clone, Copy)]
pub struct Udp;

impl Protocol for Udp {
    type Header = UnreliableHeader;
    type HeaderFactory = UdpHeaderFactory;
    type Endpoint = SocketAddr;
    type Socket = UdpSocket;

    const NAME: &'static str = "udp";
    const MAX_PACKET_SIZE_BYTES: usize = 1400;
    // sequence: u32 + timestamp: f32
    const HEADER_SIZE_BYTES: usize = 8;
}

impl Transport for UdpSocket {
    type Endpoint = SocketAddr;

    fn send_to<'a>(&'a self, buf: &'a [u8], target: SocketAddr) -> BoxFuture<'a, io::Result<usize>> {
        UdpSocket::send_to(self, buf, target).boxed()
    }

    fn recv_from<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<(usize, SocketAddr)>> {
        UdpSocket::recv_from(self, buf).boxed()
    }

    fn local_endpoint(&self) -> io::Result<SocketAddr> {
        self.local_addr()
    }
}
