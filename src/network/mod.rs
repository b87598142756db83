//! Network Layer
//!
//! Datagram transport for the engine: protocol framing, connection
//! handshake, peer identification and the read/write modules that move
//! packets between a socket and the event lanes.
//! This layer is **non-deterministic**; simulation state lives in lanes.

pub mod handshake;
pub mod identification;
pub mod module;
pub mod peer;
pub mod protocol;
pub mod sequence;

pub use handshake::{Handshake, HandshakeError};
pub use identification::{
    IdentificationError, OneToOneIdentificator, PeerIdentificator, TokenIdentificator,
};
pub use module::{
    bind_udp, udp_modules, Datagram, InboundPacket, NetworkConfig, NetworkError, NetworkModule,
    OutboundPacket, ReadHandle, ReadModule, ReadStats, UnidentifiedPacket, WriteHandle,
    WriteModule, WriteStats,
};
pub use peer::{PeerId, Token, UNIQUE_PEER};
pub use protocol::{
    HeaderFactory, PacketError, Protocol, Transport, Udp, UdpHeaderFactory, UnreliableHeader,
    WireHeader,
};
pub use sequence::{PacketOrder, SequenceTracker};
