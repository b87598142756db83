//! Network Modules
//!
//! One socket is shared by two specialized modules:
//!
//! ```text
//!        lane ──PACKET_OUTBOUND──▶ WriteModule ──header+payload──▶ socket
//!        lane ◀──PACKET_INBOUND─── ReadModule  ◀──datagram──────── socket
//!             ◀─PACKET_UNIDENTIFIED─┘    │
//!                                   identificator
//! ```
//!
//! The write module stamps each outgoing payload with a protocol header.
//! The read module strips the header, identifies the sender, tracks its
//! sequence numbers and emits the result onto a lane.
//!
//! Both loops run as tokio tasks and stop on a `watch` shutdown signal.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::events::{DestinationFilter, Emitter, EventId, SubLane};

use super::handshake::HandshakeError;
use super::identification::{IdentificationError, PeerIdentificator};
use super::peer::{PeerId, Token};
use super::protocol::{
    decode_packet, encode_packet, HeaderFactory, PacketError, Protocol, Transport, Udp, WireHeader,
};
use super::sequence::{PacketOrder, SequenceTracker};

/// Network errors.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// Socket error.
    #[error("Socket error: {0}")]
    Io(#[from] io::Error),

    /// Framing error.
    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),

    /// Handshake error.
    #[error("Handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    /// Identification error.
    #[error("Identification error: {0}")]
    Identification(#[from] IdentificationError),

    /// The module's loop has exited.
    #[error("Network module stopped")]
    ModuleStopped,

    /// The identificator does not issue tokens.
    #[error("Identificator does not issue tokens")]
    TokensUnsupported,
}

/// Network configuration.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Local address to bind.
    pub bind_addr: SocketAddr,
    /// Protocol version expected in handshakes.
    pub protocol_version: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 7777)),
            protocol_version: crate::PROTOCOL_VERSION,
        }
    }
}

/// Bind a UDP socket for a read/write module pair.
pub async fn bind_udp(config: &NetworkConfig) -> Result<Arc<UdpSocket>, NetworkError> {
    let socket = UdpSocket::bind(config.bind_addr).await?;
    info!("UDP socket bound to {}", socket.local_addr()?);
    Ok(Arc::new(socket))
}

// =============================================================================
// Packets
// =============================================================================

/// Raw datagram handed to [`NetworkModule::on_receive`].
#[derive(Debug, Clone)]
pub struct Datagram<E> {
    /// Sender.
    pub source: E,
    /// Header + payload.
    pub bytes: Vec<u8>,
}

/// Request to send a payload (emitted on [`EventId::PACKET_OUTBOUND`]).
#[derive(Debug, Clone)]
pub struct OutboundPacket<E> {
    /// Destination endpoint.
    pub target: E,
    /// Payload, without header.
    pub payload: Vec<u8>,
}

/// Identified packet (emitted on [`EventId::PACKET_INBOUND`]).
#[derive(Debug, Clone)]
pub struct InboundPacket<H> {
    /// Sender.
    pub peer: PeerId,
    /// Decoded header.
    pub header: H,
    /// Relation to earlier packets from the same peer.
    pub order: PacketOrder,
    /// Payload, without header.
    pub payload: Vec<u8>,
}

/// Packet whose sender could not be identified
/// (emitted on [`EventId::PACKET_UNIDENTIFIED`]).
#[derive(Debug, Clone)]
pub struct UnidentifiedPacket<E> {
    /// Source endpoint.
    pub endpoint: E,
    /// Why identification failed.
    pub reason: IdentificationError,
    /// Payload, without header.
    pub payload: Vec<u8>,
}

/// A module bound to one protocol's socket.
pub trait NetworkModule<P: Protocol> {
    /// Module name for logs.
    fn name(&self) -> &str;

    /// Send `payload` to `target` behind a fresh header.
    ///
    /// Returns the number of bytes written to the socket.
    fn write<'a>(&'a mut self, target: P::Endpoint, payload: &'a [u8]) -> BoxFuture<'a, Result<usize, NetworkError>>;

    /// Handle one received datagram.
    fn on_receive(&mut self, datagram: Datagram<P::Endpoint>);
}

/// Log a socket error at a severity matching its kind.
///
/// Transient conditions are logged as warnings; loops keep running either way.
pub fn print_error_code(module: &str, error: &NetworkError) {
    match error {
        NetworkError::Io(e) => match e.kind() {
            io::ErrorKind::WouldBlock
            | io::ErrorKind::Interrupted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset => {
                warn!("[{}] transient socket error ({:?}): {}", module, e.kind(), e);
            }
            kind => {
                error!("[{}] socket error ({:?}, os code {:?}): {}", module, kind, e.raw_os_error(), e);
            }
        },
        other => error!("[{}] {}", module, other),
    }
}

// =============================================================================
// Write Module
// =============================================================================

/// Counters reported when the write loop exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteStats {
    /// Packets written to the socket.
    pub sent: u64,
    /// Writes that failed.
    pub failed: u64,
}

/// Cloneable handle queueing packets for a [`WriteModule`].
#[derive(Clone)]
pub struct WriteHandle<E> {
    tx: mpsc::UnboundedSender<OutboundPacket<E>>,
}

impl<E> WriteHandle<E> {
    /// Queue a packet. Fails once the write loop has exited.
    pub fn send(&self, packet: OutboundPacket<E>) -> Result<(), NetworkError> {
        self.tx.send(packet).map_err(|_| NetworkError::ModuleStopped)
    }
}

/// Sends packets onto the socket.
pub struct WriteModule<P: Protocol> {
    name: String,
    socket: Arc<P::Socket>,
    headers: P::HeaderFactory,
    queue: mpsc::UnboundedReceiver<OutboundPacket<P::Endpoint>>,
    tx: mpsc::UnboundedSender<OutboundPacket<P::Endpoint>>,
    stats: WriteStats,
}

impl<P: Protocol> WriteModule<P> {
    /// Create a write module on `socket`.
    pub fn new(name: impl Into<String>, socket: Arc<P::Socket>) -> Self {
        let (tx, queue) = mpsc::unbounded_channel();
        Self {
            name: name.into(),
            socket,
            headers: P::HeaderFactory::default(),
            queue,
            tx,
            stats: WriteStats::default(),
        }
    }

    /// Handle for queueing packets from other tasks.
    pub fn handle(&self) -> WriteHandle<P::Endpoint> {
        WriteHandle { tx: self.tx.clone() }
    }

    /// Forward every [`OutboundPacket`] emitted on the sub-lane's lane to
    /// this module.
    pub fn attach(&self, sub_lane: &mut SubLane) {
        let handle = self.handle();
        let name = self.name.clone();
        sub_lane.connect_fn(
            EventId::PACKET_OUTBOUND,
            DestinationFilter::Any,
            move |_, packet: &OutboundPacket<P::Endpoint>| {
                if handle.send(packet.clone()).is_err() {
                    debug!("[{}] write loop stopped, dropping packet to {}", name, packet.target);
                }
            },
        );
    }

    /// Sequence number of the last packet stamped.
    pub fn last_sequence(&self) -> u32 {
        self.headers.last_sequence()
    }

    /// Counters so far.
    pub fn stats(&self) -> WriteStats {
        self.stats
    }

    /// Drain the queue onto the socket until shutdown.
    ///
    /// Failed writes are logged and the loop continues.
    #[instrument(skip_all, fields(module = %self.name, protocol = P::NAME))]
    pub async fn start_sending(mut self, mut shutdown: watch::Receiver<bool>) -> WriteStats {
        info!("Write loop started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let packet = tokio::select! {
                packet = self.queue.recv() => match packet {
                    Some(packet) => packet,
                    None => break,
                },
                _ = shutdown.changed() => {
                    info!("Shutdown signal received");
                    break;
                }
            };

            match self.write(packet.target, &packet.payload).await {
                Ok(_) => self.stats.sent += 1,
                Err(e) => {
                    self.stats.failed += 1;
                    print_error_code(&self.name, &e);
                }
            }
        }

        info!("Write loop stopped: {} sent, {} failed", self.stats.sent, self.stats.failed);
        self.stats
    }
}

impl<P: Protocol> NetworkModule<P> for WriteModule<P> {
    fn name(&self) -> &str {
        &self.name
    }

    fn write<'a>(&'a mut self, target: P::Endpoint, payload: &'a [u8]) -> BoxFuture<'a, Result<usize, NetworkError>> {
        // The sequence advances even if the packet is rejected below.
        let header = self.headers.create();
        let socket = self.socket.clone();

        async move {
            let packet = encode_packet::<P>(&header, payload)?;

            #[cfg(feature = "debug-tracing")]
            trace!(sequence = header.sequence(), bytes = %hex::encode(&packet), "outbound packet");
            #[cfg(not(feature = "debug-tracing"))]
            trace!(sequence = header.sequence(), len = packet.len(), %target, "outbound packet");

            let sent = socket.send_to(&packet, target).await?;
            Ok::<_, NetworkError>(sent)
        }
        .boxed()
    }

    fn on_receive(&mut self, _datagram: Datagram<P::Endpoint>) {
        unreachable!("write module {} does not receive", self.name)
    }
}

impl<P: Protocol> fmt::Debug for WriteModule<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteModule")
            .field("name", &self.name)
            .field("protocol", &P::NAME)
            .field("last_sequence", &self.headers.last_sequence())
            .field("stats", &self.stats)
            .finish()
    }
}

// =============================================================================
// Read Module
// =============================================================================

/// Counters reported when the read loop exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadStats {
    /// Datagrams received.
    pub received: u64,
    /// Datagrams attributed to a peer.
    pub identified: u64,
    /// Datagrams whose sender was not identified.
    pub unidentified: u64,
    /// Datagrams too short or with an undecodable header.
    pub malformed: u64,
    /// Socket errors.
    pub errors: u64,
}

enum ReadCommand {
    IssueToken {
        peer: PeerId,
        reply: oneshot::Sender<Option<Token>>,
    },
    RemovePeer {
        peer: PeerId,
        reply: oneshot::Sender<Result<(), IdentificationError>>,
    },
}

/// Cloneable handle to a running [`ReadModule`].
///
/// The identificator belongs to the read loop; token and peer management
/// requests are forwarded into it.
#[derive(Clone)]
pub struct ReadHandle {
    tx: mpsc::UnboundedSender<ReadCommand>,
}

impl ReadHandle {
    /// Issue a connection token for `peer`.
    pub async fn issue_token(&self, peer: PeerId) -> Result<Token, NetworkError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ReadCommand::IssueToken { peer, reply })
            .map_err(|_| NetworkError::ModuleStopped)?;
        rx.await
            .map_err(|_| NetworkError::ModuleStopped)?
            .ok_or(NetworkError::TokensUnsupported)
    }

    /// Forget every token, endpoint and sequence state of `peer`.
    pub async fn remove_peer(&self, peer: PeerId) -> Result<(), NetworkError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ReadCommand::RemovePeer { peer, reply })
            .map_err(|_| NetworkError::ModuleStopped)?;
        Ok(rx.await.map_err(|_| NetworkError::ModuleStopped)??)
    }
}

/// Receives datagrams from the socket and emits them onto a lane.
pub struct ReadModule<P: Protocol, I> {
    name: String,
    socket: Arc<P::Socket>,
    identificator: I,
    emitter: Emitter,
    trackers: BTreeMap<PeerId, SequenceTracker>,
    commands: mpsc::UnboundedReceiver<ReadCommand>,
    commands_tx: mpsc::UnboundedSender<ReadCommand>,
    stats: ReadStats,
}

impl<P, I> ReadModule<P, I>
where
    P: Protocol,
    I: PeerIdentificator<P::Endpoint>,
{
    /// Create a read module on `socket` emitting through `emitter`.
    pub fn new(name: impl Into<String>, socket: Arc<P::Socket>, identificator: I, emitter: Emitter) -> Self {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        Self {
            name: name.into(),
            socket,
            identificator,
            emitter,
            trackers: BTreeMap::new(),
            commands,
            commands_tx,
            stats: ReadStats::default(),
        }
    }

    /// Handle for token and peer management.
    pub fn handle(&self) -> ReadHandle {
        ReadHandle { tx: self.commands_tx.clone() }
    }

    /// The identificator.
    pub fn identificator(&self) -> &I {
        &self.identificator
    }

    /// Mutable access to the identificator, before the loop starts.
    pub fn identificator_mut(&mut self) -> &mut I {
        &mut self.identificator
    }

    /// Counters so far.
    pub fn stats(&self) -> ReadStats {
        self.stats
    }

    /// Receive until shutdown.
    ///
    /// Socket errors are logged and the loop continues.
    #[instrument(skip_all, fields(module = %self.name, protocol = P::NAME))]
    pub async fn start_receiving(mut self, mut shutdown: watch::Receiver<bool>) -> ReadStats {
        info!("Read loop started");
        // One spare byte so an oversized datagram is seen as such, not truncated
        let mut buf = vec![0u8; P::MAX_PACKET_SIZE_BYTES + 1];

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    info!("Shutdown signal received");
                    break;
                }
                Some(command) = self.commands.recv() => {
                    self.on_command(command);
                }
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, source)) => {
                            self.on_receive(Datagram { source, bytes: buf[..len].to_vec() });
                        }
                        Err(e) => {
                            self.stats.errors += 1;
                            print_error_code(&self.name, &NetworkError::Io(e));
                        }
                    }
                }
            }
        }

        info!(
            "Read loop stopped: {} received, {} identified, {} unidentified",
            self.stats.received, self.stats.identified, self.stats.unidentified
        );
        self.stats
    }

    fn on_command(&mut self, command: ReadCommand) {
        match command {
            ReadCommand::IssueToken { peer, reply } => {
                let _ = reply.send(self.identificator.issue_token(peer));
            }
            ReadCommand::RemovePeer { peer, reply } => {
                self.trackers.remove(&peer);
                let _ = reply.send(self.identificator.remove_peer(peer));
            }
        }
    }
}

impl<P, I> NetworkModule<P> for ReadModule<P, I>
where
    P: Protocol,
    I: PeerIdentificator<P::Endpoint>,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn write<'a>(&'a mut self, _target: P::Endpoint, _payload: &'a [u8]) -> BoxFuture<'a, Result<usize, NetworkError>> {
        unreachable!("read module {} does not write", self.name)
    }

    fn on_receive(&mut self, datagram: Datagram<P::Endpoint>) {
        self.stats.received += 1;

        let (header, payload) = match decode_packet::<P>(&datagram.bytes) {
            Ok(parts) => parts,
            Err(e) => {
                self.stats.malformed += 1;
                debug!("[{}] dropping datagram from {}: {}", self.name, datagram.source, e);
                return;
            }
        };

        #[cfg(feature = "debug-tracing")]
        trace!(sequence = header.sequence(), bytes = %hex::encode(&datagram.bytes), "inbound packet");

        match self.identificator.identify(&datagram.source, payload) {
            Ok(peer) => {
                self.stats.identified += 1;
                let order = self.trackers.entry(peer).or_default().observe(header.sequence());
                match order {
                    PacketOrder::Gap { missing } => {
                        debug!("[{}] {} skipped {} packets before {}", self.name, peer, missing, header.sequence());
                    }
                    PacketOrder::Late => {
                        trace!("[{}] late packet {} from {}", self.name, header.sequence(), peer);
                    }
                    PacketOrder::First | PacketOrder::InOrder => {}
                }

                self.emitter.emit(
                    EventId::PACKET_INBOUND,
                    InboundPacket { peer, header, order, payload: payload.to_vec() },
                );
            }
            Err(reason) => {
                self.stats.unidentified += 1;
                debug!("[{}] unidentified datagram from {}: {}", self.name, datagram.source, reason);
                self.emitter.emit(
                    EventId::PACKET_UNIDENTIFIED,
                    UnidentifiedPacket { endpoint: datagram.source, reason, payload: payload.to_vec() },
                );
            }
        }
    }
}

impl<P: Protocol, I> fmt::Debug for ReadModule<P, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadModule")
            .field("name", &self.name)
            .field("protocol", &P::NAME)
            .field("peers", &self.trackers.len())
            .field("stats", &self.stats)
            .finish()
    }
}

/// Build a read/write pair sharing one UDP socket.
pub fn udp_modules<I>(
    name: &str,
    socket: Arc<UdpSocket>,
    identificator: I,
    emitter: Emitter,
) -> (ReadModule<Udp, I>, WriteModule<Udp>)
where
    I: PeerIdentificator<SocketAddr>,
{
    let read = ReadModule::new(format!("{}-read", name), socket.clone(), identificator, emitter);
    let write = WriteModule::new(format!("{}-write", name), socket);
    (read, write)
}
