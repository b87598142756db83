//! Lane Engine Demo
//!
//! Runs two lanes under the synchronizer and streams a per-tick snapshot
//! from a UDP client to a token-authenticated UDP server on loopback.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Serialize, Deserialize};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use lane_engine::{
    DestinationFilter, EngineConfig, EventId, Handshake, Lane, PeerId, Synchronizer, TickData,
    TICK_RATE, VERSION,
    network::{
        bind_udp, HandshakeError, InboundPacket, NetworkConfig, OutboundPacket, ReadModule, TokenIdentificator,
        Udp, UnidentifiedPacket, UnreliableHeader, WriteModule,
    },
};

/// How long the demo runs.
const DEMO_DURATION: Duration = Duration::from_secs(1);

/// Per-tick state sent from client to server.
#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    tick: u64,
    dt_ms: u64,
}

/// Verify a handshake-shaped payload. `None` when the payload is not a
/// handshake at all.
fn verify_handshake(payload: &[u8], protocol_version: u16) -> Option<Result<Handshake, HandshakeError>> {
    match Handshake::decode_verified(payload) {
        Ok(handshake) => Some(handshake.check_version(protocol_version).map(|()| handshake)),
        Err(e @ HandshakeError::ChecksumMismatch { .. }) => Some(Err(e)),
        Err(_) => None,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = EngineConfig::from_env()?;

    info!("Lane Engine v{}", VERSION);
    info!("Default tick rate: {} Hz, configured period: {:?}", TICK_RATE, config.sync.period);
    info!("Protocol version: {}", config.network.protocol_version);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Server socket; client socket on loopback
    let server_socket = bind_udp(&config.network).await?;
    let server_addr = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), server_socket.local_addr()?.port());
    let client_socket = bind_udp(&NetworkConfig {
        bind_addr: SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0),
        ..config.network.clone()
    })
    .await?;

    let model_lane = Lane::new("model");
    let network_lane = Lane::new("network");

    let server_read = ReadModule::<Udp, _>::new(
        "server-read",
        server_socket,
        TokenIdentificator::<SocketAddr>::new(),
        network_lane.emitter(),
    );
    let server = server_read.handle();
    let client_write = WriteModule::<Udp>::new("client-write", client_socket);
    let client = client_write.handle();

    // Network lane: outbound packets go to the client socket, inbound are counted
    let mut network_sub = network_lane.create_sub_lane();
    client_write.attach(&mut network_sub);

    let snapshots = Arc::new(AtomicU64::new(0));
    let counter = snapshots.clone();
    let protocol_version = config.network.protocol_version;
    network_sub.connect_fn(
        EventId::PACKET_INBOUND,
        DestinationFilter::Any,
        move |_, packet: &InboundPacket<UnreliableHeader>| {
            if let Some(verdict) = verify_handshake(&packet.payload, protocol_version) {
                match verdict {
                    Ok(_) => info!("{} connected (sequence {})", packet.peer, packet.header.sequence),
                    Err(e) => warn!("{} rejected: {}", packet.peer, e),
                }
                return;
            }
            match serde_json::from_slice::<Snapshot>(&packet.payload) {
                Ok(snapshot) => {
                    counter.fetch_add(1, Ordering::Relaxed);
                    if snapshot.tick % u64::from(TICK_RATE) == 0 {
                        info!("{} at tick {} (dt {} ms, {:?})", packet.peer, snapshot.tick, snapshot.dt_ms, packet.order);
                    }
                }
                Err(e) => warn!("{} sent an unreadable snapshot: {}", packet.peer, e),
            }
        },
    );
    network_sub.connect_fn(
        EventId::PACKET_UNIDENTIFIED,
        DestinationFilter::Any,
        |_, packet: &UnidentifiedPacket<SocketAddr>| {
            warn!("Dropped {} bytes from {}: {}", packet.payload.len(), packet.endpoint, packet.reason);
        },
    );

    // Model lane: one snapshot per tick
    let mut model_sub = model_lane.create_sub_lane();
    let outbound = network_lane.emitter();
    model_sub.connect_fn(EventId::TICK, DestinationFilter::Any, move |_, tick: &TickData| {
        let snapshot = Snapshot { tick: tick.index, dt_ms: tick.time_since_last_tick_ms };
        match serde_json::to_vec(&snapshot) {
            Ok(payload) => {
                outbound.emit(EventId::PACKET_OUTBOUND, OutboundPacket { target: server_addr, payload });
            }
            Err(e) => warn!("Failed to encode snapshot: {}", e),
        }
    });

    let read_task = tokio::spawn(server_read.start_receiving(shutdown_rx.clone()));
    let write_task = tokio::spawn(client_write.start_sending(shutdown_rx));

    // Handshake before the first tick
    let peer = PeerId::new(1);
    let token = server.issue_token(peer).await?;
    let handshake = Handshake::new(peer, protocol_version, token);
    client.send(OutboundPacket { target: server_addr, payload: handshake.to_bytes()? })?;

    let mut synchronizer = Synchronizer::new(config.sync.clone());
    synchronizer.add_lane(model_lane)?;
    synchronizer.add_lane(network_lane)?;
    synchronizer.start()?;

    info!("=== Running for {:?} ===", DEMO_DURATION);
    tokio::time::sleep(DEMO_DURATION).await;

    let report = synchronizer.finish().await;
    let _ = shutdown_tx.send(true);
    let read_stats = read_task.await?;
    let write_stats = write_task.await?;

    info!("=== Results ===");
    info!("Ticks: {}", report.ticks);
    info!("Snapshots received: {}", snapshots.load(Ordering::Relaxed));
    info!("Client: {} sent, {} failed", write_stats.sent, write_stats.failed);
    info!(
        "Server: {} received, {} identified, {} unidentified",
        read_stats.received, read_stats.identified, read_stats.unidentified
    );
    if !report.is_clean() {
        warn!("Lanes detached on shutdown: {:?}", report.detached);
    }

    drop(model_sub);
    drop(network_sub);
    Ok(())
}
