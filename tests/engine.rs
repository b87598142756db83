//! Lanes, synchronizer and network modules working together.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lane_engine::network::{
    bind_udp, InboundPacket, NetworkConfig, OutboundPacket, PacketOrder, ReadModule,
    TokenIdentificator, Udp, UnreliableHeader, WriteModule,
};
use lane_engine::{
    DestinationFilter, DestinationId, EventId, Handshake, Lane, PeerId, Synchronizer,
    SynchronizerConfig, TickData, PROTOCOL_VERSION,
};
use rand::Rng;
use tokio::sync::watch;

fn fast_config() -> SynchronizerConfig {
    SynchronizerConfig {
        period: Duration::from_millis(5),
        shutdown_timeout: Duration::from_millis(500),
    }
}

fn loopback() -> NetworkConfig {
    NetworkConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tick_barrier_across_lanes() {
    const LANES: usize = 4;
    let log = Arc::new(Mutex::new(Vec::<(usize, u64)>::new()));

    let mut sync = Synchronizer::new(fast_config());
    let mut subs = Vec::new();
    for i in 0..LANES {
        let lane = Lane::new(format!("lane-{}", i));
        let mut sub = lane.create_sub_lane();
        let log = log.clone();
        sub.connect_fn(EventId::TICK, DestinationFilter::Any, move |_, tick: &TickData| {
            // Uneven work per lane
            let jitter = rand::thread_rng().gen_range(0..3);
            std::thread::sleep(Duration::from_millis(jitter));
            log.lock().unwrap().push((i, tick.index));
        });
        subs.push(sub);
        sync.add_lane(lane).unwrap();
    }

    sync.start().unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let report = sync.finish().await;
    assert!(report.is_clean());
    assert_eq!(report.joined.len(), LANES);

    let log = log.lock().unwrap();
    assert!(report.ticks >= 3, "only {} ticks", report.ticks);

    // No lane starts tick N+1 before every lane finished tick N
    for pair in log.windows(2) {
        assert!(pair[1].1 >= pair[0].1, "tick {} seen after tick {}", pair[1].1, pair[0].1);
    }
    for tick in 1..=report.ticks {
        let lanes = log.iter().filter(|(_, t)| *t == tick).count();
        assert_eq!(lanes, LANES, "tick {} reached {} lanes", tick, lanes);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cross_lane_messages_during_ticks() {
    const PING: EventId = EventId(EventId::FIRST_USER.0);

    let model = Lane::new("model");
    let view = Lane::new("view");
    let to_view = view.emitter();

    let mut model_sub = model.create_sub_lane();
    model_sub.connect_fn(EventId::TICK, DestinationFilter::Any, move |_, tick: &TickData| {
        to_view.emit_to(PING, tick.index, DestinationId(7));
    });

    let pings = Arc::new(Mutex::new(Vec::new()));
    let mut view_sub = view.create_sub_lane();
    {
        let pings = pings.clone();
        view_sub.connect_fn(PING, DestinationId(7), move |_, index: &u64| pings.lock().unwrap().push(*index));
    }
    let ignored = Arc::new(AtomicU64::new(0));
    let mut other_sub = view.create_sub_lane();
    {
        let ignored = ignored.clone();
        other_sub.connect_fn(PING, DestinationId(8), move |_, _: &u64| {
            ignored.fetch_add(1, Ordering::SeqCst);
        });
    }

    let mut sync = Synchronizer::new(fast_config());
    sync.add_lane(model).unwrap();
    sync.add_lane(view).unwrap();
    sync.start().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    sync.finish().await;

    let pings = pings.lock().unwrap();
    assert!(!pings.is_empty());
    for pair in pings.windows(2) {
        assert_eq!(pair[1], pair[0] + 1);
    }
    assert_eq!(ignored.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_udp_pipeline_under_synchronizer() {
    let server_socket = bind_udp(&loopback()).await.unwrap();
    let server_addr: SocketAddr = server_socket.local_addr().unwrap();
    let client_socket = bind_udp(&loopback()).await.unwrap();

    let client_lane = Lane::new("client");
    let server_lane = Lane::new("server");

    let read = ReadModule::<Udp, _>::new(
        "server-read",
        server_socket,
        TokenIdentificator::<SocketAddr>::new(),
        server_lane.emitter(),
    );
    let server = read.handle();
    let write = WriteModule::<Udp>::new("client-write", client_socket);
    let client = write.handle();

    // Client lane sends the tick index every tick
    let mut client_sub = client_lane.create_sub_lane();
    write.attach(&mut client_sub);
    let outbound = client_lane.emitter();
    client_sub.connect_fn(EventId::TICK, DestinationFilter::Any, move |_, tick: &TickData| {
        outbound.emit(
            EventId::PACKET_OUTBOUND,
            OutboundPacket { target: server_addr, payload: tick.index.to_le_bytes().to_vec() },
        );
    });

    let received = Arc::new(Mutex::new(Vec::new()));
    let mut server_sub = server_lane.create_sub_lane();
    {
        let received = received.clone();
        server_sub.connect_fn(
            EventId::PACKET_INBOUND,
            DestinationFilter::Any,
            move |_, packet: &InboundPacket<UnreliableHeader>| {
                received.lock().unwrap().push(packet.clone());
            },
        );
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let read_task = tokio::spawn(read.start_receiving(shutdown_rx.clone()));
    let write_task = tokio::spawn(write.start_sending(shutdown_rx));

    let token = server.issue_token(PeerId(3)).await.unwrap();
    let handshake = Handshake::new(PeerId(3), PROTOCOL_VERSION, token);
    client
        .send(OutboundPacket { target: server_addr, payload: handshake.to_bytes().unwrap() })
        .unwrap();

    let mut sync = Synchronizer::new(fast_config());
    sync.add_lane(client_lane).unwrap();
    sync.add_lane(server_lane).unwrap();
    sync.start().unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    sync.finish().await;

    let _ = shutdown_tx.send(true);
    let write_stats = write_task.await.unwrap();
    let read_stats = read_task.await.unwrap();

    let received = received.lock().unwrap();
    assert!(received.len() >= 2, "only {} packets", received.len());
    assert!(write_stats.sent >= received.len() as u64);
    assert_eq!(read_stats.unidentified, 0);

    // First packet is the handshake with sequence 1
    assert_eq!(received[0].header.sequence, 1);
    assert_eq!(received[0].order, PacketOrder::First);
    assert!(Handshake::decode_verified(&received[0].payload).is_ok());

    for packet in received.iter() {
        assert_eq!(packet.peer, PeerId(3));
    }
    for packet in received.iter().skip(1) {
        let mut index = [0u8; 8];
        index.copy_from_slice(&packet.payload);
        assert!(u64::from_le_bytes(index) >= 1);
    }
}
