// Integration smoke test for the relay.
//
// Starts a relay on localhost bridging an in-memory segment, connects plain
// TCP sockets as remote peers, and checks packets crossing in both
// directions: local datagrams fan out stamped to peer links, packets from a
// peer are stamped and rebroadcast locally, and packets already carrying
// this relay's stamp go no further.
//
// Each remote peer is a raw socket using the protocol crate's framing, with
// no relay behind it.

use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use flood_relay::config::DEFAULT_REAP_THRESHOLD;
use flood_relay::{LocalDomain, MemoryDomain, MemorySegment, RelayConfig, RelayCore};
use flood_relay_protocol::packet::MAX_PACKET_LEN;
use flood_relay_protocol::{
    HANDSHAKE_LEN, Packet, PacketCodec, RelayIdentity, Stamped, read_packet, write_handshake,
    write_packet,
};

const LEN: usize = 128;
const POLL: Duration = Duration::from_millis(20);
const GROUP: Ipv4Addr = Ipv4Addr::new(239, 77, 0, 1);

fn start_relay() -> (RelayCore, MemoryDomain) {
    start_relay_with_len(LEN)
}

fn start_relay_with_len(packet_len: usize) -> (RelayCore, MemoryDomain) {
    let segment = MemorySegment::new();
    let config = RelayConfig {
        group: GROUP,
        bind_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
        listen_port: 0,
        packet_len,
        node_name: Some("hub".into()),
        poll_interval_ms: 20,
        ..RelayConfig::default()
    };
    let core = RelayCore::start(config, Arc::new(segment.attach(POLL))).unwrap();
    (core, segment.attach(POLL))
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let start = Instant::now();
    while !condition() {
        assert!(start.elapsed() < Duration::from_secs(5), "timed out");
        thread::sleep(Duration::from_millis(5));
    }
}

/// Connect a raw peer, handshake, and wait for the relay to register it.
fn connect_peer(core: &RelayCore, addr: SocketAddr, name: &str) -> TcpStream {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    write_handshake(&mut stream, name).unwrap();
    wait_until(|| {
        core.list_connections()
            .iter()
            .any(|info| info.peer_id.as_str() == name)
    });
    stream
}

/// Next local datagram, if one arrives within half a second.
fn receive_local(observer: &MemoryDomain) -> Option<Packet> {
    let start = Instant::now();
    let mut buf = [0u8; LEN];
    while start.elapsed() < Duration::from_millis(500) {
        if let Some(n) = observer.receive(&mut buf).unwrap() {
            return Some(Packet::from_datagram(LEN, &buf[..n]).unwrap());
        }
    }
    None
}

fn stamped_by(octet: u8, message: &[u8]) -> Packet {
    let codec = PacketCodec::new(RelayIdentity::from_group(Ipv4Addr::new(239, 77, 0, octet)));
    match codec.stamp(&Packet::with_payload(LEN, message).unwrap()) {
        Stamped::Forward(packet) => packet,
        Stamped::HopLimit(_) => panic!("fresh packet should be stampable"),
    }
}

#[test]
fn local_datagram_reaches_every_peer() {
    let (core, observer) = start_relay();
    let addr = core.local_addr();
    let mut west = connect_peer(&core, addr, "west");
    let mut east = connect_peer(&core, addr, "east");

    let fresh = Packet::with_payload(LEN, b"hello mesh").unwrap();
    observer.broadcast(fresh.as_bytes()).unwrap();

    for peer in [&mut west, &mut east] {
        let got = read_packet(peer, LEN).unwrap();
        assert_eq!(got.hop_count(), 1);
        assert_eq!(
            got.stamps().collect::<Vec<_>>(),
            vec![RelayIdentity::from_group(GROUP)]
        );
        assert_eq!(got.message(), b"hello mesh");
    }

    assert_eq!(core.shutdown(), 2);
}

#[test]
fn peer_packet_is_rebroadcast_locally() {
    let (core, observer) = start_relay();
    let mut west = connect_peer(&core, core.local_addr(), "west");

    write_packet(&mut west, &stamped_by(9, b"from afar")).unwrap();

    let got = receive_local(&observer).unwrap();
    assert_eq!(got.hop_count(), 2);
    assert_eq!(
        got.stamps().collect::<Vec<_>>(),
        vec![
            RelayIdentity::from_group(Ipv4Addr::new(239, 77, 0, 9)),
            RelayIdentity::from_group(GROUP),
        ]
    );
    assert_eq!(got.message(), b"from afar");
}

#[test]
fn packet_with_own_stamp_is_not_rebroadcast() {
    let (core, observer) = start_relay();
    let mut west = connect_peer(&core, core.local_addr(), "west");

    // Already relayed by this hub once.
    write_packet(&mut west, &stamped_by(1, b"looped")).unwrap();
    assert!(receive_local(&observer).is_none());
}

#[test]
fn bad_handshake_is_dropped_and_relay_keeps_accepting() {
    let (core, _observer) = start_relay();
    let addr = core.local_addr();

    let mut bad = TcpStream::connect(addr).unwrap();
    bad.write_all(&[0u8; HANDSHAKE_LEN]).unwrap();

    let _good = connect_peer(&core, addr, "west");
    assert_eq!(core.list_connections().len(), 1);
}

#[test]
fn peer_disconnect_removes_link() {
    let (core, _observer) = start_relay();
    let west = connect_peer(&core, core.local_addr(), "west");
    drop(west);

    wait_until(|| core.list_connections().is_empty());
    assert_eq!(core.expired_workers(), 1);
    assert_eq!(core.shutdown(), 1);
}

#[test]
fn reconnecting_peer_keeps_expired_queue_bounded() {
    let (core, _observer) = start_relay();
    let addr = core.local_addr();

    for round in 0..12 {
        let west = connect_peer(&core, addr, "west");
        drop(west);
        wait_until(|| core.list_connections().is_empty());
        assert!(
            core.expired_workers() <= DEFAULT_REAP_THRESHOLD,
            "queue grew to {} after round {round}",
            core.expired_workers()
        );
    }
}

/// Run `shutdown` on another thread and wait at most `limit` for it.
fn shutdown_within(core: RelayCore, limit: Duration) -> usize {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(core.shutdown());
    });
    rx.recv_timeout(limit)
        .unwrap_or_else(|_| panic!("shutdown did not return within {limit:?}"))
}

#[test]
fn shutdown_completes_while_peer_stops_reading() {
    let (core, observer) = start_relay_with_len(MAX_PACKET_LEN);
    // Handshakes, then never reads, so the relay's writes back up.
    let _stalled = connect_peer(&core, core.local_addr(), "stall");

    let fresh = Packet::with_payload(MAX_PACKET_LEN, b"bulk").unwrap();
    for _ in 0..200 {
        observer.broadcast(fresh.as_bytes()).unwrap();
    }
    thread::sleep(Duration::from_millis(300));

    assert_eq!(shutdown_within(core, Duration::from_secs(10)), 1);
}

#[test]
fn silent_connection_does_not_hold_up_other_peers() {
    let (core, _observer) = start_relay();
    let addr = core.local_addr();

    // Connects and never sends a handshake.
    let _silent = TcpStream::connect(addr).unwrap();

    let start = Instant::now();
    let _west = connect_peer(&core, addr, "west");
    assert!(
        start.elapsed() < Duration::from_secs(2),
        "registration took {:?}",
        start.elapsed()
    );

    let start = Instant::now();
    assert_eq!(shutdown_within(core, Duration::from_secs(10)), 1);
    assert!(start.elapsed() < Duration::from_secs(2));
}
