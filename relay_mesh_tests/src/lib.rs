// Test harness for multi-relay meshes.
//
// Each `TestNode` is a real `RelayCore` bridging its own in-memory segment
// (so each node is a separate broadcast domain with a distinct group address
// and therefore a distinct stamp), plus an observer endpoint on that segment
// standing in for the hosts of the domain. Nodes link to each other over
// loopback TCP through the same `add_remote` path the console uses.
//
// The only test-specific code here is the synchronous waiting and collecting
// wrappers. All relaying goes through the real pumps, table and reaper.
//
// See also: `tests/mesh_topology.rs` for the scenarios.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use flood_relay::{LocalDomain, MemoryDomain, MemorySegment, RelayConfig, RelayCore};
use flood_relay_protocol::{Packet, PeerId, RelayIdentity};

/// Packet length used by every test node.
pub const PACKET_LEN: usize = 128;

/// Default timeout for blocking waits.
const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Receive poll for relays and observers.
const POLL: Duration = Duration::from_millis(10);

/// A relay plus an observer on its local segment.
pub struct TestNode {
    name: String,
    group: Ipv4Addr,
    relay: Option<RelayCore>,
    observer: MemoryDomain,
}

impl TestNode {
    /// Start a node named `name` on group `239.99.0.<octet>`.
    pub fn start(name: &str, octet: u8) -> Self {
        let group = Ipv4Addr::new(239, 99, 0, octet);
        let segment = MemorySegment::new();
        let config = RelayConfig {
            group,
            bind_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            listen_port: 0,
            packet_len: PACKET_LEN,
            node_name: Some(name.into()),
            dial_attempts: 1,
            poll_interval_ms: POLL.as_millis() as u64,
            ..RelayConfig::default()
        };
        let relay = RelayCore::start(config, Arc::new(segment.attach(POLL)))
            .unwrap_or_else(|e| panic!("starting {name}: {e}"));
        Self {
            name: name.into(),
            group,
            relay: Some(relay),
            observer: segment.attach(POLL),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The stamp this node's relay writes.
    pub fn identity(&self) -> RelayIdentity {
        RelayIdentity::from_group(self.group)
    }

    pub fn relay(&self) -> &RelayCore {
        self.relay.as_ref().unwrap_or_else(|| panic!("{} already shut down", self.name))
    }

    /// Dial `other` from this node, keyed by its name.
    pub fn link(&self, other: &TestNode) {
        let address = format!("{}@127.0.0.1:{}", other.name, other.relay().local_addr().port());
        self.relay()
            .add_remote(&address)
            .unwrap_or_else(|e| panic!("{} → {}: {e}", self.name, other.name));
    }

    /// Peer ids this node currently has links to, sorted.
    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .relay()
            .list_connections()
            .into_iter()
            .map(|info| info.peer_id)
            .collect();
        peers.sort();
        peers
    }

    /// Broadcast a fresh message on this node's segment, as a local host
    /// would.
    pub fn inject(&self, message: &[u8]) {
        let packet = Packet::with_payload(PACKET_LEN, message).expect("message fits");
        self.observer
            .broadcast(packet.as_bytes())
            .expect("segment broadcast");
    }

    /// Everything the relay rebroadcast on this segment during `window`.
    /// The observer's own unstamped injections are skipped.
    pub fn collect(&self, window: Duration) -> Vec<Packet> {
        let deadline = Instant::now() + window;
        let mut buf = [0u8; PACKET_LEN];
        let mut packets = Vec::new();
        while Instant::now() < deadline {
            if let Some(n) = self.observer.receive(&mut buf).expect("segment receive") {
                let packet = Packet::from_datagram(PACKET_LEN, &buf[..n]).expect("valid datagram");
                if packet.hop_count() > 0 {
                    packets.push(packet);
                }
            }
        }
        packets
    }

    /// Shut the relay down. Returns the number of link workers joined.
    pub fn shutdown(&mut self) -> usize {
        self.relay.take().map_or(0, RelayCore::shutdown)
    }
}

/// Block until `condition` holds, failing the test after a timeout.
pub fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let start = Instant::now();
    while !condition() {
        assert!(start.elapsed() < WAIT_TIMEOUT, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}
