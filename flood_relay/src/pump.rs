// Packet pumps: the two directions a packet can cross a relay.
//
// - **Inbound pump** (one thread): local domain → every peer link. Receives a
//   datagram, drops it if this relay's stamp is already in it (our own
//   rebroadcast coming back, or a packet that has been here before), stamps
//   it, and writes it to every link in a table snapshot. Links whose write
//   fails are dropped from the table.
// - **Outbound pump** (one thread per link): peer link → local domain. Reads
//   fixed-length packets until the link ends, drops duplicates, stamps the
//   rest and broadcasts them locally. When the link ends the pump hands its
//   own thread handle to the reaper and removes its link from the table.
//
// Neither pump holds the table lock while blocked. The inbound pump's
// receive is bounded by the domain's poll interval so it can observe
// `keep_running`; outbound pumps are woken by the link being shut down.

use std::io;
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use flood_relay_protocol::{Packet, PacketCodec, PeerId, ProtocolError, Stamped, read_packet};
use tracing::{debug, info, warn};

use crate::domain::LocalDomain;
use crate::error::RelayError;
use crate::table::{ConnectionTable, PeerConnection};

/// State shared by every relay thread.
pub(crate) struct RelayShared {
    pub(crate) codec: PacketCodec,
    pub(crate) packet_len: usize,
    pub(crate) poll_interval: Duration,
    pub(crate) domain: Arc<dyn LocalDomain>,
    pub(crate) table: Arc<ConnectionTable>,
    pub(crate) keep_running: Arc<AtomicBool>,
}

impl RelayShared {
    pub(crate) fn running(&self) -> bool {
        self.keep_running.load(Ordering::SeqCst)
    }
}

/// Inbound pump loop. Runs until `keep_running` is cleared.
pub(crate) fn run_inbound(shared: Arc<RelayShared>) {
    info!(domain = %shared.domain.describe(), "inbound pump started");
    let mut buf = vec![0u8; shared.packet_len];

    while shared.running() {
        let received = match shared.domain.receive(&mut buf) {
            Ok(Some(n)) => n,
            Ok(None) => continue,
            Err(e) => {
                warn!(error = %e, "local receive failed");
                thread::sleep(shared.poll_interval);
                continue;
            }
        };
        relay_to_peers(&shared, &buf[..received]);
    }

    info!("inbound pump stopped");
}

/// Process one datagram from the local domain. Returns the number of links
/// it was written to.
pub(crate) fn relay_to_peers(shared: &RelayShared, datagram: &[u8]) -> usize {
    let packet = match Packet::from_datagram(shared.packet_len, datagram) {
        Ok(packet) => packet,
        Err(e) => {
            debug!(error = %e, "dropping malformed local datagram");
            return 0;
        }
    };

    if shared.codec.is_duplicate(&packet) {
        debug!(hops = packet.hop_count(), "already relayed; not forwarding");
        return 0;
    }

    let packet = match shared.codec.stamp(&packet) {
        Stamped::Forward(packet) => packet,
        Stamped::HopLimit(packet) => {
            debug!(hops = packet.hop_count(), "hop limit reached; dropping");
            return 0;
        }
    };

    let mut sent = 0;
    for connection in shared.table.snapshot() {
        match connection.send(&packet) {
            Ok(()) => {
                sent += 1;
                debug!(
                    peer = %connection.peer_id(),
                    message = %String::from_utf8_lossy(packet.message()),
                    "relayed to remote group"
                );
            }
            Err(e) => {
                warn!(peer = %connection.peer_id(), error = %e, "send failed; dropping link");
                shared.table.remove_failed(&connection);
            }
        }
    }
    sent
}

/// Outbound pump loop for one link.
pub(crate) fn run_outbound(
    shared: Arc<RelayShared>,
    connection: Arc<PeerConnection>,
    mut reader: TcpStream,
) {
    let peer = connection.peer_id().clone();
    debug!(%peer, link = connection.link_id(), "outbound pump started");

    loop {
        match read_packet(&mut reader, shared.packet_len) {
            Ok(packet) => {
                broadcast_locally(&shared, &peer, &packet);
            }
            Err(ProtocolError::HopCountOutOfRange { hops, max }) => {
                // The frame was read whole, so the stream is still aligned.
                warn!(%peer, hops, max, "dropping packet with invalid hop count");
            }
            Err(ProtocolError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                info!(%peer, "link closed");
                break;
            }
            Err(e) => {
                info!(%peer, error = %e, "link ended");
                break;
            }
        }
    }

    shared.table.reaper().collect(&connection);
    shared.table.remove_failed(&connection);
    debug!(%peer, link = connection.link_id(), "outbound pump stopped");
}

/// Rebroadcast a packet received from a peer. Returns whether it was sent.
pub(crate) fn broadcast_locally(shared: &RelayShared, peer: &PeerId, packet: &Packet) -> bool {
    debug!(
        %peer,
        bytes = packet.wire_len(),
        hops = packet.hop_count(),
        message = %String::from_utf8_lossy(packet.message()),
        "received from remote group"
    );

    if shared.codec.is_duplicate(packet) {
        debug!(%peer, "already relayed; not rebroadcasting");
        return false;
    }

    let Stamped::Forward(stamped) = shared.codec.stamp(packet) else {
        debug!(%peer, hops = packet.hop_count(), "hop limit reached; dropping");
        return false;
    };

    match shared.domain.broadcast(stamped.as_bytes()) {
        Ok(()) => {
            debug!(%peer, domain = %shared.domain.describe(), "broadcast to local group");
            true
        }
        Err(e) => {
            warn!(%peer, error = %e, "local broadcast failed");
            false
        }
    }
}

/// Spawn the outbound pump for a newly registered link and hand its thread
/// handle to the reaper. On failure the link is dropped from the table.
pub(crate) fn spawn_outbound(
    shared: &Arc<RelayShared>,
    connection: &Arc<PeerConnection>,
) -> Result<(), RelayError> {
    let reader = match connection.reader() {
        Ok(reader) => reader,
        Err(e) => {
            shared.table.remove_failed(connection);
            return Err(RelayError::Io(e));
        }
    };

    let thread_shared = Arc::clone(shared);
    let thread_connection = Arc::clone(connection);
    let spawned = thread::Builder::new()
        .name(format!("relay-out-{}", connection.link_id()))
        .spawn(move || run_outbound(thread_shared, thread_connection, reader));

    match spawned {
        Ok(handle) => {
            shared.table.reaper().attach(connection, handle);
            Ok(())
        }
        Err(e) => {
            shared.table.remove_failed(connection);
            Err(RelayError::Spawn(e))
        }
    }
}
