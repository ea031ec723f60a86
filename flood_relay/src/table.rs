// Connection table: the registry of live peer links.
//
// `ConnectionTable` maps each `PeerId` to at most one active
// `PeerConnection`. It is the only shared mutable state besides the reaper's
// queue and is touched by every thread in the relay: the inbound pump reads
// snapshots for fan-out, outbound pumps remove themselves when their link
// dies, the accept loop and the console add and remove entries.
//
// All access goes through one mutex, held only for map operations. Socket
// shutdowns, writes and thread joins happen after the guard is dropped.
//
// Link lifecycle: `Connecting` (constructed, not yet registered) → `Active`
// (in the table) → `Closing` (retired: socket shut down, worker handle handed
// to the reaper) → `Reaped` (worker joined). Retiring is idempotent, so the
// several paths that can end a link (replacement, removal, send failure,
// remote close, shutdown) never race into a double close or double join.

use std::collections::BTreeMap;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use flood_relay_protocol::{Packet, PeerId, ProtocolError, write_packet};
use tracing::{debug, info};

use crate::reaper::ThreadReaper;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Active,
    Closing,
    Reaped,
}

/// Which side opened the link.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkDirection {
    Dialed,
    Accepted,
}

/// Where a link's worker thread handle currently lives.
pub(crate) enum WorkerSlot {
    /// The pump has been spawned (or is about to be) but its handle has not
    /// been attached yet.
    Pending,
    Running(JoinHandle<()>),
    /// The handle has moved to the reaper, or will as soon as it is attached.
    Expired,
}

struct Lifecycle {
    state: LinkState,
    worker: WorkerSlot,
}

/// One stream link to a remote relay.
pub struct PeerConnection {
    peer_id: PeerId,
    link_id: u64,
    direction: LinkDirection,
    remote_addr: Option<SocketAddr>,
    writer: Mutex<TcpStream>,
    // Separate handle so a close never waits behind a blocked write.
    control: TcpStream,
    lifecycle: Mutex<Lifecycle>,
}

impl PeerConnection {
    fn new(
        peer_id: PeerId,
        link_id: u64,
        link: TcpStream,
        direction: LinkDirection,
    ) -> io::Result<Self> {
        let control = link.try_clone()?;
        Ok(Self {
            peer_id,
            link_id,
            direction,
            remote_addr: link.peer_addr().ok(),
            writer: Mutex::new(link),
            control,
            lifecycle: Mutex::new(Lifecycle {
                state: LinkState::Connecting,
                worker: WorkerSlot::Pending,
            }),
        })
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Unique per table; distinguishes a link from its replacement.
    pub fn link_id(&self) -> u64 {
        self.link_id
    }

    pub fn direction(&self) -> LinkDirection {
        self.direction
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn state(&self) -> LinkState {
        self.lifecycle().state
    }

    /// Write one packet to the link.
    pub fn send(&self, packet: &Packet) -> Result<(), ProtocolError> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        write_packet(&mut *writer, packet)
    }

    /// A second handle on the link for the outbound pump to read from.
    pub fn reader(&self) -> io::Result<TcpStream> {
        self.control.try_clone()
    }

    /// Shut the socket down, unblocking any pending read or write, and mark
    /// the link `Closing`. Safe to call more than once.
    pub fn close(&self) {
        {
            let mut lifecycle = self.lifecycle();
            if matches!(lifecycle.state, LinkState::Connecting | LinkState::Active) {
                lifecycle.state = LinkState::Closing;
            }
        }
        // NotConnected just means the remote got there first.
        let _ = self.control.shutdown(Shutdown::Both);
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            peer_id: self.peer_id.clone(),
            direction: self.direction,
            remote_addr: self.remote_addr,
            state: self.state(),
        }
    }

    fn activate(&self) {
        let mut lifecycle = self.lifecycle();
        if lifecycle.state == LinkState::Connecting {
            lifecycle.state = LinkState::Active;
        }
    }

    pub(crate) fn mark_reaped(&self) {
        self.lifecycle().state = LinkState::Reaped;
    }

    pub(crate) fn worker_slot(&self) -> WorkerSlotGuard<'_> {
        WorkerSlotGuard(self.lifecycle())
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Locked access to a connection's worker slot.
pub(crate) struct WorkerSlotGuard<'a>(MutexGuard<'a, Lifecycle>);

impl std::ops::Deref for WorkerSlotGuard<'_> {
    type Target = WorkerSlot;

    fn deref(&self) -> &WorkerSlot {
        &self.0.worker
    }
}

impl std::ops::DerefMut for WorkerSlotGuard<'_> {
    fn deref_mut(&mut self) -> &mut WorkerSlot {
        &mut self.0.worker
    }
}

/// Read-only view of a link for display.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub peer_id: PeerId,
    pub direction: LinkDirection,
    pub remote_addr: Option<SocketAddr>,
    pub state: LinkState,
}

/// Registry of active peer links, keyed by peer id.
pub struct ConnectionTable {
    links: Mutex<BTreeMap<PeerId, Arc<PeerConnection>>>,
    next_link_id: AtomicU64,
    reaper: Arc<ThreadReaper>,
}

impl ConnectionTable {
    pub fn new(reaper: Arc<ThreadReaper>) -> Self {
        Self {
            links: Mutex::new(BTreeMap::new()),
            next_link_id: AtomicU64::new(1),
            reaper,
        }
    }

    pub fn reaper(&self) -> &Arc<ThreadReaper> {
        &self.reaper
    }

    /// Register `link` under `peer_id`. A link already registered under the
    /// same id is retired (last writer wins). If the expired queue is at its
    /// threshold, the queue is joined before returning.
    pub fn add_or_replace(
        &self,
        peer_id: PeerId,
        link: TcpStream,
        direction: LinkDirection,
    ) -> io::Result<Arc<PeerConnection>> {
        let link_id = self.next_link_id.fetch_add(1, Ordering::Relaxed);
        let connection = Arc::new(PeerConnection::new(
            peer_id.clone(),
            link_id,
            link,
            direction,
        )?);

        let previous = {
            let mut links = self.lock();
            connection.activate();
            links.insert(peer_id, Arc::clone(&connection))
        };

        match previous {
            Some(old) => {
                info!(
                    peer = %connection.peer_id(),
                    old_link = old.link_id(),
                    new_link = link_id,
                    "replacing existing link"
                );
                self.retire(&old);
            }
            None => info!(peer = %connection.peer_id(), link = link_id, ?direction, "registered link"),
        }
        // Links that ended on the remote side queue their workers too, so the
        // threshold is checked on every add, not only on replacement.
        self.reaper.reap_if_full();
        Ok(connection)
    }

    /// Retire the link registered under `peer_id`. Returns false if there is
    /// none.
    pub fn remove(&self, peer_id: &PeerId) -> bool {
        let removed = self.lock().remove(peer_id);
        match removed {
            Some(connection) => {
                info!(peer = %peer_id, link = connection.link_id(), "removed link");
                self.retire(&connection);
                self.reaper.reap_if_full();
                true
            }
            None => false,
        }
    }

    /// Drop a link that failed. The table entry is removed only if it still
    /// refers to this exact link; a newer replacement under the same id is
    /// left alone. The failed link is retired either way.
    pub fn remove_failed(&self, connection: &Arc<PeerConnection>) -> bool {
        let removed = {
            let mut links = self.lock();
            let same_link = links
                .get(connection.peer_id())
                .is_some_and(|current| current.link_id() == connection.link_id());
            if same_link {
                links.remove(connection.peer_id());
            }
            same_link
        };
        if removed {
            debug!(peer = %connection.peer_id(), link = connection.link_id(), "dropped failed link");
        }
        self.retire(connection);
        removed
    }

    /// Point-in-time copy of the active links, for fan-out and display.
    pub fn snapshot(&self) -> Vec<Arc<PeerConnection>> {
        self.lock()
            .values()
            .filter(|c| c.state() == LinkState::Active)
            .cloned()
            .collect()
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<Arc<PeerConnection>> {
        self.lock().get(peer_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Retire every link. Returns how many there were.
    pub fn close_all(&self) -> usize {
        let links = std::mem::take(&mut *self.lock());
        for connection in links.values() {
            self.retire(connection);
        }
        links.len()
    }

    fn retire(&self, connection: &Arc<PeerConnection>) {
        connection.close();
        self.reaper.collect(connection);
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<PeerId, Arc<PeerConnection>>> {
        self.links.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::net::TcpListener;
    use std::thread;

    use flood_relay_protocol::read_packet;

    use super::*;

    fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    fn new_table(threshold: usize) -> (Arc<ThreadReaper>, ConnectionTable) {
        let reaper = Arc::new(ThreadReaper::new(threshold));
        let table = ConnectionTable::new(Arc::clone(&reaper));
        (reaper, table)
    }

    /// Attach a stand-in pump that reads until the link is shut down.
    fn attach_reader(reaper: &ThreadReaper, connection: &Arc<PeerConnection>) {
        let mut reader = connection.reader().unwrap();
        let handle = thread::spawn(move || {
            let mut buf = [0u8; 64];
            while matches!(reader.read(&mut buf), Ok(n) if n > 0) {}
        });
        reaper.attach(connection, handle);
    }

    fn assert_closed(mut client: TcpStream) {
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).unwrap(), 0, "link should be closed");
    }

    #[test]
    fn add_registers_active_link() {
        let (_reaper, table) = new_table(5);
        let (_client, server) = tcp_pair();
        let conn = table
            .add_or_replace(PeerId::from("west"), server, LinkDirection::Dialed)
            .unwrap();

        assert_eq!(conn.state(), LinkState::Active);
        assert_eq!(table.len(), 1);
        let info = conn.info();
        assert_eq!(info.peer_id, PeerId::from("west"));
        assert_eq!(info.direction, LinkDirection::Dialed);
        assert!(info.remote_addr.is_some());
    }

    #[test]
    fn replacing_closes_first_link() {
        let (reaper, table) = new_table(5);
        let (client1, server1) = tcp_pair();
        let (_client2, server2) = tcp_pair();

        let first = table
            .add_or_replace(PeerId::from("west"), server1, LinkDirection::Accepted)
            .unwrap();
        attach_reader(&reaper, &first);
        let second = table
            .add_or_replace(PeerId::from("west"), server2, LinkDirection::Accepted)
            .unwrap();

        assert_eq!(table.len(), 1);
        assert_eq!(first.state(), LinkState::Closing);
        assert_eq!(second.state(), LinkState::Active);
        assert_eq!(
            table.get(&PeerId::from("west")).unwrap().link_id(),
            second.link_id()
        );
        assert_closed(client1);
        assert_eq!(reaper.len(), 1, "old worker queued for joining");
        reaper.drain();
        assert_eq!(first.state(), LinkState::Reaped);
    }

    #[test]
    fn sixth_replacement_drains_expired_queue() {
        let (reaper, table) = new_table(5);
        let mut clients = Vec::new();
        let mut queued = Vec::new();

        for _ in 0..6 {
            let (client, server) = tcp_pair();
            clients.push(client);
            let conn = table
                .add_or_replace(PeerId::from("west"), server, LinkDirection::Accepted)
                .unwrap();
            attach_reader(&reaper, &conn);
            queued.push(reaper.len());
        }

        assert_eq!(queued, vec![0, 1, 2, 3, 4, 0]);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn fresh_add_drains_queue_left_by_remote_closes() {
        let (reaper, table) = new_table(5);
        for round in 0..12 {
            let (client, server) = tcp_pair();
            let conn = table
                .add_or_replace(PeerId::from("west"), server, LinkDirection::Accepted)
                .unwrap();
            attach_reader(&reaper, &conn);

            // What an outbound pump does when its remote hangs up.
            drop(client);
            reaper.collect(&conn);
            table.remove_failed(&conn);
            assert!(table.is_empty());
            assert!(
                reaper.len() <= reaper.threshold(),
                "queue grew to {} after round {round}",
                reaper.len()
            );
        }
    }

    #[test]
    fn remove_unknown_peer_leaves_table_alone() {
        let (_reaper, table) = new_table(5);
        let (_client, server) = tcp_pair();
        table
            .add_or_replace(PeerId::from("west"), server, LinkDirection::Dialed)
            .unwrap();

        assert!(!table.remove(&PeerId::from("east")));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn remove_closes_link() {
        let (reaper, table) = new_table(5);
        let (client, server) = tcp_pair();
        let conn = table
            .add_or_replace(PeerId::from("west"), server, LinkDirection::Dialed)
            .unwrap();
        attach_reader(&reaper, &conn);

        assert!(table.remove(&PeerId::from("west")));
        assert!(table.is_empty());
        assert_eq!(conn.state(), LinkState::Closing);
        assert_closed(client);
        assert_eq!(reaper.drain(), 1);
    }

    #[test]
    fn remove_failed_ignores_newer_replacement() {
        let (_reaper, table) = new_table(5);
        let (_client1, server1) = tcp_pair();
        let (_client2, server2) = tcp_pair();

        let stale = table
            .add_or_replace(PeerId::from("west"), server1, LinkDirection::Accepted)
            .unwrap();
        let fresh = table
            .add_or_replace(PeerId::from("west"), server2, LinkDirection::Accepted)
            .unwrap();

        assert!(!table.remove_failed(&stale));
        assert_eq!(table.len(), 1);
        assert_eq!(fresh.state(), LinkState::Active);

        assert!(table.remove_failed(&fresh));
        assert!(table.is_empty());
    }

    #[test]
    fn snapshot_is_independent_of_later_changes() {
        let (_reaper, table) = new_table(5);
        let (_c1, s1) = tcp_pair();
        let (_c2, s2) = tcp_pair();
        table
            .add_or_replace(PeerId::from("a"), s1, LinkDirection::Dialed)
            .unwrap();
        table
            .add_or_replace(PeerId::from("b"), s2, LinkDirection::Dialed)
            .unwrap();

        let snapshot = table.snapshot();
        assert!(table.remove(&PeerId::from("a")));
        assert_eq!(snapshot.len(), 2);
        assert_eq!(table.snapshot().len(), 1);
    }

    #[test]
    fn send_writes_whole_packet() {
        let (_reaper, table) = new_table(5);
        let (mut client, server) = tcp_pair();
        let conn = table
            .add_or_replace(PeerId::from("west"), server, LinkDirection::Accepted)
            .unwrap();

        let packet = Packet::with_payload(32, b"fan-out").unwrap();
        conn.send(&packet).unwrap();
        assert_eq!(read_packet(&mut client, 32).unwrap(), packet);
    }

    #[test]
    fn send_after_close_fails() {
        let (_reaper, table) = new_table(5);
        let (_client, server) = tcp_pair();
        let conn = table
            .add_or_replace(PeerId::from("west"), server, LinkDirection::Accepted)
            .unwrap();
        conn.close();
        let packet = Packet::with_payload(32, b"late").unwrap();
        assert!(conn.send(&packet).is_err());
    }

    #[test]
    fn close_all_retires_everything() {
        let (reaper, table) = new_table(5);
        let mut clients = Vec::new();
        for name in ["a", "b", "c"] {
            let (client, server) = tcp_pair();
            clients.push(client);
            let conn = table
                .add_or_replace(PeerId::from(name), server, LinkDirection::Dialed)
                .unwrap();
            attach_reader(&reaper, &conn);
        }

        assert_eq!(table.close_all(), 3);
        assert!(table.is_empty());
        assert_eq!(reaper.drain(), 3);
        for client in clients {
            assert_closed(client);
        }
    }
}
