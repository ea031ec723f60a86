// Deferred joining of finished per-peer workers.
//
// Every link has one outbound pump thread. When a link ends (remote closed,
// replaced, removed, or shut down) its thread handle moves from the
// `PeerConnection` into the expired-worker queue here. The queue is joined
// in bulk: either when an add/accept finds it at the threshold, or in full at
// shutdown. This keeps the number of unjoined threads bounded without giving
// every link its own joiner.
//
// Handle ownership is moved under the queue lock, so at any instant a
// worker's handle is either in its connection's slot or in this queue, never
// in flight between them. Shutdown relies on that: once every connection has
// been collected, draining the queue joins every worker that was spawned.
//
// Joins happen with no lock held. A worker that is exiting may still need the
// queue lock (to collect itself) and the connection table lock (to remove
// itself), so the drainer must hold neither.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use tracing::{debug, warn};

use crate::table::{PeerConnection, WorkerSlot};

struct ExpiredWorker {
    connection: Arc<PeerConnection>,
    handle: JoinHandle<()>,
}

/// Expired-worker queue with a bulk-join threshold.
pub struct ThreadReaper {
    queue: Mutex<VecDeque<ExpiredWorker>>,
    threshold: usize,
}

impl ThreadReaper {
    pub fn new(threshold: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            threshold,
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Number of workers waiting to be joined.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Record the worker handle for a freshly spawned pump. If the link was
    /// already collected (the worker finished, or the link was retired
    /// before the handle arrived), the handle goes straight to the queue.
    pub fn attach(&self, connection: &Arc<PeerConnection>, handle: JoinHandle<()>) {
        let mut queue = self.lock();
        let mut slot = connection.worker_slot();
        match std::mem::replace(&mut *slot, WorkerSlot::Expired) {
            WorkerSlot::Pending => *slot = WorkerSlot::Running(handle),
            WorkerSlot::Running(previous) => {
                warn!(peer = %connection.peer_id(), "worker attached twice");
                queue.push_back(ExpiredWorker {
                    connection: Arc::clone(connection),
                    handle: previous,
                });
                *slot = WorkerSlot::Running(handle);
            }
            WorkerSlot::Expired => queue.push_back(ExpiredWorker {
                connection: Arc::clone(connection),
                handle,
            }),
        }
    }

    /// Move a link's worker handle into the queue. Idempotent: the first
    /// caller (the exiting worker itself, or whoever retired the link) takes
    /// the handle; later calls do nothing. Returns whether a handle moved.
    pub fn collect(&self, connection: &Arc<PeerConnection>) -> bool {
        let mut queue = self.lock();
        let mut slot = connection.worker_slot();
        match std::mem::replace(&mut *slot, WorkerSlot::Expired) {
            WorkerSlot::Running(handle) => {
                queue.push_back(ExpiredWorker {
                    connection: Arc::clone(connection),
                    handle,
                });
                true
            }
            WorkerSlot::Pending | WorkerSlot::Expired => false,
        }
    }

    /// Join the whole queue if it has reached the threshold. Returns the
    /// number of workers joined.
    pub fn reap_if_full(&self) -> usize {
        let queued = self.len();
        if queued < self.threshold() {
            return 0;
        }
        debug!(queued, threshold = self.threshold(), "expired worker queue full");
        self.drain()
    }

    /// Join every queued worker, including any that are queued while the
    /// drain is running. Returns the number joined.
    pub fn drain(&self) -> usize {
        let mut joined = 0;
        loop {
            let batch: Vec<ExpiredWorker> = self.lock().drain(..).collect();
            if batch.is_empty() {
                break;
            }
            for worker in batch {
                let peer = worker.connection.peer_id().clone();
                if worker.handle.join().is_err() {
                    warn!(%peer, "peer worker panicked");
                }
                worker.connection.mark_reaped();
                joined += 1;
            }
        }
        if joined > 0 {
            debug!(joined, "reaped expired peer workers");
        }
        joined
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<ExpiredWorker>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    use flood_relay_protocol::PeerId;

    use super::*;
    use crate::table::{ConnectionTable, LinkDirection, LinkState};

    fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    /// A stand-in pump: blocks reading the link until it is shut down.
    fn spawn_blocking_reader(connection: &Arc<PeerConnection>) -> JoinHandle<()> {
        let mut reader = connection.reader().unwrap();
        thread::spawn(move || {
            let mut buf = [0u8; 64];
            while matches!(reader.read(&mut buf), Ok(n) if n > 0) {}
        })
    }

    #[test]
    fn collect_moves_handle_once() {
        let reaper = Arc::new(ThreadReaper::new(5));
        let table = ConnectionTable::new(Arc::clone(&reaper));
        let (_client, server) = tcp_pair();
        let conn = table
            .add_or_replace(PeerId::from("west"), server, LinkDirection::Accepted)
            .unwrap();
        reaper.attach(&conn, spawn_blocking_reader(&conn));

        conn.close();
        assert!(reaper.collect(&conn));
        assert!(!reaper.collect(&conn));
        assert_eq!(reaper.len(), 1);

        assert_eq!(reaper.drain(), 1);
        assert!(reaper.is_empty());
        assert_eq!(conn.state(), LinkState::Reaped);
    }

    #[test]
    fn attach_after_collect_queues_directly() {
        let reaper = Arc::new(ThreadReaper::new(5));
        let table = ConnectionTable::new(Arc::clone(&reaper));
        let (_client, server) = tcp_pair();
        let conn = table
            .add_or_replace(PeerId::from("west"), server, LinkDirection::Accepted)
            .unwrap();

        // Retired before the spawner got the handle back.
        conn.close();
        assert!(!reaper.collect(&conn));
        reaper.attach(&conn, spawn_blocking_reader(&conn));
        assert_eq!(reaper.len(), 1);
        assert_eq!(reaper.drain(), 1);
    }

    #[test]
    fn reap_if_full_waits_for_threshold() {
        let reaper = Arc::new(ThreadReaper::new(2));
        let table = ConnectionTable::new(Arc::clone(&reaper));
        let mut clients = Vec::new();
        let mut conns = Vec::new();
        for name in ["a", "b"] {
            let (client, server) = tcp_pair();
            clients.push(client);
            let conn = table
                .add_or_replace(PeerId::from(name), server, LinkDirection::Accepted)
                .unwrap();
            reaper.attach(&conn, spawn_blocking_reader(&conn));
            conns.push(conn);
        }

        conns[0].close();
        reaper.collect(&conns[0]);
        assert_eq!(reaper.reap_if_full(), 0);
        assert_eq!(reaper.len(), 1);

        conns[1].close();
        reaper.collect(&conns[1]);
        assert_eq!(reaper.reap_if_full(), 2);
        assert!(reaper.is_empty());
    }

    #[test]
    fn drain_on_empty_queue_is_noop() {
        let reaper = ThreadReaper::new(5);
        assert_eq!(reaper.drain(), 0);
        assert_eq!(reaper.threshold(), 5);
    }
}
