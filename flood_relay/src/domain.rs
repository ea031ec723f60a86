// The local broadcast domain.
//
// `LocalDomain` is the seam between the relay and whatever carries datagrams
// to the hosts that do not need relaying. The relay only needs two
// operations: broadcast one datagram, and wait a bounded time for the next
// one. The bounded wait is what lets the inbound pump notice shutdown.
//
// Two implementations:
// - `MulticastDomain`: an IPv4 UDP multicast group (the production domain).
//   Multicast loopback is left on, so a relay hears its own broadcasts and
//   discards them by stamp.
// - `MemorySegment` / `MemoryDomain`: an in-process segment where every
//   attached endpoint receives every broadcast, including its own. Lets
//   several relays share one process without touching the network.

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::debug;

/// A local broadcast domain the relay bridges.
pub trait LocalDomain: Send + Sync {
    /// Send one datagram to every member of the domain.
    fn broadcast(&self, datagram: &[u8]) -> io::Result<()>;

    /// Wait up to one poll interval for a datagram. Returns the number of
    /// bytes written into `buf`, or `None` if nothing arrived in time.
    fn receive(&self, buf: &mut [u8]) -> io::Result<Option<usize>>;

    /// Short description for log lines.
    fn describe(&self) -> String;
}

/// IPv4 UDP multicast group.
pub struct MulticastDomain {
    socket: UdpSocket,
    target: SocketAddrV4,
}

impl MulticastDomain {
    /// Bind `port`, join `group` on `interface`, and bound receives by `poll`.
    pub fn join(
        group: Ipv4Addr,
        port: u16,
        interface: Ipv4Addr,
        poll: Duration,
    ) -> io::Result<Self> {
        if !group.is_multicast() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{group} is not a multicast address"),
            ));
        }

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
        socket.set_reuse_port(true)?;
        socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;
        socket.join_multicast_v4(&group, &interface)?;
        if !interface.is_unspecified() {
            socket.set_multicast_if_v4(&interface)?;
        }
        socket.set_multicast_loop_v4(true)?;
        socket.set_multicast_ttl_v4(1)?;
        socket.set_read_timeout(Some(poll))?;

        debug!(%group, port, %interface, "joined multicast group");
        Ok(Self {
            socket: socket.into(),
            target: SocketAddrV4::new(group, port),
        })
    }
}

impl LocalDomain for MulticastDomain {
    fn broadcast(&self, datagram: &[u8]) -> io::Result<()> {
        self.socket.send_to(datagram, self.target)?;
        Ok(())
    }

    fn receive(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        match self.socket.recv_from(buf) {
            Ok((n, _from)) => Ok(Some(n)),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn describe(&self) -> String {
        self.target.to_string()
    }
}

/// In-process broadcast segment. Cloning shares the segment.
#[derive(Clone, Default)]
pub struct MemorySegment {
    members: Arc<Mutex<Vec<Sender<Vec<u8>>>>>,
}

impl MemorySegment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new endpoint. It receives every datagram broadcast on the
    /// segment from now on.
    pub fn attach(&self, poll: Duration) -> MemoryDomain {
        let (tx, rx) = mpsc::channel();
        self.members
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        MemoryDomain {
            segment: self.clone(),
            inbox: Mutex::new(rx),
            poll,
        }
    }
}

/// One endpoint on a `MemorySegment`.
pub struct MemoryDomain {
    segment: MemorySegment,
    inbox: Mutex<Receiver<Vec<u8>>>,
    poll: Duration,
}

impl LocalDomain for MemoryDomain {
    fn broadcast(&self, datagram: &[u8]) -> io::Result<()> {
        let mut members = self
            .segment
            .members
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        members.retain(|tx| tx.send(datagram.to_vec()).is_ok());
        Ok(())
    }

    fn receive(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        let inbox = self.inbox.lock().unwrap_or_else(PoisonError::into_inner);
        match inbox.recv_timeout(self.poll) {
            Ok(datagram) => {
                let n = datagram.len().min(buf.len());
                buf[..n].copy_from_slice(&datagram[..n]);
                Ok(Some(n))
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "memory segment closed",
            )),
        }
    }

    fn describe(&self) -> String {
        "memory segment".into()
    }
}
