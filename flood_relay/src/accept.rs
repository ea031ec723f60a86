// Accept loop for incoming peer links.
//
// The listener is polled in non-blocking mode so the loop can observe
// `keep_running` between attempts. Each accepted link gets a short-lived
// handshake thread: the link must send its handshake within the handshake
// timeout, the announced name becomes the table key, and the link gets its
// own outbound pump. A silent connection therefore only ties up its own
// thread, never the listener. At most `MAX_PENDING_HANDSHAKES` run at once.
//
// Handshake reads are sliced by the poll interval and give up as soon as
// `keep_running` is cleared. The loop joins every handshake thread before it
// returns, so once the accept thread has been joined no link can still be
// on its way into the table.
//
// Nothing a remote peer does can stop this loop: failed handshakes drop the
// one link, accept errors are logged, and resource exhaustion (out of file
// descriptors or buffers) backs off before trying again.

use std::io::{self, Read};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use flood_relay_protocol::PeerId;
use flood_relay_protocol::framing::{HANDSHAKE_LEN, decode_handshake};
use tracing::{error, info, warn};

use crate::error::RelayError;
use crate::pump::{RelayShared, spawn_outbound};
use crate::table::LinkDirection;

/// Sleep between polls of an idle listener.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Sleep after the process runs out of descriptors or buffers.
const RESOURCE_BACKOFF: Duration = Duration::from_millis(250);

/// Handshakes allowed in flight before new links are turned away.
const MAX_PENDING_HANDSHAKES: usize = 32;

/// Accept loop. Runs until `keep_running` is cleared.
pub(crate) fn run_accept_loop(
    shared: Arc<RelayShared>,
    listener: TcpListener,
    handshake_timeout: Duration,
) {
    if let Err(e) = listener.set_nonblocking(true) {
        error!(error = %e, "could not make listener non-blocking; accept loop not running");
        return;
    }
    info!(addr = ?listener.local_addr().ok(), "accept loop started");

    let mut handshakes: Vec<JoinHandle<()>> = Vec::new();
    while shared.running() {
        join_finished(&mut handshakes);
        match listener.accept() {
            Ok((stream, addr)) => {
                if handshakes.len() >= MAX_PENDING_HANDSHAKES {
                    warn!(%addr, pending = handshakes.len(), "too many pending handshakes; dropping link");
                    continue;
                }
                match spawn_handshake(&shared, stream, addr, handshake_timeout) {
                    Ok(handle) => handshakes.push(handle),
                    Err(e) => warn!(%addr, error = %e, "could not start handshake thread"),
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(ref e) if is_resource_exhaustion(e) => {
                warn!(error = %e, "out of resources accepting links; backing off");
                thread::sleep(RESOURCE_BACKOFF);
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                thread::sleep(ACCEPT_POLL);
            }
        }
    }

    for handle in handshakes {
        if handle.join().is_err() {
            warn!("handshake thread panicked");
        }
    }
    info!("accept loop stopped");
}

fn join_finished(handshakes: &mut Vec<JoinHandle<()>>) {
    let (finished, pending): (Vec<_>, Vec<_>) = std::mem::take(handshakes)
        .into_iter()
        .partition(|handle| handle.is_finished());
    for handle in finished {
        if handle.join().is_err() {
            warn!("handshake thread panicked");
        }
    }
    *handshakes = pending;
}

fn spawn_handshake(
    shared: &Arc<RelayShared>,
    stream: TcpStream,
    addr: SocketAddr,
    handshake_timeout: Duration,
) -> io::Result<JoinHandle<()>> {
    let shared = Arc::clone(shared);
    thread::Builder::new()
        .name(format!("relay-handshake-{}", addr.port()))
        .spawn(move || match accept_peer(&shared, stream, handshake_timeout) {
            Ok(peer) => info!(%peer, %addr, "registered incoming link"),
            Err(e) => warn!(%addr, error = %e, "rejected incoming link"),
        })
}

/// Read the handshake from a new link, register it and start its pump.
fn accept_peer(
    shared: &Arc<RelayShared>,
    mut stream: TcpStream,
    handshake_timeout: Duration,
) -> Result<PeerId, RelayError> {
    stream.set_nonblocking(false)?;
    let peer_id = read_handshake_polled(&mut stream, handshake_timeout, shared.poll_interval, || {
        shared.running()
    })?;
    stream.set_read_timeout(None)?;
    stream.set_nodelay(true)?;

    let connection = shared
        .table
        .add_or_replace(peer_id.clone(), stream, LinkDirection::Accepted)?;
    spawn_outbound(shared, &connection)?;
    Ok(peer_id)
}

/// Read a handshake frame in `poll`-sized waits, giving up when `running`
/// turns false or `timeout` passes.
fn read_handshake_polled(
    stream: &mut TcpStream,
    timeout: Duration,
    poll: Duration,
    running: impl Fn() -> bool,
) -> Result<PeerId, RelayError> {
    let deadline = Instant::now() + timeout;
    let mut frame = [0u8; HANDSHAKE_LEN];
    let mut filled = 0;
    stream.set_read_timeout(Some(poll))?;

    while filled < HANDSHAKE_LEN {
        if !running() {
            return Err(io::Error::new(io::ErrorKind::Interrupted, "relay shutting down").into());
        }
        if Instant::now() >= deadline {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("no handshake within {timeout:?}"),
            )
            .into());
        }
        match stream.read(&mut frame[filled..]) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
            Ok(n) => filled += n,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(decode_handshake(&frame)?)
}

#[cfg(unix)]
fn is_resource_exhaustion(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    )
}

#[cfg(not(unix))]
fn is_resource_exhaustion(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::OutOfMemory
}
