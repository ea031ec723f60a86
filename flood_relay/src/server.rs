// Relay core: startup, peer management and shutdown.
//
// Architecture: plain OS threads sharing one `RelayShared`.
//
// - **Inbound pump** (`relay-inbound`): local domain → every peer link. See
//   `pump.rs`.
// - **Accept loop** (`relay-accept`): registers incoming links. See
//   `accept.rs`.
// - **Outbound pumps** (`relay-out-<link>`): one per link, spawned by the
//   accept loop or by `add_remote`.
// - The caller's thread (normally the console) drives `add_remote`,
//   `terminate_remote` and `list_connections`.
//
// Shutdown: `keep_running` is cleared, which the inbound pump and the accept
// loop observe within one poll. Every link is retired before either is
// joined: shutting a socket down wakes its outbound pump and any inbound
// write stuck on a peer that stopped reading. Links registered while the
// accept loop wound down are retired after the join, then the reaper is
// drained until every pump that was ever spawned has been joined. Dropping a
// `RelayCore` without calling `shutdown` does the same.

use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use flood_relay_protocol::{PacketCodec, PeerId, RelayIdentity};
use tracing::{info, warn};

use crate::accept::run_accept_loop;
use crate::config::RelayConfig;
use crate::dialer::{PeerAddress, dial};
use crate::domain::{LocalDomain, MulticastDomain};
use crate::error::RelayError;
use crate::pump::{RelayShared, run_inbound, spawn_outbound};
use crate::reaper::ThreadReaper;
use crate::table::{ConnectionInfo, ConnectionTable, LinkDirection};

/// A running relay. Owns every thread it starts.
pub struct RelayCore {
    shared: Arc<RelayShared>,
    node_name: String,
    local_addr: SocketAddr,
    dial_timeout: Duration,
    dial_attempts: u32,
    inbound: Option<JoinHandle<()>>,
    accept: Option<JoinHandle<()>>,
}

impl RelayCore {
    /// Start a relay bridging `domain`. Binds the peer listener, starts the
    /// inbound pump and accept loop, then dials `config.peers`. A peer that
    /// cannot be reached is logged and skipped.
    pub fn start(config: RelayConfig, domain: Arc<dyn LocalDomain>) -> Result<Self, RelayError> {
        config.validate()?;
        let listener = TcpListener::bind((config.bind_host, config.listen_port))?;
        let local_addr = listener.local_addr()?;

        let reaper = Arc::new(ThreadReaper::new(config.reap_threshold));
        let shared = Arc::new(RelayShared {
            codec: PacketCodec::new(config.identity()),
            packet_len: config.packet_len,
            poll_interval: config.poll_interval(),
            domain,
            table: Arc::new(ConnectionTable::new(reaper)),
            keep_running: Arc::new(AtomicBool::new(true)),
        });

        // From here on, an early return drops `core`, which stops whatever
        // was already started.
        let mut core = Self {
            shared,
            node_name: config.resolved_node_name(),
            local_addr,
            dial_timeout: config.dial_timeout(),
            dial_attempts: config.dial_attempts,
            inbound: None,
            accept: None,
        };

        let inbound_shared = Arc::clone(&core.shared);
        core.inbound = Some(
            thread::Builder::new()
                .name("relay-inbound".into())
                .spawn(move || run_inbound(inbound_shared))
                .map_err(RelayError::Spawn)?,
        );

        let accept_shared = Arc::clone(&core.shared);
        let handshake_timeout = config.handshake_timeout();
        core.accept = Some(
            thread::Builder::new()
                .name("relay-accept".into())
                .spawn(move || run_accept_loop(accept_shared, listener, handshake_timeout))
                .map_err(RelayError::Spawn)?,
        );

        info!(
            node = %core.node_name,
            identity = %core.identity(),
            listen = %local_addr,
            domain = %core.shared.domain.describe(),
            packet_len = config.packet_len,
            "relay started"
        );

        for peer in &config.peers {
            if let Err(e) = core.add_remote(peer) {
                warn!(%peer, error = %e, "could not reach configured peer");
            }
        }
        Ok(core)
    }

    /// Start a relay on the IPv4 multicast group named in `config`.
    pub fn start_multicast(config: RelayConfig) -> Result<Self, RelayError> {
        let domain = MulticastDomain::join(
            config.group,
            config.group_port,
            config.interface,
            config.poll_interval(),
        )?;
        Self::start(config, Arc::new(domain))
    }

    /// Address the peer listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn identity(&self) -> RelayIdentity {
        self.shared.codec.identity()
    }

    /// Name this relay announces when it dials.
    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Dial `address` (`[name@]host:port`) and register the link. Replaces
    /// any existing link to the same peer id.
    pub fn add_remote(&self, address: &str) -> Result<PeerId, RelayError> {
        let target: PeerAddress = address.parse()?;
        let link = dial(&target, &self.node_name, self.dial_timeout, self.dial_attempts)?;
        let connection =
            self.shared
                .table
                .add_or_replace(target.peer_id.clone(), link, LinkDirection::Dialed)?;
        spawn_outbound(&self.shared, &connection)?;
        info!(peer = %target.peer_id, endpoint = %target, "connected to remote group");
        Ok(target.peer_id)
    }

    /// Close the link registered under `peer_id`.
    pub fn terminate_remote(&self, peer_id: &str) -> Result<(), RelayError> {
        let peer_id = PeerId::from(peer_id);
        if self.shared.table.remove(&peer_id) {
            Ok(())
        } else {
            Err(RelayError::NotFound(peer_id))
        }
    }

    pub fn list_connections(&self) -> Vec<ConnectionInfo> {
        self.shared
            .table
            .snapshot()
            .iter()
            .map(|connection| connection.info())
            .collect()
    }

    /// Finished pumps waiting to be joined.
    pub fn expired_workers(&self) -> usize {
        self.shared.table.reaper().len()
    }

    /// Stop every thread and close every link. Returns the number of
    /// outbound pumps joined during shutdown.
    pub fn shutdown(mut self) -> usize {
        self.stop()
    }

    fn stop(&mut self) -> usize {
        if !self.shared.keep_running.swap(false, Ordering::SeqCst)
            && self.inbound.is_none()
            && self.accept.is_none()
        {
            return 0;
        }
        info!("shutting down relay");

        // Shutting the links down first wakes an inbound pump blocked writing
        // to a peer that stopped reading.
        let mut closed = self.shared.table.close_all();

        for (name, handle) in [("accept", self.accept.take()), ("inbound", self.inbound.take())] {
            let panicked = handle.is_some_and(|handle| handle.join().is_err());
            if panicked {
                warn!(thread = name, "relay thread panicked");
            }
        }

        // Handshakes that completed while the accept loop was winding down.
        closed += self.shared.table.close_all();
        let joined = self.shared.table.reaper().drain();
        info!(
            closed,
            joined,
            reap_threshold = self.shared.table.reaper().threshold(),
            "relay stopped"
        );
        joined
    }
}

impl Drop for RelayCore {
    fn drop(&mut self) {
        self.stop();
    }
}
