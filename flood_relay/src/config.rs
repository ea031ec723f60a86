// Relay configuration.
//
// `RelayConfig` carries everything a relay needs at startup. Defaults suit a
// single relay per host on a private multicast group; a JSON file (any subset
// of the fields) can override them, and the binary applies command-line flags
// on top of that.
//
// Every relay in a mesh must agree on `packet_len`, since links carry fixed
// `packet_len`-byte frames. `group` doubles as the relay's stamp identity, so
// each bridged domain must use a distinct group address.

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use flood_relay_protocol::RelayIdentity;
use flood_relay_protocol::framing::{HANDSHAKE_LEN, encode_handshake};
use flood_relay_protocol::packet::{MAX_PACKET_LEN, MIN_PACKET_LEN};

use crate::error::RelayError;

/// Default datagram size shared by the local domain and peer links.
pub const DEFAULT_PACKET_LEN: usize = 1024;

/// Default port for both the multicast group and the peer listener.
pub const DEFAULT_PORT: u16 = 47474;

/// Expired workers tolerated before an add/accept joins them all.
pub const DEFAULT_REAP_THRESHOLD: usize = 5;

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelayConfig {
    /// Multicast group of the local broadcast domain.
    pub group: Ipv4Addr,
    pub group_port: u16,
    /// Interface used to join the group (`0.0.0.0` lets the OS choose).
    pub interface: Ipv4Addr,
    /// Address the peer listener binds to.
    pub bind_host: IpAddr,
    /// Peer listener port. 0 picks a free port.
    pub listen_port: u16,
    /// Fixed packet length `L`.
    pub packet_len: usize,
    /// Name sent in the handshake. Defaults to the host name.
    pub node_name: Option<String>,
    /// Peers dialed at startup, in `[name@]host:port` form.
    pub peers: Vec<String>,
    pub reap_threshold: usize,
    pub dial_timeout_ms: u64,
    pub dial_attempts: u32,
    pub handshake_timeout_ms: u64,
    /// How often blocking receives and accepts check for shutdown.
    pub poll_interval_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            group: Ipv4Addr::new(239, 255, 10, 1),
            group_port: DEFAULT_PORT,
            interface: Ipv4Addr::UNSPECIFIED,
            bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port: DEFAULT_PORT,
            packet_len: DEFAULT_PACKET_LEN,
            node_name: None,
            peers: Vec::new(),
            reap_threshold: DEFAULT_REAP_THRESHOLD,
            dial_timeout_ms: 3000,
            dial_attempts: 3,
            handshake_timeout_ms: 5000,
            poll_interval_ms: 100,
        }
    }
}

impl RelayConfig {
    /// Load a config from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, RelayError> {
        let text = std::fs::read_to_string(path).map_err(|source| RelayError::ConfigFile {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| RelayError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), RelayError> {
        if !(MIN_PACKET_LEN..=MAX_PACKET_LEN).contains(&self.packet_len) {
            return Err(RelayError::InvalidConfig(format!(
                "packet_len {} is outside {MIN_PACKET_LEN}..={MAX_PACKET_LEN}",
                self.packet_len
            )));
        }
        if self.reap_threshold == 0 {
            return Err(RelayError::InvalidConfig(
                "reap_threshold must be at least 1".into(),
            ));
        }
        if self.dial_attempts == 0 {
            return Err(RelayError::InvalidConfig(
                "dial_attempts must be at least 1".into(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(RelayError::InvalidConfig(
                "poll_interval_ms must be at least 1".into(),
            ));
        }
        if let Some(name) = &self.node_name {
            encode_handshake(name)
                .map_err(|e| RelayError::InvalidConfig(format!("node_name: {e}")))?;
        }
        Ok(())
    }

    /// The stamp this relay writes into forwarded packets.
    pub fn identity(&self) -> RelayIdentity {
        RelayIdentity::from_group(self.group)
    }

    /// Name announced in the handshake: the configured name, else the host
    /// name, else the group address.
    pub fn resolved_node_name(&self) -> String {
        if let Some(name) = &self.node_name {
            return name.clone();
        }
        match host_name() {
            Some(name) => truncate_to_boundary(name, HANDSHAKE_LEN),
            None => self.group.to_string(),
        }
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn truncate_to_boundary(mut name: String, max: usize) -> String {
    if name.len() > max {
        let mut end = max;
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        name.truncate(end);
    }
    name
}

#[cfg(unix)]
fn host_name() -> Option<String> {
    let mut buf = [0u8; 256];
    // SAFETY: `buf` is valid for writes of `buf.len()` bytes.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return None;
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let name = std::str::from_utf8(&buf[..end]).ok()?.trim();
    (!name.is_empty()).then(|| name.to_owned())
}

#[cfg(not(unix))]
fn host_name() -> Option<String> {
    std::env::var("COMPUTERNAME").ok().filter(|n| !n.is_empty())
}
