// Outgoing peer links.
//
// `add <address>` on the console ends up here: the address is parsed into a
// table key and an endpoint, the endpoint is dialed with a bounded number of
// attempts, and this node's name is sent as the handshake before the link is
// handed back for registration.
//
// Address form: `[name@]host:port`. Without a name the host part is the
// table key, which is what the remote relay will be listed under in `show`
// and what `delete` takes. IPv6 hosts are written in brackets.

use std::fmt;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::str::FromStr;
use std::thread;
use std::time::Duration;

use flood_relay_protocol::{PeerId, write_handshake};
use tracing::debug;

use crate::error::RelayError;

/// Pause between dial attempts, multiplied by the attempt number.
const DIAL_BACKOFF: Duration = Duration::from_millis(200);

/// A parsed `[name@]host:port` peer address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerAddress {
    pub peer_id: PeerId,
    pub host: String,
    pub port: u16,
}

impl FromStr for PeerAddress {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| RelayError::InvalidAddress {
            address: s.to_owned(),
            reason: reason.to_owned(),
        };

        let (name, endpoint) = match s.split_once('@') {
            Some((name, endpoint)) => (Some(name), endpoint),
            None => (None, s),
        };
        let (host, port) = endpoint
            .rsplit_once(':')
            .ok_or_else(|| invalid("expected host:port"))?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        if host.contains(':') && !endpoint.starts_with('[') {
            return Err(invalid("IPv6 hosts must be bracketed"));
        }
        let port: u16 = port.parse().map_err(|_| invalid("invalid port"))?;

        let peer_id = match name {
            Some("") => return Err(invalid("empty peer name")),
            Some(name) => PeerId::from(name),
            None => PeerId::from(host),
        };

        Ok(Self {
            peer_id,
            host: host.to_owned(),
            port,
        })
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Connect to `target` and send this node's handshake.
pub fn dial(
    target: &PeerAddress,
    node_name: &str,
    timeout: Duration,
    attempts: u32,
) -> Result<TcpStream, RelayError> {
    let endpoint = target.to_string();
    let dial_error = |source| RelayError::Dial {
        address: endpoint.clone(),
        source,
    };

    let addrs: Vec<SocketAddr> = (target.host.as_str(), target.port)
        .to_socket_addrs()
        .map_err(dial_error)?
        .collect();

    let mut last_error = std::io::Error::new(
        std::io::ErrorKind::NotFound,
        "host resolved to no addresses",
    );
    for attempt in 1..=attempts {
        for addr in &addrs {
            match TcpStream::connect_timeout(addr, timeout) {
                Ok(mut stream) => {
                    stream.set_nodelay(true)?;
                    write_handshake(&mut stream, node_name)?;
                    debug!(peer = %target.peer_id, %addr, attempt, "dialed peer");
                    return Ok(stream);
                }
                Err(e) => {
                    debug!(peer = %target.peer_id, %addr, attempt, error = %e, "dial failed");
                    last_error = e;
                }
            }
        }
        if attempt < attempts {
            thread::sleep(DIAL_BACKOFF * attempt);
        }
    }
    Err(dial_error(last_error))
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use flood_relay_protocol::read_handshake;

    use super::*;

    #[test]
    fn parses_host_and_port() {
        let addr: PeerAddress = "10.0.0.2:47474".parse().unwrap();
        assert_eq!(addr.peer_id, PeerId::from("10.0.0.2"));
        assert_eq!(addr.host, "10.0.0.2");
        assert_eq!(addr.port, 47474);
        assert_eq!(addr.to_string(), "10.0.0.2:47474");
    }

    #[test]
    fn parses_named_peer() {
        let addr: PeerAddress = "east@relay.example:9000".parse().unwrap();
        assert_eq!(addr.peer_id, PeerId::from("east"));
        assert_eq!(addr.host, "relay.example");
        assert_eq!(addr.port, 9000);
    }

    #[test]
    fn parses_bracketed_ipv6() {
        let addr: PeerAddress = "[::1]:9000".parse().unwrap();
        assert_eq!(addr.host, "::1");
        assert_eq!(addr.peer_id, PeerId::from("::1"));
        assert_eq!(addr.to_string(), "[::1]:9000");
    }

    #[test]
    fn rejects_malformed_addresses() {
        for bad in ["", "hostonly", ":9000", "host:notaport", "host:70000", "@h:1", "::1:9000"] {
            assert!(
                matches!(
                    bad.parse::<PeerAddress>(),
                    Err(RelayError::InvalidAddress { .. })
                ),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn dial_sends_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let target: PeerAddress = format!("west@127.0.0.1:{port}").parse().unwrap();

        let _stream = dial(&target, "east", Duration::from_secs(1), 1).unwrap();
        let (mut accepted, _) = listener.accept().unwrap();
        assert_eq!(read_handshake(&mut accepted).unwrap(), PeerId::from("east"));
    }

    #[test]
    fn dial_reports_refused_connection() {
        // Bind then drop to find a port nobody is listening on.
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let target: PeerAddress = format!("127.0.0.1:{port}").parse().unwrap();
        let err = dial(&target, "east", Duration::from_millis(200), 2).unwrap_err();
        assert!(matches!(err, RelayError::Dial { .. }));
    }
}
