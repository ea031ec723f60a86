// Core identity types for the relay protocol.
//
// `RelayIdentity` is the 4-byte stamp a relay writes into every packet it
// forwards. It is derived from the node's IPv4 group address, so every relay
// bridging the same local domain stamps with the same value. `PeerId` is the
// key a relay uses for a remote link in its connection table: the name the
// remote announced in its handshake, or the name/host the admin dialed.

use std::fmt;
use std::net::Ipv4Addr;

/// Width of a single stamp on the wire.
pub const IDENTITY_LEN: usize = 4;

/// Fixed-width stamp identifying a relay node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelayIdentity(pub [u8; IDENTITY_LEN]);

impl RelayIdentity {
    /// Derive the identity from the group address this node bridges.
    pub fn from_group(group: Ipv4Addr) -> Self {
        Self(group.octets())
    }

    pub fn as_bytes(&self) -> &[u8; IDENTITY_LEN] {
        &self.0
    }
}

impl fmt::Display for RelayIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.0;
        write!(f, "{a}.{b}.{c}.{d}")
    }
}

/// Connection-table key for a remote relay.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}
