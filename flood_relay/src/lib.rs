// flood_relay: bridges a local multicast group to remote relays over TCP.
//
// Every datagram heard on the local group is stamped with this relay's
// identity and written to every peer link; every packet read from a peer is
// stamped and rebroadcast on the local group. A relay never forwards a packet
// that already carries its own stamp, which keeps floods from looping through
// cycles in the peer mesh.
//
// Module overview:
// - `config.rs`:   `RelayConfig`, defaults, JSON loading and validation.
// - `error.rs`:    `RelayError`, the errors `RelayCore` callers see.
// - `domain.rs`:   `LocalDomain` seam with a UDP multicast implementation
//                  and an in-process segment for tests and embedding.
// - `table.rs`:    `ConnectionTable` and `PeerConnection` (one live link per
//                  peer id, last writer wins).
// - `reaper.rs`:   `ThreadReaper`, bulk joining of finished link workers.
// - `pump.rs`:     the inbound (local → peers) and outbound (peer → local)
//                  packet pumps.
// - `accept.rs`:   accept loop for incoming links.
// - `dialer.rs`:   peer address parsing and outgoing links.
// - `server.rs`:   `RelayCore`, which starts, manages and stops all of the
//                  above.
// - `console.rs`:  line-oriented operator console used by the binary.
//
// Wire format and handshake live in `flood_relay_protocol`.

mod accept;
pub mod config;
pub mod console;
pub mod dialer;
pub mod domain;
pub mod error;
mod pump;
pub mod reaper;
pub mod server;
pub mod table;

pub use config::RelayConfig;
pub use domain::{LocalDomain, MemoryDomain, MemorySegment, MulticastDomain};
pub use error::RelayError;
pub use server::RelayCore;
pub use table::{ConnectionInfo, LinkDirection, LinkState};
