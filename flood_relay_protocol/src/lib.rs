// flood_relay_protocol: wire format for the flood-suppressed multicast relay.
//
// This crate defines the packet layout, the stamp-based loop-suppression
// codec, and the fixed-width link framing shared by every relay node. It does
// no networking of its own: framing works over any `Read`/`Write`, and the
// codec is pure.
//
// Module overview:
// - `types.rs`:    `RelayIdentity` (4-byte stamp) and `PeerId` (link key).
// - `packet.rs`:   `Packet` (bounds-checked fixed-length buffer) and
//                  `PacketCodec` (`is_duplicate` / `stamp`).
// - `framing.rs`:  Packet and handshake frames over a stream link.
// - `error.rs`:    `ProtocolError`.
//
// Design decisions:
// - **Visited-node list, not a TTL.** A packet carries the identity of every
//   relay it passed through, so a relay drops exactly the packets it has
//   already handled, whatever the topology.
// - **Fixed-length frames.** Packets are the same size on the local domain
//   and on peer links, so link framing needs no length prefix.

pub mod error;
pub mod framing;
pub mod packet;
pub mod types;

pub use error::ProtocolError;
pub use framing::{HANDSHAKE_LEN, read_handshake, read_packet, write_handshake, write_packet};
pub use packet::{Packet, PacketCodec, Stamped, max_hops};
pub use types::{IDENTITY_LEN, PeerId, RelayIdentity};
