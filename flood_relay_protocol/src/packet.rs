// Relay packet layout and the loop-suppression codec.
//
// Every packet is exactly `L` bytes, where `L` is the configured datagram
// size shared by all relays and local senders:
//
//   byte 0..3        reserved, carried verbatim
//   byte 3           hop count H
//   4 .. 4+4H        H relay stamps, oldest first
//   4+4H .. L        payload, null-padded
//
// A relay that forwards a packet inserts its own stamp at position H and
// shifts the payload right by one stamp width, so the last 4 payload bytes
// fall off the end of the fixed buffer. A relay that finds its own stamp in
// a packet has already handled it and drops it. This gives exact loop
// suppression on any topology, at the cost of a bounded relay diameter:
// once H reaches `Hmax` the packet can no longer be stamped and is dropped.
//
// `Packet` owns a bounds-checked buffer; nothing outside this module indexes
// into it directly.

use crate::error::ProtocolError;
use crate::types::{IDENTITY_LEN, RelayIdentity};

/// Reserved bytes plus the hop count byte.
pub const HEADER_LEN: usize = 4;

/// Offset of the hop count byte.
pub const HOP_COUNT_OFFSET: usize = 3;

/// Smallest packet that can carry one stamp.
pub const MIN_PACKET_LEN: usize = HEADER_LEN + IDENTITY_LEN;

/// Largest payload of a single UDP datagram over IPv4.
pub const MAX_PACKET_LEN: usize = 65_507;

/// Maximum hop count for a packet of `len` bytes. The hop count is a single
/// byte, so large packets are capped at 255 stamps.
pub fn max_hops(len: usize) -> u8 {
    let hops = len.saturating_sub(HEADER_LEN) / IDENTITY_LEN;
    u8::try_from(hops).unwrap_or(u8::MAX)
}

/// A fixed-length relay packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    buf: Vec<u8>,
}

impl Packet {
    /// Build a fresh, unstamped packet of `len` bytes carrying `payload`.
    pub fn with_payload(len: usize, payload: &[u8]) -> Result<Self, ProtocolError> {
        Self::new(len, [0; HOP_COUNT_OFFSET], payload)
    }

    /// Build a fresh, unstamped packet with explicit reserved bytes.
    pub fn new(
        len: usize,
        reserved: [u8; HOP_COUNT_OFFSET],
        payload: &[u8],
    ) -> Result<Self, ProtocolError> {
        check_len(len)?;
        let capacity = len - HEADER_LEN;
        if payload.len() > capacity {
            return Err(ProtocolError::PayloadTooLarge {
                len: payload.len(),
                capacity,
            });
        }
        let mut buf = vec![0u8; len];
        buf[..HOP_COUNT_OFFSET].copy_from_slice(&reserved);
        buf[HEADER_LEN..HEADER_LEN + payload.len()].copy_from_slice(payload);
        Ok(Self { buf })
    }

    /// Interpret a received buffer as a packet of `len` bytes. Short input is
    /// null-padded and long input truncated, matching what a fixed-size
    /// receive buffer would hold. Rejects hop counts above `Hmax`.
    pub fn from_datagram(len: usize, bytes: &[u8]) -> Result<Self, ProtocolError> {
        check_len(len)?;
        let mut buf = vec![0u8; len];
        let n = bytes.len().min(len);
        buf[..n].copy_from_slice(&bytes[..n]);

        let hops = buf[HOP_COUNT_OFFSET];
        let max = max_hops(len);
        if hops > max {
            return Err(ProtocolError::HopCountOutOfRange { hops, max });
        }
        Ok(Self { buf })
    }

    /// Total length on the wire (`L`).
    pub fn wire_len(&self) -> usize {
        self.buf.len()
    }

    pub fn hop_count(&self) -> u8 {
        self.buf[HOP_COUNT_OFFSET]
    }

    pub fn max_hops(&self) -> u8 {
        max_hops(self.buf.len())
    }

    pub fn reserved(&self) -> [u8; HOP_COUNT_OFFSET] {
        [self.buf[0], self.buf[1], self.buf[2]]
    }

    /// Stamps in the order relays applied them.
    pub fn stamps(&self) -> impl Iterator<Item = RelayIdentity> + '_ {
        self.buf[HEADER_LEN..self.payload_offset()]
            .chunks_exact(IDENTITY_LEN)
            .map(|chunk| RelayIdentity([chunk[0], chunk[1], chunk[2], chunk[3]]))
    }

    /// Payload region including null padding.
    pub fn payload(&self) -> &[u8] {
        &self.buf[self.payload_offset()..]
    }

    /// Payload with the trailing null padding removed.
    pub fn message(&self) -> &[u8] {
        let payload = self.payload();
        let end = payload.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
        &payload[..end]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    fn payload_offset(&self) -> usize {
        HEADER_LEN + usize::from(self.hop_count()) * IDENTITY_LEN
    }
}

fn check_len(len: usize) -> Result<(), ProtocolError> {
    if !(MIN_PACKET_LEN..=MAX_PACKET_LEN).contains(&len) {
        return Err(ProtocolError::InvalidPacketLength {
            len,
            min: MIN_PACKET_LEN,
            max: MAX_PACKET_LEN,
        });
    }
    Ok(())
}

/// Result of stamping a packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Stamped {
    /// The packet now carries this node's stamp and may be forwarded.
    Forward(Packet),
    /// The hop count is already at `Hmax`; the packet is returned unchanged
    /// and must not be forwarded.
    HopLimit(Packet),
}

/// Duplicate detection and stamping for one relay identity.
#[derive(Clone, Copy, Debug)]
pub struct PacketCodec {
    identity: RelayIdentity,
}

impl PacketCodec {
    pub fn new(identity: RelayIdentity) -> Self {
        Self { identity }
    }

    pub fn identity(&self) -> RelayIdentity {
        self.identity
    }

    /// True if this node's stamp already appears in the packet.
    pub fn is_duplicate(&self, packet: &Packet) -> bool {
        packet.stamps().any(|stamp| stamp == self.identity)
    }

    /// Append this node's stamp, or signal `HopLimit` if there is no room.
    pub fn stamp(&self, packet: &Packet) -> Stamped {
        let hops = packet.hop_count();
        if hops >= packet.max_hops() {
            return Stamped::HopLimit(packet.clone());
        }

        let mut buf = packet.buf.clone();
        let len = buf.len();
        let offset = packet.payload_offset();
        buf.copy_within(offset..len - IDENTITY_LEN, offset + IDENTITY_LEN);
        buf[offset..offset + IDENTITY_LEN].copy_from_slice(self.identity.as_bytes());
        buf[HOP_COUNT_OFFSET] = hops + 1;
        Stamped::Forward(Packet { buf })
    }
}
