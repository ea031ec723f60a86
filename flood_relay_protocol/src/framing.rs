// Fixed-width framing for peer links.
//
// Peer links carry two kinds of frames, neither with a length prefix:
//
// - The handshake: the dialing side writes exactly `HANDSHAKE_LEN` bytes of
//   UTF-8 node name, null-padded, before any relay traffic. The accepting side
//   uses the name as the connection-table key for the link.
// - Packets: every packet is exactly `L` bytes (see `packet.rs`), so the
//   reader simply reads `L` bytes at a time with `read_exact`.
//
// Both sides must agree on `L`; a relay configured with a different packet
// length will see misaligned frames and drop them as malformed.

use std::io::{Read, Write};

use crate::error::ProtocolError;
use crate::packet::Packet;
use crate::types::PeerId;

/// Width of the handshake frame.
pub const HANDSHAKE_LEN: usize = 64;

/// Write one packet to a link.
pub fn write_packet<W: Write>(writer: &mut W, packet: &Packet) -> Result<(), ProtocolError> {
    writer.write_all(packet.as_bytes())?;
    writer.flush()?;
    Ok(())
}

/// Read one `len`-byte packet from a link.
///
/// Returns `ProtocolError::Io` with `UnexpectedEof` if the link closes before
/// or during a packet.
pub fn read_packet<R: Read>(reader: &mut R, len: usize) -> Result<Packet, ProtocolError> {
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    Packet::from_datagram(len, &buf)
}

/// Encode a node name as a handshake frame.
pub fn encode_handshake(name: &str) -> Result<[u8; HANDSHAKE_LEN], ProtocolError> {
    if name.is_empty() {
        return Err(ProtocolError::MalformedHandshake("empty node name".into()));
    }
    if name.len() > HANDSHAKE_LEN {
        return Err(ProtocolError::MalformedHandshake(format!(
            "node name is {} bytes (max {HANDSHAKE_LEN})",
            name.len()
        )));
    }
    if name.contains('\0') {
        return Err(ProtocolError::MalformedHandshake(
            "node name contains a null byte".into(),
        ));
    }
    let mut frame = [0u8; HANDSHAKE_LEN];
    frame[..name.len()].copy_from_slice(name.as_bytes());
    Ok(frame)
}

/// Decode a handshake frame back into the peer's name.
pub fn decode_handshake(frame: &[u8; HANDSHAKE_LEN]) -> Result<PeerId, ProtocolError> {
    let end = frame.iter().position(|&b| b == 0).unwrap_or(HANDSHAKE_LEN);
    if frame[end..].iter().any(|&b| b != 0) {
        return Err(ProtocolError::MalformedHandshake(
            "data after null padding".into(),
        ));
    }
    let name = std::str::from_utf8(&frame[..end])
        .map_err(|e| ProtocolError::MalformedHandshake(format!("node name is not UTF-8: {e}")))?;
    if name.is_empty() {
        return Err(ProtocolError::MalformedHandshake("empty node name".into()));
    }
    Ok(PeerId::from(name))
}

/// Send this node's name on a freshly dialed link.
pub fn write_handshake<W: Write>(writer: &mut W, name: &str) -> Result<(), ProtocolError> {
    let frame = encode_handshake(name)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Read the dialing peer's name from a freshly accepted link.
pub fn read_handshake<R: Read>(reader: &mut R) -> Result<PeerId, ProtocolError> {
    let mut frame = [0u8; HANDSHAKE_LEN];
    reader.read_exact(&mut frame)?;
    decode_handshake(&frame)
}
