// Errors raised while decoding packets and handshakes.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("packet length {len} is outside {min}..={max}")]
    InvalidPacketLength { len: usize, min: usize, max: usize },

    #[error("hop count {hops} exceeds the maximum of {max}")]
    HopCountOutOfRange { hops: u8, max: u8 },

    #[error("payload of {len} bytes does not fit in {capacity} bytes")]
    PayloadTooLarge { len: usize, capacity: usize },

    #[error("malformed handshake: {0}")]
    MalformedHandshake(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}
