// Errors surfaced by relay operations.
//
// Transport and protocol failures on individual links are handled inside the
// pumps and only logged; the variants here are the ones that reach a caller
// of `RelayCore` (and from there the console).

use std::io;
use std::path::PathBuf;

use flood_relay_protocol::{PeerId, ProtocolError};

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("invalid peer address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("could not connect to {address}: {source}")]
    Dial {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("no connection to remote group {0}")]
    NotFound(PeerId),

    #[error("could not spawn worker thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("could not read config {path}: {source}")]
    ConfigFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not parse config {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Io(#[from] io::Error),
}
