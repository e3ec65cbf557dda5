// Error types for the relay and its client.
//
// Each layer gets its own enum so callers can match on what they care about:
// `RelayError` for starting and running the server, `ClientError` for the
// connection manager and lock registry, `FileBridgeError` for content writes
// and watches. Protocol decoding errors come from `metaroom_protocol`.

use std::path::PathBuf;

use metaroom_protocol::ProtocolError;

/// Errors that stop the relay from starting.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TLS configuration error: {0}")]
    Tls(String),
    #[error(transparent)]
    Files(#[from] FileBridgeError),
}

/// Errors surfaced by the client side.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("link is not open")]
    NotOpen,
    #[error("relay has not assigned this client an id yet")]
    NoIdentity,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Errors from the filesystem bridge. Reported per file; a failure never
/// aborts the rest of a batch.
#[derive(Debug, thiserror::Error)]
pub enum FileBridgeError {
    #[error("path `{0}` escapes the content root")]
    OutsideRoot(String),
    #[error("{action} {path:?}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("file watching is disabled")]
    WatchDisabled,
    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),
}
