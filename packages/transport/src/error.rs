//! Transport-specific error types for detailed error handling

use std::io;

/// A Result alias where the Err case is [`TransportError`].
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors surfaced by the socket channel.
///
/// Every variant carries enough context to be logged as-is; the channel
/// reports each of them through exactly one handler callback and never
/// retries on its own beyond the connect-time address fallback.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Error: Cannot resolve server '{host}': {detail}")]
    Resolve { host: String, detail: String },
    #[error("No working address found for {0}")]
    AddressesExhausted(String),
    #[error("Socket error: read from {name}: {source}")]
    Read { name: String, source: io::Error },
    #[error("Socket error: read from {0}: unexpected EOF")]
    UnexpectedEof(String),
    #[error("Socket error: write to {name}: {source}")]
    Write { name: String, source: io::Error },
    #[error("Socket error: receive buffer full. Probably protocol error")]
    BufferFull,
    #[error("Socket error from {name}: {source}")]
    Broken { name: String, source: io::Error },
    #[error("Socket error: secure {op} {name}: {detail}")]
    Tls {
        op: &'static str,
        name: String,
        detail: String,
    },
    #[error("{0}")]
    CertificateVerification(String),
    #[error("Error while loading certificate file '{path}': {detail}")]
    CertificateFile { path: String, detail: String },
    #[error("Cannot configure TLS context for server '{host}': {detail}")]
    TlsContext { host: String, detail: String },
    #[error("{dir} compression error: {name}: {detail}")]
    Compression {
        dir: &'static str,
        name: String,
        detail: String,
    },
    #[error("Socket error: channel is closed")]
    Closed,
}
