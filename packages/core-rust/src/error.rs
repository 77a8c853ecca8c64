//! Error taxonomy surfaced to RPC callers and hosts.

use crate::codec::CodecError;

/// Failures of the broker transport underneath a connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("broker unreachable: {0}")]
    Unreachable(String),
    #[error("no route to receive address {0}")]
    NoRoute(String),
    #[error("link closed")]
    Closed,
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("acknowledge failed: {0}")]
    Ack(String),
    #[error("close failed: {0}")]
    Close(String),
}

/// Errors returned by RPC calls and lifecycle operations.
///
/// None of these are retried internally; retry is the caller's concern.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// The broker could not be reached after exhausting connect attempts.
    #[error("connection failed after {attempts} attempts: {source}")]
    Connection {
        attempts: u32,
        #[source]
        source: TransportError,
    },
    /// A call was attempted during or after an unrecoverable disconnect.
    #[error("connection closed")]
    ConnectionClosed,
    #[error("call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    /// The caller's cancellation won the race against the reply.
    #[error("call canceled")]
    Canceled,
    /// No handler is registered for the requested name.
    #[error("bad handler")]
    BadHandler,
    /// Domain-level absence reported by the handler.
    #[error("not found")]
    NotFound,
    /// Any other remote failure, carrying only its message text.
    #[error("remote error: {0}")]
    Remote(String),
    #[error("serialize request: {0}")]
    Serialize(#[source] CodecError),
    #[error("deserialize response: {0}")]
    Deserialize(#[source] CodecError),
    #[error("publish: {0}")]
    Publish(#[source] TransportError),
    #[error("close: {0}")]
    Close(#[source] TransportError),
}
