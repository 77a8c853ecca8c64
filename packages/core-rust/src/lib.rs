//! Relay core: envelope, status vocabulary, body codecs and error taxonomy
//! shared by both sides of a broker-backed RPC link.

pub mod codec;
pub mod correlation;
pub mod envelope;
pub mod error;
pub mod status;

pub use codec::{CodecError, ContentType};
pub use correlation::CorrelationId;
pub use envelope::Envelope;
pub use error::{RpcError, TransportError};
pub use status::CallStatus;

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}
