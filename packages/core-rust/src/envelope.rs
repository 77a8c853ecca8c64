//! The message shape exchanged through the broker.

use crate::codec::ContentType;
use crate::correlation::CorrelationId;
use crate::status::CallStatus;

/// A single request or reply in flight through the broker.
///
/// The `kind` field is dual-purpose: on a request it names the handler to
/// invoke, on a reply it carries the call status (see [`CallStatus`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Receive address the envelope is published to.
    pub destination: String,
    pub priority: u8,
    pub content_type: ContentType,
    /// Serialized payload; may be empty.
    pub body: Vec<u8>,
    /// Receive address the reply should be published to. Empty on replies.
    pub reply_to: String,
    pub correlation_id: CorrelationId,
    /// Handler name on requests, status text on replies.
    pub kind: String,
}

impl Envelope {
    /// Builds a request addressed to `destination` for the named handler.
    #[must_use]
    pub fn request(
        destination: impl Into<String>,
        reply_to: impl Into<String>,
        handler: impl Into<String>,
        correlation_id: CorrelationId,
        content_type: ContentType,
        body: Vec<u8>,
    ) -> Self {
        Self {
            destination: destination.into(),
            priority: 0,
            content_type,
            body,
            reply_to: reply_to.into(),
            correlation_id,
            kind: handler.into(),
        }
    }

    /// Builds the reply to this request: addressed to its `reply_to`, with
    /// the same correlation id and content type.
    #[must_use]
    pub fn reply(&self, status: &CallStatus, body: Vec<u8>) -> Self {
        Self {
            destination: self.reply_to.clone(),
            priority: self.priority,
            content_type: self.content_type,
            body,
            reply_to: String::new(),
            correlation_id: self.correlation_id.clone(),
            kind: status.as_wire().to_string(),
        }
    }

    /// Handler name of a request.
    #[must_use]
    pub fn handler(&self) -> &str {
        &self.kind
    }

    /// Status of a reply.
    #[must_use]
    pub fn status(&self) -> CallStatus {
        CallStatus::from_wire(&self.kind)
    }
}
