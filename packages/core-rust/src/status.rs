//! Reply status vocabulary.
//!
//! A reply envelope carries its status in the `type` property. Only two
//! failure kinds are distinguished on the wire; every other handler error
//! travels as free text.

use crate::error::RpcError;

/// Wire text for a successful call.
pub const SUCCESS: &str = "success";
/// Wire text when no handler is registered for the requested name.
pub const BAD_HANDLER: &str = "bad handler";
/// Wire text for a domain-level absence.
pub const NOT_FOUND: &str = "not found";

/// Outcome of a call as carried on a reply envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallStatus {
    Success,
    BadHandler,
    NotFound,
    /// Any other handler failure, reduced to its message text.
    Failed(String),
}

impl CallStatus {
    /// Builds a free-text failure status from an error message.
    ///
    /// Text equal to one of the reserved words is prefixed, so a free-text
    /// failure always reads back as [`CallStatus::Failed`].
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        let message = message.into();
        if matches!(message.as_str(), SUCCESS | BAD_HANDLER | NOT_FOUND) {
            Self::Failed(format!("remote error: {message}"))
        } else {
            Self::Failed(message)
        }
    }

    /// Returns the text placed in the reply's `type` property.
    #[must_use]
    pub fn as_wire(&self) -> &str {
        match self {
            Self::Success => SUCCESS,
            Self::BadHandler => BAD_HANDLER,
            Self::NotFound => NOT_FOUND,
            Self::Failed(text) => text,
        }
    }

    /// Parses the `type` property of a reply.
    #[must_use]
    pub fn from_wire(text: &str) -> Self {
        match text {
            SUCCESS => Self::Success,
            BAD_HANDLER => Self::BadHandler,
            NOT_FOUND => Self::NotFound,
            other => Self::Failed(other.to_string()),
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Converts a non-success status into the error surfaced to the caller.
    ///
    /// # Errors
    ///
    /// Returns `BadHandler`, `NotFound` or `Remote` for the failure statuses.
    pub fn into_result(self) -> Result<(), RpcError> {
        match self {
            Self::Success => Ok(()),
            Self::BadHandler => Err(RpcError::BadHandler),
            Self::NotFound => Err(RpcError::NotFound),
            Self::Failed(text) => Err(RpcError::Remote(text)),
        }
    }
}
