//! # Error Types
//!
//! Centralized error handling for the wsmux library.

use thiserror::Error;

/// Result type alias for wsmux operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for wsmux
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Namespace not declared locally, or not yet connected when required
    #[error("bad namespace")]
    BadNamespace,

    /// Room not joined on the addressed namespace
    #[error("bad room")]
    BadRoom,

    /// Malformed inbound frame
    #[error("invalid payload")]
    InvalidPayload,

    /// Underlying socket write failed or the connection closed during the call
    #[error("write closed")]
    Write,

    /// Deadline expired before the operation completed
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The transport reported a terminal close condition
    #[error("connection closed: {0}")]
    Closed(String),

    /// A user event handler rejected the action; the text travels over the wire
    #[error("{0}")]
    Handler(String),

    /// Transport-level failure that does not classify as a close
    #[error("socket error: {0}")]
    Socket(String),
}

impl Error {
    /// Reports whether this error classifies as a terminal close condition.
    ///
    /// Write errors that classify as close errors tear the connection down;
    /// other write errors only report failure to the caller.
    pub fn is_close(&self) -> bool {
        matches!(self, Error::Closed(_))
    }

    /// Maps wire error text back to the corresponding variant.
    ///
    /// The well-known protocol errors round-trip to their own variants so a
    /// remote `bad namespace` rejection surfaces as `Error::BadNamespace`
    /// locally; any other text is a user handler error.
    pub fn from_text(text: impl Into<String>) -> Self {
        let text = text.into();
        match text.as_str() {
            "bad namespace" => Error::BadNamespace,
            "bad room" => Error::BadRoom,
            "invalid payload" => Error::InvalidPayload,
            "write closed" => Error::Write,
            "deadline exceeded" => Error::DeadlineExceeded,
            _ => Error::Handler(text),
        }
    }
}
