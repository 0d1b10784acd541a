//! Wire-level errors for frame encoding and decoding
//!
//! Every variant except [`CodecError::Io`] means the peer sent bytes that do
//! not form a valid frame for this protocol. Callers use
//! [`CodecError::is_protocol`] to tell a misbehaving peer from a broken
//! transport.

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    /// Frame content violates the protocol
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Stream ended in the middle of a frame
    #[error("Truncated frame: stream ended while reading {context}")]
    Truncated { context: String },

    /// Tag has no codec registered
    #[error("Unknown message id {id:#06x}")]
    UnknownMessageId { id: u16 },

    /// Fixed-capacity buffer contained no NUL terminator
    #[error("Missing terminator in {capacity}-byte {context} buffer")]
    MissingTerminator { capacity: usize, context: String },

    /// Declared body length exceeds the configured limit
    #[error("Body too large: {size} bytes exceeds limit {limit} ({context})")]
    BodyTooLarge {
        size: u64,
        limit: usize,
        context: String,
    },

    /// Transport failure unrelated to frame content
    #[error("I/O error while {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

/// Result type for codec operations
pub type CodecResult<T> = std::result::Result<T, CodecError>;

impl CodecError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn missing_terminator(capacity: usize, context: impl Into<String>) -> Self {
        Self::MissingTerminator {
            capacity,
            context: context.into(),
        }
    }

    pub fn body_too_large(size: u64, limit: usize, context: impl Into<String>) -> Self {
        Self::BodyTooLarge {
            size,
            limit,
            context: context.into(),
        }
    }

    /// Classify an I/O failure; a short read mid-frame is a protocol violation
    pub fn from_io(context: impl Into<String>, source: io::Error) -> Self {
        let context = context.into();
        if source.kind() == io::ErrorKind::UnexpectedEof {
            Self::Truncated { context }
        } else {
            Self::Io { context, source }
        }
    }

    /// Closure adapter for `map_err`
    pub fn io(context: &str) -> impl FnOnce(io::Error) -> CodecError + '_ {
        move |source| CodecError::from_io(context, source)
    }

    /// Whether the peer, not the transport, is at fault
    pub fn is_protocol(&self) -> bool {
        !matches!(self, CodecError::Io { .. })
    }
}
