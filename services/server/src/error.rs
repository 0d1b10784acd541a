//! Stage-level errors
//!
//! Every failure inside a connection, whether raised by a handler, a stage
//! thread or an execution strategy, ends up as one [`StageError`]. The first
//! one recorded by the [`crate::ErrorSupervisor`] terminates the connection.

use codec::CodecError;
use std::io;
use streamgate_config::ConfigParseError;
use thiserror::Error;
use types::HeaderParseError;

#[derive(Debug, Error)]
pub enum StageError {
    /// Malformed frame, or a tag the current stage does not accept
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] ConfigParseError),

    #[error("Header parse error: {0}")]
    HeaderParse(#[from] HeaderParseError),

    /// Spawn, handshake or link failure of an external module
    #[error("External module error: {0}")]
    ExternalModule(String),

    /// A distributed job or worker acquisition failed
    #[error("Worker error: {0}")]
    Worker(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Thread '{thread}' panicked: {message}")]
    Panicked { thread: String, message: String },
}

pub type StageResult<T> = std::result::Result<T, StageError>;

impl StageError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    pub fn external(message: impl Into<String>) -> Self {
        Self::ExternalModule(message.into())
    }

    pub fn worker(message: impl Into<String>) -> Self {
        Self::Worker(message.into())
    }

    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            StageError::Protocol(_) => "ProtocolError",
            StageError::ConfigParse(_) => "ConfigParseError",
            StageError::HeaderParse(_) => "HeaderParseError",
            StageError::ExternalModule(_) => "ExternalModuleError",
            StageError::Worker(_) => "WorkerError",
            StageError::Io(_) => "IoError",
            StageError::Panicked { .. } => "Panicked",
        }
    }
}

impl From<CodecError> for StageError {
    fn from(error: CodecError) -> Self {
        match error {
            CodecError::Io { source, .. } => StageError::Io(source),
            other => StageError::Protocol(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_errors_split_by_cause() {
        let framing = StageError::from(CodecError::UnknownMessageId { id: 0xFFFF });
        assert!(matches!(framing, StageError::Protocol(_)));
        assert!(framing.to_string().contains("0xffff"));

        let transport = StageError::from(CodecError::from_io(
            "writing frame",
            io::Error::new(io::ErrorKind::BrokenPipe, "gone"),
        ));
        assert!(matches!(transport, StageError::Io(_)));
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(StageError::protocol("x").kind(), "ProtocolError");
        assert_eq!(StageError::worker("x").kind(), "WorkerError");
        assert_eq!(StageError::HeaderParse(HeaderParseError::Empty).kind(), "HeaderParseError");
    }
}
