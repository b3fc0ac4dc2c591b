//! Error taxonomy for the engine.
//!
//! Every failure is classified by how far it reaches:
//! - connection-fatal: `Framing`, `Io`
//! - connection-safe: `UnknownCommand`, `HandlerFault`
//! - new-connection-fatal: `PoolExhausted`
//! - cycle-fatal: `CounterRead`
//! - startup-only: `DuplicateCommand`, `Config`
//!
//! None of them are process-fatal. Runtime failures are published on the
//! exception channel instead of being returned across component boundaries.

use std::sync::Arc;
use thiserror::Error;

/// A malformed or oversized frame. The owning session must close.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FramingError {
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("invalid frame header: {0}")]
    InvalidHeader(String),

    #[error("frame is not valid UTF-8")]
    InvalidEncoding,

    #[error("decoder reported a complete frame without consuming input")]
    NoProgress,
}

/// Failure to read OS-level process counters.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CounterError {
    #[error("process counters are unavailable: {0}")]
    Unavailable(String),

    #[error("counter instance '{0}' no longer exists")]
    InstanceGone(String),

    #[error("failed to read counter: {0}")]
    Read(String),
}

/// The main error enum for the engine.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("command '{command}' failed: {message}")]
    HandlerFault { command: String, message: String },

    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("proxy pool exhausted ({capacity} proxies in use)")]
    PoolExhausted { capacity: usize },

    #[error("performance counter read failed: {0}")]
    CounterRead(#[from] CounterError),

    #[error("command '{0}' is already registered")]
    DuplicateCommand(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Io(Arc::new(e))
    }
}

impl EngineError {
    /// Whether this error must close the connection it occurred on.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, EngineError::Framing(_) | EngineError::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_fatal_classification() {
        let framing = EngineError::from(FramingError::InvalidEncoding);
        assert!(framing.is_connection_fatal());

        let io = EngineError::from(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        assert!(io.is_connection_fatal());

        assert!(!EngineError::UnknownCommand("NOPE".into()).is_connection_fatal());
        assert!(!EngineError::HandlerFault {
            command: "ADD".into(),
            message: "bad".into(),
        }
        .is_connection_fatal());
        assert!(!EngineError::PoolExhausted { capacity: 2 }.is_connection_fatal());
    }

    #[test]
    fn test_error_messages() {
        let e = FramingError::FrameTooLarge { len: 20, max: 10 };
        assert_eq!(e.to_string(), "frame of 20 bytes exceeds the 10 byte limit");

        let e = EngineError::UnknownCommand("FOO".into());
        assert_eq!(e.to_string(), "unknown command 'FOO'");
    }
}
