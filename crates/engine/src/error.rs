use std::io;

use protocol::{ExitCode, HasExitCode};
use thiserror::Error;

/// Failures that abort a transfer.
///
/// Per-file problems never surface here; they are logged, counted, and
/// at worst raise the final exit code to [`ExitCode::Partial`].
#[derive(Debug, Error)]
pub enum EngineError {
    /// The peer violated the framing or sent an impossible value.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The local redo pipe between receiver and generator broke.
    #[error("ipc error: {0}")]
    Ipc(String),
    /// Transport or filesystem failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl EngineError {
    /// Convenience constructor for peer-misbehaviour errors.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}

impl HasExitCode for EngineError {
    fn exit_code(&self) -> ExitCode {
        match self {
            Self::Protocol(_) => ExitCode::Protocol,
            Self::Ipc(_) => ExitCode::Ipc,
            Self::Io(err) => ExitCode::from_io_error(err),
        }
    }
}

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, EngineError>;
