//! Advisory exit codes.
//!
//! These numeric codes are stable across the wire and across releases;
//! peers and wrapper scripts key on them. The taxonomy distinguishes
//! per-file failures (which only raise the final code to
//! [`ExitCode::Partial`]) from stream-level failures that abort the
//! transfer outright.

use std::fmt;

/// Exit codes reported by transfer processes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(i32)]
pub enum ExitCode {
    /// Successful completion.
    Ok = 0,
    /// Syntax or usage error.
    Syntax = 1,
    /// Protocol incompatibility or malformed framing.
    Protocol = 2,
    /// Errors selecting input/output files or directories.
    FileSelect = 3,
    /// Requested action not supported by the peer.
    Unsupported = 4,
    /// Error in socket I/O.
    SocketIo = 10,
    /// Error in file I/O.
    FileIo = 11,
    /// Error in the protocol data stream.
    StreamIo = 12,
    /// The diagnostic channel itself failed.
    MessageIo = 13,
    /// Local pipe or process plumbing failed.
    Ipc = 14,
    /// Interrupted by a signal.
    Signal = 20,
    /// Error waiting for a child process.
    WaitChild = 21,
    /// Allocation failure.
    Malloc = 22,
    /// Transfer completed but at least one file was skipped or failed.
    Partial = 23,
    /// No progress within the configured I/O timeout.
    Timeout = 30,
}

impl ExitCode {
    /// Returns the numeric exit code value.
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self as i32
    }

    /// Returns a human-readable description of this exit code.
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::Ok => "success",
            Self::Syntax => "syntax or usage error",
            Self::Protocol => "protocol incompatibility",
            Self::FileSelect => "errors selecting input/output files, dirs",
            Self::Unsupported => "requested action not supported",
            Self::SocketIo => "error in socket IO",
            Self::FileIo => "error in file IO",
            Self::StreamIo => "error in protocol data stream",
            Self::MessageIo => "errors with program diagnostics",
            Self::Ipc => "error in IPC code",
            Self::Signal => "received SIGUSR1 or SIGINT",
            Self::WaitChild => "waitpid() failed",
            Self::Malloc => "error allocating core memory buffers",
            Self::Partial => "partial transfer",
            Self::Timeout => "timeout in data send/receive",
        }
    }

    /// Creates an exit code from its numeric value.
    #[must_use]
    pub const fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Ok),
            1 => Some(Self::Syntax),
            2 => Some(Self::Protocol),
            3 => Some(Self::FileSelect),
            4 => Some(Self::Unsupported),
            10 => Some(Self::SocketIo),
            11 => Some(Self::FileIo),
            12 => Some(Self::StreamIo),
            13 => Some(Self::MessageIo),
            14 => Some(Self::Ipc),
            20 => Some(Self::Signal),
            21 => Some(Self::WaitChild),
            22 => Some(Self::Malloc),
            23 => Some(Self::Partial),
            30 => Some(Self::Timeout),
            _ => None,
        }
    }

    /// Returns `true` if this error aborts the whole transfer rather
    /// than a single file.
    #[must_use]
    pub const fn is_fatal(self) -> bool {
        matches!(
            self,
            Self::Protocol
                | Self::SocketIo
                | Self::StreamIo
                | Self::MessageIo
                | Self::Ipc
                | Self::Malloc
                | Self::Timeout
        )
    }

    /// Maps a [`std::io::Error`] to an appropriate exit code.
    #[must_use]
    pub fn from_io_error(error: &std::io::Error) -> Self {
        use std::io::ErrorKind;

        match error.kind() {
            ErrorKind::NotFound | ErrorKind::PermissionDenied | ErrorKind::AlreadyExists => {
                Self::FileSelect
            }
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected => Self::SocketIo,
            ErrorKind::TimedOut | ErrorKind::WouldBlock => Self::Timeout,
            ErrorKind::UnexpectedEof | ErrorKind::InvalidData => Self::StreamIo,
            ErrorKind::Interrupted => Self::Signal,
            _ => Self::FileIo,
        }
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code.as_i32()
    }
}

/// Trait for error types that carry an advisory exit code.
pub trait HasExitCode {
    /// Returns the exit code associated with this value.
    fn exit_code(&self) -> ExitCode;
}
