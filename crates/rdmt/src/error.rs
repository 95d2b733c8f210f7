//! Error types for the RDMT engine.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::buffer::BufferClass;
use crate::connection::ConnState;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, RdmtError>;

/// Outcome of a completed (or cancelled) request.
///
/// Carried in request results and task aggregates. Anything but
/// [`CompletionCode::Success`] maps to a non-zero integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CompletionCode {
    /// The operation finished normally.
    #[default]
    Success,
    /// The local side of the operation failed.
    LocalError,
    /// The remote region rejected the access (bad key, bounds, or rights).
    RemoteAccess,
    /// The incoming message did not fit in the posted buffer.
    Truncated,
    /// The request was cancelled during connection teardown.
    Cancelled,
    /// A provider-specific error code.
    Provider(i32),
}

impl CompletionCode {
    /// Returns true for [`CompletionCode::Success`].
    pub fn is_success(self) -> bool {
        self == CompletionCode::Success
    }

    /// Stable integer form, `0` for success and negative errno-style values otherwise.
    pub fn as_i32(self) -> i32 {
        match self {
            CompletionCode::Success => 0,
            CompletionCode::LocalError => -5,
            CompletionCode::RemoteAccess => -13,
            CompletionCode::Truncated => -90,
            CompletionCode::Cancelled => -125,
            CompletionCode::Provider(0) => -1,
            CompletionCode::Provider(code) => -code.saturating_abs(),
        }
    }
}

impl std::fmt::Display for CompletionCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompletionCode::Success => write!(f, "success"),
            CompletionCode::LocalError => write!(f, "local error"),
            CompletionCode::RemoteAccess => write!(f, "remote access error"),
            CompletionCode::Truncated => write!(f, "message truncated"),
            CompletionCode::Cancelled => write!(f, "cancelled"),
            CompletionCode::Provider(code) => write!(f, "provider error {}", code),
        }
    }
}

/// Coarse classification of [`RdmtError`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Resource acquisition failed while setting up a pool or connection.
    Setup,
    /// An operation was rejected synchronously.
    Transport,
    /// An issued operation completed with a failure code.
    Completion,
    /// The peer (or caller) violated the command protocol.
    Protocol,
    /// Invalid configuration.
    Config,
    /// Underlying I/O failure.
    Io,
}

/// Error variants for engine operations.
#[derive(Debug, Error)]
pub enum RdmtError {
    /// No free slot of the requested class.
    #[error("buffer pool exhausted: no free {class:?} slot")]
    PoolExhausted {
        /// The exhausted class.
        class: BufferClass,
    },

    /// A setup step failed; partially acquired resources were rolled back.
    #[error("setup failed at {stage}: {reason}")]
    Setup {
        /// Which acquisition step failed.
        stage: &'static str,
        /// Description of the failure.
        reason: String,
    },

    /// The connection id is not in the live set.
    #[error("unknown connection {conn_id}")]
    UnknownConnection {
        /// The missing connection id.
        conn_id: u64,
    },

    /// The connection is not in a state that allows the operation.
    #[error("connection {conn_id} is {state:?}, cannot {op}")]
    InvalidState {
        /// Connection id.
        conn_id: u64,
        /// Current lifecycle state.
        state: ConnState,
        /// The rejected operation.
        op: &'static str,
    },

    /// The connection already has an exchange or one-sided operation in flight.
    #[error("connection {conn_id} is busy")]
    Busy {
        /// Connection id.
        conn_id: u64,
    },

    /// A buffer access fell outside a slot or region.
    #[error("buffer access out of bounds: offset {offset} len {len} exceeds {capacity}")]
    OutOfBounds {
        /// Requested offset.
        offset: usize,
        /// Requested length.
        len: usize,
        /// Available capacity.
        capacity: usize,
    },

    /// The transport provider rejected an operation synchronously.
    #[error("provider rejected {op}: {reason}")]
    Provider {
        /// The provider call.
        op: &'static str,
        /// Description of the failure.
        reason: String,
    },

    /// An issued operation completed with a failure code.
    #[error("operation completed with {code}")]
    Completion {
        /// The completion code.
        code: CompletionCode,
    },

    /// The handshake record carried the wrong protocol magic.
    #[error("handshake magic mismatch: expected 0x{expected:016X}, got 0x{got:016X}")]
    HandshakeMismatch {
        /// Our protocol magic.
        expected: u64,
        /// What the peer sent.
        got: u64,
    },

    /// A wire message could not be decoded.
    #[error("invalid message: {reason}")]
    InvalidMessage {
        /// Description of the problem.
        reason: String,
    },

    /// The command type field is not GET or PUT.
    #[error("unknown command type {0}")]
    UnknownCommand(u64),

    /// A command was attempted with no credits left.
    #[error("connection {conn_id} has no credits")]
    OutOfCredits {
        /// Connection id.
        conn_id: u64,
    },

    /// The task id is unknown.
    #[error("unknown task {task_id}")]
    UnknownTask {
        /// The missing task id.
        task_id: u64,
    },

    /// Every request slot of the task is already in use.
    #[error("task {task_id} has no free request slot (total {total})")]
    TaskFull {
        /// Task id.
        task_id: u64,
        /// Total slots of the task.
        total: usize,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Wraps standard I/O errors.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RdmtError {
    /// Classifies the error into the engine's error families.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RdmtError::PoolExhausted { .. } | RdmtError::Setup { .. } => ErrorKind::Setup,
            RdmtError::UnknownConnection { .. }
            | RdmtError::InvalidState { .. }
            | RdmtError::Busy { .. }
            | RdmtError::OutOfBounds { .. }
            | RdmtError::Provider { .. }
            | RdmtError::UnknownTask { .. }
            | RdmtError::TaskFull { .. } => ErrorKind::Transport,
            RdmtError::Completion { .. } => ErrorKind::Completion,
            RdmtError::HandshakeMismatch { .. }
            | RdmtError::InvalidMessage { .. }
            | RdmtError::UnknownCommand(_)
            | RdmtError::OutOfCredits { .. } => ErrorKind::Protocol,
            RdmtError::Config(_) => ErrorKind::Config,
            RdmtError::Io(_) => ErrorKind::Io,
        }
    }

    /// Wraps an error as a setup failure at the given stage, keeping setup errors as-is.
    pub(crate) fn at_setup(self, stage: &'static str) -> RdmtError {
        match self.kind() {
            ErrorKind::Setup => self,
            _ => RdmtError::Setup {
                stage,
                reason: self.to_string(),
            },
        }
    }
}
