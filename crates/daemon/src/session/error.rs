//! Error taxonomy for terminal sessions.

use thiserror::Error;

use crate::runtime::RuntimeError;

/// Unique identifier of a client connection.
pub type SessionId = String;

/// Unique identifier of one PTY bridge instance.
pub type BridgeId = String;

/// Errors raised by a single PTY bridge.
///
/// Faults here are local to one bridge; they never touch the registry or
/// sibling sessions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PtyError {
    /// The pseudo-terminal could not be set up or the runtime could not attach.
    #[error("failed to start PTY: {0}")]
    StartFailed(String),

    /// Writing to the controlling end failed.
    #[error("failed to write to PTY: {0}")]
    WriteFailed(String),

    /// Reading from the controlling end failed.
    #[error("failed to read from PTY: {0}")]
    ReadFailed(String),

    /// Applying a new terminal size failed. Non-fatal.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),
}

/// Errors surfaced by the lifecycle controller.
#[derive(Error, Debug)]
pub enum LabError {
    /// The container runtime has no such container.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// The container runtime failed for another reason.
    #[error("container runtime error: {0}")]
    Runtime(RuntimeError),

    /// A PTY bridge operation failed.
    #[error(transparent)]
    Pty(#[from] PtyError),

    /// The configured session limit has been reached.
    #[error("session limit reached ({0})")]
    CapacityExceeded(usize),

    /// The daemon is shutting down and refuses new sessions.
    #[error("daemon is shutting down")]
    ShuttingDown,

    /// A background task failed unexpectedly.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<RuntimeError> for LabError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::NotFound(container) => LabError::ContainerNotFound(container),
            other => LabError::Runtime(other),
        }
    }
}
