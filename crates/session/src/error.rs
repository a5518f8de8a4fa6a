//! Error types for the session crate.

use std::io;

use thiserror::Error;

use crate::process::SessionId;

/// Result alias used throughout the session crate.
pub type Result<T> = std::result::Result<T, SessionError>;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The executable could not be started.
    ///
    /// Raised synchronously by spawn; a session that failed to spawn never
    /// produces an exit event.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        /// The program that was requested.
        program: String,
        /// The OS error reported by process creation.
        #[source]
        source: io::Error,
    },

    /// A standard stream of the child could not be attached.
    #[error("failed to attach {0} of spawned process")]
    StreamUnavailable(&'static str),

    /// The input sink was closed, either by the caller or by the child.
    #[error("input of session {0} is closed")]
    InputClosed(SessionId),

    /// The process has already exited.
    #[error("session already terminated: {0}")]
    AlreadyTerminated(SessionId),

    /// Writing to the child's input failed for a reason other than closure.
    #[error("failed to write to session input: {0}")]
    WriteFailed(#[source] io::Error),

    /// A signal could not be delivered to the child.
    #[error("failed to signal session {id}: {reason}")]
    SignalFailed {
        /// The session that was signalled.
        id: SessionId,
        /// Description of the failure.
        reason: String,
    },

    /// The task supervising the child stopped without reporting an exit.
    #[error("supervisor of session {0} stopped unexpectedly")]
    SupervisorGone(SessionId),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl SessionError {
    /// Returns true if spawning failed because the executable does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Spawn { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }

    /// Returns true if spawning failed because the OS denied execution.
    pub fn is_permission_denied(&self) -> bool {
        matches!(
            self,
            Self::Spawn { source, .. } if source.kind() == io::ErrorKind::PermissionDenied
        )
    }

    /// Returns true for errors caused by writing to a closed or finished session.
    pub fn is_write_after_close(&self) -> bool {
        matches!(self, Self::InputClosed(_) | Self::AlreadyTerminated(_))
    }
}
