//! Error types for remote execution

use crate::output::SshOutput;
use std::time::Duration;
use thiserror::Error;

/// Unified error type for remote execution
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to spawn a local helper process
    #[error("failed to spawn process: {reason}")]
    SpawnFailed {
        /// The reason for the spawn failure
        reason: String,
    },

    /// A single attempt to open a session failed
    #[error("SSH session to {host} failed: {reason}")]
    SessionFailed {
        /// The address that was dialled
        host: String,
        /// The detailed reason for the failure
        reason: String,
    },

    /// No session could be opened before the deadline
    #[error("SSH connection to {host} timed out after {timeout:?}: {last_error}")]
    ConnectTimeout {
        /// The address that was dialled
        host: String,
        /// The connection deadline
        timeout: Duration,
        /// The error of the final attempt
        last_error: String,
    },

    /// Opening or driving an exec channel failed
    #[error("SSH channel failed: {reason}")]
    ChannelFailed {
        /// The detailed reason for the failure
        reason: String,
    },

    /// The remote command exited with a non-zero status
    #[error("remote command exited with status {}", .0.exit_code)]
    NonZeroExit(Box<SshOutput>),

    /// I/O error
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a spawn failed error
    pub fn spawn_failed(reason: impl Into<String>) -> Self {
        Self::SpawnFailed {
            reason: reason.into(),
        }
    }

    /// Create a session failed error
    pub fn session_failed(host: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SessionFailed {
            host: host.into(),
            reason: reason.into(),
        }
    }

    /// Create a channel failed error
    pub fn channel_failed(reason: impl Into<String>) -> Self {
        Self::ChannelFailed {
            reason: reason.into(),
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
