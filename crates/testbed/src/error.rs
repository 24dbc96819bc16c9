//! Error types for building and operating environments

use std::net::IpAddr;
use std::time::Duration;
use testbed_exec::SshOutput;
use thiserror::Error;

/// Testbed error type
#[derive(Error, Debug)]
pub enum Error {
    /// The blueprint asks for something this provider cannot build
    #[error("provider `{provider}` unable to process blueprint: {reason}")]
    ImpossibleBlueprint {
        /// Name of the rejecting provider
        provider: String,
        /// Why the blueprint was rejected
        reason: String,
    },

    /// An awaited task or connection exceeded its deadline
    #[error("{operation} did not complete within {timeout:?}")]
    OperationTimeout {
        /// What was being waited on
        operation: String,
        /// The deadline that expired
        timeout: Duration,
    },

    /// A command that had to succeed exited with a non-zero status
    #[error(
        "remote command failed with exit code {}: {}",
        .0.exit_code,
        .0.stderr_lossy().trim()
    )]
    RemoteExecFailure(Box<SshOutput>),

    /// The interface (or bridge) does not support this mutation
    #[error("unsupported mutation: {0}")]
    UnsupportedMutation(String),

    /// An argument was outside the accepted range
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A control-plane task finished unsuccessfully
    #[error("task {task} failed: {reason}")]
    TaskFailed {
        /// The task handle
        task: String,
        /// Failure reported by the control plane
        reason: String,
    },

    /// Offsetting the base address left the address family
    #[error("address {base} + {delta} overflows its address family")]
    AddressOverflow {
        /// Base address
        base: IpAddr,
        /// Offset that was applied
        delta: u64,
    },

    /// The control plane rejected a request
    #[error("control plane error: {0}")]
    ControlPlane(String),

    /// A setup function panicked
    #[error("setup function panicked: {0}")]
    SetupPanicked(String),

    /// Remote execution error
    #[error("remote execution error: {0}")]
    Exec(testbed_exec::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] testbed_config::ConfigError),

    /// Error raised by user setup code
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create a control plane error
    pub fn control_plane(reason: impl Into<String>) -> Self {
        Self::ControlPlane(reason.into())
    }

    /// Create an unsupported mutation error
    pub fn unsupported(reason: impl Into<String>) -> Self {
        Self::UnsupportedMutation(reason.into())
    }
}

impl From<testbed_exec::Error> for Error {
    fn from(err: testbed_exec::Error) -> Self {
        match err {
            testbed_exec::Error::ConnectTimeout { host, timeout, .. } => Error::OperationTimeout {
                operation: format!("SSH connection to {host}"),
                timeout,
            },
            testbed_exec::Error::NonZeroExit(output) => Error::RemoteExecFailure(output),
            other => Error::Exec(other),
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_impossible_blueprint_message() {
        let err = Error::ImpossibleBlueprint {
            provider: "hypervisor".to_string(),
            reason: "no image registered for distribution `arch`".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "provider `hypervisor` unable to process blueprint: no image registered for distribution `arch`"
        );
    }

    #[test]
    fn test_exec_errors_map_to_taxonomy() {
        let timeout: Error = testbed_exec::Error::ConnectTimeout {
            host: "10.0.0.13".to_string(),
            timeout: Duration::from_secs(30),
            last_error: "connection refused".to_string(),
        }
        .into();
        assert!(matches!(timeout, Error::OperationTimeout { .. }));

        let output = SshOutput {
            exit_code: 127,
            stdout: vec![],
            stderr: b"sh: foo: not found\n".to_vec(),
        };
        let failure: Error = testbed_exec::Error::NonZeroExit(Box::new(output.clone())).into();
        match failure {
            Error::RemoteExecFailure(result) => assert_eq!(*result, output),
            other => panic!("unexpected error: {other}"),
        }

        let other: Error = testbed_exec::Error::channel_failed("broken pipe").into();
        assert!(matches!(other, Error::Exec(_)));
    }
}
