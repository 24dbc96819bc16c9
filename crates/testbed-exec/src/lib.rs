//! Remote command execution for provisioned machines
//!
//! This crate defines the remote-shell capability a provider needs
//! ([`RemoteShell`], [`Session`], [`ExecChannel`]), an OpenSSH backed
//! implementation, and the [`SshExecutor`] that connects with retries, runs a
//! command and collects its exit code and output.

#![warn(missing_docs)]

pub mod backends;
pub mod command;
pub mod error;
pub mod executor;
pub mod output;
pub mod shell;

pub use backends::ssh::{OpenSshShell, SshConfig};
pub use command::Command;
pub use error::{Error, Result};
pub use executor::SshExecutor;
pub use output::{OutputBuffers, SshOutput};
pub use shell::{ExecChannel, RemoteShell, Session};
