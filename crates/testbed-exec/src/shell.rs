//! Remote-shell capability traits
//!
//! A [`RemoteShell`] opens authenticated [`Session`]s against a machine, and a
//! session runs commands on exec-style [`ExecChannel`]s. The traits are object
//! safe so providers can hold an `Arc<dyn RemoteShell>` without becoming
//! generic over the backend.

use crate::error::Result;
use crate::output::OutputBuffers;
use async_trait::async_trait;
use std::net::IpAddr;
use std::time::Duration;

/// Something that can open remote sessions
#[async_trait]
pub trait RemoteShell: Send + Sync + 'static {
    /// Make a single attempt to open an authenticated session to `address`
    ///
    /// `timeout` bounds this one attempt; retrying is the caller's concern.
    async fn open_session(&self, address: IpAddr, timeout: Duration) -> Result<Box<dyn Session>>;
}

/// An open, authenticated session
#[async_trait]
pub trait Session: Send + Sync {
    /// Start `command` on a new exec channel, streaming output into `buffers`
    async fn exec(&self, command: &str, buffers: OutputBuffers) -> Result<Box<dyn ExecChannel>>;

    /// Disconnect the session
    async fn close(&mut self) -> Result<()>;
}

/// A running remote command
#[async_trait]
pub trait ExecChannel: Send {
    /// Whether the remote process is still running
    ///
    /// Once this returns false all output has been written to the buffers.
    async fn is_connected(&mut self) -> Result<bool>;

    /// Exit status of the remote process, once it has finished
    fn exit_status(&self) -> Option<i32>;

    /// Disconnect the channel if it is still connected
    async fn close(&mut self) -> Result<()>;
}
