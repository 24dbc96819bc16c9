//! OpenSSH remote-shell backend using the CLI
//!
//! A session is an OpenSSH control master kept alive on a socket in a private
//! temporary directory; every exec channel is a client process multiplexed
//! over that master.

use async_process::Child;
use async_trait::async_trait;
use futures::io::AsyncReadExt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tracing::debug;

use crate::command::Command;
use crate::error::{Error, Result};
use crate::output::OutputBuffers;
use crate::shell::{ExecChannel, RemoteShell, Session};

/// SSH connection configuration
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// SSH user
    user: String,
    /// SSH port (optional, defaults to 22)
    port: Option<u16>,
    /// Path to identity file (private key)
    identity_file: Option<PathBuf>,
    /// Additional SSH arguments
    extra_args: Vec<String>,
}

impl SshConfig {
    /// Create a new SSH configuration logging in as `user`
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            port: None,
            identity_file: None,
            extra_args: Vec::new(),
        }
    }

    /// Set the SSH port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the identity file (private key)
    pub fn with_identity_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_file = Some(path.into());
        self
    }

    /// Add extra SSH arguments
    pub fn with_extra_arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    /// Get the destination string for an address
    fn destination(&self, address: IpAddr) -> String {
        format!("{}@{}", self.user, address)
    }

    /// Options shared by the master and every client process
    fn base_command(&self, control_path: &Path) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-S").arg(control_path);
        // Freshly cloned machines have unknown, throwaway host keys
        cmd.args(["-o", "BatchMode=yes"])
            .args(["-o", "StrictHostKeyChecking=no"])
            .args(["-o", "UserKnownHostsFile=/dev/null"])
            .args(["-o", "LogLevel=ERROR"]);

        if let Some(port) = self.port {
            cmd.arg("-p").arg(port.to_string());
        }
        if let Some(identity) = &self.identity_file {
            cmd.arg("-i").arg(identity);
        }
        for arg in &self.extra_args {
            cmd.arg(arg);
        }
        cmd
    }

    /// Command that starts a backgrounded control master
    fn master_command(&self, control_path: &Path, address: IpAddr, timeout: Duration) -> Command {
        let mut cmd = self.base_command(control_path);
        // ConnectTimeout is whole seconds and 0 means "no timeout"
        let secs = timeout.as_secs().max(1);
        cmd.args(["-M", "-f", "-N"])
            .arg("-o")
            .arg(format!("ConnectTimeout={secs}"))
            .arg(self.destination(address));
        cmd
    }

    /// Command that runs `remote` over an existing control master
    fn exec_command(&self, control_path: &Path, address: IpAddr, remote: &str) -> Command {
        let mut cmd = self.base_command(control_path);
        cmd.arg(self.destination(address)).arg("--").arg(remote);
        cmd
    }

    /// Command that asks the control master to exit
    fn exit_command(&self, control_path: &Path, address: IpAddr) -> Command {
        let mut cmd = self.base_command(control_path);
        cmd.args(["-O", "exit"]).arg(self.destination(address));
        cmd
    }
}

/// Remote shell backed by the system `ssh` binary
#[derive(Debug, Clone)]
pub struct OpenSshShell {
    config: SshConfig,
}

impl OpenSshShell {
    /// Create a shell with the given connection configuration
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl RemoteShell for OpenSshShell {
    async fn open_session(&self, address: IpAddr, timeout: Duration) -> Result<Box<dyn Session>> {
        let control_dir = tempfile::Builder::new().prefix("testbed-ssh").tempdir()?;
        let control_path = control_dir.path().join("master.sock");

        let status = self
            .config
            .master_command(&control_path, address, timeout)
            .prepare_detached()
            .status()
            .await
            .map_err(|e| Error::spawn_failed(format!("failed to run ssh: {e}")))?;

        if !status.success() {
            return Err(Error::session_failed(
                address.to_string(),
                format!("ssh control master exited with {status}"),
            ));
        }

        debug!("Opened SSH session to {}", address);
        Ok(Box::new(OpenSshSession {
            config: self.config.clone(),
            address,
            control_path,
            _control_dir: control_dir,
            open: true,
        }))
    }
}

/// Session multiplexed over an OpenSSH control master
struct OpenSshSession {
    config: SshConfig,
    address: IpAddr,
    control_path: PathBuf,
    /// Removed on drop, together with the socket
    _control_dir: TempDir,
    open: bool,
}

#[async_trait]
impl Session for OpenSshSession {
    async fn exec(&self, command: &str, buffers: OutputBuffers) -> Result<Box<dyn ExecChannel>> {
        let mut child = self
            .config
            .exec_command(&self.control_path, self.address, command)
            .prepare_piped()
            .spawn()
            .map_err(|e| Error::channel_failed(format!("failed to spawn ssh client: {e}")))?;

        let mut readers = Vec::with_capacity(2);
        if let Some(mut stdout) = child.stdout.take() {
            let sink = buffers.clone();
            readers.push(smol::spawn(async move {
                let mut chunk = [0u8; 8192];
                while let Ok(n) = stdout.read(&mut chunk).await {
                    if n == 0 {
                        break;
                    }
                    sink.extend_stdout(&chunk[..n]);
                }
            }));
        }
        if let Some(mut stderr) = child.stderr.take() {
            let sink = buffers;
            readers.push(smol::spawn(async move {
                let mut chunk = [0u8; 8192];
                while let Ok(n) = stderr.read(&mut chunk).await {
                    if n == 0 {
                        break;
                    }
                    sink.extend_stderr(&chunk[..n]);
                }
            }));
        }

        Ok(Box::new(OpenSshChannel {
            child,
            readers,
            exit_code: None,
            finished: false,
        }))
    }

    async fn close(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;

        let status = self
            .config
            .exit_command(&self.control_path, self.address)
            .prepare_detached()
            .status()
            .await?;
        if !status.success() {
            debug!("ssh control master for {} exited with {}", self.address, status);
        }
        Ok(())
    }
}

/// A client process running one remote command
struct OpenSshChannel {
    child: Child,
    readers: Vec<smol::Task<()>>,
    exit_code: Option<i32>,
    finished: bool,
}

#[async_trait]
impl ExecChannel for OpenSshChannel {
    async fn is_connected(&mut self) -> Result<bool> {
        if self.finished {
            return Ok(false);
        }

        match self.child.try_status()? {
            None => Ok(true),
            Some(status) => {
                self.exit_code = status.code();
                // Drain the pipes so the buffers are complete
                for reader in self.readers.drain(..) {
                    reader.await;
                }
                self.finished = true;
                Ok(false)
            }
        }
    }

    fn exit_status(&self) -> Option<i32> {
        self.exit_code
    }

    async fn close(&mut self) -> Result<()> {
        if !self.finished {
            self.child.kill()?;
            self.finished = true;
        }
        Ok(())
    }
}
