//! SSH command executor
//!
//! Connects to a machine with retries until a deadline, runs one command on
//! an exec channel and polls the channel until the remote process exits.

use smol::Timer;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::{Error, Result};
use crate::output::{OutputBuffers, SshOutput};
use crate::shell::{RemoteShell, Session};

/// Default interval between channel liveness polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default delay between failed session attempts
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Runs commands over a [`RemoteShell`]
#[derive(Clone)]
pub struct SshExecutor {
    shell: Arc<dyn RemoteShell>,
    poll_interval: Duration,
    retry_delay: Duration,
}

impl std::fmt::Debug for SshExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshExecutor")
            .field("poll_interval", &self.poll_interval)
            .field("retry_delay", &self.retry_delay)
            .finish_non_exhaustive()
    }
}

impl SshExecutor {
    /// Create an executor over the given shell with default intervals
    pub fn new(shell: Arc<dyn RemoteShell>) -> Self {
        Self {
            shell,
            poll_interval: DEFAULT_POLL_INTERVAL,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    /// Set the channel liveness poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the delay between failed session attempts
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Run `command` on `address`, returning its exit code and output
    ///
    /// Session attempts are retried until `connect_timeout` has elapsed since
    /// the call started. A non-zero exit code is not an error.
    pub async fn run(
        &self,
        address: IpAddr,
        command: &str,
        connect_timeout: Duration,
    ) -> Result<SshOutput> {
        let mut session = self.connect(address, connect_timeout).await?;
        let result = self.exec(session.as_ref(), command).await;

        if let Err(e) = session.close().await {
            debug!("Failed to close SSH session to {}: {}", address, e);
        }
        result
    }

    /// Like [`run`](Self::run), but a non-zero exit code is an
    /// [`Error::NonZeroExit`] carrying the full output
    pub async fn must_run(
        &self,
        address: IpAddr,
        command: &str,
        connect_timeout: Duration,
    ) -> Result<SshOutput> {
        let output = self.run(address, command, connect_timeout).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(Error::NonZeroExit(Box::new(output)))
        }
    }

    async fn connect(&self, address: IpAddr, timeout: Duration) -> Result<Box<dyn Session>> {
        let deadline = Instant::now() + timeout;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());

            let err = match self.shell.open_session(address, remaining).await {
                Ok(session) => return Ok(session),
                Err(e) => e,
            };

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::ConnectTimeout {
                    host: address.to_string(),
                    timeout,
                    last_error: err.to_string(),
                });
            }

            debug!(
                "SSH attempt {} to {} failed, retrying: {}",
                attempt, address, err
            );
            Timer::after(self.retry_delay.min(deadline - now)).await;
        }
    }

    async fn exec(&self, session: &dyn Session, command: &str) -> Result<SshOutput> {
        let buffers = OutputBuffers::new();
        let mut channel = session.exec(command, buffers.clone()).await?;

        while channel.is_connected().await? {
            Timer::after(self.poll_interval).await;
        }

        let exit_code = channel.exit_status().unwrap_or(-1);
        channel.close().await?;

        let (stdout, stderr) = buffers.take();
        Ok(SshOutput {
            exit_code,
            stdout,
            stderr,
        })
    }
}
