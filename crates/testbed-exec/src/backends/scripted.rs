//! Scripted remote shell for tests
//!
//! [`ScriptedShell`] never touches the network: sessions fail a configured
//! number of times before succeeding, and every command is answered from a
//! table of canned responses.

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::output::OutputBuffers;
use crate::shell::{ExecChannel, RemoteShell, Session};

/// Canned answer for one command
#[derive(Debug, Clone, Default)]
pub struct ScriptedResponse {
    /// Exit status reported when the channel closes
    pub exit_code: Option<i32>,
    /// Bytes written to standard output
    pub stdout: Vec<u8>,
    /// Bytes written to standard error
    pub stderr: Vec<u8>,
    /// Number of liveness polls that report the channel as still connected
    pub polls: usize,
}

impl ScriptedResponse {
    /// A response exiting with `code` immediately
    pub fn exit(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            ..Default::default()
        }
    }

    /// Set standard output
    pub fn with_stdout(mut self, stdout: impl Into<Vec<u8>>) -> Self {
        self.stdout = stdout.into();
        self
    }

    /// Set standard error
    pub fn with_stderr(mut self, stderr: impl Into<Vec<u8>>) -> Self {
        self.stderr = stderr.into();
        self
    }

    /// Keep the channel connected for `polls` liveness checks
    pub fn with_polls(mut self, polls: usize) -> Self {
        self.polls = polls;
        self
    }
}

#[derive(Debug, Default)]
struct ScriptState {
    refusals_left: usize,
    session_attempts: Vec<IpAddr>,
    commands: Vec<(IpAddr, String)>,
    sessions_closed: usize,
}

/// In-process remote shell answering from a script
#[derive(Debug, Clone, Default)]
pub struct ScriptedShell {
    responses: Arc<Mutex<HashMap<String, ScriptedResponse>>>,
    fallback: ScriptedResponse,
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedShell {
    /// A shell where every command succeeds with no output
    pub fn new() -> Self {
        Self {
            fallback: ScriptedResponse::exit(0),
            ..Default::default()
        }
    }

    /// Refuse the first `attempts` session attempts
    pub fn refuse_sessions(self, attempts: usize) -> Self {
        self.state().refusals_left = attempts;
        self
    }

    /// Answer `command` with `response`
    pub fn respond(self, command: impl Into<String>, response: ScriptedResponse) -> Self {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(command.into(), response);
        self
    }

    /// Number of session attempts made so far, successful or not
    pub fn session_attempts(&self) -> usize {
        self.state().session_attempts.len()
    }

    /// Number of sessions that were closed
    pub fn sessions_closed(&self) -> usize {
        self.state().sessions_closed
    }

    /// Every command executed, with the address it ran against
    pub fn commands(&self) -> Vec<(IpAddr, String)> {
        self.state().commands.clone()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn response_for(&self, command: &str) -> ScriptedResponse {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(command)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl RemoteShell for ScriptedShell {
    async fn open_session(&self, address: IpAddr, _timeout: Duration) -> Result<Box<dyn Session>> {
        let mut state = self.state();
        state.session_attempts.push(address);
        if state.refusals_left > 0 {
            state.refusals_left -= 1;
            return Err(Error::session_failed(address.to_string(), "connection refused"));
        }
        Ok(Box::new(ScriptedSession {
            shell: self.clone(),
            address,
        }))
    }
}

struct ScriptedSession {
    shell: ScriptedShell,
    address: IpAddr,
}

#[async_trait]
impl Session for ScriptedSession {
    async fn exec(&self, command: &str, buffers: OutputBuffers) -> Result<Box<dyn ExecChannel>> {
        self.shell
            .state()
            .commands
            .push((self.address, command.to_string()));
        Ok(Box::new(ScriptedChannel {
            response: self.shell.response_for(command),
            buffers,
            finished: false,
        }))
    }

    async fn close(&mut self) -> Result<()> {
        self.shell.state().sessions_closed += 1;
        Ok(())
    }
}

struct ScriptedChannel {
    response: ScriptedResponse,
    buffers: OutputBuffers,
    finished: bool,
}

#[async_trait]
impl ExecChannel for ScriptedChannel {
    async fn is_connected(&mut self) -> Result<bool> {
        if self.finished {
            return Ok(false);
        }
        if self.response.polls > 0 {
            self.response.polls -= 1;
            return Ok(true);
        }
        self.buffers.extend_stdout(&self.response.stdout);
        self.buffers.extend_stderr(&self.response.stderr);
        self.finished = true;
        Ok(false)
    }

    fn exit_status(&self) -> Option<i32> {
        if self.finished {
            self.response.exit_code
        } else {
            None
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.finished = true;
        Ok(())
    }
}
