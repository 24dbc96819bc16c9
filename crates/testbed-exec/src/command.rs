//! Command type for building local helper invocations

use async_process::{Command as AsyncCommand, Stdio};
use std::ffi::{OsStr, OsString};

/// A command to be executed locally
///
/// This is a builder that can be converted to `async_process::Command` when
/// needed. Unlike `AsyncCommand`, it is `Clone` and can be inspected, which
/// keeps the argument vectors of the SSH backend testable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// The program to execute
    program: OsString,
    /// The arguments to pass to the program
    args: Vec<OsString>,
}

impl Command {
    /// Create a new command for the given program
    pub fn new<S: AsRef<OsStr>>(program: S) -> Self {
        Self {
            program: program.as_ref().to_owned(),
            args: Vec::new(),
        }
    }

    /// Add an argument to the command
    pub fn arg<S: AsRef<OsStr>>(&mut self, arg: S) -> &mut Self {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    /// Add multiple arguments to the command
    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self.arg(arg);
        }
        self
    }

    /// Get the program name
    pub fn get_program(&self) -> &OsStr {
        &self.program
    }

    /// Get the arguments
    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    /// Prepare this command with stdin detached and stdout/stderr piped
    pub fn prepare_piped(&self) -> AsyncCommand {
        let mut cmd = self.prepare();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    /// Prepare this command with all standard streams detached
    pub fn prepare_detached(&self) -> AsyncCommand {
        let mut cmd = self.prepare();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        cmd
    }

    fn prepare(&self) -> AsyncCommand {
        let mut cmd = AsyncCommand::new(&self.program);
        cmd.args(&self.args);
        cmd.kill_on_drop(true);
        cmd
    }
}
