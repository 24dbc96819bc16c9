//! Captured result of a remote command

use std::sync::{Arc, Mutex, PoisonError};

/// Exit code and captured output of a remote command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshOutput {
    /// Exit code reported by the remote side, `-1` if none was reported
    pub exit_code: i32,
    /// Bytes written to standard output
    pub stdout: Vec<u8>,
    /// Bytes written to standard error
    pub stderr: Vec<u8>,
}

impl SshOutput {
    /// Returns true if the command exited with status 0
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Standard output decoded lossily as UTF-8
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Standard error decoded lossily as UTF-8
    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Shared stdout/stderr sinks attached to an exec channel
///
/// Backends append to the buffers while the command runs; the executor
/// takes their contents once the channel has closed.
#[derive(Debug, Clone, Default)]
pub struct OutputBuffers {
    stdout: Arc<Mutex<Vec<u8>>>,
    stderr: Arc<Mutex<Vec<u8>>>,
}

impl OutputBuffers {
    /// Create empty buffers
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes to standard output
    pub fn extend_stdout(&self, data: &[u8]) {
        self.stdout
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(data);
    }

    /// Append bytes to standard error
    pub fn extend_stderr(&self, data: &[u8]) {
        self.stderr
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(data);
    }

    /// Take the captured bytes, leaving the buffers empty
    pub fn take(&self) -> (Vec<u8>, Vec<u8>) {
        let stdout = std::mem::take(&mut *self.stdout.lock().unwrap_or_else(PoisonError::into_inner));
        let stderr = std::mem::take(&mut *self.stderr.lock().unwrap_or_else(PoisonError::into_inner));
        (stdout, stderr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffers_are_shared_between_clones() {
        let buffers = OutputBuffers::new();
        let writer = buffers.clone();

        writer.extend_stdout(b"hello ");
        writer.extend_stdout(b"world");
        writer.extend_stderr(b"oops");

        let (stdout, stderr) = buffers.take();
        assert_eq!(stdout, b"hello world");
        assert_eq!(stderr, b"oops");

        // Taking drains the buffers
        let (stdout, stderr) = buffers.take();
        assert!(stdout.is_empty());
        assert!(stderr.is_empty());
    }

    #[test]
    fn test_output_success() {
        let output = SshOutput {
            exit_code: 0,
            stdout: b"ok\n".to_vec(),
            stderr: vec![],
        };
        assert!(output.success());
        assert_eq!(output.stdout_lossy(), "ok\n");

        let failed = SshOutput {
            exit_code: 127,
            ..output
        };
        assert!(!failed.success());
    }
}
