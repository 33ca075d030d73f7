//! Remote execution capability.
//!
//! The scheduler only ever talks to hosts through [`RemoteRunner`] and the
//! [`RemoteConnection`]s it opens: open with a connect timeout, run a
//! command with a run timeout while streaming its output, close. Two
//! implementations ship with Rota: [`SshRunner`] drives the system OpenSSH
//! client and [`LocalRunner`] runs commands on the daemon host.

pub mod local;
pub mod ssh;

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};

pub use local::LocalRunner;
pub use ssh::SshRunner;

/// Writer that receives one captured stream.
pub type OutputSink<'a> = &'a mut (dyn AsyncWrite + Unpin + Send);

/// Per-job connection settings.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub keyfile: Option<PathBuf>,
    pub connect_timeout: Duration,
    /// Prefix used to wrap commands that run with sudo.
    pub sudo_command: String,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            keyfile: None,
            connect_timeout: Duration::from_secs(20),
            sudo_command: "sudo -i /bin/bash -c".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("bad host '{host}': {reason}")]
    BadHost { host: String, reason: String },

    #[error("connection to {host} timed out after {secs}s")]
    Timeout { host: String, secs: u64 },

    #[error("connection to {host} failed: {reason}")]
    Failed { host: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("exited with status {code}")]
    Exit { code: i32 },

    #[error("terminated by signal")]
    Signaled,

    #[error("timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("failed to start: {0}")]
    Spawn(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl CommandError {
    /// Exit code to record on the command run.
    pub fn exit_code(&self) -> i32 {
        match self {
            CommandError::Exit { code } => *code,
            _ => -1,
        }
    }
}

/// Opens connections to hosts.
#[async_trait]
pub trait RemoteRunner: Send + Sync {
    async fn open(&self, host: &str, options: &ConnectOptions) -> Result<Box<dyn RemoteConnection>, ConnectError>;
}

/// An open connection to one host.
#[async_trait]
pub trait RemoteConnection: Send {
    /// Run one command, streaming its output. A zero `run_timeout` means
    /// no limit.
    async fn run_with_writers(
        &mut self,
        command: &str,
        run_timeout: Duration,
        sudo: bool,
        stdout: OutputSink<'_>,
        stderr: OutputSink<'_>,
    ) -> Result<(), CommandError>;

    async fn close(&mut self) {}
}

/// Wrap a command for sudo execution: `<sudo_command> <escaped command>`.
pub fn sudo_wrap(sudo_command: &str, command: &str) -> String {
    format!("{sudo_command} {}", shell_escape(command))
}

/// Quote `s` as one shell word. Newlines stay inside the quotes, so a
/// multi-line command runs entirely under the wrapper.
pub fn shell_escape(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Spawn `cmd`, stream its output into the sinks and wait for it, killing
/// it if `run_timeout` (non-zero) elapses first.
pub(crate) async fn run_process(
    mut cmd: tokio::process::Command,
    run_timeout: Duration,
    stdout: OutputSink<'_>,
    stderr: OutputSink<'_>,
) -> Result<(), CommandError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = cmd.spawn().map_err(|e| CommandError::Spawn(e.to_string()))?;
    let mut child_out = child
        .stdout
        .take()
        .ok_or_else(|| CommandError::Io("stdout not captured".into()))?;
    let mut child_err = child
        .stderr
        .take()
        .ok_or_else(|| CommandError::Io("stderr not captured".into()))?;

    let status = {
        let work = async {
            let (out, err, status) = tokio::join!(
                tokio::io::copy(&mut child_out, &mut *stdout),
                tokio::io::copy(&mut child_err, &mut *stderr),
                child.wait()
            );
            out.map_err(|e| CommandError::Io(e.to_string()))?;
            err.map_err(|e| CommandError::Io(e.to_string()))?;
            let status = status.map_err(|e| CommandError::Io(e.to_string()))?;
            Ok::<ExitStatus, CommandError>(status)
        };
        if run_timeout.is_zero() {
            work.await
        } else {
            match tokio::time::timeout(run_timeout, work).await {
                Ok(result) => result,
                Err(_) => Err(CommandError::Timeout {
                    secs: run_timeout.as_secs(),
                }),
            }
        }
    };

    if matches!(status, Err(CommandError::Timeout { .. })) {
        let _ = child.kill().await;
    }
    // Best effort: output already written stays even if the flush fails.
    let _ = stdout.flush().await;
    let _ = stderr.flush().await;
    check_status(status?)
}

fn check_status(status: ExitStatus) -> Result<(), CommandError> {
    if status.success() {
        return Ok(());
    }
    match status.code() {
        Some(code) => Err(CommandError::Exit { code }),
        None => Err(CommandError::Signaled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_escape() {
        assert_eq!(shell_escape("ls -l /tmp"), "'ls -l /tmp'");
        assert_eq!(shell_escape("echo $HOME"), "'echo $HOME'");
        assert_eq!(shell_escape("a'b\"c"), r#"'a'\''b"c'"#);
        assert_eq!(shell_escape("one\ntwo"), "'one\ntwo'");
    }

    #[test]
    fn test_sudo_wrap() {
        assert_eq!(
            sudo_wrap("sudo -i /bin/bash -c", "whoami && id"),
            "sudo -i /bin/bash -c 'whoami && id'"
        );
    }

    #[test]
    fn test_exit_code() {
        assert_eq!(CommandError::Exit { code: 3 }.exit_code(), 3);
        assert_eq!(CommandError::Timeout { secs: 1 }.exit_code(), -1);
    }
}
