//! Remote hosts through the system OpenSSH client.
//!
//! Every command is a separate `ssh` invocation in batch mode (key
//! authentication only, no prompts). `open` runs a no-op handshake so that
//! unreachable hosts fail at connect time with the connect timeout, the way
//! a persistent session would.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use rota_core::HostSpec;

use super::{
    CommandError, ConnectError, ConnectOptions, OutputSink, RemoteConnection, RemoteRunner, run_process, sudo_wrap,
};

/// Extra time the `open` check gets beyond the TCP connect timeout for the SSH
/// handshake.
const HANDSHAKE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SshRunner {
    program: PathBuf,
}

impl Default for SshRunner {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ssh"),
        }
    }
}

impl SshRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific ssh binary.
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

/// Arguments that select the host and authentication, before the command.
fn base_args(spec: &HostSpec, options: &ConnectOptions) -> Vec<String> {
    let mut args = vec![
        "-T".to_string(),
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        "-o".to_string(),
        "StrictHostKeyChecking=accept-new".to_string(),
        "-o".to_string(),
        format!("ConnectTimeout={}", options.connect_timeout.as_secs().max(1)),
        "-p".to_string(),
        spec.port_or_default().to_string(),
    ];
    if let Some(keyfile) = &options.keyfile {
        args.push("-i".to_string());
        args.push(keyfile.display().to_string());
    }
    if let Some(user) = &spec.user {
        args.push("-l".to_string());
        args.push(user.clone());
    }
    args.push(spec.hostname.clone());
    args
}

#[async_trait]
impl RemoteRunner for SshRunner {
    async fn open(&self, host: &str, options: &ConnectOptions) -> Result<Box<dyn RemoteConnection>, ConnectError> {
        let spec: HostSpec = host.parse().map_err(|e: rota_core::RotaError| ConnectError::BadHost {
            host: host.to_string(),
            reason: e.to_string(),
        })?;
        let args = base_args(&spec, options);

        let mut handshake = tokio::process::Command::new(&self.program);
        handshake
            .args(&args)
            .arg("true")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let limit = options.connect_timeout + HANDSHAKE_GRACE;
        let output = match tokio::time::timeout(limit, handshake.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ConnectError::Failed {
                    host: host.to_string(),
                    reason: format!("cannot run {}: {e}", self.program.display()),
                });
            }
            Err(_) => {
                return Err(ConnectError::Timeout {
                    host: host.to_string(),
                    secs: options.connect_timeout.as_secs(),
                });
            }
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let reason = if stderr.is_empty() {
                format!("ssh exited with {}", output.status)
            } else {
                stderr
            };
            return Err(ConnectError::Failed {
                host: host.to_string(),
                reason,
            });
        }

        tracing::debug!("🔑 Connected to {}", host);
        Ok(Box::new(SshConnection {
            program: self.program.clone(),
            args,
            sudo_command: options.sudo_command.clone(),
        }))
    }
}

struct SshConnection {
    program: PathBuf,
    args: Vec<String>,
    sudo_command: String,
}

#[async_trait]
impl RemoteConnection for SshConnection {
    async fn run_with_writers(
        &mut self,
        command: &str,
        run_timeout: Duration,
        sudo: bool,
        stdout: OutputSink<'_>,
        stderr: OutputSink<'_>,
    ) -> Result<(), CommandError> {
        let line = if sudo {
            sudo_wrap(&self.sudo_command, command)
        } else {
            command.to_string()
        };
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args).arg(line);
        run_process(cmd, run_timeout, stdout, stderr).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_args() {
        let spec: HostSpec = "deploy@web2:2222".parse().unwrap();
        let options = ConnectOptions {
            keyfile: Some(PathBuf::from("/etc/rota/id_ed25519")),
            connect_timeout: Duration::from_secs(7),
            ..ConnectOptions::default()
        };
        let args = base_args(&spec, &options);
        assert!(args.contains(&"ConnectTimeout=7".to_string()));
        assert!(args.windows(2).any(|w| w == ["-p", "2222"]));
        assert!(args.windows(2).any(|w| w == ["-i", "/etc/rota/id_ed25519"]));
        assert!(args.windows(2).any(|w| w == ["-l", "deploy"]));
        assert_eq!(args.last().map(String::as_str), Some("web2"));
    }

    #[tokio::test]
    async fn test_open_fails_without_client() {
        let runner = SshRunner::with_program("/nonexistent/ssh");
        let err = runner.open("root@db1:22", &ConnectOptions::default()).await.err().unwrap();
        assert!(matches!(err, ConnectError::Failed { .. }));
    }

    #[tokio::test]
    async fn test_open_rejects_bad_host() {
        let err = SshRunner::new()
            .open("root@db1:notaport", &ConnectOptions::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ConnectError::BadHost { .. }));
    }
}
