//! Commands on the daemon host, through `/bin/bash -c`.

use std::time::Duration;

use async_trait::async_trait;

use super::{
    CommandError, ConnectError, ConnectOptions, OutputSink, RemoteConnection, RemoteRunner, run_process, sudo_wrap,
};

const SHELL: &str = "/bin/bash";

/// Runner for jobs marked `local`. Opening never fails.
#[derive(Debug, Clone, Default)]
pub struct LocalRunner;

impl LocalRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RemoteRunner for LocalRunner {
    async fn open(&self, _host: &str, options: &ConnectOptions) -> Result<Box<dyn RemoteConnection>, ConnectError> {
        Ok(Box::new(LocalConnection {
            sudo_command: options.sudo_command.clone(),
        }))
    }
}

struct LocalConnection {
    sudo_command: String,
}

#[async_trait]
impl RemoteConnection for LocalConnection {
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
        let mut cmd = tokio::process::Command::new(SHELL);
        cmd.arg("-c").arg(line);
        run_process(cmd, run_timeout, stdout, stderr).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run(command: &str, timeout: Duration) -> (Result<(), CommandError>, String, String) {
        let mut conn = LocalRunner::new()
            .open("localhost", &ConnectOptions::default())
            .await
            .unwrap();
        let mut out = Vec::new();
        let mut err = Vec::new();
        let result = conn.run_with_writers(command, timeout, false, &mut out, &mut err).await;
        conn.close().await;
        (
            result,
            String::from_utf8_lossy(&out).into_owned(),
            String::from_utf8_lossy(&err).into_owned(),
        )
    }

    #[tokio::test]
    async fn test_captures_both_streams() {
        let (result, out, err) = run("echo hello; echo oops >&2", Duration::from_secs(10)).await;
        assert!(result.is_ok());
        assert_eq!(out, "hello\n");
        assert_eq!(err, "oops\n");
    }

    #[tokio::test]
    async fn test_exit_code_reported() {
        let (result, _, _) = run("exit 3", Duration::from_secs(10)).await;
        assert_eq!(result, Err(CommandError::Exit { code: 3 }));
    }

    #[tokio::test]
    async fn test_timeout_kills_command() {
        let started = std::time::Instant::now();
        let (result, _, _) = run("sleep 5", Duration::from_millis(200)).await;
        assert!(matches!(result, Err(CommandError::Timeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_sudo_wraps_every_line() {
        let options = ConnectOptions {
            sudo_command: "env ROTA_WRAPPED=yes /bin/bash -c".into(),
            ..ConnectOptions::default()
        };
        let mut conn = LocalRunner::new().open("localhost", &options).await.unwrap();
        let mut out = Vec::new();
        let mut err = Vec::new();
        let result = conn
            .run_with_writers(
                "echo \"$ROTA_WRAPPED\"\necho \"it's $ROTA_WRAPPED\"",
                Duration::from_secs(10),
                true,
                &mut out,
                &mut err,
            )
            .await;
        assert!(result.is_ok());
        assert_eq!(String::from_utf8_lossy(&out), "yes\nit's yes\n");
    }

    #[tokio::test]
    async fn test_zero_timeout_is_unlimited() {
        let (result, out, _) = run("sleep 0.1; echo done", Duration::ZERO).await;
        assert!(result.is_ok());
        assert_eq!(out, "done\n");
    }
}
