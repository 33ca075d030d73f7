//! Run orchestrator: executes one host run as an independent task.
//!
//! The task owns its [`HostRun`] and reports progress by sending snapshots
//! to the scheduler's report channel. It never touches scheduler state.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;

use crate::remote::{ConnectOptions, RemoteConnection, RemoteRunner};
use crate::runs::{HostRun, RunStatus};

/// Everything a host task needs besides its host run.
#[derive(Clone)]
pub struct HostRunContext {
    pub runner: Arc<dyn RemoteRunner>,
    pub options: ConnectOptions,
    pub run_timeout: Duration,
    pub sudo: bool,
    /// Directory of the run: `jobs/<name>/<run_id>`.
    pub run_dir: PathBuf,
    pub reports: mpsc::Sender<HostRun>,
}

/// Connect, run every command in order, report after each step.
pub async fn run_on_host(mut host_run: HostRun, ctx: HostRunContext) {
    host_run.status = RunStatus::Running;
    host_run.started_at = Some(Utc::now());
    tracing::info!(
        job = %host_run.job_name,
        run_id = host_run.run_id,
        "🔌 Opening connection to {} ({}s)",
        host_run.host,
        ctx.options.connect_timeout.as_secs()
    );

    let mut conn = match ctx.runner.open(&host_run.host, &ctx.options).await {
        Ok(conn) => conn,
        Err(e) => {
            tracing::warn!(
                job = %host_run.job_name,
                run_id = host_run.run_id,
                "❌ Unable to connect to {}: {e}",
                host_run.host
            );
            // A failed connection is recorded on the first command.
            if let Some(first) = host_run.command_runs.first_mut() {
                let now = Utc::now();
                first.status = RunStatus::Failed;
                first.error = Some(e.to_string());
                first.started_at = Some(now);
                first.ended_at = Some(now);
            }
            host_run.settle();
            report(&ctx, &host_run).await;
            return;
        }
    };

    for index in 0..host_run.command_runs.len() {
        if !run_command(&mut host_run, index, conn.as_mut(), &ctx).await {
            break;
        }
    }

    conn.close().await;
    host_run.settle();
    tracing::info!(
        job = %host_run.job_name,
        run_id = host_run.run_id,
        "🏁 Host {} finished: {}",
        host_run.host,
        host_run.status
    );
    report(&ctx, &host_run).await;
}

/// Run command `index`. Returns false when the scheduler is gone.
async fn run_command(
    host_run: &mut HostRun,
    index: usize,
    conn: &mut dyn RemoteConnection,
    ctx: &HostRunContext,
) -> bool {
    let dir = ctx
        .run_dir
        .join(host_run.host_index.to_string())
        .join(index.to_string());
    let stdout_path = dir.join("stdout");
    let stderr_path = dir.join("stderr");

    let command = {
        let cmd = &mut host_run.command_runs[index];
        cmd.status = RunStatus::Running;
        cmd.started_at = Some(Utc::now());
        cmd.stdout_path = Some(stdout_path.clone());
        cmd.stderr_path = Some(stderr_path.clone());
        cmd.command.clone()
    };
    tracing::info!(
        job = %host_run.job_name,
        run_id = host_run.run_id,
        "▶️ Running \"{}\" on {}",
        command,
        host_run.host
    );
    if !report(ctx, host_run).await {
        return false;
    }

    let outcome = match open_capture(&dir, &stdout_path, &stderr_path).await {
        Ok((mut out, mut err)) => conn
            .run_with_writers(&command, ctx.run_timeout, ctx.sudo, &mut out, &mut err)
            .await
            .map_err(|e| (e.exit_code(), e.to_string())),
        Err(e) => Err((-1, format!("cannot create output files: {e}"))),
    };

    let cmd = &mut host_run.command_runs[index];
    match outcome {
        Ok(()) => {
            cmd.status = RunStatus::Succeeded;
            cmd.exit_code = Some(0);
        }
        Err((code, error)) => {
            tracing::warn!(
                job = %host_run.job_name,
                run_id = host_run.run_id,
                "⚠️ \"{}\" failed on {}: {}",
                command,
                host_run.host,
                error
            );
            cmd.status = RunStatus::Failed;
            cmd.exit_code = Some(code);
            cmd.error = Some(error);
        }
    }
    cmd.ended_at = Some(Utc::now());
    report(ctx, host_run).await
}

async fn open_capture(
    dir: &Path,
    stdout_path: &Path,
    stderr_path: &Path,
) -> std::io::Result<(tokio::fs::File, tokio::fs::File)> {
    tokio::fs::create_dir_all(dir).await?;
    let out = tokio::fs::File::create(stdout_path).await?;
    let err = tokio::fs::File::create(stderr_path).await?;
    Ok((out, err))
}

async fn report(ctx: &HostRunContext, host_run: &HostRun) -> bool {
    if ctx.reports.send(host_run.clone()).await.is_err() {
        tracing::debug!(
            "Report channel closed, dropping update for {}.{}",
            host_run.job_name,
            host_run.run_id
        );
        return false;
    }
    true
}
