//! Run records: job run → host run → command run.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status shared by jobs, runs, host runs and command runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunStatus {
    /// Never ran.
    #[default]
    None,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    /// Interrupted by a restart or a reload while running.
    Abandoned,
}

impl RunStatus {
    pub const ALL: [RunStatus; 6] = [
        RunStatus::None,
        RunStatus::Running,
        RunStatus::Succeeded,
        RunStatus::Failed,
        RunStatus::Cancelled,
        RunStatus::Abandoned,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::None => "None",
            RunStatus::Running => "Running",
            RunStatus::Succeeded => "Succeeded",
            RunStatus::Failed => "Failed",
            RunStatus::Cancelled => "Cancelled",
            RunStatus::Abandoned => "Abandoned",
        }
    }

    /// A run in this status will not change again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::None | RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RunStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown run status '{s}'"))
    }
}

/// One command executed on one host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRun {
    pub command: String,
    #[serde(default)]
    pub stdout_path: Option<PathBuf>,
    #[serde(default)]
    pub stderr_path: Option<PathBuf>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub status: RunStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

impl CommandRun {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            stdout_path: None,
            stderr_path: None,
            exit_code: None,
            error: None,
            status: RunStatus::None,
            started_at: None,
            ended_at: None,
        }
    }
}

/// The command list of one run, executed on one host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostRun {
    pub job_name: String,
    pub run_id: u64,
    pub host: String,
    pub host_index: usize,
    pub status: RunStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    pub command_runs: Vec<CommandRun>,
}

impl HostRun {
    pub fn new(job_name: &str, run_id: u64, host: &str, host_index: usize, commands: &[String]) -> Self {
        Self {
            job_name: job_name.to_string(),
            run_id,
            host: host.to_string(),
            host_index,
            status: RunStatus::Running,
            started_at: None,
            ended_at: None,
            command_runs: commands.iter().map(|c| CommandRun::new(c)).collect(),
        }
    }

    /// Final status once every command has terminated.
    pub fn settle(&mut self) {
        self.status = if self.command_runs.iter().any(|c| c.status == RunStatus::Failed) {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        };
        self.ended_at = Some(Utc::now());
    }

    fn abandon(&mut self, now: DateTime<Utc>) {
        if self.status == RunStatus::Running {
            self.status = RunStatus::Abandoned;
            self.ended_at.get_or_insert(now);
        }
        for command in &mut self.command_runs {
            if command.status == RunStatus::Running {
                command.status = RunStatus::Abandoned;
            }
        }
    }
}

/// One execution of a job, across all of its target hosts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRun {
    pub job_name: String,
    pub run_id: u64,
    pub status: RunStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    pub host_runs: Vec<HostRun>,
}

impl JobRun {
    pub fn new(job_name: &str, run_id: u64, host_runs: Vec<HostRun>) -> Self {
        Self {
            job_name: job_name.to_string(),
            run_id,
            status: RunStatus::Running,
            started_at: Some(Utc::now()),
            ended_at: None,
            host_runs,
        }
    }

    /// Recompute the aggregate status from the host runs.
    pub fn refresh_status(&mut self) -> RunStatus {
        let statuses = self.host_runs.iter().map(|h| h.status);
        self.status = if statuses.clone().any(|s| s == RunStatus::Running) {
            RunStatus::Running
        } else if statuses.clone().any(|s| s == RunStatus::Failed) {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        };
        self.status
    }

    /// Mark the run and any host still running as abandoned.
    /// Returns whether anything changed.
    pub fn abandon(&mut self) -> bool {
        if self.status != RunStatus::Running {
            return false;
        }
        let now = Utc::now();
        self.status = RunStatus::Abandoned;
        self.ended_at.get_or_insert(now);
        for host_run in &mut self.host_runs {
            host_run.abandon(now);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commands() -> Vec<String> {
        vec!["uptime".into(), "df -h".into()]
    }

    #[test]
    fn test_status_names() {
        assert_eq!(RunStatus::Abandoned.to_string(), "Abandoned");
        assert_eq!("failed".parse::<RunStatus>().unwrap(), RunStatus::Failed);
        assert!("bogus".parse::<RunStatus>().is_err());
        assert_eq!(serde_json::to_string(&RunStatus::Succeeded).unwrap(), "\"Succeeded\"");
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::None.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_host_run_settle() {
        let mut host_run = HostRun::new("backup", 1, "root@db1:22", 0, &commands());
        assert_eq!(host_run.command_runs.len(), 2);
        assert!(host_run.command_runs.iter().all(|c| c.status == RunStatus::None));

        host_run.command_runs[0].status = RunStatus::Succeeded;
        host_run.command_runs[1].status = RunStatus::Failed;
        host_run.settle();
        assert_eq!(host_run.status, RunStatus::Failed);
        assert!(host_run.ended_at.is_some());
    }

    #[test]
    fn test_job_run_aggregate_status() {
        let hosts = vec![
            HostRun::new("deploy", 3, "web1", 0, &commands()),
            HostRun::new("deploy", 3, "web2", 1, &commands()),
        ];
        let mut run = JobRun::new("deploy", 3, hosts);
        assert_eq!(run.refresh_status(), RunStatus::Running);

        run.host_runs[0].status = RunStatus::Failed;
        assert_eq!(run.refresh_status(), RunStatus::Running);

        run.host_runs[1].status = RunStatus::Succeeded;
        assert_eq!(run.refresh_status(), RunStatus::Failed);

        run.host_runs[0].status = RunStatus::Succeeded;
        assert_eq!(run.refresh_status(), RunStatus::Succeeded);
    }

    #[test]
    fn test_abandon_running_run() {
        let mut run = JobRun::new("deploy", 1, vec![HostRun::new("deploy", 1, "web1", 0, &commands())]);
        run.host_runs[0].command_runs[0].status = RunStatus::Running;
        assert!(run.abandon());
        assert_eq!(run.status, RunStatus::Abandoned);
        assert_eq!(run.host_runs[0].status, RunStatus::Abandoned);
        assert_eq!(run.host_runs[0].command_runs[0].status, RunStatus::Abandoned);
        assert!(!run.abandon());
    }
}
