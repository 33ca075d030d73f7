//! Notification on run completion.
//! The trigger policy is a pure function over the finished run's status and
//! the job's recent history; firing runs the notifier command detached:
//!
//! ```text
//! <command> <status> <job> <run_id> [args...]
//! ```

use std::process::Stdio;

use rota_core::{NotifierSpec, NotifyTrigger};

use crate::history::JobHistory;
use crate::runs::RunStatus;

/// What the trigger policy looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotifyEvent {
    pub status: RunStatus,
    /// Status of the run before this one (`Succeeded` when there is none).
    pub previous: RunStatus,
    /// Failures in a row ending at this run.
    pub consecutive_failures: u32,
    /// Failures in a row ending at the previous run.
    pub prior_failures: u32,
}

impl NotifyEvent {
    /// Build from a history whose latest entry is the finished run.
    pub fn from_history(history: &JobHistory) -> Option<Self> {
        let latest = history.latest()?;
        Some(Self {
            status: latest.status,
            previous: history.previous().map_or(RunStatus::Succeeded, |r| r.status),
            consecutive_failures: history.consecutive_failures(),
            prior_failures: history
                .iter()
                .skip(1)
                .take_while(|r| r.status == RunStatus::Failed)
                .count() as u32,
        })
    }
}

/// Trigger policy.
pub fn should_fire(trigger: NotifyTrigger, event: &NotifyEvent) -> bool {
    match trigger {
        NotifyTrigger::EdgeTrigger => event.status != event.previous,
        NotifyTrigger::Always => true,
        NotifyTrigger::Failures { threshold } => match (event.previous, event.status) {
            (RunStatus::Failed, RunStatus::Succeeded) => event.prior_failures >= threshold,
            (_, RunStatus::Failed) => threshold == 0 || event.consecutive_failures == threshold,
            _ => false,
        },
    }
}

/// Evaluate the policy for a job that just finished a run and fire if it
/// says so. Returns whether the command was launched.
pub fn notify(notifier: &NotifierSpec, job_name: &str, history: &JobHistory) -> bool {
    let Some(event) = NotifyEvent::from_history(history) else {
        return false;
    };
    tracing::debug!(
        job = %job_name,
        "🔔 Notifier '{}': status={} previous={} consecutive_failures={}",
        notifier.name,
        event.status,
        event.previous,
        event.consecutive_failures
    );
    if !should_fire(notifier.trigger, &event) {
        return false;
    }
    let run_id = history.latest().map_or(0, |r| r.run_id);
    fire(notifier, event.status, job_name, run_id)
}

/// Launch the notifier command without waiting for it.
pub fn fire(notifier: &NotifierSpec, status: RunStatus, job_name: &str, run_id: u64) -> bool {
    let mut cmd = tokio::process::Command::new(&notifier.command);
    cmd.arg(status.as_str())
        .arg(job_name)
        .arg(run_id.to_string())
        .args(&notifier.args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    match cmd.spawn() {
        Ok(mut child) => {
            tracing::info!(
                job = %job_name,
                run_id,
                "📣 Firing notifier '{}' ({})",
                notifier.name,
                status
            );
            let name = notifier.name.clone();
            tokio::spawn(async move {
                match child.wait().await {
                    Ok(exit) => tracing::debug!("Notifier '{}' exited: {}", name, exit),
                    Err(e) => tracing::debug!("Notifier '{}' wait failed: {e}", name),
                }
            });
            true
        }
        Err(e) => {
            tracing::warn!(
                job = %job_name,
                "⚠️ Failed to launch notifier '{}' ({}): {e}",
                notifier.name,
                notifier.command.display()
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runs::JobRun;

    fn event(previous: RunStatus, status: RunStatus, consecutive_failures: u32, prior_failures: u32) -> NotifyEvent {
        NotifyEvent {
            status,
            previous,
            consecutive_failures,
            prior_failures,
        }
    }

    fn history(statuses: &[RunStatus]) -> JobHistory {
        // oldest first
        let runs = statuses
            .iter()
            .enumerate()
            .map(|(i, status)| {
                let mut run = JobRun::new("backup", i as u64 + 1, Vec::new());
                run.status = *status;
                run
            })
            .collect();
        JobHistory::from_runs(runs)
    }

    #[test]
    fn test_edge_trigger() {
        let edge = NotifyTrigger::EdgeTrigger;
        assert!(!should_fire(edge, &event(RunStatus::Succeeded, RunStatus::Succeeded, 0, 0)));
        assert!(should_fire(edge, &event(RunStatus::Failed, RunStatus::Succeeded, 0, 1)));
        assert!(should_fire(edge, &event(RunStatus::Succeeded, RunStatus::Failed, 1, 0)));
        assert!(!should_fire(edge, &event(RunStatus::Failed, RunStatus::Failed, 2, 1)));
    }

    #[test]
    fn test_always() {
        assert!(should_fire(NotifyTrigger::Always, &event(RunStatus::Succeeded, RunStatus::Succeeded, 0, 0)));
    }

    #[test]
    fn test_failure_threshold() {
        let three = NotifyTrigger::Failures { threshold: 3 };
        assert!(!should_fire(three, &event(RunStatus::Succeeded, RunStatus::Failed, 1, 0)));
        assert!(!should_fire(three, &event(RunStatus::Failed, RunStatus::Failed, 2, 1)));
        assert!(should_fire(three, &event(RunStatus::Failed, RunStatus::Failed, 3, 2)));
        assert!(!should_fire(three, &event(RunStatus::Failed, RunStatus::Failed, 4, 3)));

        // recovery only after a streak that reached the threshold
        assert!(!should_fire(three, &event(RunStatus::Failed, RunStatus::Succeeded, 0, 2)));
        assert!(should_fire(three, &event(RunStatus::Failed, RunStatus::Succeeded, 0, 3)));
        assert!(!should_fire(three, &event(RunStatus::Succeeded, RunStatus::Succeeded, 0, 0)));
    }

    #[test]
    fn test_zero_threshold_fires_every_failure() {
        let every = NotifyTrigger::Failures { threshold: 0 };
        assert!(should_fire(every, &event(RunStatus::Failed, RunStatus::Failed, 7, 6)));
        assert!(should_fire(every, &event(RunStatus::Failed, RunStatus::Succeeded, 0, 1)));
        assert!(!should_fire(every, &event(RunStatus::Abandoned, RunStatus::Succeeded, 0, 0)));
    }

    #[test]
    fn test_event_from_history() {
        let h = history(&[RunStatus::Succeeded, RunStatus::Failed, RunStatus::Failed, RunStatus::Succeeded]);
        let e = NotifyEvent::from_history(&h).unwrap();
        assert_eq!(e.status, RunStatus::Succeeded);
        assert_eq!(e.previous, RunStatus::Failed);
        assert_eq!(e.consecutive_failures, 0);
        assert_eq!(e.prior_failures, 2);

        let first = NotifyEvent::from_history(&history(&[RunStatus::Failed])).unwrap();
        assert_eq!(first.previous, RunStatus::Succeeded);
        assert_eq!(first.consecutive_failures, 1);

        assert!(NotifyEvent::from_history(&JobHistory::new()).is_none());
    }

    #[tokio::test]
    async fn test_fire_missing_command_is_reported() {
        let spec = NotifierSpec {
            name: "ops".into(),
            command: "/nonexistent/rota-notify".into(),
            args: vec![],
            trigger: NotifyTrigger::Always,
        };
        assert!(!fire(&spec, RunStatus::Failed, "backup", 1));
    }
}
