//! Job state machine.
//!
//! A [`Job`] pairs a [`JobSpec`] with everything the scheduler learns while
//! running it: the run counter, the allocator cursor, the in-flight run and
//! the bounded history of finished runs. The in-flight run is kept apart
//! from the history until it reaches a terminal status.

use chrono::{DateTime, NaiveDateTime, TimeZone, Timelike, Utc};
use rota_core::JobSpec;
use serde::{Deserialize, Serialize};

use crate::cron::Recurrence;
use crate::history::JobHistory;
use crate::pool::HostAllocator;
use crate::runs::{HostRun, JobRun, RunStatus};

/// Persisted job state plus runtime-only fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub spec: JobSpec,
    #[serde(default)]
    pub run_id: u64,
    #[serde(default)]
    pub runs_queued: u64,
    #[serde(default)]
    pub status: RunStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub allocator: HostAllocator,

    #[serde(skip)]
    recurrence: Recurrence,
    #[serde(skip)]
    pool_hosts: Vec<String>,
    #[serde(skip)]
    current: Option<JobRun>,
    #[serde(skip)]
    history: JobHistory,
    /// Local minute of the last due check.
    #[serde(skip)]
    last_checked: Option<NaiveDateTime>,
}

/// Result of asking a job to start a run.
#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    /// A run is already in flight; the request was counted and dropped.
    Busy { queued: u64 },
    /// The target resolved to no hosts (empty pool).
    NoTargets,
    /// A new run skeleton, ready to persist and dispatch.
    Started(JobRun),
}

/// A run that left the in-flight slot and entered history.
#[derive(Debug, Clone, PartialEq)]
pub struct Finished {
    pub run: JobRun,
    /// Runs pushed out of history by this one.
    pub evicted: Vec<JobRun>,
}

/// Result of applying a host report.
#[derive(Debug, Clone, PartialEq)]
pub enum Absorb {
    /// Report for a run or host that is not in flight.
    Stale,
    /// The run is still going; carries the updated run.
    Progress(JobRun),
    Completed(Finished),
}

impl Job {
    pub fn new(spec: JobSpec, recurrence: Recurrence) -> Self {
        Self {
            spec,
            run_id: 0,
            runs_queued: 0,
            status: RunStatus::None,
            started_at: None,
            ended_at: None,
            allocator: HostAllocator::default(),
            recurrence,
            pool_hosts: Vec::new(),
            current: None,
            history: JobHistory::new(),
            last_checked: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn recurrence(&self) -> &Recurrence {
        &self.recurrence
    }

    pub fn history(&self) -> &JobHistory {
        &self.history
    }

    pub fn current(&self) -> Option<&JobRun> {
        self.current.as_ref()
    }

    pub fn pool_hosts(&self) -> &[String] {
        &self.pool_hosts
    }

    pub fn is_running(&self) -> bool {
        self.current.is_some()
    }

    /// The in-flight run if it matches `run_id`, else the history entry.
    pub fn run(&self, run_id: u64) -> Option<&JobRun> {
        self.current
            .as_ref()
            .filter(|r| r.run_id == run_id)
            .or_else(|| self.history.get(run_id))
    }

    /// Attach state recovered from disk. `recurrence` is re-derived from the
    /// spec by the caller.
    pub fn restore(&mut self, recurrence: Recurrence, history: JobHistory) {
        self.recurrence = recurrence;
        self.history = history;
        self.current = None;
        self.last_checked = None;
        if self.status == RunStatus::Running {
            self.status = RunStatus::Abandoned;
        }
    }

    pub fn set_pool_hosts(&mut self, hosts: Vec<String>) {
        self.pool_hosts = hosts;
    }

    /// Replace this job's spec in place. An in-flight run is abandoned and moved to
    /// history; reports from it will be treated as stale.
    pub fn update(&mut self, spec: JobSpec, recurrence: Recurrence) -> Option<Finished> {
        self.spec = spec;
        self.recurrence = recurrence;
        self.allocator.reset();
        // A new spec gets a fresh due check, so a reload inside a matching
        // minute can start the job a second time in that minute.
        self.last_checked = None;

        let mut run = self.current.take()?;
        run.abandon();
        self.status = RunStatus::Abandoned;
        self.ended_at = run.ended_at;
        Some(self.finish(run))
    }

    /// True at most once per calendar minute, when the recurrence matches.
    pub fn is_due<Tz: TimeZone>(&mut self, now: &DateTime<Tz>) -> bool {
        let naive = now.naive_local();
        let Some(minute) = naive.date().and_hms_opt(naive.hour(), naive.minute(), 0) else {
            return false;
        };
        if self.last_checked.is_some_and(|last| minute <= last) {
            return false;
        }
        self.last_checked = Some(minute);
        self.recurrence.matches(now)
    }

    pub fn next_run<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        self.recurrence.next_after(now)
    }

    /// Start a run unless one is in flight or there is nowhere to run it.
    pub fn begin_run(&mut self) -> StartOutcome {
        if self.current.is_some() {
            self.runs_queued += 1;
            return StartOutcome::Busy {
                queued: self.runs_queued,
            };
        }

        let targets = self.allocator.resolve(&self.spec.target, &self.pool_hosts);
        if targets.is_empty() {
            return StartOutcome::NoTargets;
        }

        self.run_id += 1;
        let host_runs = targets
            .iter()
            .map(|t| HostRun::new(&self.spec.name, self.run_id, &t.host, t.host_index, &self.spec.command))
            .collect();
        let run = JobRun::new(&self.spec.name, self.run_id, host_runs);

        self.status = RunStatus::Running;
        self.started_at = run.started_at;
        self.ended_at = None;
        self.current = Some(run.clone());
        StartOutcome::Started(run)
    }

    /// Fold a host snapshot into the in-flight run.
    pub fn absorb_report(&mut self, report: HostRun) -> Absorb {
        let Some(run) = self.current.as_mut() else {
            return Absorb::Stale;
        };
        if report.run_id != run.run_id || report.job_name != run.job_name {
            return Absorb::Stale;
        }
        let Some(slot) = run
            .host_runs
            .iter_mut()
            .find(|h| h.host_index == report.host_index)
        else {
            return Absorb::Stale;
        };
        *slot = report;

        if run.refresh_status() == RunStatus::Running {
            return Absorb::Progress(run.clone());
        }

        let Some(mut run) = self.current.take() else {
            return Absorb::Stale;
        };
        let now = Utc::now();
        run.ended_at = Some(now);
        self.status = run.status;
        self.ended_at = Some(now);
        Absorb::Completed(self.finish(run))
    }

    /// Override the job status without touching any run.
    pub fn force_status(&mut self, status: RunStatus) {
        self.status = status;
    }

    fn finish(&mut self, run: JobRun) -> Finished {
        self.history.push_front(run.clone());
        let evicted = self.history.prune(self.spec.max_run_history);
        Finished { run, evicted }
    }
}
