//! Scheduler engine: the single actor that owns the job table.
//!
//! [`Scheduler::run`] multiplexes a fixed-period tick, control requests from
//! [`SchedulerHandle`]s and host-run reports from orchestrator tasks. Every
//! mutation of job state happens on this loop; host tasks only send owned
//! snapshots back.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, TimeZone, Utc};
use rota_core::{Config, JobSpec, JobTarget, Result, RotaError};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::cron::Recurrence;
use crate::executor::{HostRunContext, run_on_host};
use crate::job::{Absorb, Finished, Job, StartOutcome};
use crate::notify;
use crate::remote::{ConnectOptions, LocalRunner, RemoteRunner, SshRunner};
use crate::runs::{HostRun, JobRun, RunStatus};
use crate::store::{RunStore, RunWriter};

const REPORT_CHANNEL_CAPACITY: usize = 256;
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// Remote runners used for host and pool jobs (`ssh`) and local jobs.
#[derive(Clone)]
pub struct Runners {
    pub ssh: Arc<dyn RemoteRunner>,
    pub local: Arc<dyn RemoteRunner>,
}

impl Default for Runners {
    fn default() -> Self {
        Self {
            ssh: Arc::new(SshRunner::new()),
            local: Arc::new(LocalRunner::new()),
        }
    }
}

/// Read-only questions for the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusQuery {
    Jobs,
    Job(String),
    Run(String, u64),
}

#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub name: String,
    pub description: String,
    pub status: RunStatus,
    pub running: bool,
    pub run_id: u64,
    pub runs_queued: u64,
    pub schedule: String,
    pub target: String,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobDetail {
    #[serde(flatten)]
    pub summary: JobSummary,
    pub spec: JobSpec,
    pub pool_hosts: Vec<String>,
    pub current: Option<JobRun>,
    /// Finished runs, most recent first.
    pub runs: Vec<JobRun>,
}

#[derive(Debug, Clone)]
pub enum StatusResponse {
    NotFound(String),
    Jobs(Vec<JobSummary>),
    Job(Box<JobDetail>),
    Run(JobRun),
}

/// What a run-now request did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Started { run_id: u64 },
    Busy { queued: u64 },
    NoTargets,
}

/// Job names touched by a reload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReloadSummary {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
}

/// Control messages, each with its reply channel.
#[derive(Debug)]
pub enum Request {
    Status {
        query: StatusQuery,
        reply: oneshot::Sender<StatusResponse>,
    },
    LoadConfig {
        path: PathBuf,
        reply: oneshot::Sender<Result<ReloadSummary>>,
    },
    RunJob {
        name: String,
        reply: oneshot::Sender<Result<RunOutcome>>,
    },
    ForceStatus {
        name: String,
        status: RunStatus,
        reply: oneshot::Sender<Result<()>>,
    },
    UpdatePool {
        name: String,
        hosts: Vec<String>,
        reply: oneshot::Sender<Result<Vec<String>>>,
    },
}

/// Check every job's recurrence. All problems are reported together.
pub fn validate_config(config: &Config) -> Result<BTreeMap<String, Recurrence>> {
    let mut recurrences = BTreeMap::new();
    let mut problems = Vec::new();
    for (name, spec) in &config.jobs {
        match Recurrence::parse(spec.recurrence_expr()) {
            Ok(recurrence) => {
                recurrences.insert(name.clone(), recurrence);
            }
            Err(e) => problems.push(format!("job '{name}': {e}")),
        }
    }
    if problems.is_empty() {
        Ok(recurrences)
    } else {
        Err(RotaError::Config(problems.join("; ")))
    }
}

fn describe_target(target: &JobTarget) -> String {
    match target {
        JobTarget::Host { host } => format!("host {host}"),
        JobTarget::Pool { pool, mode } => format!("pool {pool} ({mode})"),
        JobTarget::Local => "local".to_string(),
    }
}

/// The scheduler actor.
pub struct Scheduler {
    config: Config,
    jobs: BTreeMap<String, Job>,
    /// Host lists of dynamic pools, set through the control API.
    dynamic_pools: BTreeMap<String, Vec<String>>,
    store: RunStore,
    runners: Runners,
    reports_tx: mpsc::Sender<HostRun>,
    reports_rx: mpsc::Receiver<HostRun>,
    /// Background run-record writer, present while [`Scheduler::run`] is active.
    writer: Option<RunWriter>,
    tick_interval: Duration,
}

impl Scheduler {
    pub fn new(store: RunStore, runners: Runners) -> Self {
        let (reports_tx, reports_rx) = mpsc::channel(REPORT_CHANNEL_CAPACITY);
        Self {
            config: Config::default(),
            jobs: BTreeMap::new(),
            dynamic_pools: BTreeMap::new(),
            store,
            runners,
            reports_tx,
            reports_rx,
            writer: None,
            tick_interval: Duration::from_secs(10),
        }
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval.max(Duration::from_millis(10));
        self
    }

    pub fn store(&self) -> &RunStore {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn job(&self, name: &str) -> Option<&Job> {
        self.jobs.get(name)
    }

    /// Bring back the last-known-good config and persisted jobs. Runs that
    /// were in flight when the daemon stopped come back `Abandoned`.
    pub fn restore(&mut self) -> Result<()> {
        if let Some(snapshot) = self.store.load_config_snapshot()? {
            self.dynamic_pools = snapshot
                .pools
                .values()
                .filter(|p| p.dynamic)
                .map(|p| (p.name.clone(), p.hosts.clone()))
                .collect();
            self.config = snapshot;
        }

        for job in self.store.load_jobs() {
            let name = job.name().to_string();
            self.jobs.insert(name, job);
        }
        let names: Vec<String> = self.jobs.keys().cloned().collect();
        for name in names {
            let hosts = self.pool_hosts_for(&name);
            if let Some(job) = self.jobs.get_mut(&name) {
                job.set_pool_hosts(hosts);
                if let Err(e) = self.store.save_job(job) {
                    tracing::warn!(job = %name, "⚠️ Failed to save restored job: {e}");
                }
            }
        }
        tracing::info!("♻️ Restored {} jobs from {}", self.jobs.len(), self.store.root().display());
        Ok(())
    }

    /// Parse a config file and apply it. On error nothing changes.
    pub fn load_config_file(&mut self, path: &Path) -> Result<ReloadSummary> {
        let config = Config::load_from(path)?;
        self.apply_config(config)
    }

    /// Swap in a new job table built from `config`.
    pub fn apply_config(&mut self, config: Config) -> Result<ReloadSummary> {
        let mut recurrences = validate_config(&config)?;

        let dynamic_pools: BTreeMap<String, Vec<String>> = config
            .pools
            .values()
            .filter(|p| p.dynamic)
            .map(|p| {
                let hosts = self
                    .dynamic_pools
                    .get(&p.name)
                    .cloned()
                    .unwrap_or_else(|| p.hosts.clone());
                (p.name.clone(), hosts)
            })
            .collect();
        self.dynamic_pools = dynamic_pools;

        let mut old = std::mem::take(&mut self.jobs);
        let mut table = BTreeMap::new();
        let mut summary = ReloadSummary::default();

        for (name, spec) in &config.jobs {
            let recurrence = recurrences.remove(name).unwrap_or_default();
            let mut job = match old.remove(name) {
                Some(mut job) => {
                    if let Some(abandoned) = job.update(spec.clone(), recurrence) {
                        tracing::warn!(job = %name, run_id = abandoned.run.run_id, "👻 Reload abandoned in-flight run");
                        self.persist_finished(&abandoned);
                    }
                    summary.updated.push(name.clone());
                    job
                }
                None => {
                    tracing::info!(job = %name, "📅 Job added: {}", spec.recurrence_expr());
                    summary.added.push(name.clone());
                    Job::new(spec.clone(), recurrence)
                }
            };
            job.set_pool_hosts(self.pool_hosts_in(&config, spec));
            if let Err(e) = self.store.save_job(&job) {
                tracing::warn!(job = %name, "⚠️ Failed to save job: {e}");
            }
            table.insert(name.clone(), job);
        }

        for name in old.into_keys() {
            tracing::info!(job = %name, "🗑️ Job removed");
            if let Err(e) = self.store.remove_job(&name) {
                tracing::warn!(job = %name, "⚠️ Failed to remove job state: {e}");
            }
            summary.removed.push(name);
        }

        self.jobs = table;
        self.config = config;
        self.save_snapshot();
        tracing::info!(
            "🔄 Config applied: {} added, {} updated, {} removed",
            summary.added.len(),
            summary.updated.len(),
            summary.removed.len()
        );
        Ok(summary)
    }

    /// Start every job flagged `run_on_start`.
    pub fn start_boot_jobs(&mut self) {
        let names: Vec<String> = self
            .jobs
            .values()
            .filter(|j| j.spec.run_on_start)
            .map(|j| j.name().to_string())
            .collect();
        for name in names {
            tracing::info!(job = %name, "🚀 Run on start");
            if let Err(e) = self.start_job(&name) {
                tracing::warn!(job = %name, "⚠️ Run on start failed: {e}");
            }
        }
    }

    /// Start every job that is due at `now`.
    pub fn tick<Tz: TimeZone>(&mut self, now: &DateTime<Tz>) {
        let due: Vec<String> = self
            .jobs
            .values_mut()
            .filter_map(|job| job.is_due(now).then(|| job.name().to_string()))
            .collect();
        for name in due {
            tracing::debug!(job = %name, "⏰ Job due");
            if let Err(e) = self.start_job(&name) {
                tracing::warn!(job = %name, "⚠️ Failed to start job: {e}");
            }
        }
    }

    /// Start a run of `name` now, unless it is already running.
    pub fn start_job(&mut self, name: &str) -> Result<RunOutcome> {
        let job = self
            .jobs
            .get_mut(name)
            .ok_or_else(|| RotaError::JobNotFound { name: name.to_string() })?;

        let run = match job.begin_run() {
            StartOutcome::Busy { queued } => {
                tracing::info!(job = %name, queued, "⏳ Job still running, not starting another run");
                return Ok(RunOutcome::Busy { queued });
            }
            StartOutcome::NoTargets => {
                tracing::debug!(job = %name, "Pool is empty, skipping run");
                return Ok(RunOutcome::NoTargets);
            }
            StartOutcome::Started(run) => run,
        };

        // Skeleton run and job state are queued before any host task starts.
        persist_run(&self.store, self.writer.as_ref(), &run);
        if let Err(e) = self.store.save_job(job) {
            tracing::warn!(job = %name, "⚠️ Failed to save job: {e}");
        }

        let spec = &job.spec;
        let runner = match spec.target {
            JobTarget::Local => Arc::clone(&self.runners.local),
            _ => Arc::clone(&self.runners.ssh),
        };
        let ctx = HostRunContext {
            runner,
            options: ConnectOptions {
                keyfile: spec.keyfile.clone(),
                connect_timeout: spec.connect_timeout(),
                sudo_command: spec.sudo_command.clone(),
            },
            run_timeout: spec.run_timeout(),
            sudo: spec.sudo,
            run_dir: self.store.run_dir(name, run.run_id),
            reports: self.reports_tx.clone(),
        };

        tracing::info!(
            job = %name,
            run_id = run.run_id,
            "🔔 Starting run on {} host(s)",
            run.host_runs.len()
        );
        for host_run in run.host_runs {
            tokio::spawn(run_on_host(host_run, ctx.clone()));
        }
        Ok(RunOutcome::Started { run_id: run.run_id })
    }

    /// Route a host-run snapshot to its job.
    pub fn handle_report(&mut self, report: HostRun) {
        let name = report.job_name.clone();
        let Some(job) = self.jobs.get_mut(&name) else {
            tracing::debug!(job = %name, "Report for unknown job dropped");
            return;
        };
        match job.absorb_report(report) {
            Absorb::Stale => tracing::debug!(job = %name, "Stale report dropped"),
            Absorb::Progress(run) => persist_run(&self.store, self.writer.as_ref(), &run),
            Absorb::Completed(finished) => {
                tracing::info!(
                    job = %name,
                    run_id = finished.run.run_id,
                    "✅ Run completed: {}",
                    finished.run.status
                );
                self.persist_finished(&finished);
                if let Some(job) = self.jobs.get(&name) {
                    if let Err(e) = self.store.save_job(job) {
                        tracing::warn!(job = %name, "⚠️ Failed to save job: {e}");
                    }
                    self.notify(job);
                }
            }
        }
    }

    fn persist_finished(&self, finished: &Finished) {
        persist_run(&self.store, self.writer.as_ref(), &finished.run);
        for old in &finished.evicted {
            let queued = self.writer.as_ref().is_some_and(|w| w.remove(&old.job_name, old.run_id));
            if !queued {
                self.store.remove_run_async(&old.job_name, old.run_id);
            }
        }
    }

    fn notify(&self, job: &Job) {
        let Some(name) = &job.spec.notifier else {
            return;
        };
        match self.config.notifiers.get(name) {
            Some(notifier) => {
                notify::notify(notifier, job.name(), job.history());
            }
            None => tracing::warn!(job = %job.name(), "⚠️ Notifier '{}' is not configured", name),
        }
    }

    /// Replace the host list of a dynamic pool.
    pub fn update_pool(&mut self, name: &str, hosts: Vec<String>) -> Result<Vec<String>> {
        let pool = self
            .config
            .pools
            .get(name)
            .ok_or_else(|| RotaError::PoolNotFound { name: name.to_string() })?;
        if !pool.dynamic {
            return Err(RotaError::Config(format!("pool '{name}' is not dynamic")));
        }
        let qualified = hosts
            .iter()
            .map(|h| h.trim())
            .filter(|h| !h.is_empty())
            .map(|h| self.config.qualify_host(h))
            .collect::<Result<Vec<_>>>()?;

        self.dynamic_pools.insert(name.to_string(), qualified.clone());
        for job in self.jobs.values_mut() {
            if job.spec.pool_name() == Some(name) {
                job.set_pool_hosts(qualified.clone());
                job.allocator.reset();
                if let Err(e) = self.store.save_job(job) {
                    tracing::warn!(job = %job.name(), "⚠️ Failed to save job: {e}");
                }
            }
        }
        self.save_snapshot();
        tracing::info!("🖥️ Pool '{}' updated: {} hosts", name, qualified.len());
        Ok(qualified)
    }

    /// Overwrite a job's status. Does not touch an in-flight run.
    pub fn force_status(&mut self, name: &str, status: RunStatus) -> Result<()> {
        let job = self
            .jobs
            .get_mut(name)
            .ok_or_else(|| RotaError::JobNotFound { name: name.to_string() })?;
        job.force_status(status);
        tracing::info!(job = %name, "✏️ Status forced to {}", status);
        self.store.save_job(job)
    }

    pub fn status(&self, query: &StatusQuery) -> StatusResponse {
        match query {
            StatusQuery::Jobs => StatusResponse::Jobs(self.jobs.values().map(summarize).collect()),
            StatusQuery::Job(name) => match self.jobs.get(name) {
                Some(job) => StatusResponse::Job(Box::new(JobDetail {
                    summary: summarize(job),
                    spec: job.spec.clone(),
                    pool_hosts: job.pool_hosts().to_vec(),
                    current: job.current().cloned(),
                    runs: job.history().iter().cloned().collect(),
                })),
                None => StatusResponse::NotFound(format!("job '{name}' not found")),
            },
            StatusQuery::Run(name, run_id) => match self.jobs.get(name) {
                Some(job) => match job.run(*run_id) {
                    Some(run) => StatusResponse::Run(run.clone()),
                    None => StatusResponse::NotFound(format!("run {name}.{run_id} not found")),
                },
                None => StatusResponse::NotFound(format!("job '{name}' not found")),
            },
        }
    }

    pub fn handle_request(&mut self, request: Request) {
        match request {
            Request::Status { query, reply } => {
                let _ = reply.send(self.status(&query));
            }
            Request::LoadConfig { path, reply } => {
                let result = self.load_config_file(&path);
                if let Err(e) = &result {
                    tracing::error!("❌ Reload of {} failed: {e}", path.display());
                }
                let _ = reply.send(result);
            }
            Request::RunJob { name, reply } => {
                let _ = reply.send(self.start_job(&name));
            }
            Request::ForceStatus { name, status, reply } => {
                let _ = reply.send(self.force_status(&name, status));
            }
            Request::UpdatePool { name, hosts, reply } => {
                let _ = reply.send(self.update_pool(&name, hosts));
            }
        }
    }

    /// Event loop. Returns when shutdown is signalled or every handle is
    /// dropped.
    pub async fn run(mut self, mut requests: mpsc::Receiver<Request>, mut shutdown: watch::Receiver<bool>) {
        let (writer, writer_task) = self.store.spawn_writer();
        self.writer = Some(writer);
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            "⏰ Scheduler started ({} jobs, tick {}s)",
            self.jobs.len(),
            self.tick_interval.as_secs_f32()
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick(&Local::now()),
                Some(report) = self.reports_rx.recv() => self.handle_report(report),
                request = requests.recv() => match request {
                    Some(request) => self.handle_request(request),
                    None => {
                        tracing::info!("Scheduler handles dropped, stopping");
                        break;
                    }
                },
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        tracing::info!("🛑 Scheduler shutting down");
                        break;
                    }
                }
            }
        }

        // Drain queued run writes before returning.
        self.writer = None;
        if let Err(e) = writer_task.await {
            tracing::warn!("⚠️ Run writer did not finish: {e}");
        }
    }

    /// Run the loop on the runtime and return a handle to it.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> (SchedulerHandle, JoinHandle<()>) {
        let (handle, requests) = SchedulerHandle::channel();
        let task = tokio::spawn(self.run(requests, shutdown));
        (handle, task)
    }

    fn pool_hosts_for(&self, name: &str) -> Vec<String> {
        match self.jobs.get(name) {
            Some(job) => self.pool_hosts_in(&self.config, &job.spec),
            None => Vec::new(),
        }
    }

    fn pool_hosts_in(&self, config: &Config, spec: &JobSpec) -> Vec<String> {
        let Some(pool) = spec.pool_name() else {
            return Vec::new();
        };
        if let Some(hosts) = self.dynamic_pools.get(pool) {
            return hosts.clone();
        }
        config.pools.get(pool).map(|p| p.hosts.clone()).unwrap_or_default()
    }

    /// Resolved config with current dynamic pool hosts.
    pub fn snapshot_config(&self) -> Config {
        let mut config = self.config.clone();
        for (name, hosts) in &self.dynamic_pools {
            if let Some(pool) = config.pools.get_mut(name) {
                pool.hosts = hosts.clone();
            }
        }
        config
    }

    fn save_snapshot(&self) {
        if let Err(e) = self.store.save_config_snapshot(&self.snapshot_config()) {
            tracing::warn!("⚠️ Failed to save config snapshot: {e}");
        }
    }
}

/// Save a run record through the writer when it is running, else in place.
fn persist_run(store: &RunStore, writer: Option<&RunWriter>, run: &JobRun) {
    if writer.is_some_and(|w| w.save(run.clone())) {
        return;
    }
    if let Err(e) = store.save_run(run) {
        tracing::warn!(job = %run.job_name, run_id = run.run_id, "⚠️ Failed to save run: {e}");
    }
}

fn summarize(job: &Job) -> JobSummary {
    let now = Local::now();
    JobSummary {
        name: job.name().to_string(),
        description: job.spec.description.clone(),
        status: job.status,
        running: job.is_running(),
        run_id: job.run_id,
        runs_queued: job.runs_queued,
        schedule: job.spec.recurrence_expr().to_string(),
        target: describe_target(&job.spec.target),
        started_at: job.started_at,
        ended_at: job.ended_at,
        next_run: job.next_run(&now).map(|t| t.with_timezone(&Utc)),
    }
}

/// Cloneable async client of the scheduler loop.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<Request>,
}

impl SchedulerHandle {
    /// A handle and the request receiver to pass to [`Scheduler::run`].
    pub fn channel() -> (Self, mpsc::Receiver<Request>) {
        let (tx, rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        (Self { tx }, rx)
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Request) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| RotaError::Unavailable("scheduler loop has stopped".into()))?;
        rx.await
            .map_err(|_| RotaError::Unavailable("scheduler dropped the request".into()))
    }

    pub async fn status(&self, query: StatusQuery) -> Result<StatusResponse> {
        self.call(|reply| Request::Status { query, reply }).await
    }

    pub async fn load_config(&self, path: impl Into<PathBuf>) -> Result<ReloadSummary> {
        let path = path.into();
        self.call(|reply| Request::LoadConfig { path, reply }).await?
    }

    pub async fn run_job(&self, name: &str) -> Result<RunOutcome> {
        let name = name.to_string();
        self.call(|reply| Request::RunJob { name, reply }).await?
    }

    pub async fn force_status(&self, name: &str, status: RunStatus) -> Result<()> {
        let name = name.to_string();
        self.call(|reply| Request::ForceStatus { name, status, reply }).await?
    }

    pub async fn update_pool(&self, name: &str, hosts: Vec<String>) -> Result<Vec<String>> {
        let name = name.to_string();
        self.call(|reply| Request::UpdatePool { name, hosts, reply }).await?
    }
}
