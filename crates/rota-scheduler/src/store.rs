//! File-based run store.
//! Job state and run records are JSON files under the run directory;
//! captured command output sits next to the run record it belongs to.
//!
//! ```text
//! <run_dir>/
//!   config.json                       last-known-good resolved config
//!   pid, endpoint
//!   jobs/<name>.json                  job state
//!   jobs/<name>/<run_id>/run.json     run record
//!   jobs/<name>/<run_id>/<host_index>/<command_index>/{stdout,stderr}
//! ```

use std::path::{Path, PathBuf};

use rota_core::{Config, Result, RotaError};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::cron::Recurrence;
use crate::history::JobHistory;
use crate::job::Job;
use crate::runs::JobRun;

/// Which captured stream of a command run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn file_name(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "stdout" => Some(OutputStream::Stdout),
            "stderr" => Some(OutputStream::Stderr),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunStore {
    root: PathBuf,
}

impl RunStore {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.root.join("jobs")
    }

    pub fn job_file(&self, job: &str) -> PathBuf {
        self.jobs_dir().join(format!("{job}.json"))
    }

    pub fn job_dir(&self, job: &str) -> PathBuf {
        self.jobs_dir().join(job)
    }

    pub fn run_dir(&self, job: &str, run_id: u64) -> PathBuf {
        self.job_dir(job).join(run_id.to_string())
    }

    pub fn run_file(&self, job: &str, run_id: u64) -> PathBuf {
        self.run_dir(job, run_id).join("run.json")
    }

    pub fn output_file(
        &self,
        job: &str,
        run_id: u64,
        host_index: usize,
        command_index: usize,
        stream: OutputStream,
    ) -> PathBuf {
        self.run_dir(job, run_id)
            .join(host_index.to_string())
            .join(command_index.to_string())
            .join(stream.file_name())
    }

    pub fn config_snapshot_file(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.root.join("pid")
    }

    pub fn endpoint_file(&self) -> PathBuf {
        self.root.join("endpoint")
    }

    /// Persist job state (not its history).
    pub fn save_job(&self, job: &Job) -> Result<()> {
        write_json(&self.job_file(job.name()), job)?;
        tracing::debug!("💾 Saved job '{}' (run {})", job.name(), job.run_id);
        Ok(())
    }

    pub fn save_run(&self, run: &JobRun) -> Result<()> {
        write_json(&self.run_file(&run.job_name, run.run_id), run)
    }

    /// Load one job with its history. Runs outside the retention window are
    /// deleted in the background; runs that were in flight become
    /// `Abandoned` and are written back.
    pub fn load_job(&self, name: &str) -> Result<Job> {
        let mut job: Job = read_json(&self.job_file(name))?;
        let recurrence = Recurrence::parse(job.spec.recurrence_expr())
            .map_err(|e| RotaError::Config(format!("job '{name}': {e}")))?;

        let newest = job.run_id;
        let oldest_kept = newest.saturating_sub(job.spec.max_run_history as u64);
        let mut runs = Vec::new();

        let entries = match std::fs::read_dir(self.job_dir(name)) {
            Ok(entries) => entries.flatten().collect::<Vec<_>>(),
            Err(_) => Vec::new(),
        };
        for entry in entries {
            let Some(run_id) = entry.file_name().to_str().and_then(|s| s.parse::<u64>().ok()) else {
                continue;
            };
            if run_id <= oldest_kept || run_id > newest {
                remove_dir_async(entry.path());
                continue;
            }
            let file = entry.path().join("run.json");
            match read_json::<JobRun>(&file) {
                Ok(mut run) => {
                    if run.abandon() {
                        tracing::info!("👻 Run {}.{} was in flight at shutdown, marking abandoned", name, run_id);
                        if let Err(e) = self.save_run(&run) {
                            tracing::warn!("⚠️ Failed to rewrite {}: {e}", file.display());
                        }
                    }
                    runs.push(run);
                }
                Err(e) => tracing::warn!("⚠️ Skipping unreadable run {}: {e}", file.display()),
            }
        }

        job.restore(recurrence, JobHistory::from_runs(runs));
        Ok(job)
    }

    /// Load every persisted job. Unreadable jobs are logged and skipped.
    pub fn load_jobs(&self) -> Vec<Job> {
        let entries = match std::fs::read_dir(self.jobs_dir()) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };
        let mut jobs = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.load_job(name) {
                Ok(job) => jobs.push(job),
                Err(e) => tracing::warn!("⚠️ Failed to load job '{}': {e}", name),
            }
        }
        jobs.sort_by(|a, b| a.name().cmp(b.name()));
        jobs
    }

    /// Delete a job's state file and, in the background, its run directories.
    pub fn remove_job(&self, name: &str) -> Result<()> {
        match std::fs::remove_file(self.job_file(name)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(RotaError::Persistence(format!("remove job '{name}': {e}"))),
        }
        remove_dir_async(self.job_dir(name));
        Ok(())
    }

    /// Delete a run directory without waiting for it.
    pub fn remove_run_async(&self, job: &str, run_id: u64) {
        remove_dir_async(self.run_dir(job, run_id));
    }

    pub fn save_config_snapshot(&self, config: &Config) -> Result<()> {
        write_json(&self.config_snapshot_file(), config)
    }

    /// The last saved config, if any.
    pub fn load_config_snapshot(&self) -> Result<Option<Config>> {
        let path = self.config_snapshot_file();
        if !path.exists() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }

    pub fn write_pid(&self, pid: u32) -> Result<()> {
        write_text(&self.pid_file(), &pid.to_string())
    }

    pub fn write_endpoint(&self, endpoint: &str) -> Result<()> {
        write_text(&self.endpoint_file(), endpoint)
    }

    pub fn read_endpoint(&self) -> Result<String> {
        let path = self.endpoint_file();
        std::fs::read_to_string(&path)
            .map(|s| s.trim().to_string())
            .map_err(|e| RotaError::Persistence(format!("read {}: {e}", path.display())))
    }
}

#[derive(Debug)]
enum RunWrite {
    Save(Box<JobRun>),
    Remove { job: String, run_id: u64 },
}

/// Queue of run-record writes, applied on the blocking pool one at a time
/// in submission order. A later snapshot of a run never lands before an
/// earlier one.
#[derive(Debug, Clone)]
pub struct RunWriter {
    tx: mpsc::UnboundedSender<RunWrite>,
}

impl RunWriter {
    /// Queue a save. False if the writer task is gone.
    pub fn save(&self, run: JobRun) -> bool {
        self.tx.send(RunWrite::Save(Box::new(run))).is_ok()
    }

    /// Queue removal of a run directory. False if the writer task is gone.
    pub fn remove(&self, job: &str, run_id: u64) -> bool {
        self.tx
            .send(RunWrite::Remove {
                job: job.to_string(),
                run_id,
            })
            .is_ok()
    }
}

impl RunStore {
    /// Start the writer task. It finishes once every [`RunWriter`] clone is
    /// dropped and the queue is drained.
    pub fn spawn_writer(&self) -> (RunWriter, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<RunWrite>();
        let store = self.clone();
        let task = tokio::spawn(async move {
            while let Some(write) = rx.recv().await {
                let store = store.clone();
                if let Err(e) = tokio::task::spawn_blocking(move || store.apply(write)).await {
                    tracing::warn!("⚠️ Run writer failed: {e}");
                }
            }
        });
        (RunWriter { tx }, task)
    }

    fn apply(&self, write: RunWrite) {
        match write {
            RunWrite::Save(run) => {
                if let Err(e) = self.save_run(&run) {
                    tracing::warn!("⚠️ Failed to save run {}.{}: {e}", run.job_name, run.run_id);
                }
            }
            RunWrite::Remove { job, run_id } => remove_dir(&self.run_dir(&job, run_id)),
        }
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    write_text(path, &json)
}

fn write_text(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| RotaError::Persistence(format!("create {}: {e}", parent.display())))?;
    }
    std::fs::write(path, content)
        .map_err(|e| RotaError::Persistence(format!("write {}: {e}", path.display())))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let json = std::fs::read_to_string(path)
        .map_err(|e| RotaError::Persistence(format!("read {}: {e}", path.display())))?;
    Ok(serde_json::from_str(&json)?)
}

fn remove_dir(dir: &Path) {
    tracing::debug!("🧹 Cleaning up {}", dir.display());
    match std::fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("⚠️ Failed to remove {}: {e}", dir.display()),
    }
}

/// Fire-and-forget recursive delete on the blocking pool.
fn remove_dir_async(dir: PathBuf) {
    let work = move || remove_dir(&dir);
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(work);
        }
        Err(_) => work(),
    }
}
