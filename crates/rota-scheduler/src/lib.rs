//! # Rota Scheduler
//!
//! The engine behind `rotad`: cron matching, the job/run state machine,
//! host pool fan-out, remote execution and bounded run history.
//!
//! ## Architecture
//! ```text
//! Scheduler (single actor, tokio interval)
//!   ├── tick → Job::is_due → Job::begin_run
//!   │            └── persist skeleton run → spawn run_on_host per host
//!   ├── Request channel ← SchedulerHandle (status, reload, run, pools)
//!   └── report channel ← host tasks (HostRun snapshots)
//!              └── Job::absorb_report → persist → prune history → notify
//! ```

pub mod cron;
pub mod engine;
pub mod executor;
pub mod history;
pub mod job;
pub mod notify;
pub mod pool;
pub mod remote;
pub mod runs;
pub mod store;

pub use cron::{CronError, CronSchedule, Recurrence};
pub use engine::{
    JobDetail, JobSummary, ReloadSummary, Request, RunOutcome, Runners, Scheduler, SchedulerHandle,
    StatusQuery, StatusResponse, validate_config,
};
pub use history::JobHistory;
pub use job::{Job, StartOutcome};
pub use remote::{CommandError, ConnectError, ConnectOptions, LocalRunner, RemoteConnection, RemoteRunner, SshRunner};
pub use runs::{CommandRun, HostRun, JobRun, RunStatus};
pub use store::{OutputStream, RunStore, RunWriter};
