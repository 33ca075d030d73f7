//! # Rota Core
//!
//! Shared configuration model, host-spec handling and error types for the
//! Rota scheduler.

pub mod config;
pub mod error;
pub mod host;

pub use config::{
    Config, Defaults, JobSpec, JobTarget, NotifierSpec, NotifyTrigger, PoolMode, PoolSpec,
    NOTIFIER_NONE, resolve_run_dir,
};
pub use error::{Result, RotaError};
pub use host::HostSpec;
