//! Rota configuration system.
//!
//! The on-disk format is TOML. [`Config::load_from`] parses it into raw
//! sections with serde defaults, then resolves and validates them into a
//! [`Config`] whose job specs are fully qualified (hosts carry user and port,
//! key paths are expanded, per-job overrides are merged with `[defaults]`).
//! The resolved form is itself serializable; the scheduler keeps it as the
//! last-known-good snapshot.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RotaError};
use crate::host::qualify_host;

/// Notifier name that disables notification for a job.
pub const NOTIFIER_NONE: &str = "none";

/// Resolved configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default)]
    pub pools: BTreeMap<String, PoolSpec>,
    #[serde(default)]
    pub notifiers: BTreeMap<String, NotifierSpec>,
    #[serde(default)]
    pub jobs: BTreeMap<String, JobSpec>,
}

/// `[general]` section.
///
/// The run directory is not set here: it holds the snapshot that is used
/// when this file does not parse. See [`resolve_run_dir`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GeneralConfig {
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
        }
    }
}

impl GeneralConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_secs.max(1))
    }
}

/// `[web]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

/// `[defaults]` section, merged into every job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Defaults {
    #[serde(default)]
    pub keyfile: String,
    #[serde(default)]
    pub user: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    #[serde(default = "default_run_timeout")]
    pub run_timeout: u64,
    #[serde(default = "default_max_run_history")]
    pub max_run_history: usize,
    #[serde(default = "default_sudo_command")]
    pub sudo_command: String,
    #[serde(default)]
    pub notifier: Option<String>,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            keyfile: String::new(),
            user: String::new(),
            port: default_port(),
            connect_timeout: default_connect_timeout(),
            run_timeout: default_run_timeout(),
            max_run_history: default_max_run_history(),
            sudo_command: default_sudo_command(),
            notifier: None,
        }
    }
}

fn default_tick_secs() -> u64 { 10 }
fn default_listen() -> String { "127.0.0.1:7070".into() }
fn default_port() -> u16 { 22 }
fn default_connect_timeout() -> u64 { 20 }
fn default_run_timeout() -> u64 { 86400 }
fn default_max_run_history() -> usize { 50 }
fn default_sudo_command() -> String { "sudo -i /bin/bash -c".into() }

/// How a pool-targeted job spreads a run over the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolMode {
    /// One host per run, rotating round-robin.
    #[default]
    Sequential,
    /// Every host in the pool, concurrently.
    Parallel,
}

impl fmt::Display for PoolMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolMode::Sequential => write!(f, "sequential"),
            PoolMode::Parallel => write!(f, "parallel"),
        }
    }
}

/// Where a job runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobTarget {
    /// A single qualified host.
    Host { host: String },
    Pool { pool: String, mode: PoolMode },
    /// The daemon host itself.
    Local,
}

/// Fully resolved job definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub schedule: String,
    pub target: JobTarget,
    #[serde(default)]
    pub keyfile: Option<PathBuf>,
    #[serde(default)]
    pub sudo: bool,
    #[serde(default = "default_sudo_command")]
    pub sudo_command: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    #[serde(default = "default_run_timeout")]
    pub run_timeout: u64,
    #[serde(default = "default_max_run_history")]
    pub max_run_history: usize,
    #[serde(default)]
    pub run_on_start: bool,
    /// Resolved notifier name; `None` means no notification.
    #[serde(default)]
    pub notifier: Option<String>,
}

impl JobSpec {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    /// Per-command timeout; zero means unlimited.
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout)
    }

    pub fn pool_name(&self) -> Option<&str> {
        match &self.target {
            JobTarget::Pool { pool, .. } => Some(pool),
            _ => None,
        }
    }

    /// Schedule with any leading `cron` tag removed.
    pub fn recurrence_expr(&self) -> &str {
        let expr = self.schedule.trim();
        match expr.strip_prefix("cron") {
            Some(rest) if rest.is_empty() || rest.starts_with(char::is_whitespace) => rest.trim(),
            _ => expr,
        }
    }
}

/// A named set of hosts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSpec {
    pub name: String,
    #[serde(default)]
    pub hosts: Vec<String>,
    /// Dynamic pools take their host list from the control API.
    #[serde(default)]
    pub dynamic: bool,
}

/// When a notifier fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotifyTrigger {
    Always,
    /// Fire whenever the status differs from the previous run's.
    EdgeTrigger,
    /// Fire on the `threshold`-th consecutive failure (every failure when 0)
    /// and on recovery from a streak at least that long.
    Failures { threshold: u32 },
}

/// External command run on job status changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifierSpec {
    pub name: String,
    pub command: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    pub trigger: NotifyTrigger,
}

// ── raw TOML sections ──────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    general: GeneralConfig,
    #[serde(default)]
    web: WebConfig,
    #[serde(default)]
    defaults: Defaults,
    #[serde(default)]
    pool: BTreeMap<String, RawPool>,
    #[serde(default)]
    notifier: BTreeMap<String, RawNotifier>,
    #[serde(default)]
    job: BTreeMap<String, RawJob>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPool {
    #[serde(default, alias = "host")]
    hosts: Vec<String>,
    #[serde(default)]
    dynamic: bool,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
enum TriggerKind {
    Always,
    Edge,
    #[default]
    Failures,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawNotifier {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    trigger: TriggerKind,
    #[serde(default)]
    threshold: u32,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawJob {
    #[serde(default)]
    description: String,
    #[serde(default)]
    command: Vec<String>,
    #[serde(default)]
    schedule: String,
    #[serde(default)]
    host: Option<String>,
    #[serde(default)]
    pool: Option<String>,
    #[serde(default)]
    pool_mode: Option<PoolMode>,
    #[serde(default)]
    local: bool,
    #[serde(default)]
    keyfile: Option<String>,
    #[serde(default)]
    sudo: bool,
    #[serde(default)]
    connect_timeout: Option<u64>,
    #[serde(default)]
    run_timeout: Option<u64>,
    #[serde(default)]
    max_run_history: Option<usize>,
    #[serde(default)]
    run_on_start: bool,
    #[serde(default)]
    notifier: Option<String>,
}

impl Config {
    /// Load config from the default path (~/.rota/rota.toml).
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path())
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RotaError::Config(format!("Failed to read {}: {e}", path.display())))?;
        Self::parse(&content)
    }

    /// Parse and resolve TOML text.
    pub fn parse(content: &str) -> Result<Self> {
        let raw: RawConfig = toml::from_str(content)
            .map_err(|e| RotaError::Config(format!("Failed to parse config: {e}")))?;
        raw.resolve()
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("rota.toml")
    }

    /// Get the Rota home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".rota")
    }

    /// Qualify a host string with this config's default user and port.
    pub fn qualify_host(&self, raw: &str) -> Result<String> {
        qualify_host(raw, &self.defaults.user, self.defaults.port)
    }
}

impl RawConfig {
    fn resolve(self) -> Result<Config> {
        let defaults = self.defaults;
        if defaults.max_run_history == 0 {
            return Err(RotaError::Config("defaults.max_run_history must be at least 1".into()));
        }

        let mut pools = BTreeMap::new();
        for (name, raw) in self.pool {
            check_name("pool", &name)?;
            let hosts = raw
                .hosts
                .iter()
                .map(|h| qualify_host(h, &defaults.user, defaults.port))
                .collect::<Result<Vec<_>>>()
                .map_err(|e| RotaError::Config(format!("pool '{name}': {e}")))?;
            pools.insert(name.clone(), PoolSpec { name, hosts, dynamic: raw.dynamic });
        }

        let mut notifiers = BTreeMap::new();
        for (name, raw) in self.notifier {
            check_name("notifier", &name)?;
            if name == NOTIFIER_NONE {
                return Err(RotaError::Config(format!("notifier name '{NOTIFIER_NONE}' is reserved")));
            }
            if raw.command.trim().is_empty() {
                return Err(RotaError::Config(format!("notifier '{name}': command is empty")));
            }
            let trigger = match raw.trigger {
                TriggerKind::Always => NotifyTrigger::Always,
                TriggerKind::Edge => NotifyTrigger::EdgeTrigger,
                TriggerKind::Failures => NotifyTrigger::Failures { threshold: raw.threshold },
            };
            notifiers.insert(
                name.clone(),
                NotifierSpec {
                    name,
                    command: expand_path(&raw.command),
                    args: raw.args,
                    trigger,
                },
            );
        }

        let mut jobs = BTreeMap::new();
        for (name, raw) in self.job {
            let spec = resolve_job(&name, raw, &defaults, &pools, &notifiers)?;
            jobs.insert(name, spec);
        }

        Ok(Config {
            general: self.general,
            web: self.web,
            defaults,
            pools,
            notifiers,
            jobs,
        })
    }
}

fn resolve_job(
    name: &str,
    raw: RawJob,
    defaults: &Defaults,
    pools: &BTreeMap<String, PoolSpec>,
    notifiers: &BTreeMap<String, NotifierSpec>,
) -> Result<JobSpec> {
    check_name("job", name)?;
    let err = |msg: String| RotaError::Config(format!("job '{name}': {msg}"));

    if raw.command.is_empty() || raw.command.iter().all(|c| c.trim().is_empty()) {
        return Err(err("command list is empty".into()));
    }

    let target = match (raw.host, raw.pool, raw.local) {
        (Some(host), None, false) => JobTarget::Host {
            host: qualify_host(&host, &defaults.user, defaults.port).map_err(|e| err(e.to_string()))?,
        },
        (None, Some(pool), false) => {
            // `pool = "web parallel"` is accepted as shorthand for pool_mode.
            let mut parts = pool.split_whitespace();
            let pool_name = parts.next().unwrap_or_default().to_string();
            let inline_mode = match parts.next() {
                None => None,
                Some("parallel") => Some(PoolMode::Parallel),
                Some("sequential") => Some(PoolMode::Sequential),
                Some(other) => return Err(err(format!("unknown pool mode '{other}'"))),
            };
            if !pools.contains_key(&pool_name) {
                return Err(err(format!("unknown pool '{pool_name}'")));
            }
            JobTarget::Pool {
                pool: pool_name,
                mode: raw.pool_mode.or(inline_mode).unwrap_or_default(),
            }
        }
        (None, None, true) => JobTarget::Local,
        (None, None, false) => return Err(err("one of host, pool or local is required".into())),
        _ => return Err(err("host, pool and local are mutually exclusive".into())),
    };

    let max_run_history = raw.max_run_history.unwrap_or(defaults.max_run_history);
    if max_run_history == 0 {
        return Err(err("max_run_history must be at least 1".into()));
    }

    let notifier = match raw.notifier.or_else(|| defaults.notifier.clone()) {
        None => None,
        Some(n) if n == NOTIFIER_NONE || n.is_empty() => None,
        Some(n) if notifiers.contains_key(&n) => Some(n),
        Some(n) => return Err(err(format!("unknown notifier '{n}'"))),
    };

    let keyfile = raw
        .keyfile
        .filter(|k| !k.is_empty())
        .or_else(|| Some(defaults.keyfile.clone()).filter(|k| !k.is_empty()))
        .map(|k| expand_path(&k));

    Ok(JobSpec {
        name: name.to_string(),
        description: raw.description,
        command: raw.command,
        schedule: raw.schedule.trim().to_string(),
        target,
        keyfile,
        sudo: raw.sudo,
        sudo_command: defaults.sudo_command.clone(),
        connect_timeout: raw.connect_timeout.unwrap_or(defaults.connect_timeout),
        run_timeout: raw.run_timeout.unwrap_or(defaults.run_timeout),
        max_run_history,
        run_on_start: raw.run_on_start,
        notifier,
    })
}

/// Names become path components; keep them to a safe alphabet.
fn check_name(kind: &str, name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(RotaError::Config(format!("invalid {kind} name '{name}'")))
    }
}

fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).into_owned())
}

/// Directory holding job state, run artifacts, the config snapshot, pid and
/// endpoint files: `explicit` if given, else `$ROTA_PATH/run`, else
/// `~/.rota/run`. Never read from the config file.
pub fn resolve_run_dir(explicit: Option<&str>) -> PathBuf {
    run_dir_from(explicit, std::env::var("ROTA_PATH").ok().as_deref())
}

fn run_dir_from(explicit: Option<&str>, rota_path: Option<&str>) -> PathBuf {
    match (explicit, rota_path) {
        (Some(dir), _) if !dir.is_empty() => expand_path(dir),
        (_, Some(base)) if !base.is_empty() => expand_path(base).join("run"),
        _ => Config::home_dir().join("run"),
    }
}
