//! End-to-end scheduler scenarios against a scripted in-memory runner.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rota_core::{Config, resolve_run_dir};
use rota_scheduler::{
    CommandError, ConnectError, ConnectOptions, RemoteConnection, RemoteRunner, RunOutcome, RunStatus, RunStore,
    Runners, Scheduler, SchedulerHandle, StatusQuery, StatusResponse,
};
use rota_scheduler::remote::OutputSink;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Semaphore, watch};

/// Hosts named in `unreachable` refuse connections; commands containing
/// "fail" exit 1; with a gate, every command waits for a permit.
#[derive(Default)]
struct ScriptedRunner {
    unreachable: HashSet<String>,
    opened: Mutex<Vec<String>>,
    gate: Option<Arc<Semaphore>>,
}

impl ScriptedRunner {
    fn opened(&self) -> Vec<String> {
        self.opened.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteRunner for ScriptedRunner {
    async fn open(&self, host: &str, _options: &ConnectOptions) -> Result<Box<dyn RemoteConnection>, ConnectError> {
        self.opened.lock().unwrap().push(host.to_string());
        if self.unreachable.contains(host) {
            return Err(ConnectError::Failed {
                host: host.to_string(),
                reason: "connection refused".into(),
            });
        }
        Ok(Box::new(ScriptedConnection {
            host: host.to_string(),
            gate: self.gate.clone(),
        }))
    }
}

struct ScriptedConnection {
    host: String,
    gate: Option<Arc<Semaphore>>,
}

#[async_trait]
impl RemoteConnection for ScriptedConnection {
    async fn run_with_writers(
        &mut self,
        command: &str,
        _run_timeout: Duration,
        _sudo: bool,
        stdout: OutputSink<'_>,
        stderr: OutputSink<'_>,
    ) -> Result<(), CommandError> {
        if let Some(gate) = &self.gate {
            gate.acquire().await.map_err(|e| CommandError::Io(e.to_string()))?.forget();
        }
        stdout
            .write_all(format!("{}: {}\n", self.host, command).as_bytes())
            .await
            .map_err(|e| CommandError::Io(e.to_string()))?;
        if command.contains("fail") {
            stderr.write_all(b"boom\n").await.map_err(|e| CommandError::Io(e.to_string()))?;
            return Err(CommandError::Exit { code: 1 });
        }
        Ok(())
    }
}

struct Harness {
    dir: PathBuf,
    runner: Arc<ScriptedRunner>,
    handle: SchedulerHandle,
    shutdown: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl Harness {
    fn start(toml: &str, runner: ScriptedRunner) -> Self {
        let dir = std::env::temp_dir().join(format!("rota-e2e-{}", uuid::Uuid::new_v4()));
        Self::start_in(dir, toml, runner)
    }

    fn start_in(dir: PathBuf, toml: &str, runner: ScriptedRunner) -> Self {
        let runner = Arc::new(runner);
        let runners = Runners {
            ssh: runner.clone(),
            local: runner.clone(),
        };
        let mut scheduler = Scheduler::new(RunStore::new(&dir), runners).with_tick_interval(Duration::from_secs(3600));
        scheduler.restore().unwrap();
        scheduler.apply_config(Config::parse(toml).unwrap()).unwrap();
        let (shutdown, rx) = watch::channel(false);
        let (handle, task) = scheduler.spawn(rx);
        Self {
            dir,
            runner,
            handle,
            shutdown,
            task,
        }
    }

    async fn stop(self) -> PathBuf {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
        self.dir
    }

    async fn run(&self, job: &str) -> RunOutcome {
        self.handle.run_job(job).await.unwrap()
    }

    async fn detail(&self, job: &str) -> rota_scheduler::JobDetail {
        match self.handle.status(StatusQuery::Job(job.into())).await.unwrap() {
            StatusResponse::Job(detail) => *detail,
            other => panic!("unexpected status response {other:?}"),
        }
    }

    /// Wait until the job has no run in flight.
    async fn wait_idle(&self, job: &str) -> rota_scheduler::JobDetail {
        for _ in 0..500 {
            let detail = self.detail(job).await;
            if !detail.summary.running {
                return detail;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job '{job}' never finished");
    }
}

async fn wait_gone(path: &std::path::Path) -> bool {
    for _ in 0..200 {
        if !path.exists() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

async fn wait_present(path: &std::path::Path) -> bool {
    for _ in 0..200 {
        if path.exists() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

const BACKUP: &str = r#"
[job.backup]
command = ["tar czf /tmp/b.tgz /data", "ls -l /tmp/b.tgz"]
host = "db1"
max_run_history = 2
"#;

#[tokio::test]
async fn test_backup_history_scenario() {
    let h = Harness::start(BACKUP, ScriptedRunner::default());

    assert_eq!(h.run("backup").await, RunOutcome::Started { run_id: 1 });
    let detail = h.wait_idle("backup").await;
    assert_eq!(detail.summary.status, RunStatus::Succeeded);
    assert_eq!(detail.runs.len(), 1);

    let run_one = RunStore::new(&h.dir).run_dir("backup", 1);
    let stdout = RunStore::new(&h.dir).output_file("backup", 1, 0, 1, rota_scheduler::OutputStream::Stdout);
    assert_eq!(
        std::fs::read_to_string(&stdout).unwrap(),
        "db1:22: ls -l /tmp/b.tgz\n"
    );

    h.run("backup").await;
    h.wait_idle("backup").await;
    h.run("backup").await;
    let detail = h.wait_idle("backup").await;

    assert_eq!(detail.runs.iter().map(|r| r.run_id).collect::<Vec<_>>(), vec![3, 2]);
    assert!(wait_gone(&run_one).await, "run 1 artifacts should be deleted");
    assert!(wait_present(&RunStore::new(&h.dir).run_file("backup", 3)).await);

    let dir = h.stop().await;
    std::fs::remove_dir_all(dir).ok();
}

#[tokio::test]
async fn test_parallel_fan_out_with_unreachable_host() {
    let toml = r#"
[pool.web]
hosts = ["web1", "web2", "web3"]

[job.deploy]
command = ["git pull", "systemctl restart app"]
pool = "web"
pool_mode = "parallel"
"#;
    let runner = ScriptedRunner {
        unreachable: HashSet::from(["web2:22".to_string()]),
        ..ScriptedRunner::default()
    };
    let h = Harness::start(toml, runner);

    h.run("deploy").await;
    let detail = h.wait_idle("deploy").await;
    assert_eq!(detail.summary.status, RunStatus::Failed);

    let run = &detail.runs[0];
    assert_eq!(run.host_runs.len(), 3);
    let web2 = run.host_runs.iter().find(|hr| hr.host == "web2:22").unwrap();
    assert_eq!(web2.status, RunStatus::Failed);
    assert!(web2.command_runs[0].error.as_deref().unwrap().contains("refused"));
    for ok in run.host_runs.iter().filter(|hr| hr.host != "web2:22") {
        assert_eq!(ok.status, RunStatus::Succeeded);
        assert!(ok.command_runs.iter().all(|c| c.exit_code == Some(0)));
    }

    let dir = h.stop().await;
    std::fs::remove_dir_all(dir).ok();
}

#[tokio::test]
async fn test_sequential_pool_rotation() {
    let toml = r#"
[pool.web]
hosts = ["A", "B", "C"]

[job.rotate]
command = ["uptime"]
pool = "web"
"#;
    let h = Harness::start(toml, ScriptedRunner::default());
    for _ in 0..4 {
        h.run("rotate").await;
        h.wait_idle("rotate").await;
    }
    assert_eq!(h.runner.opened(), vec!["A:22", "B:22", "C:22", "A:22"]);

    let dir = h.stop().await;
    std::fs::remove_dir_all(dir).ok();
}

#[tokio::test]
async fn test_second_request_while_running_is_queued() {
    let gate = Arc::new(Semaphore::new(0));
    let runner = ScriptedRunner {
        gate: Some(gate.clone()),
        ..ScriptedRunner::default()
    };
    let h = Harness::start(BACKUP, runner);

    assert_eq!(h.run("backup").await, RunOutcome::Started { run_id: 1 });
    assert_eq!(h.run("backup").await, RunOutcome::Busy { queued: 1 });
    assert_eq!(h.run("backup").await, RunOutcome::Busy { queued: 2 });

    gate.add_permits(2);
    let detail = h.wait_idle("backup").await;
    assert_eq!(detail.summary.run_id, 1);
    assert_eq!(detail.summary.runs_queued, 2);
    assert_eq!(detail.runs.len(), 1);

    let dir = h.stop().await;
    std::fs::remove_dir_all(dir).ok();
}

#[tokio::test]
async fn test_reload_abandons_in_flight_run() {
    let gate = Arc::new(Semaphore::new(0));
    let runner = ScriptedRunner {
        gate: Some(gate.clone()),
        ..ScriptedRunner::default()
    };
    let h = Harness::start(BACKUP, runner);
    h.run("backup").await;

    let config_path = h.dir.join("rota.toml");
    std::fs::create_dir_all(&h.dir).unwrap();
    std::fs::write(&config_path, BACKUP.replace("db1", "db2")).unwrap();
    let summary = h.handle.load_config(&config_path).await.unwrap();
    assert_eq!(summary.updated, vec!["backup"]);

    let detail = h.detail("backup").await;
    assert_eq!(detail.summary.status, RunStatus::Abandoned);
    assert!(!detail.summary.running);
    assert_eq!(detail.runs[0].status, RunStatus::Abandoned);

    // let the old generation finish; its reports must not resurrect the run
    gate.add_permits(2);
    tokio::time::sleep(Duration::from_millis(100)).await;
    let detail = h.detail("backup").await;
    assert_eq!(detail.summary.status, RunStatus::Abandoned);
    assert_eq!(detail.runs[0].status, RunStatus::Abandoned);

    let dir = h.stop().await;
    std::fs::remove_dir_all(dir).ok();
}

#[tokio::test]
async fn test_restart_marks_in_flight_run_abandoned() {
    let runner = ScriptedRunner {
        gate: Some(Arc::new(Semaphore::new(0))),
        ..ScriptedRunner::default()
    };
    let h = Harness::start(BACKUP, runner);
    h.run("backup").await;
    let dir = h.stop().await;

    let h = Harness::start_in(dir, BACKUP, ScriptedRunner::default());
    let detail = h.detail("backup").await;
    assert_eq!(detail.summary.status, RunStatus::Abandoned);
    assert_eq!(detail.summary.run_id, 1);
    assert_eq!(detail.runs[0].status, RunStatus::Abandoned);
    assert_eq!(detail.runs[0].host_runs[0].status, RunStatus::Abandoned);

    // numbering continues after the abandoned run
    assert_eq!(h.run("backup").await, RunOutcome::Started { run_id: 2 });
    h.wait_idle("backup").await;

    let dir = h.stop().await;
    std::fs::remove_dir_all(dir).ok();
}

#[tokio::test]
async fn test_broken_config_keeps_jobs_in_custom_run_dir() {
    let base = std::env::temp_dir().join(format!("rota-e2e-{}", uuid::Uuid::new_v4()));
    let custom = base.join("srv").join("rota");
    let toml = format!("[general]\ntick_secs = 5\n{BACKUP}");
    let h = Harness::start_in(custom.clone(), &toml, ScriptedRunner::default());
    h.run("backup").await;
    h.wait_idle("backup").await;
    h.stop().await;

    let config_path = base.join("rota.toml");
    std::fs::write(&config_path, "[job.backup\ncommand = ").unwrap();

    // the run dir comes from the command line, not from the broken file
    let run_dir = resolve_run_dir(custom.to_str());
    assert_eq!(run_dir, custom);
    let mut scheduler = Scheduler::new(RunStore::new(&run_dir), Runners::default());
    scheduler.restore().unwrap();
    assert!(scheduler.load_config_file(&config_path).is_err());

    let job = scheduler.job("backup").expect("job restored");
    assert_eq!(job.run_id, 1);
    assert_eq!(job.status, RunStatus::Succeeded);
    assert_eq!(job.history().len(), 1);
    assert_eq!(scheduler.config().general.tick_secs, 5);
    assert!(scheduler.config().jobs.contains_key("backup"));

    std::fs::remove_dir_all(base).ok();
}

#[cfg(unix)]
#[tokio::test]
async fn test_notifier_fires_on_failure() {
    use std::os::unix::fs::PermissionsExt;

    let dir = std::env::temp_dir().join(format!("rota-e2e-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    let log = dir.join("notifications.log");
    let script = dir.join("notify.sh");
    std::fs::write(&script, format!("#!/bin/sh\necho \"$@\" >> {}\n", log.display())).unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

    let toml = format!(
        r#"
[notifier.ops]
command = "{}"
args = ["--team", "ops"]
trigger = "edge"

[job.flaky]
command = ["run fail"]
local = true
notifier = "ops"
"#,
        script.display()
    );
    let h = Harness::start_in(dir.clone(), &toml, ScriptedRunner::default());
    h.run("flaky").await;
    h.wait_idle("flaky").await;

    let mut fired = String::new();
    for _ in 0..200 {
        fired = std::fs::read_to_string(&log).unwrap_or_default();
        if !fired.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(fired.trim(), "Failed flaky 1 --team ops");

    let dir = h.stop().await;
    std::fs::remove_dir_all(dir).ok();
}
