//! # rotactl: control client for rotad
//!
//! Usage:
//!   rotactl status                    # All jobs
//!   rotactl status backup             # One job with history
//!   rotactl run backup                # Start a run now
//!   rotactl reload                    # Reload the config file
//!   echo web3 | rotactl update-pool burst

use std::io::BufRead;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use rota_core::resolve_run_dir;
use rota_scheduler::RunStore;

#[derive(Parser)]
#[command(name = "rotactl", version, about = "🎛️ Control a running rotad")]
struct Cli {
    /// API endpoint (default: read from <run_dir>/endpoint)
    #[arg(short, long)]
    endpoint: Option<String>,

    /// Run dir of the daemon (default: $ROTA_PATH/run, else ~/.rota/run)
    #[arg(long)]
    run_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reload the daemon's config file
    Reload,
    /// Validate the daemon's config file without applying it
    Test,
    /// Start a job now
    Run { job: String },
    /// Mark a job as failed
    Fail { job: String },
    /// Replace a dynamic pool's hosts with lines read from stdin
    UpdatePool { pool: String },
    /// Show all jobs, one job, or one run
    Status {
        job: Option<String>,
        run_id: Option<u64>,
        /// Force the job's status instead of showing it
        #[arg(long)]
        set: Option<String>,
    },
}

fn resolve_endpoint(cli: &Cli) -> Result<String> {
    if let Some(endpoint) = &cli.endpoint {
        return Ok(endpoint.trim_end_matches('/').to_string());
    }
    let run_dir = resolve_run_dir(cli.run_dir.as_deref());
    let endpoint = RunStore::new(&run_dir)
        .read_endpoint()
        .context("rotad does not seem to be running (use --endpoint)")?;
    Ok(endpoint.trim_end_matches('/').to_string())
}

fn read_hosts() -> Result<Vec<String>> {
    let mut hosts = Vec::new();
    for line in std::io::stdin().lock().lines() {
        let line = line?;
        let host = line.trim();
        if !host.is_empty() && !host.starts_with('#') {
            hosts.push(host.to_string());
        }
    }
    Ok(hosts)
}

async fn send(request: reqwest::RequestBuilder) -> Result<serde_json::Value> {
    let response = request.send().await.context("request to rotad failed")?;
    let status = response.status();
    let body: serde_json::Value = response.json().await.context("invalid response from rotad")?;
    if !status.is_success() {
        let error = body["error"].as_str().unwrap_or("unknown error");
        bail!("{error} ({status})");
    }
    Ok(body)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let base = resolve_endpoint(&cli)?;
    let client = reqwest::Client::new();

    let body = match &cli.command {
        Commands::Reload => send(client.put(format!("{base}/api/v1/reload"))).await?,
        Commands::Test => send(client.put(format!("{base}/api/v1/test"))).await?,
        Commands::Run { job } => send(client.put(format!("{base}/api/v1/run/{job}"))).await?,
        Commands::Fail { job } => send(client.put(format!("{base}/api/v1/fail/{job}"))).await?,
        Commands::UpdatePool { pool } => {
            let hosts = read_hosts()?;
            send(client.put(format!("{base}/api/v1/pool/{pool}")).json(&hosts)).await?
        }
        Commands::Status { job, run_id, set } => match (job, run_id, set) {
            (Some(job), None, Some(status)) => {
                let body = serde_json::json!({ "status": status });
                send(client.put(format!("{base}/api/v1/status/{job}")).json(&body)).await?
            }
            (None, _, Some(_)) => bail!("--set needs a job name"),
            (Some(_), Some(_), Some(_)) => bail!("--set cannot be combined with a run id"),
            (Some(job), Some(run_id), None) => send(client.get(format!("{base}/api/v1/jobs/{job}/{run_id}"))).await?,
            (Some(job), None, None) => send(client.get(format!("{base}/api/v1/jobs/{job}"))).await?,
            (None, _, None) => send(client.get(format!("{base}/api/v1/jobs"))).await?,
        },
    };

    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}
