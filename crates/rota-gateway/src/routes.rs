//! API route handlers for the gateway.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use rota_core::{Config, RotaError};
use rota_scheduler::{OutputStream, RunStatus, StatusQuery, StatusResponse, validate_config};

use super::server::AppState;

type ApiResponse = (StatusCode, Json<serde_json::Value>);

fn ok(body: serde_json::Value) -> ApiResponse {
    (StatusCode::OK, Json(body))
}

fn fail(status: StatusCode, error: impl std::fmt::Display) -> ApiResponse {
    (status, Json(serde_json::json!({"ok": false, "error": error.to_string()})))
}

/// Map an engine error onto an HTTP status.
fn error_response(e: &RotaError) -> ApiResponse {
    let status = if e.is_not_found() {
        StatusCode::NOT_FOUND
    } else {
        match e {
            RotaError::Config(_) => StatusCode::BAD_REQUEST,
            RotaError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    };
    (
        status,
        Json(serde_json::json!({"ok": false, "error": e.to_string(), "code": e.code()})),
    )
}

fn to_json<T: serde::Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

async fn query(state: &AppState, query: StatusQuery) -> Result<StatusResponse, ApiResponse> {
    match state.scheduler.status(query).await {
        Ok(StatusResponse::NotFound(msg)) => Err(fail(StatusCode::NOT_FOUND, msg)),
        Ok(response) => Ok(response),
        Err(e) => Err(error_response(&e)),
    }
}

/// Health check endpoint.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "rotad",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

/// List all jobs with their current status.
pub async fn list_jobs(State(state): State<Arc<AppState>>) -> ApiResponse {
    match query(&state, StatusQuery::Jobs).await {
        Ok(StatusResponse::Jobs(jobs)) => ok(serde_json::json!({"ok": true, "jobs": to_json(&jobs), "count": jobs.len()})),
        Ok(_) => fail(StatusCode::INTERNAL_SERVER_ERROR, "unexpected scheduler response"),
        Err(response) => response,
    }
}

/// Job detail with run history.
pub async fn get_job(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> ApiResponse {
    match query(&state, StatusQuery::Job(name)).await {
        Ok(StatusResponse::Job(detail)) => ok(serde_json::json!({"ok": true, "job": to_json(&detail)})),
        Ok(_) => fail(StatusCode::INTERNAL_SERVER_ERROR, "unexpected scheduler response"),
        Err(response) => response,
    }
}

/// One run with its host and command runs.
pub async fn get_run(
    State(state): State<Arc<AppState>>,
    Path((name, run_id)): Path<(String, u64)>,
) -> ApiResponse {
    match query(&state, StatusQuery::Run(name, run_id)).await {
        Ok(StatusResponse::Run(run)) => ok(serde_json::json!({"ok": true, "run": to_json(&run)})),
        Ok(_) => fail(StatusCode::INTERNAL_SERVER_ERROR, "unexpected scheduler response"),
        Err(response) => response,
    }
}

/// Captured stdout or stderr of one command run, as plain text.
pub async fn get_output(
    State(state): State<Arc<AppState>>,
    Path((name, run_id, host_index, command_index, stream)): Path<(String, u64, usize, usize, String)>,
) -> Response {
    let Some(stream) = OutputStream::parse(&stream) else {
        return fail(StatusCode::BAD_REQUEST, format!("unknown stream '{stream}'")).into_response();
    };
    if let Err(response) = query(&state, StatusQuery::Run(name.clone(), run_id)).await {
        return response.into_response();
    }
    let path = state
        .store
        .output_file(&name, run_id, host_index, command_index, stream);
    match tokio::fs::read(&path).await {
        Ok(bytes) => ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], bytes).into_response(),
        Err(_) => fail(
            StatusCode::NOT_FOUND,
            format!("no {} for {name}.{run_id} host {host_index} command {command_index}", stream.file_name()),
        )
        .into_response(),
    }
}

/// Reload the config file.
pub async fn reload(State(state): State<Arc<AppState>>) -> ApiResponse {
    match state.scheduler.load_config(state.config_path.clone()).await {
        Ok(summary) => ok(serde_json::json!({"ok": true, "reload": to_json(&summary)})),
        Err(e) => error_response(&e),
    }
}

/// Parse and validate the config file without applying it.
pub async fn test_config(State(state): State<Arc<AppState>>) -> ApiResponse {
    let result = Config::load_from(&state.config_path).and_then(|config| {
        validate_config(&config)?;
        Ok(config)
    });
    match result {
        Ok(config) => ok(serde_json::json!({
            "ok": true,
            "jobs": config.jobs.len(),
            "pools": config.pools.len(),
            "notifiers": config.notifiers.len(),
        })),
        Err(e) => error_response(&e),
    }
}

/// Start a run now.
pub async fn run_job(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> ApiResponse {
    match state.scheduler.run_job(&name).await {
        Ok(outcome) => ok(serde_json::json!({"ok": true, "job": name, "result": to_json(&outcome)})),
        Err(e) => error_response(&e),
    }
}

/// Force a job's status to `Failed`.
pub async fn fail_job(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> ApiResponse {
    force(&state, &name, RunStatus::Failed).await
}

/// Force a job's status. Body: `{"status": "Succeeded"}`.
pub async fn set_status(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> ApiResponse {
    let Some(raw) = body["status"].as_str() else {
        return fail(StatusCode::BAD_REQUEST, "missing \"status\"");
    };
    match raw.parse::<RunStatus>() {
        Ok(status) => force(&state, &name, status).await,
        Err(e) => fail(StatusCode::BAD_REQUEST, e),
    }
}

async fn force(state: &AppState, name: &str, status: RunStatus) -> ApiResponse {
    match state.scheduler.force_status(name, status).await {
        Ok(()) => ok(serde_json::json!({"ok": true, "job": name, "status": status})),
        Err(e) => error_response(&e),
    }
}

/// Replace the hosts of a dynamic pool. Body: JSON array of host specs.
pub async fn update_pool(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(hosts): Json<Vec<String>>,
) -> ApiResponse {
    match state.scheduler.update_pool(&name, hosts).await {
        Ok(hosts) => ok(serde_json::json!({"ok": true, "pool": name, "hosts": hosts})),
        Err(e) => error_response(&e),
    }
}
