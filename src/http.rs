use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::config::{Settings, PORT_SCAN_RANGE};
use crate::discovery;
use crate::guardian::{self, GuardianState};
use crate::launcher;
use crate::registry::{Registry, RunStatus};
use crate::store::TaskStore;
use crate::supervisor::{
    FailureKind, RestartRequest, StartFailure, StartRequest, StartSource, StopFailure,
    StopOutcome, StopRequest, Supervisor,
};
use crate::task::Task;

#[derive(Clone)]
pub struct AppState {
    pub settings: Settings,
    pub store: Arc<TaskStore>,
    pub registry: Arc<Registry>,
    pub supervisor: Arc<Supervisor>,
    pub guardian: Arc<GuardianState>,
}

impl AppState {
    pub fn new(settings: Settings) -> Result<Self> {
        let store = Arc::new(TaskStore::open(&settings.paths)?);
        let registry = Arc::new(Registry::new());
        let guardian = Arc::new(GuardianState::new());
        let supervisor = Arc::new(Supervisor::new(
            settings.clone(),
            store.clone(),
            registry.clone(),
            guardian.clone(),
        ));
        Ok(Self {
            settings,
            store,
            registry,
            supervisor,
            guardian,
        })
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/projects", get(list_tasks).post(create_task))
        .route("/api/projects/:id", put(update_task).delete(delete_task))
        .route("/api/projects/dedupe", post(dedupe_tasks))
        .route("/api/projects/start", post(start_task))
        .route("/api/projects/stop", post(stop_task))
        .route("/api/projects/restart", post(restart_task))
        .route("/api/projects/status/:id", get(task_status))
        .route(
            "/api/projects/logs/:id",
            get(task_logs).delete(clear_task_logs),
        )
        .route("/api/processes/search", get(search_processes))
        .route("/api/processes/by-port/:port", get(processes_by_port))
        .route("/api/processes/kill", post(kill_process))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn bad_request(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": message.into() })),
    )
        .into_response()
}

fn server_error(message: impl Into<String>) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "ok": false, "error": message.into() })),
    )
        .into_response()
}

async fn list_tasks(State(state): State<AppState>) -> Json<Vec<Task>> {
    Json(state.store.list())
}

async fn create_task(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    if !body.is_object() {
        return bad_request("task body must be a JSON object");
    }
    match state.store.create(body) {
        Ok(task) => Json(task).into_response(),
        Err(e) => bad_request(format!("{e:#}")),
    }
}

async fn update_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    if !body.is_object() {
        return bad_request("task patch must be a JSON object");
    }
    match state.store.update(&id, body) {
        Ok(Some(task)) => Json(task).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "task not found" })),
        )
            .into_response(),
        Err(e) => bad_request(format!("{e:#}")),
    }
}

async fn delete_task(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    if let Some(pid) = state.registry.running_pid(&id).await {
        if let Err(e) = launcher::kill_group(pid, "TERM") {
            warn!(id = %id, pid, "kill on delete failed: {e}");
        }
    }
    state.registry.remove(&id).await;
    state.guardian.clear(&id);
    match state.store.delete(&id) {
        Ok(_) => Json(json!({ "ok": true })).into_response(),
        Err(e) => server_error(format!("{e:#}")),
    }
}

async fn dedupe_tasks(State(state): State<AppState>) -> Response {
    match state.store.dedupe() {
        Ok(report) => Json(json!({
            "ok": true,
            "removed": report.removed,
            "total": report.total,
        }))
        .into_response(),
        Err(e) => server_error(format!("{e:#}")),
    }
}

#[derive(Debug, Deserialize)]
struct StartBody {
    id: Option<String>,
    start_command: Option<String>,
    working_directory: Option<String>,
    #[serde(default)]
    environment_variables: HashMap<String, String>,
    startup_timeout_ms: Option<u64>,
}

async fn start_task(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let body: StartBody = match serde_json::from_value(body) {
        Ok(body) => body,
        Err(e) => return bad_request(format!("invalid request body: {e}")),
    };
    let Some(id) = body.id.filter(|s| !s.trim().is_empty()) else {
        return bad_request("id is required");
    };
    let Some(start_command) = body.start_command.filter(|s| !s.trim().is_empty()) else {
        return bad_request("start_command is required");
    };
    let req = StartRequest {
        id,
        start_command,
        working_directory: body.working_directory,
        environment_variables: body.environment_variables,
        startup_timeout_ms: body.startup_timeout_ms,
    };
    match state.supervisor.start(req, StartSource::User).await {
        Ok(pid) => Json(json!({ "ok": true, "pid": pid })).into_response(),
        Err(failure) => start_failure_response(failure),
    }
}

fn start_failure_response(failure: StartFailure) -> Response {
    let status = match failure.kind {
        FailureKind::Validation => StatusCode::BAD_REQUEST,
        FailureKind::Runtime => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(json!({
            "ok": false,
            "error": failure.error,
            "code": failure.code,
            "signal": failure.signal,
            "logs": { "stdout": failure.logs.stdout, "stderr": failure.logs.stderr },
        })),
    )
        .into_response()
}

fn stop_failure_response(failure: StopFailure) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "ok": false,
            "error": failure.error,
            "logs": { "stdout": failure.logs.stdout, "stderr": failure.logs.stderr },
        })),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct StopBody {
    id: Option<String>,
    stop_command: Option<String>,
    working_directory: Option<String>,
    #[serde(default)]
    environment_variables: HashMap<String, String>,
}

async fn stop_task(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let body: StopBody = match serde_json::from_value(body) {
        Ok(body) => body,
        Err(e) => return bad_request(format!("invalid request body: {e}")),
    };
    let Some(id) = body.id.filter(|s| !s.trim().is_empty()) else {
        return bad_request("id is required");
    };
    let req = StopRequest {
        id,
        stop_command: body.stop_command,
        working_directory: body.working_directory,
        environment_variables: body.environment_variables,
    };
    match state.supervisor.stop(req).await {
        Ok(StopOutcome::NotRunning) => {
            Json(json!({ "ok": true, "message": "not running" })).into_response()
        }
        Ok(_) => Json(json!({ "ok": true })).into_response(),
        Err(failure) => stop_failure_response(failure),
    }
}

#[derive(Debug, Deserialize)]
struct RestartBody {
    id: Option<String>,
    start_command: Option<String>,
    stop_command: Option<String>,
    working_directory: Option<String>,
    #[serde(default)]
    environment_variables: HashMap<String, String>,
    startup_timeout_ms: Option<u64>,
}

async fn restart_task(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let body: RestartBody = match serde_json::from_value(body) {
        Ok(body) => body,
        Err(e) => return bad_request(format!("invalid request body: {e}")),
    };
    let Some(id) = body.id.filter(|s| !s.trim().is_empty()) else {
        return bad_request("id is required");
    };
    let req = RestartRequest {
        id,
        start_command: body.start_command,
        stop_command: body.stop_command,
        working_directory: body.working_directory,
        environment_variables: body.environment_variables,
        startup_timeout_ms: body.startup_timeout_ms,
    };
    match state.supervisor.restart(req).await {
        Ok(pid) => Json(json!({ "ok": true, "pid": pid })).into_response(),
        Err(failure) => start_failure_response(failure),
    }
}

async fn task_status(State(state): State<AppState>, Path(id): Path<String>) -> Json<Value> {
    match state.registry.status_of(&id).await {
        Some((RunStatus::Running, pid)) => Json(json!({
            "running": true,
            "status": "running",
            "pid": pid,
        })),
        _ => Json(json!({
            "running": false,
            "status": "stopped",
            "pid": Value::Null,
        })),
    }
}

async fn task_logs(State(state): State<AppState>, Path(id): Path<String>) -> Json<Value> {
    let snapshot = state.supervisor.logs(&id).await;
    Json(json!({ "stdout": snapshot.stdout, "stderr": snapshot.stderr }))
}

async fn clear_task_logs(State(state): State<AppState>, Path(id): Path<String>) -> Json<Value> {
    state.supervisor.clear_logs(&id).await;
    Json(json!({ "ok": true }))
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    name: Option<String>,
}

async fn search_processes(
    State(_state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Response {
    let Some(name) = query.name.filter(|n| !n.trim().is_empty()) else {
        return bad_request("name query parameter is required");
    };
    match discovery::search_by_name(&name) {
        Ok(matches) => Json(matches).into_response(),
        Err(e) => server_error(format!("{e:#}")),
    }
}

async fn processes_by_port(
    State(_state): State<AppState>,
    Path(port): Path<String>,
) -> Response {
    let port = match port.parse::<u16>() {
        Ok(port) if port > 0 => port,
        _ => return bad_request("invalid port"),
    };
    match discovery::list_by_port(port) {
        Ok(holders) => Json(holders).into_response(),
        Err(e) => server_error(format!("{e:#}")),
    }
}

#[derive(Debug, Deserialize)]
struct KillBody {
    pid: Option<i64>,
    signal: Option<String>,
}

async fn kill_process(State(_state): State<AppState>, Json(body): Json<Value>) -> Response {
    let body: KillBody = match serde_json::from_value(body) {
        Ok(body) => body,
        Err(e) => return bad_request(format!("invalid request body: {e}")),
    };
    let Some(pid) = body.pid.filter(|p| *p > 0) else {
        return bad_request("invalid pid");
    };
    let signal = body.signal.unwrap_or_else(|| "TERM".to_string());
    match discovery::kill_tree(pid as i32, &signal) {
        Ok(()) => Json(json!({ "ok": true, "pid": pid, "signal": signal })).into_response(),
        Err(e) => server_error(format!("{e:#}")),
    }
}

/// Bind the preferred port, walking up through adjacent ports when it is
/// already taken.
fn bind_listener(preferred: u16) -> Result<TcpListener> {
    for offset in 0..PORT_SCAN_RANGE {
        let port = preferred.saturating_add(offset);
        match TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))) {
            Ok(listener) => {
                if offset > 0 {
                    warn!("port {preferred} is busy, listening on {port} instead");
                }
                return Ok(listener);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => continue,
            Err(e) => return Err(e.into()),
        }
    }
    bail!(
        "no free port in {preferred}..={}",
        preferred.saturating_add(PORT_SCAN_RANGE - 1)
    )
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("SIGTERM handler unavailable: {e}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("shutdown signal received");
}

pub async fn serve(state: AppState) -> Result<()> {
    let app = router(state.clone());
    let listener = bind_listener(state.settings.port)?;
    let addr = listener.local_addr()?;
    info!("listening on http://{addr}");

    let guardian_task = tokio::spawn(guardian::run(
        state.supervisor.clone(),
        state.store.clone(),
        state.registry.clone(),
        state.guardian.clone(),
        Duration::from_secs(state.settings.guardian_tick_secs),
    ));

    listener.set_nonblocking(true)?;
    axum::Server::from_tcp(listener)?
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    guardian_task.abort();
    state.supervisor.shutdown_all().await;
    info!("shutdown complete");
    Ok(())
}
