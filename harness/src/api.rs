//! The HTTP API (spec §6): a thin external collaborator consuming the
//! core Store + task registry contracts. Mirrors the teacher's
//! dispatcher-server shape: bind a `TcpListener`, serve with
//! `.with_graceful_shutdown(..)` driven by a `watch::Receiver`, handlers
//! returning `Result<Json<_>, ApiError>` where `ApiError: IntoResponse`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use taskhub_core::model::{CronEntry, RunFilter, RunStatus};
use taskhub_core::task::TaskRegistry;
use taskhub_core::{ErrorKind, Store};
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::worker::registry_snapshot;

#[derive(Clone)]
struct AppState {
    store: Arc<dyn Store>,
    registry: Arc<dyn TaskRegistry>,
    data_dir: std::path::PathBuf,
}

pub async fn run(
    store: Arc<dyn Store>,
    registry: Arc<dyn TaskRegistry>,
    data_dir: std::path::PathBuf,
    bind_addr: &str,
) -> anyhow::Result<()> {
    let addr: SocketAddr = bind_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("parse TASKHUB_BIND_ADDR={bind_addr}: {e}"))?;
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;

    let state = Arc::new(AppState {
        store,
        registry,
        data_dir,
    });
    let app = build_router(state);

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tracing::info!(addr = %local_addr, "api listening");

    let server = axum::serve(listener, app.into_make_service()).with_graceful_shutdown(async move {
        while !*shutdown_rx.borrow() {
            if shutdown_rx.changed().await.is_err() {
                break;
            }
        }
    });

    tokio::select! {
        res = server => {
            res?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("api shutting down (ctrl-c)");
            let _ = shutdown_tx.send(true);
        }
    }

    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/tasks/:task_id/runs", post(enqueue_run))
        .route("/runs", get(list_runs))
        .route("/runs/:run_id", get(get_run))
        .route("/runs/:run_id/cancel", post(cancel_run))
        .route("/runs/:run_id/events", get(list_events))
        .route("/runs/:run_id/artifacts", get(list_artifacts))
        .route("/runs/:run_id/files/:file_id", get(get_file))
        .route("/workers", get(list_workers))
        .route("/cron", get(list_cron).post(create_cron))
        .route("/cron/:cron_id", delete(delete_cron))
        .route("/cron/:cron_id/trigger", post(trigger_cron))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct EnqueueRunRequest {
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize)]
struct EnqueueRunResponse {
    run_id: String,
}

async fn enqueue_run(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
    Json(req): Json<EnqueueRunRequest>,
) -> ApiResult<Json<EnqueueRunResponse>> {
    let registry_snap = registry_snapshot(state.registry.as_ref());
    let run_id = state
        .store
        .enqueue_run(&task_id, req.params, None, &registry_snap)
        .await
        .map_err(ApiError::from_store_error)?;
    Ok(Json(EnqueueRunResponse { run_id }))
}

#[derive(Debug, Deserialize)]
struct ListRunsQuery {
    task_id: Option<String>,
    status: Option<String>,
    limit: Option<i64>,
}

async fn list_runs(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ListRunsQuery>,
) -> ApiResult<Json<Vec<taskhub_core::model::Run>>> {
    let status = match q.status {
        Some(s) => Some(
            RunStatus::parse(&s.to_uppercase())
                .ok_or_else(|| ApiError::bad_request("invalid status filter"))?,
        ),
        None => None,
    };
    let filter = RunFilter {
        task_id: q.task_id,
        status,
        limit: q.limit.unwrap_or(100),
    };
    let runs = state.store.list_runs(&filter).await.map_err(ApiError::internal)?;
    Ok(Json(runs))
}

async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<taskhub_core::model::Run>> {
    let run = state
        .store
        .get_run(&run_id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::not_found("unknown run_id"))?;
    Ok(Json(run))
}

async fn cancel_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<StatusCode> {
    state
        .store
        .request_cancel(&run_id)
        .await
        .map_err(ApiError::internal)?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    cursor: Option<i64>,
    limit: Option<i64>,
}

#[derive(Debug, Serialize)]
struct EventsResponse {
    items: Vec<taskhub_core::model::Event>,
    next_cursor: i64,
}

async fn list_events(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
    Query(q): Query<EventsQuery>,
) -> ApiResult<Json<EventsResponse>> {
    let (items, next_cursor) = state
        .store
        .list_events(&run_id, q.cursor.unwrap_or(0), q.limit.unwrap_or(500))
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(EventsResponse { items, next_cursor }))
}

async fn list_artifacts(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<Vec<taskhub_core::model::Artifact>>> {
    let artifacts = state
        .store
        .list_artifacts(&run_id)
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(artifacts))
}

async fn get_file(
    State(state): State<Arc<AppState>>,
    Path((run_id, file_id)): Path<(String, String)>,
) -> ApiResult<axum::response::Response> {
    let artifacts = state
        .store
        .list_artifacts(&run_id)
        .await
        .map_err(ApiError::internal)?;
    let artifact = artifacts
        .into_iter()
        .find(|a| a.file_id == file_id)
        .ok_or_else(|| ApiError::not_found("unknown file_id"))?;

    let run_dir = state.data_dir.join("runs").join(&run_id);
    let abs_path = run_dir.join(&artifact.path);
    let canonical_run_dir = tokio::fs::canonicalize(&run_dir)
        .await
        .map_err(ApiError::internal)?;
    let canonical_path = tokio::fs::canonicalize(&abs_path)
        .await
        .map_err(|_| ApiError::not_found("artifact file missing on disk"))?;
    if !canonical_path.starts_with(&canonical_run_dir) {
        return Err(ApiError::internal(anyhow::anyhow!(
            "artifact path escapes run directory"
        )));
    }

    let bytes = tokio::fs::read(&canonical_path)
        .await
        .map_err(ApiError::internal)?;
    Ok((
        [(axum::http::header::CONTENT_TYPE, artifact.mime.clone())],
        bytes,
    )
        .into_response())
}

async fn list_workers(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<taskhub_core::model::WorkerRecord>>> {
    let workers = state.store.list_workers().await.map_err(ApiError::internal)?;
    Ok(Json(workers))
}

async fn list_cron(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<CronEntry>>> {
    let entries = state.store.list_cron().await.map_err(ApiError::internal)?;
    Ok(Json(entries))
}

#[derive(Debug, Deserialize)]
struct CreateCronRequest {
    task_id: String,
    cron_expression: String,
    #[serde(default)]
    params: Value,
    name: String,
}

async fn create_cron(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateCronRequest>,
) -> ApiResult<Json<CronEntry>> {
    if state.registry.get(&req.task_id).is_none() {
        return Err(ApiError::not_found("unknown task_id"));
    }
    let now = chrono::Utc::now();
    let next_run_at = taskhub_core::cron::next_after(&req.cron_expression, now)
        .map_err(|e| ApiError::bad_request_owned(e.to_string()))?;

    let entry = CronEntry {
        cron_id: format!("c-{}", ulid::Ulid::new()),
        task_id: req.task_id,
        cron_expression: req.cron_expression,
        params: req.params,
        name: req.name,
        is_enabled: true,
        next_run_at,
        last_run_at: None,
    };
    state.store.insert_cron(&entry).await.map_err(ApiError::internal)?;
    Ok(Json(entry))
}

async fn delete_cron(
    State(state): State<Arc<AppState>>,
    Path(cron_id): Path<String>,
) -> ApiResult<StatusCode> {
    state.store.delete_cron(&cron_id).await.map_err(ApiError::internal)?;
    Ok(StatusCode::NO_CONTENT)
}

/// "Run now": inserts a one-off run directly, bypassing `next_run_at` and
/// leaving the entry's cadence untouched.
async fn trigger_cron(
    State(state): State<Arc<AppState>>,
    Path(cron_id): Path<String>,
) -> ApiResult<Json<EnqueueRunResponse>> {
    let entries = state.store.list_cron().await.map_err(ApiError::internal)?;
    let entry = entries
        .into_iter()
        .find(|e| e.cron_id == cron_id)
        .ok_or_else(|| ApiError::not_found("unknown cron_id"))?;

    let registry_snap = registry_snapshot(state.registry.as_ref());
    let run_id = state
        .store
        .enqueue_run(&entry.task_id, entry.params, Some(&entry.cron_id), &registry_snap)
        .await
        .map_err(ApiError::from_store_error)?;
    Ok(Json(EnqueueRunResponse { run_id }))
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.to_string(),
        }
    }

    fn bad_request(message: &str) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.to_string(),
        }
    }

    fn bad_request_owned(message: String) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message,
        }
    }

    fn conflict(message: &str) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: message.to_string(),
        }
    }

    fn internal<E: std::fmt::Display>(err: E) -> Self {
        tracing::error!(error = %err, "api internal error");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "internal error".to_string(),
        }
    }

    /// Maps a `Store` error to an HTTP status, surfacing `UnknownTask`/
    /// `Disabled` (raised by `enqueue_run` itself) as 404/409 instead of
    /// flattening them into a generic 500.
    fn from_store_error(err: taskhub_core::Error) -> Self {
        match err.kind() {
            ErrorKind::UnknownTask => Self::not_found("unknown task_id"),
            ErrorKind::Disabled => Self::conflict("task is disabled"),
            _ => Self::internal(err),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = Json(serde_json::json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}
