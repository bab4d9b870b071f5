//! HTTP API and progress WebSocket.
//!
//! Everything is scoped by an opaque session id handed out by
//! `POST /api/session`: the Immich connection, job ownership, and the
//! progress socket all key off it. A job id from another session is
//! indistinguishable from a missing one.

use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Semaphore};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::artifacts::{self, ArtifactStore, RangeSpec};
use crate::config::{resolve_relative_to, AppConfig};
use crate::encoder::FfmpegEncoder;
use crate::immich::{filename_matches, Album, Asset, ImmichClient, ServerVersion};
use crate::jobs::{JobRegistry, JobSnapshot, JobStatus};
use crate::options::RenderOptions;
use crate::pipeline::{self, PipelineContext};
use crate::progress::ProgressHub;

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    registry: Arc<JobRegistry>,
    hub: Arc<ProgressHub>,
    store: Arc<ArtifactStore>,
    semaphore: Arc<Semaphore>,
    sessions: DashMap<String, DateTime<Utc>>,
    immich_clients: DashMap<String, Arc<ImmichClient>>,
    encoder: Arc<FfmpegEncoder>,
    config: AppConfig,
}

impl AppState {
    pub fn new(config: AppConfig, data_dir: &std::path::Path) -> Self {
        let output_dir = resolve_relative_to(data_dir, &config.paths.output_dir);
        let frames_dir = resolve_relative_to(data_dir, &config.paths.frames_dir);
        let max_concurrent = config.jobs.max_concurrent.max(1);

        Self {
            inner: Arc::new(AppStateInner {
                registry: Arc::new(JobRegistry::new()),
                hub: Arc::new(ProgressHub::new()),
                store: Arc::new(ArtifactStore::new(output_dir, frames_dir)),
                semaphore: Arc::new(Semaphore::new(max_concurrent)),
                sessions: DashMap::new(),
                immich_clients: DashMap::new(),
                encoder: Arc::new(FfmpegEncoder::new()),
                config,
            }),
        }
    }

    pub fn registry(&self) -> Arc<JobRegistry> {
        Arc::clone(&self.inner.registry)
    }

    pub fn store(&self) -> Arc<ArtifactStore> {
        Arc::clone(&self.inner.store)
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    fn pipeline_context(&self) -> PipelineContext {
        PipelineContext {
            registry: Arc::clone(&self.inner.registry),
            hub: Arc::clone(&self.inner.hub),
            store: Arc::clone(&self.inner.store),
            semaphore: Arc::clone(&self.inner.semaphore),
        }
    }

    fn require_session(&self, session_id: &str) -> Result<(), AppError> {
        if self.inner.sessions.contains_key(session_id) {
            Ok(())
        } else {
            Err(AppError::Unauthorized("unknown session".to_string()))
        }
    }

    fn immich_client(&self, session_id: &str) -> Result<Arc<ImmichClient>, AppError> {
        self.require_session(session_id)?;
        self.inner
            .immich_clients
            .get(session_id)
            .map(|entry| Arc::clone(&entry))
            .ok_or_else(|| AppError::BadRequest("not connected to Immich".to_string()))
    }
}

// ─── Router ──────────────────────────────────────────────────────────────────

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/session", post(create_session))
        .route("/api/immich/connect", post(immich_connect))
        .route("/api/immich/disconnect", post(immich_disconnect))
        .route("/api/immich/albums", get(immich_albums))
        .route("/api/immich/assets", get(immich_assets))
        .route("/api/immich/thumbnail/{asset_id}", get(immich_thumbnail))
        .route("/api/timelapse", post(create_timelapse).get(list_timelapses))
        .route(
            "/api/timelapse/{job_id}",
            get(get_timelapse).delete(delete_timelapse),
        )
        .route("/api/timelapse/{job_id}/preview", get(preview_timelapse))
        .route("/api/timelapse/{job_id}/download", get(download_timelapse))
        .route("/api/ws", any(progress_ws))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ─── Wire types ──────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    session_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectRequest {
    session_id: String,
    server_url: String,
    api_key: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConnectResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    server_version: Option<ServerVersion>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionQuery {
    session_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssetQuery {
    session_id: String,
    album_id: Option<String>,
    date_from: Option<DateTime<Utc>>,
    date_to: Option<DateTime<Utc>>,
    filename: Option<String>,
    limit: Option<usize>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateTimelapseRequest {
    session_id: String,
    asset_ids: Vec<String>,
    options: RenderOptions,
}

#[derive(Serialize)]
struct ProgressEvent {
    #[serde(rename = "type")]
    type_: &'static str,
    job: JobSnapshot,
}

// ─── Session & Immich handlers ───────────────────────────────────────────────

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn create_session(State(state): State<AppState>) -> Json<SessionResponse> {
    let session_id = Uuid::new_v4().to_string();
    state.inner.sessions.insert(session_id.clone(), Utc::now());
    info!(session_id = %session_id, "session created");
    Json(SessionResponse { session_id })
}

async fn immich_connect(
    State(state): State<AppState>,
    Json(req): Json<ConnectRequest>,
) -> Result<Json<ConnectResponse>, AppError> {
    state.require_session(&req.session_id)?;

    let client = ImmichClient::new(&req.server_url, &req.api_key)
        .map_err(|e| AppError::BadRequest(e.to_string()))?;

    let valid = client
        .validate_connection()
        .await
        .map_err(|e| AppError::BadRequest(format!("{e:#}")))?;
    if !valid {
        return Err(AppError::Unauthorized(
            "Immich rejected the API key".to_string(),
        ));
    }

    // Version is informational; a connect should not fail on it.
    let server_version = match client.server_version().await {
        Ok(version) => Some(version),
        Err(e) => {
            warn!(error = %e, "connected but failed to read Immich version");
            None
        }
    };

    state
        .inner
        .immich_clients
        .insert(req.session_id.clone(), Arc::new(client));
    info!(session_id = %req.session_id, "Immich connection stored");

    Ok(Json(ConnectResponse {
        success: true,
        server_version,
    }))
}

async fn immich_disconnect(
    State(state): State<AppState>,
    Json(query): Json<SessionQuery>,
) -> Result<StatusCode, AppError> {
    state.require_session(&query.session_id)?;
    state.inner.immich_clients.remove(&query.session_id);
    Ok(StatusCode::NO_CONTENT)
}

async fn immich_albums(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> Result<Json<Vec<Album>>, AppError> {
    let client = state.immich_client(&query.session_id)?;
    let albums = client.get_albums().await?;
    Ok(Json(albums))
}

async fn immich_assets(
    State(state): State<AppState>,
    Query(query): Query<AssetQuery>,
) -> Result<Json<Vec<Asset>>, AppError> {
    let client = state.immich_client(&query.session_id)?;

    let mut assets = match &query.album_id {
        Some(album_id) => client.get_album_assets(album_id).await?,
        None => client.get_all_assets(query.date_from, query.date_to).await?,
    };

    // Album listings still honor the date window.
    if query.album_id.is_some() {
        if let Some(from) = query.date_from {
            assets.retain(|asset| asset.file_created_at >= from);
        }
        if let Some(to) = query.date_to {
            assets.retain(|asset| asset.file_created_at <= to);
        }
    }

    if let Some(pattern) = query.filename.as_deref() {
        assets.retain(|asset| filename_matches(pattern, &asset.original_file_name));
    }

    // Capture-time order is frame order in the final video.
    assets.sort_by(|a, b| a.file_created_at.cmp(&b.file_created_at));

    if let Some(limit) = query.limit {
        assets.truncate(limit);
    }

    Ok(Json(assets))
}

async fn immich_thumbnail(
    State(state): State<AppState>,
    Path(asset_id): Path<String>,
    Query(query): Query<SessionQuery>,
) -> Result<Response, AppError> {
    let client = state.immich_client(&query.session_id)?;

    match client.get_asset_thumbnail(&asset_id).await? {
        Some(bytes) => Ok((
            [
                (header::CONTENT_TYPE, "image/jpeg"),
                (header::CACHE_CONTROL, "private, max-age=3600"),
            ],
            bytes,
        )
            .into_response()),
        None => Err(AppError::NotFound(format!(
            "thumbnail not available: {asset_id}"
        ))),
    }
}

// ─── Timelapse handlers ──────────────────────────────────────────────────────

async fn create_timelapse(
    State(state): State<AppState>,
    Json(req): Json<CreateTimelapseRequest>,
) -> Result<(StatusCode, Json<JobSnapshot>), AppError> {
    state.require_session(&req.session_id)?;

    if req.asset_ids.is_empty() {
        return Err(AppError::BadRequest(
            "assetIds must not be empty".to_string(),
        ));
    }
    let max_assets = state.inner.config.jobs.max_assets_per_job;
    if req.asset_ids.len() > max_assets {
        return Err(AppError::BadRequest(format!(
            "too many assets: {} (limit {max_assets})",
            req.asset_ids.len()
        )));
    }
    req.options
        .validate()
        .map_err(|e| AppError::BadRequest(e.to_string()))?;

    let client = state.immich_client(&req.session_id)?;

    let job = state
        .inner
        .registry
        .create(&req.session_id, req.asset_ids.len() as u64);
    let snapshot = JobSnapshot::from(&job);

    info!(
        job_id = %job.id,
        session_id = %req.session_id,
        assets = req.asset_ids.len(),
        "timelapse job accepted"
    );

    tokio::spawn(pipeline::run_job(
        state.pipeline_context(),
        client,
        Arc::clone(&state.inner.encoder),
        job,
        req.asset_ids,
        req.options,
    ));

    Ok((StatusCode::ACCEPTED, Json(snapshot)))
}

async fn list_timelapses(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> Result<Json<Vec<JobSnapshot>>, AppError> {
    state.require_session(&query.session_id)?;
    Ok(Json(state.inner.registry.list_by_session(&query.session_id)))
}

async fn get_timelapse(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Query(query): Query<SessionQuery>,
) -> Result<Json<JobSnapshot>, AppError> {
    state.require_session(&query.session_id)?;
    state
        .inner
        .registry
        .get(&job_id, &query.session_id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("job not found: {job_id}")))
}

async fn delete_timelapse(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Query(query): Query<SessionQuery>,
) -> Result<StatusCode, AppError> {
    state.require_session(&query.session_id)?;

    let removed = state
        .inner
        .registry
        .remove(&job_id, &query.session_id)
        .ok_or_else(|| AppError::NotFound(format!("job not found: {job_id}")))?;

    if let Some(output) = &removed.output_path {
        state.inner.store.remove_output(output).await;
    }
    info!(job_id = %job_id, "timelapse job deleted");
    Ok(StatusCode::NO_CONTENT)
}

fn completed_output(
    state: &AppState,
    job_id: &str,
    session_id: &str,
) -> Result<PathBuf, AppError> {
    state.require_session(session_id)?;
    let snapshot = state
        .inner
        .registry
        .get(job_id, session_id)
        .ok_or_else(|| AppError::NotFound(format!("job not found: {job_id}")))?;
    if snapshot.status != JobStatus::Completed {
        return Err(AppError::BadRequest(format!(
            "job is not completed: {job_id}"
        )));
    }
    state
        .inner
        .registry
        .output_path(job_id, session_id)
        .ok_or_else(|| AppError::NotFound(format!("output missing for job: {job_id}")))
}

async fn preview_timelapse(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let path = completed_output(&state, &job_id, &query.session_id)?;

    let metadata = tokio::fs::metadata(&path)
        .await
        .map_err(|_| AppError::NotFound(format!("output missing for job: {job_id}")))?;
    let file_size = metadata.len();

    let content_type = mime_guess::from_path(&path)
        .first_or_octet_stream()
        .to_string();

    let range_header = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok());

    match artifacts::parse_range_header(range_header, file_size) {
        RangeSpec::Unsatisfiable => Ok((
            StatusCode::RANGE_NOT_SATISFIABLE,
            [(header::CONTENT_RANGE, format!("bytes */{file_size}"))],
        )
            .into_response()),
        RangeSpec::Partial { start, end } => {
            let stream = artifacts::open_range(&path, start, end).await?;
            let response = Response::builder()
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::CONTENT_TYPE, &content_type)
                .header(header::ACCEPT_RANGES, "bytes")
                .header(header::CONTENT_LENGTH, end - start + 1)
                .header(
                    header::CONTENT_RANGE,
                    format!("bytes {start}-{end}/{file_size}"),
                )
                .body(Body::from_stream(stream))
                .map_err(|e| AppError::Internal(e.to_string()))?;
            Ok(response)
        }
        RangeSpec::Full => {
            let body = if file_size == 0 {
                Body::empty()
            } else {
                Body::from_stream(artifacts::open_range(&path, 0, file_size - 1).await?)
            };
            let response = Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, &content_type)
                .header(header::ACCEPT_RANGES, "bytes")
                .header(header::CONTENT_LENGTH, file_size)
                .body(body)
                .map_err(|e| AppError::Internal(e.to_string()))?;
            Ok(response)
        }
    }
}

async fn download_timelapse(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Query(query): Query<SessionQuery>,
) -> Result<Response, AppError> {
    let path = completed_output(&state, &job_id, &query.session_id)?;

    let metadata = tokio::fs::metadata(&path)
        .await
        .map_err(|_| AppError::NotFound(format!("output missing for job: {job_id}")))?;
    let file_size = metadata.len();

    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("timelapse_{job_id}.mp4"));
    let content_type = mime_guess::from_path(&path)
        .first_or_octet_stream()
        .to_string();

    let body = if file_size == 0 {
        Body::empty()
    } else {
        Body::from_stream(artifacts::open_range(&path, 0, file_size - 1).await?)
    };

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, file_size)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{filename}\""),
        )
        .body(body)
        .map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(response)
}

// ─── Progress WebSocket ──────────────────────────────────────────────────────

async fn progress_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> Result<Response, AppError> {
    state.require_session(&query.session_id)?;
    let rx = state.inner.hub.subscribe(&query.session_id);
    Ok(ws.on_upgrade(move |socket| handle_ws(socket, rx)))
}

async fn handle_ws(mut socket: WebSocket, mut rx: broadcast::Receiver<JobSnapshot>) {
    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(snapshot) => {
                        let event = ProgressEvent {
                            type_: "timelapse_progress",
                            job: snapshot,
                        };
                        let json = match serde_json::to_string(&event) {
                            Ok(j) => j,
                            Err(_) => break,
                        };
                        if socket.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("WebSocket receiver lagged by {n} messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break;
                    }
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    _ => {}
                }
            }
        }
    }
}

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse { error: message });
        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(format!("{err:#}"))
    }
}
