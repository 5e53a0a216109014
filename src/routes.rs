use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use std::{collections::HashMap, sync::Arc, time::{Duration, Instant}};
use parking_lot::RwLock;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn, error};
use uuid::Uuid;
use chrono::Utc;

use crate::{
    download,
    encoder::{FileHandle, MemoryFile},
    models::{PreviewRequest, PromptRequest, StateSnapshot},
    orchestrator::BatchOrchestrator,
    state::{Studio, StudioError},
};

/// Bounds on how many sessions are kept and for how long.
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    pub idle_ttl: Duration,
    pub max_sessions: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self { idle_ttl: Duration::from_secs(60 * 60), max_sessions: 256 }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<RwLock<HashMap<Uuid, Arc<Studio>>>>,
    pub orchestrator: Arc<BatchOrchestrator>,
    pub generation_count: usize,
    pub limits: SessionLimits,
}

impl AppState {
    pub fn new(orchestrator: Arc<BatchOrchestrator>, generation_count: usize) -> Self {
        Self { sessions: Arc::default(), orchestrator, generation_count, limits: SessionLimits::default() }
    }

    pub fn with_limits(mut self, limits: SessionLimits) -> Self {
        self.limits = limits;
        self
    }

    fn studio(&self, id: Uuid) -> Result<Arc<Studio>, ApiError> {
        let studio = self.sessions.read().get(&id).cloned().ok_or(ApiError::NotFound)?;
        studio.touch();
        Ok(studio)
    }

    /// Drops sessions idle for longer than the TTL. Sessions with a batch in
    /// flight are kept.
    pub fn evict_idle(&self, now: Instant) -> usize {
        let ttl = self.limits.idle_ttl;
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, studio| studio.is_generating() || studio.idle_for(now) <= ttl);
        let evicted = before - sessions.len();
        if evicted > 0 {
            info!("🧹 Evicted {} idle session(s), {} remaining", evicted, sessions.len());
        }
        evicted
    }

    fn insert(&self, studio: Arc<Studio>) -> Result<(), ApiError> {
        self.evict_idle(Instant::now());
        let mut sessions = self.sessions.write();
        if sessions.len() >= self.limits.max_sessions {
            let now = Instant::now();
            let oldest = sessions
                .iter()
                .filter(|(_, s)| !s.is_generating())
                .max_by_key(|(_, s)| s.idle_for(now))
                .map(|(id, _)| *id)
                .ok_or(ApiError::Unavailable("too many active sessions"))?;
            sessions.remove(&oldest);
            info!("🧹 Session cap reached, evicted least recently used session {}", oldest);
        }
        sessions.insert(studio.id(), studio);
        Ok(())
    }
}

#[derive(Debug)]
pub enum ApiError {
    NotFound,
    BadRequest(String),
    Conflict(&'static str),
    Unavailable(&'static str),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound => (StatusCode::NOT_FOUND, "session not found".to_string()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg.to_string()),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.to_string()),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/:id", get(get_session).delete(delete_session))
        .route("/api/sessions/:id/images", post(upload_images).delete(clear_images))
        .route("/api/sessions/:id/prompt", put(set_prompt))
        .route("/api/sessions/:id/generate", post(generate))
        .route("/api/sessions/:id/preview", put(select_preview).delete(close_preview))
        .route("/api/sessions/:id/preview/download", get(download_preview))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        )
        .with_state(state)
}

pub async fn create_session(State(state): State<AppState>) -> Result<Json<StateSnapshot>, ApiError> {
    let studio = Arc::new(Studio::new(state.orchestrator.clone(), state.generation_count));
    let snapshot = studio.snapshot();
    state.insert(studio)?;
    info!("🆕 Created session {}", snapshot.id);
    Ok(Json(snapshot))
}

pub async fn get_session(Path(id): Path<Uuid>, State(state): State<AppState>) -> Result<Json<StateSnapshot>, ApiError> {
    Ok(Json(state.studio(id)?.snapshot()))
}

pub async fn delete_session(Path(id): Path<Uuid>, State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.sessions.write().remove(&id).ok_or(ApiError::NotFound)?;
    info!("🗑️ Deleted session {}", id);
    Ok(StatusCode::NO_CONTENT)
}

pub async fn upload_images(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<StateSnapshot>, ApiError> {
    let studio = state.studio(id)?;

    let mut files: Vec<Box<dyn FileHandle>> = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("invalid multipart body: {}", e)))?
    {
        let Some(name) = field.file_name().map(String::from) else { continue };
        let content_type = field.content_type().map(String::from);
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(format!("failed to read '{}': {}", name, e)))?;
        files.push(Box::new(MemoryFile { name, content_type, bytes }));
    }

    if files.is_empty() {
        return Err(ApiError::BadRequest("no files in upload".into()));
    }

    // Encode failures land in the snapshot's error_message.
    if let Err(e) = studio.upload_images(files).await {
        warn!("⚠️ Upload to session {} rejected: {}", id, e);
    }
    Ok(Json(studio.snapshot()))
}

pub async fn clear_images(Path(id): Path<Uuid>, State(state): State<AppState>) -> Result<Json<StateSnapshot>, ApiError> {
    let studio = state.studio(id)?;
    studio.clear_images();
    Ok(Json(studio.snapshot()))
}

pub async fn set_prompt(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Json(body): Json<PromptRequest>,
) -> Result<Json<StateSnapshot>, ApiError> {
    let studio = state.studio(id)?;
    studio.set_prompt(body.prompt);
    Ok(Json(studio.snapshot()))
}

pub async fn generate(Path(id): Path<Uuid>, State(state): State<AppState>) -> Result<Json<StateSnapshot>, ApiError> {
    let studio = state.studio(id)?;
    // The batch runs on its own task so a client disconnect cannot cut it short.
    let task = tokio::spawn({
        let studio = Arc::clone(&studio);
        async move { studio.generate().await }
    });
    match task.await {
        Ok(Ok(_)) => {}
        Ok(Err(StudioError::AlreadyGenerating)) => {
            return Err(ApiError::Conflict("a generation is already in progress"));
        }
        Ok(Err(e)) => warn!("⚠️ Generation for session {} did not complete: {}", id, e),
        Err(e) => error!("❌ Generation task for session {} failed: {}", id, e),
    }
    Ok(Json(studio.snapshot()))
}

pub async fn select_preview(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Json(body): Json<PreviewRequest>,
) -> Result<Json<StateSnapshot>, ApiError> {
    let studio = state.studio(id)?;
    let image = studio
        .snapshot()
        .generated_images
        .get(body.index)
        .cloned()
        .ok_or_else(|| ApiError::BadRequest(format!("no generated image at index {}", body.index)))?;
    studio.select_preview(image);
    Ok(Json(studio.snapshot()))
}

pub async fn close_preview(Path(id): Path<Uuid>, State(state): State<AppState>) -> Result<Json<StateSnapshot>, ApiError> {
    let studio = state.studio(id)?;
    studio.close_preview();
    Ok(Json(studio.snapshot()))
}

pub async fn download_preview(Path(id): Path<Uuid>, State(state): State<AppState>) -> Result<Response, ApiError> {
    let studio = state.studio(id)?;
    let encoded = studio
        .snapshot()
        .selected_preview
        .ok_or_else(|| ApiError::BadRequest("no image selected for preview".into()))?;
    let bytes = download::decode_image(&encoded).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let name = download::file_name(Utc::now());
    info!("💾 Session {} downloading {} ({} bytes)", id, name, bytes.len());
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "image/jpeg".to_string()),
            (header::CONTENT_DISPOSITION, format!("attachment; filename=\"{}\"", name)),
        ],
        bytes,
    ).into_response())
}
