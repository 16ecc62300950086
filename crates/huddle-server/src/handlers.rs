//! HTTP surface of the Huddle server.
//!
//! REST endpoints for identities, tokens, uploads and link previews, plus the
//! WebSocket route served by [`crate::gateway`].

use crate::config::Config;
use crate::gateway;
use crate::metrics;
use crate::preview::HttpLinkPreviewer;
use crate::storage::DiskFileStore;
use anyhow::{Context, Result};
use axum::{
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use huddle_core::{
    CoreError, Engine, EngineHandle, FileArrival, FileStore, Hub, LinkPreviewer, NoPreviews, Store,
};
use huddle_protocol::Token;
use serde::Deserialize;
use serde_json::{json, Value};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// Front of the engine actor.
    pub engine: EngineHandle,
    /// Server configuration.
    pub config: Config,
    /// Upload storage shared with the engine.
    pub files: Arc<dyn FileStore>,
    /// Link preview source.
    pub previewer: Arc<dyn LinkPreviewer>,
}

impl AppState {
    /// Assemble state from already running parts.
    #[must_use]
    pub fn new(
        engine: EngineHandle,
        config: Config,
        files: Arc<dyn FileStore>,
        previewer: Arc<dyn LinkPreviewer>,
    ) -> Self {
        Self {
            engine,
            config,
            files,
            previewer,
        }
    }

    /// Open the database and upload directory and start the engine.
    ///
    /// # Errors
    ///
    /// Returns an error if the database or upload directory is unusable.
    pub async fn build(config: Config) -> Result<Self> {
        if let Some(parent) = config.database.file_path().as_deref().and_then(|p| p.parent()) {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        let store = Store::connect(&config.store_config())
            .await
            .with_context(|| format!("Failed to open database {}", config.database.url))?;

        std::fs::create_dir_all(&config.storage.upload_dir).with_context(|| {
            format!(
                "Failed to create upload directory {}",
                config.storage.upload_dir.display()
            )
        })?;
        let files: Arc<dyn FileStore> = Arc::new(DiskFileStore::new(
            &config.storage.upload_dir,
            &config.storage.public_prefix,
        ));

        let previewer: Arc<dyn LinkPreviewer> = if config.previews.enabled {
            Arc::new(HttpLinkPreviewer::new(Duration::from_millis(
                config.previews.timeout_ms,
            ))?)
        } else {
            Arc::new(NoPreviews)
        };

        let (engine, _task) = Engine::new(store, Arc::new(Hub::new()), Arc::clone(&files))
            .with_config(config.engine_config())
            .start();

        Ok(Self::new(engine, config, files, previewer))
    }
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let state = Arc::new(AppState::build(config.clone()).await?);
    let sweeper = state
        .engine
        .spawn_sweeper(config.sweep_interval(), |report| metrics::record_swept(report.removed));

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Huddle server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}/ws", addr);

    let result = serve(listener, state).await;
    sweeper.abort();
    result
}

/// Serve the application on an already bound listener.
///
/// # Errors
///
/// Returns an error if the server stops with an I/O failure.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// Build the router.
pub fn app(state: Arc<AppState>) -> Router {
    let upload_limit = state.config.limits.max_upload_size;
    let uploads = ServeDir::new(&state.config.storage.upload_dir);
    let prefix = state.config.storage.public_prefix.clone();

    Router::new()
        .route("/ws", get(gateway::ws_handler))
        .route("/health", get(health_handler))
        .route("/api/user/identify", post(identify_handler))
        .route("/api/user/rename", post(rename_handler))
        .route("/api/qr/generate-pairing", post(pairing_token_handler))
        .route("/api/qr/generate-room", post(room_token_handler))
        .route(
            "/api/upload",
            post(upload_handler).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/api/metadata", post(metadata_handler))
        .nest_service(&prefix, uploads)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Failure of a REST request.
#[derive(Debug, Error)]
pub enum ApiError {
    /// A required field is missing or unacceptable.
    #[error("{0}")]
    BadRequest(String),

    /// The engine refused or failed the request.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// The upload could not be stored.
    #[error("Storage error: {0}")]
    Storage(#[from] io::Error),

    /// The multipart body is malformed.
    #[error(transparent)]
    Multipart(#[from] MultipartError),
}

impl ApiError {
    fn missing(what: &str) -> Self {
        ApiError::BadRequest(format!("Missing {what}"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message.clone()),
            ApiError::Core(e) => {
                let status =
                    StatusCode::from_u16(e.code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                let message = match e.to_event() {
                    huddle_protocol::Event::Error { message, .. } => message,
                    _ => e.to_string(),
                };
                (status, message)
            }
            ApiError::Storage(e) if e.kind() == io::ErrorKind::InvalidInput => {
                (StatusCode::BAD_REQUEST, "Invalid room.".to_string())
            }
            ApiError::Storage(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal error".to_string(),
            ),
            ApiError::Multipart(e) => (e.status(), e.body_text()),
        };

        if status.is_server_error() {
            error!(error = %self, "Request failed");
            metrics::record_error("http");
        } else {
            debug!(error = %self, "Request rejected");
        }

        (status, Json(json!({ "success": false, "error": message }))).into_response()
    }
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.engine.hub().stats();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": stats.connection_count,
        "rooms": stats.room_count,
    }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentifyRequest {
    #[serde(default)]
    user_id: Option<String>,
}

async fn identify_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Option<Json<IdentifyRequest>>,
) -> Result<Json<Value>, ApiError> {
    let Json(request) = body.unwrap_or_default();
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok());

    let user = state
        .engine
        .identify(request.user_id, device_name(user_agent))
        .await?;
    Ok(Json(json!({ "success": true, "user": user })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RenameRequest {
    user_id: Option<String>,
    new_name: Option<String>,
}

async fn rename_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RenameRequest>,
) -> Result<Json<Value>, ApiError> {
    let (Some(user_id), Some(name)) = (request.user_id, request.new_name) else {
        return Err(ApiError::missing("data"));
    };
    let user = state.engine.rename(user_id, name).await?;
    Ok(Json(json!({ "success": true, "user": user })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PairingTokenRequest {
    user_id: Option<String>,
}

async fn pairing_token_handler(
    Json(request): Json<PairingTokenRequest>,
) -> Result<Json<Value>, ApiError> {
    let user_id = non_empty(request.user_id).ok_or_else(|| ApiError::missing("userId"))?;
    let token = Token::Pairing(user_id).to_string();
    Ok(Json(json!({ "success": true, "token": token })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoomTokenRequest {
    room_id: Option<String>,
}

async fn room_token_handler(Json(request): Json<RoomTokenRequest>) -> Result<Json<Value>, ApiError> {
    let room_id = non_empty(request.room_id).ok_or_else(|| ApiError::missing("roomId"))?;
    let token = Token::Room(room_id).to_string();
    Ok(Json(json!({ "success": true, "token": token })))
}

#[derive(Debug, Default)]
struct UploadForm {
    user_id: Option<String>,
    room_id: Option<String>,
    client_id: Option<String>,
    file: Option<(String, bytes::Bytes)>,
}

async fn upload_handler(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let mut form = UploadForm::default();
    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let file_name = field.file_name().unwrap_or("file").to_string();
                form.file = Some((file_name, field.bytes().await?));
            }
            "userId" => form.user_id = Some(field.text().await?),
            "room_id" | "roomId" => form.room_id = Some(field.text().await?),
            "client_id" | "clientId" => form.client_id = Some(field.text().await?),
            other => debug!(field = %other, "Ignoring upload field"),
        }
    }

    let (Some(user_id), Some(room_id)) = (non_empty(form.user_id), non_empty(form.room_id)) else {
        return Err(ApiError::missing("user or room"));
    };
    let Some((file_name, bytes)) = form.file else {
        return Err(ApiError::BadRequest(
            "File rejected or not provided".to_string(),
        ));
    };
    if state.config.storage.is_blocked(&file_name) {
        warn!(user = %user_id, file = %file_name, "Blocked upload");
        return Err(ApiError::BadRequest(
            "File extension not allowed for security reasons.".to_string(),
        ));
    }

    state.engine.ensure_member(&user_id, &room_id).await?;
    let file = state.files.save(&room_id, &file_name, &bytes).await?;
    let message = state
        .engine
        .file_arrived(FileArrival {
            user_id,
            room_id,
            file_name,
            file,
            client_id: non_empty(form.client_id),
        })
        .await?;
    metrics::record_message_created("file");

    Ok(Json(json!({ "success": true, "message": message })))
}

#[derive(Debug, Deserialize)]
struct MetadataRequest {
    url: Option<String>,
}

async fn metadata_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<MetadataRequest>,
) -> Result<Json<Value>, ApiError> {
    let url = non_empty(request.url).ok_or_else(|| ApiError::missing("url"))?;
    Ok(Json(match state.previewer.preview(&url).await {
        Some(metadata) => json!({ "success": true, "metadata": metadata }),
        None => json!({ "success": false }),
    }))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Default display name for a new user, `"<OS> (<Browser>)"`.
#[must_use]
pub fn device_name(user_agent: Option<&str>) -> String {
    let Some(ua) = user_agent.filter(|ua| !ua.trim().is_empty()) else {
        return "Unknown Device".to_string();
    };

    let os = if ua.contains("Android") {
        "Android"
    } else if ua.contains("iPhone") || ua.contains("iPad") {
        "iOS"
    } else if ua.contains("Win") {
        "Windows"
    } else if ua.contains("Mac") {
        "MacOS"
    } else if ua.contains("Linux") {
        "Linux"
    } else {
        "Unknown OS"
    };

    let browser = if ua.contains("Edg") {
        "Edge"
    } else if ua.contains("Firefox") {
        "Firefox"
    } else if ua.contains("Chrome") {
        "Chrome"
    } else if ua.contains("Safari") {
        "Safari"
    } else {
        "Unknown Browser"
    };

    format!("{os} ({browser})")
}
