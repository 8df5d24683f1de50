use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ws::WebSocketUpgrade, ConnectInfo, DefaultBodyLimit, Path, Query, State},
    http::{header, Method},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};
use uuid::Uuid;

use murmur_shared::protocol::Recipient;

use crate::config::ServerConfig;
use crate::connection;
use crate::error::ServerError;
use crate::hub::Hub;

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub config: Arc<ServerConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check).fallback(method_not_allowed))
        .route("/ws", get(ws_upgrade).fallback(method_not_allowed))
        .route("/upload/start", post(upload_start).fallback(method_not_allowed))
        .route("/upload/chunk", post(upload_chunk).fallback(method_not_allowed))
        .route("/upload/finish", post(upload_finish).fallback(method_not_allowed))
        .route("/download/{file}", get(download).fallback(method_not_allowed))
        .route("/check-file", get(check_file).fallback(method_not_allowed))
        .layer(DefaultBodyLimit::max(state.config.max_chunk_bytes))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct UploadStartResponse {
    uuid: Uuid,
}

#[derive(Serialize)]
struct StatusResponse {
    status: &'static str,
}

#[derive(Serialize)]
struct CheckFileResponse {
    exists: bool,
}

#[derive(Deserialize)]
struct ChunkQuery {
    uuid: Option<String>,
}

#[derive(Deserialize)]
struct FinishRequest {
    uuid: String,
    #[serde(default)]
    filename: Option<String>,
}

#[derive(Deserialize)]
struct CheckFileQuery {
    uuid: Option<String>,
    from: Option<String>,
    to: Option<String>,
}

async fn method_not_allowed(method: Method) -> ServerError {
    ServerError::MethodNotAllowed(method.to_string())
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn ws_upgrade(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    debug!(peer = %peer, "WebSocket upgrade");
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| connection::serve_socket(socket, hub))
}

fn parse_upload_id(raw: Option<&str>) -> Result<Uuid, ServerError> {
    let raw = raw
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ServerError::BadRequest("Missing uuid".into()))?;
    Uuid::parse_str(raw).map_err(|_| ServerError::BadRequest(format!("Invalid uuid: {raw}")))
}

async fn upload_start(
    State(state): State<AppState>,
) -> Result<Json<UploadStartResponse>, ServerError> {
    let uuid = state.hub.start_upload().await?;
    Ok(Json(UploadStartResponse { uuid }))
}

async fn upload_chunk(
    State(state): State<AppState>,
    Query(query): Query<ChunkQuery>,
    body: Bytes,
) -> Result<Json<StatusResponse>, ServerError> {
    let uuid = parse_upload_id(query.uuid.as_deref())?;
    state.hub.append_chunk(uuid, &body).await?;
    Ok(Json(StatusResponse {
        status: "chunk received",
    }))
}

async fn upload_finish(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<StatusResponse>, ServerError> {
    let request: FinishRequest = serde_json::from_slice(&body)
        .map_err(|e| ServerError::BadRequest(format!("Invalid finish request: {e}")))?;
    let uuid = parse_upload_id(Some(&request.uuid))?;
    state.hub.finish_upload(uuid, request.filename).await?;
    Ok(Json(StatusResponse {
        status: "upload finished",
    }))
}

/// `/download/<uuid>`, with any extension after the identifier ignored.
async fn download(
    State(state): State<AppState>,
    Path(file): Path<String>,
) -> Result<Response, ServerError> {
    let id = file.split('.').next().unwrap_or_default();
    let uuid = Uuid::parse_str(id).map_err(|_| ServerError::FileNotFound(file.clone()))?;
    let download = state.hub.download(uuid).await?;

    let disposition = format!(
        "attachment; filename=\"{}\"",
        header_safe_filename(&download.filename)
    );
    info!(uuid = %uuid, size = download.size, "Blob downloaded via API");

    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_LENGTH, download.size.to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        Body::from_stream(ReaderStream::new(download.file)),
    )
        .into_response())
}

fn header_safe_filename(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_ascii_graphic() || c == ' ' => c,
            _ => '_',
        })
        .collect()
}

async fn check_file(
    State(state): State<AppState>,
    Query(query): Query<CheckFileQuery>,
) -> Result<Json<CheckFileResponse>, ServerError> {
    let raw = query
        .uuid
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ServerError::BadRequest("Missing uuid".into()))?;
    let from = query
        .from
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ServerError::BadRequest("Missing from".into()))?;

    let exists = match Uuid::parse_str(&raw) {
        Ok(uuid) => {
            let to = Recipient::parse(query.to.as_deref());
            state.hub.share_existing(uuid, &from, to).await
        }
        Err(_) => false,
    };
    Ok(Json(CheckFileResponse { exists }))
}

pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
