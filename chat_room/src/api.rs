use crate::{
    config::Config,
    db,
    error::ChatError,
    hotlink, housekeeping,
    identity::{identity_middleware, Identity},
    messages::checked_room,
    room::ChatRoom,
    ws,
};
use anyhow::{Context, Result};
use axum::extract::ws::WebSocketUpgrade;
use axum::{
    body::StreamBody,
    extract::{DefaultBodyLimit, Extension, Multipart, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use once_cell::sync::Lazy;
use regex::Regex;
use room_api::{ChatMessage, SendMessage, UploadedImage};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio_util::io::ReaderStream;
use tracing::{error, info};

/// Room for multipart framing on top of the image itself.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

static DATE_SEGMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{8}$").expect("valid regex"));
static NAME_SEGMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}\.(png|jpg|gif|webp)$")
        .expect("valid regex")
});

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub chat: ChatRoom,
}

impl AppState {
    pub async fn new(config: Config) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .with_context(|| format!("creating {}", config.data_dir.display()))?;
        tokio::fs::create_dir_all(&config.room.image_dir)
            .await
            .with_context(|| format!("creating {}", config.room.image_dir.display()))?;
        let pool = db::open_pool(Some(config.database_path().as_path())).context("opening database")?;
        let chat = ChatRoom::new(config.room.clone(), pool);
        Ok(Self { config, chat })
    }
}

/// Build the HTTP application router.
pub fn build_router(state: AppState) -> Router {
    let upload_limit = state.config.room.image_max_bytes as usize + MULTIPART_OVERHEAD;
    let protected = Router::new()
        .route("/api/chat/ws", get(ws_handler))
        .route("/api/chat/messages", get(list_messages).post(post_message))
        .route(
            "/api/chat/images",
            post(upload_image).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .layer(middleware::from_fn(identity_middleware));
    Router::new()
        .route("/api/health", get(health))
        .route("/api/chat/images/:date/:name", get(serve_image))
        .merge(protected)
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Serialize)]
struct ErrorResp {
    error: String,
}

type ApiError = (StatusCode, Json<ErrorResp>);

fn err(status: StatusCode, msg: &str) -> ApiError {
    (status, Json(ErrorResp { error: msg.into() }))
}

fn chat_err(e: ChatError) -> ApiError {
    let status = match &e {
        ChatError::RoomDisabled | ChatError::ImagesDisabled => StatusCode::FORBIDDEN,
        ChatError::ImageTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        ChatError::UnsupportedImage => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        e if e.is_validation() => StatusCode::BAD_REQUEST,
        _ => {
            error!(error = %e, "request failed");
            return err(StatusCode::INTERNAL_SERVER_ERROR, "internal_error");
        }
    };
    err(status, &e.to_string())
}

#[derive(Deserialize)]
struct HistoryQuery {
    room: Option<String>,
    limit: Option<i64>,
    before_id: Option<i64>,
}

async fn list_messages(
    State(state): State<AppState>,
    Query(q): Query<HistoryQuery>,
) -> Result<Json<Vec<ChatMessage>>, ApiError> {
    let room = checked_room(q.room.as_deref()).map_err(chat_err)?;
    let messages = state
        .chat
        .history(&room, q.limit.unwrap_or(0), q.before_id.unwrap_or(0))
        .await
        .map_err(chat_err)?;
    Ok(Json(messages))
}

async fn post_message(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<SendMessage>,
) -> Result<(StatusCode, Json<ChatMessage>), ApiError> {
    let msg = state.chat.post(&identity, req).await.map_err(chat_err)?;
    Ok((StatusCode::CREATED, Json(msg)))
}

async fn upload_image(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadedImage>, ApiError> {
    let field = multipart
        .next_field()
        .await
        .map_err(|e| err(e.into_response().status(), "invalid_upload"))?
        .ok_or_else(|| err(StatusCode::BAD_REQUEST, "missing_file"))?;
    let data = field
        .bytes()
        .await
        .map_err(|e| err(e.into_response().status(), "invalid_upload"))?;
    let uploaded = state.chat.upload_image(data).await.map_err(chat_err)?;
    info!(url = %uploaded.url, size = uploaded.size, "image uploaded");
    Ok(Json(uploaded))
}

async fn serve_image(
    State(state): State<AppState>,
    Path((date, name)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, StatusCode> {
    if !DATE_SEGMENT.is_match(&date) || !NAME_SEGMENT.is_match(&name) {
        return Err(StatusCode::NOT_FOUND);
    }
    let settings = state.chat.settings();
    if settings.anti_hotlink_enabled {
        let referer = headers.get(header::REFERER).and_then(|v| v.to_str().ok());
        let host = headers.get(header::HOST).and_then(|v| v.to_str().ok());
        if !hotlink::referer_allowed(referer, host, &settings.allowed_referers) {
            return Err(StatusCode::FORBIDDEN);
        }
    }
    let path = state.chat.images().root().join(&date).join(&name);
    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|_| StatusCode::NOT_FOUND)?;
    let mime = mime_guess::from_path(&path).first_or_octet_stream();
    let mut out = HeaderMap::new();
    out.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime.essence_str())
            .unwrap_or(HeaderValue::from_static("application/octet-stream")),
    );
    out.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=31536000, immutable"),
    );
    Ok((out, StreamBody::new(ReaderStream::new(file))))
}

#[derive(Deserialize)]
struct WsQuery {
    room: Option<String>,
}

async fn ws_handler(
    upgrade: WebSocketUpgrade,
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Query(q): Query<WsQuery>,
) -> Result<Response, ApiError> {
    if !state.chat.settings().enabled {
        return Err(chat_err(ChatError::RoomDisabled));
    }
    let room = checked_room(q.room.as_deref()).map_err(chat_err)?;
    let chat = state.chat.clone();
    Ok(upgrade.on_upgrade(move |socket| ws::session(socket, chat, identity, Some(room))))
}

/// Run the HTTP server and the housekeeping task until Ctrl-C.
pub async fn run(config: Config) -> Result<()> {
    let addr: SocketAddr = config
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", config.bind))?;
    let state = AppState::new(config).await?;
    let housekeeping = housekeeping::spawn(state.chat.clone());
    info!(%addr, "chat room listening");
    axum::Server::bind(&addr)
        .serve(build_router(state).into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    housekeeping.abort();
    Ok(())
}
