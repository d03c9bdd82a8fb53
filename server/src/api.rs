use crate::{auth, config::Config, housekeeping, voice, webhook, ws};
use anyhow::{Context, Result};
use axum::{
    body::{Bytes, StreamBody},
    extract::{DefaultBodyLimit, Extension, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post},
    Json, Router,
};
use parley_core::{
    db, BlobRef, Chat, ChatError, Clock, ConversationRef, FriendStatus, FsBlobStore,
    Identity, SystemClock,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc};
use tokio_util::io::ReaderStream;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Page size when the client does not ask for one.
const DEFAULT_PAGE: usize = 50;

#[derive(Clone)]
pub struct AppState {
    pub chat: Arc<Chat>,
    pub blobs: Arc<FsBlobStore>,
    pub config: Arc<Config>,
    pub jwt_secret: Arc<Vec<u8>>,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: Config, clock: Arc<dyn Clock>) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("creating {}", config.data_dir.display()))?;
        let pool = db::open_pool(Some(&config.data_dir.join("parley.db")))?;
        let blobs = Arc::new(FsBlobStore::new(
            config.data_dir.join("blobs"),
            &config.public_url,
            clock.clone(),
        )?);
        let jwt_secret = match &config.jwt_secret {
            Some(secret) => secret.expose().clone(),
            None => {
                warn!("no auth.jwt_secret configured, generating a throwaway key");
                let mut secret = vec![0u8; 32];
                rand::thread_rng().fill_bytes(&mut secret);
                secret
            }
        };
        let chat = Arc::new(Chat::new(pool, clock, blobs.clone()));
        Ok(Self {
            chat,
            blobs,
            config: Arc::new(config),
            jwt_secret: Arc::new(jwt_secret),
        })
    }

    /// Start the job dispatcher and the periodic housekeeping sweep.
    pub fn spawn_background(&self) {
        tokio::spawn(self.chat.clone().run_dispatcher());
        housekeeping::spawn(self.clone());
    }
}

/// Build the HTTP application router.
pub fn build_router(state: AppState) -> Router {
    let require_identity = middleware::from_fn_with_state(state.clone(), auth::require_identity);
    let protected = Router::new()
        .route("/me", get(me))
        .route("/servers", get(list_servers).post(create_server))
        .route("/servers/:id", get(get_server))
        .route(
            "/servers/:id/channels",
            get(list_channels).post(create_channel),
        )
        .route("/servers/:id/members", get(server_members))
        .route("/servers/:id/invites", get(list_invites).post(create_invite))
        .route("/servers/:id/voice-token", get(voice::voice_token))
        .route("/channels/:id", get(get_channel).delete(delete_channel))
        .route("/invites/:id", get(get_invite).delete(revoke_invite))
        .route("/invites/:id/join", post(join_invite))
        .route("/dms", get(list_dms).post(create_dm))
        .route("/dms/:id", get(get_dm))
        .route("/friends", get(list_friends).post(send_friend_request))
        .route("/friends/pending", get(pending_friends))
        .route("/friends/:id", patch(update_friend))
        .route(
            "/conversations/:kind/:id/messages",
            get(list_messages).post(send_message),
        )
        .route(
            "/conversations/:kind/:id/typing",
            get(typing_users).put(start_typing).delete(stop_typing),
        )
        .route("/messages/:id", delete(delete_message))
        .route("/storage/upload-url", post(upload_url))
        .route("/storage/:id", get(download_blob).delete(delete_blob))
        .route_layer(require_identity.clone());
    let public = Router::new()
        .route("/health", get(health))
        .route("/identity/events", post(webhook::identity_events))
        .route(
            "/storage/upload/:token",
            post(upload_blob).layer(DefaultBodyLimit::max(
                state.config.max_upload_bytes() as usize,
            )),
        );
    let feed = Router::new()
        .route("/ws", get(ws::ws_handler))
        .route_layer(require_identity);
    Router::new()
        .nest("/api", public.merge(protected))
        .merge(feed)
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Serialize)]
struct ErrorResp {
    error: String,
    message: String,
}

/// Failure of an HTTP handler, rendered as `{ "error", "message" }`.
#[derive(Debug)]
pub enum ApiError {
    Chat(ChatError),
    BadRequest(&'static str),
    VoiceUnavailable,
    Internal(anyhow::Error),
}

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        ApiError::Chat(err)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

fn status_of(err: &ChatError) -> StatusCode {
    match err {
        ChatError::Unauthorized => StatusCode::UNAUTHORIZED,
        ChatError::NotFound(_) => StatusCode::NOT_FOUND,
        ChatError::NotAMember | ChatError::NotOwner => StatusCode::FORBIDDEN,
        ChatError::AlreadyExists(_) | ChatError::CannotDeleteDefaultChannel => {
            StatusCode::CONFLICT
        }
        ChatError::InviteExpired => StatusCode::GONE,
        ChatError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::Chat(err) if err.is_internal() => {
                error!("request failed: {err}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal",
                    "internal error".to_string(),
                )
            }
            ApiError::Chat(err) => (status_of(&err), err.code(), err.to_string()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "invalid_input", msg.to_string()),
            ApiError::VoiceUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "voice_unavailable",
                "voice rooms are not configured".to_string(),
            ),
            ApiError::Internal(err) => {
                error!("request failed: {err:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal",
                    "internal error".to_string(),
                )
            }
        };
        (
            status,
            Json(ErrorResp {
                error: code.into(),
                message,
            }),
        )
            .into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Parse the `:kind/:id` pair of a conversation route.
fn conversation(kind: &str, id: Uuid) -> ApiResult<ConversationRef> {
    match kind {
        "channel" | "channels" => Ok(ConversationRef::Channel(id)),
        "dm" | "dms" | "direct_message" => Ok(ConversationRef::DirectMessage(id)),
        _ => Err(ApiError::BadRequest("unknown conversation kind")),
    }
}

async fn me(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.chat.me(&identity)?))
}

// servers

#[derive(Deserialize)]
struct CreateServerReq {
    name: String,
    #[serde(default)]
    icon_id: Option<BlobRef>,
}

async fn list_servers(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.chat.list_servers(&identity)?))
}

async fn create_server(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<CreateServerReq>,
) -> ApiResult<impl IntoResponse> {
    let created = state.chat.create_server(&identity, &req.name, req.icon_id)?;
    info!(server = %created.server_id, "server created");
    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_server(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.chat.get_server(&identity, &id)?))
}

async fn server_members(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.chat.server_members(&identity, &id)?))
}

// channels

#[derive(Deserialize)]
struct CreateChannelReq {
    name: String,
}

async fn list_channels(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(server_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.chat.list_channels(&identity, &server_id)?))
}

async fn create_channel(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(server_id): Path<Uuid>,
    Json(req): Json<CreateChannelReq>,
) -> ApiResult<impl IntoResponse> {
    let channel = state.chat.create_channel(&identity, &server_id, &req.name)?;
    Ok((StatusCode::CREATED, Json(channel)))
}

async fn get_channel(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.chat.get_channel(&identity, &id)?))
}

async fn delete_channel(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    state.chat.remove_channel(&identity, &id)?;
    Ok(StatusCode::NO_CONTENT)
}

// invites

#[derive(Deserialize, Default)]
struct CreateInviteReq {
    #[serde(default)]
    max_uses: Option<u32>,
    #[serde(default)]
    expires_at: Option<i64>,
}

async fn list_invites(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(server_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.chat.list_invites(&identity, &server_id)?))
}

async fn create_invite(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(server_id): Path<Uuid>,
    Json(req): Json<CreateInviteReq>,
) -> ApiResult<impl IntoResponse> {
    let invite = state
        .chat
        .create_invite(&identity, &server_id, req.max_uses, req.expires_at)?;
    Ok((StatusCode::CREATED, Json(invite)))
}

async fn get_invite(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.chat.get_invite(&identity, &id)?))
}

async fn revoke_invite(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    state.chat.revoke_invite(&identity, &id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn join_invite(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.chat.join_invite(&identity, &id)?))
}

// direct messages

#[derive(Deserialize)]
struct CreateDmReq {
    username: String,
}

#[derive(Serialize)]
struct CreatedResp {
    id: Uuid,
}

async fn list_dms(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.chat.list_dms(&identity)?))
}

async fn create_dm(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<CreateDmReq>,
) -> ApiResult<impl IntoResponse> {
    let id = state.chat.create_dm(&identity, &req.username)?;
    Ok(Json(CreatedResp { id }))
}

async fn get_dm(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.chat.get_dm(&identity, &id)?))
}

// friends

#[derive(Deserialize)]
struct FriendReq {
    username: String,
}

#[derive(Deserialize)]
struct FriendStatusReq {
    status: FriendStatus,
}

async fn list_friends(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.chat.friends(&identity)?))
}

async fn pending_friends(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.chat.pending_friends(&identity)?))
}

async fn send_friend_request(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<FriendReq>,
) -> ApiResult<impl IntoResponse> {
    let friend = state.chat.send_friend_request(&identity, &req.username)?;
    Ok((StatusCode::CREATED, Json(friend)))
}

async fn update_friend(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<Uuid>,
    Json(req): Json<FriendStatusReq>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.chat.update_friend(&identity, &id, req.status)?))
}

// messages

#[derive(Deserialize)]
struct ListMessagesQuery {
    before: Option<Uuid>,
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct SendMessageReq {
    #[serde(default)]
    content: String,
    #[serde(default)]
    attachment: Option<BlobRef>,
}

async fn list_messages(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path((kind, id)): Path<(String, Uuid)>,
    Query(q): Query<ListMessagesQuery>,
) -> ApiResult<impl IntoResponse> {
    let conversation = conversation(&kind, id)?;
    let messages = state.chat.list_messages(
        &identity,
        conversation,
        q.before.as_ref(),
        q.limit.unwrap_or(DEFAULT_PAGE),
    )?;
    Ok(Json(messages))
}

async fn send_message(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path((kind, id)): Path<(String, Uuid)>,
    Json(req): Json<SendMessageReq>,
) -> ApiResult<impl IntoResponse> {
    let conversation = conversation(&kind, id)?;
    let message = state
        .chat
        .send_message(&identity, conversation, &req.content, req.attachment)?;
    Ok((StatusCode::CREATED, Json(message)))
}

async fn delete_message(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    state.chat.remove_message(&identity, &id)?;
    Ok(StatusCode::NO_CONTENT)
}

// typing

#[derive(Serialize)]
struct TypingResp {
    expires_at: i64,
}

async fn typing_users(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path((kind, id)): Path<(String, Uuid)>,
) -> ApiResult<impl IntoResponse> {
    let conversation = conversation(&kind, id)?;
    Ok(Json(state.chat.typing_users(&identity, conversation)?))
}

async fn start_typing(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path((kind, id)): Path<(String, Uuid)>,
) -> ApiResult<impl IntoResponse> {
    let conversation = conversation(&kind, id)?;
    let expires_at = state.chat.start_typing(&identity, conversation)?;
    Ok(Json(TypingResp { expires_at }))
}

async fn stop_typing(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path((kind, id)): Path<(String, Uuid)>,
) -> ApiResult<impl IntoResponse> {
    let conversation = conversation(&kind, id)?;
    state.chat.stop_typing(&identity, conversation)?;
    Ok(StatusCode::NO_CONTENT)
}

// storage

#[derive(Serialize)]
struct UploadUrlResp {
    url: String,
}

#[derive(Serialize)]
struct UploadResp {
    storage_id: BlobRef,
}

#[derive(Deserialize)]
struct UploadQuery {
    name: Option<String>,
}

async fn upload_url(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> ApiResult<impl IntoResponse> {
    let url = state.chat.upload_url(&identity)?;
    Ok(Json(UploadUrlResp { url: url.into() }))
}

/// Receives the object body posted to a generated upload URL. The token in
/// the path is the only credential.
async fn upload_blob(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Query(q): Query<UploadQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let mime = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| {
            q.name
                .as_deref()
                .and_then(|n| mime_guess::from_path(n).first())
                .map(|m| m.to_string())
        })
        .unwrap_or_else(|| "application/octet-stream".into());
    let storage_id = state.blobs.store(&token, &mime, body).await?;
    Ok(Json(UploadResp { storage_id }))
}

async fn download_blob(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    let (path, meta) = state
        .blobs
        .open(&BlobRef(id))?
        .ok_or(ChatError::NotFound("blob"))?;
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|_| ChatError::NotFound("blob"))?;
    let body = StreamBody::new(ReaderStream::new(file));
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&meta.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    if let Ok(etag) = HeaderValue::from_str(&format!("\"{}\"", meta.sha256)) {
        headers.insert(header::ETAG, etag);
    }
    Ok((headers, body).into_response())
}

async fn delete_blob(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    state.chat.remove_attachment(&identity, &BlobRef(id))?;
    Ok(StatusCode::NO_CONTENT)
}

/// Run the HTTP server with the provided configuration until Ctrl-C.
pub async fn run_http_server(config: Config) -> Result<()> {
    let addr: SocketAddr = config.bind.parse().context("invalid bind address")?;
    let state = AppState::new(config)?;
    state.spawn_background();
    info!(%addr, public_url = %state.config.public_url, "listening");
    axum::Server::bind(&addr)
        .serve(build_router(state).into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;
    Ok(())
}
