use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    http::{header, Request, StatusCode, Uri},
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::{error, Span};

use kapi_chat::{ChatService, CreateMessageRequest, NewChatRequest, StreamSession};
use kapi_core::{ChatId, ChatUpdate, KapiError, MessageId, Role};
use kapi_hub::PumpConfig;
use kapi_logging::redact_sensitive_data;

use crate::auth::{AuthUser, JwtKeys, SocketUser};

const DEFAULT_CHAT_LIMIT: u32 = 20;
const DEFAULT_MESSAGE_LIMIT: u32 = 50;

/// Shared application state for API handlers.
pub struct AppState {
    pub service: ChatService,
    pub jwt: JwtKeys,
    pub pumps: PumpConfig,
}

/// Build the Axum router with all API routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/auth/ws", get(ws_handler))
        .route("/messages", post(create_chat))
        .route("/chats", get(list_chats))
        .route(
            "/chats/:id",
            get(get_chat).put(update_chat).delete(delete_chat),
        )
        .route("/chats/:id/stream", post(stream_chat))
        .route(
            "/chats/:id/messages",
            get(list_messages).post(create_message),
        )
        .route(
            "/chats/:id/messages/:message_id",
            put(update_message).delete(delete_message),
        );

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http().make_span_with(request_span))
        .with_state(state)
}

/// Socket upgrades carry the bearer token in the query string, so the URI is
/// redacted before it is recorded.
fn request_span(request: &Request<Body>) -> Span {
    tracing::debug_span!(
        "request",
        method = %request.method(),
        uri = %redacted_uri(request.uri()),
        version = ?request.version(),
    )
}

fn redacted_uri(uri: &Uri) -> String {
    redact_sensitive_data(&uri.to_string())
}

/// `KapiError` as an HTTP response.
pub struct ApiError(KapiError);

impl From<KapiError> for ApiError {
    fn from(err: KapiError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            KapiError::NotFoundOrDenied | KapiError::NotFound(_) => {
                (StatusCode::NOT_FOUND, self.0.to_string())
            }
            KapiError::InvalidInput(_) => (StatusCode::BAD_REQUEST, self.0.to_string()),
            KapiError::Upstream(_) | KapiError::Storage(_) => {
                error!(error = %self.0, "Request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
struct Pagination {
    limit: Option<u32>,
    offset: Option<u32>,
}

#[derive(Debug, Serialize)]
struct PageInfo {
    limit: u32,
    offset: u32,
    count: usize,
}

#[derive(Debug, Default, Deserialize)]
struct StreamRequest {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    client_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpdateMessageRequest {
    content: String,
}

/// Health check endpoint.
async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let stats = state.service.hub().stats().await;
    Json(json!({
        "status": "ok",
        "service": "kapi",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": stats.connections,
        "users": stats.users,
    }))
}

async fn ws_handler(
    SocketUser(user_id): SocketUser,
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> Response {
    kapi_hub::upgrade(
        ws,
        state.service.hub().clone(),
        user_id,
        state.pumps.clone(),
    )
}

async fn create_chat(
    AuthUser(user_id): AuthUser,
    State(state): State<Arc<AppState>>,
    Json(request): Json<NewChatRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let chat = state
        .service
        .create_chat_with_message(user_id, request)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "data": chat })),
    ))
}

async fn list_chats(
    AuthUser(user_id): AuthUser,
    State(state): State<Arc<AppState>>,
    Query(page): Query<Pagination>,
) -> ApiResult<Json<Value>> {
    let limit = page.limit.unwrap_or(DEFAULT_CHAT_LIMIT);
    let offset = page.offset.unwrap_or(0);
    let chats = state.service.list_chats(user_id, limit, offset).await?;
    let info = PageInfo {
        limit,
        offset,
        count: chats.len(),
    };
    Ok(Json(json!({ "data": chats, "pagination": info })))
}

async fn get_chat(
    AuthUser(user_id): AuthUser,
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<ChatId>,
) -> ApiResult<Json<Value>> {
    let chat = state.service.get_chat(chat_id, user_id).await?;
    Ok(Json(json!({ "data": chat })))
}

async fn update_chat(
    AuthUser(user_id): AuthUser,
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<ChatId>,
    Json(update): Json<ChatUpdate>,
) -> ApiResult<Json<Value>> {
    let chat = state.service.update_chat(chat_id, user_id, update).await?;
    Ok(Json(json!({ "data": chat })))
}

async fn delete_chat(
    AuthUser(user_id): AuthUser,
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<ChatId>,
) -> ApiResult<Json<Value>> {
    state.service.delete_chat(chat_id, user_id).await?;
    Ok(Json(json!({ "message": "Chat deleted successfully" })))
}

async fn stream_chat(
    AuthUser(user_id): AuthUser,
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<ChatId>,
    body: Option<Json<StreamRequest>>,
) -> ApiResult<Response> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let session = state
        .service
        .stream_reply(chat_id, user_id, request.model, request.client_id)
        .await?;
    Ok(stream_response(session))
}

/// A user message is answered with the streamed assistant reply; an
/// assistant message is simply stored.
async fn create_message(
    AuthUser(user_id): AuthUser,
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<ChatId>,
    Json(request): Json<CreateMessageRequest>,
) -> ApiResult<Response> {
    let message = state
        .service
        .create_message(chat_id, user_id, &request)
        .await?;

    if request.role != Role::User {
        return Ok((StatusCode::CREATED, Json(json!({ "data": message }))).into_response());
    }

    let model = Some(request.model).filter(|m| !m.trim().is_empty());
    let session = state
        .service
        .stream_reply(chat_id, user_id, model, request.client_id)
        .await?;
    Ok(stream_response(session))
}

async fn list_messages(
    AuthUser(user_id): AuthUser,
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<ChatId>,
    Query(page): Query<Pagination>,
) -> ApiResult<Json<Value>> {
    let limit = page.limit.unwrap_or(DEFAULT_MESSAGE_LIMIT);
    let offset = page.offset.unwrap_or(0);
    let messages = state
        .service
        .list_messages(chat_id, user_id, limit, offset)
        .await?;
    let info = PageInfo {
        limit,
        offset,
        count: messages.len(),
    };
    Ok(Json(json!({ "data": messages, "pagination": info })))
}

async fn update_message(
    AuthUser(user_id): AuthUser,
    State(state): State<Arc<AppState>>,
    Path((chat_id, message_id)): Path<(ChatId, MessageId)>,
    Json(request): Json<UpdateMessageRequest>,
) -> ApiResult<Json<Value>> {
    let message = state
        .service
        .update_message(chat_id, user_id, message_id, &request.content)
        .await?;
    Ok(Json(json!({ "data": message })))
}

async fn delete_message(
    AuthUser(user_id): AuthUser,
    State(state): State<Arc<AppState>>,
    Path((chat_id, message_id)): Path<(ChatId, MessageId)>,
) -> ApiResult<Json<Value>> {
    state
        .service
        .delete_message(chat_id, user_id, message_id)
        .await?;
    Ok(Json(json!({ "message": "Message deleted successfully" })))
}

/// Chunked plain-text body fed by the session's direct output. The session
/// task keeps running if the client goes away.
fn stream_response(session: StreamSession) -> Response {
    let body = session.reply.into_text_stream().map(Ok::<_, Infallible>);
    (
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(body),
    )
        .into_response()
}
