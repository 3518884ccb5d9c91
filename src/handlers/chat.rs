// src/handlers/chat.rs
use crate::middleware::auth::auth_middleware;
use crate::models::auth::{Claims, ErrorResponse};
use crate::models::chat::{Chat, CreateChatRequest, Message, SendMessageRequest};
use crate::models::quota::LimitStatus;
use crate::services::message_pipeline::{PipelineError, StreamEvent, TurnResult};
use crate::AppState;
use axum::{
    extract::{DefaultBodyLimit, Extension, Path},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::{get, post},
    Router,
};
use futures::stream::{Stream, StreamExt};
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Serialize)]
struct LimitReachedResponse {
    success: bool,
    error: &'static str,
    message: String,
    limit: LimitStatus,
}

#[derive(Serialize)]
struct ChatResponse {
    success: bool,
    chat: Chat,
}

#[derive(Serialize)]
struct ChatListResponse {
    success: bool,
    chats: Vec<Chat>,
}

#[derive(Serialize)]
struct MessageListResponse {
    success: bool,
    messages: Vec<Message>,
}

#[derive(Serialize)]
struct SendMessageResponse {
    success: bool,
    #[serde(flatten)]
    turn: TurnResult,
}

/// Attachments a single send is sized for.
const ATTACHMENTS_PER_SEND: usize = 4;

/// Request body ceiling for a send: base64 grows payloads by 4/3, plus room for the JSON around them.
/// Oversized individual files still reach the ingestor and are skipped there.
pub fn send_body_limit(max_upload_bytes: usize) -> usize {
    max_upload_bytes
        .saturating_mul(ATTACHMENTS_PER_SEND)
        .saturating_mul(4)
        / 3
        + 64 * 1024
}

pub fn chat_routes(max_upload_bytes: usize) -> Router {
    let body_limit = DefaultBodyLimit::max(send_body_limit(max_upload_bytes));
    Router::new()
        .route("/api/chats", post(create_chat).get(list_chats))
        .route(
            "/api/chats/:chat_id/messages",
            get(list_messages).post(send_message).layer(body_limit.clone()),
        )
        .route("/api/chats/:chat_id/messages/stream", post(stream_message).layer(body_limit))
        .layer(axum::middleware::from_fn(auth_middleware))
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(ErrorResponse::new(message))).into_response()
}

pub(crate) fn internal_error(context: &str, e: impl std::fmt::Display) -> Response {
    tracing::error!("{}: {}", context, e);
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
}

/// Maps failures that happen before any assistant turn exists.
pub(crate) fn pipeline_error_response(e: PipelineError) -> Response {
    match e {
        PipelineError::Validation(message) => error_response(StatusCode::BAD_REQUEST, message),
        PipelineError::ChatNotFound(_) => error_response(StatusCode::NOT_FOUND, "Chat not found"),
        PipelineError::LimitReached(limit) => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(LimitReachedResponse {
                success: false,
                error: "limit_reached",
                message: format!(
                    "You have used all {} messages for this period. Your allowance resets on {}.",
                    limit.ceiling,
                    limit.resets_at.format("%B %d, %Y")
                ),
                limit,
            }),
        )
            .into_response(),
        PipelineError::Storage(e) => internal_error("Chat storage failure", e),
    }
}

fn to_sse_event(event: &StreamEvent) -> Event {
    Event::default()
        .event(event.name())
        .json_data(event)
        .unwrap_or_else(|e| {
            tracing::error!("Failed to encode stream event: {}", e);
            Event::default().event("error").data("{\"type\":\"error\"}")
        })
}

async fn create_chat(
    Extension(state): Extension<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    body: Option<Json<CreateChatRequest>>,
) -> Response {
    let registry = state.bridge.registry();
    let model = body
        .and_then(|Json(req)| req.model)
        .unwrap_or_else(|| registry.default_model().to_string());

    if registry.resolve(&model).is_err() {
        return error_response(StatusCode::BAD_REQUEST, format!("Unknown model: {}", model));
    }

    match state.chat_store.create_chat(&claims.sub, &model).await {
        Ok(chat) => {
            tracing::info!("Created chat {} for user {} ({})", chat.id, claims.sub, model);
            (StatusCode::CREATED, Json(ChatResponse { success: true, chat })).into_response()
        }
        Err(e) => internal_error("Failed to create chat", e),
    }
}

async fn list_chats(
    Extension(state): Extension<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
) -> Response {
    match state.chat_store.list_chats(&claims.sub).await {
        Ok(chats) => Json(ChatListResponse { success: true, chats }).into_response(),
        Err(e) => internal_error("Failed to list chats", e),
    }
}

async fn list_messages(
    Extension(state): Extension<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Path(chat_id): Path<Uuid>,
) -> Response {
    match state.chat_store.find_chat_by_id(chat_id, &claims.sub).await {
        Ok(Some(_)) => {}
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "Chat not found"),
        Err(e) => return internal_error("Failed to load chat", e),
    }

    match state.chat_store.list_messages(chat_id).await {
        Ok(messages) => Json(MessageListResponse { success: true, messages }).into_response(),
        Err(e) => internal_error("Failed to list messages", e),
    }
}

async fn send_message(
    Extension(state): Extension<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Path(chat_id): Path<Uuid>,
    Json(body): Json<SendMessageRequest>,
) -> Response {
    match state.pipeline.send(&claims.sub, chat_id, body.into()).await {
        Ok(turn) => Json(SendMessageResponse { success: true, turn }).into_response(),
        Err(e) => pipeline_error_response(e),
    }
}

/// SSE variant. Dropping the response stream (client disconnect) cancels generation.
async fn stream_message(
    Extension(state): Extension<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Path(chat_id): Path<Uuid>,
    Json(body): Json<SendMessageRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, Response> {
    let turn = state
        .pipeline
        .begin_stream(&claims.sub, chat_id, body.into())
        .await
        .map_err(pipeline_error_response)?;

    let (tx, rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();

    let pipeline = state.pipeline.clone();
    let run_cancel = cancel.clone();
    let message_id = turn.placeholder_id();
    tokio::spawn(async move {
        let outcome = pipeline.run_stream(turn, tx, run_cancel).await;
        tracing::info!("Stream for message {} finished: {:?}", message_id, outcome);
    });

    let guard = cancel.drop_guard();
    let events = UnboundedReceiverStream::new(rx).map(move |event| {
        let _held = &guard;
        Ok(to_sse_event(&event))
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}
