// src/handlers/keys.rs
// Per-user provider API keys. Keys are write-only over HTTP; listing returns provider names only.
use crate::ai::ProviderKind;
use crate::handlers::chat::internal_error;
use crate::middleware::auth::auth_middleware;
use crate::models::auth::{Claims, ErrorResponse};
use crate::AppState;
use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, put},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Deserialize)]
pub struct SetKeyRequest {
    pub api_key: String,
}

#[derive(Serialize)]
struct ProvidersResponse {
    success: bool,
    providers: Vec<ProviderKind>,
}

#[derive(Serialize)]
struct KeyUpdatedResponse {
    success: bool,
    provider: ProviderKind,
}

pub fn key_routes() -> Router {
    Router::new()
        .route("/api/keys", get(list_keys))
        .route("/api/keys/:provider", put(set_key).delete(delete_key))
        .layer(axum::middleware::from_fn(auth_middleware))
}

fn parse_provider(raw: &str) -> Result<ProviderKind, Response> {
    raw.parse::<ProviderKind>().map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new(format!("Unknown provider: {}", raw))),
        )
            .into_response()
    })
}

async fn list_keys(
    Extension(state): Extension<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
) -> Response {
    match state.credentials.list_providers(&claims.sub).await {
        Ok(providers) => Json(ProvidersResponse { success: true, providers }).into_response(),
        Err(e) => internal_error("Failed to list provider keys", e),
    }
}

async fn set_key(
    Extension(state): Extension<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Path(provider): Path<String>,
    Json(body): Json<SetKeyRequest>,
) -> Response {
    let provider = match parse_provider(&provider) {
        Ok(provider) => provider,
        Err(response) => return response,
    };

    let api_key = body.api_key.trim();
    if api_key.is_empty() {
        return (StatusCode::BAD_REQUEST, Json(ErrorResponse::new("api_key must not be empty"))).into_response();
    }

    match state.credentials.set_key(&claims.sub, provider, api_key).await {
        Ok(()) => {
            tracing::info!("Stored {} key for user {}", provider, claims.sub);
            Json(KeyUpdatedResponse { success: true, provider }).into_response()
        }
        Err(e) => internal_error("Failed to store provider key", e),
    }
}

async fn delete_key(
    Extension(state): Extension<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Path(provider): Path<String>,
) -> Response {
    let provider = match parse_provider(&provider) {
        Ok(provider) => provider,
        Err(response) => return response,
    };

    match state.credentials.delete_key(&claims.sub, provider).await {
        Ok(true) => Json(KeyUpdatedResponse { success: true, provider }).into_response(),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new(format!("No {} key configured", provider))),
        )
            .into_response(),
        Err(e) => internal_error("Failed to delete provider key", e),
    }
}
