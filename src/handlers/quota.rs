// src/handlers/quota.rs
use crate::handlers::chat::internal_error;
use crate::middleware::auth::auth_middleware;
use crate::models::auth::Claims;
use crate::models::quota::LimitStatus;
use crate::AppState;
use axum::{
    extract::Extension,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::Serialize;
use std::sync::Arc;

#[derive(Serialize)]
struct QuotaResponse {
    success: bool,
    quota: LimitStatus,
}

pub fn quota_routes() -> Router {
    Router::new()
        .route("/api/quota", get(get_quota))
        .layer(axum::middleware::from_fn(auth_middleware))
}

async fn get_quota(
    Extension(state): Extension<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
) -> Response {
    match state.quota.check_limit(&claims.sub).await {
        Ok(quota) => Json(QuotaResponse { success: true, quota }).into_response(),
        Err(e) => internal_error("Failed to load quota", e),
    }
}
