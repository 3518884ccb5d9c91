// src/middleware/auth.rs
use crate::models::auth::{Claims, ErrorResponse};
use crate::AppState;
use axum::{
    extract::{Extension, Request},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use jsonwebtoken::{decode, DecodingKey, Validation};
use std::sync::Arc;

/// Tokens are issued elsewhere; this side only verifies them.
pub fn verify_jwt_token(token: &str, secret: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_ref()),
        &Validation::default(),
    )?;

    Ok(token_data.claims)
}

fn unauthorized(message: &str) -> (StatusCode, Json<ErrorResponse>) {
    (StatusCode::UNAUTHORIZED, Json(ErrorResponse::new(message)))
}

pub async fn auth_middleware(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    mut request: Request,
    next: Next,
) -> Result<Response, impl IntoResponse> {
    let auth_header = match headers.get("Authorization") {
        Some(header) => header,
        None => return Err(unauthorized("Missing Authorization header")),
    };

    let auth_str = match auth_header.to_str() {
        Ok(str) => str,
        Err(_) => return Err(unauthorized("Invalid Authorization header format")),
    };

    let token = match auth_str.strip_prefix("Bearer ") {
        Some(token) => token.trim(),
        None => {
            return Err(unauthorized(
                "Invalid Authorization header format. Expected 'Bearer <token>'",
            ))
        }
    };

    let claims = match verify_jwt_token(token, &state.config.jwt_secret) {
        Ok(claims) => claims,
        Err(e) => {
            tracing::warn!("JWT verification failed: {}", e);
            return Err(unauthorized("Invalid or expired token"));
        }
    };

    // Handlers read the caller's identity from here
    request.extensions_mut().insert(claims);

    Ok(next.run(request).await)
}
