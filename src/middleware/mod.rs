// Authentication and CORS middleware

use axum::{body::Body, extract::State, http::Request, middleware::Next, response::Response};
use tower_http::cors::{Any, CorsLayer};

use crate::error::ApiError;
use crate::routes::AppState;

/// Cache API key middleware
///
/// Verifies the key in the Authorization header or x-api-key header.
/// Expects format: "Bearer {CACHE_API_KEY}" or just the key in x-api-key.
pub async fn auth_middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    if let Some(auth_header) = request.headers().get("authorization") {
        if let Ok(auth_str) = auth_header.to_str() {
            let matches = auth_str
                .split_once(' ')
                .map(|(scheme, key)| {
                    scheme.eq_ignore_ascii_case("bearer") && key == state.cache_api_key
                })
                .unwrap_or(false);
            if matches {
                return Ok(next.run(request).await);
            }
        }
    }

    if let Some(api_key_header) = request.headers().get("x-api-key") {
        if let Ok(key_str) = api_key_header.to_str() {
            if key_str == state.cache_api_key {
                return Ok(next.run(request).await);
            }
        }
    }

    let request_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
    tracing::warn!(
        "[{}] Access attempt with invalid or missing API key: {} {}",
        request_id,
        request.method(),
        request.uri().path()
    );
    Err(ApiError::AuthError("Invalid or missing API Key".to_string()))
}

/// Create CORS middleware layer
///
/// Configures CORS to allow all origins, methods, and headers.
/// Handles OPTIONS preflight requests automatically.
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}
