use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self as axum_middleware},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::auth::expiry::SystemClock;
use crate::auth::refresh::RefreshFlights;
use crate::auth::{AuthManager, AuthSettings, ProviderFlag, TokenPair};
use crate::cache::{SharedCache, DEFAULT_SCOPE};
use crate::error::{ApiError, AuthError};
use crate::gate::{GateOutcome, GateRoutes, RedirectContext, RedirectThrottle};
use crate::middleware;
use crate::store::{CredentialBackend, SESSION_HEADER};

/// Application version from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub cache_api_key: String,

    /// Cache served on `/cache`
    pub cache: SharedCache,

    /// Cache the gate and session routes read credentials from
    pub backend: CredentialBackend,

    /// Pooled client for refresh and whoami calls
    pub http: Client,

    pub flights: RefreshFlights,
    pub throttle: RedirectThrottle,
    pub settings: Arc<AuthSettings>,
    pub gate_routes: Arc<GateRoutes>,
}

impl AppState {
    /// Service objects bound to one identity session
    pub fn manager_for(&self, session: &str) -> AuthManager {
        AuthManager::new(
            self.backend.store_for(session),
            self.http.clone(),
            self.flights.clone(),
            Arc::new(SystemClock),
            &self.settings,
        )
    }
}

/// Identity session named by the upstream session layer
fn session_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn require_session(headers: &HeaderMap) -> Result<String, ApiError> {
    session_id(headers)
        .ok_or_else(|| ApiError::ValidationError(format!("{} header is required", SESSION_HEADER)))
}

/// Health check routes (no authentication required)
pub fn health_routes() -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
}

/// Cache protocol routes (require the cache API key)
pub fn cache_routes(state: AppState) -> Router {
    Router::new()
        .route(
            "/cache",
            get(cache_get_handler)
                .post(cache_set_handler)
                .delete(cache_delete_handler),
        )
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::auth_middleware,
        ))
        .with_state(state)
}

/// Session lifecycle routes (require the cache API key)
pub fn session_routes(state: AppState) -> Router {
    Router::new()
        .route(
            "/session",
            axum::routing::post(sign_in_handler).delete(sign_out_handler),
        )
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::auth_middleware,
        ))
        .with_state(state)
}

/// Presence gate route, called by the page-rendering tier
pub fn gate_routes(state: AppState) -> Router {
    Router::new()
        .route("/gate", get(gate_handler))
        .with_state(state)
}

/// GET / - Simple health check
async fn root_handler() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "message": "Credential Gate is running",
        "version": VERSION
    }))
}

/// GET /health - Detailed health check
async fn health_handler() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
        "version": VERSION
    }))
}

#[derive(Deserialize)]
struct CacheQuery {
    key: String,
}

#[derive(Deserialize)]
struct CacheWrite {
    key: String,
    value: String,
}

#[derive(Deserialize)]
struct CacheKey {
    key: String,
}

fn cache_scope(headers: &HeaderMap) -> String {
    session_id(headers).unwrap_or_else(|| DEFAULT_SCOPE.to_string())
}

/// GET /cache?key=<k> - `{exists, value}`
async fn cache_get_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<CacheQuery>,
) -> Json<Value> {
    let value = state.cache.get(&cache_scope(&headers), &query.key);
    Json(json!({
        "exists": value.is_some(),
        "value": value,
    }))
}

/// POST /cache `{key, value}`
async fn cache_set_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CacheWrite>,
) -> Result<Json<Value>, ApiError> {
    if body.key.is_empty() {
        return Err(ApiError::ValidationError("key cannot be empty".to_string()));
    }
    state.cache.set(&cache_scope(&headers), &body.key, &body.value);
    Ok(Json(json!({ "status": "ok" })))
}

/// DELETE /cache `{key}`
async fn cache_delete_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CacheKey>,
) -> Json<Value> {
    let removed = state.cache.delete(&cache_scope(&headers), &body.key);
    Json(json!({ "status": "ok", "removed": removed }))
}

#[derive(Deserialize)]
struct SignInRequest {
    #[serde(default)]
    provider: ProviderFlag,
    access: String,
    refresh: String,
}

/// POST /session - store credentials issued by a completed login
async fn sign_in_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SignInRequest>,
) -> Result<Json<Value>, ApiError> {
    let session = require_session(&headers)?;
    let manager = state.manager_for(&session);

    manager
        .sign_in(body.provider, &TokenPair::new(body.access, body.refresh))
        .await
        .map_err(|e| match e {
            AuthError::MalformedRecord(msg) => ApiError::ValidationError(msg),
            other => ApiError::Credential(other),
        })?;

    Ok(Json(json!({
        "status": "ok",
        "provider": body.provider,
    })))
}

/// DELETE /session - logout
async fn sign_out_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let session = require_session(&headers)?;

    if !state.manager_for(&session).sign_out().await {
        return Err(ApiError::Credential(AuthError::Transport(
            "could not remove session credentials".to_string(),
        )));
    }

    Ok(Json(json!({ "status": "ok" })))
}

#[derive(Deserialize)]
struct GateQuery {
    path: Option<String>,
}

/// GET /gate?path=<p> - authorize a page render or redirect to login
async fn gate_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<GateQuery>,
) -> Response {
    let path = query
        .path
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| state.gate_routes.landing_path.clone());

    let Some(session) = session_id(&headers) else {
        let context = RedirectContext::new(
            &path,
            AuthError::NoCredentials.error_code(),
            &state.gate_routes,
        );
        let url = context.to_url(&state.gate_routes.login_path);
        return redirect_response(url, context);
    };

    let mut gate = state
        .manager_for(&session)
        .gate((*state.gate_routes).clone(), state.throttle.clone());

    match gate.mount(&path).await {
        GateOutcome::Authorized => Json(json!({ "state": "authorized" })).into_response(),
        GateOutcome::Redirect { url, context } => redirect_response(url, context),
        GateOutcome::Suppressed { context } => (
            StatusCode::UNAUTHORIZED,
            Json(json!({
                "state": "unauthorized",
                "error": context.error_code,
            })),
        )
            .into_response(),
    }
}

fn redirect_response(url: String, context: RedirectContext) -> Response {
    (
        StatusCode::TEMPORARY_REDIRECT,
        [(header::LOCATION, url.clone())],
        Json(json!({
            "state": "unauthorized",
            "error": context.error_code,
            "location": url,
        })),
    )
        .into_response()
}

/// State backed by an in-process cache, for handler and middleware tests
#[cfg(test)]
pub(crate) fn test_state(api_key: &str) -> AppState {
    use crate::auth::provider::ProviderEndpoints;
    use std::time::Duration;

    let cache = SharedCache::new();
    AppState {
        cache_api_key: api_key.to_string(),
        cache: cache.clone(),
        backend: CredentialBackend::Local(cache),
        http: Client::new(),
        flights: RefreshFlights::new(),
        throttle: RedirectThrottle::new(Duration::ZERO),
        settings: Arc::new(AuthSettings {
            endpoints: ProviderEndpoints {
                primary_refresh_url: "http://127.0.0.1:1/refresh".to_string(),
                secondary_refresh_url: "http://127.0.0.1:1/secondary/refresh".to_string(),
            },
            whoami_url: "http://127.0.0.1:1/whoami".to_string(),
            expiry_buffer_ms: 30_000,
            refresh_max_attempts: 1,
            refresh_backoff_base_ms: 0,
        }),
        gate_routes: Arc::new(GateRoutes::default()),
    }
}
