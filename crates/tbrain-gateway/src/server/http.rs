//! HTTP transport: axum router, middleware pipeline, and auth endpoints.
//!
//! The pipeline is an explicit, statically ordered chain:
//! rate limiter → CSRF (issue/validate) → security headers → auth composer →
//! external handler. Public endpoints (`/health`, `{base}/info`) and the
//! OAuth/key-management endpoints bypass the composer explicitly; the latter
//! two authenticate by other means (PKCE, admin header).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, Request, State};
use axum::http::header::{self, HeaderValue};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use chrono::{SecondsFormat, Utc};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::auth::api_key::ApiKeyStore;
use crate::auth::csrf::CsrfGuard;
use crate::auth::oauth::{AuthorizeParams, OAuthFlowController, TokenRecord};
use crate::auth::rate_limit::RateLimiter;
use crate::auth::{AuthContext, AuthGate};
use crate::config::{Config, defaults};
use crate::error::{GatewayError, GatewayResult, insert_header};
use crate::handler::{InboundRequest, RequestHandler};

/// Maximum dispatched request body.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Shared state for HTTP handlers and middleware.
pub struct AppState {
    pub config: Arc<Config>,
    pub api_keys: Arc<ApiKeyStore>,
    pub oauth: Option<Arc<OAuthFlowController>>,
    pub rate_limiter: Arc<RateLimiter>,
    pub csrf: Arc<CsrfGuard>,
    pub gate: AuthGate,
    pub handler: Arc<dyn RequestHandler>,
}

impl AppState {
    /// Paths the auth composer never sees: public endpoints plus the OAuth
    /// and key-management surfaces, which authenticate by other means.
    fn bypasses_auth(&self, path: &str) -> bool {
        path == "/health"
            || path == self.config.info_path()
            || path.starts_with(&format!("{}/", self.config.oauth_base))
            || path == "/keys"
            || path.starts_with("/keys/")
    }

    /// CSRF applies only to browser-shaped traffic into the handler surface.
    fn csrf_exempt(&self, path: &str) -> bool {
        self.bypasses_auth(path)
    }
}

/// Build the router and start the background sweepers.
///
/// The returned join handles belong to the sweep tasks; the dispatcher aborts
/// them on `stop()`.
pub async fn create_router(
    config: Arc<Config>,
    handler: Arc<dyn RequestHandler>,
) -> GatewayResult<(Router, Vec<JoinHandle<()>>)> {
    let api_keys = Arc::new(ApiKeyStore::new(config.api_key.prefix.clone()));
    api_keys
        .bootstrap(&config.api_key.bootstrap, config.api_key.primary_key.as_deref())
        .await?;

    let oauth = match &config.oauth {
        Some(oauth_config) => Some(Arc::new(OAuthFlowController::new(oauth_config.clone())?)),
        None => None,
    };

    let rate_limiter = Arc::new(RateLimiter::new(&config.rate_limit));
    let csrf = Arc::new(CsrfGuard::new(config.csrf.token_ttl));

    let mut sweepers = vec![
        rate_limiter.start_sweeper(config.sweep_interval),
        csrf.start_sweeper(config.sweep_interval),
    ];
    if let Some(ref oauth) = oauth {
        sweepers.push(oauth.start_sweeper(config.sweep_interval));
    }

    let gate = AuthGate::new(
        config.auth_mode,
        config.api_key.header_name.clone(),
        vec!["/health".to_owned(), config.info_path()],
        Arc::clone(&api_keys),
        oauth.clone(),
    );

    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        api_keys,
        oauth,
        rate_limiter,
        csrf,
        gate,
        handler,
    });

    let router = Router::new()
        .route("/health", get(handle_health))
        .route(&config.info_path(), get(handle_info))
        .route(&format!("{}/authorize", config.oauth_base), get(handle_authorize))
        .route(&format!("{}/token", config.oauth_base), post(handle_token))
        .route(&format!("{}/revoke", config.oauth_base), post(handle_revoke))
        .route("/keys", post(handle_key_create).get(handle_key_list))
        .route("/keys/{id}", get(handle_key_get).delete(handle_key_delete))
        .route(&format!("{}/{{*rest}}", config.base_path), any(dispatch))
        .fallback(handle_not_found)
        // Layer order is inside-out: the auth composer runs last before the
        // route, the rate limiter first after tracing/CORS.
        .layer(middleware::from_fn_with_state(Arc::clone(&state), auth_middleware))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(middleware::from_fn_with_state(Arc::clone(&state), csrf_middleware))
        .layer(middleware::from_fn_with_state(Arc::clone(&state), rate_limit_middleware))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    Ok((router, sweepers))
}

// ─── Middleware ──────────────────────────────────────────────────────────────

/// Fixed-window rate limiting keyed by caller IP.
async fn rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let key = client_key(&req);
    let decision = state.rate_limiter.check(&key).await;

    if !decision.allowed {
        tracing::warn!(key = %key, "Rate limit exceeded");
        return GatewayError::RateLimited {
            retry_after: decision.retry_after,
            limit: decision.limit,
            reset_at: decision.reset_at,
        }
        .into_response();
    }

    let mut response = next.run(req).await;
    if response.status().as_u16() < 400 {
        state.rate_limiter.record_success(&key).await;
    }

    let headers = response.headers_mut();
    insert_header(headers, "X-RateLimit-Limit", &decision.limit.to_string());
    insert_header(headers, "X-RateLimit-Remaining", &decision.remaining.to_string());
    insert_header(
        headers,
        "X-RateLimit-Reset",
        &decision.reset_at.to_rfc3339_opts(SecondsFormat::Secs, true),
    );
    response
}

/// Double-submit cookie CSRF: issue on safe methods, validate on the rest.
async fn csrf_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let path = req.uri().path().to_owned();
    let has_api_key = req.headers().contains_key(state.config.api_key.header_name.as_str());
    if state.csrf_exempt(&path) || has_api_key {
        return next.run(req).await;
    }

    let cookies = parse_cookies(req.headers());
    let session_id = cookies.get(&state.config.csrf.session_cookie).cloned();

    let safe = matches!(*req.method(), Method::GET | Method::HEAD | Method::OPTIONS);
    if !safe {
        let header_token = req
            .headers()
            .get(state.config.csrf.header_name.as_str())
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        if let Err(e) = state.csrf.validate(session_id.as_deref(), header_token.as_deref()).await
        {
            return e.into_response();
        }
        return next.run(req).await;
    }

    let issued = state.csrf.issue(session_id.as_deref()).await;
    let mut response = next.run(req).await;

    let headers = response.headers_mut();
    if issued.new_session {
        append_cookie(
            headers,
            &format!(
                "{}={}; Path=/; HttpOnly; SameSite=Lax",
                state.config.csrf.session_cookie, issued.session_id
            ),
        );
    }
    if issued.new_token {
        // Readable cookie plus header so browser clients can echo it back.
        append_cookie(
            headers,
            &format!(
                "{}={}; Path=/; SameSite=Lax",
                state.config.csrf.token_cookie, issued.token
            ),
        );
        insert_header(headers, &state.config.csrf.header_name, &issued.token);
    }
    response
}

/// Run the auth composer and attach the resulting context.
async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let path = req.uri().path().to_owned();
    if state.bypasses_auth(&path) {
        req.extensions_mut().insert(AuthContext::Anonymous);
        return next.run(req).await;
    }

    match state.gate.authenticate(&path, req.headers()).await {
        Ok(context) => {
            tracing::debug!(kind = context.kind(), principal = ?context.principal(), "Authenticated");
            req.extensions_mut().insert(context);
            next.run(req).await
        }
        Err(e) => e.into_response(),
    }
}

fn client_key(req: &Request) -> String {
    if let Some(forwarded) = req.headers().get("X-Forwarded-For").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_owned();
            }
        }
    }
    req.extensions()
        .get::<axum::extract::ConnectInfo<std::net::SocketAddr>>()
        .map_or_else(|| "local".to_owned(), |info| info.0.ip().to_string())
}

fn parse_cookies(headers: &HeaderMap) -> HashMap<String, String> {
    let mut cookies = HashMap::new();
    for value in headers.get_all(header::COOKIE) {
        let Ok(value) = value.to_str() else { continue };
        for pair in value.split(';') {
            if let Some((name, value)) = pair.trim().split_once('=') {
                cookies.insert(name.trim().to_owned(), value.trim().to_owned());
            }
        }
    }
    cookies
}

fn append_cookie(headers: &mut HeaderMap, cookie: &str) {
    if let Ok(value) = HeaderValue::from_str(cookie) {
        headers.append(header::SET_COOKIE, value);
    }
}

// ─── Public endpoints ────────────────────────────────────────────────────────

async fn handle_health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "tbrain-gateway",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn handle_info(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "service": "tbrain-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "transport": "http",
        "authMode": state.config.auth_mode.to_string(),
        "basePath": state.config.base_path,
    }))
}

async fn handle_not_found() -> Response {
    GatewayError::not_found("no such route").into_response()
}

// ─── OAuth endpoints ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AuthorizeQuery {
    client_id: Option<String>,
    redirect_uri: Option<String>,
    response_type: Option<String>,
    state: Option<String>,
    code_challenge: Option<String>,
    code_challenge_method: Option<String>,
    scope: Option<String>,
}

/// `GET {oauthBase}/authorize`
async fn handle_authorize(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AuthorizeQuery>,
) -> Response {
    let Some(ref oauth) = state.oauth else {
        return (StatusCode::NOT_FOUND, "OAuth not configured").into_response();
    };

    let Some(client_id) = query.client_id else {
        return oauth_error(&GatewayError::invalid_request("missing client_id"));
    };
    let Some(redirect_uri) = query.redirect_uri else {
        return oauth_error(&GatewayError::invalid_request("missing redirect_uri"));
    };
    let Some(oauth_state) = query.state else {
        return oauth_error(&GatewayError::invalid_request("missing state"));
    };
    let Some(code_challenge) = query.code_challenge else {
        return oauth_error(&GatewayError::invalid_request("missing code_challenge"));
    };
    if let Some(ref response_type) = query.response_type {
        if response_type != "code" {
            return oauth_error(&GatewayError::invalid_request("response_type must be 'code'"));
        }
    }

    let Ok(mut redirect_url) = url::Url::parse(&redirect_uri) else {
        return oauth_error(&GatewayError::invalid_request("redirect_uri is not a valid URL"));
    };

    let params = AuthorizeParams {
        client_id,
        redirect_uri: redirect_uri.clone(),
        state: oauth_state.clone(),
        code_challenge,
        challenge_method: query.code_challenge_method.unwrap_or_default(),
        scope: query.scope,
    };

    match oauth.authorize(params).await {
        Ok(code) => {
            redirect_url
                .query_pairs_mut()
                .append_pair("code", &code)
                .append_pair("state", &oauth_state);
            (StatusCode::FOUND, [(header::LOCATION, redirect_url.to_string())]).into_response()
        }
        Err(e) => oauth_error(&e),
    }
}

#[derive(Debug, Deserialize)]
struct TokenRequest {
    grant_type: String,
    code: Option<String>,
    code_verifier: Option<String>,
    refresh_token: Option<String>,
}

/// `POST {oauthBase}/token`
async fn handle_token(
    State(state): State<Arc<AppState>>,
    axum::Form(form): axum::Form<TokenRequest>,
) -> Response {
    let Some(ref oauth) = state.oauth else {
        return (StatusCode::NOT_FOUND, "OAuth not configured").into_response();
    };

    let result = match form.grant_type.as_str() {
        "authorization_code" => {
            let (Some(code), Some(verifier)) = (form.code, form.code_verifier) else {
                return oauth_error(&GatewayError::invalid_request(
                    "code and code_verifier are required",
                ));
            };
            oauth.exchange(&code, &verifier).await
        }
        "refresh_token" => {
            let Some(refresh_token) = form.refresh_token else {
                return oauth_error(&GatewayError::invalid_request("refresh_token is required"));
            };
            oauth.refresh(&refresh_token).await
        }
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": "unsupported_grant_type" })),
            )
                .into_response();
        }
    };

    match result {
        Ok(record) => token_success(&record),
        Err(e) => oauth_error(&e),
    }
}

#[derive(Debug, Deserialize)]
struct RevokeRequest {
    token: Option<String>,
}

/// `POST {oauthBase}/revoke`
async fn handle_revoke(
    State(state): State<Arc<AppState>>,
    axum::Form(form): axum::Form<RevokeRequest>,
) -> Response {
    let Some(ref oauth) = state.oauth else {
        return (StatusCode::NOT_FOUND, "OAuth not configured").into_response();
    };
    let Some(token) = form.token else {
        return oauth_error(&GatewayError::invalid_request("token is required"));
    };

    oauth.revoke(&token).await;
    StatusCode::OK.into_response()
}

/// Build a token response with RFC 6749 §5.1 cache headers.
fn token_success(record: &TokenRecord) -> Response {
    let expires_in = (record.expires_at - Utc::now()).num_seconds().max(0);
    let mut body = serde_json::json!({
        "access_token": record.access_token,
        "token_type": "Bearer",
        "expires_in": expires_in,
        "scope": record.scope,
    });
    if let Some(ref refresh_token) = record.refresh_token {
        body["refresh_token"] = serde_json::Value::String(refresh_token.clone());
    }

    let mut response = Json(body).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    response
}

/// OAuth endpoints answer in the RFC 6749 error shape, not the envelope.
fn oauth_error(error: &GatewayError) -> Response {
    (
        error.status(),
        Json(serde_json::json!({
            "error": error.code(),
            "error_description": error.public_message(),
        })),
    )
        .into_response()
}

// ─── Key management endpoints ────────────────────────────────────────────────

fn admin_guard(state: &AppState, headers: &HeaderMap) -> GatewayResult<()> {
    let Some(ref admin_key) = state.config.api_key.admin_key else {
        return Err(GatewayError::not_found("key management is not configured"));
    };
    let presented = headers
        .get(defaults::ADMIN_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| GatewayError::unauthorized("missing admin key"))?;
    if presented != admin_key {
        return Err(GatewayError::unauthorized("invalid admin key"));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateKeyRequest {
    name: String,
    #[serde(default)]
    permissions: Vec<String>,
    /// Key lifetime in seconds.
    expires_in: Option<u64>,
}

/// `POST /keys`
async fn handle_key_create(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateKeyRequest>,
) -> Response {
    if let Err(e) = admin_guard(&state, &headers) {
        return e.into_response();
    }
    if req.name.is_empty() {
        return GatewayError::invalid_request("name is required").into_response();
    }

    let permissions: HashSet<String> = req.permissions.into_iter().collect();
    let expires_in = req.expires_in.map(Duration::from_secs);
    let (plaintext, record) = state.api_keys.generate(req.name, permissions, expires_in).await;

    let mut body = serde_json::to_value(&record).unwrap_or_default();
    // The plaintext key appears in this response and nowhere else.
    body["key"] = serde_json::Value::String(plaintext);

    (StatusCode::CREATED, Json(body)).into_response()
}

/// `GET /keys`
async fn handle_key_list(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(e) = admin_guard(&state, &headers) {
        return e.into_response();
    }
    Json(state.api_keys.list().await).into_response()
}

/// `GET /keys/{id}`
async fn handle_key_get(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if let Err(e) = admin_guard(&state, &headers) {
        return e.into_response();
    }
    match state.api_keys.get(&id).await {
        Some(record) => Json(record).into_response(),
        None => GatewayError::not_found(format!("no key with id {id}")).into_response(),
    }
}

/// `DELETE /keys/{id}`
async fn handle_key_delete(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if let Err(e) = admin_guard(&state, &headers) {
        return e.into_response();
    }
    if state.api_keys.revoke(&id).await {
        StatusCode::NO_CONTENT.into_response()
    } else {
        GatewayError::not_found(format!("no key with id {id}")).into_response()
    }
}

// ─── Handler dispatch ────────────────────────────────────────────────────────

/// Route an authenticated request under the base path to the external handler.
async fn dispatch(State(state): State<Arc<AppState>>, req: Request) -> Response {
    let context =
        req.extensions().get::<AuthContext>().cloned().unwrap_or(AuthContext::Anonymous);
    let method = req.method().clone();
    let full_path = req.uri().path().to_owned();
    let path = full_path
        .strip_prefix(state.config.base_path.as_str())
        .unwrap_or(full_path.as_str())
        .to_owned();
    let query = req.uri().query().map(str::to_owned);

    let params = if matches!(method, Method::GET | Method::HEAD | Method::DELETE) {
        query_params(query.as_deref())
    } else {
        match body_params(req).await {
            Ok(params) => params,
            Err(e) => return e.into_response(),
        }
    };

    let inbound = InboundRequest { method: method.to_string(), path, params, context };
    tracing::debug!(method = %inbound.method, path = %inbound.path, "Dispatching request");

    match state.handler.handle(inbound).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => e.into_response(),
    }
}

fn query_params(query: Option<&str>) -> serde_json::Value {
    let Some(query) = query else {
        return serde_json::json!({});
    };
    let map: serde_json::Map<String, serde_json::Value> = url::form_urlencoded::parse(
        query.as_bytes(),
    )
    .map(|(k, v)| (k.into_owned(), serde_json::Value::String(v.into_owned())))
    .collect();
    serde_json::Value::Object(map)
}

async fn body_params(req: Request) -> GatewayResult<serde_json::Value> {
    let body = axum::body::to_bytes(req.into_body(), MAX_BODY_BYTES)
        .await
        .map_err(|e| GatewayError::invalid_request(format!("unreadable body: {e}")))?;
    if body.is_empty() {
        return Ok(serde_json::json!({}));
    }
    serde_json::from_slice(&body)
        .map_err(|e| GatewayError::invalid_request(format!("body is not valid JSON: {e}")))
}
