//! Integration tests for transport dispatch and the auth composer.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::json;
use tower::ServiceExt;

use tbrain_gateway::config::{AuthMode, Config};
use tbrain_gateway::error::GatewayResult;
use tbrain_gateway::handler::{InboundRequest, RequestHandler};
use tbrain_gateway::server::http::create_router;

struct EchoHandler;

#[async_trait]
impl RequestHandler for EchoHandler {
    async fn handle(&self, request: InboundRequest) -> GatewayResult<serde_json::Value> {
        Ok(json!({
            "method": request.method,
            "path": request.path,
            "params": request.params,
            "context": request.context.kind(),
            "principal": request.context.principal(),
        }))
    }
}

async fn build_router(config: Config) -> axum::Router {
    let (router, _sweepers) =
        create_router(Arc::new(config), Arc::new(EchoHandler)).await.unwrap();
    router
}

fn config_with_key(auth_mode: AuthMode) -> Config {
    let mut config = Config::new(auth_mode);
    config.api_key.bootstrap = vec!["tester:validkey:read".to_owned()];
    config
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&body).unwrap()
}

// ─── Public endpoints ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_health_bypasses_auth() {
    let app = build_router(config_with_key(AuthMode::ApiKey)).await;

    let response =
        app.oneshot(Request::get("/health").body(Body::empty()).unwrap()).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["service"], "tbrain-gateway");
}

#[tokio::test]
async fn test_info_bypasses_auth() {
    let app = build_router(config_with_key(AuthMode::ApiKey)).await;

    let response =
        app.oneshot(Request::get("/api/v1/info").body(Body::empty()).unwrap()).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["authMode"], "api-key");
    assert_eq!(json["basePath"], "/api/v1");
}

#[tokio::test]
async fn test_unmatched_route_gets_error_envelope() {
    let app = build_router(config_with_key(AuthMode::None)).await;

    let response =
        app.oneshot(Request::get("/nowhere").body(Body::empty()).unwrap()).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], "not_found");
    assert!(json["error"]["correlationId"].as_str().is_some());
}

// ─── API key mode ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_api_key_mode_end_to_end() {
    let app = build_router(config_with_key(AuthMode::ApiKey)).await;

    let response = app
        .clone()
        .oneshot(
            Request::get("/api/v1/resources")
                .header("X-API-Key", "tbrain_validkey")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["context"], "api-key");
    assert_eq!(json["principal"], "tester");
    assert_eq!(json["path"], "/resources");

    // Same request without the header fails closed.
    let response = app
        .oneshot(Request::get("/api/v1/resources").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], "unauthorized");
}

#[tokio::test]
async fn test_invalid_api_key_rejected() {
    let app = build_router(config_with_key(AuthMode::ApiKey)).await;

    let response = app
        .oneshot(
            Request::get("/api/v1/resources")
                .header("X-API-Key", "tbrain_wrong")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

// ─── Mode none ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_mode_none_dispatches_anonymously() {
    let app = build_router(config_with_key(AuthMode::None)).await;

    let response = app
        .oneshot(Request::get("/api/v1/items?limit=5").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["context"], "anonymous");
    assert_eq!(json["params"]["limit"], "5");
}

// ─── Both mode ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_both_mode_prefers_api_key_over_bearer() {
    let app = build_router(config_with_key(AuthMode::Both)).await;

    let response = app
        .clone()
        .oneshot(
            Request::get("/api/v1/resources")
                .header("X-API-Key", "tbrain_validkey")
                .header("Authorization", "Bearer not-a-real-token")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["context"], "api-key");

    // No credential at all: 401.
    let response = app
        .oneshot(Request::get("/api/v1/resources").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

// ─── Security headers ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_security_headers_present() {
    let app = build_router(config_with_key(AuthMode::None)).await;

    let response =
        app.oneshot(Request::get("/health").body(Body::empty()).unwrap()).await.unwrap();

    assert_eq!(response.headers().get("X-Content-Type-Options").unwrap(), "nosniff");
    assert_eq!(response.headers().get("X-Frame-Options").unwrap(), "DENY");
}
