//! End-to-end OAuth 2.1 authorization-code + PKCE flow over HTTP.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE, LOCATION};
use axum::http::{Request, StatusCode};
use serde_json::json;
use tower::ServiceExt;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use tbrain_gateway::auth::pkce;
use tbrain_gateway::config::{AuthMode, Config};
use tbrain_gateway::error::GatewayResult;
use tbrain_gateway::handler::{InboundRequest, RequestHandler};
use tbrain_gateway::server::http::create_router;

struct EchoHandler;

#[async_trait]
impl RequestHandler for EchoHandler {
    async fn handle(&self, request: InboundRequest) -> GatewayResult<serde_json::Value> {
        Ok(json!({
            "context": request.context.kind(),
            "principal": request.context.principal(),
        }))
    }
}

async fn oauth_router(upstream: &MockServer) -> axum::Router {
    let config = Config::for_testing(AuthMode::OAuth, &format!("{}/token", upstream.uri()));
    let (router, _sweepers) =
        create_router(Arc::new(config), Arc::new(EchoHandler)).await.unwrap();
    router
}

async fn mount_token_endpoint(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=authorization_code"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "upstream-access",
            "token_type": "Bearer",
            "expires_in": 3600,
            "refresh_token": "upstream-refresh",
            "scope": "tools"
        })))
        .mount(server)
        .await;
}

fn authorize_uri(challenge: &str) -> String {
    format!(
        "/oauth/authorize?client_id=test-client&redirect_uri=http%3A%2F%2Flocalhost%3A3000%2Fcb\
         &response_type=code&state=xyz123&code_challenge={challenge}&code_challenge_method=S256\
         &scope=tools"
    )
}

/// Follow the authorize redirect and pull out the issued code.
async fn obtain_code(app: &axum::Router, challenge: &str) -> String {
    let response = app
        .clone()
        .oneshot(Request::get(authorize_uri(challenge)).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FOUND);

    let location = response.headers().get(LOCATION).unwrap().to_str().unwrap();
    let redirect = url::Url::parse(location).unwrap();
    let code = redirect
        .query_pairs()
        .find(|(k, _)| k == "code")
        .map(|(_, v)| v.into_owned())
        .expect("code in redirect");
    let state = redirect
        .query_pairs()
        .find(|(k, _)| k == "state")
        .map(|(_, v)| v.into_owned())
        .expect("state in redirect");
    assert_eq!(state, "xyz123");
    assert_ne!(code, state, "code must be opaque, not the state value");
    code
}

async fn post_form(app: &axum::Router, uri: &str, form: &[(&str, &str)]) -> axum::response::Response {
    let body = serde_urlencoded::to_string(form).unwrap();
    app.clone()
        .oneshot(
            Request::post(uri)
                .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_full_authorization_code_flow() {
    let upstream = MockServer::start().await;
    mount_token_endpoint(&upstream).await;
    let app = oauth_router(&upstream).await;

    let pair = pkce::generate();
    let code = obtain_code(&app, &pair.challenge).await;

    let response = post_form(
        &app,
        "/oauth/token",
        &[
            ("grant_type", "authorization_code"),
            ("code", &code),
            ("code_verifier", &pair.verifier),
        ],
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get(CACHE_CONTROL).unwrap(), "no-store");

    let token = body_json(response).await;
    assert_eq!(token["access_token"], "upstream-access");
    assert_eq!(token["token_type"], "Bearer");
    assert_eq!(token["refresh_token"], "upstream-refresh");
    assert!(token["expires_in"].as_i64().unwrap() > 0);

    // The issued bearer token now authenticates dispatched requests.
    let response = app
        .oneshot(
            Request::get("/api/v1/resources")
                .header("Authorization", "Bearer upstream-access")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["context"], "oauth");
    assert_eq!(json["principal"], "test-client");
}

#[tokio::test]
async fn test_code_is_single_use() {
    let upstream = MockServer::start().await;
    mount_token_endpoint(&upstream).await;
    let app = oauth_router(&upstream).await;

    let pair = pkce::generate();
    let code = obtain_code(&app, &pair.challenge).await;

    let form = [
        ("grant_type", "authorization_code"),
        ("code", code.as_str()),
        ("code_verifier", pair.verifier.as_str()),
    ];
    let first = post_form(&app, "/oauth/token", &form).await;
    assert_eq!(first.status(), StatusCode::OK);

    let second = post_form(&app, "/oauth/token", &form).await;
    assert_eq!(second.status(), StatusCode::BAD_REQUEST);
    let json = body_json(second).await;
    assert_eq!(json["error"], "invalid_grant");
    assert!(json["error_description"].as_str().is_some());
}

#[tokio::test]
async fn test_wrong_verifier_rejected_before_upstream() {
    let upstream = MockServer::start().await;
    // No mock mounted: a remote call would 404 and fail differently.
    let app = oauth_router(&upstream).await;

    let pair = pkce::generate();
    let code = obtain_code(&app, &pair.challenge).await;

    let response = post_form(
        &app,
        "/oauth/token",
        &[
            ("grant_type", "authorization_code"),
            ("code", &code),
            ("code_verifier", "not-the-verifier"),
        ],
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["error"], "invalid_grant");
}

#[tokio::test]
async fn test_authorize_validates_parameters() {
    let upstream = MockServer::start().await;
    let app = oauth_router(&upstream).await;

    // Missing code_challenge.
    let response = app
        .clone()
        .oneshot(
            Request::get("/oauth/authorize?client_id=test-client&redirect_uri=http%3A%2F%2Flocalhost%2Fcb&state=s")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["error"], "invalid_request");

    // Unknown client.
    let pair = pkce::generate();
    let uri = format!(
        "/oauth/authorize?client_id=evil&redirect_uri=http%3A%2F%2Flocalhost%2Fcb&state=s\
         &code_challenge={}&code_challenge_method=S256",
        pair.challenge
    );
    let response =
        app.clone().oneshot(Request::get(uri).body(Body::empty()).unwrap()).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["error"], "unauthorized_client");

    // Plain challenge method.
    let uri = format!(
        "/oauth/authorize?client_id=test-client&redirect_uri=http%3A%2F%2Flocalhost%2Fcb&state=s\
         &code_challenge={}&code_challenge_method=plain",
        pair.challenge
    );
    let response = app.oneshot(Request::get(uri).body(Body::empty()).unwrap()).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unsupported_grant_type() {
    let upstream = MockServer::start().await;
    let app = oauth_router(&upstream).await;

    let response =
        post_form(&app, "/oauth/token", &[("grant_type", "client_credentials")]).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["error"], "unsupported_grant_type");
}

#[tokio::test]
async fn test_refresh_grant() {
    let upstream = MockServer::start().await;
    mount_token_endpoint(&upstream).await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "rotated-access",
            "token_type": "Bearer",
            "expires_in": 3600,
            "scope": "tools"
        })))
        .mount(&upstream)
        .await;
    let app = oauth_router(&upstream).await;

    let pair = pkce::generate();
    let code = obtain_code(&app, &pair.challenge).await;
    let first = post_form(
        &app,
        "/oauth/token",
        &[
            ("grant_type", "authorization_code"),
            ("code", &code),
            ("code_verifier", &pair.verifier),
        ],
    )
    .await;
    let token = body_json(first).await;
    let refresh_token = token["refresh_token"].as_str().unwrap().to_owned();

    let response = post_form(
        &app,
        "/oauth/token",
        &[("grant_type", "refresh_token"), ("refresh_token", &refresh_token)],
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let rotated = body_json(response).await;
    assert_eq!(rotated["access_token"], "rotated-access");
    // Upstream omitted a replacement, so the presented token carries over.
    assert_eq!(rotated["refresh_token"], refresh_token);
}

#[tokio::test]
async fn test_revoked_token_stops_authenticating() {
    let upstream = MockServer::start().await;
    mount_token_endpoint(&upstream).await;
    let app = oauth_router(&upstream).await;

    let pair = pkce::generate();
    let code = obtain_code(&app, &pair.challenge).await;
    let response = post_form(
        &app,
        "/oauth/token",
        &[
            ("grant_type", "authorization_code"),
            ("code", &code),
            ("code_verifier", &pair.verifier),
        ],
    )
    .await;
    let token = body_json(response).await;
    let access_token = token["access_token"].as_str().unwrap().to_owned();

    let response = post_form(&app, "/oauth/revoke", &[("token", &access_token)]).await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(
            Request::get("/api/v1/resources")
                .header("Authorization", format!("Bearer {access_token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_missing_bearer_rejected_in_oauth_mode() {
    let upstream = MockServer::start().await;
    let app = oauth_router(&upstream).await;

    let response = app
        .oneshot(Request::get("/api/v1/resources").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], "unauthorized");
}
