//! OAuth 2.1 authorization-code + PKCE flow controller.
//!
//! Owns the pending authorization requests and issued token records. The
//! authorization code is a distinct opaque secret mapped to its pending
//! request; it is never the `state` value itself. Codes are single-use: the
//! code index and the request map live behind one mutex, so a concurrent
//! duplicate exchange observes the first removal and fails `invalid_grant`.
//!
//! Remote calls (token exchange, refresh, revocation) go through `reqwest`
//! with bounded timeouts and never run while a store lock is held.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::OAuthConfig;
use crate::error::{GatewayError, GatewayResult};

use super::pkce;

/// A pending authorization request, keyed by `state`.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub client_id: String,
    pub redirect_uri: String,
    pub state: String,
    pub code_challenge: String,
    pub challenge_method: String,
    pub scope: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// An issued token, keyed by access token.
#[derive(Debug, Clone)]
pub struct TokenRecord {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub scope: String,
    pub client_id: String,
}

impl TokenRecord {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Parameters of an incoming authorize request, already syntactically parsed.
#[derive(Debug, Clone)]
pub struct AuthorizeParams {
    pub client_id: String,
    pub redirect_uri: String,
    pub state: String,
    pub code_challenge: String,
    pub challenge_method: String,
    pub scope: Option<String>,
}

/// Pending state: the request map and the opaque code index, guarded
/// together so code consumption is atomic.
#[derive(Default)]
struct Pending {
    requests: HashMap<String, AuthorizationRequest>,
    codes: HashMap<String, String>,
}

/// Token response from the upstream token endpoint.
#[derive(Debug, Deserialize)]
struct UpstreamToken {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
    refresh_token: Option<String>,
    scope: Option<String>,
}

const fn default_expires_in() -> i64 {
    3600
}

/// OAuth error body from the upstream endpoint.
#[derive(Debug, Deserialize)]
struct UpstreamError {
    error: String,
    error_description: Option<String>,
}

/// Authorization-code + PKCE lifecycle controller.
pub struct OAuthFlowController {
    config: OAuthConfig,
    http: reqwest::Client,
    pending: Mutex<Pending>,
    tokens: Mutex<HashMap<String, TokenRecord>>,
}

impl OAuthFlowController {
    /// Create a controller with a bounded-timeout HTTP client.
    pub fn new(config: OAuthConfig) -> GatewayResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| GatewayError::internal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            config,
            http,
            pending: Mutex::new(Pending::default()),
            tokens: Mutex::new(HashMap::new()),
        })
    }

    /// Accept an authorization request and issue an opaque code.
    ///
    /// Rejects non-S256 challenge methods and clients outside the allow-list.
    /// The caller redirects to `redirect_uri` with `code` and `state`.
    pub async fn authorize(&self, params: AuthorizeParams) -> GatewayResult<String> {
        if params.challenge_method != pkce::METHOD_S256 {
            return Err(GatewayError::invalid_request("code_challenge_method must be 'S256'"));
        }
        if !self.config.allowed_clients.iter().any(|c| c == &params.client_id) {
            return Err(GatewayError::UnauthorizedClient(format!(
                "client '{}' is not allowed",
                params.client_id
            )));
        }

        let request = AuthorizationRequest {
            client_id: params.client_id,
            redirect_uri: params.redirect_uri,
            state: params.state.clone(),
            code_challenge: params.code_challenge,
            challenge_method: params.challenge_method,
            scope: params.scope,
            created_at: Utc::now(),
        };

        let code = super::random_token();
        let mut pending = self.pending.lock().await;
        // A repeated state replaces the earlier attempt; its old code becomes
        // unusable once the sweeper drops the dangling index entry.
        pending.requests.insert(params.state.clone(), request);
        pending.codes.insert(code.clone(), params.state);

        tracing::info!("Issued authorization code");
        Ok(code)
    }

    /// Exchange a single-use authorization code for tokens.
    ///
    /// PKCE is verified locally before the upstream token endpoint is called;
    /// the pending request is consumed atomically so a duplicate exchange
    /// fails `invalid_grant`.
    pub async fn exchange(&self, code: &str, code_verifier: &str) -> GatewayResult<TokenRecord> {
        let request = {
            let mut pending = self.pending.lock().await;
            let state = pending
                .codes
                .remove(code)
                .ok_or_else(|| GatewayError::invalid_grant("unknown or already used code"))?;
            pending
                .requests
                .remove(&state)
                .ok_or_else(|| GatewayError::invalid_grant("unknown or already used code"))?
        };

        let ttl = chrono::Duration::from_std(self.config.auth_request_ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(600));
        if request.created_at + ttl <= Utc::now() {
            return Err(GatewayError::invalid_grant("authorization code expired"));
        }

        if !pkce::validate(code_verifier, &request.code_challenge) {
            return Err(GatewayError::invalid_grant("PKCE verification failed"));
        }

        let upstream = self
            .request_token(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", &request.redirect_uri),
            ])
            .await?;

        let record = self.store_token(upstream, request.client_id, request.scope, None).await;
        tracing::info!(client_id = %record.client_id, "Issued token");
        Ok(record)
    }

    /// Obtain a fresh token from the upstream refresh grant.
    ///
    /// If the response omits a refresh token, the presented one is reused.
    /// The record owning the presented token is replaced only after the
    /// upstream grant succeeds; a failed refresh leaves it untouched.
    pub async fn refresh(&self, refresh_token: &str) -> GatewayResult<TokenRecord> {
        let old = {
            let tokens = self.tokens.lock().await;
            tokens
                .values()
                .find(|r| r.refresh_token.as_deref() == Some(refresh_token))
                .cloned()
        };

        let upstream = self
            .request_token(&[("grant_type", "refresh_token"), ("refresh_token", refresh_token)])
            .await?;

        if let Some(ref old) = old {
            self.tokens.lock().await.remove(&old.access_token);
        }

        let client_id =
            old.as_ref().map_or_else(|| self.config.client_id.clone(), |r| r.client_id.clone());
        let fallback_scope = old.map(|r| r.scope);
        let record = self
            .store_token(upstream, client_id, fallback_scope, Some(refresh_token.to_owned()))
            .await;

        tracing::info!(client_id = %record.client_id, "Refreshed token");
        Ok(record)
    }

    /// Look up an access token.
    ///
    /// Returns `None` (and evicts the record) when expired, and `None` when
    /// the owning client is no longer in the allow-list.
    pub async fn validate_token(&self, access_token: &str) -> Option<TokenRecord> {
        let mut tokens = self.tokens.lock().await;
        let record = tokens.get(access_token)?;

        if record.is_expired(Utc::now()) {
            tokens.remove(access_token);
            return None;
        }
        if !self.config.allowed_clients.iter().any(|c| c == &record.client_id) {
            return None;
        }
        Some(record.clone())
    }

    /// Delete a token locally and best-effort notify the upstream revocation
    /// endpoint. Notification failures are logged, never surfaced.
    pub async fn revoke(&self, access_token: &str) {
        let removed = self.tokens.lock().await.remove(access_token).is_some();
        tracing::info!(removed, "Revoked token");

        let Some(ref endpoint) = self.config.revocation_endpoint else {
            return;
        };

        let result = self
            .http
            .post(endpoint)
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .form(&[("token", access_token)])
            .send()
            .await;
        if let Err(e) = result {
            tracing::warn!(error = %e, "Failed to notify revocation endpoint");
        }
    }

    /// Start the background sweep of expired pending requests and tokens.
    #[must_use]
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                controller.sweep().await;
            }
        })
    }

    async fn sweep(&self) {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.config.auth_request_ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(600));

        {
            let mut pending = self.pending.lock().await;
            let Pending { requests, codes } = &mut *pending;
            requests.retain(|_, request| request.created_at + ttl > now);
            let before = codes.len();
            codes.retain(|_, state| requests.contains_key(state));
            let removed = before - codes.len();
            if removed > 0 {
                tracing::debug!(count = removed, "Swept stale auth codes");
            }
        }

        {
            let mut tokens = self.tokens.lock().await;
            let before = tokens.len();
            tokens.retain(|_, record| !record.is_expired(now));
            let removed = before - tokens.len();
            if removed > 0 {
                tracing::debug!(count = removed, "Swept expired tokens");
            }
        }
    }

    async fn store_token(
        &self,
        upstream: UpstreamToken,
        client_id: String,
        fallback_scope: Option<String>,
        reuse_refresh: Option<String>,
    ) -> TokenRecord {
        let record = TokenRecord {
            access_token: upstream.access_token,
            refresh_token: upstream.refresh_token.or(reuse_refresh),
            expires_at: Utc::now() + chrono::Duration::seconds(upstream.expires_in),
            scope: upstream.scope.or(fallback_scope).unwrap_or_default(),
            client_id,
        };

        self.tokens.lock().await.insert(record.access_token.clone(), record.clone());
        record
    }

    /// Call the upstream token endpoint with Basic client authentication.
    ///
    /// OAuth error bodies pass through as `invalid_grant`/`invalid_request`;
    /// everything else surfaces as a generic `server_error`.
    async fn request_token(&self, form: &[(&str, &str)]) -> GatewayResult<UpstreamToken> {
        let response = self
            .http
            .post(&self.config.token_endpoint)
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .form(form)
            .send()
            .await
            .map_err(|e| GatewayError::internal(format!("token endpoint unreachable: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return response.json::<UpstreamToken>().await.map_err(|e| {
                GatewayError::internal(format!("malformed token endpoint response: {e}"))
            });
        }

        let body = response.text().await.unwrap_or_default();
        if let Ok(oauth_error) = serde_json::from_str::<UpstreamError>(&body) {
            let message = oauth_error.error_description.unwrap_or_else(|| oauth_error.error.clone());
            return Err(match oauth_error.error.as_str() {
                "invalid_request" => GatewayError::invalid_request(message),
                _ => GatewayError::invalid_grant(message),
            });
        }

        Err(GatewayError::internal(format!(
            "token endpoint returned {status}: {body}"
        )))
    }
}

impl std::fmt::Debug for OAuthFlowController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthFlowController")
            .field("token_endpoint", &self.config.token_endpoint)
            .finish()
    }
}
