//! Authentication components and the middleware composer.
//!
//! Each store owns its map outright behind a `tokio::sync` lock; nothing
//! hands out references to shared mutable state. [`AuthGate`] composes the
//! configured checks into a single `authenticate` call that yields a
//! normalized [`AuthContext`] for downstream consumers.

pub mod api_key;
pub mod csrf;
pub mod oauth;
pub mod pkce;
pub mod rate_limit;

use std::collections::HashSet;
use std::sync::Arc;

use axum::http::HeaderMap;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

use crate::config::AuthMode;
use crate::error::{GatewayError, GatewayResult};

use api_key::ApiKeyStore;
use oauth::OAuthFlowController;

/// 32 random bytes (256 bits) from two UUIDv4s.
pub(crate) fn random_bytes() -> [u8; 32] {
    let mut out = [0u8; 32];
    out[..16].copy_from_slice(uuid::Uuid::new_v4().as_bytes());
    out[16..].copy_from_slice(uuid::Uuid::new_v4().as_bytes());
    out
}

/// A random URL-safe token without padding.
pub(crate) fn random_token() -> String {
    URL_SAFE_NO_PAD.encode(random_bytes())
}

/// Normalized caller identity attached to every authenticated request.
///
/// This context, not the raw credential, is what the external handler sees.
#[derive(Debug, Clone)]
pub enum AuthContext {
    /// No credential required (mode `none`, or a public path).
    Anonymous,

    /// Single trusted peer on the stdio transport.
    Trusted,

    /// Authenticated via API key.
    ApiKey { key_id: String, name: String, permissions: HashSet<String> },

    /// Authenticated via OAuth bearer token.
    OAuth { client_id: String, scope: String },
}

impl AuthContext {
    /// Credential type label.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Anonymous => "anonymous",
            Self::Trusted => "trusted",
            Self::ApiKey { .. } => "api-key",
            Self::OAuth { .. } => "oauth",
        }
    }

    /// Stable identifier of the caller, if any.
    #[must_use]
    pub fn principal(&self) -> Option<&str> {
        match self {
            Self::Anonymous | Self::Trusted => None,
            Self::ApiKey { name, .. } => Some(name),
            Self::OAuth { client_id, .. } => Some(client_id),
        }
    }

    /// Permission check. OAuth callers are scoped, not permissioned, so any
    /// valid token passes; the stdio peer is fully trusted.
    #[must_use]
    pub fn has_permission(&self, permission: &str) -> bool {
        match self {
            Self::Anonymous => false,
            Self::Trusted | Self::OAuth { .. } => true,
            Self::ApiKey { permissions, .. } => {
                permissions.contains(api_key::PERMISSION_ALL) || permissions.contains(permission)
            }
        }
    }
}

/// Composes the configured auth checks for the HTTP transport.
pub struct AuthGate {
    mode: AuthMode,
    api_key_header: String,
    public_paths: Vec<String>,
    api_keys: Arc<ApiKeyStore>,
    oauth: Option<Arc<OAuthFlowController>>,
}

impl AuthGate {
    #[must_use]
    pub fn new(
        mode: AuthMode,
        api_key_header: impl Into<String>,
        public_paths: Vec<String>,
        api_keys: Arc<ApiKeyStore>,
        oauth: Option<Arc<OAuthFlowController>>,
    ) -> Self {
        Self { mode, api_key_header: api_key_header.into(), public_paths, api_keys, oauth }
    }

    /// True for paths that bypass authentication entirely.
    #[must_use]
    pub fn is_public(&self, path: &str) -> bool {
        self.public_paths.iter().any(|p| p == path)
    }

    /// Authenticate one request.
    ///
    /// Mode `both` prefers the API-key header when present, even if an
    /// Authorization header is also supplied.
    pub async fn authenticate(
        &self,
        path: &str,
        headers: &HeaderMap,
    ) -> GatewayResult<AuthContext> {
        if self.is_public(path) {
            return Ok(AuthContext::Anonymous);
        }

        match self.mode {
            AuthMode::None => Ok(AuthContext::Anonymous),
            AuthMode::ApiKey => self.check_api_key(headers).await,
            AuthMode::OAuth => self.check_bearer(headers).await,
            AuthMode::Both => {
                if headers.contains_key(self.api_key_header.as_str()) {
                    self.check_api_key(headers).await
                } else if headers.contains_key(axum::http::header::AUTHORIZATION) {
                    self.check_bearer(headers).await
                } else {
                    Err(GatewayError::unauthorized("missing credentials"))
                }
            }
        }
    }

    async fn check_api_key(&self, headers: &HeaderMap) -> GatewayResult<AuthContext> {
        let key = headers
            .get(self.api_key_header.as_str())
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                GatewayError::unauthorized(format!("missing {} header", self.api_key_header))
            })?;

        let record = self
            .api_keys
            .validate(key)
            .await
            .ok_or_else(|| GatewayError::unauthorized("invalid API key"))?;

        Ok(AuthContext::ApiKey {
            key_id: record.id,
            name: record.name,
            permissions: record.permissions,
        })
    }

    async fn check_bearer(&self, headers: &HeaderMap) -> GatewayResult<AuthContext> {
        let oauth = self
            .oauth
            .as_ref()
            .ok_or_else(|| GatewayError::unauthorized("OAuth is not configured"))?;

        let token = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or_else(|| GatewayError::unauthorized("missing Bearer authorization"))?;

        let record = oauth
            .validate_token(token)
            .await
            .ok_or_else(|| GatewayError::unauthorized("invalid or expired token"))?;

        Ok(AuthContext::OAuth { client_id: record.client_id, scope: record.scope })
    }
}

impl std::fmt::Debug for AuthGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthGate").field("mode", &self.mode).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn gate(mode: AuthMode) -> (AuthGate, Arc<ApiKeyStore>) {
        let api_keys = Arc::new(ApiKeyStore::new("tbrain_"));
        let gate = AuthGate::new(
            mode,
            "X-API-Key",
            vec!["/health".to_owned()],
            Arc::clone(&api_keys),
            None,
        );
        (gate, api_keys)
    }

    #[tokio::test]
    async fn test_public_path_skips_auth() {
        let (gate, _) = gate(AuthMode::ApiKey);
        let context = gate.authenticate("/health", &HeaderMap::new()).await.unwrap();
        assert_eq!(context.kind(), "anonymous");
    }

    #[tokio::test]
    async fn test_mode_none_allows_everything() {
        let (gate, _) = gate(AuthMode::None);
        let context = gate.authenticate("/api/v1/x", &HeaderMap::new()).await.unwrap();
        assert_eq!(context.kind(), "anonymous");
    }

    #[tokio::test]
    async fn test_api_key_mode() {
        let (gate, api_keys) = gate(AuthMode::ApiKey);
        let (plaintext, _) =
            api_keys.generate("t", HashSet::from(["read".to_owned()]), None).await;

        let mut headers = HeaderMap::new();
        headers.insert("X-API-Key", HeaderValue::from_str(&plaintext).unwrap());
        let context = gate.authenticate("/api/v1/x", &headers).await.unwrap();
        assert_eq!(context.kind(), "api-key");
        assert!(context.has_permission("read"));
        assert!(!context.has_permission("write"));

        let err = gate.authenticate("/api/v1/x", &HeaderMap::new()).await.unwrap_err();
        assert_eq!(err.code(), "unauthorized");
    }

    #[tokio::test]
    async fn test_both_mode_prefers_api_key_header() {
        let (gate, api_keys) = gate(AuthMode::Both);
        let (plaintext, _) = api_keys.generate("t", HashSet::new(), None).await;

        // Both headers present, the bearer one nonsensical: the API key wins.
        let mut headers = HeaderMap::new();
        headers.insert("X-API-Key", HeaderValue::from_str(&plaintext).unwrap());
        headers.insert("Authorization", HeaderValue::from_static("Bearer bogus"));

        let context = gate.authenticate("/api/v1/x", &headers).await.unwrap();
        assert_eq!(context.kind(), "api-key");
    }

    #[tokio::test]
    async fn test_both_mode_requires_some_credential() {
        let (gate, _) = gate(AuthMode::Both);
        let err = gate.authenticate("/api/v1/x", &HeaderMap::new()).await.unwrap_err();
        assert_eq!(err.code(), "unauthorized");
    }
}
