//! Double-submit cookie CSRF protection.
//!
//! A random session id (HttpOnly cookie) maps to a random token delivered as
//! a readable cookie and a response header. State-changing requests must echo
//! the token back in a request header; safe methods and API-key callers are
//! exempt (API keys are never silently attached by a browser).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::error::{GatewayError, GatewayResult};

/// A CSRF token bound to one session id.
#[derive(Debug, Clone)]
struct CsrfSession {
    token: String,
    created_at: DateTime<Utc>,
}

/// Result of issuing (or re-reading) a session's CSRF state.
#[derive(Debug, Clone)]
pub struct IssuedCsrf {
    pub session_id: String,
    pub token: String,
    /// The session id was minted by this call and needs a Set-Cookie.
    pub new_session: bool,
    /// The token was minted by this call and needs a Set-Cookie + header.
    pub new_token: bool,
}

/// Per-session CSRF token store.
pub struct CsrfGuard {
    ttl: chrono::Duration,
    sessions: Mutex<HashMap<String, CsrfSession>>,
}

impl CsrfGuard {
    #[must_use]
    pub fn new(token_ttl: Duration) -> Self {
        Self {
            ttl: chrono::Duration::from_std(token_ttl)
                .unwrap_or_else(|_| chrono::Duration::seconds(3600)),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Ensure the session has a live token, minting the session id and/or
    /// token as needed. Tokens rotate only when absent or expired, never
    /// per-request.
    pub async fn issue(&self, session_id: Option<&str>) -> IssuedCsrf {
        let now = Utc::now();
        let (session_id, new_session) = match session_id {
            Some(id) if !id.is_empty() => (id.to_owned(), false),
            _ => (super::random_token(), true),
        };

        let mut sessions = self.sessions.lock().await;
        match sessions.get(&session_id) {
            Some(session) if session.created_at + self.ttl > now => IssuedCsrf {
                session_id: session_id.clone(),
                token: session.token.clone(),
                new_session,
                new_token: false,
            },
            _ => {
                let token = super::random_token();
                sessions
                    .insert(session_id.clone(), CsrfSession { token: token.clone(), created_at: now });
                IssuedCsrf { session_id, token, new_session, new_token: true }
            }
        }
    }

    /// Check the double-submit pair for a state-changing request.
    pub async fn validate(
        &self,
        session_id: Option<&str>,
        header_token: Option<&str>,
    ) -> GatewayResult<()> {
        let session_id = session_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| GatewayError::Csrf("missing session".to_owned()))?;
        let header_token = header_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| GatewayError::Csrf("missing CSRF token header".to_owned()))?;

        let sessions = self.sessions.lock().await;
        let session = sessions
            .get(session_id)
            .ok_or_else(|| GatewayError::Csrf("unknown session".to_owned()))?;

        if session.created_at + self.ttl <= Utc::now() {
            return Err(GatewayError::Csrf("CSRF token expired".to_owned()));
        }
        if session.token != header_token {
            return Err(GatewayError::Csrf("CSRF token mismatch".to_owned()));
        }
        Ok(())
    }

    /// Start the background sweep of expired sessions.
    #[must_use]
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let guard = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                guard.sweep().await;
            }
        })
    }

    async fn sweep(&self) {
        let now = Utc::now();
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|_, session| session.created_at + self.ttl > now);
        let removed = before - sessions.len();
        if removed > 0 {
            tracing::debug!(count = removed, "Swept expired CSRF sessions");
        }
    }
}

impl std::fmt::Debug for CsrfGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsrfGuard").field("ttl", &self.ttl).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_issue_mints_session_and_token_once() {
        let guard = CsrfGuard::new(Duration::from_secs(3600));

        let first = guard.issue(None).await;
        assert!(first.new_session);
        assert!(first.new_token);

        let second = guard.issue(Some(&first.session_id)).await;
        assert!(!second.new_session);
        assert!(!second.new_token);
        assert_eq!(second.token, first.token);
    }

    #[tokio::test]
    async fn test_validate_matching_pair() {
        let guard = CsrfGuard::new(Duration::from_secs(3600));
        let issued = guard.issue(None).await;

        assert!(guard.validate(Some(&issued.session_id), Some(&issued.token)).await.is_ok());
    }

    #[tokio::test]
    async fn test_validate_rejects_missing_pieces() {
        let guard = CsrfGuard::new(Duration::from_secs(3600));
        let issued = guard.issue(None).await;

        let missing_header = guard.validate(Some(&issued.session_id), None).await.unwrap_err();
        assert_eq!(missing_header.code(), "csrf_error");

        let missing_session = guard.validate(None, Some(&issued.token)).await.unwrap_err();
        assert_eq!(missing_session.code(), "csrf_error");

        let unknown = guard.validate(Some("nope"), Some(&issued.token)).await.unwrap_err();
        assert_eq!(unknown.code(), "csrf_error");
    }

    #[tokio::test]
    async fn test_validate_rejects_mismatched_token() {
        let guard = CsrfGuard::new(Duration::from_secs(3600));
        let issued = guard.issue(None).await;

        let err =
            guard.validate(Some(&issued.session_id), Some("tampered")).await.unwrap_err();
        assert_eq!(err.code(), "csrf_error");
    }

    #[tokio::test]
    async fn test_expired_token_rotates_on_issue() {
        let guard = CsrfGuard::new(Duration::from_millis(20));
        let first = guard.issue(None).await;

        tokio::time::sleep(Duration::from_millis(40)).await;

        let err = guard.validate(Some(&first.session_id), Some(&first.token)).await.unwrap_err();
        assert_eq!(err.code(), "csrf_error");

        let reissued = guard.issue(Some(&first.session_id)).await;
        assert!(reissued.new_token);
        assert_ne!(reissued.token, first.token);
    }
}
