//! Fixed-window request rate limiting.
//!
//! One window per caller key (the HTTP transport keys by source IP). A window
//! is created lazily on the first request and replaced, not incremented, once
//! its reset time has passed. Stale windows are swept by a background task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::RateLimitConfig;

/// A single fixed window.
#[derive(Debug, Clone)]
struct RateWindow {
    count: u32,
    reset_at: DateTime<Utc>,
}

/// Outcome of a rate-limit check, carrying everything the transport needs
/// for the `X-RateLimit-*` response headers.
#[derive(Debug, Clone)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
    /// Whole seconds until reset, rounded up. Only meaningful when rejected.
    pub retry_after: u64,
}

/// Fixed-window counter keyed per caller.
pub struct RateLimiter {
    max_requests: u32,
    window: chrono::Duration,
    skip_successful: bool,
    windows: Mutex<HashMap<String, RateWindow>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            max_requests: config.max_requests,
            window: chrono::Duration::from_std(config.window)
                .unwrap_or_else(|_| chrono::Duration::seconds(60)),
            skip_successful: config.skip_successful,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Count a request against `key` and decide whether it may proceed.
    pub async fn check(&self, key: &str) -> RateLimitDecision {
        let now = Utc::now();
        let mut windows = self.windows.lock().await;

        let window = windows
            .entry(key.to_owned())
            .and_modify(|w| {
                if w.reset_at <= now {
                    *w = RateWindow { count: 0, reset_at: now + self.window };
                }
            })
            .or_insert_with(|| RateWindow { count: 0, reset_at: now + self.window });

        window.count += 1;
        let allowed = window.count <= self.max_requests;
        let millis_left = (window.reset_at - now).num_milliseconds().max(0);

        RateLimitDecision {
            allowed,
            limit: self.max_requests,
            remaining: self.max_requests.saturating_sub(window.count),
            reset_at: window.reset_at,
            retry_after: u64::try_from((millis_left + 999) / 1000).unwrap_or(0).max(1),
        }
    }

    /// Refund a window slot after a request completed without error. No-op
    /// unless `skip_successful` is configured.
    pub async fn record_success(&self, key: &str) {
        if !self.skip_successful {
            return;
        }
        let mut windows = self.windows.lock().await;
        if let Some(window) = windows.get_mut(key) {
            window.count = window.count.saturating_sub(1);
        }
    }

    /// Start the background sweep of windows whose reset time has passed.
    #[must_use]
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                limiter.sweep().await;
            }
        })
    }

    async fn sweep(&self) {
        let now = Utc::now();
        let mut windows = self.windows.lock().await;
        let before = windows.len();
        windows.retain(|_, window| window.reset_at > now);
        let removed = before - windows.len();
        if removed > 0 {
            tracing::debug!(count = removed, "Swept expired rate windows");
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("max_requests", &self.max_requests)
            .field("window", &self.window)
            .finish()
    }
}
