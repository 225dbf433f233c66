//! Configuration for the TBrain gateway.

use std::time::Duration;

/// Gateway configuration constants.
pub mod defaults {
    use std::time::Duration;

    /// Header carrying the API key.
    pub const API_KEY_HEADER: &str = "X-API-Key";

    /// Fixed prefix every API key starts with.
    pub const API_KEY_PREFIX: &str = "tbrain_";

    /// Header gating the key-management endpoints.
    pub const ADMIN_KEY_HEADER: &str = "X-Admin-Key";

    /// Header carrying the CSRF token on state-changing requests.
    pub const CSRF_HEADER: &str = "X-CSRF-Token";

    /// HttpOnly cookie holding the session id.
    pub const SESSION_COOKIE: &str = "tbrain_session";

    /// Readable cookie holding the CSRF token.
    pub const CSRF_COOKIE: &str = "tbrain_csrf";

    /// Base path the external handler is mounted under.
    pub const BASE_PATH: &str = "/api/v1";

    /// Base path for the OAuth endpoints.
    pub const OAUTH_BASE: &str = "/oauth";

    /// Requests allowed per rate-limit window.
    pub const RATE_LIMIT_MAX: u32 = 100;

    /// Rate-limit window length.
    pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

    /// CSRF token lifetime.
    pub const CSRF_TOKEN_TTL: Duration = Duration::from_secs(3600);

    /// Pending authorization request lifetime.
    pub const AUTH_REQUEST_TTL: Duration = Duration::from_secs(600);

    /// Timeout for remote token/revocation calls.
    pub const REMOTE_TIMEOUT: Duration = Duration::from_secs(10);

    /// Connection timeout for remote calls.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

    /// Interval between background sweeps of expired entries.
    pub const SWEEP_INTERVAL: Duration = Duration::from_secs(300);
}

/// Which credentials the HTTP transport accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthMode {
    /// No authentication; every request passes the composer.
    None,
    /// Static API keys via the configured header.
    #[default]
    ApiKey,
    /// OAuth 2.1 bearer tokens.
    OAuth,
    /// API key when the header is present, bearer token otherwise.
    Both,
}

impl std::str::FromStr for AuthMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "api-key" | "api_key" => Ok(Self::ApiKey),
            "oauth" => Ok(Self::OAuth),
            "both" => Ok(Self::Both),
            other => anyhow::bail!("unknown auth mode: {other}"),
        }
    }
}

impl std::fmt::Display for AuthMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::ApiKey => "api-key",
            Self::OAuth => "oauth",
            Self::Both => "both",
        };
        f.write_str(name)
    }
}

/// OAuth flow configuration.
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    /// Client id presented to the upstream token endpoint.
    pub client_id: String,

    /// Client secret for Basic auth against the upstream endpoints.
    pub client_secret: String,

    /// Client ids allowed to start the authorization flow.
    pub allowed_clients: Vec<String>,

    /// Upstream token endpoint URL.
    pub token_endpoint: String,

    /// Upstream revocation endpoint URL (optional, best-effort).
    pub revocation_endpoint: Option<String>,

    /// Timeout for remote calls.
    pub request_timeout: Duration,

    /// Connection timeout for remote calls.
    pub connect_timeout: Duration,

    /// How long a pending authorization request stays exchangeable.
    pub auth_request_ttl: Duration,
}

/// API key configuration.
#[derive(Debug, Clone)]
pub struct ApiKeyConfig {
    /// Header name carrying the key.
    pub header_name: String,

    /// Required plaintext prefix.
    pub prefix: String,

    /// Admin key gating the key-management endpoints. `None` disables them.
    pub admin_key: Option<String>,

    /// Bootstrap key declarations, `name:secret:perm1,perm2,...`.
    pub bootstrap: Vec<String>,

    /// Name of the bootstrap key granted the `"*"` permission.
    pub primary_key: Option<String>,
}

/// Fixed-window rate limiter configuration.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Requests allowed per window.
    pub max_requests: u32,

    /// Window length.
    pub window: Duration,

    /// Refund the window slot after a request that completed without error,
    /// so only failed or abusive calls count against the caller long-term.
    pub skip_successful: bool,
}

/// CSRF double-submit cookie configuration.
#[derive(Debug, Clone)]
pub struct CsrfConfig {
    /// HttpOnly session-id cookie name.
    pub session_cookie: String,

    /// Readable token cookie name.
    pub token_cookie: String,

    /// Request header the token must arrive in.
    pub header_name: String,

    /// Token lifetime.
    pub token_ttl: Duration,
}

/// Top-level gateway configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Which credentials the HTTP transport accepts.
    pub auth_mode: AuthMode,

    /// HTTP listen host.
    pub host: String,

    /// HTTP listen port.
    pub port: u16,

    /// Base path the external handler is mounted under.
    pub base_path: String,

    /// Base path for the OAuth endpoints.
    pub oauth_base: String,

    /// OAuth settings. `None` disables the OAuth endpoints entirely.
    pub oauth: Option<OAuthConfig>,

    /// API key settings.
    pub api_key: ApiKeyConfig,

    /// Rate limiter settings.
    pub rate_limit: RateLimitConfig,

    /// CSRF settings.
    pub csrf: CsrfConfig,

    /// Interval between background sweeps of expired entries.
    pub sweep_interval: Duration,
}

impl Config {
    /// Create a configuration with default surfaces for the given auth mode.
    #[must_use]
    pub fn new(auth_mode: AuthMode) -> Self {
        Self {
            auth_mode,
            host: "0.0.0.0".to_owned(),
            port: 8000,
            base_path: defaults::BASE_PATH.to_owned(),
            oauth_base: defaults::OAUTH_BASE.to_owned(),
            oauth: None,
            api_key: ApiKeyConfig {
                header_name: defaults::API_KEY_HEADER.to_owned(),
                prefix: defaults::API_KEY_PREFIX.to_owned(),
                admin_key: None,
                bootstrap: Vec::new(),
                primary_key: None,
            },
            rate_limit: RateLimitConfig {
                max_requests: defaults::RATE_LIMIT_MAX,
                window: defaults::RATE_LIMIT_WINDOW,
                skip_successful: false,
            },
            csrf: CsrfConfig {
                session_cookie: defaults::SESSION_COOKIE.to_owned(),
                token_cookie: defaults::CSRF_COOKIE.to_owned(),
                header_name: defaults::CSRF_HEADER.to_owned(),
                token_ttl: defaults::CSRF_TOKEN_TTL,
            },
            sweep_interval: defaults::SWEEP_INTERVAL,
        }
    }

    /// Create configuration from `TBRAIN_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns error if a variable holds an unparseable value.
    pub fn from_env() -> anyhow::Result<Self> {
        let auth_mode = match std::env::var("TBRAIN_AUTH_MODE") {
            Ok(value) => value.parse()?,
            Err(_) => AuthMode::default(),
        };

        let mut config = Self::new(auth_mode);

        if let Ok(host) = std::env::var("TBRAIN_HTTP_HOST") {
            config.host = host;
        }
        if let Ok(port) = std::env::var("TBRAIN_HTTP_PORT") {
            config.port = port.parse()?;
        }
        if let Ok(path) = std::env::var("TBRAIN_BASE_PATH") {
            config.base_path = path;
        }
        if let Ok(keys) = std::env::var("TBRAIN_API_KEYS") {
            config.api_key.bootstrap =
                keys.split(';').filter(|s| !s.is_empty()).map(str::to_owned).collect();
        }
        config.api_key.primary_key = std::env::var("TBRAIN_PRIMARY_API_KEY").ok();
        config.api_key.admin_key = std::env::var("TBRAIN_ADMIN_KEY").ok();

        if let Ok(max) = std::env::var("TBRAIN_RATE_LIMIT_MAX") {
            config.rate_limit.max_requests = max.parse()?;
        }
        if let Ok(window_ms) = std::env::var("TBRAIN_RATE_LIMIT_WINDOW_MS") {
            config.rate_limit.window = Duration::from_millis(window_ms.parse()?);
        }
        if let Ok(skip) = std::env::var("TBRAIN_RATE_LIMIT_SKIP_SUCCESSFUL") {
            config.rate_limit.skip_successful = skip.parse()?;
        }

        if let Ok(token_endpoint) = std::env::var("TBRAIN_OAUTH_TOKEN_URL") {
            config.oauth = Some(OAuthConfig {
                client_id: std::env::var("TBRAIN_OAUTH_CLIENT_ID").unwrap_or_default(),
                client_secret: std::env::var("TBRAIN_OAUTH_CLIENT_SECRET").unwrap_or_default(),
                allowed_clients: std::env::var("TBRAIN_OAUTH_ALLOWED_CLIENTS")
                    .map(|v| v.split(',').filter(|s| !s.is_empty()).map(str::to_owned).collect())
                    .unwrap_or_default(),
                token_endpoint,
                revocation_endpoint: std::env::var("TBRAIN_OAUTH_REVOKE_URL").ok(),
                request_timeout: defaults::REMOTE_TIMEOUT,
                connect_timeout: defaults::CONNECT_TIMEOUT,
                auth_request_ttl: defaults::AUTH_REQUEST_TTL,
            });
        }

        Ok(config)
    }

    /// Create a test configuration pointing OAuth at a mock token endpoint.
    #[must_use]
    pub fn for_testing(auth_mode: AuthMode, token_endpoint: &str) -> Self {
        let mut config = Self::new(auth_mode);
        config.oauth = Some(OAuthConfig {
            client_id: "tbrain-gateway".to_owned(),
            client_secret: "test-secret".to_owned(),
            allowed_clients: vec!["test-client".to_owned()],
            token_endpoint: token_endpoint.to_owned(),
            revocation_endpoint: None,
            request_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(1),
            auth_request_ttl: defaults::AUTH_REQUEST_TTL,
        });
        config
    }

    /// Full path of the public info endpoint.
    #[must_use]
    pub fn info_path(&self) -> String {
        format!("{}/info", self.base_path)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(AuthMode::default())
    }
}
