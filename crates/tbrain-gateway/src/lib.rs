//! TBrain Gateway
//!
//! Authentication, authorization, and transport dispatch in front of the
//! TBrain RPC server. Decides per request whether the caller is authenticated
//! (OAuth 2.1 authorization-code with PKCE, a static API key, both, or
//! neither), enforces fixed-window rate limits, guards state-changing
//! requests with double-submit CSRF tokens, and serves either a single
//! trusted peer over stdio or many clients over HTTP.
//!
//! All auth state is in-memory and volatile by design: tokens, pending
//! authorization requests, and API keys vanish on restart.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use tbrain_gateway::config::{AuthMode, Config};
//! use tbrain_gateway::error::GatewayResult;
//! use tbrain_gateway::handler::{InboundRequest, RequestHandler};
//! use tbrain_gateway::server::Dispatcher;
//!
//! struct MyTools;
//!
//! #[async_trait]
//! impl RequestHandler for MyTools {
//!     async fn handle(&self, request: InboundRequest) -> GatewayResult<serde_json::Value> {
//!         Ok(serde_json::json!({ "echo": request.params }))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Arc::new(Config::new(AuthMode::ApiKey));
//!     let dispatcher = Dispatcher::new(config, Arc::new(MyTools));
//!     dispatcher.run_http().await
//! }
//! ```

pub mod auth;
pub mod config;
pub mod error;
pub mod handler;
pub mod server;

pub use auth::AuthContext;
pub use config::{AuthMode, Config};
pub use error::{GatewayError, GatewayResult};
pub use handler::{InboundRequest, RequestHandler};
pub use server::Dispatcher;
