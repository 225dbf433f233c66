//! Contract between the gateway and the external request handler.
//!
//! The tool-execution layer lives outside this crate; it receives requests
//! that have already been rate-limited, CSRF-checked, and authenticated.

use async_trait::async_trait;

use crate::auth::AuthContext;
use crate::error::GatewayResult;

/// A request that cleared the middleware pipeline.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    /// HTTP verb, or the JSON-RPC method name on the stdio transport.
    pub method: String,

    /// Request path relative to the base path; empty on stdio.
    pub path: String,

    /// Query parameters or request/params body.
    pub params: serde_json::Value,

    /// Normalized caller identity.
    pub context: AuthContext,
}

/// The external collaborator the dispatcher routes requests to.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Handle one authenticated request, returning a JSON result.
    async fn handle(&self, request: InboundRequest) -> GatewayResult<serde_json::Value>;
}
