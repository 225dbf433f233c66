//! Stdio transport: JSON-RPC 2.0 over stdin/stdout.
//!
//! Serves exactly one already-trusted peer sequentially; no rate limiting,
//! CSRF, or auth middleware apply here. The trust boundary is the parent
//! process that spawned us.

use std::borrow::Cow;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::auth::AuthContext;
use crate::error::GatewayError;
use crate::handler::{InboundRequest, RequestHandler};

/// JSON-RPC 2.0 request.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub id: Option<serde_json::Value>,
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: Cow<'static, str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
}

/// JSON-RPC 2.0 error.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
}

impl JsonRpcResponse {
    /// JSON-RPC version constant.
    const VERSION: &'static str = "2.0";

    #[must_use]
    pub fn success(id: Option<serde_json::Value>, result: serde_json::Value) -> Self {
        Self { jsonrpc: Cow::Borrowed(Self::VERSION), result: Some(result), error: None, id }
    }

    #[must_use]
    pub fn error(id: Option<serde_json::Value>, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: Cow::Borrowed(Self::VERSION),
            result: None,
            error: Some(JsonRpcError { code, message: message.into() }),
            id,
        }
    }
}

/// Run the stdio loop until stdin closes or shutdown is signalled.
pub async fn run_stdio(
    handler: Arc<dyn RequestHandler>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut reader = BufReader::new(stdin);
    let mut line = String::new();

    tracing::info!("Stdio transport ready, waiting for requests...");

    loop {
        line.clear();
        let bytes_read = tokio::select! {
            read = reader.read_line(&mut line) => read?,
            _ = shutdown.changed() => {
                tracing::debug!("Shutdown signalled, leaving stdio loop");
                break;
            }
        };

        if bytes_read == 0 {
            // EOF
            tracing::info!("Stdin closed, shutting down");
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let request: JsonRpcRequest = match serde_json::from_str(trimmed) {
            Ok(req) => req,
            Err(e) => {
                let response = JsonRpcResponse::error(None, -32700, format!("Parse error: {e}"));
                write_response(&mut stdout, &response).await?;
                continue;
            }
        };

        tracing::debug!(method = %request.method, "Received stdio request");
        let response = handle_request(request, handler.as_ref()).await;
        write_response(&mut stdout, &response).await?;
    }

    Ok(())
}

async fn write_response(
    stdout: &mut tokio::io::Stdout,
    response: &JsonRpcResponse,
) -> anyhow::Result<()> {
    let response_json = serde_json::to_string(response)?;
    stdout.write_all(response_json.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await?;
    Ok(())
}

async fn handle_request(req: JsonRpcRequest, handler: &dyn RequestHandler) -> JsonRpcResponse {
    if req.method == "ping" {
        return JsonRpcResponse::success(req.id, serde_json::json!({}));
    }

    let inbound = InboundRequest {
        method: req.method,
        path: String::new(),
        params: req.params,
        context: AuthContext::Trusted,
    };

    match handler.handle(inbound).await {
        Ok(result) => JsonRpcResponse::success(req.id, result),
        Err(e) => JsonRpcResponse::error(req.id, rpc_code(&e), e.public_message()),
    }
}

const fn rpc_code(error: &GatewayError) -> i32 {
    match error {
        GatewayError::InvalidRequest(_) => -32602,
        GatewayError::NotFound(_) => -32601,
        _ => -32000,
    }
}
