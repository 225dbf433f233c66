//! TBrain Gateway - Entry Point
//!
//! Fronts the TBrain RPC server over stdio or HTTP.

use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use tbrain_gateway::config::{AuthMode, Config};
use tbrain_gateway::error::{GatewayError, GatewayResult};
use tbrain_gateway::handler::{InboundRequest, RequestHandler};
use tbrain_gateway::server::Dispatcher;

#[derive(Parser, Debug)]
#[command(name = "tbrain-gateway")]
#[command(about = "Authentication and transport dispatch for the TBrain RPC server")]
#[command(version)]
struct Cli {
    /// Transport mode: stdio or http
    #[arg(long, default_value = "stdio")]
    transport: Transport,

    /// Auth mode: none, api-key, oauth, or both (HTTP transport only)
    #[arg(long, env = "TBRAIN_AUTH_MODE")]
    auth_mode: Option<String>,

    /// HTTP listen host
    #[arg(long, env = "TBRAIN_HTTP_HOST")]
    host: Option<String>,

    /// HTTP listen port
    #[arg(long, env = "TBRAIN_HTTP_PORT")]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "RUST_LOG")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
enum Transport {
    /// Standard input/output (single trusted peer)
    #[default]
    Stdio,
    /// HTTP listener with the full auth pipeline
    Http,
}

fn init_tracing(log_level: &str, json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if json {
        subscriber.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        subscriber.with(tracing_subscriber::fmt::layer().compact()).init();
    }
}

/// Placeholder handler used when the gateway runs standalone; the real tool
/// layer embeds the crate and supplies its own [`RequestHandler`].
struct StandaloneHandler;

#[async_trait]
impl RequestHandler for StandaloneHandler {
    async fn handle(&self, request: InboundRequest) -> GatewayResult<serde_json::Value> {
        match request.method.as_str() {
            "ping" => Ok(serde_json::json!({})),
            _ => Err(GatewayError::not_found(format!(
                "no handler for {} {}",
                request.method, request.path
            ))),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(&cli.log_level, cli.json_logs);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        transport = ?cli.transport,
        "Starting TBrain gateway"
    );

    let mut config = Config::from_env()?;
    if let Some(ref auth_mode) = cli.auth_mode {
        config.auth_mode = auth_mode.parse::<AuthMode>()?;
    }
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }

    let dispatcher = Dispatcher::new(Arc::new(config), Arc::new(StandaloneHandler));

    match cli.transport {
        Transport::Stdio => dispatcher.run_stdio().await?,
        Transport::Http => dispatcher.run_http().await?,
    }

    Ok(())
}
