//! Transport dispatch.
//!
//! The dispatcher is `stopped` until one of the run methods is called, then
//! `running` on exactly one transport. The stdio transport binds the external
//! handler directly to the process pipe; the HTTP transport wraps it in the
//! full middleware pipeline. [`ServerHandle::stop`] closes the listener and
//! aborts the store sweepers, returning to `stopped`.

pub mod http;
pub mod stdio;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::handler::RequestHandler;

/// Top-level transport dispatcher.
pub struct Dispatcher {
    config: Arc<Config>,
    handler: Arc<dyn RequestHandler>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(config: Arc<Config>, handler: Arc<dyn RequestHandler>) -> Self {
        Self { config, handler }
    }

    /// Run the stdio transport until stdin closes.
    ///
    /// # Errors
    ///
    /// Returns error on I/O failure.
    pub async fn run_stdio(self) -> anyhow::Result<()> {
        tracing::info!("Starting gateway in stdio mode");
        let (_shutdown, rx) = watch::channel(false);
        stdio::run_stdio(self.handler, rx).await
    }

    /// Start the stdio transport in the background.
    #[must_use]
    pub fn serve_stdio(self) -> StdioHandle {
        tracing::info!("Starting gateway in stdio mode");
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(stdio::run_stdio(self.handler, shutdown_rx));
        StdioHandle { shutdown: shutdown_tx, task }
    }

    /// Bind the HTTP listener and start serving in the background.
    ///
    /// # Errors
    ///
    /// Returns error when the listener cannot bind or the router cannot be
    /// built (bad bootstrap keys, unusable OAuth config).
    pub async fn serve_http(self) -> anyhow::Result<ServerHandle> {
        let (router, sweepers) =
            http::create_router(Arc::clone(&self.config), self.handler).await?;

        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, auth_mode = %self.config.auth_mode, "HTTP transport listening");

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let server = tokio::spawn(async move {
            axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            })
            .await
        });

        Ok(ServerHandle { addr: local_addr, shutdown: shutdown_tx, server, sweepers })
    }

    /// Run the HTTP transport until ctrl-c.
    ///
    /// # Errors
    ///
    /// Returns error on bind or serve failure.
    pub async fn run_http(self) -> anyhow::Result<()> {
        let handle = self.serve_http().await?;
        tokio::signal::ctrl_c().await?;
        tracing::info!("Received shutdown signal");
        handle.stop().await;
        Ok(())
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").field("auth_mode", &self.config.auth_mode).finish()
    }
}

/// A running stdio transport.
pub struct StdioHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl StdioHandle {
    /// Close the stdio channel and wait for the loop to exit.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                tracing::warn!(error = %e, "Stdio task ended abnormally");
            }
        }
        tracing::info!("Stdio transport stopped");
    }
}

/// A running HTTP transport.
pub struct ServerHandle {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    server: JoinHandle<std::io::Result<()>>,
    sweepers: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    /// The bound listen address.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Close the listener and release the background sweepers.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for sweeper in self.sweepers {
            sweeper.abort();
        }
        if let Err(e) = self.server.await {
            if !e.is_cancelled() {
                tracing::warn!(error = %e, "HTTP server task ended abnormally");
            }
        }
        tracing::info!("HTTP transport stopped");
    }
}
