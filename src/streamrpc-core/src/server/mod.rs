pub mod http;
pub mod socket;

use crate::config::ServerConfig;
use crate::registry::MethodRegistry;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// JSON-RPC over HTTP. Every path accepts requests; only POST is allowed.
pub struct Server {
    registry: Arc<MethodRegistry>,
}

impl Server {
    pub fn new(registry: MethodRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    pub fn registry(&self) -> &Arc<MethodRegistry> {
        &self.registry
    }

    pub fn router(&self) -> Router {
        Router::new()
            .fallback(http::handle_exchange)
            .with_state(self.registry.clone())
    }

    pub async fn listen(self, config: &ServerConfig) -> anyhow::Result<RunningServer> {
        let listener = TcpListener::bind(config.bind_addr()).await?;
        self.listen_on(listener)
    }

    /// Serves on an already bound listener, in the background.
    pub fn listen_on(self, listener: TcpListener) -> anyhow::Result<RunningServer> {
        let local_addr = listener.local_addr()?;
        let app = self.router();

        info!("*** Server listening on http://{}/", local_addr);

        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!("server stopped: {e}");
            }
        });

        Ok(RunningServer { local_addr, task })
    }

    /// Serves on `listener` until the accept loop fails.
    pub async fn serve(self, listener: TcpListener) -> std::io::Result<()> {
        axum::serve(listener, self.router()).await
    }
}

/// Handle to a server running in the background.
pub struct RunningServer {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl RunningServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting new connections. Exchanges already in flight keep
    /// running until they finish.
    pub fn shutdown(self) {
        self.task.abort();
    }
}
