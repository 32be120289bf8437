//! Gateway server

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::oneshot;
use tracing::{info, warn};

use super::auth::InboundGuard;
use super::router::{AppState, create_router};
use super::tools::GdpTools;
use crate::config::Config;
use crate::credentials::Credentials;
use crate::failsafe::RetryPolicy;
use crate::gdp::{CatalogLoader, GdpClient, build_http_client};
use crate::oauth::{HttpTokenExchange, TokenBroker};
use crate::{Error, Result};

/// GDP MCP Gateway server
pub struct Gateway {
    /// Configuration
    config: Config,
    /// Shared handler state
    state: Arc<AppState>,
}

impl Gateway {
    /// Wire the credential store, token broker, API client and tools
    ///
    /// No network traffic happens here; the first token is obtained on
    /// first use.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for incomplete credentials or when no
    /// inbound API key is configured.
    pub fn new(config: Config) -> Result<Self> {
        let credentials = Arc::new(Credentials::from_config(&config.gdp, &config.auth)?);
        if credentials.api_keys().is_empty() {
            return Err(Error::Config(
                "no inbound API keys configured (auth.api_keys); generate one with `gdp-mcp-gateway keygen`"
                    .to_string(),
            ));
        }

        let http_client = build_http_client(&config.gdp)?;
        let exchange = Arc::new(HttpTokenExchange::new(
            http_client.clone(),
            Arc::clone(&credentials),
        ));
        let broker = TokenBroker::new(
            exchange,
            config.gdp.refresh_margin,
            config.gdp.token_timeout,
        );
        let client = GdpClient::new(
            http_client,
            broker.clone(),
            credentials.api_base_url(),
            config.gdp.request_timeout,
        );

        let cache_path = Some(config.catalog.cache_path.clone())
            .filter(|p| !p.as_os_str().is_empty());
        let catalog = Arc::new(CatalogLoader::new(
            client.clone(),
            cache_path,
            config.catalog.prefer_cache,
        ));
        let tools = GdpTools::new(
            client,
            catalog,
            RetryPolicy::new(&config.retry),
            &config.catalog,
        );
        let guard = Arc::new(InboundGuard::from_credentials(
            &credentials,
            config.auth.public_paths.clone(),
        ));

        let state = Arc::new(AppState {
            tools,
            guard,
            broker,
            target: config.gdp.target(),
            max_body_size: config.server.max_body_size,
            request_timeout: config.server.request_timeout,
        });

        Ok(Self { config, state })
    }

    /// HTTP router serving `/mcp` and `/health`
    pub fn router(&self) -> Router {
        create_router(Arc::clone(&self.state))
    }

    /// Run the gateway until a shutdown signal arrives
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let app = self.router();
        let listener = TcpListener::bind(addr).await?;

        info!("============================================================");
        info!("GDP MCP GATEWAY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %self.config.server.host, port = %self.config.server.port, "Listening");
        info!(target = %self.state.target, "GDP appliance");
        info!(api_keys = self.state.guard.key_count(), "Inbound API keys loaded");
        info!(
            "  POST http://{}:{}/mcp  (MCP requests)",
            self.config.server.host, self.config.server.port
        );
        info!("============================================================");

        let (signalled_tx, signalled_rx) = oneshot::channel::<()>();
        let serve = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown_signal().await;
                let _ = signalled_tx.send(());
            })
            .into_future();
        let mut serve = std::pin::pin!(serve);

        tokio::select! {
            result = &mut serve => {
                return result.map_err(|e| Error::Internal(e.to_string()));
            }
            _ = signalled_rx => {}
        }

        // Drain in-flight requests, bounded by the shutdown timeout
        let shutdown_timeout = self.config.server.shutdown_timeout;
        match tokio::time::timeout(shutdown_timeout, serve).await {
            Ok(result) => result.map_err(|e| Error::Internal(e.to_string()))?,
            Err(_) => warn!(timeout = ?shutdown_timeout, "Graceful shutdown timed out, dropping open connections"),
        }

        info!("Gateway stopped");
        Ok(())
    }
}

/// Shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
