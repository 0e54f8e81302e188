//! Runs the configured transports side by side
//!
//! The pipe binding serves the process's own stdio; the network bindings share one TCP listener
//! and one router. Every accepted stream is served on its own task.

use std::{future::IntoFuture, net::SocketAddr, time::Duration};

use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{Config, ConfigError};
use crate::mcp::server::{serve_stdio, ServerContext};
use crate::transport::TransportKind;
use crate::{build_app, AppState};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ServeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("http server failed: {0}")]
    Http(#[source] std::io::Error),
}

/// Serves every transport in `config.transports` until Ctrl-C, or until the client of a
/// pipe-only server hangs up.
pub async fn serve(config: &Config, context: ServerContext) -> Result<(), ServeError> {
    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            signal.cancel();
        }
    });

    serve_until(config, context, shutdown).await
}

/// Like [`serve`], but stops when `shutdown` is cancelled instead of on Ctrl-C.
pub async fn serve_until(
    config: &Config,
    context: ServerContext,
    shutdown: CancellationToken,
) -> Result<(), ServeError> {
    let network: Vec<TransportKind> = config
        .transports
        .iter()
        .copied()
        .filter(|transport| transport.is_network())
        .collect();
    if config.transports.is_empty() {
        return Err(ConfigError::NoTransports.into());
    }

    let http = async {
        if network.is_empty() {
            return Ok(());
        }

        let addr = config.bind_socket()?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServeError::Bind { addr, source })?;
        info!(
            bind_addr = %config.bind_addr,
            bind_port = config.bind_port,
            transports = ?network,
            "server starting"
        );

        serve_http(listener, AppState::new(context.clone(), network.clone()), &shutdown).await
    };

    let stdio = async {
        if config.transports.contains(&TransportKind::Pipe) {
            tokio::select! {
                _ = serve_stdio(context.clone()) => info!("pipe client disconnected"),
                _ = shutdown.cancelled() => {}
            }
        }
        Ok::<_, ServeError>(())
    };

    tokio::try_join!(http, stdio)?;
    info!("server stopped");
    Ok(())
}

/// Serves the router on an already bound listener.
pub async fn serve_http(
    listener: TcpListener,
    state: AppState,
    shutdown: &CancellationToken,
) -> Result<(), ServeError> {
    let server = axum::serve(listener, build_app(state).into_make_service())
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .into_future();

    // Open event streams never finish on their own, so graceful shutdown gets a deadline.
    tokio::select! {
        result = server => result.map_err(ServeError::Http),
        _ = async {
            shutdown.cancelled().await;
            tokio::time::sleep(SHUTDOWN_GRACE).await;
        } => {
            warn!("open streams did not close in time");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::demo_registry;

    fn context() -> ServerContext {
        ServerContext::new(demo_registry().expect("demo registry"), "Demo Server")
    }

    #[tokio::test]
    async fn serve_rejects_an_empty_transport_list() {
        let config = Config {
            bind_addr: "127.0.0.1".to_string(),
            bind_port: 0,
            transports: vec![],
            server_name: "Demo Server".to_string(),
        };

        let result = serve_until(&config, context(), CancellationToken::new()).await;
        assert!(matches!(result, Err(ServeError::Config(ConfigError::NoTransports))));
    }

    #[tokio::test]
    async fn http_listener_stops_on_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let shutdown = CancellationToken::new();
        let state = AppState::new(context(), vec![TransportKind::BidirectionalStream]);

        let server = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { serve_http(listener, state, &shutdown).await })
        };

        let health = reqwest::get(format!("http://{addr}/health"))
            .await
            .expect("health request");
        assert!(health.status().is_success());
        drop(health);

        shutdown.cancel();
        let result = tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .expect("server stops in time")
            .expect("task joins");
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn occupied_port_is_a_bind_error() {
        let occupied = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = occupied.local_addr().expect("local addr").port();
        let config = Config {
            bind_addr: "127.0.0.1".to_string(),
            bind_port: port,
            transports: vec![TransportKind::PushStream],
            server_name: "Demo Server".to_string(),
        };

        let result = serve_until(&config, context(), CancellationToken::new()).await;
        assert!(matches!(result, Err(ServeError::Bind { .. })));
    }
}
