//! Relay that forwards operator commands to connected agents and turns their
//! asynchronous results back into synchronous replies.

use std::net::SocketAddr;
use std::sync::Arc;

use app::{build_router, AppState, AuthConfig};
use axum::http::HeaderValue;
use registry::{RelayConfig, Registry};
use tower_http::cors::{Any, CorsLayer};

pub mod app;
mod deadline;
pub mod dispatch;
mod matcher;
pub mod protocol;
pub mod reassembly;
pub mod registry;
pub mod socket;

pub use dispatch::{CommandRequest, PendingReply};
pub use fleet_relay_error::RelayError;
pub use protocol::{CommandKind, CommandReply, Outcome};
pub use registry::AgentConnection;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub relay: RelayConfig,
    pub api_key: Option<String>,
    pub cors_allow_origin: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("invalid listen address `{addr}`: {source}")]
    InvalidAddr {
        addr: String,
        #[source]
        source: std::net::AddrParseError,
    },
    #[error("invalid CORS origin: {0}")]
    InvalidCorsOrigin(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub async fn run_server(config: ServerConfig) -> Result<(), ServerError> {
    let registry = Arc::new(Registry::new(config.relay.clone()));
    let auth = match config.api_key.clone() {
        Some(api_key) => AuthConfig::with_api_key(api_key),
        None => {
            tracing::warn!("no api key configured; operator endpoints are unauthenticated");
            AuthConfig::disabled()
        }
    };
    let cors = build_cors_layer(&config.cors_allow_origin)?;
    run_server_with_registry(config.host, config.port, registry, auth, cors).await
}

async fn run_server_with_registry(
    host: String,
    port: u16,
    registry: Arc<Registry>,
    auth: AuthConfig,
    cors: CorsLayer,
) -> Result<(), ServerError> {
    let state = Arc::new(AppState::new(registry.clone(), auth));
    let app = build_router(state).layer(cors);

    let addr_text = format!("{host}:{port}");
    let addr: SocketAddr = addr_text
        .parse()
        .map_err(|source| ServerError::InvalidAddr {
            addr: addr_text.clone(),
            source,
        })?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "fleet-relay listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(registry))
        .await?;
    Ok(())
}

async fn shutdown_signal(registry: Arc<Registry>) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown requested");
    registry.shutdown().await;
}

pub fn build_cors_layer(origins: &[String]) -> Result<CorsLayer, ServerError> {
    let mut allowed = Vec::with_capacity(origins.len());
    for origin in origins {
        let value: HeaderValue = origin
            .parse()
            .map_err(|_| ServerError::InvalidCorsOrigin(origin.clone()))?;
        allowed.push(value);
    }

    let cors = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if allowed.is_empty() {
        Ok(cors.allow_origin(tower_http::cors::AllowOrigin::predicate(|_, _| false)))
    } else {
        Ok(cors.allow_origin(allowed))
    }
}
