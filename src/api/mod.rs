//! HTTP + WebSocket surface: portfolio analytics endpoints, the WebSocket
//! Broadcaster, and the `/health`/`/metrics` ops endpoints.

pub mod auth;
mod handlers;
pub mod websocket;

use crate::config::{ApiConfig, MonitoringConfig};
use crate::core::CoreResult;
use crate::database::DatabaseManager;
use crate::services::broker::BrokerClient;
use crate::services::portfolio_calculator::PortfolioCalculator;
use crate::services::portfolio_mode::PortfolioModeService;
use crate::services::rate_limiter::RateLimiter;
use crate::services::snapshot_store::SnapshotStore;
use anyhow::Result;
use auth::TokenVerifier;
use axum::routing::{get, post};
use axum::Router;
use prometheus::Registry;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use websocket::ConnectionRegistry;

pub struct Metrics {
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> CoreResult<Self> {
        Ok(Self { registry: Registry::new() })
    }
}

pub struct ApiState<B: BrokerClient> {
    pub db: Arc<DatabaseManager>,
    pub token_verifier: Arc<TokenVerifier>,
    pub portfolio_mode: Arc<PortfolioModeService>,
    pub snapshot_store: Arc<SnapshotStore>,
    pub rate_limiter: Arc<RateLimiter>,
    pub calculator: Arc<PortfolioCalculator<B>>,
    pub connections: ConnectionRegistry,
    pub metrics: Arc<Metrics>,
}

impl<B: BrokerClient> Clone for ApiState<B> {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            token_verifier: self.token_verifier.clone(),
            portfolio_mode: self.portfolio_mode.clone(),
            snapshot_store: self.snapshot_store.clone(),
            rate_limiter: self.rate_limiter.clone(),
            calculator: self.calculator.clone(),
            connections: self.connections.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

pub fn create_app<B: BrokerClient + 'static>(state: ApiState<B>) -> Router {
    Router::new()
        .route("/api/portfolio/value", get(handlers::get_portfolio_value::<B>))
        .route("/api/portfolio/history", get(handlers::get_portfolio_history::<B>))
        .route("/api/portfolio/refresh", post(handlers::post_portfolio_refresh::<B>))
        .route("/ws/portfolio/:account_id", get(websocket::websocket_handler::<B>))
        .route("/health", get(handlers::health_handler::<B>))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}

pub async fn start_server<B: BrokerClient + 'static>(
    state: ApiState<B>,
    config: &ApiConfig,
) -> Result<tokio::task::JoinHandle<()>> {
    let app = create_app(state);
    let listener = TcpListener::bind(&config.bind_address).await?;
    info!("API server listening on {}", config.bind_address);

    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("API server error: {e}");
        }
    }))
}

pub async fn start_metrics_server<B: BrokerClient + 'static>(
    state: ApiState<B>,
    config: &MonitoringConfig,
) -> Result<tokio::task::JoinHandle<()>> {
    let app = Router::new()
        .route("/metrics", get(handlers::metrics_handler::<B>))
        .with_state(state);

    let addr = format!("0.0.0.0:{}", config.metrics_port);
    let listener = TcpListener::bind(&addr).await?;
    info!("metrics server listening on {addr}");

    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("metrics server error: {e}");
        }
    }))
}
