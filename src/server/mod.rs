//! HTTP boundary: shared state, routes and middleware.
//!
//! Epistemic foundation:
//! - K_i: All process-wide state lives in one `AppState`, built once at startup
//! - I^B: Client input is untrusted until validated

mod client_limit;
mod error;
mod handlers;
mod validation;

pub use client_limit::{ClientAdmission, ClientLimiter, client_ip};
pub use error::ApiError;
pub use handlers::ChatResponse;
pub use validation::{ChatRequest, IncomingMessage, apply_system_prompt, validate_messages};

use crate::client::{ProviderRegistry, RateLimiter, quota_limits};
use crate::models::Config;
use crate::router::{FallbackRouter, HealthChecker, MetricsCollector};
use axum::Router;
use axum::http::{Method, header};
use axum::middleware;
use axum::routing::{get, post};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<ProviderRegistry>,
    pub limiter: Arc<RateLimiter>,
    pub health: Arc<HealthChecker>,
    pub metrics: Arc<MetricsCollector>,
    pub router: Arc<FallbackRouter>,
    pub clients: Arc<ClientLimiter>,
}

impl AppState {
    /// Build the registry from configuration and wire up the routing core.
    ///
    /// # Errors
    ///
    /// Returns `RouterError::Config` when the configuration cannot yield a
    /// usable registry (e.g. `NoUsableProviders`).
    pub fn from_config(config: Config) -> crate::Result<Self> {
        let registry = ProviderRegistry::from_config(&config)?;
        Ok(Self::new(config, registry))
    }

    /// Wire up state around an already built registry.
    pub fn new(config: Config, registry: ProviderRegistry) -> Self {
        let registry = Arc::new(registry);
        let limiter = Arc::new(RateLimiter::new(quota_limits(&config)));
        let health = Arc::new(
            HealthChecker::new(Arc::clone(&registry), config.health.probe_timeout())
                .with_stale_after(config.health.stale_after()),
        );
        let metrics = Arc::new(MetricsCollector::new(
            Arc::clone(&registry),
            Arc::clone(&limiter),
            Arc::clone(&health),
        ));
        let router = Arc::new(FallbackRouter::new(
            Arc::clone(&registry),
            Arc::clone(&limiter),
            Arc::clone(&health),
            Arc::clone(&metrics),
        ));
        let clients = Arc::new(ClientLimiter::new(config.server.client_requests_per_minute));

        Self {
            config: Arc::new(config),
            registry,
            limiter,
            health,
            metrics,
            router,
            clients,
        }
    }
}

/// Build the axum application.
pub fn app(state: AppState) -> Router {
    let routes = Router::new()
        .route("/chat", post(handlers::chat))
        .route("/chat/stream", post(handlers::chat_stream))
        .route("/status", get(handlers::status))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            client_limit::limit_clients,
        ));

    let routes = if state.config.server.cors {
        routes.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers([header::CONTENT_TYPE]),
        )
    } else {
        routes
    };

    routes
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}
