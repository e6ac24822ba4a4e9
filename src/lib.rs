//! switchboard - Priority-ordered LLM provider router with quota-aware fallback.
//!
//! ## Architecture
//!
//! - **Registry**: Configured providers in candidate order (priority, name)
//! - **Rate Limiter**: Fixed minute/day windows per provider
//! - **Health Checker**: Background probes published as an atomic snapshot
//! - **Fallback Router**: Tries candidates in order, each at most once
//! - **Metrics**: Pure reads over quota and health state
//!
//! ## HTTP
//!
//! - `POST /chat`: Validate, route, answer
//! - `POST /chat/stream`: Same routing, answer as server-sent events
//! - `GET /status`: Probe all providers, report usage and current provider
//!
//! ## Epistemic Design
//!
//! - K_i (Knowledge): Compile-time enforced invariants (types, enums)
//! - B_i (Beliefs): Runtime fallible operations (Result, Option)
//! - I^R (Resolvable): Operator-configured providers, quotas, limits
//! - I^B (Bounded): Provider availability, discovered by probing and attempting

pub mod client;
pub mod models;
pub mod router;
pub mod server;

// Re-exports for convenience
pub use client::{LlmProvider, ProviderRegistry, RateLimiter};
pub use models::{Config, ConfigError, Message, Result, Role, RouterError};
pub use router::{FallbackRouter, HealthChecker, MetricsCollector};
pub use server::{AppState, app};
