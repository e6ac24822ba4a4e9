//! Error types for switchboard.
//!
//! Epistemic taxonomy:
//! - B_i falsified: Expected failures (invalid input, provider skipped)
//! - I^B materialized: Infrastructure failures (network, timeout, bad payload)
//! - K_i violated: Internal invariant violations (bugs)

use crate::models::{SkipReason, SkippedProvider};
use thiserror::Error;

/// Top-level error type for switchboard.
#[derive(Debug, Error)]
pub enum RouterError {
    // ═══════════════════════════════════════════════════════════════════
    // B_i FALSIFIED — Belief proven wrong (expected failures)
    // ═══════════════════════════════════════════════════════════════════

    #[error("Configuration error: {0}")]
    Config(#[from] super::ConfigError),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Provider '{provider}' is over its request quota")]
    RateLimitExceeded { provider: String },

    #[error("Provider '{provider}' is unhealthy")]
    ProviderUnhealthy { provider: String },

    // ═══════════════════════════════════════════════════════════════════
    // I^B MATERIALIZED — Bounded ignorance became known-bad
    // ═══════════════════════════════════════════════════════════════════

    #[error("Request to provider '{provider}' failed: {source}")]
    ProviderRequestFailed {
        provider: String,
        #[source]
        source: ProviderError,
    },

    #[error("All providers unavailable: {}", format_skips(.skipped))]
    AllProvidersUnavailable { skipped: Vec<SkippedProvider> },

    // ═══════════════════════════════════════════════════════════════════
    // K_i VIOLATED — Invariant broken (bug, should not happen)
    // ═══════════════════════════════════════════════════════════════════

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Provider dispatch errors.
///
/// Every variant is absorbed by the router and turned into a
/// `request_failed` skip; only the message survives into logs.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Request timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Authentication failed: invalid API key")]
    AuthenticationFailed,

    #[error("Rate limited by provider: {message}")]
    RateLimited {
        message: String,
        retry_after_secs: Option<f64>,
    },

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),
}

impl RouterError {
    /// Short machine-readable kind, used as the `details` field of HTTP errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "ConfigurationError",
            Self::Validation(_) => "ValidationError",
            Self::RateLimitExceeded { .. } => "RateLimitExceeded",
            Self::ProviderUnhealthy { .. } => "ProviderUnhealthy",
            Self::ProviderRequestFailed { .. } => "ProviderRequestFailed",
            Self::AllProvidersUnavailable { .. } => "AllProvidersUnavailable",
            Self::Internal(_) => "InternalError",
        }
    }

    /// Convert a per-candidate error into the skip reason it represents.
    ///
    /// Returns `None` for errors that are not tied to one candidate.
    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self {
            Self::RateLimitExceeded { .. } => Some(SkipReason::RateLimited),
            Self::ProviderUnhealthy { .. } => Some(SkipReason::Unhealthy),
            Self::ProviderRequestFailed { .. } => Some(SkipReason::RequestFailed),
            _ => None,
        }
    }
}

impl ProviderError {
    /// Map a non-success HTTP status and body into a provider error.
    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            401 | 403 => Self::AuthenticationFailed,
            429 => Self::RateLimited {
                message,
                retry_after_secs: None,
            },
            _ => Self::Api { status, message },
        }
    }
}

fn format_skips(skipped: &[SkippedProvider]) -> String {
    skipped
        .iter()
        .map(|s| format!("{}={}", s.provider, s.reason))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type alias for switchboard.
pub type Result<T> = std::result::Result<T, RouterError>;
