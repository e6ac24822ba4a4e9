//! Chat and routing types for switchboard.
//!
//! K_i: These types represent the data flow through one routed request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Speaker of a chat message.
///
/// K_i: Only these three roles are ever forwarded to a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    /// Parse a role name, rejecting anything outside the fixed set.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message in a chat conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Identity of a configured provider.
///
/// K_i: Immutable after startup. Lower priority is tried first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderIdentity {
    /// Unique provider name (e.g. "groq", "gemini")
    pub name: String,
    /// Ordinal priority, lower = tried first
    pub priority: u32,
    /// Model identifier sent to the provider
    pub model: String,
}

/// Response from a completed provider dispatch.
#[derive(Debug, Clone)]
pub struct Completion {
    /// Generated content
    pub content: String,
    /// Model reported by the provider (may differ from requested)
    pub model: String,
    /// Input tokens, if reported
    pub input_tokens: u32,
    /// Output tokens, if reported
    pub output_tokens: u32,
    /// Request duration
    pub duration: Duration,
}

/// Why a candidate provider was not used for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Quota window exhausted
    RateLimited,
    /// Latest health probe reported the provider unreachable
    Unhealthy,
    /// Dispatch errored, timed out, or returned a malformed payload
    RequestFailed,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::RateLimited => "rate_limited",
            SkipReason::Unhealthy => "unhealthy",
            SkipReason::RequestFailed => "request_failed",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A candidate that was passed over, in evaluation order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedProvider {
    pub provider: String,
    pub reason: SkipReason,
}

impl SkippedProvider {
    pub fn new(provider: impl Into<String>, reason: SkipReason) -> Self {
        Self {
            provider: provider.into(),
            reason,
        }
    }
}

/// Outcome of routing one request.
///
/// Exists only for the lifetime of a single request.
#[derive(Debug, Clone, Serialize)]
pub struct RoutingDecision {
    /// Request identifier (for log correlation)
    pub request_id: String,
    /// Provider that answered
    pub provider: String,
    /// Earlier candidates that were skipped, in order
    pub skipped: Vec<SkippedProvider>,
    /// When the decision was made
    pub decided_at: DateTime<Utc>,
}

impl RoutingDecision {
    /// Whether the answering provider was not the first candidate.
    pub fn is_fallback(&self) -> bool {
        !self.skipped.is_empty()
    }
}
