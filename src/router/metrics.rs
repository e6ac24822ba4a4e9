//! Usage metrics collector.
//!
//! Epistemic foundation:
//! - K_i: Usage is derived from quota windows and the health snapshot, never stored
//! - K_i: Reads are pure; two reads at the same instant agree
//! - I^R: Dispatch outcome counters are process-lifetime only

use crate::client::{ProviderRegistry, RateLimiter};
use crate::models::SkipReason;
use crate::router::HealthChecker;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time usage of one provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderUsage {
    pub provider: String,
    pub daily_count: u32,
    pub minute_count: u32,
    pub last_request: Option<DateTime<Utc>>,
    /// Provider has a working client
    pub configured: bool,
    /// Latest probe result (None = never probed)
    pub reachable: Option<bool>,
    /// Quota window currently exhausted
    pub rate_limited: bool,
    /// configured ∧ not known-unhealthy (fresh failure) ∧ not rate limited
    pub available: bool,
    pub outcomes: OutcomeCounts,
}

/// Dispatch outcomes observed for one provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeCounts {
    pub succeeded: u64,
    pub request_failed: u64,
    pub rate_limited: u64,
    pub unhealthy: u64,
}

/// Aggregate usage view across all providers, in candidate order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetrics {
    pub as_of: DateTime<Utc>,
    pub providers: Vec<ProviderUsage>,
}

impl UsageMetrics {
    pub fn get(&self, provider: &str) -> Option<&ProviderUsage> {
        self.providers.iter().find(|p| p.provider == provider)
    }
}

/// The provider that would answer the next request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub provider: String,
    pub model: String,
    pub fallback_available: bool,
}

impl ModelInfo {
    fn none() -> Self {
        Self {
            provider: "none".to_string(),
            model: "No service available".to_string(),
            fallback_available: false,
        }
    }
}

#[derive(Debug, Default)]
struct OutcomeCounters {
    succeeded: AtomicU64,
    request_failed: AtomicU64,
    rate_limited: AtomicU64,
    unhealthy: AtomicU64,
}

impl OutcomeCounters {
    fn load(&self) -> OutcomeCounts {
        OutcomeCounts {
            succeeded: self.succeeded.load(Ordering::Relaxed),
            request_failed: self.request_failed.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            unhealthy: self.unhealthy.load(Ordering::Relaxed),
        }
    }
}

/// Composes quota and health state into queryable snapshots.
pub struct MetricsCollector {
    registry: Arc<ProviderRegistry>,
    limiter: Arc<RateLimiter>,
    health: Arc<HealthChecker>,
    outcomes: DashMap<String, OutcomeCounters>,
}

impl MetricsCollector {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        limiter: Arc<RateLimiter>,
        health: Arc<HealthChecker>,
    ) -> Self {
        Self {
            registry,
            limiter,
            health,
            outcomes: DashMap::new(),
        }
    }

    /// Record a successful dispatch.
    pub fn observe_success(&self, provider: &str) {
        self.outcomes
            .entry(provider.to_string())
            .or_default()
            .succeeded
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Record a skipped candidate.
    pub fn observe_skip(&self, provider: &str, reason: SkipReason) {
        let counters = self.outcomes.entry(provider.to_string()).or_default();
        let counter = match reason {
            SkipReason::RateLimited => &counters.rate_limited,
            SkipReason::Unhealthy => &counters.unhealthy,
            SkipReason::RequestFailed => &counters.request_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> UsageMetrics {
        self.snapshot_at(Utc::now())
    }

    /// Usage as it reads at `now`. Never mutates window or health state.
    pub fn snapshot_at(&self, now: DateTime<Utc>) -> UsageMetrics {
        let health = self.health.snapshot();

        let providers = self
            .registry
            .entries()
            .iter()
            .map(|entry| {
                let name = entry.name();
                let quota = self.limiter.usage_at(name, now);
                let reachable = health.get(name).map(|s| s.reachable);
                let configured = entry.is_usable();
                let rate_limited = !quota.admissible;

                ProviderUsage {
                    provider: name.to_string(),
                    daily_count: quota.day_count,
                    minute_count: quota.minute_count,
                    last_request: quota.last_request,
                    configured,
                    reachable,
                    rate_limited,
                    available: configured
                        && !self.health.is_known_unhealthy(name, now)
                        && !rate_limited,
                    outcomes: self
                        .outcomes
                        .get(name)
                        .map(|c| c.load())
                        .unwrap_or_default(),
                }
            })
            .collect();

        UsageMetrics {
            as_of: now,
            providers,
        }
    }

    pub fn model_info(&self) -> ModelInfo {
        self.model_info_at(Utc::now())
    }

    /// The highest-priority provider that is admissible and not known to be
    /// unhealthy, plus whether any lower-priority candidate is admissible.
    pub fn model_info_at(&self, now: DateTime<Utc>) -> ModelInfo {
        let candidates: Vec<_> = self.registry.candidates().collect();

        let current = candidates.iter().position(|entry| {
            !self.health.is_known_unhealthy(entry.name(), now)
                && self.limiter.usage_at(entry.name(), now).admissible
        });

        match current {
            Some(idx) => {
                let entry = candidates[idx];
                ModelInfo {
                    provider: entry.name().to_string(),
                    model: entry.identity.model.clone(),
                    fallback_available: candidates[idx + 1..]
                        .iter()
                        .any(|e| self.limiter.usage_at(e.name(), now).admissible),
                }
            }
            None => ModelInfo::none(),
        }
    }
}
