//! Priority-ordered fallback routing.
//!
//! Epistemic foundation:
//! - K_i: Candidates are tried in ascending (priority, name), each at most once
//! - K_i: Quota is charged before dispatch and never refunded
//! - B_i: The first admissible, not-known-unhealthy candidate answers (might fail → next)
//! - I^B: Provider failures are only discovered by attempting

use crate::client::{ChunkStream, LlmProvider, ProviderEntry, ProviderRegistry, RateLimiter};
use crate::models::{
    Completion, Message, ProviderError, Result, RouterError, RoutingDecision, SkippedProvider,
};
use crate::router::{HealthChecker, MetricsCollector};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Routes each request to the best available provider.
pub struct FallbackRouter {
    registry: Arc<ProviderRegistry>,
    limiter: Arc<RateLimiter>,
    health: Arc<HealthChecker>,
    metrics: Arc<MetricsCollector>,
}

impl FallbackRouter {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        limiter: Arc<RateLimiter>,
        health: Arc<HealthChecker>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            registry,
            limiter,
            health,
            metrics,
        }
    }

    /// Route one request.
    ///
    /// # Errors
    ///
    /// Returns `RouterError::AllProvidersUnavailable` with one skip per
    /// candidate, in order, when no candidate produced a completion.
    pub async fn route(&self, messages: &[Message]) -> Result<(Completion, RoutingDecision)> {
        self.route_with(|client| async move { client.complete(messages).await })
            .await
    }

    /// Route one streamed request.
    ///
    /// A candidate counts as having answered once its first chunk arrives;
    /// failing, timing out or ending empty before that falls through to the
    /// next candidate exactly as in [`route`](Self::route). Errors after the
    /// first chunk travel inside the returned stream.
    pub async fn route_stream(
        &self,
        messages: &[Message],
    ) -> Result<(ChunkStream, RoutingDecision)> {
        self.route_with(|client| async move {
            let mut chunks = client.stream(messages).await?;
            match chunks.next().await {
                Some(Ok(first)) => Ok(stream::once(async move { Ok(first) })
                    .chain(chunks)
                    .boxed()),
                Some(Err(e)) => Err(e),
                None => Err(ProviderError::InvalidResponse(
                    "Stream ended before any content".to_string(),
                )),
            }
        })
        .await
    }

    /// Candidate loop shared by both request shapes.
    async fn route_with<T, F, Fut>(&self, dispatch: F) -> Result<(T, RoutingDecision)>
    where
        F: Fn(Arc<dyn LlmProvider>) -> Fut,
        Fut: Future<Output = std::result::Result<T, ProviderError>>,
    {
        let request_id = Uuid::new_v4().to_string();
        let mut skipped = Vec::new();

        for entry in self.registry.candidates() {
            let started = Instant::now();
            match self.attempt(entry, &dispatch).await {
                Ok(answer) => {
                    self.metrics.observe_success(entry.name());
                    info!(
                        request_id = %request_id,
                        provider = %entry.name(),
                        skipped = skipped.len(),
                        duration_ms = started.elapsed().as_millis() as u64,
                        "Request routed"
                    );
                    let decision = RoutingDecision {
                        request_id,
                        provider: entry.name().to_string(),
                        skipped,
                        decided_at: Utc::now(),
                    };
                    return Ok((answer, decision));
                }
                Err(e) => {
                    let Some(reason) = e.skip_reason() else {
                        return Err(e);
                    };
                    warn!(
                        request_id = %request_id,
                        provider = %entry.name(),
                        reason = %reason,
                        error = %e,
                        "Skipping provider"
                    );
                    self.metrics.observe_skip(entry.name(), reason);
                    skipped.push(SkippedProvider::new(entry.name(), reason));
                }
            }
        }

        warn!(request_id = %request_id, candidates = skipped.len(), "No provider could serve request");
        Err(RouterError::AllProvidersUnavailable { skipped })
    }

    /// Quota, health and charge checks for one candidate.
    ///
    /// On success the quota has been charged and the client may be called.
    fn gate<'a>(&self, entry: &'a ProviderEntry) -> Result<&'a Arc<dyn LlmProvider>> {
        let provider = entry.name();
        let Some(client) = &entry.client else {
            return Err(RouterError::Internal(format!(
                "unconfigured provider '{provider}' offered as candidate"
            )));
        };

        let now = Utc::now();
        if !self.limiter.admit(provider, now) {
            return Err(RouterError::RateLimitExceeded {
                provider: provider.to_string(),
            });
        }

        if self.health.is_known_unhealthy(provider, now) {
            return Err(RouterError::ProviderUnhealthy {
                provider: provider.to_string(),
            });
        }

        if !self.limiter.try_acquire(provider, Utc::now()) {
            return Err(RouterError::RateLimitExceeded {
                provider: provider.to_string(),
            });
        }

        Ok(client)
    }

    /// Try a single candidate: gate, then dispatch under its timeout.
    async fn attempt<T, F, Fut>(&self, entry: &ProviderEntry, dispatch: &F) -> Result<T>
    where
        F: Fn(Arc<dyn LlmProvider>) -> Fut,
        Fut: Future<Output = std::result::Result<T, ProviderError>>,
    {
        let client = self.gate(entry)?;
        let provider = entry.name();

        debug!(
            provider = %provider,
            model = %client.model(),
            timeout = ?entry.timeout,
            "Dispatching"
        );

        match tokio::time::timeout(entry.timeout, dispatch(Arc::clone(client))).await {
            Ok(Ok(answer)) => Ok(answer),
            Ok(Err(source)) => Err(RouterError::ProviderRequestFailed {
                provider: provider.to_string(),
                source,
            }),
            Err(_) => Err(RouterError::ProviderRequestFailed {
                provider: provider.to_string(),
                source: ProviderError::Timeout(entry.timeout),
            }),
        }
    }
}
