//! Provider health probing.
//!
//! Epistemic foundation:
//! - K_i: Probes are advisory; absent data means "unknown, attempt anyway"
//! - K_i: The router reads the last completed snapshot, never probes inline
//! - B_i: A probe completes within its timeout (might not → unreachable)
//! - I^B: Provider availability changes without notice → periodic refresh
//! - I^B: Old results say little about now → stale results count as unknown

use crate::client::{ProviderEntry, ProviderRegistry};
use crate::models::ProviderError;
use arc_swap::ArcSwap;
use chrono::{DateTime, TimeDelta, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Health of one provider as of its last probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthStatus {
    /// Provider name
    pub provider: String,
    /// Whether the last probe succeeded
    pub reachable: bool,
    /// When the last probe finished
    pub last_checked: DateTime<Utc>,
    /// Error summary (if unreachable)
    pub last_error: Option<String>,
    /// Probe latency in milliseconds (if a response arrived)
    pub latency_ms: Option<u64>,
}

impl HealthStatus {
    pub fn reachable(provider: impl Into<String>, latency_ms: u64) -> Self {
        Self {
            provider: provider.into(),
            reachable: true,
            last_checked: Utc::now(),
            last_error: None,
            latency_ms: Some(latency_ms),
        }
    }

    pub fn unreachable(provider: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            reachable: false,
            last_checked: Utc::now(),
            last_error: Some(error.into()),
            latency_ms: None,
        }
    }
}

/// Published health snapshot: provider name → latest status.
pub type HealthSnapshot = HashMap<String, HealthStatus>;

/// Default age after which a result no longer counts.
const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(600);

/// Probes providers and publishes the results as an atomically swapped
/// snapshot.
pub struct HealthChecker {
    registry: Arc<ProviderRegistry>,
    snapshot: ArcSwap<HealthSnapshot>,
    probe_timeout: Duration,
    stale_after: TimeDelta,
    /// Held for the duration of a probe round; rounds publish in start order
    round: Mutex<()>,
}

impl HealthChecker {
    pub fn new(registry: Arc<ProviderRegistry>, probe_timeout: Duration) -> Self {
        Self {
            registry,
            snapshot: ArcSwap::from_pointee(HashMap::new()),
            probe_timeout,
            stale_after: TimeDelta::from_std(DEFAULT_STALE_AFTER).unwrap_or(TimeDelta::MAX),
            round: Mutex::new(()),
        }
    }

    /// Set the age after which a result is treated as unknown.
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = TimeDelta::from_std(stale_after).unwrap_or(TimeDelta::MAX);
        self
    }

    /// Whether `status` is too old to act on at `now`.
    pub fn is_stale(&self, status: &HealthStatus, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(status.last_checked) > self.stale_after
    }

    /// Whether a fresh result says the provider is down.
    ///
    /// Never-probed and stale providers are not known-unhealthy.
    pub fn is_known_unhealthy(&self, provider: &str, now: DateTime<Utc>) -> bool {
        self.snapshot
            .load()
            .get(provider)
            .is_some_and(|status| !status.reachable && !self.is_stale(status, now))
    }

    /// Latest status for a provider (None = never probed).
    pub fn latest(&self, provider: &str) -> Option<HealthStatus> {
        self.snapshot.load().get(provider).cloned()
    }

    /// The most recently published snapshot.
    pub fn snapshot(&self) -> Arc<HealthSnapshot> {
        self.snapshot.load_full()
    }

    /// Probe a single provider and publish its status.
    ///
    /// Returns None if the provider is not in the registry.
    pub async fn probe(&self, provider: &str) -> Option<HealthStatus> {
        let entry = self.registry.get(provider)?;
        let _round = self.round.lock().await;
        let status = self.probe_entry(entry).await;
        self.publish(status.clone());
        Some(status)
    }

    /// Probe every provider concurrently and publish the combined snapshot.
    ///
    /// Each probe is bounded by the probe timeout; a provider that does not
    /// answer in time reports `reachable = false`.
    pub async fn probe_all(&self) -> HealthSnapshot {
        let _round = self.round.lock().await;
        let results = join_all(
            self.registry
                .entries()
                .iter()
                .map(|entry| self.probe_entry(entry)),
        )
        .await;

        for status in &results {
            if status.reachable {
                info!(
                    provider = %status.provider,
                    latency_ms = status.latency_ms.unwrap_or_default(),
                    "Provider healthy"
                );
            } else {
                warn!(
                    provider = %status.provider,
                    error = status.last_error.as_deref().unwrap_or("unknown"),
                    "Provider unreachable"
                );
            }
        }

        let snapshot: HealthSnapshot = results
            .into_iter()
            .map(|status| (status.provider.clone(), status))
            .collect();
        self.snapshot.store(Arc::new(snapshot.clone()));
        snapshot
    }

    /// Run `probe_all` on a fixed interval in the background.
    ///
    /// The first round starts immediately.
    pub fn spawn_refresh(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let snapshot = self.probe_all().await;
                debug!(
                    healthy = snapshot.values().filter(|s| s.reachable).count(),
                    total = snapshot.len(),
                    "Health refresh complete"
                );
            }
        })
    }

    /// Replace one provider's entry in the snapshot.
    pub(crate) fn publish(&self, status: HealthStatus) {
        self.snapshot.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(status.provider.clone(), status.clone());
            next
        });
    }

    async fn probe_entry(&self, entry: &ProviderEntry) -> HealthStatus {
        let Some(client) = &entry.client else {
            let reason = entry
                .config_error
                .clone()
                .unwrap_or_else(|| "missing credential or endpoint".to_string());
            return HealthStatus::unreachable(
                entry.name(),
                ProviderError::NotConfigured(reason).to_string(),
            );
        };

        let start = Instant::now();
        match tokio::time::timeout(self.probe_timeout, client.probe()).await {
            Ok(Ok(())) => {
                HealthStatus::reachable(entry.name(), start.elapsed().as_millis() as u64)
            }
            Ok(Err(e)) => HealthStatus::unreachable(entry.name(), e.to_string()),
            Err(_) => HealthStatus::unreachable(
                entry.name(),
                format!("probe timed out after {:?}", self.probe_timeout),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ConfigError;
    use crate::router::testing::{FakeProvider, entry, identity};

    fn checker(entries: Vec<ProviderEntry>) -> HealthChecker {
        HealthChecker::new(
            Arc::new(ProviderRegistry::new(entries)),
            Duration::from_millis(200),
        )
    }

    #[tokio::test]
    async fn test_probe_all_reports_each_provider() {
        let ok = FakeProvider::new("groq");
        let down = FakeProvider::new("gemini");
        down.set_probe_ok(false);

        let checker = checker(vec![entry(1, &ok), entry(2, &down)]);
        assert!(checker.latest("groq").is_none());

        let snapshot = checker.probe_all().await;
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot["groq"].reachable);
        assert!(!snapshot["gemini"].reachable);
        assert!(snapshot["gemini"].last_error.is_some());
        assert_eq!(checker.latest("gemini").unwrap(), snapshot["gemini"]);
    }

    #[tokio::test]
    async fn test_hanging_probe_times_out_as_unreachable() {
        let slow = FakeProvider::new("slow");
        slow.set_probe_delay(Duration::from_secs(30));
        let fast = FakeProvider::new("fast");

        let checker = checker(vec![entry(1, &slow), entry(2, &fast)]);
        let started = Instant::now();
        let snapshot = checker.probe_all().await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!snapshot["slow"].reachable);
        assert!(
            snapshot["slow"]
                .last_error
                .as_deref()
                .unwrap()
                .contains("timed out")
        );
        assert!(snapshot["fast"].reachable);
    }

    #[tokio::test]
    async fn test_unconfigured_provider_is_unreachable_without_probe() {
        let error = ConfigError::MissingApiKey {
            provider: "groq".into(),
            env_var: "GROQ_API_KEY".into(),
        };
        let checker = checker(vec![ProviderEntry::unconfigured(identity("groq", 1), &error)]);

        let status = checker.probe("groq").await.unwrap();
        assert!(!status.reachable);
        let error = status.last_error.unwrap();
        assert!(error.starts_with("Provider not configured"));
        assert!(error.contains("GROQ_API_KEY"));
        assert!(checker.probe("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_single_probe_updates_only_its_entry() {
        let groq = FakeProvider::new("groq");
        let gemini = FakeProvider::new("gemini");
        let checker = checker(vec![entry(1, &groq), entry(2, &gemini)]);

        checker.probe_all().await;
        groq.set_probe_ok(false);
        checker.probe("groq").await;

        assert!(!checker.latest("groq").unwrap().reachable);
        assert!(checker.latest("gemini").unwrap().reachable);
        assert_eq!(groq.probe_calls(), 2);
        assert_eq!(gemini.probe_calls(), 1);
    }

    #[tokio::test]
    async fn test_stale_failure_is_not_known_unhealthy() {
        let groq = FakeProvider::new("groq");
        let checker = checker(vec![entry(1, &groq)]).with_stale_after(Duration::from_secs(60));
        let now = Utc::now();

        let mut status = HealthStatus::unreachable("groq", "connection refused");
        status.last_checked = now - TimeDelta::seconds(30);
        checker.publish(status.clone());
        assert!(checker.is_known_unhealthy("groq", now));

        status.last_checked = now - TimeDelta::seconds(61);
        checker.publish(status);
        assert!(!checker.is_known_unhealthy("groq", now));
        assert!(!checker.is_known_unhealthy("never-probed", now));
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_refresh_republishes() {
        let groq = FakeProvider::new("groq");
        let checker = Arc::new(checker(vec![entry(1, &groq)]));
        let handle = Arc::clone(&checker).spawn_refresh(Duration::from_secs(60));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(checker.latest("groq").unwrap().reachable);
        assert_eq!(groq.probe_calls(), 1);

        groq.set_probe_ok(false);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!checker.latest("groq").unwrap().reachable);
        assert_eq!(groq.probe_calls(), 2);

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_rounds_publish_in_start_order() {
        let groq = FakeProvider::new("groq");
        groq.set_probe_delay(Duration::from_millis(150));
        let checker = checker(vec![entry(1, &groq)]);

        // first round is in flight with a "reachable" answer pending
        let first = checker.probe_all();
        tokio::pin!(first);
        assert!(futures::poll!(first.as_mut()).is_pending());

        groq.set_probe_ok(false);
        groq.set_probe_delay(Duration::ZERO);
        let (first, second) = tokio::join!(first, checker.probe_all());

        assert!(first["groq"].reachable);
        assert!(!second["groq"].reachable);
        assert!(!checker.latest("groq").unwrap().reachable);
    }
}
