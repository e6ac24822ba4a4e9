//! Provider registry built from configuration.
//!
//! Epistemic foundation:
//! - K_i: Provider set is fixed at startup
//! - K_i: Candidate order is ascending (priority, name)
//! - B_i: Each provider has a credential and endpoint (might not → excluded)
//! - I^R: Operator configures which providers exist and their order

use crate::client::{GeminiClient, LlmClient, LlmProvider, QuotaLimits, RequestSettings};
use crate::models::{Config, ConfigError, ProviderConfig, ProviderIdentity, ProviderKind, expand_headers};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// One configured provider.
///
/// `client` is `None` when the provider could not be built (missing
/// credential or endpoint); such a provider stays visible in status output
/// but is never a routing candidate.
#[derive(Clone)]
pub struct ProviderEntry {
    pub identity: ProviderIdentity,
    pub client: Option<Arc<dyn LlmProvider>>,
    /// Upper bound for one dispatch
    pub timeout: Duration,
    /// Why the provider is excluded, if it is
    pub config_error: Option<String>,
}

impl ProviderEntry {
    /// A usable provider.
    pub fn new(
        identity: ProviderIdentity,
        client: Arc<dyn LlmProvider>,
        timeout: Duration,
    ) -> Self {
        Self {
            identity,
            client: Some(client),
            timeout,
            config_error: None,
        }
    }

    /// A provider excluded from routing because of a configuration error.
    pub fn unconfigured(identity: ProviderIdentity, error: &ConfigError) -> Self {
        Self {
            identity,
            client: None,
            timeout: Duration::ZERO,
            config_error: Some(error.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn is_usable(&self) -> bool {
        self.client.is_some()
    }
}

impl std::fmt::Debug for ProviderEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderEntry")
            .field("identity", &self.identity)
            .field("usable", &self.is_usable())
            .field("timeout", &self.timeout)
            .field("config_error", &self.config_error)
            .finish()
    }
}

/// Registry of configured providers in candidate order.
///
/// Thread-safe: clients are shared as `Arc<dyn LlmProvider>`.
#[derive(Debug, Clone)]
pub struct ProviderRegistry {
    entries: Vec<ProviderEntry>,
}

impl ProviderRegistry {
    /// Build a registry from explicit entries, sorted into candidate order.
    pub fn new(mut entries: Vec<ProviderEntry>) -> Self {
        entries.sort_by(|a, b| {
            a.identity
                .priority
                .cmp(&b.identity.priority)
                .then_with(|| a.identity.name.cmp(&b.identity.name))
        });
        Self { entries }
    }

    /// Build registry from configuration.
    ///
    /// A provider whose credential or endpoint cannot be resolved is kept
    /// as unconfigured (degraded capacity) rather than failing startup.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::NoProviders` / `InvalidProvider` from structural
    /// validation, and `ConfigError::NoUsableProviders` when every provider
    /// was excluded.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        config.validate()?;

        let mut entries = Vec::with_capacity(config.providers.len());

        for name in config.provider_order() {
            let provider = &config.providers[name];
            let identity = ProviderIdentity {
                name: name.to_string(),
                priority: provider.priority,
                model: provider.model.clone(),
            };

            match build_client(name, provider) {
                Ok(client) => {
                    info!(
                        provider = %name,
                        priority = provider.priority,
                        model = %provider.model,
                        "Provider configured"
                    );
                    entries.push(ProviderEntry::new(identity, client, provider.timeout()));
                }
                Err(e) => {
                    warn!(provider = %name, error = %e, "Provider excluded from routing");
                    entries.push(ProviderEntry::unconfigured(identity, &e));
                }
            }
        }

        let registry = Self::new(entries);
        if registry.usable_count() == 0 {
            return Err(ConfigError::NoUsableProviders);
        }
        Ok(registry)
    }

    /// Get entry by provider name.
    pub fn get(&self, name: &str) -> Option<&ProviderEntry> {
        self.entries.iter().find(|e| e.name() == name)
    }

    /// All entries in candidate order, usable or not.
    pub fn entries(&self) -> &[ProviderEntry] {
        &self.entries
    }

    /// Routing candidates in order: usable entries only.
    pub fn candidates(&self) -> impl Iterator<Item = &ProviderEntry> {
        self.entries.iter().filter(|e| e.is_usable())
    }

    /// Get all provider names in candidate order.
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name()).collect()
    }

    pub fn usable_count(&self) -> usize {
        self.candidates().count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Build the client for one provider.
fn build_client(
    name: &str,
    provider: &ProviderConfig,
) -> Result<Arc<dyn LlmProvider>, ConfigError> {
    let base_url = provider.resolve_base_url(name)?;
    let api_key = provider.resolve_api_key(name)?;
    let settings = RequestSettings {
        model: provider.model.clone(),
        max_tokens: provider.max_tokens,
        temperature: provider.temperature,
        timeout: provider.timeout(),
    };

    let client: Arc<dyn LlmProvider> = match provider.kind {
        ProviderKind::Openai => Arc::new(
            LlmClient::new(
                name.to_string(),
                api_key,
                base_url,
                expand_headers(&provider.headers),
                settings,
            )
            .map_err(|e| ConfigError::InvalidProvider {
                provider: name.to_string(),
                reason: e.to_string(),
            })?,
        ),
        ProviderKind::Gemini => {
            let api_key = api_key.ok_or_else(|| ConfigError::MissingApiKey {
                provider: name.to_string(),
                env_var: format!("{}_API_KEY", name.to_uppercase()),
            })?;
            Arc::new(
                GeminiClient::new(name.to_string(), api_key, base_url, settings).map_err(|e| {
                    ConfigError::InvalidProvider {
                        provider: name.to_string(),
                        reason: e.to_string(),
                    }
                })?,
            )
        }
    };

    Ok(client)
}

/// Quota ceilings per provider, as configured.
pub fn quota_limits(config: &Config) -> HashMap<String, QuotaLimits> {
    config
        .providers
        .iter()
        .map(|(name, p)| {
            (
                name.clone(),
                QuotaLimits {
                    per_minute: p.requests_per_minute,
                    per_day: p.requests_per_day,
                },
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(providers: &[(&str, ProviderConfig)]) -> Config {
        let mut config = Config::default();
        for (name, p) in providers {
            config.providers.insert(name.to_string(), p.clone());
        }
        config
    }

    fn openai(priority: u32, key: Option<&str>) -> ProviderConfig {
        let mut p = ProviderConfig::new(ProviderKind::Openai, priority, "m");
        p.base_url = Some("http://127.0.0.1:1/v1".to_string());
        p.api_key = key.map(str::to_string);
        p
    }

    #[test]
    fn test_from_config_orders_candidates() {
        let config = config_with(&[
            ("gemini", {
                let mut p = ProviderConfig::new(ProviderKind::Gemini, 2, "gemini-1.5-flash");
                p.api_key = Some("g".into());
                p
            }),
            ("groq", openai(1, Some("k"))),
            ("local", openai(3, None)),
        ]);

        let registry = ProviderRegistry::from_config(&config).unwrap();
        assert_eq!(registry.names(), vec!["groq", "gemini", "local"]);
        assert_eq!(registry.usable_count(), 3);
        assert_eq!(registry.get("local").unwrap().identity.priority, 3);
    }

    #[test]
    fn test_missing_credential_excludes_provider() {
        let mut groq = openai(1, None);
        groq.api_key_env = Some("SWITCHBOARD_TEST_SURELY_UNSET_KEY".into());
        let config = config_with(&[("groq", groq), ("local", openai(2, None))]);

        let registry = ProviderRegistry::from_config(&config).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.usable_count(), 1);

        let groq = registry.get("groq").unwrap();
        assert!(!groq.is_usable());
        assert!(groq.config_error.as_deref().unwrap().contains("Missing API key"));
        assert_eq!(
            registry.candidates().map(|e| e.name()).collect::<Vec<_>>(),
            vec!["local"]
        );
    }

    #[test]
    fn test_zero_usable_providers_is_fatal() {
        let gemini = ProviderConfig::new(ProviderKind::Gemini, 1, "gemini-1.5-flash");
        let no_endpoint = ProviderConfig::new(ProviderKind::Openai, 2, "m");
        let config = config_with(&[("gemini", gemini), ("groq", no_endpoint)]);

        assert!(matches!(
            ProviderRegistry::from_config(&config),
            Err(ConfigError::NoUsableProviders)
        ));
    }

    #[test]
    fn test_quota_limits_from_config() {
        let mut groq = openai(1, Some("k"));
        groq.requests_per_day = Some(1);
        let config = config_with(&[("groq", groq)]);

        let limits = quota_limits(&config);
        assert_eq!(
            limits["groq"],
            QuotaLimits {
                per_minute: None,
                per_day: Some(1)
            }
        );
    }
}
