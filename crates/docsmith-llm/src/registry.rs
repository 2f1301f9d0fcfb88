use crate::backends::{build_backend, ProviderBackend};
use crate::config::{GatewayConfig, GatewaySettings, ProviderConfig};
use docsmith_core::{GatewayError, GatewayResult};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Read-only provider configuration plus one backend per provider id.
///
/// Built once at startup and shared behind an `Arc`; nothing mutates it
/// afterwards, so concurrent readers need no locking.
pub struct ProviderRegistry {
    gateway: GatewayConfig,
    providers: HashMap<String, ProviderConfig>,
    backends: HashMap<String, Arc<dyn ProviderBackend>>,
}

impl ProviderRegistry {
    /// Validates `settings` and builds the HTTP backend for every provider.
    pub fn from_settings(settings: GatewaySettings) -> GatewayResult<Self> {
        let mut registry = Self::without_backends(settings)?;
        registry.backends = registry
            .providers
            .values()
            .map(|cfg| (cfg.id.clone(), build_backend(cfg)))
            .collect();
        Ok(registry)
    }

    /// Validates `settings` but leaves backends to be supplied through
    /// [`with_backend`](Self::with_backend). Used for custom adapters and tests.
    pub fn without_backends(settings: GatewaySettings) -> GatewayResult<Self> {
        settings.validate()?;
        let providers = settings
            .providers
            .into_iter()
            .map(|cfg| (cfg.id.clone(), cfg))
            .collect();
        Ok(Self {
            gateway: settings.gateway,
            providers,
            backends: HashMap::new(),
        })
    }

    /// Installs (or replaces) the backend for a configured provider.
    pub fn with_backend(
        mut self,
        id: &str,
        backend: Arc<dyn ProviderBackend>,
    ) -> GatewayResult<Self> {
        if !self.providers.contains_key(id) {
            return Err(GatewayError::UnknownProvider(id.to_string()));
        }
        self.backends.insert(id.to_string(), backend);
        Ok(self)
    }

    /// Chain ordering, defaults and retry policy.
    pub fn gateway_config(&self) -> &GatewayConfig {
        &self.gateway
    }

    /// The configured primary provider id.
    pub fn primary(&self) -> &str {
        &self.gateway.primary_provider
    }

    /// Settings for `id`, or [`GatewayError::UnknownProvider`].
    pub fn config_for(&self, id: &str) -> GatewayResult<&ProviderConfig> {
        self.providers
            .get(id)
            .ok_or_else(|| GatewayError::UnknownProvider(id.to_string()))
    }

    /// Backend installed for `id`, or [`GatewayError::UnknownProvider`].
    pub fn backend_for(&self, id: &str) -> GatewayResult<Arc<dyn ProviderBackend>> {
        self.backends
            .get(id)
            .cloned()
            .ok_or_else(|| GatewayError::UnknownProvider(id.to_string()))
    }

    /// True iff `id` is configured with a credential.
    pub fn is_provider_available(&self, id: &str) -> bool {
        self.providers
            .get(id)
            .is_some_and(ProviderConfig::has_credential)
    }

    /// Whether at least one provider in the default chain is usable.
    pub fn any_available(&self) -> bool {
        self.fallback_chain(self.primary())
            .iter()
            .any(|id| self.is_provider_available(id))
    }

    /// `primary_id` followed by the configured fallbacks, first occurrence wins.
    pub fn fallback_chain(&self, primary_id: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        std::iter::once(primary_id)
            .chain(self.gateway.fallback_providers.iter().map(String::as_str))
            .filter(|id| seen.insert(*id))
            .map(str::to_string)
            .collect()
    }
}
