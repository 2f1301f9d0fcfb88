use crate::engine::RetryPolicy;
use docsmith_core::{GatewayError, GatewayResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;

/// Which adapter talks to a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// OpenAI chat completions API.
    OpenAi,
    /// Anthropic messages API.
    Anthropic,
    /// OpenRouter (OpenAI-compatible API).
    OpenRouter,
    /// Groq cloud inference (OpenAI-compatible API).
    Groq,
}

/// Per-provider settings, immutable once loaded.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Unique provider id, referenced by the chain settings.
    pub id: String,
    /// Which wire protocol the provider speaks.
    pub kind: ProviderKind,
    /// API key. A provider without one is configured but unavailable.
    #[serde(default)]
    pub credential: Option<String>,
    /// Model requested from this provider.
    pub model: String,
    /// Context window, used to size each request's output budget.
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: usize,
    /// Overrides [`GatewayConfig::temperature`] for this provider.
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Upper bound for a single attempt against this provider.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Overrides the kind's default endpoint.
    pub api_base_url: Option<String>,
}

// Keeps credentials out of logs.
impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("credential", &self.credential.as_ref().map(|_| "<redacted>"))
            .field("model", &self.model)
            .field("max_context_tokens", &self.max_context_tokens)
            .field("temperature", &self.temperature)
            .field("timeout_ms", &self.timeout_ms)
            .field("api_base_url", &self.api_base_url)
            .finish()
    }
}

/// Gateway-wide settings: provider ordering, output defaults and retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Provider every call starts with unless overridden.
    pub primary_provider: String,
    /// Tried in order after the primary. Must not contain duplicates.
    #[serde(default)]
    pub fallback_providers: Vec<String>,
    /// Output budget when the caller gives none.
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: usize,
    /// Sampling temperature when neither the call nor the provider sets one.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Retry behaviour applied to every provider in the chain.
    #[serde(default)]
    pub retry_policy: RetryPolicy,
}

/// Everything the configuration loader hands to the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySettings {
    /// Chain ordering and defaults.
    pub gateway: GatewayConfig,
    /// Every configured provider, available or not.
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

fn default_max_context_tokens() -> usize {
    8192
}

fn default_temperature() -> f32 {
    0.7
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_max_tokens() -> usize {
    2048
}

impl ProviderConfig {
    /// Minimal config with defaults for every optional field.
    pub fn new(
        id: impl Into<String>,
        kind: ProviderKind,
        model: impl Into<String>,
        credential: Option<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            credential,
            model: model.into(),
            max_context_tokens: default_max_context_tokens(),
            temperature: None,
            timeout_ms: default_timeout_ms(),
            api_base_url: None,
        }
    }

    /// Endpoint root: the configured override or the kind's default.
    pub fn base_url(&self) -> &str {
        if let Some(url) = &self.api_base_url {
            url
        } else {
            match self.kind {
                ProviderKind::OpenAi => "https://api.openai.com",
                ProviderKind::Anthropic => "https://api.anthropic.com",
                ProviderKind::OpenRouter => "https://openrouter.ai/api",
                ProviderKind::Groq => "https://api.groq.com/openai",
            }
        }
    }

    /// Whether a non-blank credential is configured.
    pub fn has_credential(&self) -> bool {
        self.credential
            .as_deref()
            .is_some_and(|c| !c.trim().is_empty())
    }
}

impl GatewayConfig {
    /// Config with the given primary, no fallbacks, and default limits.
    pub fn new(primary_provider: impl Into<String>) -> Self {
        Self {
            primary_provider: primary_provider.into(),
            fallback_providers: Vec::new(),
            default_max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl GatewaySettings {
    /// Parses TOML of the form `[gateway] ... [[providers]] ...`.
    pub fn from_toml_str(text: &str) -> GatewayResult<Self> {
        let settings: Self = toml::from_str(text)
            .map_err(|e| GatewayError::Config(format!("Invalid gateway config: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reads and parses a TOML config file.
    pub async fn load(path: impl AsRef<Path>) -> GatewayResult<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            GatewayError::Config(format!(
                "Failed to read config file '{}': {e}",
                path.display()
            ))
        })?;
        Self::from_toml_str(&text)
    }

    /// Checks cross-references between the gateway and provider sections.
    pub fn validate(&self) -> GatewayResult<()> {
        let mut ids = HashSet::new();
        for provider in &self.providers {
            if !ids.insert(provider.id.as_str()) {
                return Err(GatewayError::Config(format!(
                    "Provider '{}' is configured more than once",
                    provider.id
                )));
            }
        }

        if !ids.contains(self.gateway.primary_provider.as_str()) {
            return Err(GatewayError::UnknownProvider(
                self.gateway.primary_provider.clone(),
            ));
        }

        let mut seen = HashSet::new();
        for fallback in &self.gateway.fallback_providers {
            if !ids.contains(fallback.as_str()) {
                return Err(GatewayError::UnknownProvider(fallback.clone()));
            }
            if !seen.insert(fallback.as_str()) {
                return Err(GatewayError::Config(format!(
                    "Fallback provider '{fallback}' listed more than once"
                )));
            }
        }

        if self.gateway.retry_policy.max_attempts == 0 {
            return Err(GatewayError::Config(
                "retry_policy.max_attempts must be at least 1".into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [gateway]
        primary_provider = "openai"
        fallback_providers = ["anthropic", "groq"]
        default_max_tokens = 1024

        [gateway.retry_policy]
        max_attempts = 2
        backoff_base_ms = 100

        [[providers]]
        id = "openai"
        kind = "openai"
        credential = "sk-test"
        model = "gpt-4o-mini"

        [[providers]]
        id = "anthropic"
        kind = "anthropic"
        credential = "sk-ant-test"
        model = "claude-3-5-haiku-latest"
        max_context_tokens = 200000
        temperature = 0.2
        timeout_ms = 60000

        [[providers]]
        id = "groq"
        kind = "groq"
        model = "llama-3.1-8b-instant"
    "#;

    #[test]
    fn parses_sample_with_defaults() {
        let settings = GatewaySettings::from_toml_str(SAMPLE).unwrap();
        assert_eq!(settings.gateway.primary_provider, "openai");
        assert_eq!(settings.gateway.fallback_providers, ["anthropic", "groq"]);
        assert_eq!(settings.gateway.default_max_tokens, 1024);
        assert_eq!(settings.gateway.temperature, 0.7);
        assert_eq!(settings.gateway.retry_policy.max_attempts, 2);
        assert_eq!(settings.gateway.retry_policy.backoff_base_ms, 100);
        assert_eq!(settings.gateway.retry_policy.backoff_max_ms, 30_000);

        let openai = &settings.providers[0];
        assert_eq!(openai.kind, ProviderKind::OpenAi);
        assert_eq!(openai.max_context_tokens, 8192);
        assert_eq!(openai.timeout_ms, 30_000);
        assert_eq!(openai.temperature, None);
        assert!(openai.has_credential());
        assert_eq!(settings.providers[1].temperature, Some(0.2));

        let groq = &settings.providers[2];
        assert!(!groq.has_credential());
        assert_eq!(groq.base_url(), "https://api.groq.com/openai");
    }

    #[test]
    fn rejects_unknown_primary() {
        let toml = r#"
            [gateway]
            primary_provider = "missing"
        "#;
        let err = GatewaySettings::from_toml_str(toml).unwrap_err();
        assert!(matches!(err, GatewayError::UnknownProvider(id) if id == "missing"));
    }

    #[test]
    fn rejects_duplicate_fallbacks() {
        let mut settings = GatewaySettings::from_toml_str(SAMPLE).unwrap();
        settings.gateway.fallback_providers = vec!["groq".into(), "groq".into()];
        assert!(matches!(settings.validate(), Err(GatewayError::Config(_))));
    }

    #[test]
    fn rejects_zero_attempts() {
        let mut settings = GatewaySettings::from_toml_str(SAMPLE).unwrap();
        settings.gateway.retry_policy.max_attempts = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn malformed_toml_is_config_error() {
        let err = GatewaySettings::from_toml_str("[gateway").unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }

    #[test]
    fn blank_credential_is_not_a_credential() {
        let cfg = ProviderConfig::new("p", ProviderKind::OpenAi, "m", Some("   ".into()));
        assert!(!cfg.has_credential());
    }

    #[test]
    fn debug_redacts_credential() {
        let cfg = ProviderConfig::new("p", ProviderKind::Anthropic, "m", Some("sk-secret".into()));
        let dbg = format!("{cfg:?}");
        assert!(!dbg.contains("sk-secret"));
        assert!(dbg.contains("<redacted>"));
    }

    #[test]
    fn base_url_override() {
        let mut cfg = ProviderConfig::new("p", ProviderKind::Anthropic, "m", None);
        assert_eq!(cfg.base_url(), "https://api.anthropic.com");
        cfg.api_base_url = Some("http://localhost:8080".into());
        assert_eq!(cfg.base_url(), "http://localhost:8080");
    }

    #[tokio::test]
    async fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.toml");
        tokio::fs::write(&path, SAMPLE).await.unwrap();
        let settings = GatewaySettings::load(&path).await.unwrap();
        assert_eq!(settings.providers.len(), 3);

        let missing = GatewaySettings::load(dir.path().join("nope.toml")).await;
        assert!(matches!(missing, Err(GatewayError::Config(_))));
    }
}
