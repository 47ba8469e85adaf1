//! # Engine Configuration
//!
//! `EngineConfig` carries everything the coordinator needs to drive a run.
//! `PersistedConfig` is the optional-field overlay stored in
//! `<runtime>/config.json` and edited through the HTTP API.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::models::{LlmProvider, ModelConfig};
use crate::orchestration::retry::RetryPolicy;
use crate::skills::AgentRole;
use crate::state::io::{get_runtime_path, write_atomic};

/// Serialize `Duration` as integer milliseconds
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
        }
    }
}

/// Styling passed to the image generator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageStyle {
    /// e.g. "1024x1024", "1536x1024"
    pub size: String,
    /// "low", "medium", "high" or "auto"
    pub quality: String,
}

impl Default for ImageStyle {
    fn default() -> Self {
        Self {
            size: "1024x1024".to_string(),
            quality: "medium".to_string(),
        }
    }
}

/// Configuration for the research coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Global LLM provider (default: OpenAI)
    pub global_provider: LlmProvider,
    /// Global model to use for all roles
    pub global_model: Option<String>,
    /// Base URL override for OpenAI-compatible endpoints
    pub base_url: Option<String>,
    /// Per-role model overrides (role id -> model name)
    pub per_role_models: HashMap<String, String>,
    /// Per-role provider overrides (role id -> provider)
    pub per_role_providers: HashMap<String, LlmProvider>,
    /// Per-role base URL overrides (role id -> base_url, OpenAI only)
    pub per_role_base_urls: HashMap<String, String>,
    /// Run triage and clarification before research. `false` is direct mode.
    pub use_clarifications: bool,
    /// Retry policy applied to every required external call
    pub retry: RetryPolicy,
    /// Upper bound on waiting for the side-asset branch after research completes
    #[serde(with = "duration_ms")]
    pub side_asset_wait: Duration,
    /// Give up waiting for answers after this long. `None` waits indefinitely.
    #[serde(with = "duration_ms::option")]
    pub clarification_timeout: Option<Duration>,
    pub plan_min_items: usize,
    pub plan_max_items: usize,
    /// Word bound for each search summary
    pub summary_max_words: usize,
    pub max_concurrent_searches: usize,
    /// Where deliverables are written. Defaults to `<runtime>/reports`.
    pub output_dir: Option<PathBuf>,
    pub image: ImageStyle,
    /// SearXNG instance URL (falls back to `SEARXNG_URL`, then localhost)
    pub searxng_url: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            global_provider: LlmProvider::OpenAI,
            global_model: None,
            base_url: None,
            per_role_models: HashMap::new(),
            per_role_providers: HashMap::new(),
            per_role_base_urls: HashMap::new(),
            use_clarifications: true,
            retry: RetryPolicy::default(),
            side_asset_wait: Duration::from_secs(120),
            clarification_timeout: None,
            plan_min_items: 5,
            plan_max_items: 20,
            summary_max_words: 200,
            max_concurrent_searches: 5,
            output_dir: None,
            image: ImageStyle::default(),
            searxng_url: None,
        }
    }
}

impl EngineConfig {
    /// Resolve the model for a role: per-role override -> global -> provider default.
    pub fn model_for(&self, role: AgentRole) -> ModelConfig {
        let id = role.id();

        let provider = self
            .per_role_providers
            .get(id)
            .cloned()
            .unwrap_or_else(|| self.global_provider.clone());

        let model = self
            .per_role_models
            .get(id)
            .or(self.global_model.as_ref())
            .cloned()
            .unwrap_or_else(|| provider.default_model().to_string());

        let base_url = if provider.supports_base_url() {
            self.per_role_base_urls
                .get(id)
                .or(self.base_url.as_ref())
                .cloned()
        } else {
            None
        };

        ModelConfig {
            provider,
            model,
            base_url,
        }
    }

    /// Directory deliverables are written under
    pub fn output_root(&self) -> PathBuf {
        self.output_dir
            .clone()
            .unwrap_or_else(|| get_runtime_path().join("reports"))
    }

    /// Defaults with the persisted overlay applied
    pub async fn load() -> Self {
        let mut config = Self::default();
        PersistedConfig::load().await.apply(&mut config);
        config
    }
}

/// Persisted configuration (subset of EngineConfig exposed to the API)
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct PersistedConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global_provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_clarifications: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub side_asset_wait_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clarification_timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent_searches: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_size: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_quality: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub searxng_url: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub per_role_providers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub per_role_models: HashMap<String, String>,
}

impl PersistedConfig {
    pub fn path() -> PathBuf {
        get_runtime_path().join("config.json")
    }

    /// Load the overlay; a missing or unreadable file yields an empty overlay.
    pub async fn load() -> Self {
        Self::load_from(&Self::path()).await
    }

    pub async fn load_from(path: &std::path::Path) -> Self {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "Ignoring malformed config file");
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    pub async fn save(&self) -> Result<()> {
        self.save_to(&Self::path()).await
    }

    pub async fn save_to(&self, path: &std::path::Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        write_atomic(path, content.as_bytes()).await
    }

    /// Overwrite fields that are set in `other`
    pub fn merge(&mut self, other: PersistedConfig) {
        macro_rules! take {
            ($($field:ident),*) => {
                $(
                    if other.$field.is_some() {
                        self.$field = other.$field;
                    }
                )*
            };
        }
        take!(
            global_provider,
            global_model,
            base_url,
            use_clarifications,
            max_attempts,
            call_timeout_secs,
            side_asset_wait_secs,
            clarification_timeout_secs,
            max_concurrent_searches,
            output_dir,
            image_size,
            image_quality,
            searxng_url
        );
        for (k, v) in other.per_role_providers {
            self.per_role_providers.insert(k, v);
        }
        for (k, v) in other.per_role_models {
            self.per_role_models.insert(k, v);
        }
    }

    /// Apply the overlay onto an engine config
    pub fn apply(&self, config: &mut EngineConfig) {
        if let Some(provider) = self.global_provider.as_deref() {
            match LlmProvider::parse(provider) {
                Some(p) => config.global_provider = p,
                None => tracing::warn!(provider, "Unknown provider in config, keeping default"),
            }
        }
        if let Some(model) = &self.global_model {
            config.global_model = Some(model.clone());
        }
        if let Some(url) = &self.base_url {
            config.base_url = Some(url.clone());
        }
        if let Some(flag) = self.use_clarifications {
            config.use_clarifications = flag;
        }
        if let Some(attempts) = self.max_attempts {
            config.retry.maximum_attempts = attempts.max(1);
        }
        if let Some(secs) = self.call_timeout_secs {
            config.retry.call_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.side_asset_wait_secs {
            config.side_asset_wait = Duration::from_secs(secs);
        }
        if let Some(secs) = self.clarification_timeout_secs {
            config.clarification_timeout = Some(Duration::from_secs(secs));
        }
        if let Some(n) = self.max_concurrent_searches {
            config.max_concurrent_searches = n.max(1);
        }
        if let Some(dir) = &self.output_dir {
            config.output_dir = Some(PathBuf::from(dir));
        }
        if let Some(size) = &self.image_size {
            config.image.size = size.clone();
        }
        if let Some(quality) = &self.image_quality {
            config.image.quality = quality.clone();
        }
        if let Some(url) = &self.searxng_url {
            config.searxng_url = Some(url.clone());
        }
        for (role, provider) in &self.per_role_providers {
            if let Some(p) = LlmProvider::parse(provider) {
                config.per_role_providers.insert(role.clone(), p);
            }
        }
        for (role, model) in &self.per_role_models {
            config.per_role_models.insert(role.clone(), model.clone());
        }
    }
}
