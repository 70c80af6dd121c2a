//! Provider configuration.
//!
//! Everything comes from the environment and there are no fallbacks for the
//! choice of provider or model: both `LLM_PROVIDER` and `LLM_MODEL` must be
//! set.

use std::str::FromStr;

use crate::error::ProviderError;

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";
pub const GOOGLE_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";
pub const DEFAULT_EMBEDDING_DIMENSION: usize = 1536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProvider {
    OpenAi,
    Anthropic,
    Google,
}

impl LlmProvider {
    /// Environment variable holding this provider's API key.
    pub fn api_key_var(&self) -> &'static str {
        match self {
            LlmProvider::OpenAi => "OPENAI_API_KEY",
            LlmProvider::Anthropic => "ANTHROPIC_API_KEY",
            LlmProvider::Google => "GOOGLE_API_KEY",
        }
    }

    fn base_url_var(&self) -> &'static str {
        match self {
            LlmProvider::OpenAi => "OPENAI_BASE_URL",
            LlmProvider::Anthropic => "ANTHROPIC_BASE_URL",
            LlmProvider::Google => "GOOGLE_BASE_URL",
        }
    }

    fn default_base_url(&self) -> &'static str {
        match self {
            LlmProvider::OpenAi => OPENAI_BASE_URL,
            LlmProvider::Anthropic => ANTHROPIC_BASE_URL,
            LlmProvider::Google => GOOGLE_BASE_URL,
        }
    }
}

impl std::fmt::Display for LlmProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LlmProvider::OpenAi => write!(f, "OpenAI"),
            LlmProvider::Anthropic => write!(f, "Anthropic"),
            LlmProvider::Google => write!(f, "Google"),
        }
    }
}

impl FromStr for LlmProvider {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(LlmProvider::OpenAi),
            "anthropic" => Ok(LlmProvider::Anthropic),
            "google" => Ok(LlmProvider::Google),
            other => Err(ProviderError::InvalidConfig {
                key: "LLM_PROVIDER".to_string(),
                reason: format!(
                    "'{}' is not supported. Set to 'openai', 'anthropic', or 'google'",
                    other
                ),
            }),
        }
    }
}

/// Embeddings are always served by OpenAI, whichever chat provider is used.
#[derive(Debug, Clone)]
pub struct EmbeddingSettings {
    pub model: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub dimension: usize,
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub provider: LlmProvider,
    pub model: String,
    /// Key of the selected chat provider, checked when the model is resolved.
    pub api_key: Option<String>,
    pub base_url: String,
    pub temperature: f32,
    pub timeout_seconds: u64,
    pub embedding: EmbeddingSettings,
}

impl ProviderConfig {
    pub fn from_env() -> Result<Self, ProviderError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve from an arbitrary variable source. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ProviderError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let provider: LlmProvider = var("LLM_PROVIDER")
            .ok_or_else(|| ProviderError::MissingConfig {
                key: "LLM_PROVIDER".to_string(),
            })?
            .parse()?;

        let model = var("LLM_MODEL").ok_or_else(|| ProviderError::MissingConfig {
            key: "LLM_MODEL".to_string(),
        })?;

        let base_url = var(provider.base_url_var())
            .unwrap_or_else(|| provider.default_base_url().to_string())
            .trim_end_matches('/')
            .to_string();

        let dimension = match var("VECTOR_DIMENSION") {
            Some(raw) => raw
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|d| *d > 0)
                .ok_or_else(|| ProviderError::InvalidConfig {
                    key: "VECTOR_DIMENSION".to_string(),
                    reason: format!("'{}' is not a positive integer", raw),
                })?,
            None => DEFAULT_EMBEDDING_DIMENSION,
        };

        let embedding = EmbeddingSettings {
            model: var("EMBEDDING_MODEL").unwrap_or_else(|| DEFAULT_EMBEDDING_MODEL.to_string()),
            base_url: var("OPENAI_BASE_URL")
                .unwrap_or_else(|| OPENAI_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key: var("OPENAI_API_KEY"),
            dimension,
        };

        Ok(Self {
            api_key: var(provider.api_key_var()),
            provider,
            model,
            base_url,
            temperature: 0.0,
            timeout_seconds: 120,
            embedding,
        })
    }

    pub(crate) fn require_api_key(&self) -> Result<String, ProviderError> {
        self.api_key
            .clone()
            .ok_or_else(|| ProviderError::MissingConfig {
                key: self.provider.api_key_var().to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn provider_and_model_are_required() {
        let err = ProviderConfig::from_lookup(vars(&[])).unwrap_err();
        assert!(matches!(err, ProviderError::MissingConfig { ref key } if key == "LLM_PROVIDER"));

        let err = ProviderConfig::from_lookup(vars(&[("LLM_PROVIDER", "openai")])).unwrap_err();
        assert!(matches!(err, ProviderError::MissingConfig { ref key } if key == "LLM_MODEL"));
    }

    #[test]
    fn unknown_provider_rejected() {
        let err = ProviderConfig::from_lookup(vars(&[
            ("LLM_PROVIDER", "cohere"),
            ("LLM_MODEL", "command"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ProviderError::InvalidConfig { .. }));
    }

    #[test]
    fn provider_name_is_case_insensitive() {
        let cfg = ProviderConfig::from_lookup(vars(&[
            ("LLM_PROVIDER", "Anthropic"),
            ("LLM_MODEL", "claude-sonnet-4-5-20250514"),
            ("ANTHROPIC_API_KEY", "sk-ant"),
            ("OPENAI_API_KEY", "sk-oai"),
        ]))
        .unwrap();
        assert_eq!(cfg.provider, LlmProvider::Anthropic);
        assert_eq!(cfg.api_key.as_deref(), Some("sk-ant"));
        assert_eq!(cfg.base_url, ANTHROPIC_BASE_URL);
        assert_eq!(cfg.temperature, 0.0);
        assert_eq!(cfg.embedding.api_key.as_deref(), Some("sk-oai"));
    }

    #[test]
    fn embedding_defaults_and_overrides() {
        let cfg = ProviderConfig::from_lookup(vars(&[
            ("LLM_PROVIDER", "google"),
            ("LLM_MODEL", "gemini-2.5-flash"),
        ]))
        .unwrap();
        assert_eq!(cfg.embedding.model, DEFAULT_EMBEDDING_MODEL);
        assert_eq!(cfg.embedding.dimension, 1536);
        assert!(cfg.embedding.api_key.is_none());

        let cfg = ProviderConfig::from_lookup(vars(&[
            ("LLM_PROVIDER", "openai"),
            ("LLM_MODEL", "gpt-4o"),
            ("EMBEDDING_MODEL", "text-embedding-3-large"),
            ("VECTOR_DIMENSION", "3072"),
            ("OPENAI_BASE_URL", "http://localhost:8080/v1/"),
        ]))
        .unwrap();
        assert_eq!(cfg.embedding.model, "text-embedding-3-large");
        assert_eq!(cfg.embedding.dimension, 3072);
        assert_eq!(cfg.embedding.base_url, "http://localhost:8080/v1");
        assert_eq!(cfg.base_url, "http://localhost:8080/v1");
    }

    #[test]
    fn bad_dimension_rejected() {
        let err = ProviderConfig::from_lookup(vars(&[
            ("LLM_PROVIDER", "openai"),
            ("LLM_MODEL", "gpt-4o"),
            ("VECTOR_DIMENSION", "0"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ProviderError::InvalidConfig { ref key, .. } if key == "VECTOR_DIMENSION"));
    }

    #[test]
    #[serial]
    fn from_env_reads_process_environment() {
        for var in ["LLM_PROVIDER", "LLM_MODEL", "OPENAI_API_KEY", "OPENAI_BASE_URL"] {
            std::env::remove_var(var);
        }
        std::env::set_var("LLM_PROVIDER", "openai");
        std::env::set_var("LLM_MODEL", "gpt-4o");

        let cfg = ProviderConfig::from_env().unwrap();
        assert_eq!(cfg.provider, LlmProvider::OpenAi);
        assert_eq!(cfg.model, "gpt-4o");
        assert!(matches!(
            cfg.require_api_key(),
            Err(ProviderError::MissingConfig { ref key }) if key == "OPENAI_API_KEY"
        ));

        std::env::remove_var("LLM_PROVIDER");
        std::env::remove_var("LLM_MODEL");
    }
}
