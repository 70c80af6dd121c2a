use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Missing required configuration: {key}")]
    MissingConfig { key: String },

    #[error("Invalid configuration value for {key}: {reason}")]
    InvalidConfig { key: String, reason: String },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("{provider} API error ({status}): {message}")]
    Api {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("Failed to parse {provider} response: {reason}")]
    Parse { provider: String, reason: String },
}

impl ProviderError {
    pub(crate) fn parse(provider: impl std::fmt::Display, reason: impl Into<String>) -> Self {
        ProviderError::Parse {
            provider: provider.to_string(),
            reason: reason.into(),
        }
    }
}
