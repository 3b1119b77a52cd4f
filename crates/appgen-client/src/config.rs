use std::time::Duration;

use crate::errors::ApiError;

/// Configuration for the backend API client.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Base URL of the backend (for example `https://api.example.com`).
    pub base_url: String,
    /// Default HTTP timeout for plain REST requests.
    ///
    /// Streaming requests are exempt; their lifetime is bounded by their
    /// own session rules.
    pub timeout: Duration,
}

impl ClientConfig {
    /// Creates a config with the default REST timeout.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Builds a config from `APPGEN_API_BASE_URL`.
    pub fn from_env() -> Result<Self, ApiError> {
        let base_url = std::env::var("APPGEN_API_BASE_URL").unwrap_or_default();
        if base_url.trim().is_empty() {
            return Err(ApiError::request(
                "missing APPGEN_API_BASE_URL for the backend client",
            ));
        }
        Ok(Self::new(base_url))
    }

    /// Overrides the REST timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub(crate) fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_joins_without_double_slash() {
        let config = ClientConfig::new("https://api.example.com/");
        assert_eq!(
            config.endpoint("/v1/g3/jobs"),
            "https://api.example.com/v1/g3/jobs"
        );
    }
}
