use crate::{validate_url, Config, PipelineError};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// Retrieves the raw bytes behind a source URL.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, PipelineError>;
}

/// `reqwest` based fetcher shared by every download worker.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(config: &Config) -> Result<Self, PipelineError> {
        let mut builder = reqwest::Client::builder().timeout(config.fetch_timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder
            .build()
            .map_err(|e| PipelineError::Setup(format!("HTTP client: {e}")))?;

        Ok(Self {
            client,
            timeout: config.fetch_timeout,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl ImageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, PipelineError> {
        let parsed = validate_url(url)
            .map_err(|e| PipelineError::fetch(url, format!("invalid URL: {e}")))?;

        let response = self
            .client
            .get(parsed)
            .send()
            .await
            .map_err(|e| describe_transport_error(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::fetch(url, format!("HTTP {}", status.as_u16())));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| describe_transport_error(url, e))?;

        debug!("Fetched {} bytes from {}", body.len(), url);
        Ok(body.to_vec())
    }
}

fn describe_transport_error(url: &str, err: reqwest::Error) -> PipelineError {
    let reason = if err.is_timeout() {
        "request timed out".to_string()
    } else if err.is_connect() {
        format!("connection failed: {err}")
    } else {
        err.to_string()
    };
    PipelineError::fetch(url, reason)
}
