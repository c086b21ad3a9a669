//! Client for the cat image listing API.
//!
//! Produces the `SourceRef` batch a `run` feeds into the pipeline. Each entry
//! is labelled with its first breed so saved artifacts land in per-breed
//! directories.

use crate::{ApiSettings, PipelineError, SourceRef};
use serde::Deserialize;
use std::path::Path;
use tracing::{debug, info, warn};

/// Environment variable holding the listing API key.
pub const API_KEY_VAR: &str = "API_KEY";

#[derive(Debug, Clone, Deserialize)]
pub struct CatImageDto {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub breeds: Vec<Breed>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Breed {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub temperament: Option<String>,
    #[serde(default)]
    pub origin: Option<String>,
}

impl From<CatImageDto> for SourceRef {
    fn from(dto: CatImageDto) -> Self {
        let source = SourceRef::new(dto.url);
        match dto.breeds.into_iter().next() {
            Some(breed) => source.with_label(breed.name),
            None => source,
        }
    }
}

/// Read `API_KEY`, loading `env_file` into the process environment first if it exists.
pub fn load_api_key(env_file: &Path) -> Result<String, PipelineError> {
    match dotenvy::from_path(env_file) {
        Ok(()) => debug!("Loaded environment from {}", env_file.display()),
        Err(e) if e.not_found() => debug!("No env file at {}", env_file.display()),
        Err(e) => warn!("Ignoring unreadable env file {}: {}", env_file.display(), e),
    }

    std::env::var(API_KEY_VAR)
        .ok()
        .filter(|key| !key.trim().is_empty())
        .ok_or_else(|| PipelineError::Configuration(format!("{API_KEY_VAR} is not set")))
}

/// Decode a listing response, skipping entries that do not describe an image.
pub fn parse_listing(body: &str) -> Result<Vec<SourceRef>, PipelineError> {
    let entries: Vec<serde_json::Value> = serde_json::from_str(body)
        .map_err(|e| PipelineError::Listing(format!("response is not a JSON array: {e}")))?;

    let total = entries.len();
    let sources: Vec<SourceRef> = entries
        .into_iter()
        .filter_map(|entry| match serde_json::from_value::<CatImageDto>(entry) {
            Ok(dto) => Some(dto.into()),
            Err(e) => {
                warn!("Skipping malformed listing entry: {}", e);
                None
            }
        })
        .collect();

    if sources.len() < total {
        info!("Kept {} of {} listing entries", sources.len(), total);
    }
    Ok(sources)
}

pub struct CatApiClient {
    client: reqwest::Client,
    settings: ApiSettings,
    api_key: String,
}

impl CatApiClient {
    /// Build a client whose key comes from the environment (see [`load_api_key`]).
    pub fn new(settings: &ApiSettings) -> Result<Self, PipelineError> {
        let api_key = load_api_key(&settings.env_file)?;
        Self::with_api_key(settings, api_key)
    }

    pub fn with_api_key(
        settings: &ApiSettings,
        api_key: impl Into<String>,
    ) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| PipelineError::Setup(format!("HTTP client: {e}")))?;

        Ok(Self {
            client,
            settings: settings.clone(),
            api_key: api_key.into(),
        })
    }

    /// Clamp a requested batch size to what the API serves in one call.
    pub fn effective_limit(&self, limit: usize) -> Result<usize, PipelineError> {
        if limit == 0 {
            return Err(PipelineError::Configuration(
                "Listing limit must be greater than 0".to_string(),
            ));
        }

        let max = self.settings.max_listing_limit;
        if limit > max {
            warn!("Requested {} images, capping at {}", limit, max);
            return Ok(max);
        }
        Ok(limit)
    }

    pub async fn fetch_listing(&self, limit: usize) -> Result<Vec<SourceRef>, PipelineError> {
        let limit = self.effective_limit(limit)?;
        info!("Requesting {} images from {}", limit, self.settings.base_url);

        let response = self
            .client
            .get(&self.settings.base_url)
            .query(&[
                ("limit", limit.to_string()),
                ("has_breeds", "1".to_string()),
                ("api_key", self.api_key.clone()),
            ])
            .send()
            .await
            .map_err(|e| PipelineError::Listing(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::Listing(format!(
                "listing request returned HTTP {}",
                status.as_u16()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| PipelineError::Listing(e.to_string()))?;

        parse_listing(&body)
    }
}

impl std::fmt::Debug for CatApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatApiClient")
            .field("base_url", &self.settings.base_url)
            .finish_non_exhaustive()
    }
}
