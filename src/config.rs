//! Configuration management with serde serialization/deserialization
//!
//! This module holds the settings for a pipeline run: worker pool sizes,
//! timeouts, queue bounds, output layout and the listing API endpoint.

use crate::PipelineError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure for the pipeline
///
/// # Examples
///
/// ```rust
/// use image_pipeline::Config;
///
/// let config = Config {
///     download_workers: 8,
///     save_workers: 2,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Number of concurrent download workers (default: 5)
    pub download_workers: usize,

    /// Number of process workers and analysis threads (default: CPU core count)
    pub process_workers: usize,

    /// Number of concurrent save workers (default: 3)
    pub save_workers: usize,

    /// Root directory for saved artifacts (default: `cat_images_async`)
    pub output_dir: PathBuf,

    /// Encoding used for every saved artifact (default: JPEG)
    pub output_format: OutputFormat,

    /// Which analysis both analyzers run on each image (default: edges)
    pub analysis: AnalysisKind,

    /// Per-request download timeout (default: 10 seconds)
    ///
    /// A request exceeding it fails that single item, never the run.
    pub fetch_timeout: Duration,

    /// Bounded wait of download and process workers on an empty queue (default: 1 second)
    pub dequeue_timeout: Duration,

    /// Bounded wait of save workers on an empty queue (default: 10 seconds)
    pub save_dequeue_timeout: Duration,

    /// Capacity of the process and save queues; `None` leaves them unbounded
    ///
    /// The download queue is always unbounded since it is seeded with the
    /// whole batch before any worker runs.
    pub queue_capacity: Option<usize>,

    /// Custom User-Agent for image downloads
    pub user_agent: Option<String>,

    /// Listing API settings
    pub api: ApiSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            download_workers: 5,
            process_workers: num_cpus::get(),
            save_workers: 3,
            output_dir: PathBuf::from("cat_images_async"),
            output_format: OutputFormat::Jpeg,
            analysis: AnalysisKind::Edges,
            fetch_timeout: Duration::from_secs(10),
            dequeue_timeout: Duration::from_secs(1),
            save_dequeue_timeout: Duration::from_secs(10),
            queue_capacity: None,
            user_agent: None,
            api: ApiSettings::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.download_workers == 0 || self.process_workers == 0 || self.save_workers == 0 {
            return Err(PipelineError::Configuration(
                "Worker counts must be greater than 0".to_string(),
            ));
        }

        if self.fetch_timeout.is_zero() {
            return Err(PipelineError::Configuration(
                "Fetch timeout must be greater than 0".to_string(),
            ));
        }

        if self.dequeue_timeout.is_zero() || self.save_dequeue_timeout.is_zero() {
            return Err(PipelineError::Configuration(
                "Dequeue timeouts must be greater than 0".to_string(),
            ));
        }

        if self.queue_capacity == Some(0) {
            return Err(PipelineError::Configuration(
                "Queue capacity must be greater than 0".to_string(),
            ));
        }

        if self.output_dir.as_os_str().is_empty() {
            return Err(PipelineError::Configuration(
                "Output directory must not be empty".to_string(),
            ));
        }

        if self.api.max_listing_limit == 0 {
            return Err(PipelineError::Configuration(
                "Listing limit must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Settings for the image listing API
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ApiSettings {
    /// Search endpoint returning a JSON array of images
    pub base_url: String,

    /// `.env` file consulted for `API_KEY` before the process environment
    pub env_file: PathBuf,

    /// Hard cap on images requested per run (default: 100)
    pub max_listing_limit: usize,

    /// Timeout of the listing request (default: 30 seconds)
    pub request_timeout: Duration,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.thecatapi.com/v1/images/search".to_string(),
            env_file: PathBuf::from(".env"),
            max_listing_limit: 100,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Supported encodings for saved artifacts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum OutputFormat {
    /// PNG format - lossless, larger files
    Png,
    /// JPEG format - lossy, smaller files
    Jpeg,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Png => "png",
            OutputFormat::Jpeg => "jpg",
        }
    }

    pub fn image_format(&self) -> image::ImageFormat {
        match self {
            OutputFormat::Png => image::ImageFormat::Png,
            OutputFormat::Jpeg => image::ImageFormat::Jpeg,
        }
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "png" => Ok(OutputFormat::Png),
            "jpg" | "jpeg" => Ok(OutputFormat::Jpeg),
            other => Err(PipelineError::Configuration(format!(
                "unsupported output format: {other}"
            ))),
        }
    }
}

/// Analysis applied by both analyzers in the process stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum AnalysisKind {
    Edges,
    Corners,
    /// Not implemented by the bundled analyzers; every item fails in the process stage
    Circles,
}

impl AnalysisKind {
    /// Short tag used in artifact file names
    pub fn tag(&self) -> &'static str {
        match self {
            AnalysisKind::Edges => "edges",
            AnalysisKind::Corners => "corners",
            AnalysisKind::Circles => "circles",
        }
    }
}

impl std::str::FromStr for AnalysisKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "edges" => Ok(AnalysisKind::Edges),
            "corners" => Ok(AnalysisKind::Corners),
            "circles" => Ok(AnalysisKind::Circles),
            other => Err(PipelineError::Configuration(format!(
                "unknown analysis kind: {other}"
            ))),
        }
    }
}
