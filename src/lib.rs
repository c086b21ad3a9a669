//! # Image Pipeline
//!
//! A staged, queue-connected pipeline that downloads remote images, runs two
//! edge/corner analyzers on each one and saves three artifacts per image.
//!
//! Each stage has its own worker pool sized to its bottleneck: async download
//! workers for network I/O, process workers backed by a rayon thread pool for
//! pixel work, and async save workers for disk I/O. Completion is detected with
//! per-queue acknowledgement counters, so a run ends only after every item has
//! been saved or counted as an error at exactly one stage.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use image_pipeline::{Config, PipelineManager};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pipeline = PipelineManager::from_config(Config::default())?;
//!     pipeline
//!         .initialize([
//!             "https://cdn2.thecatapi.com/images/0XYvRd7oD.jpg",
//!             "https://cdn2.thecatapi.com/images/a9m.jpg",
//!         ])
//!         .await?;
//!     pipeline.start_workers(5, 4, 3).await?;
//!
//!     let stats = pipeline.wait_for_completion().await?;
//!     println!("saved {} of {}", stats.saved, stats.total_images);
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ```bash
//! # 20 breed-labelled images from the cat API (needs API_KEY in .env)
//! image-pipeline run --limit 20 --progress-interval 2
//!
//! # URLs from a file, PNG output, corner detection
//! image-pipeline --format png --analysis corners batch --input urls.txt
//! ```

/// Configuration and settings for a pipeline run
pub mod config;

/// Error types and error handling utilities
pub mod error;

/// Work items passed between stages
pub mod payload;

/// Stage queues with acknowledgement-based completion
pub mod queue;

/// Shared run statistics
pub mod stats;

/// Download, process and save workers
pub mod worker;

/// Pipeline orchestration
pub mod pipeline;

/// Thread pool for CPU-bound analysis
pub mod executor;

/// Edge and corner detection
pub mod analysis;

/// Image download
pub mod fetcher;

/// Artifact persistence
pub mod storage;

/// Cat API listing client
pub mod catalog;

/// Command-line interface implementation
pub mod cli;

/// Prometheus metrics
pub mod metrics;

/// Utility functions and helpers
pub mod utils;

#[cfg(test)]
mod tests;

pub use analysis::*;
pub use catalog::*;
pub use cli::*;
pub use config::*;
pub use error::*;
pub use executor::*;
pub use fetcher::*;
pub use metrics::*;
pub use payload::*;
pub use pipeline::*;
pub use queue::*;
pub use stats::*;
pub use storage::*;
pub use utils::*;
pub use worker::*;
