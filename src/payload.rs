//! Work items handed from one stage to the next.
//!
//! Every payload is moved into its queue on `put` and out of it on `get`,
//! so no two stages ever observe the same image at the same time.

use image::DynamicImage;
use serde::{Deserialize, Serialize};

/// Label used for the output directory when an image carries none.
pub const UNLABELED: &str = "Unknown";

/// Remote location of one image plus an optional category label (e.g. a breed name).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub url: String,
    pub label: Option<String>,
}

impl SourceRef {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            label: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn label_or_default(&self) -> &str {
        self.label.as_deref().unwrap_or(UNLABELED)
    }
}

impl From<String> for SourceRef {
    fn from(url: String) -> Self {
        SourceRef::new(url)
    }
}

impl From<&str> for SourceRef {
    fn from(url: &str) -> Self {
        SourceRef::new(url)
    }
}

/// One unit of work, created by `PipelineManager::initialize`.
///
/// `index` is the zero-based input position and names every output file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageTask {
    pub index: usize,
    pub source: SourceRef,
}

/// A downloaded and decoded image waiting for analysis.
#[derive(Debug)]
pub struct DecodedPayload {
    pub index: usize,
    pub source: SourceRef,
    pub image: DynamicImage,
}

/// The original image together with both analysis results.
#[derive(Debug)]
pub struct ProcessedPayload {
    pub index: usize,
    pub source: SourceRef,
    pub original: DynamicImage,
    pub lib_artifact: DynamicImage,
    pub custom_artifact: DynamicImage,
}
