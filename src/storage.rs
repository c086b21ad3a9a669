//! Persistence of analysis artifacts.

use crate::{sanitize_label, AnalysisKind, OutputFormat, PipelineError};
use async_trait::async_trait;
use image::DynamicImage;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Writes encoded images to durable storage.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImageStore: Send + Sync {
    async fn ensure_directory(&self, path: &Path) -> Result<(), PipelineError>;

    async fn write_image(&self, path: &Path, image: &DynamicImage) -> Result<(), PipelineError>;
}

/// The three files written for every image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Original,
    Library,
    Custom,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 3] = [ArtifactKind::Original, ArtifactKind::Library, ArtifactKind::Custom];

    fn suffix(&self, analysis: AnalysisKind) -> String {
        match self {
            ArtifactKind::Original => "original".to_string(),
            ArtifactKind::Library => format!("lib_{}", analysis.tag()),
            ArtifactKind::Custom => format!("custom_{}", analysis.tag()),
        }
    }
}

/// Output naming: `<root>/<label>/<index>_<label>_<suffix>.<ext>`.
#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    pub root: PathBuf,
    pub format: OutputFormat,
    pub analysis: AnalysisKind,
}

impl ArtifactLayout {
    pub fn directory(&self, label: &str) -> PathBuf {
        self.root.join(sanitize_label(label))
    }

    pub fn path(&self, index: usize, label: &str, kind: ArtifactKind) -> PathBuf {
        let label = sanitize_label(label);
        self.root.join(&label).join(format!(
            "{index}_{label}_{}.{}",
            kind.suffix(self.analysis),
            self.format.extension()
        ))
    }
}

/// Local filesystem store.
#[derive(Debug, Clone)]
pub struct FsImageStore {
    format: OutputFormat,
}

impl FsImageStore {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Encode to the configured format. JPEG has no alpha or 16-bit support,
    /// so it always gets 8-bit RGB.
    pub fn encode(&self, image: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
        let mut buffer = Cursor::new(Vec::new());
        match self.format {
            OutputFormat::Jpeg => {
                DynamicImage::ImageRgb8(image.to_rgb8()).write_to(&mut buffer, self.format.image_format())?
            }
            OutputFormat::Png => image.write_to(&mut buffer, self.format.image_format())?,
        }
        Ok(buffer.into_inner())
    }
}

#[async_trait]
impl ImageStore for FsImageStore {
    async fn ensure_directory(&self, path: &Path) -> Result<(), PipelineError> {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| PipelineError::persist(path, e.to_string()))
    }

    async fn write_image(&self, path: &Path, image: &DynamicImage) -> Result<(), PipelineError> {
        let bytes = self
            .encode(image)
            .map_err(|e| PipelineError::persist(path, format!("encode: {e}")))?;

        tokio::fs::write(path, &bytes)
            .await
            .map_err(|e| PipelineError::persist(path, e.to_string()))?;

        debug!("Wrote {} bytes to {}", bytes.len(), path.display());
        Ok(())
    }
}
