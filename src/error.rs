use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Pipeline stage an item was in when something happened to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Download,
    Process,
    Save,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Download => "download",
            Stage::Process => "process",
            Stage::Save => "save",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error("Fetch failed for image {index:?} ({url}): {reason}")]
    Fetch {
        index: Option<usize>,
        url: String,
        reason: String,
    },

    #[error("Analysis failed for image {index:?}: {reason}")]
    Analysis { index: Option<usize>, reason: String },

    #[error("Persist failed for {}: {reason}", path.display())]
    Persist { path: PathBuf, reason: String },

    #[error("Initialization error: {0}")]
    Initialization(String),

    #[error("Setup error: {0}")]
    Setup(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Listing error: {0}")]
    Listing(String),
}

impl PipelineError {
    pub fn fetch(url: impl Into<String>, reason: impl Into<String>) -> Self {
        PipelineError::Fetch {
            index: None,
            url: url.into(),
            reason: reason.into(),
        }
    }

    pub fn analysis(reason: impl Into<String>) -> Self {
        PipelineError::Analysis {
            index: None,
            reason: reason.into(),
        }
    }

    pub fn persist(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        PipelineError::Persist {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Attach the item index to a per-item error. Other variants pass through.
    pub fn for_item(self, item: usize) -> Self {
        match self {
            PipelineError::Fetch { url, reason, .. } => PipelineError::Fetch {
                index: Some(item),
                url,
                reason,
            },
            PipelineError::Analysis { reason, .. } => PipelineError::Analysis {
                index: Some(item),
                reason,
            },
            other => other,
        }
    }

    /// Stage whose per-item outcome this error represents, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineError::Fetch { .. } => Some(Stage::Download),
            PipelineError::Analysis { .. } => Some(Stage::Process),
            PipelineError::Persist { .. } => Some(Stage::Save),
            _ => None,
        }
    }

    /// Only a failure to build the pipeline's own infrastructure aborts a run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PipelineError::Setup(_))
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            PipelineError::Fetch { .. } => ErrorSeverity::Low,
            PipelineError::Analysis { .. } | PipelineError::Persist { .. } => {
                ErrorSeverity::Medium
            }
            PipelineError::Initialization(_) | PipelineError::Configuration(_) => {
                ErrorSeverity::High
            }
            PipelineError::Setup(_) => ErrorSeverity::Critical,
            PipelineError::Listing(_) => ErrorSeverity::Medium,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl From<rayon::ThreadPoolBuildError> for PipelineError {
    fn from(err: rayon::ThreadPoolBuildError) -> Self {
        PipelineError::Setup(format!("failed to build analysis pool: {err}"))
    }
}
