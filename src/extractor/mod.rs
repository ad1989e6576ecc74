//! Feature extraction engines.
//!
//! The orchestrator only sees [`ExtractorFactory`] and [`FeatureExtractor`].
//! Each execution unit asks the factory for one engine on its first item and
//! keeps it for the rest of its lifetime.

mod descriptors;
mod essentia;
mod highlevel;

use crate::analysis_store::AnalysisRecord;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub use descriptors::{build_summary, map_descriptors};
pub use essentia::{EssentiaExtractor, EssentiaExtractorFactory};

pub const DEFAULT_EXTRACTOR_BINARY: &str = "essentia_streaming_extractor_music";
pub const DEFAULT_HIGHLEVEL_BINARY: &str = "essentia_streaming_extractor_music_svm";

/// Errors that can occur while analyzing a single item.
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("Extraction engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("Extraction failed: {0}")]
    Failed(String),

    #[error("Invalid extractor output: {0}")]
    InvalidOutput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Extraction crashed: {0}")]
    Crashed(String),
}

impl ExtractionError {
    /// Missing sources are a stale catalog reference, not a retryable failure.
    pub fn is_missing_file(&self) -> bool {
        matches!(self, ExtractionError::FileNotFound(_))
    }
}

/// Settings handed from the orchestrator to every engine it builds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractorConfig {
    /// Directory with classifier models; enables the high-level pass.
    pub model_dir: Option<PathBuf>,
    pub enable_embeddings: bool,
    pub extractor_binary: PathBuf,
    pub highlevel_binary: Option<PathBuf>,
    /// Extractor profile passed through verbatim.
    pub profile: Option<PathBuf>,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            model_dir: None,
            enable_embeddings: true,
            extractor_binary: PathBuf::from(DEFAULT_EXTRACTOR_BINARY),
            highlevel_binary: Some(PathBuf::from(DEFAULT_HIGHLEVEL_BINARY)),
            profile: None,
        }
    }
}

/// A constructed engine, owned by exactly one execution unit.
pub trait FeatureExtractor {
    fn analyze(
        &mut self,
        item_id: &str,
        path: &Path,
        version: &str,
    ) -> Result<AnalysisRecord, ExtractionError>;
}

/// Builds engines. Shared by every execution unit of a run.
pub trait ExtractorFactory: Send + Sync {
    /// Verifies the engine's external dependencies are present. Called once
    /// when the orchestrator is constructed.
    fn check_available(&self) -> Result<(), ExtractionError>;

    fn build(&self, config: &ExtractorConfig) -> Result<Box<dyn FeatureExtractor>, ExtractionError>;
}

/// Resolves a binary name against `PATH`. Paths with a directory component
/// are checked as given.
pub fn resolve_binary(binary: &Path) -> Option<PathBuf> {
    if binary.components().count() > 1 {
        return binary.is_file().then(|| binary.to_path_buf());
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
}
