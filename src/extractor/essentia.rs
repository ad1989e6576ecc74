//! Essentia streaming music extractor, run as a child process.

use super::descriptors::map_descriptors;
use super::highlevel::HighLevelClassifier;
use super::{resolve_binary, ExtractionError, ExtractorConfig, ExtractorFactory, FeatureExtractor};
use crate::analysis_store::AnalysisRecord;
use crate::features::FeatureValue;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, info, warn};

/// Longest stderr excerpt carried in an error message.
const STDERR_EXCERPT_CHARS: usize = 500;

/// Builds [`EssentiaExtractor`]s.
#[derive(Debug, Clone)]
pub struct EssentiaExtractorFactory {
    extractor_binary: PathBuf,
}

impl EssentiaExtractorFactory {
    pub fn new(extractor_binary: impl Into<PathBuf>) -> Self {
        Self {
            extractor_binary: extractor_binary.into(),
        }
    }

    pub fn from_config(config: &ExtractorConfig) -> Self {
        Self::new(config.extractor_binary.clone())
    }
}

impl ExtractorFactory for EssentiaExtractorFactory {
    fn check_available(&self) -> Result<(), ExtractionError> {
        resolve_binary(&self.extractor_binary)
            .map(|_| ())
            .ok_or_else(|| {
                ExtractionError::EngineUnavailable(format!(
                    "{} not found on PATH",
                    self.extractor_binary.display()
                ))
            })
    }

    fn build(&self, config: &ExtractorConfig) -> Result<Box<dyn FeatureExtractor>, ExtractionError> {
        Ok(Box::new(EssentiaExtractor::new(config)?))
    }
}

pub struct EssentiaExtractor {
    binary: PathBuf,
    profile: Option<PathBuf>,
    highlevel: Option<HighLevelClassifier>,
    enable_embeddings: bool,
}

impl EssentiaExtractor {
    pub fn new(config: &ExtractorConfig) -> Result<Self, ExtractionError> {
        let binary = resolve_binary(&config.extractor_binary).ok_or_else(|| {
            ExtractionError::EngineUnavailable(format!(
                "{} not found on PATH",
                config.extractor_binary.display()
            ))
        })?;

        let highlevel = match (&config.model_dir, &config.highlevel_binary) {
            (Some(model_dir), Some(highlevel_binary)) => {
                match HighLevelClassifier::new(highlevel_binary, model_dir) {
                    Ok(classifier) => Some(classifier),
                    Err(e) => {
                        warn!("High-level classifier disabled: {:#}", e);
                        None
                    }
                }
            }
            _ => None,
        };

        info!(
            "Essentia extractor initialized: {} (high-level models: {}, embeddings: {})",
            binary.display(),
            highlevel.as_ref().map_or(0, |c| c.model_count()),
            config.enable_embeddings
        );

        Ok(Self {
            binary,
            profile: config.profile.clone(),
            highlevel,
            enable_embeddings: config.enable_embeddings,
        })
    }

    fn run_extractor(&self, path: &Path, output: &Path) -> Result<(), ExtractionError> {
        let mut command = Command::new(&self.binary);
        command.arg(path).arg(output);
        if let Some(profile) = &self.profile {
            command.arg(profile);
        }
        let result = command
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()?;

        if !result.status.success() {
            return Err(ExtractionError::Failed(format!(
                "{} exited with {}: {}",
                self.binary.display(),
                result.status,
                stderr_excerpt(&result.stderr)
            )));
        }
        Ok(())
    }
}

impl FeatureExtractor for EssentiaExtractor {
    fn analyze(
        &mut self,
        item_id: &str,
        path: &Path,
        version: &str,
    ) -> Result<AnalysisRecord, ExtractionError> {
        if !path.exists() {
            return Err(ExtractionError::FileNotFound(path.to_path_buf()));
        }

        let output = tempfile::Builder::new()
            .prefix("lowlevel-")
            .suffix(".json")
            .tempfile()?;
        debug!("Running extractor for {} on {}", item_id, path.display());
        self.run_extractor(path, output.path())?;

        let raw = std::fs::read(output.path())?;
        let json: serde_json::Value = serde_json::from_slice(&raw)
            .map_err(|e| ExtractionError::InvalidOutput(format!("JSON parse error: {}", e)))?;
        let mut tree = FeatureValue::from(json);
        if tree.as_map().is_none() {
            return Err(ExtractionError::InvalidOutput(
                "top level is not an object".to_string(),
            ));
        }

        if let Some(classifier) = &self.highlevel {
            merge_highlevel(&mut tree, classifier.classify(output.path()));
        }

        Ok(map_descriptors(item_id, version, &tree, self.enable_embeddings))
    }
}

/// Adds classifier results under `highlevel`, replacing same-named entries.
fn merge_highlevel(tree: &mut FeatureValue, classified: BTreeMap<String, FeatureValue>) {
    if classified.is_empty() {
        return;
    }
    let FeatureValue::Map(root) = tree else {
        return;
    };
    let section = root
        .entry("highlevel".to_string())
        .or_insert_with(FeatureValue::empty_map);
    if !matches!(section, FeatureValue::Map(_)) {
        *section = FeatureValue::empty_map();
    }
    if let FeatureValue::Map(section) = section {
        section.extend(classified);
    }
}

fn stderr_excerpt(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    let skip = text.chars().count().saturating_sub(STDERR_EXCERPT_CHARS);
    text.chars().skip(skip).collect()
}
