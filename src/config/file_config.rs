use crate::analysis_store::SelectionOrder;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    pub db_path: Option<String>,

    pub analysis: Option<AnalysisFileConfig>,
    pub extractor: Option<ExtractorFileConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct AnalysisFileConfig {
    pub version: Option<String>,
    pub batch_size: Option<usize>,
    pub max_workers: Option<usize>,
    pub force_reanalyze: Option<bool>,
    /// "recently-updated" or "first-seen"
    pub selection_order: Option<SelectionOrder>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct ExtractorFileConfig {
    pub model_dir: Option<String>,
    pub enable_embeddings: Option<bool>,
    pub binary: Option<String>,
    pub highlevel_binary: Option<String>,
    pub profile: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
