//! High-level classifier pass (genre, mood, instrument SVM models).
//!
//! Runs on the low-level output of the main extractor. Any failure here
//! degrades to an empty result; the record is still saved with its low-level
//! descriptors.

use super::resolve_binary;
use crate::features::FeatureValue;
use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const MODEL_EXTENSION: &str = "history";

#[derive(Debug, Serialize)]
struct SvmProfile {
    highlevel: SvmSection,
}

#[derive(Debug, Serialize)]
struct SvmSection {
    compute: u8,
    svm_models: Vec<String>,
}

pub struct HighLevelClassifier {
    binary: PathBuf,
    // Kept open so the profile outlives every invocation
    profile: NamedTempFile,
    model_count: usize,
}

impl HighLevelClassifier {
    /// Collects the models under `model_dir` and writes the classifier
    /// profile.
    pub fn new(binary: &Path, model_dir: &Path) -> Result<Self> {
        let binary = resolve_binary(binary)
            .ok_or_else(|| anyhow!("{} not found on PATH", binary.display()))?;

        let models = collect_models(model_dir);
        if models.is_empty() {
            bail!(
                "no .{} models found in {}",
                MODEL_EXTENSION,
                model_dir.display()
            );
        }

        let profile = write_profile(&models).context("Failed to write classifier profile")?;
        info!(
            "High-level classifier ready with {} models from {}",
            models.len(),
            model_dir.display()
        );
        Ok(Self {
            binary,
            profile,
            model_count: models.len(),
        })
    }

    pub fn model_count(&self) -> usize {
        self.model_count
    }

    /// Classifies the low-level descriptors in `lowlevel_json` and returns the
    /// `highlevel` section of the result, or an empty map on failure.
    pub fn classify(&self, lowlevel_json: &Path) -> BTreeMap<String, FeatureValue> {
        match self.run(lowlevel_json) {
            Ok(classified) => classified,
            Err(e) => {
                warn!(
                    "High-level classification failed for {}: {:#}",
                    lowlevel_json.display(),
                    e
                );
                BTreeMap::new()
            }
        }
    }

    fn run(&self, lowlevel_json: &Path) -> Result<BTreeMap<String, FeatureValue>> {
        let output_file = tempfile::Builder::new()
            .prefix("highlevel-")
            .suffix(".json")
            .tempfile()
            .context("Failed to create classifier output file")?;

        let output = Command::new(&self.binary)
            .arg(lowlevel_json)
            .arg(output_file.path())
            .arg(self.profile.path())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("Failed to run {}", self.binary.display()))?;

        if !output.status.success() {
            bail!(
                "exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let raw = std::fs::read(output_file.path()).context("Failed to read classifier output")?;
        let json: serde_json::Value =
            serde_json::from_slice(&raw).context("Classifier output is not valid JSON")?;
        let highlevel = match FeatureValue::from(json).get("highlevel") {
            Some(FeatureValue::Map(map)) => map.clone(),
            _ => BTreeMap::new(),
        };
        debug!("High-level pass produced {} classifiers", highlevel.len());
        Ok(highlevel)
    }
}

fn collect_models(model_dir: &Path) -> Vec<String> {
    let mut models: Vec<String> = WalkDir::new(model_dir)
        .follow_links(true)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry.path().extension().and_then(|ext| ext.to_str()) == Some(MODEL_EXTENSION)
        })
        .map(|entry| entry.path().to_string_lossy().into_owned())
        .collect();
    models.sort();
    models
}

fn write_profile(models: &[String]) -> Result<NamedTempFile> {
    let profile = SvmProfile {
        highlevel: SvmSection {
            compute: 1,
            svm_models: models.to_vec(),
        },
    };
    let yaml = serde_yaml::to_string(&profile)?;

    let mut file = tempfile::Builder::new()
        .prefix("svm-profile-")
        .suffix(".yaml")
        .tempfile()?;
    file.write_all(yaml.as_bytes())?;
    file.flush()?;
    Ok(file)
}
