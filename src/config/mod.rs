mod file_config;

pub use file_config::{AnalysisFileConfig, ExtractorFileConfig, FileConfig};

use crate::analysis_store::SelectionOrder;
use crate::extractor::{ExtractorConfig, DEFAULT_EXTRACTOR_BINARY, DEFAULT_HIGHLEVEL_BINARY};
use crate::orchestrator::OrchestratorSettings;
use anyhow::{bail, Result};
use std::path::{Path, PathBuf};

pub const DEFAULT_ANALYSIS_VERSION: &str = "essentia-1";
pub const DEFAULT_BATCH_SIZE: usize = 16;
pub const DEFAULT_MAX_WORKERS: usize = 4;

/// CLI arguments that can be used for config resolution.
/// Every field can be overridden by the TOML config.
#[derive(Debug, Clone)]
pub struct CliConfig {
    pub db_path: Option<PathBuf>,
    pub analysis_version: String,
    pub batch_size: usize,
    pub max_workers: usize,
    pub force_reanalyze: bool,
    pub model_dir: Option<PathBuf>,
    pub enable_embeddings: bool,
    pub extractor_binary: PathBuf,
    pub highlevel_binary: PathBuf,
    pub profile: Option<PathBuf>,
    pub selection_order: SelectionOrder,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            analysis_version: DEFAULT_ANALYSIS_VERSION.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            max_workers: DEFAULT_MAX_WORKERS,
            force_reanalyze: false,
            model_dir: None,
            enable_embeddings: true,
            extractor_binary: PathBuf::from(DEFAULT_EXTRACTOR_BINARY),
            highlevel_binary: PathBuf::from(DEFAULT_HIGHLEVEL_BINARY),
            profile: None,
            selection_order: SelectionOrder::default(),
        }
    }
}

/// Resolved, validated configuration. Immutable for the process lifetime.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub selection_order: SelectionOrder,
    pub analysis_version: String,
    pub batch_size: usize,
    pub max_workers: usize,
    pub force_reanalyze: bool,
    pub extractor: ExtractorConfig,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();
        let analysis = file.analysis.unwrap_or_default();
        let extractor = file.extractor.unwrap_or_default();

        let db_path = file
            .db_path
            .map(PathBuf::from)
            .or_else(|| cli.db_path.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_path must be specified via --db-path or in config file")
            })?;
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if !parent.is_dir() {
                bail!("Database directory does not exist: {:?}", parent);
            }
        }

        let analysis_version = analysis
            .version
            .unwrap_or_else(|| cli.analysis_version.clone());
        if analysis_version.trim().is_empty() {
            bail!("Analysis version must not be empty");
        }

        let batch_size = analysis.batch_size.unwrap_or(cli.batch_size);
        if batch_size == 0 {
            bail!("Batch size must be greater than zero");
        }

        let max_workers = analysis.max_workers.unwrap_or(cli.max_workers);
        if max_workers == 0 {
            bail!("Max workers must be greater than zero");
        }

        let model_dir = extractor
            .model_dir
            .map(PathBuf::from)
            .or_else(|| cli.model_dir.clone());
        if let Some(dir) = &model_dir {
            validate_model_dir(dir)?;
        }

        let extractor = ExtractorConfig {
            model_dir,
            enable_embeddings: extractor.enable_embeddings.unwrap_or(cli.enable_embeddings),
            extractor_binary: extractor
                .binary
                .map(PathBuf::from)
                .unwrap_or_else(|| cli.extractor_binary.clone()),
            highlevel_binary: Some(
                extractor
                    .highlevel_binary
                    .map(PathBuf::from)
                    .unwrap_or_else(|| cli.highlevel_binary.clone()),
            ),
            profile: extractor
                .profile
                .map(PathBuf::from)
                .or_else(|| cli.profile.clone()),
        };

        Ok(Self {
            db_path,
            selection_order: analysis.selection_order.unwrap_or(cli.selection_order),
            analysis_version,
            batch_size,
            max_workers,
            force_reanalyze: analysis.force_reanalyze.unwrap_or(cli.force_reanalyze),
            extractor,
        })
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            analysis_version: self.analysis_version.clone(),
            batch_size: self.batch_size,
            max_workers: self.max_workers,
            force_reanalyze: self.force_reanalyze,
            extractor: self.extractor.clone(),
        }
    }
}

fn validate_model_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        bail!("Model directory does not exist: {:?}", dir);
    }
    if !dir.is_dir() {
        bail!("Model directory is not a directory: {:?}", dir);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cli_with_db(dir: &TempDir) -> CliConfig {
        CliConfig {
            db_path: Some(dir.path().join("analysis.db")),
            ..CliConfig::default()
        }
    }

    #[test]
    fn test_resolve_cli_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = AppConfig::resolve(&cli_with_db(&temp_dir), None).unwrap();

        assert_eq!(config.db_path, temp_dir.path().join("analysis.db"));
        assert_eq!(config.analysis_version, "essentia-1");
        assert_eq!(config.batch_size, 16);
        assert_eq!(config.max_workers, 4);
        assert!(!config.force_reanalyze);
        assert_eq!(config.selection_order, SelectionOrder::RecentlyUpdated);
        assert_eq!(config.extractor, ExtractorConfig::default());
    }

    #[test]
    fn test_file_overrides_cli() {
        let temp_dir = TempDir::new().unwrap();
        let models = temp_dir.path().join("models");
        std::fs::create_dir(&models).unwrap();

        let cli = CliConfig {
            batch_size: 32,
            max_workers: 2,
            ..cli_with_db(&temp_dir)
        };
        let file = FileConfig {
            db_path: None,
            analysis: Some(AnalysisFileConfig {
                version: Some("essentia-2".to_string()),
                max_workers: Some(6),
                force_reanalyze: Some(true),
                selection_order: Some(SelectionOrder::FirstSeen),
                ..AnalysisFileConfig::default()
            }),
            extractor: Some(ExtractorFileConfig {
                model_dir: Some(models.to_string_lossy().into_owned()),
                enable_embeddings: Some(false),
                ..ExtractorFileConfig::default()
            }),
        };

        let config = AppConfig::resolve(&cli, Some(file)).unwrap();
        assert_eq!(config.analysis_version, "essentia-2");
        assert_eq!(config.batch_size, 32);
        assert_eq!(config.max_workers, 6);
        assert!(config.force_reanalyze);
        assert_eq!(config.selection_order, SelectionOrder::FirstSeen);
        assert_eq!(config.extractor.model_dir, Some(models));
        assert!(!config.extractor.enable_embeddings);

        let settings = config.orchestrator_settings();
        assert_eq!(settings.max_workers, 6);
        assert_eq!(settings.analysis_version, "essentia-2");
    }

    #[test]
    fn test_resolve_requires_db_path() {
        let err = AppConfig::resolve(&CliConfig::default(), None).unwrap_err();
        assert!(err.to_string().contains("db_path must be specified"));
    }

    #[test]
    fn test_resolve_rejects_invalid_values() {
        let temp_dir = TempDir::new().unwrap();

        let zero_batch = CliConfig {
            batch_size: 0,
            ..cli_with_db(&temp_dir)
        };
        assert!(AppConfig::resolve(&zero_batch, None).is_err());

        let zero_workers = CliConfig {
            max_workers: 0,
            ..cli_with_db(&temp_dir)
        };
        assert!(AppConfig::resolve(&zero_workers, None).is_err());

        let blank_version = CliConfig {
            analysis_version: "  ".to_string(),
            ..cli_with_db(&temp_dir)
        };
        assert!(AppConfig::resolve(&blank_version, None).is_err());

        let missing_models = CliConfig {
            model_dir: Some(temp_dir.path().join("nope")),
            ..cli_with_db(&temp_dir)
        };
        assert!(AppConfig::resolve(&missing_models, None).is_err());

        let missing_db_dir = CliConfig {
            db_path: Some(temp_dir.path().join("missing/analysis.db")),
            ..CliConfig::default()
        };
        let err = AppConfig::resolve(&missing_db_dir, None).unwrap_err();
        assert!(err.to_string().contains("Database directory does not exist"));
    }
}
