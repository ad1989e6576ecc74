//! Scripted extraction engine.
//!
//! The "audio" files are text. Each line is a directive:
//! - `tempo:<bpm>` sets the tempo
//! - `genre:<label>` adds a genre
//! - `fail:<message>` makes extraction fail with that message
//! - `panic` makes the engine panic
//!
//! Anything else is ignored.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use track_analyzer::extractor::{build_summary, ExtractorConfig};
use track_analyzer::{AnalysisRecord, ExtractionError, ExtractorFactory, FeatureExtractor};

#[derive(Default)]
pub struct FakeExtractorFactory {
    builds: AtomicUsize,
    analyses: Arc<AtomicUsize>,
}

impl FakeExtractorFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of engines constructed so far.
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    /// Number of `analyze` calls that reached an engine.
    pub fn analyses(&self) -> usize {
        self.analyses.load(Ordering::SeqCst)
    }
}

impl ExtractorFactory for FakeExtractorFactory {
    fn check_available(&self) -> Result<(), ExtractionError> {
        Ok(())
    }

    fn build(&self, config: &ExtractorConfig) -> Result<Box<dyn FeatureExtractor>, ExtractionError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeEngine {
            enable_embeddings: config.enable_embeddings,
            analyses: Arc::clone(&self.analyses),
        }))
    }
}

struct FakeEngine {
    enable_embeddings: bool,
    analyses: Arc<AtomicUsize>,
}

impl FeatureExtractor for FakeEngine {
    fn analyze(
        &mut self,
        item_id: &str,
        path: &Path,
        version: &str,
    ) -> Result<AnalysisRecord, ExtractionError> {
        self.analyses.fetch_add(1, Ordering::SeqCst);
        let script = std::fs::read_to_string(path)?;

        let mut record = AnalysisRecord::empty(item_id, version);
        for line in script.lines().map(str::trim) {
            if line == "panic" {
                panic!("fake engine panic for {}", item_id);
            } else if let Some(message) = line.strip_prefix("fail:") {
                return Err(ExtractionError::Failed(message.trim().to_string()));
            } else if let Some(tempo) = line.strip_prefix("tempo:") {
                record.tempo_bpm = tempo.trim().parse().ok();
            } else if let Some(genre) = line.strip_prefix("genre:") {
                record.genres.push(genre.trim().to_string());
            }
        }
        record.keywords = record.genres.iter().map(|g| g.to_lowercase()).collect();
        record.summary = build_summary(&record.genres, &record.moods, record.tempo_bpm);
        if self.enable_embeddings {
            record.embedding = Some(
                [("fake".to_string(), vec![record.tempo_bpm.unwrap_or(0.0)])]
                    .into_iter()
                    .collect(),
            );
        }
        Ok(record)
    }
}
