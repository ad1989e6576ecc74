use super::constants::TEST_VERSION;
use super::engine::FakeExtractorFactory;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use track_analyzer::analysis_store::SelectionOrder;
use track_analyzer::extractor::ExtractorConfig;
use track_analyzer::{
    AnalysisOrchestrator, AnalysisStore, OrchestratorSettings, SqliteAnalysisStore,
};

/// A temp directory holding an analysis database and a folder of scripted
/// audio files.
pub struct TestLibrary {
    _dir: TempDir,
    pub audio_dir: PathBuf,
    pub store: Arc<SqliteAnalysisStore>,
    clock: AtomicI64,
}

impl TestLibrary {
    pub fn new() -> Self {
        Self::with_order(SelectionOrder::RecentlyUpdated)
    }

    pub fn with_order(order: SelectionOrder) -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let audio_dir = dir.path().join("audio");
        std::fs::create_dir(&audio_dir).expect("Failed to create audio dir");
        let store = SqliteAnalysisStore::new(dir.path().join("analysis.db"))
            .expect("Failed to open analysis store")
            .with_selection_order(order);
        Self {
            _dir: dir,
            audio_dir,
            store: Arc::new(store),
            clock: AtomicI64::new(1_700_000_000),
        }
    }

    pub fn path_for(&self, item_id: &str) -> PathBuf {
        self.audio_dir.join(format!("{}.flac", item_id))
    }

    /// Writes the script for `item_id` and registers it. Later calls get a
    /// later `updated_at`.
    pub fn add_track(&self, item_id: &str, script: &str) {
        self.write_script(item_id, script);
        self.register(item_id);
    }

    /// Registers `item_id` without creating its file.
    pub fn add_missing_track(&self, item_id: &str) {
        self.register(item_id);
    }

    pub fn write_script(&self, item_id: &str, script: &str) {
        std::fs::write(self.path_for(item_id), script).expect("Failed to write audio script");
    }

    pub fn remove_file(&self, item_id: &str) {
        std::fs::remove_file(self.path_for(item_id)).expect("Failed to remove audio script");
    }

    fn register(&self, item_id: &str) {
        let updated_at = self.clock.fetch_add(1, Ordering::SeqCst);
        self.store
            .upsert_catalog_item(
                item_id,
                &self.path_for(item_id).to_string_lossy(),
                updated_at,
            )
            .expect("Failed to register catalog item");
    }

    pub fn settings(max_workers: usize) -> OrchestratorSettings {
        OrchestratorSettings {
            analysis_version: TEST_VERSION.to_string(),
            batch_size: 50,
            max_workers,
            force_reanalyze: false,
            extractor: ExtractorConfig::default(),
        }
    }

    pub fn orchestrator(
        &self,
        factory: Arc<FakeExtractorFactory>,
        max_workers: usize,
    ) -> AnalysisOrchestrator {
        self.orchestrator_with(factory, Self::settings(max_workers))
    }

    /// Host concurrency is pinned so the configured cap decides the unit count.
    pub fn orchestrator_with(
        &self,
        factory: Arc<FakeExtractorFactory>,
        settings: OrchestratorSettings,
    ) -> AnalysisOrchestrator {
        AnalysisOrchestrator::new(self.store.clone(), factory, settings)
            .expect("Failed to create orchestrator")
            .with_available_parallelism(8)
    }
}
