use super::summary::BatchSummary;
use super::worker::{TaskOutcome, WorkerContext, WorkerPool};
use crate::analysis_store::{AnalysisRecord, AnalysisStore, WorkItem};
use crate::config::{DEFAULT_ANALYSIS_VERSION, DEFAULT_BATCH_SIZE, DEFAULT_MAX_WORKERS};
use crate::extractor::{ExtractorConfig, ExtractorFactory};
use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

const MISSING_FILE_MESSAGE: &str = "File not found";
const UNANSWERED_MESSAGE: &str = "worker terminated unexpectedly";

/// Settings fixed for the lifetime of an orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorSettings {
    pub analysis_version: String,
    pub batch_size: usize,
    pub max_workers: usize,
    pub force_reanalyze: bool,
    pub extractor: ExtractorConfig,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            analysis_version: DEFAULT_ANALYSIS_VERSION.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            max_workers: DEFAULT_MAX_WORKERS,
            force_reanalyze: false,
            extractor: ExtractorConfig::default(),
        }
    }
}

/// Turns work sets into [`BatchSummary`]s.
///
/// Extraction runs in execution units; every store write happens on the
/// calling thread.
pub struct AnalysisOrchestrator {
    store: Arc<dyn AnalysisStore>,
    factory: Arc<dyn ExtractorFactory>,
    settings: OrchestratorSettings,
    available_parallelism: usize,
}

impl AnalysisOrchestrator {
    /// Fails if the extraction engine's dependencies are missing.
    pub fn new(
        store: Arc<dyn AnalysisStore>,
        factory: Arc<dyn ExtractorFactory>,
        settings: OrchestratorSettings,
    ) -> Result<Self> {
        factory
            .check_available()
            .context("Extraction engine is not available")?;

        let available_parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Ok(Self {
            store,
            factory,
            settings,
            available_parallelism,
        })
    }

    /// Overrides the detected host concurrency.
    pub fn with_available_parallelism(mut self, available: usize) -> Self {
        self.available_parallelism = available;
        self
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// min(configured cap, host concurrency)
    pub fn effective_parallelism(&self) -> usize {
        self.settings.max_workers.min(self.available_parallelism)
    }

    /// Analyzes up to `limit` (default: batch size) items that have no record
    /// for the configured version.
    pub fn analyze_pending(&self, limit: Option<usize>) -> Result<BatchSummary> {
        let limit = limit.unwrap_or(self.settings.batch_size);
        let items = self.store.select_pending(
            &self.settings.analysis_version,
            limit,
            self.settings.force_reanalyze,
        )?;
        self.execute(items)
    }

    /// Analyzes the given items. Ids without a source path are dropped
    /// before the batch starts and do not appear in the summary.
    pub fn analyze_specific(&self, item_ids: &[String]) -> Result<BatchSummary> {
        let mut seen = HashSet::new();
        let mut items = Vec::with_capacity(item_ids.len());
        for item_id in item_ids {
            if !seen.insert(item_id.as_str()) {
                continue;
            }
            match self.store.get_source_path(item_id)? {
                Some(path) => items.push(WorkItem::new(item_id.clone(), path)),
                None => warn!("No source path for item {}, skipping", item_id),
            }
        }
        self.execute(items)
    }

    /// Re-runs up to `limit` (default: batch size) unresolved failures, oldest
    /// first.
    pub fn retry_failures(&self, limit: Option<usize>) -> Result<BatchSummary> {
        let limit = limit.unwrap_or(self.settings.batch_size);
        let items = self.store.list_unresolved_failures(limit)?;
        self.execute(items)
    }

    fn execute(&self, items: Vec<WorkItem>) -> Result<BatchSummary> {
        let mut summary = BatchSummary::new(items.len());
        if items.is_empty() {
            debug!("Nothing to analyze");
            return Ok(summary);
        }

        let started = Instant::now();
        let units = self.effective_parallelism().min(items.len());
        info!(
            "Analyzing {} items (version {}) with {} execution unit(s)",
            items.len(),
            self.settings.analysis_version,
            units.max(1)
        );

        if units <= 1 {
            self.execute_sequential(items, &mut summary);
        } else {
            self.execute_parallel(items, units, &mut summary)?;
        }

        info!(
            "Batch finished in {:.1}s: {} requested, {} saved, {} failed, {} skipped",
            started.elapsed().as_secs_f64(),
            summary.requested,
            summary.saved,
            summary.failed,
            summary.skipped
        );
        Ok(summary)
    }

    fn execute_sequential(&self, items: Vec<WorkItem>, summary: &mut BatchSummary) {
        let mut context =
            WorkerContext::new(Arc::clone(&self.factory), self.settings.extractor.clone());
        for item in items {
            let result = context.run(&item, &self.settings.analysis_version);
            self.apply_outcome(summary, TaskOutcome { item, result });
        }
    }

    fn execute_parallel(
        &self,
        items: Vec<WorkItem>,
        units: usize,
        summary: &mut BatchSummary,
    ) -> Result<()> {
        let mut pool = WorkerPool::spawn(
            units,
            Arc::clone(&self.factory),
            &self.settings.extractor,
            &self.settings.analysis_version,
        )?;

        let mut outstanding: BTreeMap<String, WorkItem> = BTreeMap::new();
        for item in items {
            outstanding.insert(item.item_id.clone(), item.clone());
            if let Err(item) = pool.submit(item) {
                warn!("Could not queue {}: no execution unit left", item.item_id);
            }
        }
        pool.close();

        while let Some(outcome) = pool.recv() {
            outstanding.remove(&outcome.item.item_id);
            self.apply_outcome(summary, outcome);
        }
        drop(pool);

        for (_, item) in outstanding {
            error!("No outcome received for {}", item.item_id);
            self.fail(summary, &item, UNANSWERED_MESSAGE.to_string());
        }
        Ok(())
    }

    fn apply_outcome(&self, summary: &mut BatchSummary, outcome: TaskOutcome) {
        let TaskOutcome { item, result } = outcome;
        match result {
            Ok(record) => {
                summary.processed += 1;
                self.save(summary, &item, record);
            }
            Err(e) if e.is_missing_file() => {
                warn!("Source file missing for {}: {}", item.item_id, item.source_path);
                summary.record_skip(&item.item_id, MISSING_FILE_MESSAGE);
            }
            Err(e) => {
                warn!("Analysis failed for {}: {}", item.item_id, e);
                self.fail(summary, &item, e.to_string());
            }
        }
    }

    fn save(&self, summary: &mut BatchSummary, item: &WorkItem, record: AnalysisRecord) {
        match self.store.upsert_record(&record) {
            Ok(()) => {
                summary.saved += 1;
                debug!("Saved analysis for {}", item.item_id);
            }
            Err(e) => {
                error!("Failed to save analysis for {}: {:#}", item.item_id, e);
                self.fail(summary, item, format!("Failed to save analysis: {:#}", e));
            }
        }
    }

    fn fail(&self, summary: &mut BatchSummary, item: &WorkItem, message: String) {
        if let Err(e) = self
            .store
            .record_failure(&item.item_id, &item.source_path, &message)
        {
            error!("Failed to record failure for {}: {:#}", item.item_id, e);
        }
        summary.record_failure(&item.item_id, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis_store::MockAnalysisStore;
    use crate::extractor::{ExtractionError, FeatureExtractor};
    use anyhow::anyhow;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Reads the audio file as text: `fail` fails, `panic` panics, anything
    /// else becomes the record summary.
    #[derive(Default)]
    struct ScriptedFactory {
        unavailable: bool,
        fail_build: bool,
        builds: AtomicUsize,
    }

    struct ScriptedEngine;

    impl FeatureExtractor for ScriptedEngine {
        fn analyze(
            &mut self,
            item_id: &str,
            path: &Path,
            version: &str,
        ) -> Result<AnalysisRecord, ExtractionError> {
            let contents = std::fs::read_to_string(path)?;
            match contents.trim() {
                "fail" => Err(ExtractionError::Failed("unsupported codec".into())),
                "panic" => panic!("segfault-ish"),
                other => {
                    let mut record = AnalysisRecord::empty(item_id, version);
                    record.summary = Some(other.to_string());
                    Ok(record)
                }
            }
        }
    }

    impl ExtractorFactory for ScriptedFactory {
        fn check_available(&self) -> Result<(), ExtractionError> {
            if self.unavailable {
                return Err(ExtractionError::EngineUnavailable("binary missing".into()));
            }
            Ok(())
        }

        fn build(&self, _config: &ExtractorConfig) -> Result<Box<dyn FeatureExtractor>, ExtractionError> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            if self.fail_build {
                return Err(ExtractionError::EngineUnavailable("no models".into()));
            }
            Ok(Box::new(ScriptedEngine))
        }
    }

    fn audio(dir: &TempDir, name: &str, contents: &str) -> WorkItem {
        let path = dir.path().join(format!("{}.mp3", name));
        std::fs::write(&path, contents).unwrap();
        WorkItem::new(name, path.to_string_lossy())
    }

    fn settings(max_workers: usize) -> OrchestratorSettings {
        OrchestratorSettings {
            max_workers,
            ..OrchestratorSettings::default()
        }
    }

    fn orchestrator(
        store: MockAnalysisStore,
        factory: Arc<ScriptedFactory>,
        max_workers: usize,
    ) -> AnalysisOrchestrator {
        AnalysisOrchestrator::new(Arc::new(store), factory, settings(max_workers))
            .unwrap()
            .with_available_parallelism(8)
    }

    fn sorted_errors(summary: &BatchSummary) -> Vec<(String, String)> {
        let mut errors = summary.errors.clone();
        errors.sort();
        errors
    }

    #[test]
    fn test_new_fails_when_engine_unavailable() {
        let factory = Arc::new(ScriptedFactory {
            unavailable: true,
            ..ScriptedFactory::default()
        });
        let err = AnalysisOrchestrator::new(
            Arc::new(MockAnalysisStore::new()),
            factory,
            OrchestratorSettings::default(),
        )
        .err()
        .unwrap();
        assert!(format!("{:#}", err).contains("binary missing"));
    }

    #[test]
    fn test_empty_work_set() {
        let mut store = MockAnalysisStore::new();
        store
            .expect_select_pending()
            .withf(|version, limit, force| version == "essentia-1" && *limit == 16 && !*force)
            .times(1)
            .returning(|_, _, _| Ok(vec![]));
        let factory = Arc::new(ScriptedFactory::default());

        let summary = orchestrator(store, factory.clone(), 4)
            .analyze_pending(None)
            .unwrap();
        assert_eq!(summary, BatchSummary::default());
        assert_eq!(factory.builds.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_mixed_batch_classification() {
        let tmp = TempDir::new().unwrap();
        let items = vec![
            audio(&tmp, "a", "fine"),
            WorkItem::new("b", tmp.path().join("b.mp3").to_string_lossy()),
            audio(&tmp, "c", "fail"),
        ];

        for max_workers in [1, 3] {
            let mut store = MockAnalysisStore::new();
            let selected = items.clone();
            store
                .expect_select_pending()
                .returning(move |_, _, _| Ok(selected.clone()));
            store
                .expect_upsert_record()
                .withf(|record| record.item_id == "a" && record.summary.as_deref() == Some("fine"))
                .times(1)
                .returning(|_| Ok(()));
            store
                .expect_record_failure()
                .withf(|id, _, message| id == "c" && message.contains("unsupported codec"))
                .times(1)
                .returning(|_, _, _| Ok(()));

            let summary = orchestrator(store, Arc::new(ScriptedFactory::default()), max_workers)
                .analyze_pending(Some(3))
                .unwrap();

            assert_eq!(summary.requested, 3);
            assert_eq!(summary.processed, 1);
            assert_eq!(summary.saved, 1);
            assert_eq!(summary.failed, 1);
            assert_eq!(summary.skipped, 1);
            assert!(summary.is_balanced());
            assert_eq!(
                sorted_errors(&summary),
                vec![
                    ("b".to_string(), "File not found".to_string()),
                    ("c".to_string(), "Extraction failed: unsupported codec".to_string()),
                ]
            );
        }
    }

    #[test]
    fn test_persistence_failure_counts_processed_and_failed() {
        let tmp = TempDir::new().unwrap();
        let item = audio(&tmp, "a", "fine");

        let mut store = MockAnalysisStore::new();
        store
            .expect_list_unresolved_failures()
            .returning(move |_| Ok(vec![item.clone()]));
        store
            .expect_upsert_record()
            .returning(|_| Err(anyhow!("database is locked")));
        store
            .expect_record_failure()
            .withf(|id, _, message| id == "a" && message.contains("database is locked"))
            .times(1)
            .returning(|_, _, _| Ok(()));

        let summary = orchestrator(store, Arc::new(ScriptedFactory::default()), 1)
            .retry_failures(None)
            .unwrap();
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.saved, 0);
        assert_eq!(summary.failed, 1);
        assert!(summary.is_balanced());
    }

    #[test]
    fn test_ledger_write_failure_does_not_abort_batch() {
        let tmp = TempDir::new().unwrap();
        let items = vec![audio(&tmp, "a", "fail"), audio(&tmp, "b", "fine")];

        let mut store = MockAnalysisStore::new();
        store
            .expect_select_pending()
            .returning(move |_, _, _| Ok(items.clone()));
        store
            .expect_record_failure()
            .returning(|_, _, _| Err(anyhow!("disk full")));
        store.expect_upsert_record().times(1).returning(|_| Ok(()));

        let summary = orchestrator(store, Arc::new(ScriptedFactory::default()), 1)
            .analyze_pending(None)
            .unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.saved, 1);
    }

    #[test]
    fn test_engine_build_failure_fails_every_item_of_the_unit() {
        let tmp = TempDir::new().unwrap();
        let items = vec![audio(&tmp, "a", "x"), audio(&tmp, "b", "y")];
        let factory = Arc::new(ScriptedFactory {
            fail_build: true,
            ..ScriptedFactory::default()
        });

        let mut store = MockAnalysisStore::new();
        store
            .expect_select_pending()
            .returning(move |_, _, _| Ok(items.clone()));
        store
            .expect_record_failure()
            .withf(|_, _, message| message.contains("no models"))
            .times(2)
            .returning(|_, _, _| Ok(()));
        store.expect_upsert_record().times(0);

        let summary = orchestrator(store, factory.clone(), 1)
            .analyze_pending(None)
            .unwrap();
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.processed, 0);
        assert_eq!(factory.builds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_crash_is_isolated_to_its_item() {
        let tmp = TempDir::new().unwrap();
        let items = vec![
            audio(&tmp, "a", "panic"),
            audio(&tmp, "b", "fine"),
            audio(&tmp, "c", "fine"),
        ];

        let mut store = MockAnalysisStore::new();
        store
            .expect_select_pending()
            .returning(move |_, _, _| Ok(items.clone()));
        store
            .expect_record_failure()
            .withf(|id, _, message| id == "a" && message.contains("segfault-ish"))
            .times(1)
            .returning(|_, _, _| Ok(()));
        store.expect_upsert_record().times(2).returning(|_| Ok(()));

        let summary = orchestrator(store, Arc::new(ScriptedFactory::default()), 2)
            .analyze_pending(None)
            .unwrap();
        assert_eq!(summary.saved, 2);
        assert_eq!(summary.failed, 1);
    }

    #[test]
    fn test_analyze_specific_drops_unknown_and_duplicate_ids() {
        let tmp = TempDir::new().unwrap();
        let item = audio(&tmp, "a", "fine");
        let path = item.source_path.clone();

        let mut store = MockAnalysisStore::new();
        store
            .expect_get_source_path()
            .withf(|id| id == "a")
            .times(1)
            .returning(move |_| Ok(Some(path.clone())));
        store
            .expect_get_source_path()
            .withf(|id| id == "ghost")
            .times(1)
            .returning(|_| Ok(None));
        store.expect_upsert_record().times(1).returning(|_| Ok(()));

        let ids = vec!["a".to_string(), "ghost".to_string(), "a".to_string()];
        let summary = orchestrator(store, Arc::new(ScriptedFactory::default()), 4)
            .analyze_specific(&ids)
            .unwrap();
        assert_eq!(summary.requested, 1);
        assert_eq!(summary.saved, 1);
        assert!(summary.errors.is_empty());
    }

    #[test]
    fn test_selection_error_propagates() {
        let mut store = MockAnalysisStore::new();
        store
            .expect_select_pending()
            .returning(|_, _, _| Err(anyhow!("no such table: tracks")));

        let err = orchestrator(store, Arc::new(ScriptedFactory::default()), 1)
            .analyze_pending(None)
            .unwrap_err();
        assert!(err.to_string().contains("no such table"));
    }

    #[test]
    fn test_effective_parallelism() {
        let orchestrator = AnalysisOrchestrator::new(
            Arc::new(MockAnalysisStore::new()),
            Arc::new(ScriptedFactory::default()),
            settings(6),
        )
        .unwrap();
        assert_eq!(orchestrator.with_available_parallelism(2).effective_parallelism(), 2);

        let orchestrator = AnalysisOrchestrator::new(
            Arc::new(MockAnalysisStore::new()),
            Arc::new(ScriptedFactory::default()),
            settings(3),
        )
        .unwrap();
        assert_eq!(orchestrator.with_available_parallelism(16).effective_parallelism(), 3);
    }
}
