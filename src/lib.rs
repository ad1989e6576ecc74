//! Track Analyzer Library
//!
//! Batch audio analysis: selects catalog items that need descriptors,
//! extracts them in parallel execution units and persists the results with a
//! durable retry ledger.

pub mod analysis_store;
pub mod catalog_scan;
pub mod config;
pub mod extractor;
pub mod features;
pub mod orchestrator;
pub mod sqlite_persistence;

// Re-export commonly used types for convenience
pub use analysis_store::{AnalysisRecord, AnalysisStore, SqliteAnalysisStore, WorkItem};
pub use extractor::{EssentiaExtractorFactory, ExtractionError, ExtractorFactory, FeatureExtractor};
pub use orchestrator::{AnalysisOrchestrator, BatchSummary, OrchestratorSettings};
