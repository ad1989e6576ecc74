//! Batch analysis: selection, execution units and bookkeeping.

mod batch;
mod summary;
mod worker;

pub use batch::{AnalysisOrchestrator, OrchestratorSettings};
pub use summary::BatchSummary;
pub use worker::{TaskOutcome, WorkerContext, WorkerPool};
