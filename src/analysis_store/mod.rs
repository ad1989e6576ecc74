mod models;
mod schema;
mod store;
mod trait_def;

pub use models::{
    AnalysisRecord, FailureEntry, InstrumentationSummary, SelectionOrder, StoreStats,
    StoredAnalysis, WorkItem,
};
pub use store::SqliteAnalysisStore;
pub use trait_def::AnalysisStore;

#[cfg(any(test, feature = "mock"))]
pub use trait_def::MockAnalysisStore;
