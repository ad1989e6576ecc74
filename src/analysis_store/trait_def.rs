//! AnalysisStore trait definition.

use super::models::{AnalysisRecord, FailureEntry, StoreStats, StoredAnalysis, WorkItem};
use anyhow::Result;

/// Durable analysis state and the retry ledger.
///
/// The orchestrator is the only writer; workers hand their results back to it
/// instead of touching storage.
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
pub trait AnalysisStore: Send + Sync {
    // =========================================================================
    // Selection
    // =========================================================================

    /// Items with no record, or whose record was produced by a version other
    /// than `required_version` (every item with a path when `force` is set).
    /// Items without a usable source path are never returned.
    fn select_pending(&self, required_version: &str, limit: usize, force: bool)
        -> Result<Vec<WorkItem>>;

    /// Source path of a catalog item, if it has one.
    fn get_source_path(&self, item_id: &str) -> Result<Option<String>>;

    /// Unresolved ledger entries, oldest occurrence first.
    fn list_unresolved_failures(&self, limit: usize) -> Result<Vec<WorkItem>>;

    // =========================================================================
    // Writes
    // =========================================================================

    /// Insert or fully replace the record for `record.item_id`, and resolve
    /// any ledger entry for that item in the same transaction.
    fn upsert_record(&self, record: &AnalysisRecord) -> Result<()>;

    /// Insert a ledger entry, or bump `retry_count`, replace the message,
    /// refresh `occurred_at` and clear `resolved` on an existing one.
    ///
    /// The SQLite backend does this with a single `INSERT .. ON CONFLICT DO
    /// UPDATE`. Backends without a conditional insert must fall back to
    /// insert-then-update on a uniqueness violation, which is not atomic
    /// against concurrent writers.
    fn record_failure(&self, item_id: &str, path: &str, message: &str) -> Result<()>;

    /// Mark the ledger entry for `item_id` resolved. No-op when there is none.
    fn resolve_failure(&self, item_id: &str) -> Result<()>;

    /// Register or refresh a catalog entry.
    fn upsert_catalog_item(&self, item_id: &str, path: &str, updated_at: i64) -> Result<()>;

    // =========================================================================
    // Reads
    // =========================================================================

    fn get_record(&self, item_id: &str) -> Result<Option<StoredAnalysis>>;

    fn get_failure(&self, item_id: &str) -> Result<Option<FailureEntry>>;

    fn get_stats(&self, required_version: &str) -> Result<StoreStats>;
}
