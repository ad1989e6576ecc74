use serde::Serialize;

/// Outcome counters of one orchestration run.
///
/// `requested == saved + failed + skipped` holds for every run; `processed`
/// counts items whose extraction returned a record, whether or not it could
/// be saved.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub requested: usize,
    pub processed: usize,
    pub saved: usize,
    pub failed: usize,
    pub skipped: usize,
    /// `(item_id, message)` for every skipped or failed item, in completion
    /// order.
    pub errors: Vec<(String, String)>,
}

impl BatchSummary {
    pub fn new(requested: usize) -> Self {
        Self {
            requested,
            ..Self::default()
        }
    }

    pub fn record_skip(&mut self, item_id: &str, message: impl Into<String>) {
        self.skipped += 1;
        self.errors.push((item_id.to_string(), message.into()));
    }

    pub fn record_failure(&mut self, item_id: &str, message: impl Into<String>) {
        self.failed += 1;
        self.errors.push((item_id.to_string(), message.into()));
    }

    pub fn is_balanced(&self) -> bool {
        self.requested == self.saved + self.failed + self.skipped
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
