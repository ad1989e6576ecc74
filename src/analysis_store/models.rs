//! Data models for the analysis database.

use crate::features::FeatureValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An audio item eligible for analysis, as materialized by a selection query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub item_id: String,
    pub source_path: String,
}

impl WorkItem {
    pub fn new(item_id: impl Into<String>, source_path: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            source_path: source_path.into(),
        }
    }
}

/// Detected instruments with their prominence scores.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstrumentationSummary {
    pub instruments: BTreeMap<String, f64>,
    pub count: Option<i64>,
}

/// Descriptors produced by one successful extraction of one item.
///
/// At most one record exists per `item_id`; a new extraction replaces the
/// whole record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub item_id: String,
    pub schema_version: String,
    // -- Rhythm --
    pub tempo_bpm: Option<f64>,
    pub danceability: Option<f64>,
    // -- Energy and dynamics --
    pub energy_level: Option<f64>,
    pub loudness: Option<f64>,
    pub dynamic_complexity: Option<f64>,
    // -- Tonal --
    pub musical_key: Option<String>,
    pub musical_scale: Option<String>,
    pub key_strength: Option<f64>,
    // -- Timbre --
    pub brightness: Option<f64>,
    pub warmth: Option<f64>,
    pub dissonance: Option<f64>,
    // -- Classifiers --
    pub genres: Vec<String>,
    pub moods: Vec<String>,
    pub instrumentation: InstrumentationSummary,
    // -- Metadata --
    pub composition_year: Option<i64>,
    pub composition_decade: Option<i64>,
    pub keywords: Vec<String>,
    pub summary: Option<String>,
    // -- Advanced --
    pub embedding: Option<BTreeMap<String, Vec<f64>>>,
    pub payload: BTreeMap<String, FeatureValue>,
}

impl AnalysisRecord {
    /// A record with every descriptor empty.
    pub fn empty(item_id: impl Into<String>, schema_version: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            schema_version: schema_version.into(),
            tempo_bpm: None,
            danceability: None,
            energy_level: None,
            loudness: None,
            dynamic_complexity: None,
            musical_key: None,
            musical_scale: None,
            key_strength: None,
            brightness: None,
            warmth: None,
            dissonance: None,
            genres: Vec::new(),
            moods: Vec::new(),
            instrumentation: InstrumentationSummary::default(),
            composition_year: None,
            composition_decade: None,
            keywords: Vec::new(),
            summary: None,
            embedding: None,
            payload: BTreeMap::new(),
        }
    }

    /// The stored decade, or the one implied by the composition year.
    pub fn effective_decade(&self) -> Option<i64> {
        self.composition_decade
            .or_else(|| self.composition_year.map(|year| year.div_euclid(10) * 10))
    }
}

/// A persisted record together with the time it was last written.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredAnalysis {
    pub record: AnalysisRecord,
    pub analyzed_at: i64,
}

/// A row of the retry ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureEntry {
    pub item_id: String,
    pub last_known_path: String,
    pub error_message: String,
    pub retry_count: i64,
    /// Milliseconds since the Unix epoch.
    pub occurred_at: i64,
    pub resolved: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub catalog_items: usize,
    pub analyzed: usize,
    pub stale: usize,
    pub unresolved_failures: usize,
}

/// Order in which `select_pending` hands out candidates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionOrder {
    /// Most recently updated catalog entries first.
    #[default]
    RecentlyUpdated,
    /// Oldest catalog entries first, so nothing waits forever behind new arrivals.
    FirstSeen,
}
