//! SQLite schema definitions for the analysis database.

use crate::sqlite_column;
use crate::sqlite_persistence::{
    Column, ForeignKey, ForeignKeyOnChange, SqlType, Table, VersionedSchema, DEFAULT_TIMESTAMP,
};

/// Catalog entries that may need analysis.
const TRACKS_TABLE: Table = Table {
    name: "tracks",
    columns: &[
        sqlite_column!("id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("file_path", &SqlType::Text),
        sqlite_column!(
            "created_at",
            &SqlType::Integer,
            non_null = true,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
        sqlite_column!("updated_at", &SqlType::Integer, non_null = true),
    ],
    indices: &[
        ("idx_tracks_updated_at", "updated_at"),
        ("idx_tracks_created_at", "created_at"),
    ],
};

const TRACK_FK: ForeignKey = ForeignKey {
    foreign_table: "tracks",
    foreign_column: "id",
    on_delete: ForeignKeyOnChange::Cascade,
};

/// One current analysis record per track.
const TRACK_AUDIO_ANALYSIS_TABLE: Table = Table {
    name: "track_audio_analysis",
    columns: &[
        sqlite_column!(
            "track_id",
            &SqlType::Text,
            is_primary_key = true,
            foreign_key = Some(&TRACK_FK)
        ),
        sqlite_column!("analysis_version", &SqlType::Text, non_null = true),
        sqlite_column!("analyzed_at", &SqlType::Integer, non_null = true),
        // Rhythm
        sqlite_column!("tempo_bpm", &SqlType::Real),
        sqlite_column!("danceability", &SqlType::Real),
        // Energy and dynamics
        sqlite_column!("energy_level", &SqlType::Real),
        sqlite_column!("loudness", &SqlType::Real),
        sqlite_column!("dynamic_complexity", &SqlType::Real),
        // Tonal
        sqlite_column!("musical_key", &SqlType::Text),
        sqlite_column!("musical_scale", &SqlType::Text),
        sqlite_column!("key_strength", &SqlType::Real),
        // Timbre
        sqlite_column!("brightness", &SqlType::Real),
        sqlite_column!("warmth", &SqlType::Real),
        sqlite_column!("dissonance", &SqlType::Real),
        // Classifiers
        sqlite_column!("genres", &SqlType::Text, non_null = true), // JSON array
        sqlite_column!("moods", &SqlType::Text, non_null = true), // JSON array
        sqlite_column!("instrumentation", &SqlType::Text, non_null = true), // JSON object
        sqlite_column!("instrumentation_count", &SqlType::Integer),
        // Metadata
        sqlite_column!("composition_year", &SqlType::Integer),
        sqlite_column!("composition_decade", &SqlType::Integer),
        sqlite_column!("keywords", &SqlType::Text, non_null = true), // JSON array
        sqlite_column!("summary", &SqlType::Text),
        // Advanced
        sqlite_column!("embedding", &SqlType::Text), // JSON object
        sqlite_column!("payload", &SqlType::Text, non_null = true), // JSON object
    ],
    indices: &[("idx_analysis_version", "analysis_version")],
};

/// Retry ledger. Rows are never deleted; success only flips `resolved`.
const TRACK_ANALYSIS_FAILURES_TABLE: Table = Table {
    name: "track_analysis_failures",
    columns: &[
        sqlite_column!("track_id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("file_path", &SqlType::Text),
        sqlite_column!("error", &SqlType::Text, non_null = true),
        sqlite_column!(
            "retry_count",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("occurred_at", &SqlType::Integer, non_null = true),
        sqlite_column!(
            "resolved",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
    ],
    indices: &[("idx_failures_resolved_occurred", "resolved, occurred_at")],
};

pub const ANALYSIS_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 0,
    tables: &[
        TRACKS_TABLE,
        TRACK_AUDIO_ANALYSIS_TABLE,
        TRACK_ANALYSIS_FAILURES_TABLE,
    ],
    migration: None,
}];
