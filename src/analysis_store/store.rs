//! SQLite-backed analysis store implementation.

use super::models::{
    AnalysisRecord, FailureEntry, InstrumentationSummary, SelectionOrder, StoreStats,
    StoredAnalysis, WorkItem,
};
use super::schema::ANALYSIS_VERSIONED_SCHEMAS;
use super::trait_def::AnalysisStore;
use crate::sqlite_persistence::open_versioned;
use anyhow::{anyhow, Context, Result};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// SQLite-backed analysis store.
#[derive(Clone)]
pub struct SqliteAnalysisStore {
    read_conn: Arc<Mutex<Connection>>,
    write_conn: Arc<Mutex<Connection>>,
    selection_order: SelectionOrder,
}

impl SqliteAnalysisStore {
    /// Open (creating if needed) the analysis database at `db_path`.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path_ref = db_path.as_ref();

        let mut write_conn = Connection::open_with_flags(
            db_path_ref,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("Failed to open analysis database {:?}", db_path_ref))?;

        open_versioned(&mut write_conn, ANALYSIS_VERSIONED_SCHEMAS, "analysis")?;

        write_conn
            .pragma_update(None, "journal_mode", "WAL")
            .context("Failed to set WAL mode on analysis write connection")?;
        write_conn
            .pragma_update(None, "foreign_keys", "ON")
            .context("Failed to enable foreign keys on analysis write connection")?;

        let read_conn = Connection::open_with_flags(
            db_path_ref,
            OpenFlags::SQLITE_OPEN_READ_ONLY
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .context("Failed to open analysis database for reading")?;

        let catalog_items: usize =
            read_conn.query_row("SELECT COUNT(*) FROM tracks", [], |r| r.get(0))?;
        let analyzed: usize =
            read_conn.query_row("SELECT COUNT(*) FROM track_audio_analysis", [], |r| r.get(0))?;
        info!(
            "Analysis store ready: {} catalog items, {} analyzed",
            catalog_items, analyzed
        );

        Ok(Self {
            read_conn: Arc::new(Mutex::new(read_conn)),
            write_conn: Arc::new(Mutex::new(write_conn)),
            selection_order: SelectionOrder::default(),
        })
    }

    pub fn with_selection_order(mut self, order: SelectionOrder) -> Self {
        self.selection_order = order;
        self
    }

    /// Same as [`AnalysisStore::record_failure`] with an explicit occurrence
    /// time in milliseconds.
    pub fn record_failure_at(
        &self,
        item_id: &str,
        path: &str,
        message: &str,
        occurred_at: i64,
    ) -> Result<()> {
        let conn = lock(&self.write_conn)?;
        conn.execute(
            "INSERT INTO track_analysis_failures
                 (track_id, file_path, error, retry_count, occurred_at, resolved)
             VALUES (?1, NULLIF(?2, ''), ?3, 0, ?4, 0)
             ON CONFLICT(track_id) DO UPDATE SET
                 file_path = COALESCE(excluded.file_path, track_analysis_failures.file_path),
                 error = excluded.error,
                 retry_count = track_analysis_failures.retry_count + 1,
                 occurred_at = excluded.occurred_at,
                 resolved = 0",
            params![item_id, path, message, occurred_at],
        )?;
        warn!("Recorded analysis failure for {}: {}", item_id, message);
        Ok(())
    }

    fn order_clause(&self) -> &'static str {
        match self.selection_order {
            SelectionOrder::RecentlyUpdated => "t.updated_at DESC, t.id ASC",
            SelectionOrder::FirstSeen => "t.created_at ASC, t.id ASC",
        }
    }
}

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
    conn.lock()
        .map_err(|_| anyhow!("Analysis database connection mutex poisoned"))
}

fn to_json<T: Serialize>(value: &T, column: &str) -> Result<String> {
    serde_json::to_string(value).with_context(|| format!("Failed to serialize {}", column))
}

/// Decodes a JSON text column. NULL reads back as the type's default.
fn json_column<T: DeserializeOwned + Default>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: Option<String> = row.get(idx)?;
    match raw {
        Some(json) => serde_json::from_str(&json)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))),
        None => Ok(T::default()),
    }
}

fn work_item_from_row(row: &Row<'_>) -> rusqlite::Result<WorkItem> {
    Ok(WorkItem {
        item_id: row.get(0)?,
        source_path: row.get(1)?,
    })
}

impl AnalysisStore for SqliteAnalysisStore {
    fn select_pending(
        &self,
        required_version: &str,
        limit: usize,
        force: bool,
    ) -> Result<Vec<WorkItem>> {
        let conn = lock(&self.read_conn)?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT t.id, t.file_path
             FROM tracks AS t
             LEFT JOIN track_audio_analysis AS a ON a.track_id = t.id
             WHERE t.file_path IS NOT NULL AND t.file_path <> ''
               AND (?1 = 1 OR a.track_id IS NULL OR a.analysis_version <> ?2)
             ORDER BY {}
             LIMIT ?3",
            self.order_clause()
        ))?;
        let items = stmt
            .query_map(
                params![force, required_version, limit as i64],
                work_item_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        debug!("Loaded {} items pending analysis", items.len());
        Ok(items)
    }

    fn get_source_path(&self, item_id: &str) -> Result<Option<String>> {
        let conn = lock(&self.read_conn)?;
        let path: Option<Option<String>> = conn
            .query_row(
                "SELECT file_path FROM tracks WHERE id = ?1",
                params![item_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(path.flatten().filter(|p| !p.is_empty()))
    }

    fn list_unresolved_failures(&self, limit: usize) -> Result<Vec<WorkItem>> {
        let conn = lock(&self.read_conn)?;
        let mut stmt = conn.prepare_cached(
            "SELECT track_id, file_path
             FROM track_analysis_failures
             WHERE resolved = 0 AND file_path IS NOT NULL AND file_path <> ''
             ORDER BY occurred_at ASC, track_id ASC
             LIMIT ?1",
        )?;
        let items = stmt
            .query_map(params![limit as i64], work_item_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(items)
    }

    fn upsert_record(&self, record: &AnalysisRecord) -> Result<()> {
        let genres = to_json(&record.genres, "genres")?;
        let moods = to_json(&record.moods, "moods")?;
        let instrumentation = to_json(&record.instrumentation, "instrumentation")?;
        let keywords = to_json(&record.keywords, "keywords")?;
        let embedding = record
            .embedding
            .as_ref()
            .map(|e| to_json(e, "embedding"))
            .transpose()?;
        let payload = to_json(&record.payload, "payload")?;
        let analyzed_at = chrono::Utc::now().timestamp();

        let mut conn = lock(&self.write_conn)?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO track_audio_analysis
                 (track_id, analysis_version, analyzed_at, tempo_bpm, danceability,
                  energy_level, loudness, dynamic_complexity, musical_key, musical_scale,
                  key_strength, brightness, warmth, dissonance, genres, moods,
                  instrumentation, instrumentation_count, composition_year,
                  composition_decade, keywords, summary, embedding, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                     ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)
             ON CONFLICT(track_id) DO UPDATE SET
                 analysis_version = excluded.analysis_version,
                 analyzed_at = excluded.analyzed_at,
                 tempo_bpm = excluded.tempo_bpm,
                 danceability = excluded.danceability,
                 energy_level = excluded.energy_level,
                 loudness = excluded.loudness,
                 dynamic_complexity = excluded.dynamic_complexity,
                 musical_key = excluded.musical_key,
                 musical_scale = excluded.musical_scale,
                 key_strength = excluded.key_strength,
                 brightness = excluded.brightness,
                 warmth = excluded.warmth,
                 dissonance = excluded.dissonance,
                 genres = excluded.genres,
                 moods = excluded.moods,
                 instrumentation = excluded.instrumentation,
                 instrumentation_count = excluded.instrumentation_count,
                 composition_year = excluded.composition_year,
                 composition_decade = excluded.composition_decade,
                 keywords = excluded.keywords,
                 summary = excluded.summary,
                 embedding = excluded.embedding,
                 payload = excluded.payload",
            params![
                record.item_id,
                record.schema_version,
                analyzed_at,
                record.tempo_bpm,
                record.danceability,
                record.energy_level,
                record.loudness,
                record.dynamic_complexity,
                record.musical_key,
                record.musical_scale,
                record.key_strength,
                record.brightness,
                record.warmth,
                record.dissonance,
                genres,
                moods,
                instrumentation,
                record.instrumentation.count,
                record.composition_year,
                record.effective_decade(),
                keywords,
                record.summary,
                embedding,
                payload,
            ],
        )?;
        tx.execute(
            "UPDATE track_analysis_failures SET resolved = 1 WHERE track_id = ?1",
            params![record.item_id],
        )?;
        tx.commit()?;
        debug!("Saved analysis for {}", record.item_id);
        Ok(())
    }

    fn record_failure(&self, item_id: &str, path: &str, message: &str) -> Result<()> {
        self.record_failure_at(
            item_id,
            path,
            message,
            chrono::Utc::now().timestamp_millis(),
        )
    }

    fn resolve_failure(&self, item_id: &str) -> Result<()> {
        let conn = lock(&self.write_conn)?;
        let updated = conn.execute(
            "UPDATE track_analysis_failures SET resolved = 1 WHERE track_id = ?1",
            params![item_id],
        )?;
        if updated > 0 {
            debug!("Marked failure as resolved for {}", item_id);
        }
        Ok(())
    }

    fn upsert_catalog_item(&self, item_id: &str, path: &str, updated_at: i64) -> Result<()> {
        let conn = lock(&self.write_conn)?;
        conn.execute(
            "INSERT INTO tracks (id, file_path, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET
                 file_path = excluded.file_path,
                 updated_at = excluded.updated_at",
            params![item_id, path, updated_at],
        )?;
        Ok(())
    }

    fn get_record(&self, item_id: &str) -> Result<Option<StoredAnalysis>> {
        let conn = lock(&self.read_conn)?;
        let mut stmt = conn.prepare_cached(
            "SELECT track_id, analysis_version, analyzed_at, tempo_bpm, danceability,
                    energy_level, loudness, dynamic_complexity, musical_key, musical_scale,
                    key_strength, brightness, warmth, dissonance, genres, moods,
                    instrumentation, instrumentation_count, composition_year,
                    composition_decade, keywords, summary, embedding, payload
             FROM track_audio_analysis WHERE track_id = ?1",
        )?;
        let result = stmt
            .query_row(params![item_id], |row| {
                let mut instrumentation: InstrumentationSummary = json_column(row, 16)?;
                instrumentation.count = row.get(17)?;
                let record = AnalysisRecord {
                    item_id: row.get(0)?,
                    schema_version: row.get(1)?,
                    tempo_bpm: row.get(3)?,
                    danceability: row.get(4)?,
                    energy_level: row.get(5)?,
                    loudness: row.get(6)?,
                    dynamic_complexity: row.get(7)?,
                    musical_key: row.get(8)?,
                    musical_scale: row.get(9)?,
                    key_strength: row.get(10)?,
                    brightness: row.get(11)?,
                    warmth: row.get(12)?,
                    dissonance: row.get(13)?,
                    genres: json_column(row, 14)?,
                    moods: json_column(row, 15)?,
                    instrumentation,
                    composition_year: row.get(18)?,
                    composition_decade: row.get(19)?,
                    keywords: json_column(row, 20)?,
                    summary: row.get(21)?,
                    embedding: json_column(row, 22)?,
                    payload: json_column(row, 23)?,
                };
                Ok(StoredAnalysis {
                    record,
                    analyzed_at: row.get(2)?,
                })
            })
            .optional()
            .with_context(|| format!("Failed to read analysis record for {}", item_id))?;
        Ok(result)
    }

    fn get_failure(&self, item_id: &str) -> Result<Option<FailureEntry>> {
        let conn = lock(&self.read_conn)?;
        let result = conn
            .query_row(
                "SELECT track_id, file_path, error, retry_count, occurred_at, resolved
                 FROM track_analysis_failures WHERE track_id = ?1",
                params![item_id],
                |row| {
                    Ok(FailureEntry {
                        item_id: row.get(0)?,
                        last_known_path: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                        error_message: row.get(2)?,
                        retry_count: row.get(3)?,
                        occurred_at: row.get(4)?,
                        resolved: row.get::<_, i32>(5)? != 0,
                    })
                },
            )
            .optional()?;
        Ok(result)
    }

    fn get_stats(&self, required_version: &str) -> Result<StoreStats> {
        let conn = lock(&self.read_conn)?;
        let catalog_items: usize =
            conn.query_row("SELECT COUNT(*) FROM tracks", [], |r| r.get(0))?;
        let analyzed: usize = conn.query_row(
            "SELECT COUNT(*) FROM track_audio_analysis WHERE analysis_version = ?1",
            params![required_version],
            |r| r.get(0),
        )?;
        let stale: usize = conn.query_row(
            "SELECT COUNT(*) FROM track_audio_analysis WHERE analysis_version <> ?1",
            params![required_version],
            |r| r.get(0),
        )?;
        let unresolved_failures: usize = conn.query_row(
            "SELECT COUNT(*) FROM track_analysis_failures WHERE resolved = 0",
            [],
            |r| r.get(0),
        )?;
        Ok(StoreStats {
            catalog_items,
            analyzed,
            stale,
            unresolved_failures,
        })
    }
}
