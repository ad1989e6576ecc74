//! Registers the audio files of a music directory as catalog items.

use crate::analysis_store::AnalysisStore;
use anyhow::{bail, Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::UNIX_EPOCH;
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

const AUDIO_EXTENSIONS: &[&str] = &["mp3", "flac", "ogg", "opus", "m4a", "aac", "wav", "aiff"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub discovered: usize,
    pub registered: usize,
    pub failed: usize,
}

/// Stable id for a file: first 16 hex chars of the SHA-256 of its path
/// relative to the library root, with `/` separators.
pub fn item_id_for(relative: &Path) -> String {
    let normalized = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    let digest = hasher.finalize();
    digest
        .iter()
        .take(8)
        .map(|byte| format!("{:02x}", byte))
        .collect()
}

fn is_audio_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| AUDIO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .map(|name| name.starts_with('.'))
            .unwrap_or(false)
}

fn modified_secs(entry: &DirEntry) -> Option<i64> {
    let modified = entry.metadata().ok()?.modified().ok()?;
    let secs = modified.duration_since(UNIX_EPOCH).ok()?.as_secs();
    i64::try_from(secs).ok()
}

/// Walks `root` and upserts every audio file into the catalog.
pub fn scan_library(store: &dyn AnalysisStore, root: &Path) -> Result<ScanReport> {
    if !root.is_dir() {
        bail!("Library root {} is not a directory", root.display());
    }
    let root = root
        .canonicalize()
        .with_context(|| format!("Failed to resolve library root {}", root.display()))?;

    let mut report = ScanReport::default();
    let walker = WalkDir::new(&root)
        .follow_links(true)
        .into_iter()
        .filter_entry(|e| !is_hidden(e));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Error accessing library entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() || !is_audio_file(entry.path()) {
            continue;
        }
        report.discovered += 1;

        let relative = entry.path().strip_prefix(&root).unwrap_or(entry.path());
        let item_id = item_id_for(relative);
        let updated_at = modified_secs(&entry).unwrap_or_else(|| chrono::Utc::now().timestamp());

        match store.upsert_catalog_item(&item_id, &entry.path().to_string_lossy(), updated_at) {
            Ok(()) => {
                debug!("Registered {} as {}", relative.display(), item_id);
                report.registered += 1;
            }
            Err(e) => {
                warn!("Failed to register {}: {:#}", entry.path().display(), e);
                report.failed += 1;
            }
        }
    }

    info!(
        "Scanned {}: {} audio files, {} registered, {} failed",
        root.display(),
        report.discovered,
        report.registered,
        report.failed
    );
    Ok(report)
}
