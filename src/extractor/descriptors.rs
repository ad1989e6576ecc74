//! Maps a raw extractor descriptor tree onto an [`AnalysisRecord`].

use crate::analysis_store::{AnalysisRecord, InstrumentationSummary};
use crate::features::FeatureValue;
use std::collections::{BTreeMap, BTreeSet};

const MAX_GENRES: usize = 5;
const MAX_MOODS: usize = 5;
const MOOD_THRESHOLD: f64 = 0.2;
const INSTRUMENT_THRESHOLD: f64 = 0.15;
const SUMMARY_LABELS: usize = 3;

/// Builds a record from the merged low-level and high-level descriptor tree.
pub fn map_descriptors(
    item_id: &str,
    version: &str,
    tree: &FeatureValue,
    include_embedding: bool,
) -> AnalysisRecord {
    let mut record = AnalysisRecord::empty(item_id, version);

    record.tempo_bpm = tree.number_at("rhythm.bpm");
    record.danceability = tree.number_at("rhythm.danceability");

    record.energy_level = tree.number_at("lowlevel.average_loudness");
    record.loudness = tree.number_at("lowlevel.loudness_ebu128.integrated");
    record.dynamic_complexity = tree.number_at("lowlevel.dynamic_complexity");

    let key_node = ["tonal.key_edma", "tonal.key_krumhansl"]
        .iter()
        .filter_map(|path| tree.lookup(path))
        .find(|node| node.text_at("key").is_some());
    if let Some(node) = key_node {
        record.musical_key = node.text_at("key").map(str::to_string);
        record.musical_scale = node.text_at("scale").map(str::to_string);
        record.key_strength = node.number_at("strength");
    }

    record.brightness = tree.number_at("lowlevel.spectral_centroid.mean");
    record.warmth = tree.number_at("lowlevel.spectral_energyband_low.mean");
    record.dissonance = tree.number_at("lowlevel.dissonance.mean");

    let highlevel = tree.get("highlevel").and_then(FeatureValue::as_map);
    let classifiers = |prefix: &'static str| {
        highlevel
            .into_iter()
            .flatten()
            .filter(move |(name, _)| name.starts_with(prefix))
            .map(|(_, node)| node)
    };

    record.genres = genre_labels(classifiers("genre"));
    record.moods = mood_labels(classifiers("mood"));
    record.instrumentation = instrumentation(classifiers("instrument"));
    let voice = tree.text_at("highlevel.voice_instrumental.value");

    record.composition_year = composition_year(tree);
    record.composition_decade = record.effective_decade();
    record.keywords = keywords(
        &record.genres,
        &record.moods,
        &record.instrumentation,
        voice,
    );
    record.summary = build_summary(&record.genres, &record.moods, record.tempo_bpm);

    if include_embedding {
        record.embedding = embedding(tree);
    }
    record.payload = payload(tree);
    record
}

/// `Genre: a, b, c... | Mood: x | Tempo: 120.0 BPM`, or `None` when there
/// is nothing to say.
pub fn build_summary(genres: &[String], moods: &[String], tempo: Option<f64>) -> Option<String> {
    let mut fragments = Vec::new();
    if !genres.is_empty() {
        let ellipsis = if genres.len() > SUMMARY_LABELS { "..." } else { "" };
        fragments.push(format!(
            "Genre: {}{}",
            genres[..genres.len().min(SUMMARY_LABELS)].join(", "),
            ellipsis
        ));
    }
    if !moods.is_empty() {
        fragments.push(format!(
            "Mood: {}",
            moods[..moods.len().min(SUMMARY_LABELS)].join(", ")
        ));
    }
    if let Some(tempo) = tempo.filter(|t| *t != 0.0) {
        fragments.push(format!("Tempo: {:.1} BPM", tempo));
    }
    (!fragments.is_empty()).then(|| fragments.join(" | "))
}

/// Label scores of one classifier node, skipping classifiers that reported an
/// error.
fn classifier_scores(node: &FeatureValue) -> Option<Vec<(String, f64)>> {
    if node.get("error").is_some_and(|e| !e.is_null()) {
        return None;
    }
    let scores = node
        .get("all")
        .and_then(FeatureValue::as_map)
        .map(|all| {
            all.iter()
                .filter_map(|(label, score)| score.as_f64().map(|s| (label.clone(), s)))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    Some(scores)
}

/// Sorts by score descending, keeping the best score of repeated labels.
fn ranked(scores: impl IntoIterator<Item = (String, f64)>) -> Vec<String> {
    let mut best: BTreeMap<String, f64> = BTreeMap::new();
    for (label, score) in scores {
        let entry = best.entry(label).or_insert(score);
        if score > *entry {
            *entry = score;
        }
    }
    let mut ranked: Vec<(String, f64)> = best.into_iter().collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    ranked.into_iter().map(|(label, _)| label).collect()
}

fn genre_labels<'a>(nodes: impl Iterator<Item = &'a FeatureValue>) -> Vec<String> {
    let mut scores = Vec::new();
    let mut fallback = Vec::new();
    for node in nodes {
        let Some(node_scores) = classifier_scores(node) else {
            continue;
        };
        if node_scores.is_empty() {
            fallback.extend(node.text_at("value").map(str::to_string));
        }
        scores.extend(node_scores);
    }
    let mut labels = ranked(scores);
    labels.truncate(MAX_GENRES);
    if labels.is_empty() {
        fallback.truncate(MAX_GENRES);
        return fallback;
    }
    labels
}

fn mood_labels<'a>(nodes: impl Iterator<Item = &'a FeatureValue>) -> Vec<String> {
    let mut scores = Vec::new();
    for node in nodes {
        let Some(node_scores) = classifier_scores(node) else {
            continue;
        };
        if node_scores.is_empty() {
            if let Some(value) = node.text_at("value").filter(|v| !v.starts_with("not_")) {
                let probability = node.number_at("probability").unwrap_or(1.0);
                scores.push((value.to_string(), probability));
            }
            continue;
        }
        scores.extend(
            node_scores
                .into_iter()
                .filter(|(label, score)| !label.starts_with("not_") && *score >= MOOD_THRESHOLD),
        );
    }
    let mut labels = ranked(scores);
    labels.truncate(MAX_MOODS);
    labels
}

fn instrumentation<'a>(nodes: impl Iterator<Item = &'a FeatureValue>) -> InstrumentationSummary {
    let mut instruments = BTreeMap::new();
    for node in nodes {
        let Some(node_scores) = classifier_scores(node) else {
            continue;
        };
        if node_scores.is_empty() {
            if let Some(value) = node.text_at("value") {
                instruments.insert(
                    value.to_string(),
                    node.number_at("probability").unwrap_or(0.0),
                );
            }
            continue;
        }
        for (label, score) in node_scores {
            if score >= INSTRUMENT_THRESHOLD {
                let entry = instruments.entry(label).or_insert(score);
                if score > *entry {
                    *entry = score;
                }
            }
        }
    }
    let count = (!instruments.is_empty()).then(|| instruments.len() as i64);
    InstrumentationSummary { instruments, count }
}

fn composition_year(tree: &FeatureValue) -> Option<i64> {
    if let Some(year) = tree.number_at("metadata.audio_properties.year") {
        return Some(year as i64);
    }
    let date = tree.lookup("metadata.tags.date")?;
    let text = match date {
        FeatureValue::List(items) => items.first().and_then(FeatureValue::as_str),
        other => other.as_str(),
    }?;
    let prefix = text.get(..4)?;
    if prefix.chars().all(|c| c.is_ascii_digit()) {
        prefix.parse().ok()
    } else {
        None
    }
}

fn keywords(
    genres: &[String],
    moods: &[String],
    instrumentation: &InstrumentationSummary,
    voice: Option<&str>,
) -> Vec<String> {
    let mut terms: BTreeSet<String> = genres
        .iter()
        .chain(moods)
        .chain(instrumentation.instruments.keys())
        .map(String::as_str)
        .chain(voice)
        .filter(|term| !term.is_empty())
        .map(str::to_lowercase)
        .collect();
    match instrumentation.count {
        Some(1) => {
            terms.insert("solo".to_string());
        }
        Some(n) if n > 4 => {
            terms.insert("ensemble".to_string());
        }
        _ => {}
    }
    terms.into_iter().collect()
}

fn embedding(tree: &FeatureValue) -> Option<BTreeMap<String, Vec<f64>>> {
    let node = tree.lookup("highlevel.embedding")?.as_map()?;
    let vectors: BTreeMap<String, Vec<f64>> = node
        .iter()
        .filter_map(|(name, value)| {
            let vector = value
                .as_list()?
                .iter()
                .map(FeatureValue::as_f64)
                .collect::<Option<Vec<f64>>>()?;
            Some((name.clone(), vector))
        })
        .collect();
    (!vectors.is_empty()).then_some(vectors)
}

fn payload(tree: &FeatureValue) -> BTreeMap<String, FeatureValue> {
    const KEPT_CLASSIFIERS: [&str; 4] = ["genre", "mood", "instrument", "voice"];
    const KEPT_METADATA: [&str; 3] = ["version", "audio_properties", "tags"];

    let mut payload = BTreeMap::new();
    if let Some(highlevel) = tree.get("highlevel").and_then(FeatureValue::as_map) {
        for (name, value) in highlevel {
            if KEPT_CLASSIFIERS.iter().any(|p| name.starts_with(p)) {
                payload.insert(format!("highlevel.{}", name), value.clone());
            }
        }
    }
    for name in KEPT_METADATA {
        if let Some(value) = tree.lookup(&format!("metadata.{}", name)) {
            payload.insert(format!("metadata.{}", name), value.clone());
        }
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tree() -> FeatureValue {
        FeatureValue::from(json!({
            "rhythm": { "bpm": 124.5, "danceability": 1.5 },
            "lowlevel": {
                "average_loudness": 0.875,
                "loudness_ebu128": { "integrated": -9.5 },
                "dynamic_complexity": 3.25,
                "spectral_centroid": { "mean": 1500.0 },
                "spectral_energyband_low": { "mean": 0.125 },
                "dissonance": { "mean": 0.5 }
            },
            "tonal": {
                "key_edma": { "key": "", "scale": "", "strength": 0.0 },
                "key_krumhansl": { "key": "A", "scale": "minor", "strength": 0.75 }
            },
            "highlevel": {
                "genre_dortmund": {
                    "all": { "electronic": 0.75, "rock": 0.125, "jazz": 0.0625 },
                    "value": "electronic"
                },
                "genre_rosamerica": {
                    "all": { "dan": 0.5, "hip": 0.25, "pop": 0.125, "electronic": 0.5 },
                    "value": "dan"
                },
                "mood_happy": { "all": { "happy": 0.25, "not_happy": 0.75 }, "value": "not_happy" },
                "mood_party": { "all": { "party": 0.875, "not_party": 0.125 }, "value": "party" },
                "mood_sad": { "error": "model missing" },
                "instrument_nsynth": { "all": { "synth": 0.5, "bass": 0.25, "guitar": 0.0625 } },
                "voice_instrumental": { "all": { "voice": 0.125, "instrumental": 0.875 }, "value": "instrumental" },
                "embedding": { "discogs": [0.5, 0.25], "broken": ["x"] },
                "danceability": { "value": "danceable" }
            },
            "metadata": {
                "version": { "essentia": "2.1-beta5" },
                "tags": { "date": ["1997-05-02"] },
                "audio_properties": { "length": 240.0 }
            }
        }))
    }

    #[test]
    fn test_scalar_descriptors() {
        let record = map_descriptors("t1", "essentia-1", &tree(), true);
        assert_eq!(record.item_id, "t1");
        assert_eq!(record.schema_version, "essentia-1");
        assert_eq!(record.tempo_bpm, Some(124.5));
        assert_eq!(record.danceability, Some(1.5));
        assert_eq!(record.energy_level, Some(0.875));
        assert_eq!(record.loudness, Some(-9.5));
        assert_eq!(record.dynamic_complexity, Some(3.25));
        assert_eq!(record.brightness, Some(1500.0));
        assert_eq!(record.warmth, Some(0.125));
        assert_eq!(record.dissonance, Some(0.5));
    }

    #[test]
    fn test_key_falls_back_when_primary_is_empty() {
        let record = map_descriptors("t1", "v", &tree(), true);
        assert_eq!(record.musical_key.as_deref(), Some("A"));
        assert_eq!(record.musical_scale.as_deref(), Some("minor"));
        assert_eq!(record.key_strength, Some(0.75));
    }

    #[test]
    fn test_classifier_labels() {
        let record = map_descriptors("t1", "v", &tree(), true);
        assert_eq!(
            record.genres,
            vec!["electronic", "dan", "hip", "pop", "rock"]
        );
        assert_eq!(record.moods, vec!["party", "happy"]);
        assert_eq!(
            record.instrumentation.instruments,
            BTreeMap::from([("bass".to_string(), 0.25), ("synth".to_string(), 0.5)])
        );
        assert_eq!(record.instrumentation.count, Some(2));
    }

    #[test]
    fn test_metadata_keywords_and_summary() {
        let record = map_descriptors("t1", "v", &tree(), true);
        assert_eq!(record.composition_year, Some(1997));
        assert_eq!(record.composition_decade, Some(1990));
        assert_eq!(
            record.keywords,
            vec![
                "bass",
                "dan",
                "electronic",
                "happy",
                "hip",
                "instrumental",
                "party",
                "pop",
                "rock",
                "synth"
            ]
        );
        assert_eq!(
            record.summary.as_deref(),
            Some("Genre: electronic, dan, hip... | Mood: party, happy | Tempo: 124.5 BPM")
        );
    }

    #[test]
    fn test_embedding_respects_flag() {
        let with = map_descriptors("t1", "v", &tree(), true);
        assert_eq!(
            with.embedding,
            Some(BTreeMap::from([("discogs".to_string(), vec![0.5, 0.25])]))
        );
        let without = map_descriptors("t1", "v", &tree(), false);
        assert!(without.embedding.is_none());
    }

    #[test]
    fn test_payload_keeps_selected_sections() {
        let record = map_descriptors("t1", "v", &tree(), true);
        let keys: Vec<&str> = record.payload.keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            vec![
                "highlevel.genre_dortmund",
                "highlevel.genre_rosamerica",
                "highlevel.instrument_nsynth",
                "highlevel.mood_happy",
                "highlevel.mood_party",
                "highlevel.mood_sad",
                "highlevel.voice_instrumental",
                "metadata.audio_properties",
                "metadata.tags",
                "metadata.version",
            ]
        );
    }

    #[test]
    fn test_empty_tree_gives_empty_record() {
        let record = map_descriptors("t1", "v", &FeatureValue::empty_map(), true);
        assert_eq!(record, AnalysisRecord::empty("t1", "v"));
    }

    #[test]
    fn test_single_instrument_is_solo_and_value_fallbacks() {
        let tree = FeatureValue::from(json!({
            "highlevel": {
                "genre_tzanetakis": { "value": "jazz" },
                "mood_relaxed": { "value": "relaxed", "probability": 0.75 },
                "instrument_top": { "value": "piano", "probability": 0.5 }
            },
            "metadata": { "audio_properties": { "year": 1963 } }
        }));
        let record = map_descriptors("t2", "v", &tree, true);
        assert_eq!(record.genres, vec!["jazz"]);
        assert_eq!(record.moods, vec!["relaxed"]);
        assert_eq!(record.instrumentation.count, Some(1));
        assert_eq!(record.keywords, vec!["jazz", "piano", "relaxed", "solo"]);
        assert_eq!(record.composition_year, Some(1963));
        assert_eq!(record.composition_decade, Some(1960));
    }

    #[test]
    fn test_build_summary() {
        assert_eq!(build_summary(&[], &[], None), None);
        assert_eq!(build_summary(&[], &[], Some(0.0)), None);
        assert_eq!(
            build_summary(&["rock".to_string()], &[], Some(90.0)).as_deref(),
            Some("Genre: rock | Tempo: 90.0 BPM")
        );
    }
}
