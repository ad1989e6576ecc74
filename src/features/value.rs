use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A node of a raw descriptor tree.
///
/// Engines emit nested JSON-like documents whose shape varies between engine
/// versions. Only a handful of fields are read through the narrow accessors
/// below; everything else is carried opaquely in `AnalysisRecord::payload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    List(Vec<FeatureValue>),
    Map(BTreeMap<String, FeatureValue>),
}

impl FeatureValue {
    pub fn empty_map() -> Self {
        FeatureValue::Map(BTreeMap::new())
    }

    /// Child of a map node.
    pub fn get(&self, key: &str) -> Option<&FeatureValue> {
        self.as_map().and_then(|map| map.get(key))
    }

    /// Follows a dotted path such as `tonal.key_edma.key` through nested maps.
    pub fn lookup(&self, path: &str) -> Option<&FeatureValue> {
        path.split('.')
            .try_fold(self, |node, segment| node.get(segment))
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FeatureValue::Number(n) if n.is_finite() => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FeatureValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, FeatureValue>> {
        match self {
            FeatureValue::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[FeatureValue]> {
        match self {
            FeatureValue::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FeatureValue::Null)
    }

    /// Numeric lookup: `self.lookup(path)` as a finite number.
    pub fn number_at(&self, path: &str) -> Option<f64> {
        self.lookup(path).and_then(FeatureValue::as_f64)
    }

    /// String lookup, ignoring empty strings.
    pub fn text_at(&self, path: &str) -> Option<&str> {
        self.lookup(path)
            .and_then(FeatureValue::as_str)
            .filter(|s| !s.is_empty())
    }
}

impl From<serde_json::Value> for FeatureValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => FeatureValue::Null,
            serde_json::Value::Bool(b) => FeatureValue::Bool(b),
            serde_json::Value::Number(n) => n.as_f64().map_or(FeatureValue::Null, FeatureValue::Number),
            serde_json::Value::String(s) => FeatureValue::Text(s),
            serde_json::Value::Array(items) => {
                FeatureValue::List(items.into_iter().map(FeatureValue::from).collect())
            }
            serde_json::Value::Object(map) => FeatureValue::Map(
                map.into_iter()
                    .map(|(k, v)| (k, FeatureValue::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<f64> for FeatureValue {
    fn from(value: f64) -> Self {
        FeatureValue::Number(value)
    }
}

impl From<&str> for FeatureValue {
    fn from(value: &str) -> Self {
        FeatureValue::Text(value.to_string())
    }
}

impl<V: Into<FeatureValue>> FromIterator<(String, V)> for FeatureValue {
    fn from_iter<I: IntoIterator<Item = (String, V)>>(iter: I) -> Self {
        FeatureValue::Map(iter.into_iter().map(|(k, v)| (k, v.into())).collect())
    }
}
