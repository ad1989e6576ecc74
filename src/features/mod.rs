//! Loosely structured feature trees produced by extraction engines.

mod value;

pub use value::FeatureValue;
