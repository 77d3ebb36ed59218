use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// Identifiers and payload
// =============================================================================

/// Stable identifier of a record within a collection.
pub type RecordId = u64;

/// Metadata attached to a record (filename, category label, source path).
///
/// Values are expected to be JSON scalars. A `BTreeMap` keeps the key order
/// stable so persisted files are byte-for-byte reproducible.
pub type Payload = BTreeMap<String, Value>;

/// Well-known payload keys written by the ingestion pipeline.
pub mod payload_keys {
    pub const FILENAME: &str = "filename";
    pub const CATEGORY: &str = "category";
    pub const PATH: &str = "path";
    /// Path below the dataset root, `/`-separated. Used to build image URLs.
    pub const RELATIVE_PATH: &str = "relative_path";
}

// =============================================================================
// Enums
// =============================================================================

/// Similarity metric of a collection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Dot product of L2-normalised vectors.
    #[default]
    Cosine,
}

impl Metric {
    /// Identifier used in persisted files and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Cosine => "cosine",
        }
    }
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Records and results
// =============================================================================

/// A stored embedding with its metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub vector: Vec<f32>,
    #[serde(default)]
    pub payload: Payload,
}

impl Record {
    pub fn new(id: RecordId, vector: Vec<f32>) -> Self {
        Self {
            id,
            vector,
            payload: Payload::new(),
        }
    }

    /// Add a payload field.
    pub fn with_payload(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Dimension of the record's vector.
    pub fn dimension(&self) -> usize {
        self.vector.len()
    }
}

/// A query result as seen by callers of the query service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Match {
    pub id: RecordId,
    /// Similarity under the collection metric, rounded to the configured precision.
    pub score: f64,
    pub payload: Payload,
    /// Public URL of the matched image, when the payload carries a dataset path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

impl Match {
    /// Convenience accessor for a string payload field.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }
}

/// Outcome of one ingestion run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestSummary {
    pub processed_count: usize,
    pub skipped_count: usize,
}
