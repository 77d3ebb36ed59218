//! Dataset ingestion pipeline.
//!
//! The IngestionPipeline walks a dataset directory, turns each image into an
//! embedding vector through a [`DynFeatureExtractor`], and inserts the
//! resulting records into a [`Collection`]. Bad files are skipped and
//! counted; they never abort a run.

use std::path::{Component, Path};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use visage_core::config::IngestConfig;
use visage_core::error::{Result, VisageError};
use visage_core::types::{payload_keys, IngestSummary, Payload, Record, RecordId};

use crate::collection::Collection;
use crate::embedding::{decode_image, DynFeatureExtractor};

/// A dataset file selected for ingestion.
#[derive(Debug, Clone, PartialEq)]
struct DatasetItem {
    path: std::path::PathBuf,
    payload: Payload,
}

/// Outcome of a single dataset item.
enum ItemOutcome {
    Stored,
    Skipped,
}

/// The ingestion pipeline.
///
/// Processes a dataset through:
/// 1. Enumeration (sorted by file name, filtered by extension)
/// 2. Image decoding
/// 3. Feature extraction under a timeout
/// 4. Collection insertion
/// 5. Index build
pub struct IngestionPipeline {
    extractor: Arc<dyn DynFeatureExtractor>,
    config: IngestConfig,
    timeout: Duration,
}

impl IngestionPipeline {
    pub fn new(extractor: Arc<dyn DynFeatureExtractor>, config: IngestConfig) -> Self {
        let timeout = Duration::from_secs(config.extract_timeout_secs.max(1));
        Self {
            extractor,
            config,
            timeout,
        }
    }

    /// Override the per-item extraction timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Ingest every image below `root` into `collection`, then build its index.
    ///
    /// Record ids are assigned sequentially from 0 over the processed items.
    pub async fn ingest(&self, root: &Path, collection: &Collection) -> Result<IngestSummary> {
        if !root.is_dir() {
            return Err(VisageError::InvalidInput(format!(
                "Dataset root is not a directory: {}",
                root.display()
            )));
        }
        let expected = collection.dimension()?;
        if self.extractor.dimensions() != expected {
            return Err(VisageError::DimensionMismatch {
                expected,
                actual: self.extractor.dimensions(),
            });
        }

        info!(root = %root.display(), collection = %collection.name(), "Ingestion started");

        let mut summary = IngestSummary::default();
        let mut next_id: RecordId = 0;

        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable dataset entry");
                    summary.skipped_count += 1;
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(item) = self.select(root, entry.path()) else {
                warn!(path = %entry.path().display(), "Skipping file with unsupported extension");
                summary.skipped_count += 1;
                continue;
            };

            match self.process(item, next_id, collection).await? {
                ItemOutcome::Stored => {
                    next_id += 1;
                    summary.processed_count += 1;
                }
                ItemOutcome::Skipped => summary.skipped_count += 1,
            }
        }

        collection.build_index()?;

        info!(
            collection = %collection.name(),
            processed = summary.processed_count,
            skipped = summary.skipped_count,
            "Ingestion finished"
        );
        Ok(summary)
    }

    /// Build the dataset item for `path`, or `None` if it is not an image.
    fn select(&self, root: &Path, path: &Path) -> Option<DatasetItem> {
        let extension = path.extension()?.to_str()?.to_ascii_lowercase();
        if !self.config.extensions.iter().any(|e| e.eq_ignore_ascii_case(&extension)) {
            return None;
        }
        let relative = path.strip_prefix(root).ok()?;
        let parts: Vec<String> = relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();
        let filename = parts.last()?.clone();

        let mut payload = Payload::new();
        payload.insert(payload_keys::FILENAME.to_string(), Value::from(filename));
        payload.insert(
            payload_keys::PATH.to_string(),
            Value::from(path.to_string_lossy().into_owned()),
        );
        payload.insert(payload_keys::RELATIVE_PATH.to_string(), Value::from(parts.join("/")));
        if parts.len() > 1 {
            let folder = &parts[0];
            let label = self
                .config
                .category_labels
                .get(folder)
                .cloned()
                .unwrap_or_else(|| folder.clone());
            payload.insert(payload_keys::CATEGORY.to_string(), Value::from(label));
        }

        Some(DatasetItem {
            path: path.to_path_buf(),
            payload,
        })
    }

    /// Read, decode, extract and insert one item.
    ///
    /// Per-item failures are logged and reported as skipped. Only collection
    /// errors propagate.
    async fn process(
        &self,
        item: DatasetItem,
        id: RecordId,
        collection: &Collection,
    ) -> Result<ItemOutcome> {
        let bytes = match tokio::fs::read(&item.path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(path = %item.path.display(), error = %e, "Skipping unreadable file");
                return Ok(ItemOutcome::Skipped);
            }
        };

        let image = match decode_image(&bytes) {
            Ok(image) => image,
            Err(e) => {
                warn!(path = %item.path.display(), error = %e, "Skipping undecodable image");
                return Ok(ItemOutcome::Skipped);
            }
        };

        let extraction = self.extractor.extract_boxed(&image);
        let vector = match tokio::time::timeout(self.timeout, extraction).await {
            Ok(Ok(vector)) => vector,
            Ok(Err(e)) => {
                warn!(path = %item.path.display(), error = %e, "Skipping image: extraction failed");
                return Ok(ItemOutcome::Skipped);
            }
            Err(_) => {
                warn!(
                    path = %item.path.display(),
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Skipping image: extraction timed out"
                );
                return Ok(ItemOutcome::Skipped);
            }
        };

        let record = Record {
            id,
            vector,
            payload: item.payload,
        };
        match collection.insert(record) {
            Ok(()) => {
                debug!(id, path = %item.path.display(), "Image ingested");
                Ok(ItemOutcome::Stored)
            }
            // A misbehaving extractor can emit a wrong-sized or non-finite
            // vector for one image; that is a per-item failure.
            Err(e @ (VisageError::DimensionMismatch { .. } | VisageError::InvalidInput(_))) => {
                warn!(path = %item.path.display(), error = %e, "Skipping image: bad vector");
                Ok(ItemOutcome::Skipped)
            }
            Err(e) => Err(e),
        }
    }
}
