//! Record storage with insertion-ordered iteration and JSON persistence.
//!
//! The store is the source of truth for a collection: indexes are derived
//! from [`VectorStore::all`] and can always be rebuilt from it.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use visage_core::error::{Result, VisageError};
use visage_core::types::{Metric, Record, RecordId};

use crate::index::{check_dimension, check_finite};

/// Identifies Visage store files.
pub const STORE_FORMAT: &str = "visage-store";

/// Current on-disk format version.
pub const STORE_FORMAT_VERSION: u32 = 1;

/// Owns the records of one collection.
#[derive(Debug, Clone)]
pub struct VectorStore {
    dimension: usize,
    metric: Metric,
    /// Records keyed by insertion sequence number.
    records: BTreeMap<u64, Record>,
    /// Record id to insertion sequence number.
    sequence: HashMap<RecordId, u64>,
    next_seq: u64,
}

#[derive(Serialize)]
struct StoreFileRef<'a> {
    format: &'a str,
    format_version: u32,
    dimension: usize,
    metric: Metric,
    created_at: DateTime<Utc>,
    records: Vec<&'a Record>,
}

#[derive(Deserialize)]
struct StoreFile {
    format: String,
    format_version: u32,
    dimension: usize,
    metric: String,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    records: Vec<Record>,
}

impl VectorStore {
    /// Create an empty store for vectors of `dimension` components.
    pub fn new(dimension: usize, metric: Metric) -> Result<Self> {
        if dimension == 0 {
            return Err(VisageError::Config(
                "Vector dimension must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            dimension,
            metric,
            records: BTreeMap::new(),
            sequence: HashMap::new(),
            next_seq: 0,
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, id: RecordId) -> bool {
        self.sequence.contains_key(&id)
    }

    /// Insert a new record.
    ///
    /// Fails without modifying the store if the id is taken or the vector has
    /// the wrong dimension.
    pub fn insert(&mut self, record: Record) -> Result<()> {
        check_dimension(self.dimension, record.vector.len())?;
        check_finite(&record.vector)?;
        if self.sequence.contains_key(&record.id) {
            return Err(VisageError::DuplicateId(record.id));
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.sequence.insert(record.id, seq);
        self.records.insert(seq, record);
        Ok(())
    }

    /// Remove and return a record.
    pub fn delete(&mut self, id: RecordId) -> Result<Record> {
        let seq = self.sequence.remove(&id).ok_or(VisageError::NotFound(id))?;
        self.records
            .remove(&seq)
            .ok_or_else(|| VisageError::Storage(format!("Sequence entry missing for id {}", id)))
    }

    pub fn get(&self, id: RecordId) -> Result<&Record> {
        self.sequence
            .get(&id)
            .and_then(|seq| self.records.get(seq))
            .ok_or(VisageError::NotFound(id))
    }

    /// Iterate records in insertion order.
    ///
    /// Each call starts a fresh pass; the iterator is lazy and `Clone`.
    pub fn all(&self) -> impl Iterator<Item = &Record> + Clone + '_ {
        self.records.values()
    }

    /// Write the full record set to `path`.
    ///
    /// The file is written next to `path` under a temporary name and renamed
    /// into place, so readers only ever see a complete file.
    pub fn persist(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let tmp = temp_path(path);
        let file = StoreFileRef {
            format: STORE_FORMAT,
            format_version: STORE_FORMAT_VERSION,
            dimension: self.dimension,
            metric: self.metric,
            created_at: Utc::now(),
            records: self.all().collect(),
        };

        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            serde_json::to_writer(&mut writer, &file)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        std::fs::rename(&tmp, path)?;

        info!(
            path = %path.display(),
            records = self.len(),
            dimension = self.dimension,
            "Vector store persisted"
        );
        Ok(())
    }

    /// Read a store previously written by [`VectorStore::persist`].
    ///
    /// Any schema or content problem yields `CorruptStore`; nothing is
    /// returned unless every record loaded cleanly.
    pub fn load(path: &Path) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let file: StoreFile = serde_json::from_reader(reader)
            .map_err(|e| corrupt(path, format!("unreadable store file: {}", e)))?;

        if file.format != STORE_FORMAT {
            return Err(corrupt(path, format!("unexpected format '{}'", file.format)));
        }
        if file.format_version != STORE_FORMAT_VERSION {
            return Err(corrupt(
                path,
                format!(
                    "unsupported format version {} (expected {})",
                    file.format_version, STORE_FORMAT_VERSION
                ),
            ));
        }
        let metric = match file.metric.as_str() {
            "cosine" => Metric::Cosine,
            other => return Err(corrupt(path, format!("unknown metric '{}'", other))),
        };

        let mut store = VectorStore::new(file.dimension, metric)
            .map_err(|e| corrupt(path, e.to_string()))?;
        for record in file.records {
            let id = record.id;
            store
                .insert(record)
                .map_err(|e| corrupt(path, format!("record {}: {}", id, e)))?;
        }

        debug!(created_at = ?file.created_at, "Store file header accepted");
        info!(
            path = %path.display(),
            records = store.len(),
            dimension = store.dimension,
            "Vector store loaded"
        );
        Ok(store)
    }
}

fn corrupt(path: &Path, reason: String) -> VisageError {
    VisageError::CorruptStore(format!("{}: {}", path.display(), reason))
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
