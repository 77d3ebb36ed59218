//! Collections: a store and its index kept consistent under one lock.
//!
//! A [`Collection`] pairs a [`VectorStore`] with an [`IndexEngine`] behind a
//! single `RwLock`. Queries take the read lock and run concurrently; inserts,
//! deletes and index rebuilds take the write lock for their whole duration,
//! so readers never see the store and index disagree.
//!
//! A [`CollectionRegistry`] publishes the active collection under an alias.
//! Re-ingestion builds a fresh collection on the side and swaps the pointer,
//! so there is never a moment without a valid collection to query.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info};

use visage_core::config::IndexConfig;
use visage_core::error::{Result, VisageError};
use visage_core::types::{Metric, Payload, Record, RecordId};

use crate::index::{index_from_config, IndexEngine};
use crate::store::VectorStore;

/// A search hit with its payload resolved from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedHit {
    pub id: RecordId,
    pub score: f64,
    pub payload: Payload,
}

#[derive(Debug)]
struct CollectionInner {
    store: VectorStore,
    index: Box<dyn IndexEngine>,
}

/// A named set of records plus the index over them.
#[derive(Debug)]
pub struct Collection {
    name: String,
    inner: RwLock<CollectionInner>,
}

impl Collection {
    /// Create an empty collection.
    pub fn empty(
        name: impl Into<String>,
        dimension: usize,
        metric: Metric,
        index_config: &IndexConfig,
    ) -> Result<Self> {
        let store = VectorStore::new(dimension, metric)?;
        let index = index_from_config(index_config, dimension)?;
        Self::from_parts(name, store, index)
    }

    /// Wrap an existing store, building `index` over its records.
    pub fn from_parts(
        name: impl Into<String>,
        store: VectorStore,
        mut index: Box<dyn IndexEngine>,
    ) -> Result<Self> {
        if index.dimension() != store.dimension() {
            return Err(VisageError::DimensionMismatch {
                expected: store.dimension(),
                actual: index.dimension(),
            });
        }
        index.build(&mut store.all())?;
        Ok(Self {
            name: name.into(),
            inner: RwLock::new(CollectionInner { store, index }),
        })
    }

    /// Load a persisted store and index it.
    pub fn load(name: impl Into<String>, path: &Path, index_config: &IndexConfig) -> Result<Self> {
        let store = VectorStore::load(path)?;
        let index = index_from_config(index_config, store.dimension())?;
        Self::from_parts(name, store, index)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, CollectionInner>> {
        self.inner
            .read()
            .map_err(|e| VisageError::Storage(format!("Lock poisoned: {}", e)))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, CollectionInner>> {
        self.inner
            .write()
            .map_err(|e| VisageError::Storage(format!("Lock poisoned: {}", e)))
    }

    /// Insert a record into the store and the index.
    ///
    /// Either both accept the record or neither keeps it.
    pub fn insert(&self, record: Record) -> Result<()> {
        let mut inner = self.write()?;
        let id = record.id;
        inner.store.insert(record)?;

        let CollectionInner { store, index } = &mut *inner;
        let added = store.get(id).and_then(|stored| index.add(stored));
        if let Err(e) = added {
            store.delete(id)?;
            return Err(e);
        }
        Ok(())
    }

    /// Remove a record from the store and drop its index entry.
    pub fn delete(&self, id: RecordId) -> Result<Record> {
        let mut inner = self.write()?;
        let record = inner.store.delete(id)?;
        inner.index.remove(id)?;
        debug!(collection = %self.name, id, "Record deleted");
        Ok(record)
    }

    /// Fetch a copy of a record.
    pub fn get(&self, id: RecordId) -> Result<Record> {
        Ok(self.read()?.store.get(id)?.clone())
    }

    /// Rebuild the index from the store's records.
    pub fn build_index(&self) -> Result<()> {
        let mut inner = self.write()?;
        let CollectionInner { store, index } = &mut *inner;
        index.build(&mut store.all())?;
        info!(
            collection = %self.name,
            kind = index.kind(),
            records = index.len(),
            "Index rebuilt"
        );
        Ok(())
    }

    /// Top-`k` records for `query`, payloads resolved.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<ResolvedHit>> {
        let inner = self.read()?;
        let hits = inner.index.search(query, k)?;
        hits.into_iter()
            .map(|hit| {
                let record = inner.store.get(hit.id)?;
                Ok(ResolvedHit {
                    id: hit.id,
                    score: hit.score,
                    payload: record.payload.clone(),
                })
            })
            .collect()
    }

    pub fn persist(&self, path: &Path) -> Result<()> {
        self.read()?.store.persist(path)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.read()?.store.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn dimension(&self) -> Result<usize> {
        Ok(self.read()?.store.dimension())
    }

    pub fn metric(&self) -> Result<Metric> {
        Ok(self.read()?.store.metric())
    }

    pub fn index_kind(&self) -> Result<&'static str> {
        Ok(self.read()?.index.kind())
    }
}

/// Publishes the active collection under a stable alias.
#[derive(Debug)]
pub struct CollectionRegistry {
    alias: String,
    data_dir: Option<PathBuf>,
    active: RwLock<Option<Arc<Collection>>>,
}

impl CollectionRegistry {
    /// A registry that persists swapped-in collections under `data_dir`.
    pub fn new(alias: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            alias: alias.into(),
            data_dir: Some(data_dir.into()),
            active: RwLock::new(None),
        }
    }

    /// A registry that never touches the filesystem.
    pub fn in_memory(alias: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            data_dir: None,
            active: RwLock::new(None),
        }
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Where the active collection is persisted, if anywhere.
    pub fn alias_path(&self) -> Option<PathBuf> {
        self.data_dir
            .as_ref()
            .map(|dir| dir.join("collections").join(format!("{}.json", self.alias)))
    }

    /// The currently active collection.
    pub fn active(&self) -> Result<Arc<Collection>> {
        self.active
            .read()
            .map_err(|e| VisageError::Storage(format!("Lock poisoned: {}", e)))?
            .clone()
            .ok_or_else(|| {
                VisageError::ServiceUnavailable(format!(
                    "No active collection for '{}'; run ingestion first",
                    self.alias
                ))
            })
    }

    /// Load the persisted collection for this alias, if one exists.
    ///
    /// Returns `Ok(false)` when nothing has been persisted yet.
    pub fn load_persisted(&self, index_config: &IndexConfig) -> Result<bool> {
        let Some(path) = self.alias_path() else {
            return Ok(false);
        };
        if !path.exists() {
            return Ok(false);
        }
        let collection = Collection::load(self.alias.clone(), &path, index_config)?;
        self.set_active(Arc::new(collection))?;
        Ok(true)
    }

    /// Persist `collection` under the alias and make it the active one.
    ///
    /// The previous collection is returned; readers still holding it finish
    /// against it unaffected.
    pub fn swap(&self, collection: Arc<Collection>) -> Result<Option<Arc<Collection>>> {
        if let Some(path) = self.alias_path() {
            collection.persist(&path)?;
        }
        let previous = self.set_active(Arc::clone(&collection))?;
        info!(
            alias = %self.alias,
            collection = %collection.name(),
            records = collection.len()?,
            "Active collection swapped"
        );
        Ok(previous)
    }

    /// Drop the active collection pointer.
    pub fn clear(&self) -> Result<Option<Arc<Collection>>> {
        let mut active = self
            .active
            .write()
            .map_err(|e| VisageError::Storage(format!("Lock poisoned: {}", e)))?;
        Ok(active.take())
    }

    fn set_active(&self, collection: Arc<Collection>) -> Result<Option<Arc<Collection>>> {
        let mut active = self
            .active
            .write()
            .map_err(|e| VisageError::Storage(format!("Lock poisoned: {}", e)))?;
        Ok(active.replace(collection))
    }
}
