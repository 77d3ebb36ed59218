//! Process-wide context: extractor, active collection, query service.
//!
//! [`initialize`] builds a [`Handle`] from configuration. Every operation goes
//! through the handle, and [`Handle::shutdown`] tears it down.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use visage_core::config::VisageConfig;
use visage_core::error::{Result, VisageError};
use visage_core::types::{IngestSummary, Match};

use crate::collection::{Collection, CollectionRegistry};
use crate::embedding::{extractor_from_config, DynFeatureExtractor};
use crate::pipeline::IngestionPipeline;
use crate::search::QueryService;

/// Snapshot of the handle's state, as reported by `visage info`.
#[derive(Debug, Clone, Serialize)]
pub struct HandleInfo {
    pub alias: String,
    pub collection: Option<String>,
    pub records: usize,
    pub dimension: usize,
    pub metric: String,
    pub index_kind: String,
    pub model_backend: String,
    pub extractor_ready: bool,
    pub store_path: Option<String>,
}

/// Owned context passed to ingestion and query operations.
pub struct Handle {
    config: VisageConfig,
    extractor: Option<Arc<dyn DynFeatureExtractor>>,
    registry: Arc<CollectionRegistry>,
    query: QueryService,
}

/// Build a handle from configuration.
///
/// An extractor whose model files are missing does not stop startup; queries
/// report `ServiceUnavailable` until it is fixed. A persisted collection for
/// the configured alias is loaded when present.
pub fn initialize(config: VisageConfig) -> Result<Handle> {
    config.validate()?;
    let registry = Arc::new(CollectionRegistry::new(
        config.collection.name.clone(),
        config.general.resolved_data_dir(),
    ));
    let extractor = match extractor_from_config(&config.model) {
        Ok(extractor) => Some(extractor),
        Err(VisageError::ServiceUnavailable(reason)) => {
            warn!(backend = %config.model.backend, %reason, "Feature extractor unavailable");
            None
        }
        Err(e) => return Err(e),
    };
    Handle::assemble(config, extractor, registry)
}

impl Handle {
    /// Build a handle around an explicit extractor and registry.
    pub fn with_parts(
        config: VisageConfig,
        extractor: Arc<dyn DynFeatureExtractor>,
        registry: CollectionRegistry,
    ) -> Result<Self> {
        config.validate()?;
        Self::assemble(config, Some(extractor), Arc::new(registry))
    }

    fn assemble(
        config: VisageConfig,
        extractor: Option<Arc<dyn DynFeatureExtractor>>,
        registry: Arc<CollectionRegistry>,
    ) -> Result<Self> {
        if let Some(extractor) = &extractor {
            if extractor.dimensions() != config.model.dimension {
                return Err(VisageError::Config(format!(
                    "Extractor produces {} dimensions but model.dimension is {}",
                    extractor.dimensions(),
                    config.model.dimension
                )));
            }
        }

        if registry.load_persisted(&config.index)? {
            let active = registry.active()?;
            if active.dimension()? != config.model.dimension {
                return Err(VisageError::DimensionMismatch {
                    expected: config.model.dimension,
                    actual: active.dimension()?,
                });
            }
            info!(
                alias = %registry.alias(),
                records = active.len()?,
                "Persisted collection loaded"
            );
        }

        let query = QueryService::new(
            extractor.clone(),
            Arc::clone(&registry),
            config.search.clone(),
        );
        info!(
            alias = %registry.alias(),
            backend = %config.model.backend,
            index = %config.index.kind,
            "Visage initialised"
        );
        Ok(Self {
            config,
            extractor,
            registry,
            query,
        })
    }

    pub fn config(&self) -> &VisageConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<CollectionRegistry> {
        &self.registry
    }

    /// Ingest a dataset into a fresh collection and make it the active one.
    ///
    /// The previous collection keeps serving queries until the swap.
    pub async fn ingest(&self, dataset_root: &Path) -> Result<IngestSummary> {
        let extractor = self.extractor.clone().ok_or_else(|| {
            VisageError::ServiceUnavailable("Feature extractor is not initialised".to_string())
        })?;

        let alias = self.registry.alias();
        let generation = format!("{}-{}", alias, Uuid::new_v4().simple());
        let collection = Collection::empty(
            generation,
            self.config.model.dimension,
            self.config.collection.metric,
            &self.config.index,
        )?;

        let pipeline = IngestionPipeline::new(extractor, self.config.ingest.clone());
        let summary = pipeline.ingest(dataset_root, &collection).await?;
        self.registry.swap(Arc::new(collection))?;
        Ok(summary)
    }

    /// Top matches for an uploaded image using the default limit.
    pub async fn search(&self, image_bytes: &[u8]) -> Result<Vec<Match>> {
        self.query.search(image_bytes).await
    }

    pub async fn search_with_limit(
        &self,
        image_bytes: &[u8],
        limit: Option<usize>,
    ) -> Result<Vec<Match>> {
        self.query.search_with_limit(image_bytes, limit).await
    }

    pub fn info(&self) -> Result<HandleInfo> {
        let active = match self.registry.active() {
            Ok(collection) => Some(collection),
            Err(VisageError::ServiceUnavailable(_)) => None,
            Err(e) => return Err(e),
        };
        let (collection, records, index_kind) = match &active {
            Some(c) => (Some(c.name().to_string()), c.len()?, c.index_kind()?.to_string()),
            None => (None, 0, self.config.index.kind.clone()),
        };
        Ok(HandleInfo {
            alias: self.registry.alias().to_string(),
            collection,
            records,
            dimension: self.config.model.dimension,
            metric: self.config.collection.metric.to_string(),
            index_kind,
            model_backend: self.config.model.backend.clone(),
            extractor_ready: self.extractor.is_some(),
            store_path: self
                .registry
                .alias_path()
                .map(|p| p.to_string_lossy().into_owned()),
        })
    }

    /// Release the active collection and the extractor.
    pub fn shutdown(self) -> Result<()> {
        let alias = self.registry.alias().to_string();
        self.registry.clear()?;
        drop(self.query);
        drop(self.extractor);
        info!(alias = %alias, "Visage shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::MockExtractor;

    fn mock_config(data_dir: &Path) -> VisageConfig {
        let mut config = VisageConfig::default();
        config.general.data_dir = data_dir.to_string_lossy().into_owned();
        config.model.backend = "mock".to_string();
        config.model.dimension = 16;
        config
    }

    #[test]
    fn test_initialize_mock_without_collection() {
        let dir = tempfile::tempdir().unwrap();
        let handle = initialize(mock_config(dir.path())).unwrap();
        let info = handle.info().unwrap();
        assert_eq!(info.alias, "image_posts");
        assert!(info.collection.is_none());
        assert!(info.extractor_ready);
        assert_eq!(info.records, 0);
        handle.shutdown().unwrap();
    }

    #[test]
    fn test_initialize_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = mock_config(dir.path());
        config.search.default_limit = 0;
        assert!(matches!(initialize(config), Err(VisageError::Config(_))));
    }

    #[tokio::test]
    async fn test_missing_onnx_model_degrades_to_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = mock_config(dir.path());
        config.model.backend = "onnx".to_string();
        config.model.model_dir = dir.path().join("no-model").to_string_lossy().into_owned();

        let handle = initialize(config).unwrap();
        assert!(!handle.info().unwrap().extractor_ready);
        let err = handle.ingest(dir.path()).await.unwrap_err();
        assert!(matches!(err, VisageError::ServiceUnavailable(_)));
    }

    #[test]
    fn test_extractor_dimension_must_match_config() {
        let dir = tempfile::tempdir().unwrap();
        let result = Handle::with_parts(
            mock_config(dir.path()),
            Arc::new(MockExtractor::new(8)),
            CollectionRegistry::in_memory("image_posts"),
        );
        assert!(matches!(result, Err(VisageError::Config(_))));
    }
}
