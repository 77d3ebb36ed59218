//! Visage vector crate - similarity index, feature extraction, ingestion and queries.
//!
//! Provides an in-memory record store with JSON persistence, exact (flat) and
//! approximate (IVF) cosine indexes, a feature extractor trait with an ONNX
//! CLIP backend and a mock for testing, the dataset ingestion pipeline, and
//! the query service. [`initialize`] wires them into a [`Handle`].

pub mod collection;
pub mod embedding;
pub mod handle;
pub mod index;
pub mod ivf;
pub mod pipeline;
pub mod search;
pub mod store;

pub use collection::{Collection, CollectionRegistry, ResolvedHit};
pub use embedding::{
    decode_image, extractor_from_config, DynFeatureExtractor, FeatureExtractor, MockExtractor,
    OnnxImageExtractor,
};
pub use handle::{initialize, Handle, HandleInfo};
pub use index::{cosine_similarity, index_from_config, FlatIndex, IndexEngine, SearchHit};
pub use ivf::{IvfConfig, IvfIndex};
pub use pipeline::IngestionPipeline;
pub use search::QueryService;
pub use store::VectorStore;
