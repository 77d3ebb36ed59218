//! Feature extractor trait and implementations.
//!
//! - `OnnxImageExtractor` runs the image tower of a CLIP model (e.g.
//!   clip-ViT-B-32) exported to ONNX. This is the production backend.
//! - `MockExtractor` provides deterministic hash-based vectors for testing.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::{Arc, Mutex};

use image::imageops::FilterType;
use image::DynamicImage;
use ort::session::Session;
use ort::value::TensorRef;
use tracing::info;

use visage_core::config::ModelConfig;
use visage_core::error::{Result, VisageError};

use crate::index::normalize;

/// Service turning a decoded image into an embedding vector.
///
/// Implementations behave as pure functions of the image: the same pixels
/// always produce the same vector. Used for both ingestion and queries.
pub trait FeatureExtractor: Send + Sync {
    /// Generate an embedding vector for the given image.
    fn extract(
        &self,
        image: &DynamicImage,
    ) -> impl std::future::Future<Output = Result<Vec<f32>>> + Send;

    /// Return the dimensionality of vectors produced by this extractor.
    fn dimensions(&self) -> usize;
}

/// Object-safe version of [`FeatureExtractor`] for dynamic dispatch.
///
/// `FeatureExtractor::extract` returns `impl Future`, which is not
/// object-safe. This trait boxes the future so an extractor chosen at runtime
/// can live behind `Arc<dyn DynFeatureExtractor>`. Every `FeatureExtractor`
/// gets it through the blanket impl below.
pub trait DynFeatureExtractor: Send + Sync {
    /// Generate an embedding vector for the given image (boxed future).
    fn extract_boxed<'a>(
        &'a self,
        image: &'a DynamicImage,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Vec<f32>>> + Send + 'a>>;

    /// Return the dimensionality of vectors produced by this extractor.
    fn dimensions(&self) -> usize;
}

impl<T: FeatureExtractor> DynFeatureExtractor for T {
    fn extract_boxed<'a>(
        &'a self,
        image: &'a DynamicImage,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Vec<f32>>> + Send + 'a>> {
        Box::pin(self.extract(image))
    }

    fn dimensions(&self) -> usize {
        FeatureExtractor::dimensions(self)
    }
}

/// Construct the extractor selected by `config.backend`.
pub fn extractor_from_config(config: &ModelConfig) -> Result<Arc<dyn DynFeatureExtractor>> {
    match config.backend.as_str() {
        "onnx" => Ok(Arc::new(OnnxImageExtractor::from_directory(
            &config.resolved_model_dir(),
            config.dimension,
            config.image_size,
        )?)),
        "mock" => Ok(Arc::new(MockExtractor::new(config.dimension))),
        other => Err(VisageError::Config(format!(
            "Unknown model backend '{}': expected 'onnx' or 'mock'",
            other
        ))),
    }
}

/// Decode raw bytes into an image, rejecting anything that is not one.
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage> {
    if bytes.is_empty() {
        return Err(VisageError::InvalidInput("Empty image data".to_string()));
    }
    image::load_from_memory(bytes)
        .map_err(|e| VisageError::InvalidInput(format!("Cannot decode image: {}", e)))
}

// ---------------------------------------------------------------------------
// OnnxImageExtractor - CLIP image tower via ONNX Runtime
// ---------------------------------------------------------------------------

/// CLIP per-channel normalisation constants.
const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
const CLIP_STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_1];

/// ONNX Runtime-backed extractor using a CLIP vision model.
///
/// Expects a model directory containing `model.onnx`, an export of the image
/// tower taking `[1, 3, H, W]` f32 pixels and producing `[1, D]` embeddings.
pub struct OnnxImageExtractor {
    session: Arc<Mutex<Session>>,
    dimensions: usize,
    image_size: u32,
}

// ort::Session is Send + Sync internally (uses Arc<SharedSessionInner>).
unsafe impl Send for OnnxImageExtractor {}
unsafe impl Sync for OnnxImageExtractor {}

impl std::fmt::Debug for OnnxImageExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnnxImageExtractor")
            .field("dimensions", &self.dimensions)
            .field("image_size", &self.image_size)
            .finish()
    }
}

impl OnnxImageExtractor {
    /// Load `model.onnx` from the given directory.
    pub fn from_directory(model_dir: &Path, dimensions: usize, image_size: u32) -> Result<Self> {
        Self::from_file(&model_dir.join("model.onnx"), dimensions, image_size)
    }

    /// Load from an explicit model file path.
    pub fn from_file(model_path: &Path, dimensions: usize, image_size: u32) -> Result<Self> {
        if !model_path.exists() {
            return Err(VisageError::ServiceUnavailable(format!(
                "ONNX model not found at {}",
                model_path.display()
            )));
        }

        let session = Session::builder()
            .map_err(|e| VisageError::Extraction(format!("ONNX session builder: {}", e)))?
            .with_intra_threads(1)
            .map_err(|e| VisageError::Extraction(format!("ONNX set threads: {}", e)))?
            .commit_from_file(model_path)
            .map_err(|e| VisageError::Extraction(format!("ONNX load model: {}", e)))?;

        info!(
            model = %model_path.display(),
            dimensions,
            image_size,
            "Loaded ONNX image model"
        );

        Ok(Self {
            session: Arc::new(Mutex::new(session)),
            dimensions,
            image_size,
        })
    }

    /// Resize, convert to RGB and normalise into an NCHW pixel buffer.
    fn preprocess(image: &DynamicImage, size: u32) -> Vec<f32> {
        let rgb = image
            .resize_exact(size, size, FilterType::Triangle)
            .to_rgb8();
        let plane = (size as usize) * (size as usize);
        let mut pixels = vec![0.0f32; 3 * plane];

        for (x, y, pixel) in rgb.enumerate_pixels() {
            let idx = (y as usize) * (size as usize) + (x as usize);
            for c in 0..3 {
                let value = pixel[c] as f32 / 255.0;
                pixels[c * plane + idx] = (value - CLIP_MEAN[c]) / CLIP_STD[c];
            }
        }
        pixels
    }

    fn extract_sync(
        session: &Mutex<Session>,
        pixels: Vec<f32>,
        size: u32,
        dimensions: usize,
    ) -> Result<Vec<f32>> {
        let size = size as usize;
        let input = ndarray::Array4::from_shape_vec((1, 3, size, size), pixels)
            .map_err(|e| VisageError::Extraction(format!("pixel_values array: {}", e)))?;
        let input_ref = TensorRef::from_array_view(&input)
            .map_err(|e| VisageError::Extraction(format!("TensorRef pixel_values: {}", e)))?;

        let mut session = session
            .lock()
            .map_err(|e| VisageError::Extraction(format!("Session lock poisoned: {}", e)))?;
        let outputs = session
            .run(ort::inputs![input_ref])
            .map_err(|e| VisageError::Extraction(format!("ONNX inference failed: {}", e)))?;

        // ort 2.0 try_extract_tensor returns (&Shape, &[f32]).
        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| VisageError::Extraction(format!("Extract embeddings: {}", e)))?;

        if data.len() != dimensions {
            return Err(VisageError::Extraction(format!(
                "Model output shape {:?} does not match configured dimension {}",
                shape.iter().copied().collect::<Vec<i64>>(),
                dimensions
            )));
        }

        Ok(normalize(data))
    }
}

impl FeatureExtractor for OnnxImageExtractor {
    async fn extract(&self, image: &DynamicImage) -> Result<Vec<f32>> {
        let image = image.clone();
        let session = Arc::clone(&self.session);
        let size = self.image_size;
        let dims = self.dimensions;

        // Resizing and inference are CPU-bound; run both on a blocking thread.
        run_blocking(move || {
            let pixels = Self::preprocess(&image, size);
            Self::extract_sync(&session, pixels, size, dims)
        })
        .await
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Run CPU-bound extraction work on tokio's blocking pool.
///
/// The returned future yields immediately, so a caller's timeout can fire
/// while the work is still running.
async fn run_blocking<F>(work: F) -> Result<Vec<f32>>
where
    F: FnOnce() -> Result<Vec<f32>> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| VisageError::Extraction(format!("Extraction task panicked: {}", e)))?
}

// ---------------------------------------------------------------------------
// MockExtractor - deterministic hash-based vectors for testing
// ---------------------------------------------------------------------------

/// Mock extractor returning deterministic unit vectors.
///
/// The output is derived from a hash of the image's dimensions and pixels, so
/// identical images always produce identical vectors. This allows testing
/// ingestion and search without a real model.
#[derive(Debug, Clone)]
pub struct MockExtractor {
    dimensions: usize,
}

impl MockExtractor {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }

    fn hash_to_vector(&self, image: &DynamicImage) -> Vec<f32> {
        let rgb = image.to_rgb8();
        let mut base = DefaultHasher::new();
        rgb.dimensions().hash(&mut base);
        rgb.as_raw().hash(&mut base);
        let seed = base.finish();

        let raw: Vec<f32> = (0..self.dimensions)
            .map(|i| {
                let mut hasher = DefaultHasher::new();
                seed.hash(&mut hasher);
                i.hash(&mut hasher);
                let h = hasher.finish();
                (((h as f64) / (u64::MAX as f64)) * 2.0 - 1.0) as f32
            })
            .collect();
        normalize(&raw)
    }
}

impl Default for MockExtractor {
    fn default() -> Self {
        Self::new(512)
    }
}

impl FeatureExtractor for MockExtractor {
    async fn extract(&self, image: &DynamicImage) -> Result<Vec<f32>> {
        if image.width() == 0 || image.height() == 0 {
            return Err(VisageError::Extraction("Image has no pixels".to_string()));
        }
        Ok(self.hash_to_vector(image))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}
