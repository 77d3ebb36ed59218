use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Result, VisageError};
use crate::types::Metric;

/// Top-level configuration for Visage.
///
/// Loaded from `~/.visage/config.toml` by default. Every section falls back to
/// its defaults when omitted, so an empty file is a valid configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VisageConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub collection: CollectionConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub search: SearchConfig,
}

impl VisageConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: VisageConfig = toml::from_str(&content)?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Reject values that would make the index or query path misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.model.dimension == 0 {
            return Err(VisageError::Config(
                "model.dimension must be at least 1".to_string(),
            ));
        }
        if self.search.default_limit == 0 {
            return Err(VisageError::Config(
                "search.default_limit must be at least 1".to_string(),
            ));
        }
        if self.search.default_limit > self.search.max_limit {
            return Err(VisageError::Config(format!(
                "search.default_limit ({}) exceeds search.max_limit ({})",
                self.search.default_limit, self.search.max_limit
            )));
        }
        if self.index.nlist == 0 || self.index.nprobe == 0 {
            return Err(VisageError::Config(
                "index.nlist and index.nprobe must be at least 1".to_string(),
            ));
        }
        if self.collection.name.trim().is_empty() {
            return Err(VisageError::Config(
                "collection.name must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Directory holding persisted collections.
    pub data_dir: String,
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.visage/data".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl GeneralConfig {
    /// The data directory with a leading `~` expanded to the home directory.
    pub fn resolved_data_dir(&self) -> PathBuf {
        expand_home(&self.data_dir)
    }
}

/// Feature extractor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Extractor backend: "onnx" or "mock".
    pub backend: String,
    /// Directory containing `model.onnx` (CLIP image tower export).
    pub model_dir: String,
    /// Embedding dimension produced by the model.
    pub dimension: usize,
    /// Square input size the model expects, in pixels.
    pub image_size: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            backend: "onnx".to_string(),
            model_dir: "~/.visage/models/clip-vit-b-32".to_string(),
            dimension: 512,
            image_size: 224,
        }
    }
}

impl ModelConfig {
    pub fn resolved_model_dir(&self) -> PathBuf {
        expand_home(&self.model_dir)
    }
}

/// Collection naming and metric.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionConfig {
    /// Alias under which the active collection is published.
    pub name: String,
    /// Similarity metric.
    pub metric: Metric,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            name: "image_posts".to_string(),
            metric: Metric::Cosine,
        }
    }
}

/// Index structure selection and tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Index kind: "flat" (exact) or "ivf" (approximate).
    pub kind: String,
    /// Number of IVF centroids.
    pub nlist: usize,
    /// Number of IVF lists scanned per query.
    pub nprobe: usize,
    /// Maximum k-means iterations when training IVF centroids.
    pub max_iters: usize,
    /// Record count at which index builds normalise vectors on worker threads.
    pub parallel_build_threshold: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            kind: "flat".to_string(),
            nlist: 64,
            nprobe: 8,
            max_iters: 20,
            parallel_build_threshold: 4096,
        }
    }
}

/// Dataset ingestion configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// File extensions (lowercase, without dot) treated as images.
    pub extensions: Vec<String>,
    /// Upper bound on a single feature extraction, in seconds.
    pub extract_timeout_secs: u64,
    /// Maps first-level dataset folder names to category labels.
    pub category_labels: BTreeMap<String, String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        let mut category_labels = BTreeMap::new();
        category_labels.insert("men".to_string(), "Male".to_string());
        category_labels.insert("women".to_string(), "Female".to_string());
        Self {
            extensions: ["jpg", "jpeg", "png", "webp"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            extract_timeout_secs: 30,
            category_labels,
        }
    }
}

/// Query configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Number of matches returned when the caller does not ask for a count.
    pub default_limit: usize,
    /// Upper bound on the requested match count.
    pub max_limit: usize,
    /// Decimal digits kept in returned scores.
    pub score_precision: u32,
    /// Base URL under which dataset images are served.
    pub public_base_url: String,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_limit: 3,
            max_limit: 100,
            score_precision: 4,
            public_base_url: "http://127.0.0.1:8001/static".to_string(),
        }
    }
}

/// Expand `~/` to the home directory.
fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/").or_else(|| path.strip_prefix("~\\")) {
        #[cfg(target_os = "windows")]
        let home = std::env::var("USERPROFILE").unwrap_or_else(|_| ".".to_string());
        #[cfg(not(target_os = "windows"))]
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(rest)
    } else {
        PathBuf::from(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_default_config() {
        let config = VisageConfig::default();
        assert_eq!(config.general.data_dir, "~/.visage/data");
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.model.backend, "onnx");
        assert_eq!(config.model.dimension, 512);
        assert_eq!(config.model.image_size, 224);
        assert_eq!(config.collection.name, "image_posts");
        assert_eq!(config.collection.metric, Metric::Cosine);
        assert_eq!(config.index.kind, "flat");
        assert_eq!(config.search.default_limit, 3);
        assert_eq!(config.search.score_precision, 4);
        assert_eq!(config.ingest.extensions, vec!["jpg", "jpeg", "png", "webp"]);
        assert_eq!(
            config.ingest.category_labels.get("men").map(String::as_str),
            Some("Male")
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_valid_config() {
        let content = r#"
[general]
data_dir = "/custom/data"
log_level = "debug"

[model]
backend = "mock"
dimension = 64

[index]
kind = "ivf"
nlist = 16
nprobe = 4

[ingest.category_labels]
cats = "Cat"

[search]
default_limit = 5
public_base_url = "https://cdn.example.com/faces"
"#;
        let file = create_temp_config(content);
        let config = VisageConfig::load(file.path()).unwrap();
        assert_eq!(config.general.data_dir, "/custom/data");
        assert_eq!(config.general.log_level, "debug");
        assert_eq!(config.model.backend, "mock");
        assert_eq!(config.model.dimension, 64);
        assert_eq!(config.model.image_size, 224);
        assert_eq!(config.index.kind, "ivf");
        assert_eq!(config.index.nlist, 16);
        assert_eq!(config.index.nprobe, 4);
        assert_eq!(config.index.max_iters, 20);
        assert_eq!(config.ingest.category_labels.len(), 1);
        assert_eq!(config.search.default_limit, 5);
        assert_eq!(config.search.max_limit, 100);
        assert_eq!(config.search.public_base_url, "https://cdn.example.com/faces");
    }

    #[test]
    fn test_empty_toml_uses_all_defaults() {
        let file = create_temp_config("");
        let config = VisageConfig::load(file.path()).unwrap();
        assert_eq!(config.general.data_dir, "~/.visage/data");
        assert_eq!(config.collection.name, "image_posts");
        assert_eq!(config.index.parallel_build_threshold, 4096);
    }

    #[test]
    fn test_load_invalid_toml() {
        let file = create_temp_config("this is {{ not valid TOML");
        let result = VisageConfig::load(file.path());
        assert!(matches!(result, Err(VisageError::Config(_))));
    }

    #[test]
    fn test_unknown_metric_rejected() {
        let file = create_temp_config("[collection]\nmetric = \"manhattan\"\n");
        assert!(VisageConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = VisageConfig::load_or_default(Path::new("/nonexistent/config.toml"));
        assert_eq!(config.general.data_dir, "~/.visage/data");
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("config.toml");

        let mut config = VisageConfig::default();
        config.index.kind = "ivf".to_string();
        config.save(&path).unwrap();

        let reloaded = VisageConfig::load(&path).unwrap();
        assert_eq!(reloaded.index.kind, "ivf");
        assert_eq!(reloaded.model.dimension, config.model.dimension);
        assert_eq!(reloaded.ingest.category_labels, config.ingest.category_labels);
        assert_eq!(reloaded.collection.metric, Metric::Cosine);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = VisageConfig::default();
        config.model.dimension = 0;
        assert!(matches!(config.validate(), Err(VisageError::Config(_))));

        let mut config = VisageConfig::default();
        config.search.default_limit = 0;
        assert!(config.validate().is_err());

        let mut config = VisageConfig::default();
        config.search.default_limit = 500;
        assert!(config.validate().is_err());

        let mut config = VisageConfig::default();
        config.index.nprobe = 0;
        assert!(config.validate().is_err());

        let mut config = VisageConfig::default();
        config.collection.name = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home("/abs/path"), PathBuf::from("/abs/path"));
        let expanded = expand_home("~/data");
        assert!(expanded.ends_with("data"));
        assert!(!expanded.to_string_lossy().starts_with('~'));
    }
}
