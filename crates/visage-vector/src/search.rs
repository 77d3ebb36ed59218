//! Query service turning an uploaded image into ranked matches.
//!
//! QueryService orchestrates the feature extractor (to embed the query image)
//! and the active collection (to find nearest neighbours), then formats the
//! hits: scores rounded, payloads attached, public image URLs derived.

use std::sync::Arc;

use tracing::debug;

use visage_core::config::SearchConfig;
use visage_core::error::{Result, VisageError};
use visage_core::types::{payload_keys, Match, Payload};

use crate::collection::{CollectionRegistry, ResolvedHit};
use crate::embedding::{decode_image, DynFeatureExtractor};

/// Similarity search over the registry's active collection.
///
/// The extractor is optional so a process whose model failed to load can
/// still start; queries then fail with `ServiceUnavailable` instead of
/// `InvalidInput`.
pub struct QueryService {
    extractor: Option<Arc<dyn DynFeatureExtractor>>,
    registry: Arc<CollectionRegistry>,
    config: SearchConfig,
}

impl QueryService {
    pub fn new(
        extractor: Option<Arc<dyn DynFeatureExtractor>>,
        registry: Arc<CollectionRegistry>,
        config: SearchConfig,
    ) -> Self {
        Self {
            extractor,
            registry,
            config,
        }
    }

    /// Top matches for `image_bytes` using the configured default limit.
    pub async fn search(&self, image_bytes: &[u8]) -> Result<Vec<Match>> {
        self.search_with_limit(image_bytes, None).await
    }

    /// Top matches for `image_bytes`.
    ///
    /// `limit` defaults to `default_limit` and is clamped to `max_limit`.
    pub async fn search_with_limit(
        &self,
        image_bytes: &[u8],
        limit: Option<usize>,
    ) -> Result<Vec<Match>> {
        let k = self.resolve_limit(limit)?;
        let image = decode_image(image_bytes)?;

        let extractor = self.extractor.as_ref().ok_or_else(|| {
            VisageError::ServiceUnavailable("Feature extractor is not initialised".to_string())
        })?;
        let collection = self.registry.active()?;

        let vector = extractor.extract_boxed(&image).await?;
        let hits = collection.search(&vector, k)?;
        debug!(
            collection = %collection.name(),
            k,
            hits = hits.len(),
            "Query served"
        );

        let mut matches: Vec<Match> = hits.into_iter().map(|hit| self.to_match(hit)).collect();
        rank_matches(&mut matches);
        Ok(matches)
    }

    fn resolve_limit(&self, limit: Option<usize>) -> Result<usize> {
        match limit {
            Some(0) => Err(VisageError::InvalidInput(
                "Result count must be at least 1".to_string(),
            )),
            Some(k) => Ok(k.min(self.config.max_limit)),
            None => Ok(self.config.default_limit.min(self.config.max_limit)),
        }
    }

    fn to_match(&self, hit: ResolvedHit) -> Match {
        let image_url = image_url(&self.config.public_base_url, &hit.payload);
        Match {
            id: hit.id,
            score: round_score(hit.score, self.config.score_precision),
            payload: hit.payload,
            image_url,
        }
    }
}

/// Order matches by score, highest first, with equal scores by ascending id.
///
/// Rounding can merge scores the index kept apart, so this runs on the
/// rounded values.
pub fn rank_matches(matches: &mut [Match]) {
    matches.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
}

/// Round `score` to `digits` decimal places.
pub fn round_score(score: f64, digits: u32) -> f64 {
    let factor = 10f64.powi(digits.min(15) as i32);
    (score * factor).round() / factor
}

/// Public URL of a record's image, when the payload says where it lives.
pub fn image_url(base_url: &str, payload: &Payload) -> Option<String> {
    let relative = payload.get(payload_keys::RELATIVE_PATH)?.as_str()?;
    if relative.is_empty() {
        return None;
    }
    Some(format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        relative.trim_start_matches('/')
    ))
}
