//! Inverted-file (IVF) approximate index.
//!
//! Vectors are bucketed by their nearest coarse centroid, trained with
//! spherical k-means over the normalised vectors. A query scans only the
//! `nprobe` buckets whose centroids are closest to it. With `nprobe >= nlist`
//! every bucket is scanned and results equal those of [`FlatIndex`].
//!
//! Centroid initialisation is deterministic (evenly spaced picks over the
//! records ordered by id), so rebuilding from the same records reproduces the
//! same partitioning and the same query results.
//!
//! [`FlatIndex`]: crate::index::FlatIndex

use std::collections::HashMap;

use rayon::prelude::*;

use visage_core::error::{Result, VisageError};
use visage_core::types::{Record, RecordId};

use crate::index::{
    check_dimension, check_finite, collect_checked, dot, normalize, normalize_all,
    swap_remove_row, IndexEngine, SearchHit, TopK,
};

/// Tuning for the coarse quantizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IvfConfig {
    /// Number of centroids (capped at the number of records when built).
    pub nlist: usize,
    /// Number of buckets scanned per query.
    pub nprobe: usize,
    /// Maximum Lloyd iterations.
    pub max_iters: usize,
}

impl IvfConfig {
    pub fn new(nlist: usize, nprobe: usize) -> Self {
        Self {
            nlist: nlist.max(1),
            nprobe: nprobe.max(1),
            max_iters: 20,
        }
    }

    pub fn with_max_iters(mut self, iters: usize) -> Self {
        self.max_iters = iters;
        self
    }
}

/// One bucket: ids and their normalised vectors, row-major.
#[derive(Debug, Clone, Default)]
struct InvertedList {
    ids: Vec<RecordId>,
    vectors: Vec<f32>,
}

/// Approximate index over spherical k-means buckets.
#[derive(Debug, Clone)]
pub struct IvfIndex {
    dimension: usize,
    config: IvfConfig,
    parallel_threshold: usize,
    /// Row-major `lists.len() × dimension` buffer of unit centroids.
    centroids: Vec<f32>,
    lists: Vec<InvertedList>,
    /// Bucket holding each record.
    locations: HashMap<RecordId, usize>,
}

impl IvfIndex {
    pub fn new(dimension: usize, config: IvfConfig) -> Self {
        Self {
            dimension,
            config,
            parallel_threshold: usize::MAX,
            centroids: Vec::new(),
            lists: Vec::new(),
            locations: HashMap::new(),
        }
    }

    /// Normalise on worker threads once a build reaches `threshold` records.
    pub fn with_parallel_threshold(mut self, threshold: usize) -> Self {
        self.parallel_threshold = if threshold == 0 { usize::MAX } else { threshold };
        self
    }

    /// Number of trained centroids.
    pub fn num_lists(&self) -> usize {
        self.lists.len()
    }

    fn centroid(&self, c: usize) -> &[f32] {
        &self.centroids[c * self.dimension..(c + 1) * self.dimension]
    }

    /// Centroid indices ordered by similarity to `vector`, best first.
    fn ranked_centroids(&self, vector: &[f32]) -> Vec<usize> {
        let mut scored: Vec<(usize, f64)> = (0..self.lists.len())
            .map(|c| (c, dot(vector, self.centroid(c))))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        scored.into_iter().map(|(c, _)| c).collect()
    }

    fn nearest_centroid(&self, vector: &[f32]) -> usize {
        nearest(vector, &self.centroids, self.dimension)
    }
}

impl IndexEngine for IvfIndex {
    fn kind(&self) -> &'static str {
        "ivf"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn len(&self) -> usize {
        self.locations.len()
    }

    fn build(&mut self, records: &mut dyn Iterator<Item = &Record>) -> Result<()> {
        let mut records = collect_checked(records, self.dimension)?;
        records.sort_by_key(|r| r.id);

        let dim = self.dimension;
        let vectors = normalize_all(&records, dim, self.parallel_threshold);
        let centroids = train_centroids(
            &vectors,
            dim,
            self.config.nlist,
            self.config.max_iters,
            self.parallel_threshold,
        );
        let num_lists = centroids.len() / dim.max(1);

        let mut lists = vec![InvertedList::default(); num_lists];
        let mut locations = HashMap::with_capacity(records.len());
        for (row, record) in records.iter().enumerate() {
            let v = &vectors[row * dim..(row + 1) * dim];
            let c = nearest(v, &centroids, dim);
            lists[c].ids.push(record.id);
            lists[c].vectors.extend_from_slice(v);
            locations.insert(record.id, c);
        }

        self.centroids = centroids;
        self.lists = lists;
        self.locations = locations;
        Ok(())
    }

    fn add(&mut self, record: &Record) -> Result<()> {
        check_dimension(self.dimension, record.vector.len())?;
        check_finite(&record.vector)?;
        if self.locations.contains_key(&record.id) {
            return Err(VisageError::DuplicateId(record.id));
        }

        let v = normalize(&record.vector);
        let c = if self.lists.is_empty() {
            // Untrained index: the first vector seeds the only centroid.
            self.centroids = v.clone();
            self.lists.push(InvertedList::default());
            0
        } else {
            self.nearest_centroid(&v)
        };

        self.lists[c].ids.push(record.id);
        self.lists[c].vectors.extend(v);
        self.locations.insert(record.id, c);
        Ok(())
    }

    fn remove(&mut self, id: RecordId) -> Result<()> {
        let c = self.locations.remove(&id).ok_or(VisageError::NotFound(id))?;
        let list = &mut self.lists[c];
        if let Some(pos) = list.ids.iter().position(|x| *x == id) {
            list.ids.swap_remove(pos);
            swap_remove_row(&mut list.vectors, pos, self.dimension);
        }
        Ok(())
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        check_dimension(self.dimension, query.len())?;
        check_finite(query)?;

        let query = normalize(query);
        let mut top = TopK::new(k);
        for c in self.ranked_centroids(&query).into_iter().take(self.config.nprobe) {
            let list = &self.lists[c];
            for (pos, id) in list.ids.iter().enumerate() {
                let row = &list.vectors[pos * self.dimension..(pos + 1) * self.dimension];
                top.push(*id, dot(&query, row));
            }
        }
        Ok(top.into_sorted())
    }
}

/// Index of the centroid with the highest dot product; ties go to the lower index.
fn nearest(vector: &[f32], centroids: &[f32], dim: usize) -> usize {
    let mut best = 0;
    let mut best_score = f64::NEG_INFINITY;
    for (c, centroid) in centroids.chunks_exact(dim.max(1)).enumerate() {
        let score = dot(vector, centroid);
        if score > best_score {
            best = c;
            best_score = score;
        }
    }
    best
}

/// Spherical k-means over row-major unit vectors.
///
/// Returns a row-major buffer of `min(nlist, rows)` unit centroids, or an
/// empty buffer when there are no vectors.
fn train_centroids(
    vectors: &[f32],
    dim: usize,
    nlist: usize,
    max_iters: usize,
    parallel_threshold: usize,
) -> Vec<f32> {
    if dim == 0 || vectors.is_empty() {
        return Vec::new();
    }
    let rows = vectors.len() / dim;
    let k = nlist.min(rows).max(1);

    let mut centroids: Vec<f32> = (0..k)
        .flat_map(|j| {
            let row = j * rows / k;
            vectors[row * dim..(row + 1) * dim].iter().copied()
        })
        .collect();

    let mut assignments = vec![usize::MAX; rows];
    for _ in 0..max_iters {
        let next = assign_rows(vectors, &centroids, dim, rows >= parallel_threshold);
        if next == assignments {
            break;
        }
        assignments = next;

        let mut sums = vec![0.0f64; k * dim];
        let mut counts = vec![0usize; k];
        for (row, v) in vectors.chunks_exact(dim).enumerate() {
            let c = assignments[row];
            counts[c] += 1;
            for (i, x) in v.iter().enumerate() {
                sums[c * dim + i] += *x as f64;
            }
        }

        for c in 0..k {
            // Empty clusters keep their previous centroid.
            if counts[c] == 0 {
                continue;
            }
            let mean: Vec<f32> = sums[c * dim..(c + 1) * dim]
                .iter()
                .map(|s| (*s / counts[c] as f64) as f32)
                .collect();
            centroids[c * dim..(c + 1) * dim].copy_from_slice(&normalize(&mean));
        }
    }

    centroids
}

/// Nearest centroid for every row of `vectors`.
fn assign_rows(vectors: &[f32], centroids: &[f32], dim: usize, parallel: bool) -> Vec<usize> {
    if parallel {
        vectors
            .par_chunks_exact(dim)
            .map(|v| nearest(v, centroids, dim))
            .collect()
    } else {
        vectors
            .chunks_exact(dim)
            .map(|v| nearest(v, centroids, dim))
            .collect()
    }
}
