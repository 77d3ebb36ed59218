//! Nearest-neighbour index over fixed-dimension embeddings.
//!
//! [`IndexEngine`] is the seam between a collection and its search structure.
//! [`FlatIndex`] is the exact brute-force implementation: every query is
//! scored against every vector and the top-K are kept in a bounded heap. It is
//! the reference that approximate structures such as [`crate::ivf::IvfIndex`]
//! are validated against.
//!
//! Scores are cosine similarities computed as the dot product of
//! L2-normalised vectors. Normalisation happens once, at build/add time.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};

use rayon::prelude::*;

use visage_core::config::IndexConfig;
use visage_core::error::{Result, VisageError};
use visage_core::types::{Record, RecordId};

use crate::ivf::{IvfConfig, IvfIndex};

/// A single hit returned from an index search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchHit {
    /// The ID of the matching record.
    pub id: RecordId,
    /// Cosine similarity score (-1.0 to 1.0).
    pub score: f64,
}

/// A nearest-neighbour structure over the vectors of one collection.
///
/// Implementations must return at most `k` hits ordered by descending score,
/// with ties broken by ascending id, and must reject queries of the wrong
/// dimension before doing any work.
pub trait IndexEngine: Send + Sync + std::fmt::Debug {
    /// Short name of the structure ("flat", "ivf").
    fn kind(&self) -> &'static str;

    /// Dimension every indexed vector and query must have.
    fn dimension(&self) -> usize;

    /// Number of indexed vectors.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discard the current contents and index `records` from scratch.
    ///
    /// On error the previous contents are left untouched.
    fn build(&mut self, records: &mut dyn Iterator<Item = &Record>) -> Result<()>;

    /// Index one additional record.
    fn add(&mut self, record: &Record) -> Result<()>;

    /// Drop a record from the index.
    fn remove(&mut self, id: RecordId) -> Result<()>;

    /// Return the `k` nearest records to `query`.
    fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>>;
}

/// Construct the index structure selected in the configuration.
pub fn index_from_config(config: &IndexConfig, dimension: usize) -> Result<Box<dyn IndexEngine>> {
    match config.kind.as_str() {
        "flat" => Ok(Box::new(
            FlatIndex::new(dimension).with_parallel_threshold(config.parallel_build_threshold),
        )),
        "ivf" => {
            let ivf = IvfConfig::new(config.nlist, config.nprobe).with_max_iters(config.max_iters);
            Ok(Box::new(
                IvfIndex::new(dimension, ivf)
                    .with_parallel_threshold(config.parallel_build_threshold),
            ))
        }
        other => Err(VisageError::Config(format!(
            "Unknown index kind '{}': expected 'flat' or 'ivf'",
            other
        ))),
    }
}

// ---------------------------------------------------------------------------
// FlatIndex - exact brute-force search
// ---------------------------------------------------------------------------

/// Exact index: normalised vectors in one contiguous buffer.
#[derive(Debug, Clone)]
pub struct FlatIndex {
    dimension: usize,
    ids: Vec<RecordId>,
    /// Row-major `ids.len() × dimension` buffer of unit vectors.
    vectors: Vec<f32>,
    positions: HashMap<RecordId, usize>,
    parallel_threshold: usize,
}

impl FlatIndex {
    /// Create a new empty index for vectors of the given dimension.
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            ids: Vec::new(),
            vectors: Vec::new(),
            positions: HashMap::new(),
            parallel_threshold: usize::MAX,
        }
    }

    /// Normalise on worker threads once a build reaches `threshold` records.
    /// Zero disables parallel builds.
    pub fn with_parallel_threshold(mut self, threshold: usize) -> Self {
        self.parallel_threshold = if threshold == 0 { usize::MAX } else { threshold };
        self
    }

    fn row(&self, pos: usize) -> &[f32] {
        &self.vectors[pos * self.dimension..(pos + 1) * self.dimension]
    }
}

impl IndexEngine for FlatIndex {
    fn kind(&self) -> &'static str {
        "flat"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn len(&self) -> usize {
        self.ids.len()
    }

    fn build(&mut self, records: &mut dyn Iterator<Item = &Record>) -> Result<()> {
        let records = collect_checked(records, self.dimension)?;
        let vectors = normalize_all(&records, self.dimension, self.parallel_threshold);

        let ids: Vec<RecordId> = records.iter().map(|r| r.id).collect();
        let positions = ids.iter().enumerate().map(|(pos, id)| (*id, pos)).collect();

        self.ids = ids;
        self.vectors = vectors;
        self.positions = positions;
        Ok(())
    }

    fn add(&mut self, record: &Record) -> Result<()> {
        check_dimension(self.dimension, record.vector.len())?;
        check_finite(&record.vector)?;
        if self.positions.contains_key(&record.id) {
            return Err(VisageError::DuplicateId(record.id));
        }

        self.positions.insert(record.id, self.ids.len());
        self.ids.push(record.id);
        self.vectors.extend(normalize(&record.vector));
        Ok(())
    }

    fn remove(&mut self, id: RecordId) -> Result<()> {
        let pos = self.positions.remove(&id).ok_or(VisageError::NotFound(id))?;
        let last = self.ids.len() - 1;

        self.ids.swap_remove(pos);
        swap_remove_row(&mut self.vectors, pos, self.dimension);
        if pos != last {
            self.positions.insert(self.ids[pos], pos);
        }
        Ok(())
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        check_dimension(self.dimension, query.len())?;
        check_finite(query)?;

        let query = normalize(query);
        let mut top = TopK::new(k);
        for (pos, id) in self.ids.iter().enumerate() {
            top.push(*id, dot(&query, self.row(pos)));
        }
        Ok(top.into_sorted())
    }
}

// ---------------------------------------------------------------------------
// Ranking
// ---------------------------------------------------------------------------

/// Ordering key for hits: greater means ranked earlier.
#[derive(Debug, Clone, Copy)]
struct Ranked {
    score: f64,
    id: RecordId,
}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ranked {}

/// Bounded collector keeping the `k` best hits seen so far.
///
/// The heap is a min-heap on rank, so its top is the current worst kept hit.
pub(crate) struct TopK {
    k: usize,
    heap: BinaryHeap<Reverse<Ranked>>,
}

impl TopK {
    pub(crate) fn new(k: usize) -> Self {
        Self {
            k,
            heap: BinaryHeap::with_capacity(k.min(1024)),
        }
    }

    pub(crate) fn push(&mut self, id: RecordId, score: f64) {
        if self.k == 0 {
            return;
        }
        let candidate = Ranked { score, id };
        if self.heap.len() < self.k {
            self.heap.push(Reverse(candidate));
        } else if let Some(Reverse(worst)) = self.heap.peek() {
            if candidate > *worst {
                self.heap.pop();
                self.heap.push(Reverse(candidate));
            }
        }
    }

    /// Best hit first.
    pub(crate) fn into_sorted(self) -> Vec<SearchHit> {
        self.heap
            .into_sorted_vec()
            .into_iter()
            .map(|Reverse(r)| SearchHit {
                id: r.id,
                score: r.score,
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Vector helpers
// ---------------------------------------------------------------------------

pub(crate) fn check_dimension(expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(VisageError::DimensionMismatch { expected, actual });
    }
    Ok(())
}

pub(crate) fn check_finite(vector: &[f32]) -> Result<()> {
    if vector.iter().any(|v| !v.is_finite()) {
        return Err(VisageError::InvalidInput(
            "Vector contains NaN or infinite components".to_string(),
        ));
    }
    Ok(())
}

/// Validate every record up front so a failing build changes nothing.
pub(crate) fn collect_checked<'a>(
    records: &mut dyn Iterator<Item = &'a Record>,
    dimension: usize,
) -> Result<Vec<&'a Record>> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for record in records {
        check_dimension(dimension, record.vector.len())?;
        check_finite(&record.vector)?;
        if !seen.insert(record.id) {
            return Err(VisageError::DuplicateId(record.id));
        }
        out.push(record);
    }
    Ok(out)
}

/// L2-normalise a vector. A zero vector stays zero.
pub fn normalize(vector: &[f32]) -> Vec<f32> {
    let norm = vector
        .iter()
        .map(|v| (*v as f64) * (*v as f64))
        .sum::<f64>()
        .sqrt();
    if norm == 0.0 {
        return vec![0.0; vector.len()];
    }
    vector.iter().map(|v| ((*v as f64) / norm) as f32).collect()
}

/// Dot product accumulated in f64.
pub(crate) fn dot(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b.iter())
        .fold(0.0f64, |acc, (x, y)| acc + (*x as f64) * (*y as f64))
}

/// Cosine similarity between two raw vectors.
///
/// Returns 0.0 if either vector has zero magnitude or the lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() {
        return 0.0;
    }
    dot(&normalize(a), &normalize(b))
}

/// Normalise records into one row-major buffer, in input order.
///
/// At or above `parallel_threshold` records the work is spread over the rayon
/// pool. Rows are collected in input order either way.
pub(crate) fn normalize_all(
    records: &[&Record],
    dimension: usize,
    parallel_threshold: usize,
) -> Vec<f32> {
    if records.len() < parallel_threshold {
        let mut out = Vec::with_capacity(records.len() * dimension);
        for record in records {
            out.extend(normalize(&record.vector));
        }
        return out;
    }
    records
        .par_iter()
        .flat_map_iter(|record| normalize(&record.vector))
        .collect()
}

/// Remove row `pos` from a row-major buffer by moving the last row into it.
pub(crate) fn swap_remove_row(buffer: &mut Vec<f32>, pos: usize, dimension: usize) {
    let rows = buffer.len() / dimension;
    let last = rows - 1;
    if pos != last {
        let (head, tail) = buffer.split_at_mut(last * dimension);
        head[pos * dimension..(pos + 1) * dimension].copy_from_slice(&tail[..dimension]);
    }
    buffer.truncate(last * dimension);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: RecordId, vector: Vec<f32>) -> Record {
        Record::new(id, vector)
    }

    fn build_flat(records: &[Record]) -> FlatIndex {
        let dim = records.first().map(|r| r.vector.len()).unwrap_or(2);
        let mut index = FlatIndex::new(dim);
        index.build(&mut records.iter()).unwrap();
        index
    }

    #[test]
    fn test_two_record_scenario() {
        let index = build_flat(&[record(0, vec![1.0, 0.0]), record(1, vec![0.0, 1.0])]);

        let hits = index.search(&[0.9, 0.1], 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, 0);
        assert_eq!(hits[1].id, 1);
        assert!((hits[0].score - 0.9939).abs() < 1e-3);
        assert!((hits[1].score - 0.1104).abs() < 1e-3);
    }

    #[test]
    fn test_self_similarity_is_one() {
        let v = vec![0.3f32, -1.2, 4.0, 0.01];
        let index = build_flat(&[record(5, v.clone()), record(6, vec![1.0, 1.0, 1.0, 1.0])]);

        let hits = index.search(&v, 1).unwrap();
        assert_eq!(hits[0].id, 5);
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_ties_broken_by_ascending_id() {
        let records: Vec<Record> = [9, 2, 7, 4]
            .iter()
            .map(|id| record(*id, vec![1.0, 1.0]))
            .collect();
        let index = build_flat(&records);

        let hits = index.search(&[1.0, 1.0], 3).unwrap();
        let ids: Vec<RecordId> = hits.iter().map(|h| h.id).collect();
        assert_eq!(ids, vec![2, 4, 7]);
    }

    #[test]
    fn test_search_respects_k_limit_and_order() {
        let records: Vec<Record> = (0..50)
            .map(|i| record(i, vec![1.0, i as f32 / 10.0, (i % 7) as f32]))
            .collect();
        let index = build_flat(&records);

        let hits = index.search(&[1.0, 2.0, 3.0], 10).unwrap();
        assert_eq!(hits.len(), 10);
        for pair in hits.windows(2) {
            assert!(
                pair[0].score > pair[1].score
                    || (pair[0].score == pair[1].score && pair[0].id < pair[1].id)
            );
        }
    }

    #[test]
    fn test_k_larger_than_len_and_k_zero() {
        let index = build_flat(&[record(0, vec![1.0, 0.0])]);
        assert_eq!(index.search(&[1.0, 0.0], 10).unwrap().len(), 1);
        assert!(index.search(&[1.0, 0.0], 0).unwrap().is_empty());
    }

    #[test]
    fn test_search_empty_index() {
        let index = FlatIndex::new(4);
        assert!(index.search(&[1.0; 4], 10).unwrap().is_empty());
        assert!(index.is_empty());
    }

    #[test]
    fn test_search_dimension_mismatch() {
        let index = build_flat(&[record(0, vec![1.0, 0.0])]);
        let err = index.search(&[1.0, 0.0, 0.0], 1).unwrap_err();
        assert!(matches!(
            err,
            VisageError::DimensionMismatch {
                expected: 2,
                actual: 3
            }
        ));
    }

    #[test]
    fn test_search_rejects_nan_query() {
        let index = build_flat(&[record(0, vec![1.0, 0.0])]);
        assert!(matches!(
            index.search(&[f32::NAN, 0.0], 1),
            Err(VisageError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_build_failure_leaves_index_untouched() {
        let mut index = build_flat(&[record(0, vec![1.0, 0.0])]);
        let bad = [record(1, vec![1.0, 0.0]), record(2, vec![1.0])];
        assert!(index.build(&mut bad.iter()).is_err());
        assert_eq!(index.len(), 1);

        let dup = [record(1, vec![1.0, 0.0]), record(1, vec![0.0, 1.0])];
        assert!(matches!(
            index.build(&mut dup.iter()),
            Err(VisageError::DuplicateId(1))
        ));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_build_is_idempotent() {
        let records: Vec<Record> = (0..30)
            .map(|i| record(i, vec![(i as f32).sin(), (i as f32).cos(), 0.5]))
            .collect();
        let mut index = FlatIndex::new(3);
        index.build(&mut records.iter()).unwrap();
        let first = index.search(&[0.2, 0.9, 0.1], 7).unwrap();
        index.build(&mut records.iter()).unwrap();
        let second = index.search(&[0.2, 0.9, 0.1], 7).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_normalize_all_keeps_input_order() {
        let records: Vec<Record> = (0..64)
            .map(|i| record(i, vec![i as f32 + 1.0, 0.5, -(i as f32)]))
            .collect();
        let refs: Vec<&Record> = records.iter().collect();

        let serial = normalize_all(&refs, 3, usize::MAX);
        let parallel = normalize_all(&refs, 3, 1);
        assert_eq!(serial, parallel);
        assert_eq!(&parallel[3 * 10..3 * 11], normalize(&records[10].vector).as_slice());
    }

    #[test]
    fn test_parallel_build_matches_serial() {
        let records: Vec<Record> = (0..200)
            .map(|i| record(i, vec![i as f32, 1.0, (i % 3) as f32, -2.0]))
            .collect();

        let mut serial = FlatIndex::new(4);
        serial.build(&mut records.iter()).unwrap();
        let mut parallel = FlatIndex::new(4).with_parallel_threshold(1);
        parallel.build(&mut records.iter()).unwrap();

        let q = [3.0, 1.0, 0.0, -1.0];
        assert_eq!(serial.search(&q, 20).unwrap(), parallel.search(&q, 20).unwrap());
    }

    #[test]
    fn test_add_and_remove() {
        let mut index = FlatIndex::new(2);
        index.add(&record(1, vec![1.0, 0.0])).unwrap();
        index.add(&record(2, vec![0.0, 1.0])).unwrap();
        index.add(&record(3, vec![1.0, 1.0])).unwrap();
        assert!(matches!(
            index.add(&record(2, vec![1.0, 0.0])),
            Err(VisageError::DuplicateId(2))
        ));

        index.remove(1).unwrap();
        assert_eq!(index.len(), 2);
        let hits = index.search(&[1.0, 0.0], 5).unwrap();
        assert!(hits.iter().all(|h| h.id != 1));
        assert_eq!(hits[0].id, 3);

        // Remaining rows still line up with their ids after the swap.
        let hits = index.search(&[0.0, 1.0], 1).unwrap();
        assert_eq!(hits[0].id, 2);
        assert!((hits[0].score - 1.0).abs() < 1e-6);

        assert!(matches!(index.remove(1), Err(VisageError::NotFound(1))));
    }

    #[test]
    fn test_zero_vector_scores_zero() {
        let index = build_flat(&[record(0, vec![0.0, 0.0]), record(1, vec![1.0, 0.0])]);
        let hits = index.search(&[1.0, 0.0], 2).unwrap();
        assert_eq!(hits[1].id, 0);
        assert_eq!(hits[1].score, 0.0);
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0; 100], &[1.0; 100]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-9);
        assert_eq!(cosine_similarity(&[0.0; 3], &[1.0; 3]), 0.0);
        assert_eq!(cosine_similarity(&[1.0; 10], &[1.0; 20]), 0.0);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_swap_remove_row() {
        let mut buf = vec![1.0, 1.0, 2.0, 2.0, 3.0, 3.0];
        swap_remove_row(&mut buf, 0, 2);
        assert_eq!(buf, vec![3.0, 3.0, 2.0, 2.0]);
        swap_remove_row(&mut buf, 1, 2);
        assert_eq!(buf, vec![3.0, 3.0]);
    }

    #[test]
    fn test_index_from_config() {
        let mut config = IndexConfig::default();
        assert_eq!(index_from_config(&config, 8).unwrap().kind(), "flat");
        config.kind = "ivf".to_string();
        let index = index_from_config(&config, 8).unwrap();
        assert_eq!(index.kind(), "ivf");
        assert_eq!(index.dimension(), 8);
        config.kind = "hnsw".to_string();
        assert!(matches!(
            index_from_config(&config, 8),
            Err(VisageError::Config(_))
        ));
    }
}
