//! Exact inner-product vector index.
//!
//! Vectors are L2-normalized on insertion and stored row-major in fixed-size
//! segments, so a search is a single linear scan and the inner product of a
//! normalized query with a row is its cosine similarity. Segments are shared
//! between clones: cloning an index to prepare the next generation copies only
//! the partially filled tail segment, and only once something is appended to it.
//!
//! Rows are never physically removed. Deleting a chunk adds its position to a
//! tombstone set that the scan skips; a forced rebuild produces a compact index.
//! Positions are therefore stable for the lifetime of an index generation and
//! address the parallel chunk and metadata arrays kept by the engine.

use crate::error::{Result, RetrievalError};
use quarry_context::ChunkId;
use quarry_embed::normalize_l2;
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;

/// Tag persisted in `IndexConfig::index_type` for this index
pub const FLAT_INNER_PRODUCT: &str = "flat_ip";

/// Rows per storage segment
const SEGMENT_ROWS: usize = 4096;

/// One search result: a row position and its similarity to the query
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchHit {
    pub position: usize,
    pub score: f32,
}

/// Heap entry ordered by score, then by earlier position.
#[derive(Debug, Clone, Copy)]
struct Candidate(SearchHit);

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .score
            .total_cmp(&other.0.score)
            .then_with(|| other.0.position.cmp(&self.0.position))
    }
}

/// Keep the `k` best hits: descending score, ties to the earlier position.
pub(crate) fn top_k(hits: impl IntoIterator<Item = SearchHit>, k: usize) -> Vec<SearchHit> {
    if k == 0 {
        return Vec::new();
    }
    let mut heap: BinaryHeap<Reverse<Candidate>> = BinaryHeap::with_capacity(k + 1);
    for hit in hits {
        heap.push(Reverse(Candidate(hit)));
        if heap.len() > k {
            heap.pop();
        }
    }
    // Ascending order of Reverse<Candidate> is best-first.
    heap.into_sorted_vec()
        .into_iter()
        .map(|Reverse(Candidate(hit))| hit)
        .collect()
}

/// Flat (brute-force) index over L2-normalized vectors
#[derive(Debug, Clone, PartialEq)]
pub struct FlatIndex {
    dimension: usize,
    /// Full segments hold `SEGMENT_ROWS` rows; only the last may hold fewer
    segments: Vec<Arc<Vec<f32>>>,
    ids: Vec<ChunkId>,
    positions: HashMap<ChunkId, usize>,
    tombstones: HashSet<usize>,
}

impl FlatIndex {
    pub fn new(dimension: usize) -> Result<Self> {
        if dimension == 0 {
            return Err(RetrievalError::invalid_config(
                "index dimension must be positive",
            ));
        }
        Ok(Self {
            dimension,
            segments: Vec::new(),
            ids: Vec::new(),
            positions: HashMap::new(),
            tombstones: HashSet::new(),
        })
    }

    /// Reassemble an index from persisted parts. `data` must already be normalized.
    pub fn from_parts(
        dimension: usize,
        data: Vec<f32>,
        ids: Vec<ChunkId>,
        tombstones: impl IntoIterator<Item = usize>,
    ) -> Result<Self> {
        let mut index = Self::new(dimension)?;
        if data.len() != ids.len() * dimension {
            return Err(RetrievalError::invalid_config(format!(
                "{} values cannot hold {} rows of dimension {}",
                data.len(),
                ids.len(),
                dimension
            )));
        }

        index.tombstones = tombstones.into_iter().collect();
        if let Some(&bad) = index.tombstones.iter().find(|&&p| p >= ids.len()) {
            return Err(RetrievalError::invalid_config(format!(
                "tombstone {bad} is out of range for {} rows",
                ids.len()
            )));
        }
        for (position, id) in ids.iter().enumerate() {
            if !index.tombstones.contains(&position) {
                index.positions.insert(id.clone(), position);
            }
        }
        index.segments = data
            .chunks(SEGMENT_ROWS * dimension)
            .map(|segment| Arc::new(segment.to_vec()))
            .collect();
        index.ids = ids;
        Ok(index)
    }

    /// Append vectors for `chunk_ids`, normalizing each one.
    ///
    /// The batch is validated as a whole before anything is appended. Adding an id
    /// that is already live tombstones the older row.
    pub fn add(&mut self, vectors: Vec<Vec<f32>>, chunk_ids: Vec<ChunkId>) -> Result<()> {
        if vectors.len() != chunk_ids.len() {
            return Err(RetrievalError::invalid_config(format!(
                "{} vectors supplied for {} chunk ids",
                vectors.len(),
                chunk_ids.len()
            )));
        }
        for (vector, id) in vectors.iter().zip(&chunk_ids) {
            if vector.len() != self.dimension {
                return Err(RetrievalError::DimensionMismatch {
                    expected: self.dimension,
                    actual: vector.len(),
                });
            }
            if vector.iter().any(|v| !v.is_finite()) {
                return Err(RetrievalError::InvalidVector {
                    chunk_id: id.to_string(),
                    reason: "contains NaN or infinite values".to_string(),
                });
            }
        }

        for (mut vector, id) in vectors.into_iter().zip(chunk_ids) {
            normalize_l2(&mut vector);
            let position = self.ids.len();
            if let Some(previous) = self.positions.insert(id.clone(), position) {
                self.tombstones.insert(previous);
            }
            self.push_row(&vector);
            self.ids.push(id);
        }
        Ok(())
    }

    /// Top-`k` live rows by cosine similarity to `query`.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        self.search_filtered(query, k, |_| true)
    }

    /// Like [`search`](Self::search), considering only positions accepted by `filter`.
    pub fn search_filtered<F>(&self, query: &[f32], k: usize, filter: F) -> Result<Vec<SearchHit>>
    where
        F: Fn(usize) -> bool,
    {
        if k == 0 {
            return Err(RetrievalError::invalid_config("k must be at least 1"));
        }
        if query.len() != self.dimension {
            return Err(RetrievalError::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }
        if self.live_len() == 0 {
            return Ok(Vec::new());
        }

        let mut query = query.to_vec();
        normalize_l2(&mut query);

        let hits = self
            .rows()
            .enumerate()
            .filter(|(position, _)| !self.tombstones.contains(position) && filter(*position))
            .map(|(position, row)| SearchHit {
                position,
                score: dot(&query, row),
            });

        Ok(top_k(hits, k))
    }

    /// Tombstone the live rows of `chunk_ids`. Unknown ids are ignored.
    ///
    /// Returns the number of rows newly removed.
    pub fn remove(&mut self, chunk_ids: &[ChunkId]) -> usize {
        let mut removed = 0;
        for id in chunk_ids {
            if let Some(position) = self.positions.remove(id) {
                self.tombstones.insert(position);
                removed += 1;
            }
        }
        removed
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Physical rows, including tombstoned ones
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn live_len(&self) -> usize {
        self.ids.len() - self.tombstones.len()
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    pub fn is_live(&self, position: usize) -> bool {
        position < self.ids.len() && !self.tombstones.contains(&position)
    }

    pub fn position(&self, chunk_id: &ChunkId) -> Option<usize> {
        self.positions.get(chunk_id).copied()
    }

    pub fn chunk_id(&self, position: usize) -> Option<&ChunkId> {
        self.ids.get(position)
    }

    pub fn chunk_ids(&self) -> &[ChunkId] {
        &self.ids
    }

    /// The stored (normalized) vector at `position`
    pub fn vector(&self, position: usize) -> Option<&[f32]> {
        let segment = self.segments.get(position / SEGMENT_ROWS)?;
        let start = (position % SEGMENT_ROWS) * self.dimension;
        segment.get(start..start + self.dimension)
    }

    /// Stored values segment by segment; concatenated they are the row-major matrix
    pub fn segments(&self) -> impl Iterator<Item = &[f32]> + '_ {
        self.segments.iter().map(|segment| segment.as_slice())
    }

    fn rows(&self) -> impl Iterator<Item = &[f32]> + '_ {
        self.segments
            .iter()
            .flat_map(|segment| segment.chunks_exact(self.dimension))
    }

    /// Append one row, copying the tail segment first if another index shares it.
    fn push_row(&mut self, row: &[f32]) {
        let capacity = SEGMENT_ROWS * self.dimension;
        if self.segments.last().is_none_or(|tail| tail.len() >= capacity) {
            self.segments.push(Arc::new(Vec::new()));
        }
        if let Some(tail) = self.segments.last_mut() {
            Arc::make_mut(tail).extend_from_slice(row);
        }
    }

    /// Tombstoned positions in ascending order
    pub fn tombstones(&self) -> Vec<usize> {
        let mut positions: Vec<usize> = self.tombstones.iter().copied().collect();
        positions.sort_unstable();
        positions
    }

    /// Approximate heap footprint in bytes
    pub fn memory_bytes(&self) -> usize {
        self.segments.iter().map(|segment| segment.len()).sum::<usize>() * std::mem::size_of::<f32>()
            + self.ids.iter().map(|id| id.as_str().len()).sum::<usize>() * 2
            + self.tombstones.len() * std::mem::size_of::<usize>()
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
