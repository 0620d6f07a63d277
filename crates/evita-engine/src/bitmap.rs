//! Candidate sets and the index-side structures formulas read from.
//!
//! A `CandidateSet` is an ordered, deduplicated set of entity primary keys
//! backed by a Roaring bitmap. It is immutable and cheap to clone (the bitmap
//! sits behind an `Arc`), which is what lets a memoized formula result be
//! handed out to sorters, caches and the pagination layer without copying.
//!
//! Indexes themselves are outside this crate; `IndexedBitmap` and
//! `PriceIndex` are the narrow read-only views the engine needs. Each one
//! carries an identity and a version so that a formula can derive a
//! transactional identity hash from the exact index snapshot it read.

use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use evita_common::hash_longs;
use roaring::RoaringBitmap;

static NEXT_INDEX_ID: AtomicU64 = AtomicU64::new(1);

/// A process-local identifier of one index structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IndexId(NonZeroU64);

impl IndexId {
    pub fn new() -> Self {
        let raw = NEXT_INDEX_ID.fetch_add(1, Ordering::Relaxed);
        Self(NonZeroU64::new(raw).unwrap_or(NonZeroU64::MIN))
    }

    pub fn raw(self) -> u64 {
        self.0.get()
    }
}

impl Default for IndexId {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Candidate Set
// ============================================================================

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CandidateSet(Arc<RoaringBitmap>);

impl CandidateSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_bitmap(bitmap: RoaringBitmap) -> Self {
        Self(Arc::new(bitmap))
    }

    pub fn from_keys(keys: impl IntoIterator<Item = u32>) -> Self {
        Self::from_bitmap(keys.into_iter().collect())
    }

    pub fn len(&self) -> u64 {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, key: u32) -> bool {
        self.0.contains(key)
    }

    pub fn bitmap(&self) -> &RoaringBitmap {
        &self.0
    }

    pub fn iter(&self) -> roaring::bitmap::Iter<'_> {
        self.0.iter()
    }

    pub fn to_vec(&self) -> Vec<u32> {
        self.0.iter().collect()
    }

    /// Keys at positions `[start, end)` of the ordered set.
    pub fn range(&self, start: usize, end: usize) -> Vec<u32> {
        if start >= end {
            return Vec::new();
        }
        self.0.iter().skip(start).take(end - start).collect()
    }

    /// Iterate the set in ordered batches of at most `batch_size` keys.
    pub fn batches(&self, batch_size: usize) -> BatchIter<'_> {
        BatchIter {
            inner: self.0.iter(),
            batch_size: batch_size.max(1),
        }
    }

    pub fn and(&self, other: &CandidateSet) -> CandidateSet {
        Self::from_bitmap(self.bitmap() & other.bitmap())
    }

    pub fn or(&self, other: &CandidateSet) -> CandidateSet {
        Self::from_bitmap(self.bitmap() | other.bitmap())
    }

    pub fn and_not(&self, other: &CandidateSet) -> CandidateSet {
        Self::from_bitmap(self.bitmap() - other.bitmap())
    }

    /// Whether both handles point at the very same memoized bitmap.
    pub fn ptr_eq(&self, other: &CandidateSet) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Estimated in-memory footprint when held by the cache.
    pub fn estimated_size_in_bytes(&self) -> u64 {
        const HEADER: u64 = 32;
        HEADER + self.0.serialized_size() as u64
    }
}

impl From<RoaringBitmap> for CandidateSet {
    fn from(bitmap: RoaringBitmap) -> Self {
        Self::from_bitmap(bitmap)
    }
}

pub struct BatchIter<'a> {
    inner: roaring::bitmap::Iter<'a>,
    batch_size: usize,
}

impl Iterator for BatchIter<'_> {
    type Item = Vec<u32>;

    fn next(&mut self) -> Option<Self::Item> {
        let batch: Vec<u32> = self.inner.by_ref().take(self.batch_size).collect();
        if batch.is_empty() {
            None
        } else {
            Some(batch)
        }
    }
}

// ============================================================================
// Index-provided sets
// ============================================================================

/// A bitmap owned by an index (attribute value bucket, reference set, facet…).
#[derive(Debug, Clone)]
pub struct IndexedBitmap {
    id: IndexId,
    version: u64,
    keys: CandidateSet,
}

impl IndexedBitmap {
    pub fn new(keys: impl IntoIterator<Item = u32>) -> Self {
        Self {
            id: IndexId::new(),
            version: 1,
            keys: CandidateSet::from_keys(keys),
        }
    }

    pub fn with_identity(id: IndexId, version: u64, keys: CandidateSet) -> Self {
        Self { id, version, keys }
    }

    /// A new snapshot of the same index structure.
    pub fn next_version(&self, keys: impl IntoIterator<Item = u32>) -> Self {
        Self {
            id: self.id,
            version: self.version + 1,
            keys: CandidateSet::from_keys(keys),
        }
    }

    pub fn id(&self) -> IndexId {
        self.id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn keys(&self) -> &CandidateSet {
        &self.keys
    }

    /// Fingerprint of this exact snapshot.
    pub fn transactional_id(&self) -> u64 {
        hash_longs(&[self.id.raw(), self.version])
    }
}

/// A single price of an entity as the price index stores it.
///
/// Amounts are already in fixed-point form at the index's
/// `indexed_decimal_places`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceRecord {
    pub entity_primary_key: u32,
    pub inner_record_id: u32,
    pub price_without_tax: i64,
    pub price_with_tax: i64,
}

/// Prices of one price list / currency combination, ordered by entity key.
#[derive(Debug, Clone)]
pub struct PriceIndex {
    id: IndexId,
    version: u64,
    indexed_decimal_places: u32,
    records: Arc<[PriceRecord]>,
    entities: CandidateSet,
}

impl PriceIndex {
    pub fn new(indexed_decimal_places: u32, mut records: Vec<PriceRecord>) -> Self {
        records.sort_by_key(|r| (r.entity_primary_key, r.inner_record_id));
        let entities = CandidateSet::from_keys(records.iter().map(|r| r.entity_primary_key));
        Self {
            id: IndexId::new(),
            version: 1,
            indexed_decimal_places,
            records: records.into(),
            entities,
        }
    }

    pub fn id(&self) -> IndexId {
        self.id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn indexed_decimal_places(&self) -> u32 {
        self.indexed_decimal_places
    }

    pub fn entities(&self) -> &CandidateSet {
        &self.entities
    }

    pub fn transactional_id(&self) -> u64 {
        hash_longs(&[self.id.raw(), self.version])
    }

    /// All prices of one entity.
    pub fn prices_of(&self, entity_primary_key: u32) -> &[PriceRecord] {
        let start = self
            .records
            .partition_point(|r| r.entity_primary_key < entity_primary_key);
        let end = self
            .records
            .partition_point(|r| r.entity_primary_key <= entity_primary_key);
        &self.records[start..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_set_algebra() {
        let a = CandidateSet::from_keys([1, 2, 3, 4]);
        let b = CandidateSet::from_keys([3, 4, 5]);
        assert_eq!(a.and(&b).to_vec(), vec![3, 4]);
        assert_eq!(a.or(&b).to_vec(), vec![1, 2, 3, 4, 5]);
        assert_eq!(a.and_not(&b).to_vec(), vec![1, 2]);
    }

    #[test]
    fn candidate_set_range_and_batches() {
        let set = CandidateSet::from_keys([9, 1, 5, 3, 7]);
        assert_eq!(set.range(1, 3), vec![3, 5]);
        assert_eq!(set.range(3, 100), vec![7, 9]);
        assert!(set.range(4, 2).is_empty());

        let batches: Vec<Vec<u32>> = set.batches(2).collect();
        assert_eq!(batches, vec![vec![1, 3], vec![5, 7], vec![9]]);
    }

    #[test]
    fn versions_change_transactional_id() {
        let v1 = IndexedBitmap::new([1, 2]);
        let v2 = v1.next_version([1, 2, 3]);
        assert_eq!(v1.id(), v2.id());
        assert_ne!(v1.transactional_id(), v2.transactional_id());
    }

    #[test]
    fn price_lookup_by_entity() {
        let index = PriceIndex::new(
            2,
            vec![
                PriceRecord {
                    entity_primary_key: 2,
                    inner_record_id: 0,
                    price_without_tax: 100,
                    price_with_tax: 121,
                },
                PriceRecord {
                    entity_primary_key: 1,
                    inner_record_id: 0,
                    price_without_tax: 50,
                    price_with_tax: 60,
                },
                PriceRecord {
                    entity_primary_key: 2,
                    inner_record_id: 1,
                    price_without_tax: 80,
                    price_with_tax: 97,
                },
            ],
        );
        assert_eq!(index.prices_of(2).len(), 2);
        assert_eq!(index.prices_of(1).len(), 1);
        assert!(index.prices_of(3).is_empty());
        assert_eq!(index.entities().to_vec(), vec![1, 2]);
    }
}
