//! Merging pre-sorted record providers.
//!
//! Sort indexes keep their records already ordered by the sorted value, one
//! provider per partition (for example one per referenced entity). Ordering
//! by such a property means merging the providers into one sequence:
//!
//! - [`MergeMode::AppendFirst`] takes providers one after another in the
//!   declared order; a key occurring in several providers keeps its first
//!   position,
//! - [`MergeMode::Interleave`] performs a k-way merge by the sorted value.
//!
//! The merged sequence does not depend on the query filter, so it is a good
//! cache candidate (record type sorted-result).

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::{Arc, OnceLock};

use evita_common::{hash_longs, hash_unordered_longs, ContentHasher};
use roaring::RoaringBitmap;

use crate::bitmap::IndexId;
use crate::cache::{CacheObserver, CachePayload, CacheableElement, ComputedRecord, RecordType};

const CLASS_MERGED_SORTED: u64 = 0x30;
const MERGE_COST_PER_RECORD: u64 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MergeMode {
    AppendFirst,
    Interleave,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortedRecord {
    pub value: i64,
    pub key: u32,
}

/// One pre-sorted partition of a sort index.
#[derive(Debug, Clone)]
pub struct SortedRecordsProvider {
    id: IndexId,
    version: u64,
    records: Arc<[SortedRecord]>,
}

impl SortedRecordsProvider {
    /// Records are ordered ascending by `(value, key)` on construction.
    pub fn new(mut records: Vec<SortedRecord>) -> Self {
        records.sort_by(|a, b| a.value.cmp(&b.value).then(a.key.cmp(&b.key)));
        Self {
            id: IndexId::new(),
            version: 1,
            records: records.into(),
        }
    }

    pub fn next_version(&self, records: Vec<SortedRecord>) -> Self {
        let mut next = Self::new(records);
        next.id = self.id;
        next.version = self.version + 1;
        next
    }

    pub fn id(&self) -> IndexId {
        self.id
    }

    pub fn records(&self) -> &[SortedRecord] {
        &self.records
    }

    pub fn transactional_id(&self) -> u64 {
        hash_longs(&[self.id.raw(), self.version])
    }

    fn at(&self, position: usize, direction: Direction) -> Option<&SortedRecord> {
        match direction {
            Direction::Asc => self.records.get(position),
            Direction::Desc => self
                .records
                .len()
                .checked_sub(position + 1)
                .and_then(|i| self.records.get(i)),
        }
    }
}

#[derive(Debug)]
pub struct MergedSortedRecords {
    providers: Arc<[Arc<SortedRecordsProvider>]>,
    mode: MergeMode,
    direction: Direction,
    hash: u64,
    transactional_hash: u64,
    estimated_cost: u64,
    observer: Option<CacheObserver>,
    memo: OnceLock<Arc<[u32]>>,
}

impl MergedSortedRecords {
    pub fn new(
        providers: Vec<Arc<SortedRecordsProvider>>,
        mode: MergeMode,
        direction: Direction,
    ) -> Arc<Self> {
        let provider_ids: Vec<u64> = providers.iter().map(|p| p.id().raw()).collect();
        let mode_tag = match mode {
            MergeMode::AppendFirst => 1,
            MergeMode::Interleave => 2,
        };
        let direction_tag = match direction {
            Direction::Asc => 1,
            Direction::Desc => 2,
        };
        let hasher = ContentHasher::new(CLASS_MERGED_SORTED)
            .long(mode_tag)
            .long(direction_tag);
        // provider order only matters when appending
        let hash = match mode {
            MergeMode::AppendFirst => hasher.ordered(&provider_ids),
            MergeMode::Interleave => hasher.unordered(&provider_ids),
        }
        .finish();
        let tx: Vec<u64> = providers.iter().map(|p| p.transactional_id()).collect();
        let total: u64 = providers.iter().map(|p| p.records().len() as u64).sum();
        let fan_in = (usize::BITS - providers.len().leading_zeros()).max(1) as u64;
        Arc::new(Self {
            providers: providers.into(),
            mode,
            direction,
            hash,
            transactional_hash: hash_unordered_longs(&tx),
            estimated_cost: total
                .saturating_mul(fan_in)
                .saturating_mul(MERGE_COST_PER_RECORD),
            observer: None,
            memo: OnceLock::new(),
        })
    }

    fn derive(&self, observer: Option<CacheObserver>, memo: OnceLock<Arc<[u32]>>) -> Arc<Self> {
        Arc::new(Self {
            providers: Arc::clone(&self.providers),
            mode: self.mode,
            direction: self.direction,
            hash: self.hash,
            transactional_hash: self.transactional_hash,
            estimated_cost: self.estimated_cost,
            observer,
            memo,
        })
    }

    pub(crate) fn with_cached(&self, order: Arc<[u32]>) -> Arc<Self> {
        self.derive(None, OnceLock::from(order))
    }

    pub(crate) fn with_observer(&self, observer: CacheObserver) -> Arc<Self> {
        self.derive(Some(observer), OnceLock::new())
    }

    pub fn to_cached_form(self: &Arc<Self>) -> Arc<Self> {
        if self.is_computed() && self.observer.is_none() {
            return Arc::clone(self);
        }
        self.with_cached(self.merged_order())
    }

    pub fn mode(&self) -> MergeMode {
        self.mode
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_computed(&self) -> bool {
        self.memo.get().is_some()
    }

    /// All provider keys in merged order, each key once.
    pub fn merged_order(&self) -> Arc<[u32]> {
        self.memo
            .get_or_init(|| {
                let order: Arc<[u32]> = match self.mode {
                    MergeMode::AppendFirst => self.append_first(),
                    MergeMode::Interleave => self.interleave(),
                }
                .into();
                if let Some(observer) = &self.observer {
                    observer.observe(ComputedRecord {
                        estimated_cost: self.estimated_cost,
                        size_in_bytes: 16 + order.len() as u64 * 4,
                        transactional_hash: self.transactional_hash,
                        payload: CachePayload::Sorted(Arc::clone(&order)),
                    });
                }
                order
            })
            .clone()
    }

    fn append_first(&self) -> Vec<u32> {
        let mut seen = RoaringBitmap::new();
        let mut order = Vec::new();
        for provider in self.providers.iter() {
            let mut position = 0;
            while let Some(record) = provider.at(position, self.direction) {
                if seen.insert(record.key) {
                    order.push(record.key);
                }
                position += 1;
            }
        }
        order
    }

    fn interleave(&self) -> Vec<u32> {
        let direction = self.direction;
        let mut heap = BinaryHeap::new();
        for (index, provider) in self.providers.iter().enumerate() {
            if let Some(record) = provider.at(0, direction) {
                heap.push(Reverse(HeapEntry::new(*record, direction, index, 0)));
            }
        }
        let mut seen = RoaringBitmap::new();
        let mut order = Vec::new();
        while let Some(Reverse(entry)) = heap.pop() {
            if seen.insert(entry.key) {
                order.push(entry.key);
            }
            let next = entry.position + 1;
            if let Some(record) = self.providers[entry.provider].at(next, direction) {
                heap.push(Reverse(HeapEntry::new(*record, direction, entry.provider, next)));
            }
        }
        order
    }
}

/// Heap item ordered by direction-adjusted value, then key.
#[derive(Debug, PartialEq, Eq)]
struct HeapEntry {
    sort_value: i128,
    provider: usize,
    key: u32,
    position: usize,
}

impl HeapEntry {
    fn new(record: SortedRecord, direction: Direction, provider: usize, position: usize) -> Self {
        let value = i128::from(record.value);
        Self {
            sort_value: match direction {
                Direction::Asc => value,
                Direction::Desc => -value,
            },
            provider,
            key: record.key,
            position,
        }
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_value
            .cmp(&other.sort_value)
            .then(self.key.cmp(&other.key))
            .then(self.provider.cmp(&other.provider))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl CacheableElement for MergedSortedRecords {
    fn record_type(&self) -> RecordType {
        RecordType::SortedResult
    }

    fn content_hash(&self) -> u64 {
        self.hash
    }

    fn transactional_hash(&self) -> u64 {
        self.transactional_hash
    }

    fn estimated_cost(&self) -> u64 {
        self.estimated_cost
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(records: &[(i64, u32)]) -> Arc<SortedRecordsProvider> {
        Arc::new(SortedRecordsProvider::new(
            records
                .iter()
                .map(|&(value, key)| SortedRecord { value, key })
                .collect(),
        ))
    }

    #[test]
    fn append_first_keeps_first_occurrence() {
        let a = provider(&[(1, 10), (2, 11), (3, 12)]);
        let b = provider(&[(0, 12), (5, 13)]);
        let merged = MergedSortedRecords::new(vec![a, b], MergeMode::AppendFirst, Direction::Asc);
        assert_eq!(&*merged.merged_order(), &[10, 11, 12, 13]);
    }

    #[test]
    fn append_first_descending_reverses_each_provider() {
        let a = provider(&[(1, 10), (2, 11)]);
        let b = provider(&[(0, 20), (5, 21)]);
        let merged = MergedSortedRecords::new(vec![a, b], MergeMode::AppendFirst, Direction::Desc);
        assert_eq!(&*merged.merged_order(), &[11, 10, 21, 20]);
    }

    #[test]
    fn interleave_merges_by_value() {
        let a = provider(&[(1, 10), (4, 11), (9, 12)]);
        let b = provider(&[(2, 20), (3, 21), (10, 22)]);
        let asc = MergedSortedRecords::new(
            vec![a.clone(), b.clone()],
            MergeMode::Interleave,
            Direction::Asc,
        );
        assert_eq!(&*asc.merged_order(), &[10, 20, 21, 11, 12, 22]);
        let desc = MergedSortedRecords::new(vec![a, b], MergeMode::Interleave, Direction::Desc);
        assert_eq!(&*desc.merged_order(), &[22, 12, 11, 21, 20, 10]);
    }

    #[test]
    fn interleave_hash_ignores_provider_order() {
        let a = provider(&[(1, 1)]);
        let b = provider(&[(2, 2)]);
        let ab = MergedSortedRecords::new(vec![a.clone(), b.clone()], MergeMode::Interleave, Direction::Asc);
        let ba = MergedSortedRecords::new(vec![b.clone(), a.clone()], MergeMode::Interleave, Direction::Asc);
        assert_eq!(ab.content_hash(), ba.content_hash());
        let ab = MergedSortedRecords::new(vec![a.clone(), b.clone()], MergeMode::AppendFirst, Direction::Asc);
        let ba = MergedSortedRecords::new(vec![b, a], MergeMode::AppendFirst, Direction::Asc);
        assert_ne!(ab.content_hash(), ba.content_hash());
    }
}
