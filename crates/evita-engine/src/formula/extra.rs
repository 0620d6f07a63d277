//! Extra-result computers.
//!
//! Extra results are computed next to the main result page from the same
//! filter. The facet summary counts, for every requested facet, how many of
//! the filtered entities reference it.

use std::sync::{Arc, OnceLock};

use evita_common::{hash_longs, hash_unordered_longs, ContentHasher};
use serde::{Deserialize, Serialize};

use super::FormulaRef;
use crate::bitmap::IndexedBitmap;
use crate::cache::{CacheObserver, CachePayload, CacheableElement, ComputedRecord, RecordType};

const CLASS_FACET_SUMMARY: u64 = 0x20;
const FACET_COUNT_COST: u64 = 8;

/// Entities referencing one facet.
#[derive(Debug, Clone)]
pub struct FacetBucket {
    pub facet_id: u32,
    pub entities: Arc<IndexedBitmap>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacetCount {
    pub facet_id: u32,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacetSummary {
    pub counts: Vec<FacetCount>,
}

impl FacetSummary {
    pub fn count_of(&self, facet_id: u32) -> Option<u64> {
        self.counts
            .iter()
            .find(|c| c.facet_id == facet_id)
            .map(|c| c.count)
    }

    fn estimated_size_in_bytes(&self) -> u64 {
        24 + (self.counts.len() as u64) * 16
    }
}

#[derive(Debug)]
pub struct FacetSummaryComputer {
    filter: FormulaRef,
    buckets: Arc<[FacetBucket]>,
    hash: u64,
    transactional_hash: u64,
    estimated_cost: u64,
    observer: Option<CacheObserver>,
    memo: OnceLock<Arc<FacetSummary>>,
}

impl FacetSummaryComputer {
    pub fn new(filter: FormulaRef, mut buckets: Vec<FacetBucket>) -> Arc<Self> {
        buckets.sort_by_key(|b| b.facet_id);
        let bucket_hashes: Vec<u64> = buckets
            .iter()
            .map(|b| hash_longs(&[u64::from(b.facet_id), b.entities.id().raw()]))
            .collect();
        let hash = ContentHasher::new(CLASS_FACET_SUMMARY)
            .long(filter.hash())
            .unordered(&bucket_hashes)
            .finish();
        let mut tx: Vec<u64> = filter.transactional_ids().to_vec();
        tx.extend(buckets.iter().map(|b| b.entities.transactional_id()));
        let estimated_cost = filter.estimated_cost().saturating_add(
            filter
                .estimated_cardinality()
                .saturating_mul(buckets.len() as u64)
                .saturating_mul(FACET_COUNT_COST),
        );
        Arc::new(Self {
            filter,
            buckets: buckets.into(),
            hash,
            transactional_hash: hash_unordered_longs(&tx),
            estimated_cost,
            observer: None,
            memo: OnceLock::new(),
        })
    }

    fn derive(&self, observer: Option<CacheObserver>, memo: OnceLock<Arc<FacetSummary>>) -> Arc<Self> {
        Arc::new(Self {
            filter: self.filter.clone(),
            buckets: Arc::clone(&self.buckets),
            hash: self.hash,
            transactional_hash: self.transactional_hash,
            estimated_cost: self.estimated_cost,
            observer,
            memo,
        })
    }

    pub(crate) fn with_cached(&self, summary: Arc<FacetSummary>) -> Arc<Self> {
        self.derive(None, OnceLock::from(summary))
    }

    pub(crate) fn with_observer(&self, observer: CacheObserver) -> Arc<Self> {
        self.derive(Some(observer), OnceLock::new())
    }

    /// Compute now and return a computer that only replays the result.
    pub fn to_cached_form(self: &Arc<Self>) -> Arc<Self> {
        if self.is_computed() && self.observer.is_none() {
            return Arc::clone(self);
        }
        self.with_cached(self.compute())
    }

    pub fn filter(&self) -> &FormulaRef {
        &self.filter
    }

    pub fn is_computed(&self) -> bool {
        self.memo.get().is_some()
    }

    pub fn compute(&self) -> Arc<FacetSummary> {
        self.memo
            .get_or_init(|| {
                let candidates = self.filter.compute();
                let summary = Arc::new(FacetSummary {
                    counts: self
                        .buckets
                        .iter()
                        .map(|b| FacetCount {
                            facet_id: b.facet_id,
                            count: candidates.bitmap().intersection_len(b.entities.keys().bitmap()),
                        })
                        .collect(),
                });
                if let Some(observer) = &self.observer {
                    observer.observe(ComputedRecord {
                        estimated_cost: self.estimated_cost,
                        size_in_bytes: summary.estimated_size_in_bytes(),
                        transactional_hash: self.transactional_hash,
                        payload: CachePayload::Extra(summary.clone()),
                    });
                }
                summary
            })
            .clone()
    }
}

impl CacheableElement for FacetSummaryComputer {
    fn record_type(&self) -> RecordType {
        RecordType::ExtraResult
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
    use crate::formula::Formula;

    fn bucket(facet_id: u32, keys: &[u32]) -> FacetBucket {
        FacetBucket {
            facet_id,
            entities: Arc::new(IndexedBitmap::new(keys.iter().copied())),
        }
    }

    #[test]
    fn counts_filtered_entities_per_facet() {
        let filter = Formula::index(Arc::new(IndexedBitmap::new([1, 2, 3, 4])));
        let computer = FacetSummaryComputer::new(
            filter,
            vec![bucket(20, &[4, 5]), bucket(10, &[1, 2, 9])],
        );
        let summary = computer.compute();
        assert_eq!(summary.count_of(10), Some(2));
        assert_eq!(summary.count_of(20), Some(1));
        assert_eq!(summary.counts[0].facet_id, 10);
        assert!(Arc::ptr_eq(&summary, &computer.compute()));
    }

    #[test]
    fn cached_form_replays_without_touching_filter() {
        let filter = Formula::index(Arc::new(IndexedBitmap::new([1, 2])));
        let computer = FacetSummaryComputer::new(filter, vec![bucket(1, &[1])]);
        let cached = computer.to_cached_form();
        assert_eq!(cached.content_hash(), computer.content_hash());
        assert_eq!(cached.compute().count_of(1), Some(1));
    }

    #[test]
    fn summary_serializes_camel_case() {
        let summary = FacetSummary {
            counts: vec![FacetCount {
                facet_id: 3,
                count: 7,
            }],
        };
        let json = serde_json::to_string(&summary).unwrap();
        assert_eq!(json, r#"{"counts":[{"facetId":3,"count":7}]}"#);
    }
}
