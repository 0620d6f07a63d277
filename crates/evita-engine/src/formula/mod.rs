//! Formula algebra.
//!
//! A query filter compiles into a tree of [`Formula`] nodes. Every node
//! knows, without evaluating anything:
//!
//! - its **content hash**, derived from the node kind, its declared
//!   parameters and its children's hashes (commutative operators combine
//!   children order-insensitively, so `A ∧ B` and `B ∧ A` share a hash),
//! - the **transactional ids** of the index snapshots it reads, summarized
//!   into a transactional identity hash,
//! - an **estimated cost** and an estimated result cardinality.
//!
//! That is enough for the cache to decide whether to substitute a memoized
//! result before any work is done. `compute()` runs at most once per node;
//! the result is memoized in the node.
//!
//! Nodes are shared through `Arc<Formula>`. Rewriting a tree (cache
//! analysis) builds new parent nodes over the rewritten children; the
//! surrogates the cache inserts keep the original hash and transactional ids,
//! so the rebuilt parents hash exactly as before.

mod extra;

pub use extra::{FacetBucket, FacetCount, FacetSummary, FacetSummaryComputer};

use std::fmt;
use std::sync::{Arc, OnceLock};

use evita_common::{hash_unordered_longs, ContentHasher};
use rayon::prelude::*;

use crate::bitmap::{CandidateSet, IndexedBitmap, PriceIndex};
use crate::cache::{CacheObserver, CachePayload, CacheableElement, ComputedRecord, RecordType};
use crate::error::{EngineError, Result};
use crate::predicate::{AmountPredicate, ValueMode};

/// Children count from which composite nodes evaluate children in parallel.
pub const PARALLEL_CHILDREN_THRESHOLD: usize = 4;

/// Cost charged per element a composite operation touches.
const OPERATION_COST_PER_ELEMENT: u64 = 4;
/// Cost charged per price record tested by a price filter.
const PRICE_TEST_COST: u64 = 12;

const CLASS_EMPTY: u64 = 0x01;
const CLASS_CONSTANT: u64 = 0x02;
const CLASS_INDEX: u64 = 0x03;
const CLASS_AND: u64 = 0x04;
const CLASS_OR: u64 = 0x05;
const CLASS_NOT: u64 = 0x06;
const CLASS_PRICE_FILTER: u64 = 0x07;

pub type FormulaRef = Arc<Formula>;

#[derive(Debug)]
pub enum FormulaNode {
    Empty,
    /// A literal key set supplied by the query (e.g. primary keys in set).
    Constant(CandidateSet),
    /// A set read from an index snapshot.
    Index(Arc<IndexedBitmap>),
    And(Vec<FormulaRef>),
    Or(Vec<FormulaRef>),
    /// `superset \ subtracted`.
    Not {
        subtracted: FormulaRef,
        superset: FormulaRef,
    },
    /// Entities of `source` having at least one price accepted by `predicate`.
    PriceFilter {
        source: FormulaRef,
        prices: Arc<PriceIndex>,
        predicate: AmountPredicate,
    },
    /// Memoized result substituted by the cache.
    Cached(CandidateSet),
    /// A live computation whose outcome is reported to the cache.
    Observed {
        inner: FormulaRef,
        observer: CacheObserver,
        original_cost: u64,
    },
}

pub struct Formula {
    node: FormulaNode,
    hash: u64,
    transactional_ids: Arc<[u64]>,
    transactional_hash: u64,
    estimated_cost: u64,
    estimated_cardinality: u64,
    memo: OnceLock<CandidateSet>,
}

impl fmt::Debug for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Formula")
            .field("hash", &format_args!("{:#x}", self.hash))
            .field("cost", &self.estimated_cost)
            .field("node", &self.node)
            .finish()
    }
}

// ============================================================================
// Construction
// ============================================================================

impl Formula {
    fn build(
        node: FormulaNode,
        hash: u64,
        transactional_ids: Vec<u64>,
        estimated_cost: u64,
        estimated_cardinality: u64,
    ) -> FormulaRef {
        let mut ids = transactional_ids;
        ids.sort_unstable();
        ids.dedup();
        let transactional_hash = hash_unordered_longs(&ids);
        Arc::new(Formula {
            node,
            hash,
            transactional_ids: ids.into(),
            transactional_hash,
            estimated_cost,
            estimated_cardinality,
            memo: OnceLock::new(),
        })
    }

    pub fn empty() -> FormulaRef {
        Self::build(
            FormulaNode::Empty,
            ContentHasher::new(CLASS_EMPTY).finish(),
            Vec::new(),
            0,
            0,
        )
    }

    pub fn constant(keys: CandidateSet) -> FormulaRef {
        let hash = ContentHasher::new(CLASS_CONSTANT)
            .ordered(&keys.iter().map(u64::from).collect::<Vec<_>>())
            .finish();
        let len = keys.len();
        Self::build(FormulaNode::Constant(keys), hash, Vec::new(), 1, len)
    }

    pub fn index(bitmap: Arc<IndexedBitmap>) -> FormulaRef {
        let hash = ContentHasher::new(CLASS_INDEX)
            .long(bitmap.id().raw())
            .finish();
        let len = bitmap.keys().len();
        let tx = vec![bitmap.transactional_id()];
        Self::build(FormulaNode::Index(bitmap), hash, tx, len.max(1), len)
    }

    pub fn and(children: Vec<FormulaRef>) -> FormulaRef {
        if children.is_empty() {
            return Self::empty();
        }
        let hash = ContentHasher::new(CLASS_AND)
            .unordered(&child_hashes(&children))
            .finish();
        let cardinality = children
            .iter()
            .map(|c| c.estimated_cardinality)
            .min()
            .unwrap_or(0);
        let (cost, tx) = composite_cost_and_ids(&children);
        Self::build(FormulaNode::And(children), hash, tx, cost, cardinality)
    }

    pub fn or(children: Vec<FormulaRef>) -> FormulaRef {
        if children.is_empty() {
            return Self::empty();
        }
        let hash = ContentHasher::new(CLASS_OR)
            .unordered(&child_hashes(&children))
            .finish();
        let cardinality = children
            .iter()
            .fold(0u64, |acc, c| acc.saturating_add(c.estimated_cardinality));
        let (cost, tx) = composite_cost_and_ids(&children);
        Self::build(FormulaNode::Or(children), hash, tx, cost, cardinality)
    }

    pub fn not(subtracted: FormulaRef, superset: FormulaRef) -> FormulaRef {
        let hash = ContentHasher::new(CLASS_NOT)
            .ordered(&[subtracted.hash, superset.hash])
            .finish();
        let cardinality = superset.estimated_cardinality;
        let (cost, tx) = composite_cost_and_ids(&[subtracted.clone(), superset.clone()]);
        Self::build(
            FormulaNode::Not {
                subtracted,
                superset,
            },
            hash,
            tx,
            cost,
            cardinality,
        )
    }

    /// Restrict `source` to entities with a price passing `predicate`.
    ///
    /// Fails when the predicate reads a value prices do not carry, or when its
    /// precision disagrees with the price index.
    pub fn price_filter(
        source: FormulaRef,
        prices: Arc<PriceIndex>,
        predicate: AmountPredicate,
    ) -> Result<FormulaRef> {
        if let Some(mode) = predicate.mode() {
            if mode == ValueMode::Raw {
                return Err(EngineError::configuration(format!(
                    "price filter does not support value mode {mode:?}"
                )));
            }
        }
        if let Some(places) = predicate.decimal_places() {
            if places != prices.indexed_decimal_places() {
                return Err(EngineError::configuration(format!(
                    "price predicate uses {places} decimal places but the index stores {}",
                    prices.indexed_decimal_places()
                )));
            }
        }
        Ok(Self::build_price_filter(source, prices, predicate))
    }

    /// Price filter over a predicate already checked against `prices`.
    fn build_price_filter(
        source: FormulaRef,
        prices: Arc<PriceIndex>,
        predicate: AmountPredicate,
    ) -> FormulaRef {
        let hash = ContentHasher::new(CLASS_PRICE_FILTER)
            .long(source.hash)
            .long(prices.id().raw())
            .long(predicate.hash())
            .finish();
        let cardinality = source.estimated_cardinality;
        let cost = source
            .estimated_cost
            .saturating_add(cardinality.saturating_mul(PRICE_TEST_COST));
        let mut tx = source.transactional_ids.to_vec();
        tx.push(prices.transactional_id());
        Self::build(
            FormulaNode::PriceFilter {
                source,
                prices,
                predicate,
            },
            hash,
            tx,
            cost,
            cardinality,
        )
    }

    /// A constant surrogate standing in for `original`.
    pub(crate) fn cached_surrogate(original: &Formula, result: CandidateSet) -> FormulaRef {
        let len = result.len();
        Arc::new(Formula {
            node: FormulaNode::Cached(result.clone()),
            hash: original.hash,
            transactional_ids: Arc::clone(&original.transactional_ids),
            transactional_hash: original.transactional_hash,
            estimated_cost: 1,
            estimated_cardinality: len,
            memo: OnceLock::from(result),
        })
    }

    /// Wrap `inner` so its first computation is reported to `observer`.
    pub(crate) fn observed(inner: FormulaRef, observer: CacheObserver, original_cost: u64) -> FormulaRef {
        Arc::new(Formula {
            hash: inner.hash,
            transactional_ids: Arc::clone(&inner.transactional_ids),
            transactional_hash: inner.transactional_hash,
            estimated_cost: inner.estimated_cost,
            estimated_cardinality: inner.estimated_cardinality,
            node: FormulaNode::Observed {
                inner,
                observer,
                original_cost,
            },
            memo: OnceLock::new(),
        })
    }

    /// Evaluate this node eagerly and return its constant, cache-shaped form.
    pub fn to_cached_form(self: &Arc<Self>) -> FormulaRef {
        match self.node {
            FormulaNode::Cached(_) | FormulaNode::Constant(_) | FormulaNode::Empty => {
                Arc::clone(self)
            }
            _ => Self::cached_surrogate(self, self.compute()),
        }
    }
}

fn child_hashes(children: &[FormulaRef]) -> Vec<u64> {
    children.iter().map(|c| c.hash).collect()
}

fn composite_cost_and_ids(children: &[FormulaRef]) -> (u64, Vec<u64>) {
    let mut cost = 0u64;
    let mut touched = 0u64;
    let mut tx = Vec::new();
    for child in children {
        cost = cost.saturating_add(child.estimated_cost);
        touched = touched.saturating_add(child.estimated_cardinality);
        tx.extend_from_slice(&child.transactional_ids);
    }
    (
        cost.saturating_add(touched.saturating_mul(OPERATION_COST_PER_ELEMENT)),
        tx,
    )
}

// ============================================================================
// Accessors & evaluation
// ============================================================================

impl Formula {
    pub fn node(&self) -> &FormulaNode {
        &self.node
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    pub fn transactional_ids(&self) -> &[u64] {
        &self.transactional_ids
    }

    pub fn transactional_hash(&self) -> u64 {
        self.transactional_hash
    }

    pub fn estimated_cost(&self) -> u64 {
        self.estimated_cost
    }

    pub fn estimated_cardinality(&self) -> u64 {
        self.estimated_cardinality
    }

    /// Whether the cache may substitute this node.
    ///
    /// Leaves already are materialized sets; surrogates and observers are the
    /// cache's own output.
    pub fn is_cacheable(&self) -> bool {
        matches!(
            self.node,
            FormulaNode::And(_)
                | FormulaNode::Or(_)
                | FormulaNode::Not { .. }
                | FormulaNode::PriceFilter { .. }
        )
    }

    pub fn is_computed(&self) -> bool {
        self.memo.get().is_some()
    }

    pub fn children(&self) -> Vec<FormulaRef> {
        match &self.node {
            FormulaNode::And(c) | FormulaNode::Or(c) => c.clone(),
            FormulaNode::Not {
                subtracted,
                superset,
            } => vec![subtracted.clone(), superset.clone()],
            FormulaNode::PriceFilter { source, .. } => vec![source.clone()],
            FormulaNode::Observed { inner, .. } => vec![inner.clone()],
            FormulaNode::Empty
            | FormulaNode::Constant(_)
            | FormulaNode::Index(_)
            | FormulaNode::Cached(_) => Vec::new(),
        }
    }

    /// Rebuild this node over new children (same arity and order).
    ///
    /// Returns `self` unchanged when every child is pointer-identical.
    pub fn with_children(self: &Arc<Self>, children: Vec<FormulaRef>) -> FormulaRef {
        let current = self.children();
        if current.len() == children.len()
            && current.iter().zip(&children).all(|(a, b)| Arc::ptr_eq(a, b))
        {
            return Arc::clone(self);
        }
        match &self.node {
            FormulaNode::And(_) => Formula::and(children),
            FormulaNode::Or(_) => Formula::or(children),
            FormulaNode::Not { .. } => {
                let mut it = children.into_iter();
                match (it.next(), it.next()) {
                    (Some(subtracted), Some(superset)) => Formula::not(subtracted, superset),
                    _ => Arc::clone(self),
                }
            }
            FormulaNode::PriceFilter {
                prices, predicate, ..
            } => match children.into_iter().next() {
                // `self` was built from the same validated pair
                Some(source) => {
                    Formula::build_price_filter(source, Arc::clone(prices), predicate.clone())
                }
                None => Arc::clone(self),
            },
            FormulaNode::Observed {
                observer,
                original_cost,
                ..
            } => match children.into_iter().next() {
                Some(inner) => Formula::observed(inner, observer.clone(), *original_cost),
                None => Arc::clone(self),
            },
            _ => Arc::clone(self),
        }
    }

    /// Evaluate (at most once) and return the result.
    pub fn compute(&self) -> CandidateSet {
        self.memo.get_or_init(|| self.evaluate()).clone()
    }

    fn evaluate(&self) -> CandidateSet {
        match &self.node {
            FormulaNode::Empty => CandidateSet::empty(),
            FormulaNode::Constant(keys) | FormulaNode::Cached(keys) => keys.clone(),
            FormulaNode::Index(bitmap) => bitmap.keys().clone(),
            FormulaNode::And(children) => {
                let mut results = compute_children(children);
                results.sort_by_key(|r| r.len());
                let mut iter = results.into_iter();
                let Some(first) = iter.next() else {
                    return CandidateSet::empty();
                };
                let mut acc = first.bitmap().clone();
                for next in iter {
                    if acc.is_empty() {
                        break;
                    }
                    acc &= next.bitmap();
                }
                CandidateSet::from_bitmap(acc)
            }
            FormulaNode::Or(children) => {
                let mut acc = roaring::RoaringBitmap::new();
                for result in compute_children(children) {
                    acc |= result.bitmap();
                }
                CandidateSet::from_bitmap(acc)
            }
            FormulaNode::Not {
                subtracted,
                superset,
            } => {
                let (subtracted, superset) =
                    rayon::join(|| subtracted.compute(), || superset.compute());
                superset.and_not(&subtracted)
            }
            FormulaNode::PriceFilter {
                source,
                prices,
                predicate,
            } => {
                let candidates = source.compute().and(prices.entities());
                if predicate.is_all() {
                    return candidates;
                }
                CandidateSet::from_keys(candidates.iter().filter(|pk| {
                    prices
                        .prices_of(*pk)
                        .iter()
                        .any(|price| predicate.test_price(price))
                }))
            }
            FormulaNode::Observed {
                inner,
                observer,
                original_cost,
            } => {
                let result = inner.compute();
                observer.observe(ComputedRecord {
                    estimated_cost: *original_cost,
                    size_in_bytes: result.estimated_size_in_bytes(),
                    transactional_hash: self.transactional_hash,
                    payload: CachePayload::Filter(result.clone()),
                });
                result
            }
        }
    }
}

fn compute_children(children: &[FormulaRef]) -> Vec<CandidateSet> {
    if children.len() >= PARALLEL_CHILDREN_THRESHOLD {
        children.par_iter().map(|c| c.compute()).collect()
    } else {
        children.iter().map(|c| c.compute()).collect()
    }
}

impl CacheableElement for Formula {
    fn record_type(&self) -> RecordType {
        RecordType::FilterResult
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
