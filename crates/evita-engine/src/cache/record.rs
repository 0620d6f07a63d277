//! Cache bookkeeping records.
//!
//! A computation that the cache has seen but not yet decided to keep is a
//! [`CacheRecordAdept`]. The sweep may promote it to a [`CachedRecord`],
//! which starts out *empty*: the first query that meets the record after
//! promotion computes the result once more and stores it together with the
//! transactional identity hash it was computed against.
//!
//! Adept and record share one [`UsageStats`] through an `Arc`, so a usage
//! increment that races with the promotion lands on the same counters no
//! matter which of the two slots the incrementing query observed.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use crate::bitmap::CandidateSet;
use crate::engine::Entity;
use crate::error::{EngineError, Result};
use crate::formula::FacetSummary;

/// Bytes we charge each record on top of its payload.
pub const RECORD_OVERHEAD_BYTES: u64 = 64;

/// Kind of computation a cache record stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum RecordType {
    FilterResult = 0,
    SortedResult = 1,
    ExtraResult = 2,
    MaterializedEntity = 3,
}

impl RecordType {
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(RecordType::FilterResult),
            1 => Some(RecordType::SortedResult),
            2 => Some(RecordType::ExtraResult),
            3 => Some(RecordType::MaterializedEntity),
            _ => None,
        }
    }
}

/// Memoized result held by a cached record.
#[derive(Debug, Clone)]
pub enum CachePayload {
    Filter(CandidateSet),
    Sorted(Arc<[u32]>),
    Extra(Arc<FacetSummary>),
    Entity(Arc<Entity>),
}

impl CachePayload {
    pub fn record_type(&self) -> RecordType {
        match self {
            CachePayload::Filter(_) => RecordType::FilterResult,
            CachePayload::Sorted(_) => RecordType::SortedResult,
            CachePayload::Extra(_) => RecordType::ExtraResult,
            CachePayload::Entity(_) => RecordType::MaterializedEntity,
        }
    }
}

/// `max(0, usage - min_usage) * cost_ratio / size`, saturating at `u64::MAX`.
pub fn space_to_performance_ratio(
    usage: u64,
    minimal_usage_threshold: u64,
    cost_ratio: u64,
    size_in_bytes: u64,
) -> u64 {
    let effective_usage = usage.saturating_sub(minimal_usage_threshold);
    match effective_usage.checked_mul(cost_ratio) {
        Some(saved) => saved / size_in_bytes.max(1),
        None => u64::MAX,
    }
}

// ============================================================================
// Usage statistics
// ============================================================================

#[derive(Debug, Default)]
pub struct UsageStats {
    times_used: AtomicU64,
    used_since_sweep: AtomicU64,
    cooling: AtomicU32,
}

impl UsageStats {
    pub fn used(&self) {
        self.times_used.fetch_add(1, Ordering::Relaxed);
        self.used_since_sweep.fetch_add(1, Ordering::Relaxed);
    }

    pub fn times_used(&self) -> u64 {
        self.times_used.load(Ordering::Relaxed)
    }

    pub fn used_since_sweep(&self) -> u64 {
        self.used_since_sweep.load(Ordering::Relaxed)
    }

    pub fn cooling(&self) -> u32 {
        self.cooling.load(Ordering::Relaxed)
    }

    /// Capture and reset the usage since the previous sweep, then update the
    /// cooling counter accordingly. Returns the new cooling value.
    ///
    /// Increments that arrive after the swap are counted by the next sweep.
    pub(crate) fn reset(&self) -> u32 {
        let captured = self.used_since_sweep.swap(0, Ordering::AcqRel);
        if captured == 0 {
            self.cooling.fetch_add(1, Ordering::AcqRel).saturating_add(1)
        } else {
            self.cooling.store(0, Ordering::Release);
            0
        }
    }
}

// ============================================================================
// Adept
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdeptMetrics {
    /// Estimated cost one use of the record saves, captured at first computation.
    pub cost_to_performance_ratio: u64,
    pub size_in_bytes: u64,
}

#[derive(Debug)]
pub struct CacheRecordAdept {
    record_type: RecordType,
    record_hash: u64,
    stats: Arc<UsageStats>,
    metrics: OnceLock<AdeptMetrics>,
}

impl CacheRecordAdept {
    pub(crate) fn new(record_type: RecordType, record_hash: u64) -> Self {
        Self {
            record_type,
            record_hash,
            stats: Arc::default(),
            metrics: OnceLock::new(),
        }
    }

    pub fn record_type(&self) -> RecordType {
        self.record_type
    }

    pub fn record_hash(&self) -> u64 {
        self.record_hash
    }

    pub fn stats(&self) -> &UsageStats {
        &self.stats
    }

    pub fn used(&self) {
        self.stats.used();
    }

    pub fn metrics(&self) -> Option<AdeptMetrics> {
        self.metrics.get().copied()
    }

    /// Remember what the computation cost; only the first call counts.
    pub(crate) fn record_computation(&self, estimated_cost: u64, size_in_bytes: u64) {
        let _ = self.metrics.set(AdeptMetrics {
            cost_to_performance_ratio: estimated_cost,
            size_in_bytes: size_in_bytes + RECORD_OVERHEAD_BYTES,
        });
    }

    /// `None` until the adept has been computed at least once.
    pub fn space_to_performance_ratio(&self, minimal_usage_threshold: u64) -> Option<u64> {
        self.metrics().map(|m| {
            space_to_performance_ratio(
                self.stats.times_used(),
                minimal_usage_threshold,
                m.cost_to_performance_ratio,
                m.size_in_bytes,
            )
        })
    }

    /// Turn this adept into an empty cached record sharing its counters.
    pub(crate) fn promote(&self, metrics: AdeptMetrics) -> CachedRecord {
        CachedRecord {
            record_type: self.record_type,
            record_hash: self.record_hash,
            stats: Arc::clone(&self.stats),
            metrics,
            payload: OnceLock::new(),
        }
    }
}

// ============================================================================
// Cached record
// ============================================================================

#[derive(Debug)]
pub struct CachedRecord {
    record_type: RecordType,
    record_hash: u64,
    stats: Arc<UsageStats>,
    metrics: AdeptMetrics,
    payload: OnceLock<(u64, CachePayload)>,
}

impl CachedRecord {
    pub fn record_type(&self) -> RecordType {
        self.record_type
    }

    pub fn record_hash(&self) -> u64 {
        self.record_hash
    }

    pub fn stats(&self) -> &UsageStats {
        &self.stats
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.metrics.size_in_bytes
    }

    pub fn is_initialized(&self) -> bool {
        self.payload.get().is_some()
    }

    pub fn space_to_performance_ratio(&self, minimal_usage_threshold: u64) -> u64 {
        space_to_performance_ratio(
            self.stats.times_used(),
            minimal_usage_threshold,
            self.metrics.cost_to_performance_ratio,
            self.metrics.size_in_bytes,
        )
    }

    /// The payload, provided it was computed against `transactional_hash`.
    pub fn payload_for(&self, transactional_hash: u64) -> Option<&CachePayload> {
        match self.payload.get() {
            Some((tx, payload)) if *tx == transactional_hash => Some(payload),
            _ => None,
        }
    }

    pub fn payload(&self) -> Result<&CachePayload> {
        self.payload.get().map(|(_, p)| p).ok_or_else(|| {
            EngineError::premise(format!(
                "payload of cache record {:#x} accessed before it was recorded",
                self.record_hash
            ))
        })
    }

    pub fn transactional_hash(&self) -> Option<u64> {
        self.payload.get().map(|(tx, _)| *tx)
    }

    /// Store the payload. The first recording wins.
    pub(crate) fn initialize(&self, transactional_hash: u64, payload: CachePayload) -> bool {
        debug_assert_eq!(payload.record_type(), self.record_type);
        self.payload.set((transactional_hash, payload)).is_ok()
    }
}

// ============================================================================
// Observer
// ============================================================================

/// What a computation reports back to the cache once it has run.
#[derive(Debug, Clone)]
pub struct ComputedRecord {
    pub estimated_cost: u64,
    pub size_in_bytes: u64,
    pub transactional_hash: u64,
    pub payload: CachePayload,
}

/// Attached to a live computation routed through the cache.
#[derive(Debug, Clone)]
pub enum CacheObserver {
    /// Capture cost and size for the promotion decision.
    Adept(Arc<CacheRecordAdept>),
    /// Fill a freshly promoted record with its payload.
    Recording(Arc<CachedRecord>),
}

impl CacheObserver {
    pub fn observe(&self, computed: ComputedRecord) {
        match self {
            CacheObserver::Adept(adept) => {
                adept.record_computation(computed.estimated_cost, computed.size_in_bytes)
            }
            CacheObserver::Recording(record) => {
                if record.initialize(computed.transactional_hash, computed.payload) {
                    tracing::trace!(
                        record = record.record_hash(),
                        "cache record payload recorded"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratio_is_zero_below_usage_threshold() {
        assert_eq!(space_to_performance_ratio(2, 2, 1000, 10), 0);
        assert_eq!(space_to_performance_ratio(0, 5, 1000, 10), 0);
        assert_eq!(space_to_performance_ratio(4, 2, 1000, 10), 200);
    }

    #[test]
    fn ratio_saturates_on_overflow() {
        assert_eq!(space_to_performance_ratio(u64::MAX, 0, 2, 1), u64::MAX);
    }

    #[test]
    fn zero_size_does_not_divide_by_zero() {
        assert_eq!(space_to_performance_ratio(3, 1, 5, 0), 10);
    }

    #[test]
    fn record_type_tags_round_trip() {
        for ty in [
            RecordType::FilterResult,
            RecordType::SortedResult,
            RecordType::ExtraResult,
            RecordType::MaterializedEntity,
        ] {
            assert_eq!(RecordType::from_tag(ty.tag()), Some(ty));
        }
        assert_eq!(RecordType::from_tag(9), None);
    }

    #[test]
    fn cooling_increments_only_when_unused() {
        let stats = UsageStats::default();
        assert_eq!(stats.reset(), 1);
        assert_eq!(stats.reset(), 2);
        stats.used();
        assert_eq!(stats.reset(), 0);
        assert_eq!(stats.used_since_sweep(), 0);
        assert_eq!(stats.times_used(), 1);
    }

    #[test]
    fn promoted_record_shares_usage_counters() {
        let adept = CacheRecordAdept::new(RecordType::FilterResult, 42);
        adept.record_computation(1000, 100);
        let record = adept.promote(adept.metrics().unwrap());
        adept.used();
        record.stats().used();
        assert_eq!(adept.stats().times_used(), 2);
        assert_eq!(record.stats().times_used(), 2);
    }

    #[test]
    fn payload_requires_matching_transactional_hash() {
        let adept = CacheRecordAdept::new(RecordType::FilterResult, 7);
        adept.record_computation(10, 1);
        let record = adept.promote(adept.metrics().unwrap());
        assert!(matches!(record.payload(), Err(EngineError::PremiseViolation(_))));

        let keys = CandidateSet::from_keys([1, 2]);
        assert!(record.initialize(99, CachePayload::Filter(keys)));
        assert!(record.payload_for(99).is_some());
        assert!(record.payload_for(100).is_none());
        assert!(!record.initialize(100, CachePayload::Filter(CandidateSet::empty())));
    }
}
