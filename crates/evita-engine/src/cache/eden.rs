//! The bounded record table and its re-evaluation sweep.
//!
//! All adepts and cached records live in one concurrent map keyed by the
//! record hash. Queries only ever touch single entries (increment a counter,
//! insert an adept); the sweep is the only operation that looks at the table
//! as a whole and it runs under a `try_lock` so at most one sweep is ever in
//! flight and no query waits for it.
//!
//! Sweep:
//! 1. every cached record captures and resets its usage since the previous
//!    sweep; records that stayed unused for more than `cool_enough` sweeps
//!    expire (periodic sweeps only),
//! 2. computed adepts that fit `max_record_size_in_bytes` and whose ratio is
//!    above `minimal_space_to_performance_ratio` join the surviving records
//!    as candidates,
//! 3. candidates are ranked by space-to-performance ratio and admitted until
//!    the byte budget is exhausted; cached records that fall out are evicted
//!    and admitted adepts are promoted in place,
//! 4. adepts that were not promoted, saw no use since the previous sweep and
//!    are not held by any running computation are discarded.
//!
//! When more adepts pile up than `anteroom_record_limit` allows, the lookup
//! that crossed the limit asks for an anteroom sweep. Requests coalesce: only
//! one is pending at a time, and the caller runs it off the query thread. An
//! anteroom sweep ranks and promotes like a periodic one but leaves record
//! cooling alone, so bursts of new queries cannot expire hot records.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use super::record::{CachePayload, CacheRecordAdept, CachedRecord, RecordType};
use crate::config::CacheOptions;

#[derive(Debug, Clone)]
pub(crate) enum CacheSlot {
    Adept(Arc<CacheRecordAdept>),
    Cached(Arc<CachedRecord>),
}

/// Result of consulting the table for one computation.
#[derive(Debug, Clone)]
pub enum Lookup {
    /// A valid payload for the requested transactional identity.
    Hit(CachePayload),
    /// A promoted record awaiting its payload.
    Record(Arc<CachedRecord>),
    /// The computation is tracked as an adept.
    Adept(Arc<CacheRecordAdept>),
    /// A record exists but was computed against other index versions.
    Stale,
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub promoted: usize,
    pub evicted: usize,
    pub expired: usize,
    pub discarded_adepts: usize,
    pub records: usize,
    pub adepts: usize,
    pub used_bytes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStatistics {
    pub hits: u64,
    pub misses: u64,
    pub records: usize,
    pub adepts: usize,
    pub used_bytes: u64,
    pub sweeps: u64,
}

/// What triggered a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepKind {
    /// The regular re-evaluation; advances cooling and expires records.
    Periodic,
    /// Too many adepts; ranks and promotes without touching record cooling.
    Anteroom,
}

enum Candidate {
    Adept(Arc<CacheRecordAdept>),
    Cached(Arc<CachedRecord>),
}

struct Ranked {
    key: u64,
    ratio: u64,
    size: u64,
    candidate: Candidate,
}

pub struct CacheEden {
    options: CacheOptions,
    records: DashMap<u64, CacheSlot, ahash::RandomState>,
    adept_count: AtomicUsize,
    record_count: AtomicUsize,
    used_bytes: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    sweeps: AtomicU64,
    anteroom_sweep_pending: AtomicBool,
    sweep_lock: Mutex<()>,
}

impl CacheEden {
    pub fn new(options: CacheOptions) -> Self {
        Self {
            options,
            records: DashMap::with_hasher(ahash::RandomState::new()),
            adept_count: AtomicUsize::new(0),
            record_count: AtomicUsize::new(0),
            used_bytes: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sweeps: AtomicU64::new(0),
            anteroom_sweep_pending: AtomicBool::new(false),
            sweep_lock: Mutex::new(()),
        }
    }

    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    pub fn adept_count(&self) -> usize {
        self.adept_count.load(Ordering::Relaxed)
    }

    pub fn statistics(&self) -> CacheStatistics {
        CacheStatistics {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            records: self.record_count.load(Ordering::Relaxed),
            adepts: self.adept_count(),
            used_bytes: self.used_bytes.load(Ordering::Relaxed),
            sweeps: self.sweeps.load(Ordering::Relaxed),
        }
    }

    /// Register one use of the computation identified by `record_hash`.
    pub fn lookup(&self, record_hash: u64, record_type: RecordType, transactional_hash: u64) -> Lookup {
        self.lookup_scheduling(record_hash, record_type, transactional_hash).0
    }

    /// [`lookup`](Self::lookup), also telling whether this call is the one
    /// that must schedule an anteroom sweep.
    pub fn lookup_scheduling(
        &self,
        record_hash: u64,
        record_type: RecordType,
        transactional_hash: u64,
    ) -> (Lookup, bool) {
        // clone the slot out so no shard guard is held past this line
        let existing = self.records.get(&record_hash).map(|r| r.value().clone());
        let (slot, adepts) = match existing {
            Some(slot) => (slot, None),
            None => {
                let mut inserted = false;
                let slot = self
                    .records
                    .entry(record_hash)
                    .or_insert_with(|| {
                        inserted = true;
                        CacheSlot::Adept(Arc::new(CacheRecordAdept::new(record_type, record_hash)))
                    })
                    .value()
                    .clone();
                let adepts = inserted.then(|| self.adept_count.fetch_add(1, Ordering::Relaxed) + 1);
                (slot, adepts)
            }
        };
        // the use is counted before any sweep can look at the new adept
        let lookup = self.classify(slot, transactional_hash);
        let schedule = adepts.is_some_and(|adepts| self.request_anteroom_sweep(adepts));
        (lookup, schedule)
    }

    fn request_anteroom_sweep(&self, adepts: usize) -> bool {
        if adepts <= self.options.anteroom_record_limit {
            return false;
        }
        let first = self
            .anteroom_sweep_pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            tracing::debug!(
                adepts,
                limit = self.options.anteroom_record_limit,
                "anteroom full, requesting cache sweep"
            );
        }
        first
    }

    /// Whether an anteroom sweep was requested and has not run yet.
    pub fn anteroom_sweep_pending(&self) -> bool {
        self.anteroom_sweep_pending.load(Ordering::Acquire)
    }

    fn classify(&self, slot: CacheSlot, transactional_hash: u64) -> Lookup {
        match slot {
            CacheSlot::Adept(adept) => {
                adept.used();
                self.misses.fetch_add(1, Ordering::Relaxed);
                Lookup::Adept(adept)
            }
            CacheSlot::Cached(record) => {
                if let Some(payload) = record.payload_for(transactional_hash) {
                    record.stats().used();
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(record = record.record_hash(), "cache hit");
                    return Lookup::Hit(payload.clone());
                }
                self.misses.fetch_add(1, Ordering::Relaxed);
                if record.is_initialized() {
                    // not counted as a use: a stale record must cool off and expire
                    tracing::trace!(
                        record = record.record_hash(),
                        "cache record is stale for current index versions"
                    );
                    Lookup::Stale
                } else {
                    record.stats().used();
                    Lookup::Record(record)
                }
            }
        }
    }

    /// Run a pending anteroom sweep.
    ///
    /// `None` when a sweep is already running; that sweep serves the request.
    pub fn evaluate_anteroom(&self) -> Option<SweepReport> {
        let report = self.sweep(SweepKind::Anteroom);
        if report.is_none() {
            self.anteroom_sweep_pending.store(false, Ordering::Release);
        }
        report
    }

    /// Run a periodic sweep unless one is already running.
    pub fn evaluate(&self) -> Option<SweepReport> {
        self.sweep(SweepKind::Periodic)
    }

    fn sweep(&self, kind: SweepKind) -> Option<SweepReport> {
        let _guard = self.sweep_lock.try_lock()?;
        self.anteroom_sweep_pending.store(false, Ordering::Release);
        let min_usage = u64::from(self.options.minimal_usage_threshold);
        let mut report = SweepReport::default();
        let mut ranked: Vec<Ranked> = Vec::new();
        let mut expired: Vec<(u64, Arc<CachedRecord>)> = Vec::new();
        let mut idle_adepts: Vec<(u64, Arc<CacheRecordAdept>)> = Vec::new();

        for entry in self.records.iter() {
            let key = *entry.key();
            match entry.value() {
                CacheSlot::Cached(record) => {
                    let cooled_off = kind == SweepKind::Periodic
                        && record.stats().reset() > self.options.cool_enough;
                    if cooled_off {
                        expired.push((key, record.clone()));
                    } else {
                        ranked.push(Ranked {
                            key,
                            ratio: record.space_to_performance_ratio(min_usage),
                            size: record.size_in_bytes(),
                            candidate: Candidate::Cached(record.clone()),
                        });
                    }
                }
                CacheSlot::Adept(adept) => {
                    let idle = adept.stats().reset() > 0;
                    let eligible = adept.metrics().and_then(|metrics| {
                        let ratio = adept.space_to_performance_ratio(min_usage)?;
                        (metrics.size_in_bytes <= self.options.max_record_size_in_bytes
                            && ratio > self.options.minimal_space_to_performance_ratio)
                            .then_some((ratio, metrics.size_in_bytes))
                    });
                    match eligible {
                        Some((ratio, size)) => ranked.push(Ranked {
                            key,
                            ratio,
                            size,
                            candidate: Candidate::Adept(adept.clone()),
                        }),
                        None if idle => idle_adepts.push((key, adept.clone())),
                        None => {}
                    }
                }
            }
        }

        ranked.sort_by(|a, b| b.ratio.cmp(&a.ratio).then(a.key.cmp(&b.key)));

        let mut used_bytes = 0u64;
        let mut admitted_records = 0usize;
        for item in ranked {
            let fits = used_bytes.saturating_add(item.size) <= self.options.cache_size_in_bytes;
            match item.candidate {
                Candidate::Cached(_) if fits => {
                    used_bytes += item.size;
                    admitted_records += 1;
                }
                Candidate::Cached(record) => {
                    if self.remove_record(item.key, &record) {
                        report.evicted += 1;
                    }
                }
                Candidate::Adept(adept) if fits => {
                    if self.promote(item.key, &adept) {
                        used_bytes += item.size;
                        admitted_records += 1;
                        report.promoted += 1;
                    }
                }
                Candidate::Adept(adept) => {
                    if adept.stats().used_since_sweep() == 0 && adept.stats().cooling() > 0 {
                        idle_adepts.push((item.key, adept));
                    }
                }
            }
        }

        for (key, record) in expired {
            if self.remove_record(key, &record) {
                report.expired += 1;
            }
        }

        for (key, adept) in idle_adepts {
            // the table and `adept` hold the only references; any other holder
            // is a lookup in flight that will still report to this adept
            let removed = self.records.remove_if(&key, |_, slot| match slot {
                CacheSlot::Adept(current) => {
                    Arc::ptr_eq(current, &adept)
                        && Arc::strong_count(current) == 2
                        && current.stats().used_since_sweep() == 0
                }
                CacheSlot::Cached(_) => false,
            });
            if removed.is_some() {
                self.adept_count.fetch_sub(1, Ordering::Relaxed);
                report.discarded_adepts += 1;
            }
        }

        self.used_bytes.store(used_bytes, Ordering::Relaxed);
        self.record_count.store(admitted_records, Ordering::Relaxed);
        let (hits, misses) = match kind {
            SweepKind::Periodic => (
                self.hits.swap(0, Ordering::Relaxed),
                self.misses.swap(0, Ordering::Relaxed),
            ),
            SweepKind::Anteroom => (
                self.hits.load(Ordering::Relaxed),
                self.misses.load(Ordering::Relaxed),
            ),
        };
        self.sweeps.fetch_add(1, Ordering::Relaxed);

        report.records = admitted_records;
        report.adepts = self.adept_count();
        report.used_bytes = used_bytes;

        tracing::debug!(
            ?kind,
            records = report.records,
            used_bytes = report.used_bytes,
            budget = self.options.cache_size_in_bytes,
            promoted = report.promoted,
            evicted = report.evicted,
            expired = report.expired,
            discarded_adepts = report.discarded_adepts,
            adepts = report.adepts,
            hits,
            misses,
            "cache re-evaluated"
        );
        Some(report)
    }

    /// Replace the adept slot with an empty cached record, in place.
    fn promote(&self, key: u64, adept: &Arc<CacheRecordAdept>) -> bool {
        let Some(metrics) = adept.metrics() else {
            return false;
        };
        let Some(mut slot) = self.records.get_mut(&key) else {
            return false;
        };
        if !matches!(&*slot, CacheSlot::Adept(current) if Arc::ptr_eq(current, adept)) {
            return false;
        }
        *slot = CacheSlot::Cached(Arc::new(adept.promote(metrics)));
        drop(slot);
        self.adept_count.fetch_sub(1, Ordering::Relaxed);
        true
    }

    fn remove_record(&self, key: u64, record: &Arc<CachedRecord>) -> bool {
        self.records
            .remove_if(&key, |_, slot| {
                matches!(slot, CacheSlot::Cached(current) if Arc::ptr_eq(current, record))
            })
            .is_some()
    }
}
