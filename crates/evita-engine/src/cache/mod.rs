//! Adaptive result cache.
//!
//! The [`CacheSupervisor`] is what the planner talks to. Given a formula (or
//! an extra-result computer, a merged sorter, an entity fetch) it decides,
//! from structural metadata only, whether a memoized result can stand in for
//! the computation:
//!
//! - a valid cached record (content hash *and* transactional identity hash
//!   match) turns the computation into a constant surrogate,
//! - a freshly promoted record that has no payload yet wraps the computation
//!   so the result gets recorded,
//! - anything else is tracked as an adept whose first computation reports
//!   its cost and size.
//!
//! Which adepts become cached records is decided by the periodic sweep in
//! [`eden`]. When caching is disabled every `analyse_*` call returns its input
//! and no bookkeeping is allocated.

mod eden;
mod record;

pub use eden::{CacheEden, CacheStatistics, Lookup, SweepKind, SweepReport};
pub use record::{
    space_to_performance_ratio, AdeptMetrics, CachePayload, CacheObserver, CacheRecordAdept,
    CachedRecord, ComputedRecord, RecordType, UsageStats, RECORD_OVERHEAD_BYTES,
};

use std::sync::{mpsc, Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use evita_common::{hash_longs, hash_str};

use crate::config::{CacheOptions, DEFAULT_PREFETCH_COST_PER_FIELD};
use crate::engine::{Entity, Session};
use crate::error::Result;
use crate::formula::{FacetSummaryComputer, Formula, FormulaRef};
use crate::sort::MergedSortedRecords;

/// A computation the cache can stand in for.
pub trait CacheableElement {
    fn record_type(&self) -> RecordType;
    /// Structural hash; never depends on computed content.
    fn content_hash(&self) -> u64;
    /// Fingerprint of the index versions the computation reads.
    fn transactional_hash(&self) -> u64;
    fn estimated_cost(&self) -> u64;
}

/// Key of a cache record: catalog, entity type, kind and structure.
pub fn record_hash(session: &Session, entity_type: &str, element: &dyn CacheableElement) -> u64 {
    hash_longs(&[
        hash_str(session.catalog()),
        hash_str(entity_type),
        u64::from(element.record_type().tag()),
        element.content_hash(),
    ])
}

fn entity_record_hash(session: &Session, entity_type: &str, primary_key: u32) -> u64 {
    hash_longs(&[
        hash_str(session.catalog()),
        u64::from(primary_key),
        hash_str(entity_type),
        u64::from(RecordType::MaterializedEntity.tag()),
    ])
}

pub struct CacheSupervisor {
    options: CacheOptions,
    eden: Option<CacheEden>,
    this: Weak<CacheSupervisor>,
}

impl std::fmt::Debug for CacheSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheSupervisor")
            .field("enabled", &self.is_enabled())
            .field("statistics", &self.statistics())
            .finish()
    }
}

impl CacheSupervisor {
    pub fn new(options: CacheOptions) -> Result<Arc<Self>> {
        options.validate()?;
        let eden = options.enabled.then(|| CacheEden::new(options.clone()));
        Ok(Arc::new_cyclic(|this| Self {
            options,
            eden,
            this: this.clone(),
        }))
    }

    pub fn disabled() -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            options: CacheOptions::disabled(),
            eden: None,
            this: this.clone(),
        })
    }

    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    pub fn is_enabled(&self) -> bool {
        self.eden.is_some()
    }

    pub fn adept_count(&self) -> usize {
        self.eden.as_ref().map_or(0, CacheEden::adept_count)
    }

    pub fn statistics(&self) -> CacheStatistics {
        self.eden
            .as_ref()
            .map(CacheEden::statistics)
            .unwrap_or_default()
    }

    /// Re-evaluate adepts and records now; `None` if disabled or a sweep is
    /// already running.
    pub fn evaluate(&self) -> Option<SweepReport> {
        self.eden.as_ref().and_then(CacheEden::evaluate)
    }

    fn lookup(&self, session: &Session, entity_type: &str, element: &dyn CacheableElement) -> Option<Lookup> {
        let eden = self.eden.as_ref()?;
        if element.estimated_cost() < self.options.minimal_complexity_threshold {
            return None;
        }
        let key = record_hash(session, entity_type, element);
        Some(self.lookup_in(eden, key, element.record_type(), element.transactional_hash()))
    }

    fn lookup_in(&self, eden: &CacheEden, key: u64, record_type: RecordType, transactional_hash: u64) -> Lookup {
        let (lookup, schedule) = eden.lookup_scheduling(key, record_type, transactional_hash);
        if schedule {
            self.schedule_anteroom_sweep();
        }
        lookup
    }

    /// Run the pending anteroom sweep on the rayon pool.
    fn schedule_anteroom_sweep(&self) {
        let supervisor = self.this.clone();
        rayon::spawn(move || {
            let Some(supervisor) = supervisor.upgrade() else {
                return;
            };
            if let Some(eden) = &supervisor.eden {
                if eden.evaluate_anteroom().is_none() {
                    tracing::trace!("anteroom sweep folded into the running sweep");
                }
            }
        });
    }

    // ========================================================================
    // Analysis
    // ========================================================================

    /// Rewrite a filter tree so cached sub-results replace their computation.
    pub fn analyse(&self, session: &Session, entity_type: &str, formula: &FormulaRef) -> FormulaRef {
        if self.eden.is_none() {
            return Arc::clone(formula);
        }
        self.analyse_formula(session, entity_type, formula)
    }

    fn analyse_formula(&self, session: &Session, entity_type: &str, formula: &FormulaRef) -> FormulaRef {
        if formula.is_cacheable() {
            match self.lookup(session, entity_type, &**formula) {
                Some(Lookup::Hit(CachePayload::Filter(result))) => {
                    return Formula::cached_surrogate(formula, result);
                }
                Some(Lookup::Record(record)) => {
                    let live = self.analyse_children(session, entity_type, formula);
                    return Formula::observed(
                        live,
                        CacheObserver::Recording(record),
                        formula.estimated_cost(),
                    );
                }
                Some(Lookup::Adept(adept)) => {
                    let live = self.analyse_children(session, entity_type, formula);
                    return Formula::observed(
                        live,
                        CacheObserver::Adept(adept),
                        formula.estimated_cost(),
                    );
                }
                Some(Lookup::Hit(_)) | Some(Lookup::Stale) | None => {}
            }
        }
        self.analyse_children(session, entity_type, formula)
    }

    fn analyse_children(&self, session: &Session, entity_type: &str, formula: &FormulaRef) -> FormulaRef {
        let children = formula.children();
        if children.is_empty() {
            return Arc::clone(formula);
        }
        let rewritten = children
            .iter()
            .map(|child| self.analyse_formula(session, entity_type, child))
            .collect();
        formula.with_children(rewritten)
    }

    pub fn analyse_extra_result(
        &self,
        session: &Session,
        entity_type: &str,
        computer: &Arc<FacetSummaryComputer>,
    ) -> Arc<FacetSummaryComputer> {
        match self.lookup(session, entity_type, &**computer) {
            Some(Lookup::Hit(CachePayload::Extra(summary))) => computer.with_cached(summary),
            Some(Lookup::Record(record)) => computer.with_observer(CacheObserver::Recording(record)),
            Some(Lookup::Adept(adept)) => computer.with_observer(CacheObserver::Adept(adept)),
            _ => Arc::clone(computer),
        }
    }

    pub fn analyse_sorter(
        &self,
        session: &Session,
        entity_type: &str,
        records: &Arc<MergedSortedRecords>,
    ) -> Arc<MergedSortedRecords> {
        match self.lookup(session, entity_type, &**records) {
            Some(Lookup::Hit(CachePayload::Sorted(order))) => records.with_cached(order),
            Some(Lookup::Record(record)) => records.with_observer(CacheObserver::Recording(record)),
            Some(Lookup::Adept(adept)) => records.with_observer(CacheObserver::Adept(adept)),
            _ => Arc::clone(records),
        }
    }

    /// Fetch an entity through the cache.
    ///
    /// A cached body is served only when it carries `version`, completed by
    /// `enrich` when it was loaded for a smaller request. Otherwise `fetch`
    /// is called and its result may be recorded for later.
    pub fn fetch_entity(
        &self,
        session: &Session,
        entity_type: &str,
        primary_key: u32,
        version: u64,
        fetch: impl FnOnce() -> Result<Option<Entity>>,
        enrich: impl FnOnce(&Entity) -> Result<Option<Entity>>,
    ) -> Result<Option<Arc<Entity>>> {
        let Some(eden) = &self.eden else {
            return Ok(fetch()?.map(Arc::new));
        };
        let key = entity_record_hash(session, entity_type, primary_key);
        let observer = match self.lookup_in(eden, key, RecordType::MaterializedEntity, version) {
            Lookup::Hit(CachePayload::Entity(cached)) => {
                return match enrich(cached.as_ref())? {
                    Some(richer) => {
                        tracing::trace!(primary_key, entity_type, "cached entity enriched");
                        Ok(Some(Arc::new(richer)))
                    }
                    None => Ok(Some(cached)),
                };
            }
            Lookup::Record(record) => Some(CacheObserver::Recording(record)),
            Lookup::Adept(adept) => Some(CacheObserver::Adept(adept)),
            Lookup::Hit(_) | Lookup::Stale => None,
        };
        let entity = fetch()?.map(Arc::new);
        if let (Some(observer), Some(entity)) = (observer, &entity) {
            let fields = entity.attributes.len().max(1) as u64;
            observer.observe(ComputedRecord {
                estimated_cost: fields.saturating_mul(DEFAULT_PREFETCH_COST_PER_FIELD),
                size_in_bytes: entity.estimated_size_in_bytes(),
                transactional_hash: entity.version,
                payload: CachePayload::Entity(Arc::clone(entity)),
            });
        }
        Ok(entity)
    }

    // ========================================================================
    // Background sweeper
    // ========================================================================

    /// Start the periodic re-evaluation thread.
    ///
    /// The thread holds only a `Weak` reference and ends when the supervisor
    /// is dropped or the handle is stopped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> std::io::Result<SweeperHandle> {
        let period = Duration::from_millis(self.options.reevaluate_every_millis.max(1));
        let supervisor: Weak<CacheSupervisor> = Arc::downgrade(self);
        let (tx, rx) = mpsc::channel();
        let thread = std::thread::Builder::new()
            .name("evita_cache_sweeper".to_string())
            .spawn(move || loop {
                match rx.recv_timeout(period) {
                    Ok(SweeperCommand::Sweep) | Err(mpsc::RecvTimeoutError::Timeout) => {
                        let Some(supervisor) = supervisor.upgrade() else {
                            break;
                        };
                        if supervisor.is_enabled() && supervisor.evaluate().is_none() {
                            tracing::warn!("cache sweep skipped, previous sweep still running");
                        }
                    }
                    Ok(SweeperCommand::Shutdown) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                        break
                    }
                }
            })?;
        Ok(SweeperHandle {
            tx,
            thread: Some(thread),
        })
    }
}

enum SweeperCommand {
    Sweep,
    Shutdown,
}

pub struct SweeperHandle {
    tx: mpsc::Sender<SweeperCommand>,
    thread: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Ask for a sweep without waiting for the period to elapse.
    pub fn sweep_now(&self) {
        let _ = self.tx.send(SweeperCommand::Sweep);
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.tx.send(SweeperCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
