//! Query pipeline.
//!
//! ```text
//! filter tree ─▶ planning policy / cache ─▶ candidate set
//!     ─▶ sorter chain ─▶ page slicer ─▶ entity fetch (page only)
//! ```
//!
//! When the query names the only entities it can ever return, the planner
//! may instead fetch those entities up front and filter their bodies
//! ([`PrefetchDecision`]). The fetched bodies are reused for the page.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use ahash::RandomState;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::bitmap::CandidateSet;
use crate::cache::{CacheStatistics, CacheSupervisor, SweeperHandle};
use crate::config::EngineOptions;
use crate::error::{EngineError, Result};
use crate::formula::{FacetBucket, FacetSummary, FacetSummaryComputer, Formula, FormulaRef};
use crate::policy::PrefetchDecision;
use crate::slicer::{ConditionalGap, OffsetAndLimit, PageSlicer};
use crate::sort::{NestedQuery, NestedQueryExecutor, SorterChain};

// ============================================================================
// Collaborator contracts
// ============================================================================

/// Caller context; cache records are scoped by its catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    catalog: String,
}

impl Session {
    pub fn new(catalog: impl Into<String>) -> Self {
        Self {
            catalog: catalog.into(),
        }
    }

    pub fn catalog(&self) -> &str {
        &self.catalog
    }
}

/// A materialized entity body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub entity_type: String,
    pub primary_key: u32,
    /// Storage version; bumped on every write of the entity.
    pub version: u64,
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl Entity {
    pub fn new(entity_type: impl Into<String>, primary_key: u32, version: u64) -> Self {
        Self {
            entity_type: entity_type.into(),
            primary_key,
            version,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&serde_json::Value> {
        self.attributes.get(name)
    }

    pub fn estimated_size_in_bytes(&self) -> u64 {
        let body = serde_json::to_vec(&self.attributes).map_or(0, |bytes| bytes.len());
        48 + self.entity_type.len() as u64 + body as u64
    }
}

/// Entity storage as seen by the pipeline.
pub trait EntityFetcher {
    /// Current version of the entity, `None` if it does not exist.
    fn entity_version(&self, entity_type: &str, primary_key: u32) -> Option<u64>;

    /// Load the body with `requirements` content parts.
    fn fetch(&self, entity_type: &str, primary_key: u32, requirements: usize) -> Result<Option<Entity>>;

    /// Complete a cached body that may have been loaded for a smaller
    /// request. `None` when `entity` already carries what `requirements`
    /// asks for.
    fn enrich(&self, _entity: &Entity, _requirements: usize) -> Result<Option<Entity>> {
        Ok(None)
    }
}

// ============================================================================
// Request / response
// ============================================================================

/// Entities the query is limited to, with a predicate over their bodies
/// equivalent to the filter tree.
#[derive(Clone)]
pub struct Prefetch {
    pub keys: CandidateSet,
    pub predicate: Arc<dyn Fn(&Entity) -> bool + Send + Sync>,
}

impl fmt::Debug for Prefetch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Prefetch").field("keys", &self.keys.len()).finish()
    }
}

#[derive(Debug, Clone)]
pub struct PageRequest {
    pub number: u64,
    pub size: u64,
    /// `(size, expression)` of each conditional gap.
    pub gaps: Vec<(u64, String)>,
}

impl PageRequest {
    pub fn new(number: u64, size: u64) -> Self {
        Self {
            number,
            size,
            gaps: Vec::new(),
        }
    }

    pub fn with_gap(mut self, size: u64, expression: impl Into<String>) -> Self {
        self.gaps.push((size, expression.into()));
        self
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(1, 20)
    }
}

#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub entity_type: String,
    pub filter: FormulaRef,
    pub ordering: SorterChain,
    pub page: PageRequest,
    pub facets: Option<Vec<FacetBucket>>,
    pub prefetch: Option<Prefetch>,
    /// Content parts requested per entity; zero means keys only.
    pub requirements: usize,
    pub prefer_prefetch: bool,
}

impl QueryRequest {
    pub fn new(entity_type: impl Into<String>, filter: FormulaRef) -> Self {
        Self {
            entity_type: entity_type.into(),
            filter,
            ordering: SorterChain::natural(),
            page: PageRequest::default(),
            facets: None,
            prefetch: None,
            requirements: 0,
            prefer_prefetch: false,
        }
    }

    pub fn with_ordering(mut self, ordering: SorterChain) -> Self {
        self.ordering = ordering;
        self
    }

    pub fn with_page(mut self, page: PageRequest) -> Self {
        self.page = page;
        self
    }

    pub fn with_facets(mut self, buckets: Vec<FacetBucket>) -> Self {
        self.facets = Some(buckets);
        self
    }

    pub fn with_prefetch(mut self, prefetch: Prefetch) -> Self {
        self.prefetch = Some(prefetch);
        self
    }

    pub fn with_requirements(mut self, requirements: usize) -> Self {
        self.requirements = requirements;
        self
    }
}

#[derive(Debug, Clone)]
pub struct QueryResponse {
    pub primary_keys: Vec<u32>,
    /// Bodies of `primary_keys` when content was requested.
    pub entities: Vec<Arc<Entity>>,
    pub page: Arc<OffsetAndLimit>,
    pub facet_summary: Option<Arc<FacetSummary>>,
    pub prefetched: bool,
}

impl QueryResponse {
    pub fn total_count(&self) -> u64 {
        self.page.total_count
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Distinct gap configurations whose slicers an engine keeps at once.
pub const SLICER_REGISTRY_CAPACITY: usize = 256;

#[derive(Debug)]
pub struct QueryEngine {
    options: EngineOptions,
    supervisor: Arc<CacheSupervisor>,
    slicers: DashMap<Vec<(u64, String)>, Arc<PageSlicer>, RandomState>,
}

impl QueryEngine {
    pub fn new(options: EngineOptions) -> Result<Self> {
        let supervisor = CacheSupervisor::new(options.cache.clone())?;
        tracing::debug!(
            policy = ?options.planning_policy,
            cache_enabled = supervisor.is_enabled(),
            cache_size_in_bytes = options.cache.cache_size_in_bytes,
            "query engine created"
        );
        Ok(Self {
            options,
            supervisor,
            slicers: DashMap::default(),
        })
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn supervisor(&self) -> &Arc<CacheSupervisor> {
        &self.supervisor
    }

    pub fn cache_statistics(&self) -> CacheStatistics {
        self.supervisor.statistics()
    }

    /// Start periodic cache re-evaluation in the background.
    pub fn start_sweeper(&self) -> Result<SweeperHandle> {
        self.supervisor
            .spawn_sweeper()
            .map_err(|err| EngineError::configuration(format!("cannot start cache sweeper: {err}")))
    }

    /// Cache- and policy-aware rewrite of a filter tree.
    pub fn plan_formula(&self, session: &Session, entity_type: &str, formula: &FormulaRef) -> FormulaRef {
        self.options
            .planning_policy
            .analyse(&self.supervisor, session, entity_type, formula)
    }

    /// Capability to run nested queries in `session`.
    pub fn nested_executor<'a>(&'a self, session: &'a Session) -> SessionExecutor<'a> {
        SessionExecutor {
            engine: self,
            session,
        }
    }

    fn slicer(&self, gaps: &[(u64, String)]) -> Result<Arc<PageSlicer>> {
        if let Some(slicer) = self.slicers.get(gaps) {
            return Ok(Arc::clone(slicer.value()));
        }
        let parsed = gaps
            .iter()
            .map(|(size, expression)| ConditionalGap::new(*size, expression))
            .collect::<Result<Vec<_>>>()?;
        let slicer = Arc::new(PageSlicer::new(parsed));
        if self.slicers.len() >= SLICER_REGISTRY_CAPACITY {
            tracing::debug!(
                capacity = SLICER_REGISTRY_CAPACITY,
                "page slicer registry full, dropping memoized slicers"
            );
            self.slicers.clear();
        }
        Ok(Arc::clone(
            self.slicers.entry(gaps.to_vec()).or_insert(slicer).value(),
        ))
    }

    pub fn evaluate(
        &self,
        session: &Session,
        request: &QueryRequest,
        fetcher: &dyn EntityFetcher,
    ) -> Result<QueryResponse> {
        let policy = self.options.planning_policy;
        let entity_type = request.entity_type.as_str();

        // filtering
        let decision = request.prefetch.as_ref().map(|prefetch| {
            PrefetchDecision::decide(
                policy,
                &request.filter,
                prefetch.keys.len(),
                request.requirements,
                request.prefer_prefetch,
                self.options.prefetch_cost_per_field,
            )
        });
        let mut prefetched: HashMap<u32, Arc<Entity>> = HashMap::new();
        let (filter, candidates) = match (&request.prefetch, decision) {
            (Some(prefetch), Some(decision)) if decision.prefetch => {
                let mut matching = Vec::new();
                for primary_key in prefetch.keys.iter() {
                    if let Some(entity) =
                        self.fetch_entity(session, entity_type, primary_key, request.requirements, fetcher)?
                    {
                        if (prefetch.predicate)(&entity) {
                            matching.push(primary_key);
                            prefetched.insert(primary_key, entity);
                        }
                    }
                }
                let candidates = CandidateSet::from_keys(matching);
                (Formula::constant(candidates.clone()), candidates)
            }
            _ => {
                let planned = self.plan_formula(session, entity_type, &request.filter);
                let candidates = planned.compute();
                (planned, candidates)
            }
        };

        let facet_summary = request.facets.as_ref().map(|buckets| {
            let computer = FacetSummaryComputer::new(Arc::clone(&filter), buckets.clone());
            policy
                .analyse_extra_result(&self.supervisor, session, entity_type, &computer)
                .compute()
        });

        // ordering and pagination
        let ordering = request
            .ordering
            .map_pre_sorted(|records| policy.analyse_sorter(&self.supervisor, session, entity_type, records));
        ordering.initialize(&self.nested_executor(session), &candidates)?;

        let page = self
            .slicer(&request.page.gaps)?
            .calculate_offset_and_limit(request.page.number, request.page.size, candidates.len())?;
        let start = usize::try_from(page.offset).unwrap_or(usize::MAX);
        let end = start.saturating_add(usize::try_from(page.limit).unwrap_or(usize::MAX));
        let primary_keys = ordering.sort(&candidates, start, end)?;

        // materialization
        let mut entities = Vec::new();
        if request.requirements > 0 {
            entities.reserve(primary_keys.len());
            for primary_key in &primary_keys {
                let entity = match prefetched.remove(primary_key) {
                    Some(entity) => Some(entity),
                    None => self.fetch_entity(
                        session,
                        entity_type,
                        *primary_key,
                        request.requirements,
                        fetcher,
                    )?,
                };
                if let Some(entity) = entity {
                    entities.push(entity);
                }
            }
        }

        tracing::trace!(
            entity_type,
            total = candidates.len(),
            returned = primary_keys.len(),
            page = page.page_number,
            prefetched = decision.is_some_and(|d| d.prefetch),
            "query evaluated"
        );
        Ok(QueryResponse {
            primary_keys,
            entities,
            page,
            facet_summary,
            prefetched: decision.is_some_and(|d| d.prefetch),
        })
    }

    fn fetch_entity(
        &self,
        session: &Session,
        entity_type: &str,
        primary_key: u32,
        requirements: usize,
        fetcher: &dyn EntityFetcher,
    ) -> Result<Option<Arc<Entity>>> {
        let Some(version) = fetcher.entity_version(entity_type, primary_key) else {
            return Ok(None);
        };
        self.supervisor.fetch_entity(
            session,
            entity_type,
            primary_key,
            version,
            || fetcher.fetch(entity_type, primary_key, requirements),
            |cached| fetcher.enrich(cached, requirements),
        )
    }
}

/// Runs nested queries of a sorter chain through the owning engine.
pub struct SessionExecutor<'a> {
    engine: &'a QueryEngine,
    session: &'a Session,
}

impl NestedQueryExecutor for SessionExecutor<'_> {
    fn execute_nested(&self, query: &NestedQuery) -> Result<Vec<u32>> {
        let planned = self
            .engine
            .plan_formula(self.session, &query.entity_type, &query.filter);
        let keys = planned.compute();
        query.ordering.initialize(self, &keys)?;
        let all = usize::try_from(keys.len()).unwrap_or(usize::MAX);
        query.ordering.sort(&keys, 0, all)
    }
}
