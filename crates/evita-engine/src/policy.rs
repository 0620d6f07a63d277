//! Planning policies.
//!
//! A policy decides two things per query: whether entities known up front
//! may be prefetched (and what that would cost), and how filter trees,
//! extra-result computers and pre-sorted sorters are routed through the
//! cache. `Default` is the production behavior; the other two pin one code
//! path so tests can cover both deterministically.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cache::CacheSupervisor;
use crate::engine::Session;
use crate::formula::{FacetSummaryComputer, Formula, FormulaRef};
use crate::sort::MergedSortedRecords;

/// Prefetch cost meaning "always prefer prefetching".
pub const MINIMAL_PREFETCH_COST: u64 = 0;
/// Prefetch cost meaning "never prefetch".
pub const MAXIMAL_PREFETCH_COST: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefetchPolicy {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PlanningPolicy {
    /// Cost-based prefetch, cache analysis by the live supervisor.
    #[default]
    Default,
    /// No prefetch; every cacheable element is evaluated into its cached form.
    CacheEnforcing,
    /// Always prefetch; the cache is never consulted.
    PrefetchFavouring,
}

impl PlanningPolicy {
    pub fn prefetch_policy(self) -> PrefetchPolicy {
        match self {
            PlanningPolicy::Default | PlanningPolicy::PrefetchFavouring => PrefetchPolicy::Allow,
            PlanningPolicy::CacheEnforcing => PrefetchPolicy::Deny,
        }
    }

    /// Cost of fetching `candidate_count` entities with `requirements` content
    /// parts each.
    pub fn estimate_prefetch_cost(
        self,
        candidate_count: u64,
        requirements: usize,
        user_preferred: bool,
        cost_per_field: u64,
    ) -> u64 {
        match self {
            PlanningPolicy::CacheEnforcing => MAXIMAL_PREFETCH_COST,
            PlanningPolicy::PrefetchFavouring => MINIMAL_PREFETCH_COST,
            PlanningPolicy::Default if user_preferred => MINIMAL_PREFETCH_COST,
            PlanningPolicy::Default => candidate_count
                .saturating_mul(requirements as u64)
                .saturating_mul(cost_per_field),
        }
    }

    pub fn analyse(
        self,
        supervisor: &CacheSupervisor,
        session: &Session,
        entity_type: &str,
        formula: &FormulaRef,
    ) -> FormulaRef {
        match self {
            PlanningPolicy::Default => supervisor.analyse(session, entity_type, formula),
            PlanningPolicy::CacheEnforcing => enforce_cached_form(formula),
            PlanningPolicy::PrefetchFavouring => Arc::clone(formula),
        }
    }

    pub fn analyse_extra_result(
        self,
        supervisor: &CacheSupervisor,
        session: &Session,
        entity_type: &str,
        computer: &Arc<FacetSummaryComputer>,
    ) -> Arc<FacetSummaryComputer> {
        match self {
            PlanningPolicy::Default => supervisor.analyse_extra_result(session, entity_type, computer),
            PlanningPolicy::CacheEnforcing => computer.to_cached_form(),
            PlanningPolicy::PrefetchFavouring => Arc::clone(computer),
        }
    }

    pub fn analyse_sorter(
        self,
        supervisor: &CacheSupervisor,
        session: &Session,
        entity_type: &str,
        records: &Arc<MergedSortedRecords>,
    ) -> Arc<MergedSortedRecords> {
        match self {
            PlanningPolicy::Default => supervisor.analyse_sorter(session, entity_type, records),
            PlanningPolicy::CacheEnforcing => records.to_cached_form(),
            PlanningPolicy::PrefetchFavouring => Arc::clone(records),
        }
    }
}

/// Rewrite every cacheable node into its computed, cache-shaped form.
fn enforce_cached_form(formula: &FormulaRef) -> FormulaRef {
    if formula.is_cacheable() {
        return formula.to_cached_form();
    }
    let children = formula.children();
    if children.is_empty() {
        return Arc::clone(formula);
    }
    formula.with_children(children.iter().map(enforce_cached_form).collect())
}

/// Whether to fetch the entities known up front instead of evaluating the
/// filter tree over the indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefetchDecision {
    pub prefetch: bool,
    /// Estimated cost of evaluating the filter over the indexes.
    pub filter_cost: u64,
    /// Estimated cost of fetching and filtering the entities.
    pub prefetch_cost: u64,
}

impl PrefetchDecision {
    pub fn decide(
        policy: PlanningPolicy,
        filter: &Formula,
        candidate_count: u64,
        requirements: usize,
        user_preferred: bool,
        cost_per_field: u64,
    ) -> Self {
        let filter_cost = filter.estimated_cost();
        let prefetch_cost =
            policy.estimate_prefetch_cost(candidate_count, requirements, user_preferred, cost_per_field);
        let prefetch = policy.prefetch_policy() == PrefetchPolicy::Allow
            && prefetch_cost != MAXIMAL_PREFETCH_COST
            && prefetch_cost <= filter_cost;
        tracing::trace!(
            policy = ?policy,
            candidate_count,
            filter_cost,
            prefetch_cost,
            prefetch,
            "prefetch decision"
        );
        Self {
            prefetch,
            filter_cost,
            prefetch_cost,
        }
    }
}
