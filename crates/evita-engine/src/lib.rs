//! Query evaluation and adaptive result caching.
//!
//! A parsed query reaches this crate as a tree of [`Formula`] nodes over
//! versioned index bitmaps. The [`QueryEngine`] pipeline then
//!
//! 1. lets the [`PlanningPolicy`] decide between prefetching entities and
//!    index-only evaluation, and routes cacheable sub-trees through the
//!    [`CacheSupervisor`],
//! 2. evaluates the (possibly cache-substituted) tree into a
//!    [`CandidateSet`],
//! 3. orders it with a [`SorterChain`] and carves out the requested page with
//!    a [`PageSlicer`],
//! 4. materializes entity bodies for that page only.
//!
//! The cache learns which computations are worth memoizing: every cacheable
//! element first becomes an adept that measures its cost and size, and a
//! periodic sweep promotes the best space-to-performance ratios into a
//! bounded table, cooling off and expiring what is no longer used.

pub mod bitmap;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod formula;
pub mod policy;
pub mod predicate;
pub mod slicer;
pub mod sort;

pub use bitmap::{CandidateSet, IndexId, IndexedBitmap, PriceIndex, PriceRecord};
pub use cache::{
    CacheStatistics, CacheSupervisor, CacheableElement, RecordType, SweepReport, SweeperHandle,
};
pub use config::{CacheOptions, EngineOptions, DEFAULT_PREFETCH_COST_PER_FIELD};
pub use engine::{
    Entity, EntityFetcher, PageRequest, Prefetch, QueryEngine, QueryRequest, QueryResponse,
    Session,
};
pub use error::{EngineError, Result};
pub use formula::{FacetBucket, FacetSummary, FacetSummaryComputer, Formula, FormulaNode, FormulaRef};
pub use policy::{PlanningPolicy, PrefetchDecision, PrefetchPolicy};
pub use predicate::{AmountPredicate, ValueMode};
pub use slicer::{ConditionalGap, OffsetAndLimit, PageSlicer};
pub use sort::{
    Direction, MergeMode, MergedSortedRecords, NestedQuery, NestedQueryExecutor,
    ReferencedEntityComparator, SortStage, SortedRecord, SortedRecordsProvider, Sorter,
    SorterChain, SortingContext,
};
