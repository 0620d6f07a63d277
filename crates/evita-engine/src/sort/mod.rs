//! Sorter chain.
//!
//! A chain is a list of ordering stages followed by an implicit primary-key
//! stage. Every stage gets the keys no earlier stage resolved, emits the ones
//! it can order into its slice of the output window and passes the rest on
//! unchanged. The primary-key stage resolves everything, so the chain's
//! output over the full domain is always a permutation of its input.
//!
//! Stages run strictly in order: stage `n + 1` needs the remainder of stage
//! `n`.

mod context;
mod merge;
mod nested;

pub use context::SortingContext;
pub use merge::{
    Direction, MergeMode, MergedSortedRecords, SortedRecord, SortedRecordsProvider,
};
pub use nested::{NestedQuery, NestedQueryExecutor, ReferencedEntityComparator};

use std::collections::HashSet;
use std::sync::Arc;

use roaring::RoaringBitmap;

use crate::bitmap::CandidateSet;
use crate::error::{EngineError, Result};
use context::WindowWriter;

#[derive(Debug, Clone)]
pub enum Sorter {
    /// Keys in an explicit, caller-supplied order.
    Exact(Arc<[u32]>),
    /// Ascending primary keys.
    PrimaryKey,
    /// Descending primary keys.
    ReversedPrimaryKey,
    /// Merged order of pre-sorted index partitions.
    PreSorted(Arc<MergedSortedRecords>),
    /// Ascending by original identifier over internally translated keys.
    ///
    /// Pairs are `(internal, original)`, ascending by internal key.
    TranslatedPrimaryKey(Arc<[(u32, u32)]>),
    /// By a property of a referenced entity.
    Referenced(Arc<ReferencedEntityComparator>),
}

impl Sorter {
    pub fn exact(order: impl IntoIterator<Item = u32>) -> Self {
        Sorter::Exact(order.into_iter().collect::<Vec<_>>().into())
    }

    pub fn translated(pairs: impl IntoIterator<Item = (u32, u32)>) -> Self {
        let mut pairs: Vec<(u32, u32)> = pairs.into_iter().collect();
        pairs.sort_unstable();
        pairs.dedup_by_key(|(internal, _)| *internal);
        Sorter::TranslatedPrimaryKey(pairs.into())
    }

    /// Order what this stage can and slice it into the window.
    pub fn sort_and_slice(
        &self,
        ctx: SortingContext,
        out: &mut [u32],
        on_skipped: &mut dyn FnMut(u32),
    ) -> Result<SortingContext> {
        match self {
            Sorter::PrimaryKey => Ok(slice_all(&ctx, ctx.non_sorted_keys.iter(), out, on_skipped)),
            Sorter::ReversedPrimaryKey => {
                Ok(slice_all(&ctx, ctx.non_sorted_keys.iter().rev(), out, on_skipped))
            }
            Sorter::Exact(order) => {
                let resolved = order.iter().copied().filter(|k| ctx.non_sorted_keys.contains(*k));
                Ok(slice_partial(&ctx, resolved, out, on_skipped))
            }
            Sorter::PreSorted(records) => {
                let merged = records.merged_order();
                let resolved = merged.iter().copied().filter(|k| ctx.non_sorted_keys.contains(*k));
                Ok(slice_partial(&ctx, resolved, out, on_skipped))
            }
            Sorter::TranslatedPrimaryKey(pairs) => {
                let mut by_original: Vec<(u32, u32)> = pairs
                    .iter()
                    .filter(|(internal, _)| ctx.non_sorted_keys.contains(*internal))
                    .map(|(internal, original)| (*original, *internal))
                    .collect();
                by_original.sort_unstable();
                let resolved = by_original.into_iter().map(|(_, internal)| internal);
                Ok(slice_partial(&ctx, resolved, out, on_skipped))
            }
            Sorter::Referenced(comparator) => {
                let resolved = comparator.resolve(&ctx.non_sorted_keys)?;
                Ok(slice_partial(&ctx, resolved.into_iter(), out, on_skipped))
            }
        }
    }
}

/// A stage that resolves every remaining key.
fn slice_all(
    ctx: &SortingContext,
    ordered: impl Iterator<Item = u32>,
    out: &mut [u32],
    on_skipped: &mut dyn FnMut(u32),
) -> SortingContext {
    let mut writer = WindowWriter::new(ctx, out, on_skipped);
    for key in ordered {
        if writer.is_past_window() {
            break;
        }
        writer.push(key);
    }
    let (read, skipped) = writer.finish();
    ctx.create_result_context(RoaringBitmap::new(), read, skipped)
}

/// A stage that resolves some keys; duplicates in `ordered` are ignored.
fn slice_partial(
    ctx: &SortingContext,
    ordered: impl Iterator<Item = u32>,
    out: &mut [u32],
    on_skipped: &mut dyn FnMut(u32),
) -> SortingContext {
    let mut resolved = RoaringBitmap::new();
    let mut writer = WindowWriter::new(ctx, out, on_skipped);
    for key in ordered {
        if resolved.insert(key) {
            writer.push(key);
        }
    }
    let (read, skipped) = writer.finish();
    let remaining = &ctx.non_sorted_keys - &resolved;
    ctx.create_result_context(remaining, read, skipped)
}

// ============================================================================
// Chain
// ============================================================================

/// One ordering constraint of a query.
#[derive(Debug, Clone)]
pub struct SortStage {
    /// What the stage orders by (`attribute:name`, `reference:brand`, …).
    pub scope: String,
    pub sorter: Sorter,
}

impl SortStage {
    pub fn new(scope: impl Into<String>, sorter: Sorter) -> Self {
        Self {
            scope: scope.into(),
            sorter,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SorterChain {
    stages: Vec<SortStage>,
}

impl SorterChain {
    /// Build a chain; ordering the same scope twice is rejected.
    pub fn new(stages: Vec<SortStage>) -> Result<Self> {
        let mut seen = HashSet::new();
        for stage in &stages {
            if !seen.insert(stage.scope.as_str()) {
                return Err(EngineError::configuration(format!(
                    "duplicate ordering constraint on `{}`",
                    stage.scope
                )));
            }
        }
        Ok(Self { stages })
    }

    /// Primary-key order only.
    pub fn natural() -> Self {
        Self::default()
    }

    pub fn stages(&self) -> &[SortStage] {
        &self.stages
    }

    /// Initialize every nested comparator against the filtered entities.
    pub fn initialize(&self, executor: &dyn NestedQueryExecutor, filtered: &CandidateSet) -> Result<()> {
        for stage in &self.stages {
            if let Sorter::Referenced(comparator) = &stage.sorter {
                comparator.initialize(executor, filtered)?;
            }
        }
        Ok(())
    }

    /// Replace pre-sorted stages through `f` (cache analysis).
    pub fn map_pre_sorted(
        &self,
        mut f: impl FnMut(&Arc<MergedSortedRecords>) -> Arc<MergedSortedRecords>,
    ) -> Self {
        let stages = self
            .stages
            .iter()
            .map(|stage| match &stage.sorter {
                Sorter::PreSorted(records) => {
                    SortStage::new(stage.scope.clone(), Sorter::PreSorted(f(records)))
                }
                _ => stage.clone(),
            })
            .collect();
        Self { stages }
    }

    /// Keys of `keys` at ordered positions `[start, end)`.
    pub fn sort(&self, keys: &CandidateSet, start: usize, end: usize) -> Result<Vec<u32>> {
        self.sort_and_slice(keys, start, end, &mut |_| {})
    }

    /// Like [`SorterChain::sort`]; keys ordered before `start` go to
    /// `on_skipped`.
    pub fn sort_and_slice(
        &self,
        keys: &CandidateSet,
        start: usize,
        end: usize,
        on_skipped: &mut dyn FnMut(u32),
    ) -> Result<Vec<u32>> {
        let window = end.saturating_sub(start);
        let capacity = window.min(usize::try_from(keys.len()).unwrap_or(usize::MAX));
        let mut out = vec![0u32; capacity];
        let mut ctx = SortingContext::new(keys.bitmap().clone(), start, end);

        let terminal = Sorter::PrimaryKey;
        let sorters = self.stages.iter().map(|s| &s.sorter).chain(std::iter::once(&terminal));
        for sorter in sorters {
            if ctx.non_sorted_keys.is_empty() || ctx.is_window_filled() {
                break;
            }
            ctx = sorter.sort_and_slice(ctx, &mut out, &mut *on_skipped)?;
        }
        out.truncate(ctx.peak);
        Ok(out)
    }
}
