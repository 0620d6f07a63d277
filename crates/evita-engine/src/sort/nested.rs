//! Ordering by a property of a referenced entity.
//!
//! Ordering products by the `order` attribute of their brand needs the
//! brands sorted first. The comparator therefore runs a nested query over
//! the referenced entity type (through the injected [`NestedQueryExecutor`],
//! so sorting does not depend on the planner), turns the nested result order
//! into a position table and ranks every outer entity by the best position
//! among its references.
//!
//! Outer entities with no resolvable reference are collected into a
//! non-sorted side list and left for the next stage of the chain.

use std::cmp::Ordering;
use std::sync::{Arc, OnceLock};

use crate::bitmap::CandidateSet;
use crate::error::{EngineError, Result};
use crate::formula::FormulaRef;

use super::SorterChain;

/// A query over the referenced entity type.
#[derive(Debug, Clone)]
pub struct NestedQuery {
    pub entity_type: String,
    pub filter: FormulaRef,
    pub ordering: SorterChain,
}

/// Capability to plan and run a nested query to completion.
pub trait NestedQueryExecutor {
    /// All matching referenced keys in the nested query's order.
    fn execute_nested(&self, query: &NestedQuery) -> Result<Vec<u32>>;
}

#[derive(Debug)]
struct ComparatorState {
    input: CandidateSet,
    /// `(outer entity, position)` ascending by entity.
    positions: Vec<(u32, u32)>,
    non_sorted: Vec<u32>,
}

#[derive(Debug)]
pub struct ReferencedEntityComparator {
    query: NestedQuery,
    /// `(outer entity, referenced entity)` ascending.
    references: Arc<[(u32, u32)]>,
    state: OnceLock<ComparatorState>,
}

impl ReferencedEntityComparator {
    pub fn new(query: NestedQuery, references: impl IntoIterator<Item = (u32, u32)>) -> Self {
        let mut references: Vec<(u32, u32)> = references.into_iter().collect();
        references.sort_unstable();
        references.dedup();
        Self {
            query,
            references: references.into(),
            state: OnceLock::new(),
        }
    }

    pub fn query(&self) -> &NestedQuery {
        &self.query
    }

    pub fn is_initialized(&self) -> bool {
        self.state.get().is_some()
    }

    /// Run the nested query and index positions for `filtered` entities.
    ///
    /// Initializing again with the same input is a no-op.
    pub fn initialize(&self, executor: &dyn NestedQueryExecutor, filtered: &CandidateSet) -> Result<()> {
        if let Some(state) = self.state.get() {
            return if state.input == *filtered {
                Ok(())
            } else {
                Err(EngineError::premise(format!(
                    "comparator over `{}` already initialized for another entity set",
                    self.query.entity_type
                )))
            };
        }

        let nested_order = executor.execute_nested(&self.query)?;
        // (referenced entity, position) for binary search
        let mut referenced_positions: Vec<(u32, u32)> = nested_order
            .iter()
            .enumerate()
            .map(|(position, key)| (*key, position as u32))
            .collect();
        referenced_positions.sort_unstable();

        let mut positions = Vec::new();
        let mut non_sorted = Vec::new();
        for entity in filtered.iter() {
            let start = self.references.partition_point(|(e, _)| *e < entity);
            let end = self.references.partition_point(|(e, _)| *e <= entity);
            let best = self.references[start..end]
                .iter()
                .filter_map(|(_, referenced)| {
                    referenced_positions
                        .binary_search_by_key(referenced, |(key, _)| *key)
                        .ok()
                        .map(|i| referenced_positions[i].1)
                })
                .min();
            match best {
                Some(position) => positions.push((entity, position)),
                None => non_sorted.push(entity),
            }
        }
        tracing::trace!(
            entity_type = %self.query.entity_type,
            resolved = positions.len(),
            non_sorted = non_sorted.len(),
            "nested comparator initialized"
        );

        // a concurrent initializer may have won; its state is equivalent
        let _ = self.state.set(ComparatorState {
            input: filtered.clone(),
            positions,
            non_sorted,
        });
        Ok(())
    }

    fn state(&self) -> Result<&ComparatorState> {
        self.state.get().ok_or_else(|| {
            EngineError::premise(format!(
                "comparator over `{}` used before initialization",
                self.query.entity_type
            ))
        })
    }

    /// Position of `entity` in the nested order, if it has one.
    pub fn position_of(&self, entity: u32) -> Result<Option<u32>> {
        let state = self.state()?;
        Ok(state
            .positions
            .binary_search_by_key(&entity, |(e, _)| *e)
            .ok()
            .map(|i| state.positions[i].1))
    }

    /// Resolved entities first (by nested position), unresolved after (by key).
    pub fn compare(&self, a: u32, b: u32) -> Result<Ordering> {
        let (pa, pb) = (self.position_of(a)?, self.position_of(b)?);
        Ok(match (pa, pb) {
            (Some(x), Some(y)) => x.cmp(&y).then(a.cmp(&b)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => a.cmp(&b),
        })
    }

    /// Filtered entities without any resolvable reference.
    pub fn non_sorted_entities(&self) -> Result<&[u32]> {
        Ok(&self.state()?.non_sorted)
    }

    /// Resolved subset of `keys`, in comparator order.
    pub(crate) fn resolve(&self, keys: &roaring::RoaringBitmap) -> Result<Vec<u32>> {
        let state = self.state()?;
        let mut resolved: Vec<(u32, u32)> = state
            .positions
            .iter()
            .filter(|(entity, _)| keys.contains(*entity))
            .map(|(entity, position)| (*position, *entity))
            .collect();
        resolved.sort_unstable();
        Ok(resolved.into_iter().map(|(_, entity)| entity).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::IndexedBitmap;
    use crate::formula::Formula;

    struct FixedOrder(Vec<u32>);

    impl NestedQueryExecutor for FixedOrder {
        fn execute_nested(&self, _query: &NestedQuery) -> Result<Vec<u32>> {
            Ok(self.0.clone())
        }
    }

    fn comparator() -> ReferencedEntityComparator {
        let query = NestedQuery {
            entity_type: "brand".to_string(),
            filter: Formula::index(Arc::new(IndexedBitmap::new([100, 200, 300]))),
            ordering: SorterChain::natural(),
        };
        // product -> brand
        ReferencedEntityComparator::new(query, [(1, 300), (2, 100), (3, 200), (3, 300), (4, 999)])
    }

    #[test]
    fn compare_before_initialization_is_premise_violation() {
        let cmp = comparator();
        assert!(matches!(cmp.compare(1, 2), Err(EngineError::PremiseViolation(_))));
    }

    #[test]
    fn orders_by_nested_position_and_collects_unresolved() {
        let cmp = comparator();
        let filtered = CandidateSet::from_keys([1, 2, 3, 4, 5]);
        cmp.initialize(&FixedOrder(vec![300, 100, 200]), &filtered).unwrap();

        assert_eq!(cmp.position_of(1).unwrap(), Some(0));
        // entity 3 references 200 (pos 2) and 300 (pos 0): best wins
        assert_eq!(cmp.position_of(3).unwrap(), Some(0));
        assert_eq!(cmp.compare(1, 2).unwrap(), Ordering::Less);
        assert_eq!(cmp.compare(4, 2).unwrap(), Ordering::Greater);
        assert_eq!(cmp.non_sorted_entities().unwrap(), &[4, 5]);

        let all: roaring::RoaringBitmap = (1..=5).collect();
        assert_eq!(cmp.resolve(&all).unwrap(), vec![1, 3, 2]);
    }

    #[test]
    fn reinitialization_with_other_input_fails() {
        let cmp = comparator();
        let executor = FixedOrder(vec![100]);
        cmp.initialize(&executor, &CandidateSet::from_keys([1, 2])).unwrap();
        cmp.initialize(&executor, &CandidateSet::from_keys([1, 2])).unwrap();
        assert!(matches!(
            cmp.initialize(&executor, &CandidateSet::from_keys([1])),
            Err(EngineError::PremiseViolation(_))
        ));
    }
}
