use std::collections::BTreeSet;
use std::sync::Arc;

use evita_engine::{
    CandidateSet, Direction, MergeMode, MergedSortedRecords, SortStage, SortedRecord,
    SortedRecordsProvider, Sorter, SorterChain,
};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum StageSpec {
    Exact(Vec<u32>),
    Reversed,
    Translated(Vec<(u32, u32)>),
    PreSorted(Vec<Vec<(i64, u32)>>, bool),
}

fn stage_spec() -> impl Strategy<Value = StageSpec> {
    prop_oneof![
        prop::collection::vec(0u32..200, 0..40).prop_map(StageSpec::Exact),
        Just(StageSpec::Reversed),
        prop::collection::vec((0u32..200, any::<u32>()), 0..40).prop_map(StageSpec::Translated),
        (
            prop::collection::vec(prop::collection::vec((-50i64..50, 0u32..200), 0..20), 1..4),
            any::<bool>()
        )
            .prop_map(|(providers, interleave)| StageSpec::PreSorted(providers, interleave)),
    ]
}

fn build_chain(specs: &[StageSpec]) -> SorterChain {
    let stages = specs
        .iter()
        .enumerate()
        .map(|(i, spec)| {
            let sorter = match spec {
                StageSpec::Exact(order) => Sorter::exact(order.iter().copied()),
                StageSpec::Reversed => Sorter::ReversedPrimaryKey,
                StageSpec::Translated(pairs) => Sorter::translated(pairs.iter().copied()),
                StageSpec::PreSorted(providers, interleave) => {
                    let providers = providers
                        .iter()
                        .map(|records| {
                            Arc::new(SortedRecordsProvider::new(
                                records
                                    .iter()
                                    .map(|&(value, key)| SortedRecord { value, key })
                                    .collect(),
                            ))
                        })
                        .collect();
                    let mode = if *interleave {
                        MergeMode::Interleave
                    } else {
                        MergeMode::AppendFirst
                    };
                    Sorter::PreSorted(MergedSortedRecords::new(providers, mode, Direction::Desc))
                }
            };
            SortStage::new(format!("stage-{i}"), sorter)
        })
        .collect();
    SorterChain::new(stages).expect("distinct scopes")
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        failure_persistence: None,
        ..ProptestConfig::default()
    })]

    #[test]
    fn full_chain_output_is_a_permutation(
        keys in prop::collection::btree_set(0u32..200, 0..80),
        specs in prop::collection::vec(stage_spec(), 0..4),
    ) {
        let chain = build_chain(&specs);
        let input = CandidateSet::from_keys(keys.iter().copied());
        let sorted = chain.sort(&input, 0, keys.len()).unwrap();

        prop_assert_eq!(sorted.len(), keys.len());
        let emitted: BTreeSet<u32> = sorted.iter().copied().collect();
        prop_assert_eq!(emitted, keys);
    }

    #[test]
    fn window_is_a_slice_of_the_full_order(
        keys in prop::collection::btree_set(0u32..200, 0..80),
        specs in prop::collection::vec(stage_spec(), 0..4),
        start in 0usize..100,
        len in 0usize..40,
    ) {
        let chain = build_chain(&specs);
        let input = CandidateSet::from_keys(keys.iter().copied());
        let full = chain.sort(&input, 0, keys.len()).unwrap();

        let mut skipped = Vec::new();
        let window = chain
            .sort_and_slice(&input, start, start + len, &mut |k| skipped.push(k))
            .unwrap();

        prop_assert!(window.len() <= len);
        let from = start.min(full.len());
        let to = (start + len).min(full.len());
        prop_assert_eq!(&window[..], &full[from..to]);

        // an empty window short-circuits the chain
        if len > 0 {
            let mut expected_skipped = full[..from].to_vec();
            expected_skipped.sort_unstable();
            skipped.sort_unstable();
            prop_assert_eq!(skipped, expected_skipped);
        }
    }
}
