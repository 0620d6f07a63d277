use std::sync::Arc;

use evita_engine::cache::space_to_performance_ratio;
use evita_engine::{
    CacheOptions, CacheSupervisor, Formula, FormulaNode, FormulaRef, IndexedBitmap, PageSlicer,
    Session,
};
use proptest::prelude::*;

fn leaves() -> impl Strategy<Value = Vec<Vec<u32>>> {
    prop::collection::vec(prop::collection::vec(0u32..500, 0..60), 2..6)
}

fn index_leaves(sets: &[Vec<u32>]) -> Vec<FormulaRef> {
    sets.iter()
        .map(|keys| Formula::index(Arc::new(IndexedBitmap::new(keys.iter().copied()))))
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        failure_persistence: None,
        ..ProptestConfig::default()
    })]

    #[test]
    fn commutative_operators_hash_independently_of_child_order(sets in leaves(), rotation in 0usize..8) {
        let children = index_leaves(&sets);
        let mut reordered = children.clone();
        let len = reordered.len();
        reordered.rotate_left(rotation % len);
        reordered.reverse();

        let and_a = Formula::and(children.clone());
        let and_b = Formula::and(reordered.clone());
        prop_assert_eq!(and_a.hash(), and_b.hash());
        prop_assert_eq!(and_a.transactional_hash(), and_b.transactional_hash());
        prop_assert_eq!(and_a.compute(), and_b.compute());

        let or_a = Formula::or(children);
        let or_b = Formula::or(reordered);
        prop_assert_eq!(or_a.hash(), or_b.hash());
        prop_assert_ne!(and_a.hash(), or_a.hash());
    }

    #[test]
    fn compute_is_memoized(sets in leaves()) {
        let children = index_leaves(&sets);
        let formula = Formula::not(
            Formula::and(children[1..].to_vec()),
            Formula::or(children),
        );
        let first = formula.compute();
        let second = formula.compute();
        prop_assert!(first.ptr_eq(&second));
    }

    #[test]
    fn ratio_saturates_and_never_underflows(
        usage in any::<u64>(),
        threshold in any::<u64>(),
        cost in any::<u64>(),
        size in any::<u64>(),
    ) {
        let ratio = space_to_performance_ratio(usage, threshold, cost, size);
        let effective = u128::from(usage.saturating_sub(threshold));
        let exact = effective * u128::from(cost);
        if exact > u128::from(u64::MAX) {
            prop_assert_eq!(ratio, u64::MAX);
        } else {
            prop_assert_eq!(u128::from(ratio), exact / u128::from(size.max(1)));
        }
    }

    #[test]
    fn disabled_cache_never_tracks_anything(sets in leaves(), repeats in 1usize..20) {
        let supervisor = CacheSupervisor::new(CacheOptions::disabled()).unwrap();
        let session = Session::new("catalog");
        let formula = Formula::and(index_leaves(&sets));
        for _ in 0..repeats {
            let analysed = supervisor.analyse(&session, "product", &formula);
            prop_assert!(Arc::ptr_eq(&analysed, &formula));
        }
        prop_assert_eq!(supervisor.adept_count(), 0);
    }

    #[test]
    fn stale_index_version_forces_recomputation(keys in prop::collection::vec(0u32..500, 1..80)) {
        let supervisor = CacheSupervisor::new(CacheOptions {
            minimal_usage_threshold: 1,
            minimal_complexity_threshold: 0,
            ..CacheOptions::default()
        })
        .unwrap();
        let session = Session::new("catalog");
        let a = Arc::new(IndexedBitmap::new(keys.iter().copied()));
        let b = Arc::new(IndexedBitmap::new(0..250));
        let formula = Formula::or(vec![Formula::index(a.clone()), Formula::index(b.clone())]);

        for _ in 0..3 {
            supervisor.analyse(&session, "product", &formula).compute();
        }
        supervisor.evaluate();
        supervisor.analyse(&session, "product", &formula).compute();
        let hit = supervisor.analyse(&session, "product", &formula);
        prop_assert!(matches!(hit.node(), FormulaNode::Cached(_)));

        // same structure over a newer version of one index
        let newer = Arc::new(a.next_version(keys.iter().map(|k| k + 1)));
        let changed = Formula::or(vec![Formula::index(newer), Formula::index(b)]);
        prop_assert_eq!(changed.hash(), formula.hash());
        let analysed = supervisor.analyse(&session, "product", &changed);
        prop_assert!(!matches!(analysed.node(), FormulaNode::Cached(_)));
        prop_assert_eq!(analysed.compute(), Formula::or(changed.children()).compute());
    }

    #[test]
    fn slicer_pages_tile_the_result(
        page_size in 1u64..30,
        total in 0u64..400,
        gap in prop::option::of((1u64..5, 1u64..6)),
    ) {
        let gaps = match gap {
            Some((size, last)) => vec![
                evita_engine::ConditionalGap::new(size, &format!("$pageNumber <= {last}")).unwrap(),
            ],
            None => Vec::new(),
        };
        let slicer = PageSlicer::new(gaps);
        let first = slicer.calculate_offset_and_limit(1, page_size, total).unwrap();
        prop_assert_eq!(first.offset, 0);

        let mut expected_offset = 0;
        for page in 1..=first.last_page_number {
            let window = slicer.calculate_offset_and_limit(page, page_size, total).unwrap();
            prop_assert_eq!(window.page_number, page);
            prop_assert_eq!(window.offset, expected_offset);
            prop_assert!(window.limit >= 1 && window.limit <= page_size);
            prop_assert!(Arc::ptr_eq(
                &window,
                &slicer.calculate_offset_and_limit(page, page_size, total).unwrap()
            ));
            expected_offset += window.limit;
        }
        prop_assert!(expected_offset >= total);
    }
}
