use std::collections::BTreeMap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use evita_engine::cache::{CacheEden, Lookup, RecordType};
use evita_engine::{
    AmountPredicate, CacheOptions, CandidateSet, EngineError, EngineOptions, Entity, EntityFetcher,
    FacetBucket, Formula, FormulaNode, FormulaRef, IndexedBitmap, PageRequest, PlanningPolicy,
    PriceIndex, PriceRecord, QueryEngine, QueryRequest, Session, SortStage, Sorter, SorterChain,
    ValueMode,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

struct Catalog {
    products: BTreeMap<u32, Entity>,
}

impl Catalog {
    fn new(count: u32) -> Self {
        let products = (1..=count)
            .map(|pk| {
                (
                    pk,
                    Entity::new("product", pk, 1).with_attribute("name", format!("product {pk}").into()),
                )
            })
            .collect();
        Self { products }
    }
}

impl EntityFetcher for Catalog {
    fn entity_version(&self, _entity_type: &str, primary_key: u32) -> Option<u64> {
        self.products.get(&primary_key).map(|e| e.version)
    }

    fn fetch(
        &self,
        _entity_type: &str,
        primary_key: u32,
        _requirements: usize,
    ) -> evita_engine::Result<Option<Entity>> {
        Ok(self.products.get(&primary_key).cloned())
    }
}

struct BrokenStorage;

impl EntityFetcher for BrokenStorage {
    fn entity_version(&self, _entity_type: &str, _primary_key: u32) -> Option<u64> {
        Some(1)
    }

    fn fetch(
        &self,
        _entity_type: &str,
        primary_key: u32,
        _requirements: usize,
    ) -> evita_engine::Result<Option<Entity>> {
        Err(EngineError::Fetch(format!("cannot read product {primary_key}")))
    }
}

fn eager_cache() -> EngineOptions {
    EngineOptions {
        cache: CacheOptions {
            minimal_usage_threshold: 1,
            minimal_complexity_threshold: 0,
            ..CacheOptions::default()
        },
        ..EngineOptions::default()
    }
}

fn price_index() -> Arc<PriceIndex> {
    let records = (1..=200u32)
        .map(|pk| PriceRecord {
            entity_primary_key: pk,
            inner_record_id: 0,
            price_without_tax: i64::from(pk) * 1_000,
            price_with_tax: i64::from(pk) * 1_210,
        })
        .collect();
    Arc::new(PriceIndex::new(2, records))
}

/// Products 9..=82 cost 100 to 1000 with tax; every fifth is out of stock,
/// which leaves 59 matches.
fn filter(prices: &Arc<PriceIndex>) -> FormulaRef {
    let in_stock = Formula::index(Arc::new(IndexedBitmap::new((1..=200).filter(|pk| pk % 5 != 0))));
    let visible = Formula::index(Arc::new(IndexedBitmap::new(1..=150)));
    let predicate =
        AmountPredicate::between(ValueMode::WithTax, Some("100"), Some("1000"), 2).unwrap();
    let cheap = Formula::price_filter(
        Formula::index(Arc::new(IndexedBitmap::new(prices.entities().iter()))),
        Arc::clone(prices),
        predicate,
    )
    .unwrap();
    Formula::and(vec![in_stock, visible, cheap])
}

#[test]
fn repeated_queries_are_served_from_cache() {
    init_tracing();
    let engine = QueryEngine::new(eager_cache()).unwrap();
    let session = Session::new("shop");
    let prices = price_index();
    let request = QueryRequest::new("product", filter(&prices)).with_page(PageRequest::new(1, 10));

    let first = engine.evaluate(&session, &request, &Catalog::new(200)).unwrap();
    for _ in 0..2 {
        engine.evaluate(&session, &request, &Catalog::new(200)).unwrap();
    }
    assert!(engine.supervisor().evaluate().unwrap().promoted >= 1);

    // recording pass, then hits
    engine.evaluate(&session, &request, &Catalog::new(200)).unwrap();
    let planned = engine.plan_formula(&session, "product", &request.filter);
    assert!(matches!(planned.node(), FormulaNode::Cached(_)));

    let cached = engine.evaluate(&session, &request, &Catalog::new(200)).unwrap();
    assert_eq!(cached.primary_keys, first.primary_keys);
    assert_eq!(cached.total_count(), first.total_count());
    assert!(engine.cache_statistics().hits >= 1);
}

#[test]
fn concurrent_sessions_share_cache_records() {
    let engine = Arc::new(QueryEngine::new(eager_cache()).unwrap());
    let prices = price_index();
    let request = Arc::new(QueryRequest::new("product", filter(&prices)));
    let done = AtomicBool::new(false);

    std::thread::scope(|scope| {
        scope.spawn(|| {
            while !done.load(Ordering::Acquire) {
                engine.supervisor().evaluate();
            }
        });
        let workers: Vec<_> = (0..8)
            .map(|worker| {
                let engine = Arc::clone(&engine);
                let request = Arc::clone(&request);
                scope.spawn(move || {
                    let session = Session::new("shop");
                    for _ in 0..20 {
                        let response = engine
                            .evaluate(&session, &request, &Catalog::new(200))
                            .unwrap();
                        assert_eq!(response.total_count(), 59, "worker {worker}");
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        done.store(true, Ordering::Release);
    });

    assert!(engine.supervisor().evaluate().is_some());
    let session = Session::new("shop");
    let settled = engine.evaluate(&session, &request, &Catalog::new(200)).unwrap();
    let uncached = QueryEngine::new(EngineOptions::default())
        .unwrap()
        .evaluate(&session, &request, &Catalog::new(200))
        .unwrap();
    assert_eq!(settled.primary_keys, uncached.primary_keys);
}

#[test]
fn concurrent_lookups_count_every_use_while_sweeping() {
    const WORKERS: u64 = 8;
    const LOOKUPS: u64 = 1_000;
    let eden = CacheEden::new(CacheOptions {
        anteroom_record_limit: 16,
        cool_enough: 1,
        ..eager_cache().cache
    });
    let hot = (0..4u64)
        .map(|key| match eden.lookup(key, RecordType::FilterResult, 0) {
            Lookup::Adept(adept) => adept,
            other => panic!("expected adept, got {other:?}"),
        })
        .collect::<Vec<_>>();
    let done = AtomicBool::new(false);

    std::thread::scope(|scope| {
        scope.spawn(|| {
            while !done.load(Ordering::Acquire) {
                eden.evaluate();
                eden.evaluate_anteroom();
            }
        });
        let workers: Vec<_> = (0..WORKERS)
            .map(|worker| {
                let eden = &eden;
                scope.spawn(move || {
                    for i in 0..LOOKUPS {
                        eden.lookup(i % 4, RecordType::FilterResult, 0);
                        eden.lookup(10_000 + worker * LOOKUPS + i, RecordType::FilterResult, 0);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        done.store(true, Ordering::Release);
    });

    let total: u64 = hot.iter().map(|adept| adept.stats().times_used()).sum();
    assert_eq!(total, hot.len() as u64 + WORKERS * LOOKUPS);
    for adept in &hot {
        assert_eq!(adept.stats().times_used(), 1 + WORKERS * LOOKUPS / 4);
    }
}

#[test]
fn background_sweeper_promotes_adepts() {
    let engine = QueryEngine::new(EngineOptions {
        cache: CacheOptions {
            reevaluate_every_millis: 10,
            cool_enough: 1_000,
            ..eager_cache().cache
        },
        ..EngineOptions::default()
    })
    .unwrap();
    let session = Session::new("shop");
    let prices = price_index();
    let request = QueryRequest::new("product", filter(&prices));
    for _ in 0..3 {
        engine.evaluate(&session, &request, &Catalog::new(200)).unwrap();
    }

    let sweeper = engine.start_sweeper().unwrap();
    sweeper.sweep_now();
    std::thread::sleep(Duration::from_millis(100));
    sweeper.stop();

    assert!(engine.cache_statistics().sweeps >= 1);
    assert!(engine.cache_statistics().records >= 1);
}

#[test]
fn ordering_and_gaps_shape_the_page() {
    let engine = QueryEngine::new(EngineOptions::default()).unwrap();
    let keys = Formula::constant(CandidateSet::from_keys(1..=30));
    let ordering = SorterChain::new(vec![
        SortStage::new("pk-in-set", Sorter::exact([30, 29, 28])),
        SortStage::new("pk", Sorter::PrimaryKey),
    ])
    .unwrap();
    let request = QueryRequest::new("product", keys)
        .with_ordering(ordering)
        .with_page(PageRequest::new(2, 10).with_gap(3, "$pageNumber == 1"));
    let response = engine
        .evaluate(&Session::new("shop"), &request, &Catalog::new(30))
        .unwrap();
    // first page holds 7 records, so the second one starts at offset 7
    assert_eq!(response.page.offset, 7);
    assert_eq!(response.page.last_page_number, 4);
    assert_eq!(response.primary_keys, (5..=14).collect::<Vec<u32>>());
}

#[test]
fn facet_summary_under_cache_enforcing_policy() {
    let engine = QueryEngine::new(EngineOptions {
        planning_policy: PlanningPolicy::CacheEnforcing,
        ..eager_cache()
    })
    .unwrap();
    let prices = price_index();
    let request = QueryRequest::new("product", filter(&prices)).with_facets(vec![
        FacetBucket {
            facet_id: 1,
            entities: Arc::new(IndexedBitmap::new(1..=10)),
        },
        FacetBucket {
            facet_id: 2,
            entities: Arc::new(IndexedBitmap::new(100..=200)),
        },
    ]);
    let response = engine
        .evaluate(&Session::new("shop"), &request, &Catalog::new(200))
        .unwrap();
    let summary = response.facet_summary.unwrap();
    assert_eq!(summary.count_of(1), Some(1));
    assert_eq!(summary.count_of(2), Some(0));
}

#[test]
fn fetch_failures_abort_the_query() {
    let engine = QueryEngine::new(EngineOptions::default()).unwrap();
    let request = QueryRequest::new("product", Formula::constant(CandidateSet::from_keys([1, 2])))
        .with_requirements(1);
    let result = engine.evaluate(&Session::new("shop"), &request, &BrokenStorage);
    assert!(matches!(result, Err(EngineError::Fetch(_))));
}

#[test]
fn options_load_from_json_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.json");
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(file, r#"{{"enabled": false, "cacheSizeInBytes": 0}}"#).unwrap();

    let options = CacheOptions::from_json_file(&path).unwrap();
    assert!(!options.enabled);
    let engine = QueryEngine::new(EngineOptions {
        cache: options,
        ..EngineOptions::default()
    })
    .unwrap();
    assert!(!engine.supervisor().is_enabled());
}
