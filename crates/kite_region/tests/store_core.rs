//! End-to-end scenarios over the full region engine stack.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use kite_common::config::{AtomicOptions, CoreConfig};
use kite_common::error::{ErrorCode, KiteResult};
use kite_common::types::{KeyRange, RegionId};
use kite_index::{VectorDistance, VectorFilter, VectorIndexKind, VectorIndexParams, VectorWithData};
use kite_mvcc::{LocalTsoClient, TsProvider};
use kite_region::{
    CoordinatorClient, RawEngineKind, RegionDefinition, RegionEngine, Services, StoreEngineKind,
};
use kite_storage::engine::RawEngine;
use kite_storage::MemoryEngine;
use kite_txn::{Mutation, PrewriteRequest};
use parking_lot::Mutex;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[derive(Default)]
struct RecordingCoordinator {
    splits: Mutex<Vec<(RegionId, Vec<u8>)>>,
}

impl CoordinatorClient for RecordingCoordinator {
    fn create_region(
        &self,
        definition: RegionDefinition,
        _replica_num: u32,
    ) -> KiteResult<RegionId> {
        Ok(definition.id)
    }

    fn query_region(&self, _region_id: RegionId) -> KiteResult<Option<RegionDefinition>> {
        Ok(None)
    }

    fn split_region(&self, from_id: RegionId, split_key: Vec<u8>) -> KiteResult<()> {
        self.splits.lock().push((from_id, split_key));
        Ok(())
    }
}

fn build_engine(config: CoreConfig) -> (Arc<RegionEngine>, Arc<RecordingCoordinator>) {
    let coordinator = Arc::new(RecordingCoordinator::default());
    let options = Arc::new(AtomicOptions::from_config(&config));
    let ts_provider = Arc::new(TsProvider::new(
        Arc::new(LocalTsoClient::new()),
        config.ts_provider.clone(),
    ));
    let services = Services {
        coordinator: coordinator.clone(),
        ts_provider,
        config,
        options,
    };
    let mut engines: HashMap<RawEngineKind, Arc<dyn RawEngine>> = HashMap::new();
    engines.insert(RawEngineKind::Memory, Arc::new(MemoryEngine::new()));
    (Arc::new(RegionEngine::new(services, engines)), coordinator)
}

fn full_region(id: RegionId, store_engine: StoreEngineKind) -> RegionDefinition {
    RegionDefinition::kv(id, KeyRange::new(vec![0x01], Vec::new()), store_engine)
}

// ── S1: simple put/get/delete ────────────────────────────────────────────

#[test]
fn simple_put_get_delete() {
    let (engine, _) = build_engine(CoreConfig::default());
    engine.create_region(full_region(1, StoreEngineKind::Mono)).unwrap();

    engine.kv_put(1, b"k", b"v1").unwrap();
    assert_eq!(engine.kv_get(1, b"k").unwrap(), Some(b"v1".to_vec()));
    engine.kv_delete(1, b"k").unwrap();
    assert_eq!(engine.kv_get(1, b"k").unwrap(), None);
}

// ── S2/S3: MVCC snapshot reads, lock conflicts, resolve rollback ─────────

#[test]
fn mvcc_snapshot_and_resolve_rollback() {
    let (engine, _) = build_engine(CoreConfig::default());
    engine.create_region(full_region(1, StoreEngineKind::Mono)).unwrap();
    let txn = engine.txn_engine(1).unwrap();

    txn.prewrite(&PrewriteRequest {
        mutations: vec![Mutation::put(b"x".to_vec(), b"A".to_vec())],
        primary_lock: b"x".to_vec(),
        start_ts: 10,
        lock_ttl_ms: 1000,
        txn_size: 1,
        ..Default::default()
    })
    .unwrap();
    txn.commit(10, 20, &[b"x".to_vec()]).unwrap();

    txn.prewrite(&PrewriteRequest {
        mutations: vec![Mutation::put(b"x".to_vec(), b"B".to_vec())],
        primary_lock: b"x".to_vec(),
        start_ts: 30,
        lock_ttl_ms: 1000,
        txn_size: 1,
        ..Default::default()
    })
    .unwrap();

    let scan_range = KeyRange::new(b"a".to_vec(), b"z".to_vec());
    let reader = engine.txn_reader(1).unwrap();
    let rows = reader.txn_scan(25, &scan_range, 0, &[]).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].value, b"A".to_vec());

    let err = reader.txn_scan(40, &scan_range, 0, &[]).unwrap_err();
    assert_eq!(err.code(), ErrorCode::KeyIsLocked);
    assert_eq!(err.lock_info().unwrap().start_ts, 30);

    // S3: roll the second writer back; the old value stays visible and the
    // late commit is rejected.
    txn.batch_rollback(30, &[b"x".to_vec()]).unwrap();
    let reader = engine.txn_reader(1).unwrap();
    let rows = reader.txn_scan(40, &scan_range, 0, &[]).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].value, b"A".to_vec());

    let err = txn.commit(30, 50, &[b"x".to_vec()]).unwrap_err();
    assert!(matches!(
        err.code(),
        ErrorCode::TxnLockNotFound | ErrorCode::TxnNotFound
    ));
}

// ── Raft write path: propose, apply, crash replay ────────────────────────

#[test]
fn raft_region_write_and_crash_replay() {
    let raft_dir = tempfile::TempDir::new().unwrap();
    let mut config = CoreConfig::default();
    config.raft.log_path = raft_dir.path().to_path_buf();

    {
        let (engine, _) = build_engine(config.clone());
        engine.create_region(full_region(1, StoreEngineKind::Raft)).unwrap();
        engine.kv_put(1, b"alpha", b"1").unwrap();
        engine.kv_put(1, b"beta", b"2").unwrap();
        assert_eq!(engine.kv_get(1, b"alpha").unwrap(), Some(b"1".to_vec()));
    }

    // "Crash": the memory engine is gone; reopening the region replays the
    // durable log into a fresh engine.
    let (engine, _) = build_engine(config);
    engine.create_region(full_region(1, StoreEngineKind::Raft)).unwrap();
    assert_eq!(engine.kv_get(1, b"alpha").unwrap(), Some(b"1".to_vec()));
    assert_eq!(engine.kv_get(1, b"beta").unwrap(), Some(b"2".to_vec()));
}

// ── GC preserves the newest version at or below the safe point ───────────

#[test]
fn gc_preserves_latest_below_safepoint() {
    let (engine, _) = build_engine(CoreConfig::default());
    engine.create_region(full_region(1, StoreEngineKind::Mono)).unwrap();
    let txn = engine.txn_engine(1).unwrap();

    for (start, commit, value) in [(1u64, 5u64, "v5"), (11, 15, "v15"), (21, 25, "v25")] {
        txn.prewrite(&PrewriteRequest {
            mutations: vec![Mutation::put(b"k".to_vec(), value.as_bytes().to_vec())],
            primary_lock: b"k".to_vec(),
            start_ts: start,
            lock_ttl_ms: 1000,
            txn_size: 1,
            ..Default::default()
        })
        .unwrap();
        txn.commit(start, commit, &[b"k".to_vec()]).unwrap();
    }

    engine.txn_gc(1, 20).unwrap();

    let reader = engine.txn_reader(1).unwrap();
    assert_eq!(reader.txn_get(17, b"k", &[]).unwrap(), Some(b"v15".to_vec()));
    assert_eq!(reader.txn_get(30, b"k", &[]).unwrap(), Some(b"v25".to_vec()));
    assert_eq!(reader.txn_get(4, b"k", &[]).unwrap(), None);
}

// ── S5: HALF split policy over 10k x 1KiB keys ───────────────────────────

#[test]
fn half_split_policy_end_to_end() {
    init_tracing();
    let mut config = CoreConfig::default();
    config.split.threshold_size = 8 * 1024 * 1024;
    config.split.chunk_size = 256 * 1024;
    config.split.check_approximate_size = 4 * 1024 * 1024;
    config.region.enable_split_and_merge_for_lite = true;

    let (engine, coordinator) = build_engine(config);
    engine.create_region(full_region(1, StoreEngineKind::Mono)).unwrap();

    let value = vec![b'v'; 1024];
    let mut batch = Vec::new();
    for i in 0..10_000u32 {
        batch.push(kite_common::types::KeyValue::new(
            format!("\x01user{i:05}").into_bytes(),
            value.clone(),
        ));
        if batch.len() == 100 {
            engine.kv_batch_put(1, &batch).unwrap();
            batch.clear();
        }
    }

    let requested = kite_region::split::split_check(&engine, 1)
        .unwrap()
        .expect("split should fire above threshold");

    // The coordinator saw exactly this request.
    let splits = coordinator.splits.lock().clone();
    assert_eq!(splits, vec![(1, requested.clone())]);

    // The split key falls in the middle of the sorted key space.
    let text = String::from_utf8_lossy(&requested).to_string();
    let index: usize = text.trim_start_matches('\x01').trim_start_matches("user").parse().unwrap();
    assert!(
        (4_800..=5_200).contains(&index),
        "split key at {index}, outside the middle band"
    );

    // While the split is in flight the region refuses another check.
    let region = engine.registry().get(1).unwrap();
    assert!(region.temporary_disable_change());

    // Apply the split and verify both siblings serve their halves.
    engine.apply_split(1, 2, &requested).unwrap();
    assert!(!engine.registry().get(1).unwrap().temporary_disable_change());
    assert_eq!(engine.kv_get(1, b"\x01user00000").unwrap(), Some(value.clone()));
    assert_eq!(engine.kv_get(2, b"\x01user09999").unwrap(), Some(value));
}

#[test]
fn pre_split_check_dispatches_through_workers() {
    init_tracing();
    let mut config = CoreConfig::default();
    config.split.threshold_size = 64 * 1024;
    config.split.chunk_size = 4 * 1024;
    config.split.check_approximate_size = 32 * 1024;
    config.region.enable_split_and_merge_for_lite = true;

    let (engine, coordinator) = build_engine(config);
    engine.create_region(full_region(1, StoreEngineKind::Mono)).unwrap();
    let value = vec![b'v'; 512];
    for i in 0..300u32 {
        engine
            .kv_put(1, format!("\x01row{i:04}").as_bytes(), &value)
            .unwrap();
    }

    let checker = kite_region::PreSplitChecker::new(engine.clone(), 2);
    let dispatched = checker.pre_split_check();
    assert_eq!(dispatched, 1);
    checker.wait_idle();
    assert_eq!(coordinator.splits.lock().len(), 1);

    // The admitted split freezes further checks until it is applied.
    assert_eq!(checker.pre_split_check(), 0);
    checker.shutdown();
}

#[test]
fn small_region_does_not_split() {
    let mut config = CoreConfig::default();
    config.region.enable_split_and_merge_for_lite = true;
    let (engine, coordinator) = build_engine(config);
    engine.create_region(full_region(1, StoreEngineKind::Mono)).unwrap();
    for i in 0..100u32 {
        engine
            .kv_put(1, format!("\x01k{i}").as_bytes(), b"small")
            .unwrap();
    }
    let requested = kite_region::split::split_check(&engine, 1).unwrap();
    assert!(requested.is_none());
    assert!(coordinator.splits.lock().is_empty());
}

// ── S6: vector search with scalar pre-filter ─────────────────────────────

#[test]
fn vector_pre_filter_returns_only_tagged() {
    let (engine, _) = build_engine(CoreConfig::default());
    let mut definition = full_region(1, StoreEngineKind::Mono);
    definition.vector_params = Some(VectorIndexParams {
        kind: VectorIndexKind::Flat,
        dimension: 8,
        distance: VectorDistance::L2,
        speedup_keys: vec!["tag".to_string()],
    });
    engine.create_region(definition).unwrap();
    let index = engine.vector_index(1).unwrap();

    for id in 0..1000u64 {
        let tag = if id % 2 == 0 { "A" } else { "B" };
        let vector: Vec<f32> = (0..8).map(|d| ((id + d) % 97) as f32).collect();
        let mut scalars = BTreeMap::new();
        scalars.insert("tag".to_string(), tag.to_string());
        index
            .upsert(
                10,
                &VectorWithData {
                    id,
                    vector,
                    scalars,
                    table_data: None,
                },
            )
            .unwrap();
    }

    let query: Vec<f32> = vec![1.0; 8];
    let mut predicates = BTreeMap::new();
    predicates.insert("tag".to_string(), "A".to_string());
    let hits = index
        .search(20, &query, 5, &VectorFilter::ScalarPre { predicates })
        .unwrap();

    assert_eq!(hits.len(), 5);
    for hit in &hits {
        assert_eq!(hit.id % 2, 0, "vector {} is not tagged A", hit.id);
    }
}

// ── Scan sessions through the region surface ─────────────────────────────

#[test]
fn scan_session_pages_through_region() {
    let (engine, _) = build_engine(CoreConfig::default());
    engine.create_region(full_region(1, StoreEngineKind::Mono)).unwrap();
    for i in 0..25u32 {
        engine
            .kv_put(1, format!("\x01row{i:03}").as_bytes(), b"v")
            .unwrap();
    }

    let range = KeyRange::new(vec![0x01], Vec::new());
    let (scan_id, first, done) = engine.scan_begin(1, &range, 10).unwrap();
    assert_eq!(first.len(), 10);
    assert!(!done);

    let mut total = first.len();
    loop {
        let (batch, done) = engine.scan_continue(scan_id, 10).unwrap();
        total += batch.len();
        if done {
            break;
        }
    }
    assert_eq!(total, 25);
    engine.scan_release(scan_id);
    engine.scan_release(scan_id);
}

// ── Recovery: persisted regions come back, raft-less ones are skipped ────

#[test]
fn recovery_reopens_persisted_regions() {
    let raft_dir = tempfile::TempDir::new().unwrap();
    let mut config = CoreConfig::default();
    config.raft.log_path = raft_dir.path().to_path_buf();

    let shared_engine: Arc<dyn RawEngine> = Arc::new(MemoryEngine::new());
    let build = |config: CoreConfig| {
        let coordinator = Arc::new(RecordingCoordinator::default());
        let options = Arc::new(AtomicOptions::from_config(&config));
        let ts_provider = Arc::new(TsProvider::new(
            Arc::new(LocalTsoClient::new()),
            config.ts_provider.clone(),
        ));
        let services = Services {
            coordinator,
            ts_provider,
            config,
            options,
        };
        let mut engines: HashMap<RawEngineKind, Arc<dyn RawEngine>> = HashMap::new();
        engines.insert(RawEngineKind::Memory, Arc::clone(&shared_engine));
        Arc::new(RegionEngine::new(services, engines))
    };

    {
        let engine = build(config.clone());
        engine.create_region(full_region(1, StoreEngineKind::Mono)).unwrap();
        engine.kv_put(1, b"\x01k", b"v").unwrap();
    }

    // Same backing engine, new region engine: recovery reloads the meta.
    let engine = build(config);
    assert_eq!(engine.recover().unwrap(), 1);
    assert_eq!(engine.kv_get(1, b"\x01k").unwrap(), Some(b"v".to_vec()));
}
