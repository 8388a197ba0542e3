//! The region engine: region lifecycle, the write path, and the per-region
//! operation surfaces (raw KV, transactions, vector and document indexes).
//!
//! Each open region installs a capability record per store-engine kind
//! (`{read, write, txn}`, plain structs of closures) instead of a class
//! hierarchy: Raft regions submit writes through consensus proposals, mono
//! and memory regions write the engine directly. Collaborating services
//! (coordinator, timestamp provider, config) are passed in explicitly at
//! construction; there is no hidden process-wide state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use kite_common::config::{AtomicOptions, CoreConfig};
use kite_common::error::{KiteError, KiteResult, RawError, RegionError};
use kite_common::types::{KeyRange, KeyValue, RegionId, Ts, MAX_TS};
use kite_index::{DocumentIndexWrapper, VectorIndexWrapper};
use kite_mvcc::codec::{encode_key, encode_range, pack_tombstone, pack_value, ValueFlag, NS_RAW, NS_TXN};
use kite_mvcc::reader::MvccReader;
use kite_mvcc::TsProvider;
use kite_raft::{ConsensusNode, LocalNode, NodeRegistry};
use kite_storage::engine::{
    EngineIterator, EngineSnapshot, IteratorOptions, RawEngine, WriteBatch, CF_DEFAULT, CF_META,
};
use kite_txn::{TxnEngine, TxnReader, WriteSubmitter};
use parking_lot::Mutex;

use crate::region::{
    decode_region_meta, encode_region_meta, region_meta_key, RawEngineKind, Region,
    RegionDefinition, RegionState, StoreEngineKind,
};
use crate::registry::RegionRegistry;
use crate::scan::ScanManager;
use crate::state_machine::{encode_write_data, load_applied_index, RegionStateMachine};

/// How long a synchronous writer waits for its proposal to apply.
const PROPOSE_WAIT: Duration = Duration::from_secs(30);

/// Coordinator RPC surface the store consumes.
pub trait CoordinatorClient: Send + Sync {
    fn create_region(
        &self,
        definition: RegionDefinition,
        replica_num: u32,
    ) -> KiteResult<RegionId>;

    fn query_region(&self, region_id: RegionId) -> KiteResult<Option<RegionDefinition>>;

    fn split_region(&self, from_id: RegionId, split_key: Vec<u8>) -> KiteResult<()>;
}

/// Explicit collaborator handle passed at construction.
pub struct Services {
    pub coordinator: Arc<dyn CoordinatorClient>,
    pub ts_provider: Arc<TsProvider>,
    pub config: CoreConfig,
    pub options: Arc<AtomicOptions>,
}

/// Read capabilities of an open region.
#[derive(Clone)]
pub struct ReadOps {
    pub snapshot: Arc<dyn Fn() -> Arc<dyn EngineSnapshot> + Send + Sync>,
}

/// Write capabilities of an open region.
#[derive(Clone)]
pub struct WriteOps {
    /// Submit one atomic batch; resolves after the write is applied.
    pub submit: Arc<dyn Fn(WriteBatch) -> KiteResult<()> + Send + Sync>,
}

/// Transaction capabilities of an open region.
#[derive(Clone)]
pub struct TxnOps {
    pub engine: Arc<TxnEngine>,
}

/// The three capability records installed per store-engine kind.
#[derive(Clone)]
pub struct StoreCaps {
    pub read: ReadOps,
    pub write: WriteOps,
    pub txn: TxnOps,
}

struct CapsSubmitter {
    submit: Arc<dyn Fn(WriteBatch) -> KiteResult<()> + Send + Sync>,
}

impl WriteSubmitter for CapsSubmitter {
    fn submit(&self, batch: WriteBatch) -> KiteResult<()> {
        (self.submit)(batch)
    }
}

/// Everything attached to one open region.
pub struct RegionHandle {
    pub region: Arc<Region>,
    pub engine: Arc<dyn RawEngine>,
    pub caps: StoreCaps,
    pub vector: Option<Arc<VectorIndexWrapper>>,
    pub document: Option<Arc<DocumentIndexWrapper>>,
}

/// Request context for the write path.
#[derive(Debug, Clone, Default)]
pub struct WriteContext {
    pub region_id: RegionId,
    /// When set, the request is rejected if the region's epoch moved.
    pub epoch_version: Option<u64>,
}

impl WriteContext {
    pub fn new(region_id: RegionId) -> Self {
        Self {
            region_id,
            epoch_version: None,
        }
    }
}

/// Per-region size/key metrics refreshed by split-check scans.
#[derive(Debug, Default, Clone, Copy)]
pub struct RegionMetrics {
    pub region_size: u64,
    pub key_count: u64,
}

pub struct RegionEngine {
    services: Services,
    engines: HashMap<RawEngineKind, Arc<dyn RawEngine>>,
    registry: RegionRegistry,
    nodes: NodeRegistry,
    handles: DashMap<RegionId, Arc<RegionHandle>>,
    metrics: DashMap<RegionId, RegionMetrics>,
    scans: ScanManager,
    /// Serializes split application per store.
    split_mutex: Mutex<()>,
}

impl RegionEngine {
    pub fn new(services: Services, engines: HashMap<RawEngineKind, Arc<dyn RawEngine>>) -> Self {
        let scans = ScanManager::new(services.config.scan.clone());
        Self {
            services,
            engines,
            registry: RegionRegistry::new(),
            nodes: NodeRegistry::new(),
            handles: DashMap::new(),
            metrics: DashMap::new(),
            scans,
            split_mutex: Mutex::new(()),
        }
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn registry(&self) -> &RegionRegistry {
        &self.registry
    }

    pub fn nodes(&self) -> &NodeRegistry {
        &self.nodes
    }

    pub fn scans(&self) -> &ScanManager {
        &self.scans
    }

    fn engine_for(&self, kind: RawEngineKind) -> KiteResult<Arc<dyn RawEngine>> {
        self.engines.get(&kind).cloned().ok_or_else(|| {
            RawError::IllegalParameters(format!("no engine bound for {kind:?}")).into()
        })
    }

    pub(crate) fn engine_by_kind(&self, kind: RawEngineKind) -> Option<Arc<dyn RawEngine>> {
        self.engines.get(&kind).cloned()
    }

    pub fn handle(&self, region_id: RegionId) -> KiteResult<Arc<RegionHandle>> {
        self.handles
            .get(&region_id)
            .map(|h| Arc::clone(h.value()))
            .ok_or_else(|| RegionError::RegionNotFound(region_id).into())
    }

    // ── Region lifecycle ──────────────────────────────────────────────────

    /// Open a new region on this store.
    pub fn create_region(&self, definition: RegionDefinition) -> KiteResult<()> {
        if !definition.range.is_valid() {
            return Err(RawError::RangeEmptyOrInverted.into());
        }
        if self.handles.contains_key(&definition.id) {
            return Err(RawError::IllegalParameters(format!(
                "region {} already open",
                definition.id
            ))
            .into());
        }
        self.open_region(definition, RegionState::Normal)
    }

    /// Load persisted regions at boot. Best-effort: a raft region whose log
    /// directory is gone is skipped with a warning.
    pub fn recover(&self) -> KiteResult<usize> {
        let mut recovered = 0;
        for engine in self.engines.values() {
            let mut iter = engine.iter(
                CF_META,
                IteratorOptions::bounded(b"rm_".to_vec(), b"rm`".to_vec()),
            )?;
            iter.seek(b"rm_");
            let mut metas = Vec::new();
            while iter.valid() {
                match decode_region_meta(iter.value()) {
                    Ok(meta) => metas.push(meta),
                    Err(e) => {
                        tracing::warn!(error = %e, "skipping undecodable region meta");
                    }
                }
                iter.next();
            }
            for meta in metas {
                let id = meta.definition.id;
                if !matches!(
                    meta.state,
                    RegionState::Normal
                        | RegionState::Standby
                        | RegionState::Splitting
                        | RegionState::Merging
                ) {
                    continue;
                }
                if meta.definition.store_engine == StoreEngineKind::Raft {
                    let log_dir = self.raft_log_dir(id);
                    if !log_dir.exists() {
                        tracing::warn!(region = id, "raft meta missing, skipping recovery");
                        continue;
                    }
                }
                if let Err(e) = self.open_region(meta.definition, meta.state) {
                    tracing::warn!(region = id, error = %e, "region recovery failed");
                    continue;
                }
                recovered += 1;
            }
        }
        tracing::info!(recovered, "region recovery finished");
        Ok(recovered)
    }

    fn raft_log_dir(&self, region_id: RegionId) -> std::path::PathBuf {
        self.services
            .config
            .raft
            .log_path
            .join(region_id.to_string())
    }

    fn open_region(&self, definition: RegionDefinition, state: RegionState) -> KiteResult<()> {
        let region_id = definition.id;
        let engine = self.engine_for(definition.raw_engine)?;
        let region = Arc::new(Region::new(definition.clone(), state));

        let submit: Arc<dyn Fn(WriteBatch) -> KiteResult<()> + Send + Sync> =
            match definition.store_engine {
                StoreEngineKind::Raft => {
                    let applied = load_applied_index(engine.as_ref(), region_id);
                    let sm = Arc::new(RegionStateMachine::new(region_id, Arc::clone(&engine)));
                    let node = LocalNode::start(
                        region_id,
                        &self.raft_log_dir(region_id),
                        self.services.config.raft.segmentlog_max_segment_size,
                        sm,
                        applied,
                    )?;
                    self.nodes.add(Arc::clone(&node) as Arc<dyn ConsensusNode>);
                    let node: Arc<dyn ConsensusNode> = node;
                    let options = Arc::clone(&self.services.options);
                    Arc::new(move |batch: WriteBatch| {
                        if options.cluster_read_only() {
                            return Err(RegionError::ClusterReadOnly(
                                "writes suspended".into(),
                            )
                            .into());
                        }
                        if !node.is_leader() {
                            return Err(RegionError::NotLeader {
                                region_id,
                                leader_hint: node.leader_hint(),
                            }
                            .into());
                        }
                        let data = encode_write_data(&batch)?;
                        node.propose(data)?.wait_timeout(PROPOSE_WAIT)
                    })
                }
                StoreEngineKind::Mono | StoreEngineKind::Memory => {
                    let engine = Arc::clone(&engine);
                    let options = Arc::clone(&self.services.options);
                    Arc::new(move |batch: WriteBatch| {
                        if options.cluster_read_only() {
                            return Err(RegionError::ClusterReadOnly(
                                "writes suspended".into(),
                            )
                            .into());
                        }
                        engine.write_batch(batch).map_err(KiteError::from)
                    })
                }
            };

        let read = ReadOps {
            snapshot: {
                let engine = Arc::clone(&engine);
                Arc::new(move || engine.snapshot())
            },
        };
        let txn = TxnOps {
            engine: Arc::new(TxnEngine::new(
                Arc::clone(&engine),
                Arc::new(CapsSubmitter {
                    submit: Arc::clone(&submit),
                }),
            )),
        };
        let caps = StoreCaps {
            read,
            write: WriteOps { submit },
            txn,
        };

        let vector = match &definition.vector_params {
            Some(params) => Some(Arc::new(VectorIndexWrapper::new(
                region_id,
                params.clone(),
                Arc::clone(&engine),
            )?)),
            None => None,
        };
        let document = definition
            .document_index
            .then(|| Arc::new(DocumentIndexWrapper::new(region_id, Arc::clone(&engine))));

        self.persist_region_meta(&region)?;
        self.registry.insert(Arc::clone(&region));
        self.handles.insert(
            region_id,
            Arc::new(RegionHandle {
                region,
                engine,
                caps,
                vector,
                document,
            }),
        );
        tracing::info!(region = region_id, "region opened");
        Ok(())
    }

    fn persist_region_meta(&self, region: &Region) -> KiteResult<()> {
        let engine = self.engine_for(region.raw_engine())?;
        let raw = encode_region_meta(&region.meta())?;
        engine.put(CF_META, &region_meta_key(region.id()), &raw)?;
        Ok(())
    }

    /// Drop a region replica: state goes Tombstone, the node shuts down,
    /// metadata records the terminal state.
    pub fn drop_region(&self, region_id: RegionId) -> KiteResult<()> {
        let handle = self.handle(region_id)?;
        handle.region.set_state(RegionState::Tombstone);
        self.persist_region_meta(&handle.region)?;
        if let Some(node) = self.nodes.remove(region_id) {
            node.shutdown();
        }
        self.handles.remove(&region_id);
        self.registry.remove(region_id);
        self.metrics.remove(&region_id);
        Ok(())
    }

    /// Carve `[split_key, end)` out of `parent_id` into a new region.
    /// Both siblings end with a bumped epoch version; ranges partition the
    /// parent's original range.
    pub fn apply_split(
        &self,
        parent_id: RegionId,
        child_id: RegionId,
        split_key: &[u8],
    ) -> KiteResult<()> {
        let _guard = self.split_mutex.lock();
        let parent = self.handle(parent_id)?;

        if parent.region.state() != RegionState::Normal {
            parent.region.clear_temporary_disable_change();
            return Err(RawError::IllegalParameters(format!(
                "region {parent_id} not NORMAL"
            ))
            .into());
        }
        let parent_range = parent.region.range();
        if !parent_range.contains(split_key) || split_key == parent_range.start_key.as_slice() {
            parent.region.clear_temporary_disable_change();
            return Err(RawError::IllegalParameters(
                "split key not strictly inside region range".into(),
            )
            .into());
        }

        parent.region.set_state(RegionState::Splitting);
        let parent_def = parent.region.definition();
        let mut child_def = parent_def.clone();
        child_def.id = child_id;
        child_def.range = KeyRange::new(split_key.to_vec(), parent_range.end_key.clone());
        child_def.epoch.version = parent_def.epoch.version + 1;

        parent.region.apply_range_split(split_key);
        let result = self.open_region(child_def, RegionState::Normal);

        parent.region.set_state(RegionState::Normal);
        parent.region.clear_temporary_disable_change();
        self.persist_region_meta(&parent.region)?;
        result?;

        tracing::info!(
            parent = parent_id,
            child = child_id,
            split_key = %kite_common::types::hex(split_key),
            "region split applied"
        );
        Ok(())
    }

    // ── Write path ────────────────────────────────────────────────────────

    /// Submit one atomic batch through the region's write capability.
    pub fn write(&self, ctx: &WriteContext, batch: WriteBatch) -> KiteResult<()> {
        let handle = self.handle(ctx.region_id)?;
        if let Some(expect) = ctx.epoch_version {
            let actual = handle.region.epoch().version;
            if actual != expect {
                return Err(RegionError::RegionVersionChanged {
                    region_id: ctx.region_id,
                    expect,
                    actual,
                }
                .into());
            }
        }
        (handle.caps.write.submit)(batch)
    }

    // ── Raw KV surface ────────────────────────────────────────────────────

    pub fn kv_put(&self, region_id: RegionId, key: &[u8], value: &[u8]) -> KiteResult<()> {
        self.kv_batch_put(region_id, &[KeyValue::new(key.to_vec(), value.to_vec())])
    }

    pub fn kv_batch_put(&self, region_id: RegionId, kvs: &[KeyValue]) -> KiteResult<()> {
        let handle = self.handle(region_id)?;
        let ts = self.services.ts_provider.get_ts(0)?;
        let mut batch = WriteBatch::new();
        for kv in kvs {
            self.check_key(&handle, &kv.key)?;
            batch.put(
                CF_DEFAULT,
                encode_key(NS_RAW, &kv.key, ts),
                pack_value(ValueFlag::Normal, &kv.value),
            );
        }
        self.write(&WriteContext::new(region_id), batch)
    }

    pub fn kv_get(&self, region_id: RegionId, key: &[u8]) -> KiteResult<Option<Vec<u8>>> {
        let handle = self.handle(region_id)?;
        self.check_key(&handle, key)?;
        let reader = MvccReader::raw((handle.caps.read.snapshot)());
        reader.kv_get(CF_DEFAULT, MAX_TS, key)
    }

    pub fn kv_batch_get(
        &self,
        region_id: RegionId,
        keys: &[Vec<u8>],
    ) -> KiteResult<Vec<Option<Vec<u8>>>> {
        let handle = self.handle(region_id)?;
        let reader = MvccReader::raw((handle.caps.read.snapshot)());
        keys.iter()
            .map(|key| {
                self.check_key(&handle, key)?;
                reader.kv_get(CF_DEFAULT, MAX_TS, key)
            })
            .collect()
    }

    pub fn kv_delete(&self, region_id: RegionId, key: &[u8]) -> KiteResult<()> {
        let handle = self.handle(region_id)?;
        self.check_key(&handle, key)?;
        let ts = self.services.ts_provider.get_ts(0)?;
        let mut batch = WriteBatch::new();
        batch.put(CF_DEFAULT, encode_key(NS_RAW, key, ts), pack_tombstone());
        self.write(&WriteContext::new(region_id), batch)
    }

    /// Physically remove every version in the plain range.
    pub fn kv_delete_range(&self, region_id: RegionId, range: &KeyRange) -> KiteResult<()> {
        let handle = self.handle(region_id)?;
        let clipped = clip_range(range, &handle.region.range())?;
        let (start, end) = encode_range(NS_RAW, &clipped);
        let mut batch = WriteBatch::new();
        batch.delete_range(CF_DEFAULT, start, end);
        self.write(&WriteContext::new(region_id), batch)
    }

    pub fn kv_scan(
        &self,
        region_id: RegionId,
        range: &KeyRange,
        limit: usize,
    ) -> KiteResult<Vec<KeyValue>> {
        let handle = self.handle(region_id)?;
        let clipped = clip_range(range, &handle.region.range())?;
        let reader = MvccReader::raw((handle.caps.read.snapshot)());
        reader.kv_scan(CF_DEFAULT, MAX_TS, &clipped, limit)
    }

    pub fn kv_count(&self, region_id: RegionId, range: &KeyRange) -> KiteResult<i64> {
        let handle = self.handle(region_id)?;
        let clipped = clip_range(range, &handle.region.range())?;
        let reader = MvccReader::raw((handle.caps.read.snapshot)());
        reader.kv_count(CF_DEFAULT, MAX_TS, &clipped)
    }

    /// Write only when no live value exists. Returns whether it wrote.
    pub fn kv_put_if_absent(
        &self,
        region_id: RegionId,
        key: &[u8],
        value: &[u8],
    ) -> KiteResult<bool> {
        if self.kv_get(region_id, key)?.is_some() {
            return Ok(false);
        }
        self.kv_put(region_id, key, value)?;
        Ok(true)
    }

    /// Atomically swap `expect` for `value` (`None` value deletes).
    /// Returns whether the swap happened.
    pub fn kv_compare_and_set(
        &self,
        region_id: RegionId,
        key: &[u8],
        expect: Option<&[u8]>,
        value: Option<&[u8]>,
    ) -> KiteResult<bool> {
        let current = self.kv_get(region_id, key)?;
        if current.as_deref() != expect {
            return Ok(false);
        }
        match value {
            Some(v) => self.kv_put(region_id, key, v)?,
            None => self.kv_delete(region_id, key)?,
        }
        Ok(true)
    }

    fn check_key(&self, handle: &RegionHandle, key: &[u8]) -> KiteResult<()> {
        if key.is_empty() {
            return Err(RawError::KeyEmpty.into());
        }
        if !handle.region.check_key_in_range(key) {
            return Err(RawError::IllegalParameters(format!(
                "key {} outside region {} range {}",
                kite_common::types::hex(key),
                handle.region.id(),
                handle.region.range(),
            ))
            .into());
        }
        Ok(())
    }

    // ── Txn surface ───────────────────────────────────────────────────────

    pub fn txn_engine(&self, region_id: RegionId) -> KiteResult<Arc<TxnEngine>> {
        Ok(Arc::clone(&self.handle(region_id)?.caps.txn.engine))
    }

    pub fn txn_reader(&self, region_id: RegionId) -> KiteResult<TxnReader> {
        let handle = self.handle(region_id)?;
        Ok(TxnReader::new((handle.caps.read.snapshot)()))
    }

    /// GC the region's range at the given safe point.
    pub fn txn_gc(&self, region_id: RegionId, safe_point_ts: Ts) -> KiteResult<kite_txn::GcResult> {
        let handle = self.handle(region_id)?;
        let range = handle.region.range();
        handle.caps.txn.engine.gc(safe_point_ts, &range)
    }

    // ── Index surface ─────────────────────────────────────────────────────

    pub fn vector_index(&self, region_id: RegionId) -> KiteResult<Arc<VectorIndexWrapper>> {
        self.handle(region_id)?
            .vector
            .clone()
            .ok_or_else(|| RegionError::VectorIndexNotFound(region_id).into())
    }

    pub fn document_index(&self, region_id: RegionId) -> KiteResult<Arc<DocumentIndexWrapper>> {
        self.handle(region_id)?
            .document
            .clone()
            .ok_or_else(|| RegionError::VectorIndexNotFound(region_id).into())
    }

    // ── Scan sessions ─────────────────────────────────────────────────────

    /// Open a scan session over the region and return the first batch.
    pub fn scan_begin(
        &self,
        region_id: RegionId,
        range: &KeyRange,
        batch_size: usize,
    ) -> KiteResult<(u64, Vec<KeyValue>, bool)> {
        let handle = self.handle(region_id)?;
        let clipped = clip_range(range, &handle.region.range())?;
        self.scans
            .begin(region_id, (handle.caps.read.snapshot)(), clipped, batch_size)
    }

    pub fn scan_continue(
        &self,
        scan_id: u64,
        max_fetch: usize,
    ) -> KiteResult<(Vec<KeyValue>, bool)> {
        self.scans.continue_batch(scan_id, max_fetch)
    }

    pub fn scan_release(&self, scan_id: u64) {
        self.scans.release(scan_id);
    }

    // ── Metrics ───────────────────────────────────────────────────────────

    pub fn metrics(&self, region_id: RegionId) -> RegionMetrics {
        self.metrics
            .get(&region_id)
            .map(|m| *m.value())
            .unwrap_or_default()
    }

    pub fn update_metrics(&self, region_id: RegionId, metrics: RegionMetrics) {
        self.metrics.insert(region_id, metrics);
    }

    /// Engine-estimated footprint of the region across both namespaces.
    pub fn approximate_region_size(&self, region_id: RegionId) -> KiteResult<u64> {
        let handle = self.handle(region_id)?;
        let range = handle.region.range();
        let mut total = 0u64;
        for ns in [NS_RAW, NS_TXN] {
            let (start, end) = encode_range(ns, &range);
            for cf in handle.engine.cf_names() {
                if cf == CF_META {
                    continue;
                }
                total += handle.engine.approximate_size(&cf, &start, &end)?;
            }
        }
        Ok(total)
    }
}

/// Intersect a request range with the region range.
fn clip_range(request: &KeyRange, region: &KeyRange) -> KiteResult<KeyRange> {
    if !request.is_valid() {
        return Err(RawError::RangeEmptyOrInverted.into());
    }
    let start = if request.start_key > region.start_key {
        request.start_key.clone()
    } else {
        region.start_key.clone()
    };
    let end = if request.is_unbounded_above() {
        region.end_key.clone()
    } else if region.is_unbounded_above() {
        request.end_key.clone()
    } else if request.end_key < region.end_key {
        request.end_key.clone()
    } else {
        region.end_key.clone()
    };
    Ok(KeyRange::new(start, end))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::region::RegionDefinition;
    use kite_common::config::CoreConfig;
    use kite_mvcc::{LocalTsoClient, TsProvider};
    use kite_storage::MemoryEngine;

    pub(crate) struct NoopCoordinator;

    impl CoordinatorClient for NoopCoordinator {
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

        fn split_region(&self, _from_id: RegionId, _split_key: Vec<u8>) -> KiteResult<()> {
            Ok(())
        }
    }

    pub(crate) fn test_engine(config: CoreConfig) -> RegionEngine {
        let options = Arc::new(AtomicOptions::from_config(&config));
        let ts_provider = Arc::new(TsProvider::new(
            Arc::new(LocalTsoClient::new()),
            config.ts_provider.clone(),
        ));
        let services = Services {
            coordinator: Arc::new(NoopCoordinator),
            ts_provider,
            config,
            options,
        };
        let mut engines: HashMap<RawEngineKind, Arc<dyn RawEngine>> = HashMap::new();
        engines.insert(RawEngineKind::Memory, Arc::new(MemoryEngine::new()));
        RegionEngine::new(services, engines)
    }

    fn mono_region(engine: &RegionEngine, id: RegionId) {
        engine
            .create_region(RegionDefinition::kv(
                id,
                KeyRange::new(b"a".to_vec(), b"".to_vec()),
                StoreEngineKind::Mono,
            ))
            .unwrap();
    }

    #[test]
    fn test_simple_put_get_delete() {
        let engine = test_engine(CoreConfig::default());
        mono_region(&engine, 1);

        engine.kv_put(1, b"k", b"v1").unwrap();
        assert_eq!(engine.kv_get(1, b"k").unwrap(), Some(b"v1".to_vec()));
        engine.kv_delete(1, b"k").unwrap();
        assert_eq!(engine.kv_get(1, b"k").unwrap(), None);
    }

    #[test]
    fn test_put_overwrites_with_newer_version() {
        let engine = test_engine(CoreConfig::default());
        mono_region(&engine, 1);
        engine.kv_put(1, b"k", b"v1").unwrap();
        engine.kv_put(1, b"k", b"v2").unwrap();
        assert_eq!(engine.kv_get(1, b"k").unwrap(), Some(b"v2".to_vec()));
    }

    #[test]
    fn test_key_outside_region_rejected() {
        let engine = test_engine(CoreConfig::default());
        engine
            .create_region(RegionDefinition::kv(
                1,
                KeyRange::new(b"m".to_vec(), b"z".to_vec()),
                StoreEngineKind::Mono,
            ))
            .unwrap();
        assert!(engine.kv_put(1, b"a", b"v").is_err());
    }

    #[test]
    fn test_unknown_region() {
        let engine = test_engine(CoreConfig::default());
        let err = engine.kv_get(99, b"k").unwrap_err();
        assert_eq!(err.code(), kite_common::error::ErrorCode::RegionNotFound);
    }

    #[test]
    fn test_scan_and_count() {
        let engine = test_engine(CoreConfig::default());
        mono_region(&engine, 1);
        for key in [b"a", b"b", b"c"] {
            engine.kv_put(1, key, b"v").unwrap();
        }
        let rows = engine
            .kv_scan(1, &KeyRange::new(b"a".to_vec(), b"c".to_vec()), 0)
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(
            engine
                .kv_count(1, &KeyRange::new(b"a".to_vec(), b"".to_vec()))
                .unwrap(),
            3
        );
    }

    #[test]
    fn test_put_if_absent_and_cas() {
        let engine = test_engine(CoreConfig::default());
        mono_region(&engine, 1);
        assert!(engine.kv_put_if_absent(1, b"k", b"v1").unwrap());
        assert!(!engine.kv_put_if_absent(1, b"k", b"v2").unwrap());
        assert!(engine
            .kv_compare_and_set(1, b"k", Some(b"v1"), Some(b"v3"))
            .unwrap());
        assert!(!engine
            .kv_compare_and_set(1, b"k", Some(b"nope"), Some(b"v4"))
            .unwrap());
        assert!(engine.kv_compare_and_set(1, b"k", Some(b"v3"), None).unwrap());
        assert_eq!(engine.kv_get(1, b"k").unwrap(), None);
    }

    #[test]
    fn test_delete_range() {
        let engine = test_engine(CoreConfig::default());
        mono_region(&engine, 1);
        for key in [b"a", b"b", b"c"] {
            engine.kv_put(1, key, b"v").unwrap();
        }
        engine
            .kv_delete_range(1, &KeyRange::new(b"a".to_vec(), b"c".to_vec()))
            .unwrap();
        assert_eq!(engine.kv_get(1, b"a").unwrap(), None);
        assert_eq!(engine.kv_get(1, b"c").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_cluster_read_only_blocks_writes() {
        let engine = test_engine(CoreConfig::default());
        mono_region(&engine, 1);
        engine.services().options.set_cluster_read_only(true);
        let err = engine.kv_put(1, b"k", b"v").unwrap_err();
        assert_eq!(err.code(), kite_common::error::ErrorCode::ClusterReadOnly);
        engine.services().options.set_cluster_read_only(false);
        engine.kv_put(1, b"k", b"v").unwrap();
    }

    #[test]
    fn test_epoch_check_on_write() {
        let engine = test_engine(CoreConfig::default());
        mono_region(&engine, 1);
        let mut ctx = WriteContext::new(1);
        ctx.epoch_version = Some(99);
        let err = engine.write(&ctx, WriteBatch::new()).unwrap_err();
        assert_eq!(
            err.code(),
            kite_common::error::ErrorCode::RegionVersionChanged
        );
    }

    #[test]
    fn test_apply_split_partitions_range() {
        let engine = test_engine(CoreConfig::default());
        engine
            .create_region(RegionDefinition::kv(
                1,
                KeyRange::new(b"a".to_vec(), b"z".to_vec()),
                StoreEngineKind::Mono,
            ))
            .unwrap();
        for key in [b"b", b"m", b"x"] {
            engine.kv_put(1, key, b"v").unwrap();
        }

        engine.apply_split(1, 2, b"m").unwrap();

        let parent = engine.registry().get(1).unwrap();
        let child = engine.registry().get(2).unwrap();
        assert_eq!(parent.range(), KeyRange::new(b"a".to_vec(), b"m".to_vec()));
        assert_eq!(child.range(), KeyRange::new(b"m".to_vec(), b"z".to_vec()));
        assert_eq!(parent.epoch().version, 2);
        assert_eq!(child.epoch().version, 2);

        // Data is served by whichever region owns the key now.
        assert_eq!(engine.kv_get(1, b"b").unwrap(), Some(b"v".to_vec()));
        assert_eq!(engine.kv_get(2, b"m").unwrap(), Some(b"v".to_vec()));
        assert_eq!(engine.kv_get(2, b"x").unwrap(), Some(b"v".to_vec()));
        assert!(engine.kv_get(1, b"x").is_err());
    }

    #[test]
    fn test_split_key_must_be_inside() {
        let engine = test_engine(CoreConfig::default());
        engine
            .create_region(RegionDefinition::kv(
                1,
                KeyRange::new(b"a".to_vec(), b"m".to_vec()),
                StoreEngineKind::Mono,
            ))
            .unwrap();
        assert!(engine.apply_split(1, 2, b"a").is_err());
        assert!(engine.apply_split(1, 2, b"z").is_err());
    }

    #[test]
    fn test_txn_through_region_engine() {
        let engine = test_engine(CoreConfig::default());
        mono_region(&engine, 1);
        let txn = engine.txn_engine(1).unwrap();
        txn.prewrite(&kite_txn::PrewriteRequest {
            mutations: vec![kite_txn::Mutation::put(b"x".to_vec(), b"A".to_vec())],
            primary_lock: b"x".to_vec(),
            start_ts: 10,
            lock_ttl_ms: 1000,
            txn_size: 1,
            ..Default::default()
        })
        .unwrap();
        txn.commit(10, 20, &[b"x".to_vec()]).unwrap();

        let reader = engine.txn_reader(1).unwrap();
        assert_eq!(reader.txn_get(25, b"x", &[]).unwrap(), Some(b"A".to_vec()));
    }

    #[test]
    fn test_drop_region() {
        let engine = test_engine(CoreConfig::default());
        mono_region(&engine, 1);
        engine.drop_region(1).unwrap();
        assert!(engine.kv_get(1, b"k").is_err());
    }
}
