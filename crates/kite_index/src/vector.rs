//! Per-region vector index wrapper.
//!
//! Vector payloads live in `vector_data`, scalar fields in `vector_scalar`,
//! selective columns in `vector_scalar_speedup` keyed by `(id, scalar_key)`,
//! and table rows in `vector_table`, all MVCC-encoded under the vector
//! namespace, so index reads are consistent at a timestamp.
//!
//! Search with filtering supports three modes: post-filter (over-fetch,
//! predicate, truncate), pre-filter by id set (functor pushed into the ANN),
//! and pre-filter by scalar (scan the scalar CF, or the speedup CF when
//! every predicate key is in the speedup schema).

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use kite_common::error::{KiteResult, RegionError};
use kite_common::types::{KeyRange, RegionId, Ts};
use kite_mvcc::codec::{pack_tombstone, pack_value, ValueFlag, NS_VECTOR};
use kite_mvcc::reader::MvccReader;
use kite_storage::engine::{
    RawEngine, WriteBatch, CF_VECTOR_DATA, CF_VECTOR_SCALAR, CF_VECTOR_SCALAR_SPEEDUP,
    CF_VECTOR_TABLE,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Post-filter over-fetch multiplier: search `k * M`, then apply the
/// predicate and truncate to `k`.
const POST_FILTER_MULTIPLIER: usize = 10;

static RUNNING_BUILD_TASKS: AtomicI64 = AtomicI64::new(0);

/// Number of vector index build/rebuild tasks currently running across the
/// process. Split-check suppresses splits above a threshold.
pub fn running_build_tasks() -> i64 {
    RUNNING_BUILD_TASKS.load(Ordering::Relaxed)
}

struct BuildTaskGuard;

impl BuildTaskGuard {
    fn enter() -> Self {
        RUNNING_BUILD_TASKS.fetch_add(1, Ordering::Relaxed);
        BuildTaskGuard
    }
}

impl Drop for BuildTaskGuard {
    fn drop(&mut self) {
        RUNNING_BUILD_TASKS.fetch_sub(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VectorDistance {
    L2,
    InnerProduct,
    Cosine,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VectorIndexKind {
    Flat,
    Hnsw,
    Ivf,
    DiskAnn,
}

/// Region index parameters carried in the region definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorIndexParams {
    pub kind: VectorIndexKind,
    pub dimension: usize,
    pub distance: VectorDistance,
    /// Scalar keys stored column-wise in the speedup CF.
    pub speedup_keys: Vec<String>,
}

/// A search hit; smaller distance is better for every metric.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredVector {
    pub id: u64,
    pub distance: f32,
}

/// The ANN surface the wrapper delegates to.
pub trait VectorIndex: Send + Sync {
    fn add(&self, id: u64, vector: &[f32]) -> KiteResult<()>;
    fn remove(&self, id: u64);
    fn search(
        &self,
        query: &[f32],
        top_n: usize,
        filter: Option<&(dyn Fn(u64) -> bool + Send + Sync)>,
    ) -> Vec<ScoredVector>;
    fn count(&self) -> usize;
    fn dimension(&self) -> usize;
    fn clear(&self);
}

/// Exact (brute-force) index; the in-tree reference implementation.
pub struct FlatIndex {
    dimension: usize,
    distance: VectorDistance,
    vectors: RwLock<BTreeMap<u64, Vec<f32>>>,
}

impl FlatIndex {
    pub fn new(dimension: usize, distance: VectorDistance) -> Self {
        Self {
            dimension,
            distance,
            vectors: RwLock::new(BTreeMap::new()),
        }
    }

    fn score(&self, a: &[f32], b: &[f32]) -> f32 {
        match self.distance {
            VectorDistance::L2 => a
                .iter()
                .zip(b)
                .map(|(x, y)| (x - y) * (x - y))
                .sum(),
            // Inner product: larger dot is better, so negate.
            VectorDistance::InnerProduct => -dot(a, b),
            VectorDistance::Cosine => {
                let norm = (dot(a, a).sqrt() * dot(b, b).sqrt()).max(f32::EPSILON);
                1.0 - dot(a, b) / norm
            }
        }
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

impl VectorIndex for FlatIndex {
    fn add(&self, id: u64, vector: &[f32]) -> KiteResult<()> {
        if vector.len() != self.dimension {
            return Err(RegionError::VectorNotSupport(format!(
                "dimension {} does not match index dimension {}",
                vector.len(),
                self.dimension
            ))
            .into());
        }
        self.vectors.write().insert(id, vector.to_vec());
        Ok(())
    }

    fn remove(&self, id: u64) {
        self.vectors.write().remove(&id);
    }

    fn search(
        &self,
        query: &[f32],
        top_n: usize,
        filter: Option<&(dyn Fn(u64) -> bool + Send + Sync)>,
    ) -> Vec<ScoredVector> {
        let vectors = self.vectors.read();
        let mut scored: Vec<ScoredVector> = vectors
            .iter()
            .filter(|(id, _)| filter.map(|f| f(**id)).unwrap_or(true))
            .map(|(id, v)| ScoredVector {
                id: *id,
                distance: self.score(query, v),
            })
            .collect();
        scored.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        scored.truncate(top_n);
        scored
    }

    fn count(&self) -> usize {
        self.vectors.read().len()
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn clear(&self) {
        self.vectors.write().clear();
    }
}

/// Instantiate the index for a region. Approximate kinds bind to external
/// ANN libraries in production deployments.
pub fn build_index(params: &VectorIndexParams) -> KiteResult<Arc<dyn VectorIndex>> {
    match params.kind {
        VectorIndexKind::Flat => Ok(Arc::new(FlatIndex::new(params.dimension, params.distance))),
        other => Err(RegionError::VectorNotSupport(format!(
            "index kind {other:?} requires an external ANN library"
        ))
        .into()),
    }
}

/// One vector row as written by clients.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VectorWithData {
    pub id: u64,
    pub vector: Vec<f32>,
    pub scalars: BTreeMap<String, String>,
    pub table_data: Option<Vec<u8>>,
}

/// Filter mode for a search request.
#[derive(Debug, Clone)]
pub enum VectorFilter {
    None,
    /// Search `k * M`, apply the predicate, truncate to `k`.
    ScalarPost { predicates: BTreeMap<String, String> },
    /// Caller-supplied allowed ids, pushed into the ANN as a functor.
    IdPre { ids: Vec<u64> },
    /// Collect matching ids from the scalar CFs first, then ANN over them.
    ScalarPre { predicates: BTreeMap<String, String> },
}

/// Per-region coordination around one ANN index.
pub struct VectorIndexWrapper {
    region_id: RegionId,
    params: VectorIndexParams,
    index: Arc<dyn VectorIndex>,
    engine: Arc<dyn RawEngine>,
}

impl std::fmt::Debug for VectorIndexWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorIndexWrapper")
            .field("region_id", &self.region_id)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

impl VectorIndexWrapper {
    pub fn new(
        region_id: RegionId,
        params: VectorIndexParams,
        engine: Arc<dyn RawEngine>,
    ) -> KiteResult<Self> {
        let index = build_index(&params)?;
        Ok(Self {
            region_id,
            params,
            index,
            engine,
        })
    }

    pub fn region_id(&self) -> RegionId {
        self.region_id
    }

    pub fn index(&self) -> &Arc<dyn VectorIndex> {
        &self.index
    }

    /// Write one vector row at `ts` and add it to the live index.
    pub fn upsert(&self, ts: Ts, row: &VectorWithData) -> KiteResult<()> {
        let id_key = row.id.to_be_bytes();
        let mut batch = WriteBatch::new();
        let vector_raw =
            bincode::serialize(&row.vector).map_err(|e| {
                kite_common::error::RawError::Codec(e.to_string())
            })?;
        batch.put(
            CF_VECTOR_DATA,
            kite_mvcc::codec::encode_key(NS_VECTOR, &id_key, ts),
            pack_value(ValueFlag::Normal, &vector_raw),
        );

        let scalars_raw = bincode::serialize(&row.scalars)
            .map_err(|e| kite_common::error::RawError::Codec(e.to_string()))?;
        batch.put(
            CF_VECTOR_SCALAR,
            kite_mvcc::codec::encode_key(NS_VECTOR, &id_key, ts),
            pack_value(ValueFlag::Normal, &scalars_raw),
        );

        for key in &self.params.speedup_keys {
            if let Some(value) = row.scalars.get(key) {
                batch.put(
                    CF_VECTOR_SCALAR_SPEEDUP,
                    kite_mvcc::codec::encode_key(NS_VECTOR, &speedup_key(row.id, key), ts),
                    pack_value(ValueFlag::Normal, value.as_bytes()),
                );
            }
        }

        if let Some(table) = &row.table_data {
            batch.put(
                CF_VECTOR_TABLE,
                kite_mvcc::codec::encode_key(NS_VECTOR, &id_key, ts),
                pack_value(ValueFlag::Normal, table),
            );
        }

        self.engine.write_batch(batch)?;
        self.index.add(row.id, &row.vector)
    }

    /// Tombstone one vector row at `ts` and drop it from the live index.
    pub fn delete(&self, ts: Ts, id: u64) -> KiteResult<()> {
        let id_key = id.to_be_bytes();
        let mut batch = WriteBatch::new();
        batch.put(
            CF_VECTOR_DATA,
            kite_mvcc::codec::encode_key(NS_VECTOR, &id_key, ts),
            pack_tombstone(),
        );
        batch.put(
            CF_VECTOR_SCALAR,
            kite_mvcc::codec::encode_key(NS_VECTOR, &id_key, ts),
            pack_tombstone(),
        );
        for key in &self.params.speedup_keys {
            batch.put(
                CF_VECTOR_SCALAR_SPEEDUP,
                kite_mvcc::codec::encode_key(NS_VECTOR, &speedup_key(id, key), ts),
                pack_tombstone(),
            );
        }
        batch.put(
            CF_VECTOR_TABLE,
            kite_mvcc::codec::encode_key(NS_VECTOR, &id_key, ts),
            pack_tombstone(),
        );
        self.engine.write_batch(batch)?;
        self.index.remove(id);
        Ok(())
    }

    /// Top-n search at `ts` with the requested filter mode.
    pub fn search(
        &self,
        ts: Ts,
        query: &[f32],
        top_n: usize,
        filter: &VectorFilter,
    ) -> KiteResult<Vec<ScoredVector>> {
        match filter {
            VectorFilter::None => Ok(self.index.search(query, top_n, None)),
            VectorFilter::ScalarPost { predicates } => {
                let candidates =
                    self.index
                        .search(query, top_n.saturating_mul(POST_FILTER_MULTIPLIER), None);
                let mut out = Vec::with_capacity(top_n);
                for hit in candidates {
                    if self.scalar_matches(ts, hit.id, predicates)? {
                        out.push(hit);
                        if out.len() >= top_n {
                            break;
                        }
                    }
                }
                Ok(out)
            }
            VectorFilter::IdPre { ids } => {
                let allowed: HashSet<u64> = ids.iter().copied().collect();
                let functor = move |id: u64| allowed.contains(&id);
                Ok(self.index.search(query, top_n, Some(&functor)))
            }
            VectorFilter::ScalarPre { predicates } => {
                let allowed = self.collect_ids_by_scalar(ts, predicates)?;
                let functor = move |id: u64| allowed.contains(&id);
                Ok(self.index.search(query, top_n, Some(&functor)))
            }
        }
    }

    /// Load one vector row at `ts`.
    pub fn query(
        &self,
        ts: Ts,
        id: u64,
        with_scalar: bool,
        with_table: bool,
    ) -> KiteResult<Option<VectorWithData>> {
        let reader = MvccReader::vector(self.engine.snapshot());
        let id_key = id.to_be_bytes();
        let Some(raw) = reader.kv_get(CF_VECTOR_DATA, ts, &id_key)? else {
            return Ok(None);
        };
        let vector: Vec<f32> = bincode::deserialize(&raw)
            .map_err(|e| kite_common::error::RawError::Codec(e.to_string()))?;

        let scalars = if with_scalar {
            match reader.kv_get(CF_VECTOR_SCALAR, ts, &id_key)? {
                Some(raw) => bincode::deserialize(&raw)
                    .map_err(|e| kite_common::error::RawError::Codec(e.to_string()))?,
                None => BTreeMap::new(),
            }
        } else {
            BTreeMap::new()
        };

        let table_data = if with_table {
            reader.kv_get(CF_VECTOR_TABLE, ts, &id_key)?
        } else {
            None
        };

        Ok(Some(VectorWithData {
            id,
            vector,
            scalars,
            table_data,
        }))
    }

    pub fn batch_query(
        &self,
        ts: Ts,
        ids: &[u64],
        with_scalar: bool,
        with_table: bool,
    ) -> KiteResult<Vec<Option<VectorWithData>>> {
        ids.iter()
            .map(|&id| self.query(ts, id, with_scalar, with_table))
            .collect()
    }

    /// Smallest or largest live vector id at `ts`.
    pub fn border_id(&self, ts: Ts, min: bool) -> KiteResult<Option<u64>> {
        let reader = MvccReader::vector(self.engine.snapshot());
        let range = full_id_range();
        let key = if min {
            reader.kv_min_key(CF_VECTOR_DATA, ts, &range)?
        } else {
            reader.kv_max_key(CF_VECTOR_DATA, ts, &range)?
        };
        Ok(key.map(|k| decode_id(&k)))
    }

    /// Live vector count at `ts`. Walks versions.
    pub fn count(&self, ts: Ts) -> KiteResult<i64> {
        let reader = MvccReader::vector(self.engine.snapshot());
        reader.kv_count(CF_VECTOR_DATA, ts, &full_id_range())
    }

    /// Ranged id scan at `ts`.
    pub fn scan_ids(
        &self,
        ts: Ts,
        start_id: u64,
        end_id: u64,
        limit: usize,
    ) -> KiteResult<Vec<u64>> {
        let reader = MvccReader::vector(self.engine.snapshot());
        let range = KeyRange::new(start_id.to_be_bytes().to_vec(), end_id.to_be_bytes().to_vec());
        let mut out = Vec::new();
        reader.kv_scan_with(CF_VECTOR_DATA, ts, &range, |key, _| {
            out.push(decode_id(key));
            limit == 0 || out.len() < limit
        })?;
        Ok(out)
    }

    /// Rebuild the live index from the data CF at `ts`. Holds the global
    /// build gauge for the duration.
    pub fn rebuild(&self, ts: Ts) -> KiteResult<usize> {
        let _guard = BuildTaskGuard::enter();
        let reader = MvccReader::vector(self.engine.snapshot());
        self.index.clear();
        let mut loaded = 0usize;
        let mut first_error = None;
        reader.kv_scan_with(CF_VECTOR_DATA, ts, &full_id_range(), |key, value| {
            match bincode::deserialize::<Vec<f32>>(value) {
                Ok(vector) => {
                    if let Err(e) = self.index.add(decode_id(key), &vector) {
                        first_error = Some(e);
                        return false;
                    }
                    loaded += 1;
                }
                Err(e) => {
                    first_error =
                        Some(kite_common::error::RawError::Codec(e.to_string()).into());
                    return false;
                }
            }
            true
        })?;
        if let Some(e) = first_error {
            return Err(e);
        }
        tracing::info!(region = self.region_id, loaded, "vector index rebuilt");
        Ok(loaded)
    }

    fn scalar_matches(
        &self,
        ts: Ts,
        id: u64,
        predicates: &BTreeMap<String, String>,
    ) -> KiteResult<bool> {
        let reader = MvccReader::vector(self.engine.snapshot());
        let Some(raw) = reader.kv_get(CF_VECTOR_SCALAR, ts, &id.to_be_bytes())? else {
            return Ok(false);
        };
        let scalars: BTreeMap<String, String> = bincode::deserialize(&raw)
            .map_err(|e| kite_common::error::RawError::Codec(e.to_string()))?;
        Ok(predicates
            .iter()
            .all(|(k, v)| scalars.get(k).map(|s| s == v).unwrap_or(false)))
    }

    /// Ids whose scalar fields satisfy every predicate. Uses the speedup CF
    /// when all predicate keys are in the speedup schema, avoiding full
    /// scalar-record materialization.
    fn collect_ids_by_scalar(
        &self,
        ts: Ts,
        predicates: &BTreeMap<String, String>,
    ) -> KiteResult<HashSet<u64>> {
        let use_speedup = !predicates.is_empty()
            && predicates
                .keys()
                .all(|k| self.params.speedup_keys.iter().any(|s| s == k));

        let reader = MvccReader::vector(self.engine.snapshot());
        let mut allowed = HashSet::new();

        if use_speedup {
            // (id, key) → value rows; count how many predicates each id hits.
            let mut hits: BTreeMap<u64, usize> = BTreeMap::new();
            reader.kv_scan_with(
                CF_VECTOR_SCALAR_SPEEDUP,
                ts,
                &full_id_range(),
                |key, value| {
                    if let Some((id, scalar_key)) = decode_speedup_key(key) {
                        if let Some(expected) = predicates.get(scalar_key) {
                            if expected.as_bytes() == value {
                                *hits.entry(id).or_default() += 1;
                            }
                        }
                    }
                    true
                },
            )?;
            for (id, count) in hits {
                if count == predicates.len() {
                    allowed.insert(id);
                }
            }
        } else {
            reader.kv_scan_with(CF_VECTOR_SCALAR, ts, &full_id_range(), |key, value| {
                if let Ok(scalars) = bincode::deserialize::<BTreeMap<String, String>>(value) {
                    let matched = predicates
                        .iter()
                        .all(|(k, v)| scalars.get(k).map(|s| s == v).unwrap_or(false));
                    if matched {
                        allowed.insert(decode_id(key));
                    }
                }
                true
            })?;
        }
        Ok(allowed)
    }
}

fn full_id_range() -> KeyRange {
    KeyRange::new(0u64.to_be_bytes().to_vec(), Vec::new())
}

fn decode_id(plain_key: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    let len = plain_key.len().min(8);
    raw[..len].copy_from_slice(&plain_key[..len]);
    u64::from_be_bytes(raw)
}

fn speedup_key(id: u64, scalar_key: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + scalar_key.len());
    out.extend_from_slice(&id.to_be_bytes());
    out.extend_from_slice(scalar_key.as_bytes());
    out
}

fn decode_speedup_key(plain_key: &[u8]) -> Option<(u64, &str)> {
    if plain_key.len() < 8 {
        return None;
    }
    let id = u64::from_be_bytes(plain_key[..8].try_into().ok()?);
    let key = std::str::from_utf8(&plain_key[8..]).ok()?;
    Some((id, key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kite_storage::MemoryEngine;

    fn params(speedup: &[&str]) -> VectorIndexParams {
        VectorIndexParams {
            kind: VectorIndexKind::Flat,
            dimension: 2,
            distance: VectorDistance::L2,
            speedup_keys: speedup.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn wrapper(speedup: &[&str]) -> VectorIndexWrapper {
        VectorIndexWrapper::new(1, params(speedup), Arc::new(MemoryEngine::new())).unwrap()
    }

    fn row(id: u64, vector: Vec<f32>, tag: &str) -> VectorWithData {
        let mut scalars = BTreeMap::new();
        scalars.insert("tag".to_string(), tag.to_string());
        VectorWithData {
            id,
            vector,
            scalars,
            table_data: None,
        }
    }

    #[test]
    fn test_flat_index_orders_by_distance() {
        let index = FlatIndex::new(2, VectorDistance::L2);
        index.add(1, &[0.0, 0.0]).unwrap();
        index.add(2, &[1.0, 0.0]).unwrap();
        index.add(3, &[5.0, 5.0]).unwrap();

        let hits = index.search(&[0.1, 0.0], 2, None);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, 1);
        assert_eq!(hits[1].id, 2);
    }

    #[test]
    fn test_flat_index_dimension_check() {
        let index = FlatIndex::new(2, VectorDistance::L2);
        assert!(index.add(1, &[1.0, 2.0, 3.0]).is_err());
    }

    #[test]
    fn test_non_flat_kind_needs_external_library() {
        let mut p = params(&[]);
        p.kind = VectorIndexKind::Hnsw;
        let err = VectorIndexWrapper::new(1, p, Arc::new(MemoryEngine::new())).unwrap_err();
        assert_eq!(
            err.code(),
            kite_common::error::ErrorCode::VectorNotSupport
        );
    }

    #[test]
    fn test_upsert_query_delete() {
        let w = wrapper(&[]);
        w.upsert(10, &row(7, vec![1.0, 2.0], "A")).unwrap();

        let loaded = w.query(20, 7, true, false).unwrap().unwrap();
        assert_eq!(loaded.vector, vec![1.0, 2.0]);
        assert_eq!(loaded.scalars.get("tag").unwrap(), "A");

        // Nothing visible before the write.
        assert!(w.query(5, 7, false, false).unwrap().is_none());

        w.delete(30, 7).unwrap();
        assert!(w.query(40, 7, false, false).unwrap().is_none());
        // The old version is still visible below the tombstone.
        assert!(w.query(20, 7, false, false).unwrap().is_some());
    }

    #[test]
    fn test_scalar_pre_filter() {
        let w = wrapper(&[]);
        for id in 0..1000u64 {
            let tag = if id % 2 == 0 { "A" } else { "B" };
            let v = vec![id as f32, 0.0];
            w.upsert(10, &row(id, v, tag)).unwrap();
        }

        let mut predicates = BTreeMap::new();
        predicates.insert("tag".to_string(), "A".to_string());
        let hits = w
            .search(20, &[0.0, 0.0], 5, &VectorFilter::ScalarPre { predicates })
            .unwrap();
        assert_eq!(hits.len(), 5);
        for hit in &hits {
            assert_eq!(hit.id % 2, 0, "id {} is not tagged A", hit.id);
        }
    }

    #[test]
    fn test_scalar_pre_filter_uses_speedup_cf() {
        let w = wrapper(&["tag"]);
        for id in 0..100u64 {
            let tag = if id < 50 { "A" } else { "B" };
            w.upsert(10, &row(id, vec![id as f32, 0.0], tag)).unwrap();
        }
        let mut predicates = BTreeMap::new();
        predicates.insert("tag".to_string(), "B".to_string());
        let hits = w
            .search(20, &[99.0, 0.0], 3, &VectorFilter::ScalarPre { predicates })
            .unwrap();
        assert_eq!(hits.len(), 3);
        for hit in &hits {
            assert!(hit.id >= 50);
        }
    }

    #[test]
    fn test_id_pre_filter() {
        let w = wrapper(&[]);
        for id in 0..10u64 {
            w.upsert(10, &row(id, vec![id as f32, 0.0], "A")).unwrap();
        }
        let hits = w
            .search(
                20,
                &[0.0, 0.0],
                5,
                &VectorFilter::IdPre {
                    ids: vec![8, 9],
                },
            )
            .unwrap();
        let ids: Vec<u64> = hits.iter().map(|h| h.id).collect();
        assert_eq!(ids, vec![8, 9]);
    }

    #[test]
    fn test_post_filter() {
        let w = wrapper(&[]);
        for id in 0..20u64 {
            let tag = if id % 4 == 0 { "A" } else { "B" };
            w.upsert(10, &row(id, vec![id as f32, 0.0], tag)).unwrap();
        }
        let mut predicates = BTreeMap::new();
        predicates.insert("tag".to_string(), "A".to_string());
        let hits = w
            .search(20, &[0.0, 0.0], 3, &VectorFilter::ScalarPost { predicates })
            .unwrap();
        assert_eq!(hits.len(), 3);
        for hit in &hits {
            assert_eq!(hit.id % 4, 0);
        }
    }

    #[test]
    fn test_border_count_scan() {
        let w = wrapper(&[]);
        for id in [3u64, 9, 27] {
            w.upsert(10, &row(id, vec![1.0, 1.0], "A")).unwrap();
        }
        assert_eq!(w.border_id(20, true).unwrap(), Some(3));
        assert_eq!(w.border_id(20, false).unwrap(), Some(27));
        assert_eq!(w.count(20).unwrap(), 3);
        assert_eq!(w.scan_ids(20, 0, 10, 0).unwrap(), vec![3, 9]);
    }

    #[test]
    fn test_rebuild_reflects_ts() {
        let w = wrapper(&[]);
        w.upsert(10, &row(1, vec![0.0, 0.0], "A")).unwrap();
        w.upsert(30, &row(2, vec![1.0, 1.0], "A")).unwrap();

        // Rebuild at a point where only the first row existed.
        assert_eq!(w.rebuild(20).unwrap(), 1);
        assert_eq!(w.index().count(), 1);
        assert_eq!(w.rebuild(40).unwrap(), 2);
        assert_eq!(running_build_tasks(), 0);
    }
}
