//! Split-check: decide where (and whether) a region should split.
//!
//! A periodic pre-check pass walks alive regions and dispatches full
//! key-space scans to a pool of serial workers. The scan streams the
//! region's storage keys across all relevant column families through a
//! merged iterator and applies one of three policies:
//!
//! - **HALF**: sample a candidate key every `chunk_size` bytes; when the
//!   total reaches `threshold_size`, emit the middle candidate.
//! - **SIZE**: remember the key where the stream passed
//!   `threshold_size * size_ratio`; emit it when the total reaches
//!   `threshold_size`.
//! - **KEYS**: count distinct plain keys; remember the key at
//!   `keys_number * keys_ratio`; emit when the count reaches `keys_number`.
//!
//! A candidate is then re-validated (decodes cleanly, strictly inside the
//! range, region still NORMAL at the same version, no change freeze, not
//! too many index builds running) before the coordinator is asked to split.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Sender};
use kite_common::config::{SplitConfig, SplitPolicy};
use kite_common::error::KiteResult;
use kite_common::types::{hex, now_ms, RegionId};
use kite_mvcc::codec::{decode_key, decode_plain_key, encode_plain_key, NS_RAW, NS_TXN};
use kite_storage::engine::{
    EngineIterator, EngineSnapshot, IteratorOptions, CF_DATA, CF_DEFAULT, CF_LOCK, CF_WRITE,
};
use kite_storage::MergedIterator;
use parking_lot::Mutex;

use crate::engine::{RegionEngine, RegionMetrics};
use crate::region::{RegionState, StoreEngineKind};

/// Splits are suppressed while more index build tasks than this run.
const VECTOR_BUILD_TASK_GATE: i64 = 8;

/// Outcome of one region scan.
pub struct SplitScan {
    pub split_key: Option<Vec<u8>>,
    pub total_size: u64,
    pub key_count: u64,
}

/// One split policy over a merged storage-key stream.
pub trait SplitChecker: Send {
    fn policy_name(&self) -> &'static str;
    fn split_key(&self, iter: &mut MergedIterator, start: &[u8]) -> SplitScan;
}

pub fn build_split_checker(config: &SplitConfig) -> Box<dyn SplitChecker> {
    match config.policy {
        SplitPolicy::Half => Box::new(HalfSplitChecker {
            threshold_size: config.threshold_size,
            chunk_size: config.chunk_size.max(1),
        }),
        SplitPolicy::Size => Box::new(SizeSplitChecker {
            threshold_size: config.threshold_size,
            ratio: config.size_ratio,
        }),
        SplitPolicy::Keys => Box::new(KeysSplitChecker {
            keys_number: config.keys_number,
            ratio: config.keys_ratio,
        }),
    }
}

/// Plain key of a storage key, tolerant of unversioned (lock CF) rows.
fn plain_of(storage_key: &[u8]) -> Vec<u8> {
    if let Ok((_, plain, _)) = decode_key(storage_key) {
        return plain;
    }
    decode_plain_key(storage_key)
        .map(|(_, plain)| plain)
        .unwrap_or_else(|_| storage_key.to_vec())
}

pub struct HalfSplitChecker {
    threshold_size: u64,
    chunk_size: u64,
}

impl SplitChecker for HalfSplitChecker {
    fn policy_name(&self) -> &'static str {
        "HALF"
    }

    fn split_key(&self, iter: &mut MergedIterator, start: &[u8]) -> SplitScan {
        iter.seek(start);
        let mut size = 0u64;
        let mut chunk = 0u64;
        let mut count = 0u64;
        let mut prev_plain: Vec<u8> = Vec::new();
        let mut candidates: Vec<Vec<u8>> = Vec::new();
        let mut is_split = false;

        while iter.valid() {
            let kv_size = iter.key_value_size() as u64;
            size += kv_size;
            chunk += kv_size;
            if chunk >= self.chunk_size {
                chunk = 0;
                candidates.push(iter.key().to_vec());
            }
            if size >= self.threshold_size {
                is_split = true;
            }
            let plain = plain_of(iter.key());
            if plain != prev_plain {
                prev_plain = plain;
                count += 1;
            }
            iter.next();
        }

        let split_key = if is_split && !candidates.is_empty() {
            Some(candidates[candidates.len() / 2].clone())
        } else {
            None
        };
        SplitScan {
            split_key,
            total_size: size,
            key_count: count,
        }
    }
}

pub struct SizeSplitChecker {
    threshold_size: u64,
    ratio: f64,
}

impl SplitChecker for SizeSplitChecker {
    fn policy_name(&self) -> &'static str {
        "SIZE"
    }

    fn split_key(&self, iter: &mut MergedIterator, start: &[u8]) -> SplitScan {
        iter.seek(start);
        let split_pos = (self.threshold_size as f64 * self.ratio) as u64;
        let mut size = 0u64;
        let mut count = 0u64;
        let mut prev_plain: Vec<u8> = Vec::new();
        let mut split_key: Option<Vec<u8>> = None;
        let mut is_split = false;

        while iter.valid() {
            size += iter.key_value_size() as u64;
            if split_key.is_none() && size >= split_pos {
                split_key = Some(iter.key().to_vec());
            } else if size >= self.threshold_size {
                is_split = true;
            }
            let plain = plain_of(iter.key());
            if plain != prev_plain {
                prev_plain = plain;
                count += 1;
            }
            iter.next();
        }

        SplitScan {
            split_key: if is_split { split_key } else { None },
            total_size: size,
            key_count: count,
        }
    }
}

pub struct KeysSplitChecker {
    keys_number: u64,
    ratio: f64,
}

impl SplitChecker for KeysSplitChecker {
    fn policy_name(&self) -> &'static str {
        "KEYS"
    }

    fn split_key(&self, iter: &mut MergedIterator, start: &[u8]) -> SplitScan {
        iter.seek(start);
        let split_number = (self.keys_number as f64 * self.ratio) as u64;
        let mut size = 0u64;
        let mut count = 0u64;
        let mut prev_plain: Vec<u8> = Vec::new();
        let mut split_key: Option<Vec<u8>> = None;
        let mut is_split = false;

        while iter.valid() {
            let plain = plain_of(iter.key());
            if plain != prev_plain {
                prev_plain = plain;
                count += 1;
            }
            size += iter.key_value_size() as u64;

            if split_key.is_none() && count >= split_number {
                split_key = Some(iter.key().to_vec());
            } else if count >= self.keys_number {
                is_split = true;
            }
            iter.next();
        }

        SplitScan {
            split_key: if is_split { split_key } else { None },
            total_size: size,
            key_count: count,
        }
    }
}

/// CF set and storage-key bracket for a region scan: txn families when the
/// region holds transactional data, the raw family otherwise.
fn select_scan_target(
    snapshot: &Arc<dyn EngineSnapshot>,
    range: &kite_common::types::KeyRange,
) -> KiteResult<(Vec<String>, Vec<u8>, Vec<u8>)> {
    let txn_lower = encode_plain_key(NS_TXN, &range.start_key);
    let txn_upper = if range.is_unbounded_above() {
        vec![NS_TXN + 1]
    } else {
        encode_plain_key(NS_TXN, &range.end_key)
    };
    for cf in [CF_WRITE, CF_DATA, CF_LOCK] {
        let mut iter = snapshot.iter(
            cf,
            IteratorOptions::bounded(txn_lower.clone(), txn_upper.clone()),
        )?;
        iter.seek(&txn_lower);
        if iter.valid() {
            let cfs = vec![
                CF_DATA.to_string(),
                CF_LOCK.to_string(),
                CF_WRITE.to_string(),
            ];
            return Ok((cfs, txn_lower, txn_upper));
        }
    }

    let raw_lower = encode_plain_key(NS_RAW, &range.start_key);
    let raw_upper = if range.is_unbounded_above() {
        vec![NS_RAW + 1]
    } else {
        encode_plain_key(NS_RAW, &range.end_key)
    };
    Ok((vec![CF_DEFAULT.to_string()], raw_lower, raw_upper))
}

/// Scan one region and, when warranted, ask the coordinator to split it.
/// Returns the plain split key that was requested, or `None` when the
/// check suppressed the split.
pub fn split_check(engine: &RegionEngine, region_id: RegionId) -> KiteResult<Option<Vec<u8>>> {
    let start_time = now_ms();
    let handle = engine.handle(region_id)?;
    let region = &handle.region;
    let epoch = region.epoch();
    let plain_range = region.range();

    let snapshot = handle.engine.snapshot();
    let (cf_names, lower, upper) = select_scan_target(&snapshot, &plain_range)?;
    let checker = build_split_checker(&engine.services().config.split);

    let mut merged = MergedIterator::new(snapshot, &cf_names, &upper)?;
    let scan = checker.split_key(&mut merged, &lower);

    if scan.key_count > 0 || scan.total_size > 0 {
        engine.update_metrics(
            region_id,
            RegionMetrics {
                region_size: scan.total_size,
                key_count: scan.key_count,
            },
        );
    }

    let plain_split_key = scan.split_key.as_deref().map(plain_of);

    let mut reason = "";
    let need_split = loop {
        let Some(split_key) = plain_split_key.as_deref() else {
            reason = "split key is empty";
            break false;
        };
        if region.epoch().version != epoch.version {
            reason = "region version change";
            break false;
        }
        if !region.check_key_in_range(split_key)
            || split_key == plain_range.start_key.as_slice()
        {
            reason = "split key not inside region range";
            break false;
        }
        if region.disable_change() {
            reason = "region disable split";
            break false;
        }
        if region.temporary_disable_change() {
            reason = "region temporary disable split";
            break false;
        }
        if region.state() != RegionState::Normal {
            reason = "region state not normal";
            break false;
        }
        if !leader_for_split(engine, region_id) {
            reason = "not leader or engine unsupported";
            break false;
        }
        if region.store_engine() == StoreEngineKind::Mono
            && !engine
                .services()
                .options
                .enable_split_and_merge_for_lite()
        {
            reason = "mono store region disable split";
            break false;
        }
        if kite_index::running_build_tasks() > VECTOR_BUILD_TASK_GATE {
            reason = "too many running vector index tasks";
            break false;
        }
        break true;
    };

    tracing::info!(
        region = region_id,
        result = need_split,
        reason,
        policy = checker.policy_name(),
        split_key = %plain_split_key.as_deref().map(hex).unwrap_or_default(),
        version = epoch.version,
        size = scan.total_size,
        keys = scan.key_count,
        elapsed_ms = now_ms().saturating_sub(start_time),
        "split check finished"
    );

    if !need_split {
        return Ok(None);
    }
    let split_key = plain_split_key.unwrap_or_default();
    match engine
        .services()
        .coordinator
        .split_region(region_id, split_key.clone())
    {
        Ok(()) => {
            // Ownership note: only this admission site sets the flag; the
            // split application (or rejection) clears it.
            region.set_temporary_disable_change();
            Ok(Some(split_key))
        }
        Err(e) => {
            tracing::warn!(region = region_id, error = %e, "split region request failed");
            Ok(None)
        }
    }
}

fn leader_for_split(engine: &RegionEngine, region_id: RegionId) -> bool {
    let Ok(handle) = engine.handle(region_id) else {
        return false;
    };
    match handle.region.store_engine() {
        StoreEngineKind::Mono => true,
        StoreEngineKind::Memory => false,
        StoreEngineKind::Raft => engine
            .nodes()
            .get(region_id)
            .map(|node| node.is_leader())
            .unwrap_or(false),
    }
}

/// Serial FIFO workers running region scans; workers run concurrently with
/// each other, tasks within one worker in order.
struct SplitCheckWorkers {
    senders: Vec<Sender<RegionId>>,
    handles: Vec<JoinHandle<()>>,
    next: AtomicUsize,
}

/// Periodic pre-check driver.
pub struct PreSplitChecker {
    engine: Arc<RegionEngine>,
    workers: SplitCheckWorkers,
    checking: Arc<Mutex<HashSet<RegionId>>>,
}

impl PreSplitChecker {
    pub fn new(engine: Arc<RegionEngine>, worker_num: usize) -> Self {
        let checking: Arc<Mutex<HashSet<RegionId>>> = Arc::new(Mutex::new(HashSet::new()));
        let mut senders = Vec::with_capacity(worker_num.max(1));
        let mut handles = Vec::with_capacity(worker_num.max(1));
        for i in 0..worker_num.max(1) {
            let (tx, rx) = unbounded::<RegionId>();
            let engine = Arc::clone(&engine);
            let checking = Arc::clone(&checking);
            let handle = std::thread::Builder::new()
                .name(format!("split-check-{i}"))
                .spawn(move || {
                    while let Ok(region_id) = rx.recv() {
                        if let Err(e) = split_check(&engine, region_id) {
                            tracing::warn!(region = region_id, error = %e, "split check failed");
                        }
                        checking.lock().remove(&region_id);
                    }
                })
                .expect("spawn split-check worker");
            senders.push(tx);
            handles.push(handle);
        }
        Self {
            engine,
            workers: SplitCheckWorkers {
                senders,
                handles,
                next: AtomicUsize::new(0),
            },
            checking,
        }
    }

    /// One periodic tick: dispatch scan checks for every eligible region.
    /// Returns how many scans were dispatched.
    pub fn pre_split_check(&self) -> usize {
        let options = &self.engine.services().options;
        if options.cluster_read_only() {
            tracing::info!("cluster read-only, suspending split checks");
            return 0;
        }
        if !options.enable_auto_split() {
            return 0;
        }

        let approximate_floor = self.engine.services().config.split.check_approximate_size;
        let mut dispatched = 0;
        for region in self.engine.registry().alive_regions() {
            let region_id = region.id();
            let mut reason = "";
            let eligible = loop {
                if !region.supports_split() {
                    reason = "engine kind does not split";
                    break false;
                }
                if region.state() != RegionState::Normal {
                    reason = "region state not normal";
                    break false;
                }
                if region.disable_change() {
                    reason = "region disable split";
                    break false;
                }
                if region.temporary_disable_change() {
                    reason = "region temporary disable change";
                    break false;
                }
                if self.checking.lock().contains(&region_id) {
                    reason = "split check already running";
                    break false;
                }
                if !leader_for_split(&self.engine, region_id) {
                    reason = "not leader";
                    break false;
                }
                if region.store_engine() == StoreEngineKind::Mono
                    && !options.enable_split_and_merge_for_lite()
                {
                    reason = "mono store region disable split";
                    break false;
                }
                let size = self.approximate_size(region_id);
                if size < approximate_floor {
                    reason = "region approximate size too small";
                    break false;
                }
                if kite_index::running_build_tasks() > VECTOR_BUILD_TASK_GATE {
                    reason = "too many running vector index tasks";
                    break false;
                }
                break true;
            };

            tracing::debug!(region = region_id, eligible, reason, "presplit check");
            if !eligible {
                continue;
            }
            self.checking.lock().insert(region_id);
            let slot = self.workers.next.fetch_add(1, Ordering::Relaxed)
                % self.workers.senders.len();
            if self.workers.senders[slot].send(region_id).is_err() {
                self.checking.lock().remove(&region_id);
                continue;
            }
            dispatched += 1;
        }
        dispatched
    }

    fn approximate_size(&self, region_id: RegionId) -> u64 {
        let metric = self.engine.metrics(region_id);
        if metric.region_size > 0 {
            return metric.region_size;
        }
        self.engine.approximate_region_size(region_id).unwrap_or(0)
    }

    /// Block until dispatched checks have drained (tests).
    pub fn wait_idle(&self) {
        while !self.checking.lock().is_empty() {
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
    }

    pub fn shutdown(mut self) {
        self.workers.senders.clear();
        for handle in self.workers.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kite_common::types::KeyRange;
    use kite_mvcc::reader::encode_versioned_put;
    use kite_storage::engine::RawEngine;
    use kite_storage::MemoryEngine;

    fn seeded_snapshot(keys: usize, value_size: usize) -> Arc<dyn EngineSnapshot> {
        let engine = MemoryEngine::new();
        let value = vec![b'x'; value_size];
        for i in 0..keys {
            let key = format!("key-{i:06}");
            let (k, v) = encode_versioned_put(NS_RAW, key.as_bytes(), 5, &value);
            engine.put(CF_DEFAULT, &k, &v).unwrap();
        }
        engine.snapshot()
    }

    fn scan_with(checker: &dyn SplitChecker, snapshot: Arc<dyn EngineSnapshot>) -> SplitScan {
        let range = KeyRange::new(b"key-".to_vec(), b"".to_vec());
        let (cfs, lower, upper) = select_scan_target(&snapshot, &range).unwrap();
        let mut merged = MergedIterator::new(snapshot, &cfs, &upper).unwrap();
        checker.split_key(&mut merged, &lower)
    }

    #[test]
    fn test_half_policy_below_threshold_is_quiet() {
        let checker = HalfSplitChecker {
            threshold_size: 1 << 20,
            chunk_size: 1024,
        };
        let scan = scan_with(&checker, seeded_snapshot(100, 100));
        assert!(scan.split_key.is_none());
        assert_eq!(scan.key_count, 100);
    }

    #[test]
    fn test_half_policy_splits_near_middle() {
        // 1000 keys x ~1 KiB with a 512 KiB threshold: twice the threshold.
        let checker = HalfSplitChecker {
            threshold_size: 512 * 1024,
            chunk_size: 16 * 1024,
        };
        let scan = scan_with(&checker, seeded_snapshot(1000, 1024));
        let split_key = scan.split_key.expect("split expected");
        let plain = plain_of(&split_key);
        let text = String::from_utf8_lossy(&plain).to_string();
        let index: usize = text.trim_start_matches("key-").parse().unwrap();
        assert!(
            (350..=650).contains(&index),
            "split at {index}, not near the middle"
        );
    }

    #[test]
    fn test_size_policy_splits_at_ratio() {
        let checker = SizeSplitChecker {
            threshold_size: 100 * 1024,
            ratio: 0.5,
        };
        let scan = scan_with(&checker, seeded_snapshot(200, 1024));
        let plain = plain_of(&scan.split_key.expect("split expected"));
        let text = String::from_utf8_lossy(&plain).to_string();
        let index: usize = text.trim_start_matches("key-").parse().unwrap();
        // ~200 KiB total, ratio 0.5 of the 100 KiB threshold is ~50 KiB in.
        assert!((30..=70).contains(&index), "split at {index}");
    }

    #[test]
    fn test_keys_policy_counts_distinct_plain_keys() {
        let engine = MemoryEngine::new();
        // 100 plain keys, two versions each.
        for i in 0..100 {
            let key = format!("key-{i:06}");
            for ts in [5u64, 9] {
                let (k, v) = encode_versioned_put(NS_RAW, key.as_bytes(), ts, b"v");
                engine.put(CF_DEFAULT, &k, &v).unwrap();
            }
        }
        let checker = KeysSplitChecker {
            keys_number: 100,
            ratio: 0.5,
        };
        let scan = scan_with(&checker, engine.snapshot());
        assert_eq!(scan.key_count, 100);
        let plain = plain_of(&scan.split_key.expect("split expected"));
        let text = String::from_utf8_lossy(&plain).to_string();
        let index: usize = text.trim_start_matches("key-").parse().unwrap();
        assert!((45..=55).contains(&index), "split at {index}");
    }

    #[test]
    fn test_keys_policy_below_number_is_quiet() {
        let checker = KeysSplitChecker {
            keys_number: 1000,
            ratio: 0.5,
        };
        let scan = scan_with(&checker, seeded_snapshot(100, 16));
        assert!(scan.split_key.is_none());
    }
}
