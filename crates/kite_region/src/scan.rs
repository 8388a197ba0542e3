//! Scan sessions: multi-RPC range reads parked on a snapshot.
//!
//! `scan_begin` registers a session keyed by scan id and returns the first
//! batch; `scan_continue` advances from the recorded position over the same
//! snapshot; `scan_release` tears the session down and is idempotent.
//! Sessions never hold engine locks between calls and expire after a
//! server-side idle TTL.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use kite_common::config::ScanConfig;
use kite_common::error::{KiteResult, RawError};
use kite_common::types::{KeyRange, KeyValue, RegionId, Ts, MAX_TS};
use kite_mvcc::codec::NS_RAW;
use kite_mvcc::reader::MvccReader;
use kite_storage::engine::{EngineSnapshot, CF_DEFAULT};
use kite_storage::iterator::next_key;
use parking_lot::Mutex;

struct SessionCursor {
    next_start: Vec<u8>,
    done: bool,
    last_access: Instant,
}

struct ScanSession {
    region_id: RegionId,
    snapshot: Arc<dyn EngineSnapshot>,
    ts: Ts,
    end_key: Vec<u8>,
    cursor: Mutex<SessionCursor>,
}

/// Session table for one store.
pub struct ScanManager {
    sessions: DashMap<u64, Arc<ScanSession>>,
    next_id: AtomicU64,
    config: ScanConfig,
}

impl ScanManager {
    pub fn new(config: ScanConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            next_id: AtomicU64::new(0),
            config,
        }
    }

    /// Open a session over `snapshot` and return `(scan_id, batch, done)`.
    pub fn begin(
        &self,
        region_id: RegionId,
        snapshot: Arc<dyn EngineSnapshot>,
        range: KeyRange,
        batch_size: usize,
    ) -> KiteResult<(u64, Vec<KeyValue>, bool)> {
        if !range.is_valid() {
            return Err(RawError::RangeEmptyOrInverted.into());
        }
        self.expire_idle();

        let scan_id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let session = Arc::new(ScanSession {
            region_id,
            snapshot,
            ts: MAX_TS,
            end_key: range.end_key.clone(),
            cursor: Mutex::new(SessionCursor {
                next_start: range.start_key.clone(),
                done: false,
                last_access: Instant::now(),
            }),
        });

        let batch = fetch(&session, self.effective_batch(batch_size))?;
        let done = session.cursor.lock().done;
        if done {
            // Exhausted in one shot; nothing to park.
            return Ok((scan_id, batch, true));
        }
        self.sessions.insert(scan_id, session);
        Ok((scan_id, batch, false))
    }

    /// Fetch the next batch of an open session.
    pub fn continue_batch(
        &self,
        scan_id: u64,
        max_fetch: usize,
    ) -> KiteResult<(Vec<KeyValue>, bool)> {
        let session = self
            .sessions
            .get(&scan_id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| {
                RawError::IllegalParameters(format!("scan {scan_id} not found or expired"))
            })?;
        let batch = fetch(&session, self.effective_batch(max_fetch))?;
        let done = session.cursor.lock().done;
        if done {
            self.sessions.remove(&scan_id);
        }
        Ok((batch, done))
    }

    /// Tear a session down. Unknown ids are fine (idempotent release).
    pub fn release(&self, scan_id: u64) {
        self.sessions.remove(&scan_id);
    }

    /// Drop sessions idle past the TTL.
    pub fn expire_idle(&self) {
        let ttl = Duration::from_millis(self.config.session_ttl_ms);
        let mut expired = Vec::new();
        for entry in self.sessions.iter() {
            if entry.value().cursor.lock().last_access.elapsed() > ttl {
                expired.push(*entry.key());
            }
        }
        for scan_id in expired {
            if let Some((_, session)) = self.sessions.remove(&scan_id) {
                tracing::debug!(
                    scan_id,
                    region = session.region_id,
                    "scan session expired"
                );
            }
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn effective_batch(&self, requested: usize) -> usize {
        if requested == 0 {
            self.config.default_batch_size
        } else {
            requested
        }
    }
}

fn fetch(session: &ScanSession, max_fetch: usize) -> KiteResult<Vec<KeyValue>> {
    let mut cursor = session.cursor.lock();
    cursor.last_access = Instant::now();
    if cursor.done {
        return Ok(Vec::new());
    }

    let range = KeyRange::new(cursor.next_start.clone(), session.end_key.clone());
    let reader = MvccReader::new(Arc::clone(&session.snapshot), NS_RAW);
    let rows = reader.kv_scan(CF_DEFAULT, session.ts, &range, max_fetch)?;

    match rows.last() {
        Some(last) if rows.len() >= max_fetch => {
            cursor.next_start = next_key(&last.key);
        }
        _ => {
            cursor.done = true;
        }
    }
    Ok(rows)
}
