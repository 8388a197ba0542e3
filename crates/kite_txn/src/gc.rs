//! MVCC garbage collection at a safe point.
//!
//! For every key, the newest committed Put at or below the safe point is
//! retained; everything older (superseded Puts and their payloads, Delete
//! records, rollback markers, Lock records) is reclaimed. Locks are never
//! force-resolved here; stale locks go through the scan/resolve cycle.
//!
//! A failure on one key is logged and does not stop the sweep.

use kite_common::error::KiteResult;
use kite_common::txn::{WriteKind, WriteRecord};
use kite_common::types::{hex, KeyRange, Ts};
use kite_mvcc::codec::{decode_key, encode_key, encode_range, NS_TXN};
use kite_storage::engine::{EngineIterator, IteratorOptions, WriteBatch, CF_DATA, CF_WRITE};

use crate::engine::TxnEngine;

/// Deletes are flushed in chunks of this many ops.
const GC_BATCH_LIMIT: usize = 512;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcResult {
    pub keys_scanned: u64,
    pub records_deleted: u64,
    pub payloads_deleted: u64,
}

impl TxnEngine {
    /// Sweep `range` reclaiming versions committed at or before
    /// `safe_point_ts`.
    pub fn gc(&self, safe_point_ts: Ts, range: &KeyRange) -> KiteResult<GcResult> {
        let snapshot = self.raw_engine().snapshot();
        let (enc_start, enc_end) = encode_range(NS_TXN, range);
        let mut iter = snapshot.iter(CF_WRITE, IteratorOptions::upper(enc_end))?;
        iter.seek(&enc_start);

        let mut result = GcResult::default();
        let mut batch = WriteBatch::new();
        let mut current_key: Option<Vec<u8>> = None;
        // Whether the newest real version (Put/Delete) at or below the safe
        // point has been decided for the current key.
        let mut decided = false;

        while iter.valid() {
            let (plain, commit_ts, record) = match decode_row(iter.key(), iter.value()) {
                Ok(row) => row,
                Err(detail) => {
                    tracing::error!(
                        key = %hex(iter.key()),
                        detail,
                        "gc skipping undecodable row"
                    );
                    iter.next();
                    continue;
                }
            };

            if current_key.as_deref() != Some(plain.as_slice()) {
                current_key = Some(plain.clone());
                decided = false;
                result.keys_scanned += 1;
            }

            if commit_ts > safe_point_ts {
                iter.next();
                continue;
            }

            match record.kind {
                // Markers below the safe point are always removable and
                // never count as "the retained version".
                WriteKind::Rollback | WriteKind::Lock => {
                    batch.delete(CF_WRITE, encode_key(NS_TXN, &plain, commit_ts));
                    result.records_deleted += 1;
                }
                WriteKind::Put if !decided => {
                    decided = true;
                }
                WriteKind::Delete if !decided => {
                    // Nothing is visible at or below the horizon; the
                    // tombstone itself goes too.
                    decided = true;
                    batch.delete(CF_WRITE, encode_key(NS_TXN, &plain, commit_ts));
                    result.records_deleted += 1;
                }
                WriteKind::Put => {
                    batch.delete(CF_WRITE, encode_key(NS_TXN, &plain, commit_ts));
                    result.records_deleted += 1;
                    if record.short_value.is_none() {
                        batch.delete(CF_DATA, encode_key(NS_TXN, &plain, record.start_ts));
                        result.payloads_deleted += 1;
                    }
                }
                WriteKind::Delete => {
                    batch.delete(CF_WRITE, encode_key(NS_TXN, &plain, commit_ts));
                    result.records_deleted += 1;
                }
            }

            if batch.len() >= GC_BATCH_LIMIT {
                self.flush_gc_batch(&mut batch);
            }
            iter.next();
        }
        self.flush_gc_batch(&mut batch);

        tracing::info!(
            safe_point_ts,
            keys = result.keys_scanned,
            records = result.records_deleted,
            payloads = result.payloads_deleted,
            "gc sweep finished"
        );
        Ok(result)
    }

    fn flush_gc_batch(&self, batch: &mut WriteBatch) {
        if batch.is_empty() {
            return;
        }
        let pending = std::mem::take(batch);
        if let Err(e) = self.submit_batch(pending) {
            // Reclamation is best-effort; the next sweep retries.
            tracing::error!(error = %e, "gc batch write failed");
        }
    }
}

fn decode_row(key: &[u8], value: &[u8]) -> Result<(Vec<u8>, Ts, WriteRecord), String> {
    let (_, plain, commit_ts) = decode_key(key).map_err(|e| e.to_string())?;
    let record = WriteRecord::decode(value).ok_or("undecodable write record")?;
    Ok((plain, commit_ts, record))
}
