//! Transactional reads: snapshot-isolated gets and scans that honor locks.
//!
//! A read at `ts` observes every commit with `commit_ts <= ts` and nothing
//! newer. A Put/Delete lock with `start_ts <= ts` makes the outcome
//! undecided, so the read fails with `KeyIsLocked` carrying the lock for
//! client-side resolution; locks the client already resolved are passed in
//! the allowlist.

use std::sync::Arc;

use kite_common::error::{KiteResult, RawError, TxnError};
use kite_common::txn::{LockInfo, LockType};
use kite_common::types::{hex, KeyRange, KeyValue, Ts, MAX_TS};
use kite_mvcc::codec::{decode_key, encode_key, encode_plain_key, encode_range, NS_TXN};
use kite_storage::engine::{EngineIterator, EngineSnapshot, IteratorOptions, CF_LOCK, CF_WRITE};
use kite_storage::iterator::next_key;

use crate::engine::{read_committed_value, read_lock};

/// Snapshot-bound transactional reader.
pub struct TxnReader {
    snapshot: Arc<dyn EngineSnapshot>,
}

impl TxnReader {
    pub fn new(snapshot: Arc<dyn EngineSnapshot>) -> Self {
        Self { snapshot }
    }

    /// Point read at `ts`.
    pub fn txn_get(
        &self,
        ts: Ts,
        plain_key: &[u8],
        resolved_locks: &[Ts],
    ) -> KiteResult<Option<Vec<u8>>> {
        if plain_key.is_empty() {
            return Err(RawError::KeyEmpty.into());
        }
        let lock_key = encode_plain_key(NS_TXN, plain_key);
        if let Some(lock) = read_lock(self.snapshot.as_ref(), &lock_key)? {
            if blocks_read(&lock, ts, resolved_locks) {
                return Err(TxnError::KeyIsLocked { lock: Box::new(lock) }.into());
            }
        }
        read_committed_value(self.snapshot.as_ref(), plain_key, ts)
    }

    pub fn txn_batch_get(
        &self,
        ts: Ts,
        keys: &[Vec<u8>],
        resolved_locks: &[Ts],
    ) -> KiteResult<Vec<Option<Vec<u8>>>> {
        keys.iter()
            .map(|key| self.txn_get(ts, key, resolved_locks))
            .collect()
    }

    /// Range scan at `ts`. Fails with `KeyIsLocked` when any key in range
    /// holds an undecided lock at or below `ts`.
    pub fn txn_scan(
        &self,
        ts: Ts,
        range: &KeyRange,
        limit: usize,
        resolved_locks: &[Ts],
    ) -> KiteResult<Vec<KeyValue>> {
        if !range.is_valid() {
            return Err(RawError::RangeEmptyOrInverted.into());
        }
        self.check_range_locks(ts, range, resolved_locks)?;

        let (enc_start, enc_end) = encode_range(NS_TXN, range);
        let mut iter = self
            .snapshot
            .iter(CF_WRITE, IteratorOptions::upper(enc_end))?;
        iter.seek(&enc_start);

        let mut out = Vec::new();
        while iter.valid() {
            let (_, plain, _) = decode_key(iter.key())?;
            if let Some(value) = read_committed_value(self.snapshot.as_ref(), &plain, ts)? {
                out.push(KeyValue::new(plain.clone(), value));
                if limit > 0 && out.len() >= limit {
                    break;
                }
            }
            iter.seek(&encode_key(NS_TXN, &next_key(&plain), MAX_TS));
        }
        Ok(out)
    }

    /// Collect locks with `start_ts <= max_ts` in the range, oldest key
    /// first, for a separate resolve cycle. `limit = 0` means unbounded.
    pub fn txn_scan_lock(
        &self,
        max_ts: Ts,
        range: &KeyRange,
        limit: usize,
    ) -> KiteResult<Vec<LockInfo>> {
        if !range.is_valid() {
            return Err(RawError::RangeEmptyOrInverted.into());
        }
        let lower = encode_plain_key(NS_TXN, &range.start_key);
        let upper = if range.is_unbounded_above() {
            vec![NS_TXN + 1]
        } else {
            encode_plain_key(NS_TXN, &range.end_key)
        };
        let mut iter = self
            .snapshot
            .iter(CF_LOCK, IteratorOptions::bounded(lower.clone(), upper))?;
        iter.seek(&lower);

        let mut out = Vec::new();
        while iter.valid() {
            let lock = LockInfo::decode(iter.value()).ok_or_else(|| RawError::Corruption {
                key_hex: hex(iter.key()),
                detail: "undecodable lock".into(),
            })?;
            if lock.start_ts <= max_ts {
                out.push(lock);
                if limit > 0 && out.len() >= limit {
                    break;
                }
            }
            iter.next();
        }
        Ok(out)
    }

    fn check_range_locks(
        &self,
        ts: Ts,
        range: &KeyRange,
        resolved_locks: &[Ts],
    ) -> KiteResult<()> {
        for lock in self.txn_scan_lock(ts, range, 0)? {
            if blocks_read(&lock, ts, resolved_locks) {
                return Err(TxnError::KeyIsLocked { lock: Box::new(lock) }.into());
            }
        }
        Ok(())
    }
}

/// Pessimistic and Lock-type locks carry no pending value and never block
/// readers; Put/Delete locks at or below the read ts do.
fn blocks_read(lock: &LockInfo, ts: Ts, resolved_locks: &[Ts]) -> bool {
    matches!(lock.lock_type, LockType::Put | LockType::Delete)
        && lock.start_ts <= ts
        && !resolved_locks.contains(&lock.start_ts)
}
