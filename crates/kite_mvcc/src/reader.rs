//! Time-ordered reads over one MVCC column family.
//!
//! All keys in and out of this module are plain keys; encoding is internal.
//! A reader is bound to a snapshot and a namespace byte; the raw, vector and
//! document flavors differ only in that byte.

use std::sync::Arc;

use kite_common::error::{KiteError, RawError};
use kite_common::types::{hex, KeyRange, KeyValue, Ts, MAX_TS};
use kite_storage::engine::{EngineIterator, EngineSnapshot, IteratorOptions};
use kite_storage::iterator::next_key;

use crate::codec::{
    self, decode_key, encode_key, encode_range, unpack_value, ValueFlag, NS_DOCUMENT, NS_RAW,
    NS_VECTOR,
};

/// MVCC reader over one snapshot.
pub struct MvccReader {
    snapshot: Arc<dyn EngineSnapshot>,
    ns: u8,
}

impl MvccReader {
    pub fn new(snapshot: Arc<dyn EngineSnapshot>, ns: u8) -> Self {
        Self { snapshot, ns }
    }

    pub fn raw(snapshot: Arc<dyn EngineSnapshot>) -> Self {
        Self::new(snapshot, NS_RAW)
    }

    pub fn vector(snapshot: Arc<dyn EngineSnapshot>) -> Self {
        Self::new(snapshot, NS_VECTOR)
    }

    pub fn document(snapshot: Arc<dyn EngineSnapshot>) -> Self {
        Self::new(snapshot, NS_DOCUMENT)
    }

    pub fn namespace(&self) -> u8 {
        self.ns
    }

    /// Newest visible value of `plain_key` at `ts`, tombstones filtered.
    pub fn kv_get(&self, cf: &str, ts: Ts, plain_key: &[u8]) -> Result<Option<Vec<u8>>, KiteError> {
        if plain_key.is_empty() {
            return Err(RawError::KeyEmpty.into());
        }
        let seek_key = encode_key(self.ns, plain_key, ts);
        let mut iter = self.snapshot.iter(cf, IteratorOptions::default())?;
        iter.seek(&seek_key);
        if !iter.valid() {
            return Ok(None);
        }
        let (_, plain, _) = decode_row_key(iter.key())?;
        if plain != plain_key {
            return Ok(None);
        }
        let (flag, payload) = unpack_value(iter.value()).map_err(|e| corrupt(iter.key(), e))?;
        if flag == ValueFlag::Tombstone {
            return Ok(None);
        }
        Ok(Some(payload.to_vec()))
    }

    /// Scan the plain range at `ts`, newest visible version per key, in
    /// ascending key order. `limit = 0` means unbounded.
    pub fn kv_scan(
        &self,
        cf: &str,
        ts: Ts,
        range: &KeyRange,
        limit: usize,
    ) -> Result<Vec<KeyValue>, KiteError> {
        let mut out = Vec::new();
        self.kv_scan_with(cf, ts, range, |key, value| {
            out.push(KeyValue::new(key.to_vec(), value.to_vec()));
            limit == 0 || out.len() < limit
        })?;
        Ok(out)
    }

    /// Callback-driven scan; return `false` from `visit` to stop early.
    pub fn kv_scan_with(
        &self,
        cf: &str,
        ts: Ts,
        range: &KeyRange,
        mut visit: impl FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<(), KiteError> {
        if !range.is_valid() {
            return Err(RawError::RangeEmptyOrInverted.into());
        }
        let (enc_start, enc_end) = encode_range(self.ns, range);
        let mut iter = self
            .snapshot
            .iter(cf, IteratorOptions::upper(enc_end))?;
        // Entering a new plain key via MAX_TS lands on its newest version;
        // the first seek may still hit versions above the read ts, which are
        // skipped by a second seek at the requested ts.
        iter.seek(&enc_start);
        while iter.valid() {
            let (_, plain, row_ts) = decode_row_key(iter.key())?;
            if row_ts > ts {
                // All versions newer than the read ts sort first; jump to
                // the newest one at or below it.
                let target = encode_key(self.ns, &plain, ts);
                iter.seek(&target);
                if !iter.valid() {
                    break;
                }
                let (_, plain_after, _) = decode_row_key(iter.key())?;
                if plain_after != plain {
                    // No visible version of this key; the seek already moved
                    // to the next plain key's newest version.
                    continue;
                }
            }
            let (flag, payload) = unpack_value(iter.value()).map_err(|e| corrupt(iter.key(), e))?;
            let emit = flag != ValueFlag::Tombstone;
            if emit && !visit(&plain, payload) {
                return Ok(());
            }
            // Older versions of this key are never emitted.
            let skip_to = encode_key(self.ns, &next_key(&plain), MAX_TS);
            iter.seek(&skip_to);
        }
        Ok(())
    }

    /// Count of visible keys in the range at `ts`. Walks every version.
    pub fn kv_count(&self, cf: &str, ts: Ts, range: &KeyRange) -> Result<i64, KiteError> {
        let mut count = 0i64;
        self.kv_scan_with(cf, ts, range, |_, _| {
            count += 1;
            true
        })?;
        Ok(count)
    }

    /// Smallest visible plain key in the range at `ts`.
    pub fn kv_min_key(
        &self,
        cf: &str,
        ts: Ts,
        range: &KeyRange,
    ) -> Result<Option<Vec<u8>>, KiteError> {
        let mut found = None;
        self.kv_scan_with(cf, ts, range, |key, _| {
            found = Some(key.to_vec());
            false
        })?;
        Ok(found)
    }

    /// Largest visible plain key in the range at `ts`.
    ///
    /// Walks backwards per distinct key with a forward probe for the
    /// newest version at or below `ts`.
    pub fn kv_max_key(
        &self,
        cf: &str,
        ts: Ts,
        range: &KeyRange,
    ) -> Result<Option<Vec<u8>>, KiteError> {
        if !range.is_valid() {
            return Err(RawError::RangeEmptyOrInverted.into());
        }
        let (enc_start, enc_end) = encode_range(self.ns, range);
        let mut iter = self.snapshot.iter(cf, IteratorOptions::default())?;
        iter.seek_for_prev(&enc_end);
        // seek_for_prev may land exactly on the bracket end (the next plain
        // key's newest version); step back inside.
        if iter.valid() && iter.key() >= enc_end.as_slice() {
            iter.prev();
        }
        while iter.valid() && iter.key() >= enc_start.as_slice() {
            let (_, plain, _) = decode_row_key(iter.key())?;
            if self.kv_get(cf, ts, &plain)?.is_some() {
                return Ok(Some(plain));
            }
            // Step to the previous distinct plain key: everything at or
            // after this key's newest slot belongs to `plain`.
            let first_of_plain = encode_key(self.ns, &plain, MAX_TS);
            iter.seek_for_prev(&first_of_plain);
            if iter.valid() && iter.key() >= first_of_plain.as_slice() {
                iter.prev();
            }
        }
        Ok(None)
    }
}

fn decode_row_key(storage_key: &[u8]) -> Result<(u8, Vec<u8>, Ts), KiteError> {
    decode_key(storage_key).map_err(KiteError::from)
}

fn corrupt(storage_key: &[u8], source: RawError) -> KiteError {
    RawError::Corruption {
        key_hex: hex(storage_key),
        detail: source.to_string(),
    }
    .into()
}

/// Write helpers shared by the raw write path and tests: versioned puts and
/// tombstones in codec form.
pub fn encode_versioned_put(ns: u8, plain_key: &[u8], ts: Ts, value: &[u8]) -> (Vec<u8>, Vec<u8>) {
    (
        encode_key(ns, plain_key, ts),
        codec::pack_value(ValueFlag::Normal, value),
    )
}

pub fn encode_versioned_delete(ns: u8, plain_key: &[u8], ts: Ts) -> (Vec<u8>, Vec<u8>) {
    (encode_key(ns, plain_key, ts), codec::pack_tombstone())
}
