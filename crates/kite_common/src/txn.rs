//! Transaction wire records: locks and write records.
//!
//! A lock is a transient row in the `lock` column family keyed by the plain
//! key (not versioned); its presence blocks concurrent writers. A write
//! record is a durable row in the `write` column family keyed by
//! `(plain_key, commit_ts)` marking a terminal state for one `start_ts`.
//!
//! Lock values are bincode-encoded (variable shape: secondaries, extra
//! data). Write records use a fixed little-endian header:
//!
//! ```text
//!   [start_ts: u64]     — transaction that produced this record
//!   [kind: u8]          — 0=Put, 1=Delete, 2=Rollback, 3=Lock
//!   [has_short: u8]     — 1 if a short value follows
//!   [short_len: u32]    — length of the inlined value
//!   [short: bytes]      — the inlined value (absent when has_short == 0)
//! ```

use serde::{Deserialize, Serialize};

use crate::types::Ts;

/// Values at or under this length ride inside the lock and write records
/// instead of the `data` column family.
pub const SHORT_VALUE_LIMIT: usize = 64;

/// Kind of lock placed by prewrite or pessimistic locking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum LockType {
    Put = 0,
    Delete = 1,
    Lock = 2,
    Pessimistic = 3,
}

/// Terminal operation recorded by commit or rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum WriteKind {
    Put = 0,
    Delete = 1,
    Rollback = 2,
    Lock = 3,
}

impl WriteKind {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(WriteKind::Put),
            1 => Some(WriteKind::Delete),
            2 => Some(WriteKind::Rollback),
            3 => Some(WriteKind::Lock),
            _ => None,
        }
    }

    /// The write kind a committed lock of the given type produces.
    pub fn from_lock_type(lt: LockType) -> Self {
        match lt {
            LockType::Put => WriteKind::Put,
            LockType::Delete => WriteKind::Delete,
            // A pessimistic lock that reaches commit degenerates to Lock.
            LockType::Lock | LockType::Pessimistic => WriteKind::Lock,
        }
    }
}

/// Uncommitted lock state for one key. At most one row per key exists in the
/// `lock` column family at any moment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// The transaction's primary key; its lock decides the fate of all keys.
    pub primary_lock: Vec<u8>,
    /// The key this lock protects.
    pub key: Vec<u8>,
    pub lock_type: LockType,
    pub start_ts: Ts,
    /// 0 for optimistic transactions.
    pub for_update_ts: Ts,
    pub ttl_ms: u64,
    pub txn_size: u64,
    pub min_commit_ts: Ts,
    /// Secondary keys, recorded on the primary lock only.
    pub secondaries: Vec<Vec<u8>>,
    /// Inlined payload for values under [`SHORT_VALUE_LIMIT`].
    pub short_value: Option<Vec<u8>>,
    pub extra_data: Vec<u8>,
}

impl LockInfo {
    pub fn encode(&self) -> Vec<u8> {
        // LockInfo is plain old data; serialization cannot fail.
        bincode::serialize(self).unwrap_or_default()
    }

    pub fn decode(raw: &[u8]) -> Option<Self> {
        bincode::deserialize(raw).ok()
    }
}

/// Durable write record: value of `write[encode(key, commit_ts)]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub start_ts: Ts,
    pub kind: WriteKind,
    pub short_value: Option<Vec<u8>>,
}

/// Fixed header: start_ts (8) + kind (1) + has_short (1) + short_len (4).
const WRITE_RECORD_HEADER: usize = 14;

impl WriteRecord {
    pub fn new(start_ts: Ts, kind: WriteKind) -> Self {
        Self {
            start_ts,
            kind,
            short_value: None,
        }
    }

    pub fn with_short_value(start_ts: Ts, kind: WriteKind, short_value: Option<Vec<u8>>) -> Self {
        Self {
            start_ts,
            kind,
            short_value,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let short_len = self.short_value.as_ref().map(|v| v.len()).unwrap_or(0);
        let mut buf = Vec::with_capacity(WRITE_RECORD_HEADER + short_len);
        buf.extend_from_slice(&self.start_ts.to_le_bytes());
        buf.push(self.kind as u8);
        buf.push(if self.short_value.is_some() { 1 } else { 0 });
        buf.extend_from_slice(&(short_len as u32).to_le_bytes());
        if let Some(v) = &self.short_value {
            buf.extend_from_slice(v);
        }
        buf
    }

    pub fn decode(raw: &[u8]) -> Option<Self> {
        if raw.len() < WRITE_RECORD_HEADER {
            return None;
        }
        let start_ts = u64::from_le_bytes(raw[0..8].try_into().ok()?);
        let kind = WriteKind::from_byte(raw[8])?;
        let has_short = raw[9] == 1;
        let short_len = u32::from_le_bytes(raw[10..14].try_into().ok()?) as usize;
        if raw.len() < WRITE_RECORD_HEADER + short_len {
            return None;
        }
        let short_value = if has_short {
            Some(raw[WRITE_RECORD_HEADER..WRITE_RECORD_HEADER + short_len].to_vec())
        } else {
            None
        };
        Some(Self {
            start_ts,
            kind,
            short_value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_lock() -> LockInfo {
        LockInfo {
            primary_lock: b"pk".to_vec(),
            key: b"k1".to_vec(),
            lock_type: LockType::Put,
            start_ts: 10,
            for_update_ts: 0,
            ttl_ms: 3000,
            txn_size: 2,
            min_commit_ts: 11,
            secondaries: vec![b"k2".to_vec()],
            short_value: Some(b"v".to_vec()),
            extra_data: vec![],
        }
    }

    #[test]
    fn test_lock_info_round_trip() {
        let lock = sample_lock();
        let decoded = LockInfo::decode(&lock.encode()).unwrap();
        assert_eq!(decoded, lock);
    }

    #[test]
    fn test_write_record_round_trip() {
        let rec = WriteRecord::new(42, WriteKind::Put);
        assert_eq!(WriteRecord::decode(&rec.encode()).unwrap(), rec);

        let rec = WriteRecord::with_short_value(7, WriteKind::Delete, Some(b"short".to_vec()));
        assert_eq!(WriteRecord::decode(&rec.encode()).unwrap(), rec);
    }

    #[test]
    fn test_write_record_decode_short_buffer() {
        assert!(WriteRecord::decode(&[]).is_none());
        assert!(WriteRecord::decode(&[0u8; 13]).is_none());
    }

    #[test]
    fn test_write_kind_from_lock_type() {
        assert_eq!(WriteKind::from_lock_type(LockType::Put), WriteKind::Put);
        assert_eq!(WriteKind::from_lock_type(LockType::Delete), WriteKind::Delete);
        assert_eq!(WriteKind::from_lock_type(LockType::Pessimistic), WriteKind::Lock);
    }
}
