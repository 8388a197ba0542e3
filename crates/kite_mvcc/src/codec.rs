//! MVCC key and value codec.
//!
//! Storage key layout for versioned column families:
//!
//! ```text
//!   [namespace: u8] [plain_key: bytes] [big_endian(!ts): 8 bytes]
//! ```
//!
//! The bitwise-NOT suffix makes newer versions of the same plain key sort
//! *earlier*, so a forward seek at `encode(key, ts)` lands on the newest
//! version at or below `ts`. Callers provide prefix-free plain keys (the
//! serialization layer pads keys to fixed-width groups), which keeps the
//! concatenation plain-key-major across distinct keys.
//!
//! Values are packaged as `flag_byte || payload`; the codec never interprets
//! the payload.

use kite_common::error::RawError;
use kite_common::types::{hex, KeyRange, Ts, MAX_TS};

/// Namespace byte for raw (non-transactional) keys.
pub const NS_RAW: u8 = b'r';
/// Namespace byte for transactional keys (`data`/`write` families).
pub const NS_TXN: u8 = b't';
pub const NS_VECTOR: u8 = b'v';
pub const NS_DOCUMENT: u8 = b'd';

const TS_SUFFIX_LEN: usize = 8;

/// Value flag: first byte of every packed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ValueFlag {
    Normal = 0,
    /// Deletion marker; an empty payload with this flag is a tombstone.
    Tombstone = 1,
    /// Payload carries further framing after the flag byte.
    Ext = 2,
}

impl ValueFlag {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(ValueFlag::Normal),
            1 => Some(ValueFlag::Tombstone),
            2 => Some(ValueFlag::Ext),
            _ => None,
        }
    }
}

/// Encode a versioned storage key.
pub fn encode_key(ns: u8, plain_key: &[u8], ts: Ts) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + plain_key.len() + TS_SUFFIX_LEN);
    out.push(ns);
    out.extend_from_slice(plain_key);
    out.extend_from_slice(&(!ts).to_be_bytes());
    out
}

/// Encode an unversioned storage key (lock and meta families).
pub fn encode_plain_key(ns: u8, plain_key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + plain_key.len());
    out.push(ns);
    out.extend_from_slice(plain_key);
    out
}

/// Decode a versioned storage key into `(namespace, plain_key, ts)`.
pub fn decode_key(storage_key: &[u8]) -> Result<(u8, Vec<u8>, Ts), RawError> {
    if storage_key.len() < 1 + 1 + TS_SUFFIX_LEN {
        return Err(RawError::Corruption {
            key_hex: hex(storage_key),
            detail: "storage key shorter than namespace + key + ts suffix".into(),
        });
    }
    let ns = storage_key[0];
    let split = storage_key.len() - TS_SUFFIX_LEN;
    let plain = storage_key[1..split].to_vec();
    let suffix: [u8; TS_SUFFIX_LEN] = storage_key[split..]
        .try_into()
        .map_err(|_| RawError::Corruption {
            key_hex: hex(storage_key),
            detail: "bad ts suffix".into(),
        })?;
    let ts = !u64::from_be_bytes(suffix);
    if ts > MAX_TS {
        return Err(RawError::Corruption {
            key_hex: hex(storage_key),
            detail: format!("decoded ts {ts} out of range"),
        });
    }
    Ok((ns, plain, ts))
}

/// Decode an unversioned storage key into `(namespace, plain_key)`.
pub fn decode_plain_key(storage_key: &[u8]) -> Result<(u8, Vec<u8>), RawError> {
    if storage_key.len() < 2 {
        return Err(RawError::Corruption {
            key_hex: hex(storage_key),
            detail: "storage key shorter than namespace + key".into(),
        });
    }
    Ok((storage_key[0], storage_key[1..].to_vec()))
}

/// Encode a plain range into its storage bracket.
///
/// Encoding both ends with [`MAX_TS`] yields the *smallest* storage key per
/// plain key, so `[enc(start, MAX), enc(end, MAX))` brackets every version
/// of every key in `[start, end)`. An empty end key maps to the next
/// namespace byte (unbounded within the namespace).
pub fn encode_range(ns: u8, range: &KeyRange) -> (Vec<u8>, Vec<u8>) {
    let start = encode_key(ns, &range.start_key, MAX_TS);
    let end = if range.is_unbounded_above() {
        vec![ns + 1]
    } else {
        encode_key(ns, &range.end_key, MAX_TS)
    };
    (start, end)
}

/// Package a value under a flag byte.
pub fn pack_value(flag: ValueFlag, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(flag as u8);
    out.extend_from_slice(payload);
    out
}

/// A tombstone with no payload.
pub fn pack_tombstone() -> Vec<u8> {
    vec![ValueFlag::Tombstone as u8]
}

/// Split a packed value into its flag and payload.
pub fn unpack_value(raw: &[u8]) -> Result<(ValueFlag, &[u8]), RawError> {
    let Some((&flag_byte, payload)) = raw.split_first() else {
        return Err(RawError::Corruption {
            key_hex: String::new(),
            detail: "empty packed value".into(),
        });
    };
    let flag = ValueFlag::from_byte(flag_byte).ok_or_else(|| RawError::Corruption {
        key_hex: String::new(),
        detail: format!("unknown value flag {flag_byte:#04x}"),
    })?;
    Ok((flag, payload))
}
