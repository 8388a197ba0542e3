//! Core identifier and key-space types.
//!
//! Timestamps are 64-bit values composed as `(physical_ms << 18) | logical`,
//! strictly increasing across the cluster. `0` is reserved as "unset".

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Cluster-wide timestamp. `0` means "no timestamp".
pub type Ts = u64;

/// Region identifier handed out by the coordinator.
pub type RegionId = u64;

/// Number of low bits holding the logical counter of a timestamp.
pub const TS_LOGICAL_BITS: u32 = 18;

/// Largest timestamp a reader may ask for ("see everything").
pub const MAX_TS: Ts = i64::MAX as u64;

/// Compose a timestamp from a physical millisecond clock and a logical counter.
pub fn compose_ts(physical_ms: u64, logical: u64) -> Ts {
    (physical_ms << TS_LOGICAL_BITS) | (logical & ((1 << TS_LOGICAL_BITS) - 1))
}

/// Physical millisecond component of a timestamp.
pub fn ts_physical(ts: Ts) -> u64 {
    ts >> TS_LOGICAL_BITS
}

/// Logical component of a timestamp.
pub fn ts_logical(ts: Ts) -> u64 {
    ts & ((1 << TS_LOGICAL_BITS) - 1)
}

/// Wall clock in milliseconds since the epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A plain key/value pair as seen by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl KeyValue {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A byte-ordered key range. `with_start`/`with_end` carry the inclusive
/// bits; the default shape is the half-open `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub with_start: bool,
    pub with_end: bool,
}

impl KeyRange {
    /// The conventional half-open range `[start, end)`.
    pub fn new(start_key: impl Into<Vec<u8>>, end_key: impl Into<Vec<u8>>) -> Self {
        Self {
            start_key: start_key.into(),
            end_key: end_key.into(),
            with_start: true,
            with_end: false,
        }
    }

    /// An empty end key means "unbounded above".
    pub fn is_unbounded_above(&self) -> bool {
        self.end_key.is_empty()
    }

    /// A range is well formed when it is non-empty and not inverted.
    pub fn is_valid(&self) -> bool {
        if self.start_key.is_empty() && self.end_key.is_empty() {
            return false;
        }
        if self.is_unbounded_above() {
            return true;
        }
        match self.start_key.cmp(&self.end_key) {
            std::cmp::Ordering::Less => true,
            std::cmp::Ordering::Equal => self.with_start && self.with_end,
            std::cmp::Ordering::Greater => false,
        }
    }

    /// Whether `key` falls inside the range, honoring the inclusive bits.
    pub fn contains(&self, key: &[u8]) -> bool {
        let lower_ok = match key.cmp(self.start_key.as_slice()) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Equal => self.with_start,
            std::cmp::Ordering::Less => false,
        };
        if !lower_ok {
            return false;
        }
        if self.is_unbounded_above() {
            return true;
        }
        match key.cmp(self.end_key.as_slice()) {
            std::cmp::Ordering::Less => true,
            std::cmp::Ordering::Equal => self.with_end,
            std::cmp::Ordering::Greater => false,
        }
    }

    /// Whether `other` is fully covered by this range.
    pub fn covers(&self, other: &KeyRange) -> bool {
        if !other.is_valid() {
            return false;
        }
        let lower_ok = other.start_key >= self.start_key;
        let upper_ok = self.is_unbounded_above()
            || (!other.is_unbounded_above() && other.end_key <= self.end_key);
        lower_ok && upper_ok
    }
}

impl std::fmt::Display for KeyRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{}, {}{}",
            if self.with_start { "[" } else { "(" },
            hex(&self.start_key),
            hex(&self.end_key),
            if self.with_end { "]" } else { ")" },
        )
    }
}

/// Hex-encode a key for log and error messages.
pub fn hex(key: &[u8]) -> String {
    let mut out = String::with_capacity(key.len() * 2);
    for b in key {
        out.push_str(&format!("{b:02x}"));
    }
    out
}
