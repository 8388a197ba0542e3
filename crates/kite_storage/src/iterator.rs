//! Range-aware iteration helpers.
//!
//! The engine honors half-open `[lower, upper)` bounds natively; the public
//! [`KeyRange`] type additionally carries inclusive bits, which are enforced
//! here on top of the engine bounds.

use kite_common::error::RawError;
use kite_common::types::KeyRange;

use crate::engine::{EngineIterator, EngineSnapshot, IteratorOptions};

/// Smallest key strictly greater than every key with `key` as prefix start:
/// `key || 0x00`.
pub fn next_key(key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + 1);
    out.extend_from_slice(key);
    out.push(0);
    out
}

/// Translate a [`KeyRange`] into engine iterator options.
///
/// The inclusive-end bit widens the engine's exclusive upper bound by one
/// key; the exclusive-start bit is enforced by [`RangeIter`].
pub fn to_iter_options(range: &KeyRange) -> IteratorOptions {
    let upper_bound = if range.is_unbounded_above() {
        Vec::new()
    } else if range.with_end {
        next_key(&range.end_key)
    } else {
        range.end_key.clone()
    };
    IteratorOptions {
        lower_bound: range.start_key.clone(),
        upper_bound,
        prefix_mode: false,
    }
}

/// Iterator over a [`KeyRange`], with both inclusive bits enforced.
pub struct RangeIter {
    inner: Box<dyn EngineIterator>,
}

impl std::fmt::Debug for RangeIter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangeIter").finish_non_exhaustive()
    }
}

impl RangeIter {
    pub fn new(
        snapshot: &dyn EngineSnapshot,
        cf: &str,
        range: &KeyRange,
    ) -> Result<Self, RawError> {
        if !range.is_valid() {
            return Err(RawError::RangeEmptyOrInverted);
        }
        let mut inner = snapshot.iter(cf, to_iter_options(range))?;
        inner.seek(&range.start_key);
        if !range.with_start && inner.valid() && inner.key() == range.start_key.as_slice() {
            inner.next();
        }
        Ok(Self { inner })
    }

    pub fn valid(&self) -> bool {
        self.inner.valid()
    }

    pub fn key(&self) -> &[u8] {
        self.inner.key()
    }

    pub fn value(&self) -> &[u8] {
        self.inner.value()
    }

    pub fn next(&mut self) {
        self.inner.next();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{RawEngine, CF_DEFAULT};
    use crate::memory::MemoryEngine;

    fn engine_with(keys: &[&[u8]]) -> MemoryEngine {
        let engine = MemoryEngine::new();
        for key in keys {
            engine.put(CF_DEFAULT, key, b"v").unwrap();
        }
        engine
    }

    fn collect(engine: &MemoryEngine, range: &KeyRange) -> Vec<Vec<u8>> {
        let snapshot = engine.snapshot();
        let mut iter = RangeIter::new(snapshot.as_ref(), CF_DEFAULT, range).unwrap();
        let mut out = Vec::new();
        while iter.valid() {
            out.push(iter.key().to_vec());
            iter.next();
        }
        out
    }

    #[test]
    fn test_half_open_range() {
        let engine = engine_with(&[b"a", b"b", b"c"]);
        let keys = collect(&engine, &KeyRange::new(b"a".to_vec(), b"c".to_vec()));
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn test_exclusive_start() {
        let engine = engine_with(&[b"a", b"b", b"c"]);
        let mut range = KeyRange::new(b"a".to_vec(), b"c".to_vec());
        range.with_start = false;
        assert_eq!(collect(&engine, &range), vec![b"b".to_vec()]);
    }

    #[test]
    fn test_inclusive_end() {
        let engine = engine_with(&[b"a", b"b", b"c"]);
        let mut range = KeyRange::new(b"a".to_vec(), b"c".to_vec());
        range.with_end = true;
        assert_eq!(
            collect(&engine, &range),
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]
        );
    }

    #[test]
    fn test_inverted_range_rejected() {
        let engine = engine_with(&[b"a"]);
        let snapshot = engine.snapshot();
        let err = RangeIter::new(
            snapshot.as_ref(),
            CF_DEFAULT,
            &KeyRange::new(b"z".to_vec(), b"a".to_vec()),
        )
        .unwrap_err();
        assert!(matches!(err, RawError::RangeEmptyOrInverted));
    }

    #[test]
    fn test_next_key_orders_directly_after() {
        assert_eq!(next_key(b"ab"), b"ab\0".to_vec());
        assert!(next_key(b"ab").as_slice() > b"ab".as_slice());
        assert!(next_key(b"ab").as_slice() < b"ac".as_slice());
    }
}
