//! Merged iterator: a min-heap over per-CF cursors that views several
//! column families as one stream ordered by storage key.
//!
//! Split-check consumes this to measure a region's physical footprint across
//! all its families in a single pass. Each element carries the key, the
//! value size and the index of the cursor it came from; advancing pops the
//! minimum and refills from that cursor.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;

use kite_common::error::RawError;

use crate::engine::{EngineIterator, EngineSnapshot, IteratorOptions};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Entry {
    key: Vec<u8>,
    value_size: usize,
    iter_pos: usize,
}

/// Min-heap composition of per-CF iterators. The snapshot handle is held for
/// the iterator's lifetime so every cursor reads the same view.
pub struct MergedIterator {
    _snapshot: Arc<dyn EngineSnapshot>,
    iters: Vec<Box<dyn EngineIterator>>,
    heap: BinaryHeap<Reverse<Entry>>,
}

impl MergedIterator {
    /// Open one cursor per CF, all bounded above by `end_key`.
    pub fn new(
        snapshot: Arc<dyn EngineSnapshot>,
        cf_names: &[String],
        end_key: &[u8],
    ) -> Result<Self, RawError> {
        let mut iters = Vec::with_capacity(cf_names.len());
        for cf in cf_names {
            iters.push(snapshot.iter(cf, IteratorOptions::upper(end_key.to_vec()))?);
        }
        Ok(Self {
            _snapshot: snapshot,
            iters,
            heap: BinaryHeap::new(),
        })
    }

    pub fn seek(&mut self, target: &[u8]) {
        self.heap.clear();
        for pos in 0..self.iters.len() {
            self.iters[pos].seek(target);
            self.refill(pos);
        }
    }

    pub fn valid(&self) -> bool {
        !self.heap.is_empty()
    }

    pub fn next(&mut self) {
        let Some(Reverse(entry)) = self.heap.pop() else {
            return;
        };
        self.refill(entry.iter_pos);
    }

    pub fn key(&self) -> &[u8] {
        self.heap
            .peek()
            .map(|Reverse(e)| e.key.as_slice())
            .unwrap_or(&[])
    }

    /// Combined key + value footprint of the current entry.
    pub fn key_value_size(&self) -> usize {
        self.heap
            .peek()
            .map(|Reverse(e)| e.key.len() + e.value_size)
            .unwrap_or(0)
    }

    fn refill(&mut self, pos: usize) {
        let iter = &mut self.iters[pos];
        if iter.valid() {
            self.heap.push(Reverse(Entry {
                key: iter.key().to_vec(),
                value_size: iter.value().len(),
                iter_pos: pos,
            }));
            iter.next();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{RawEngine, CF_DATA, CF_DEFAULT, CF_WRITE};
    use crate::memory::MemoryEngine;

    fn drain(merged: &mut MergedIterator) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while merged.valid() {
            out.push(merged.key().to_vec());
            merged.next();
        }
        out
    }

    #[test]
    fn test_merged_output_is_sorted_multiset_union() {
        let engine = MemoryEngine::new();
        engine.put(CF_DEFAULT, b"a", b"1").unwrap();
        engine.put(CF_DEFAULT, b"d", b"1").unwrap();
        engine.put(CF_DATA, b"b", b"22").unwrap();
        engine.put(CF_DATA, b"d", b"22").unwrap();
        engine.put(CF_WRITE, b"c", b"333").unwrap();

        let cfs = vec![
            CF_DEFAULT.to_string(),
            CF_DATA.to_string(),
            CF_WRITE.to_string(),
        ];
        let mut merged = MergedIterator::new(engine.snapshot(), &cfs, b"").unwrap();
        merged.seek(b"");

        let keys = drain(&mut merged);
        // "d" appears twice: once per CF that holds it.
        assert_eq!(
            keys,
            vec![
                b"a".to_vec(),
                b"b".to_vec(),
                b"c".to_vec(),
                b"d".to_vec(),
                b"d".to_vec(),
            ]
        );
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn test_merged_respects_upper_bound_and_seek() {
        let engine = MemoryEngine::new();
        for key in [b"a", b"b", b"c", b"d"] {
            engine.put(CF_DEFAULT, key, b"v").unwrap();
        }
        let cfs = vec![CF_DEFAULT.to_string()];
        let mut merged = MergedIterator::new(engine.snapshot(), &cfs, b"d").unwrap();
        merged.seek(b"b");
        assert_eq!(drain(&mut merged), vec![b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn test_merged_key_value_size() {
        let engine = MemoryEngine::new();
        engine.put(CF_DEFAULT, b"ab", b"xyz").unwrap();
        let cfs = vec![CF_DEFAULT.to_string()];
        let mut merged = MergedIterator::new(engine.snapshot(), &cfs, b"").unwrap();
        merged.seek(b"");
        assert_eq!(merged.key_value_size(), 5);
    }
}
