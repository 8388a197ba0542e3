//! The raw engine contract.
//!
//! Column families are disjoint keyspaces inside one engine instance. Batch
//! writes are atomic across families; snapshots give a consistent
//! point-in-time view; iterators hold counted references to their snapshot
//! so the snapshot outlives every open cursor.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use kite_common::error::RawError;

/// Raw (non-transactional) KV payloads.
pub const CF_DEFAULT: &str = "default";
/// MVCC payloads of transactional rows.
pub const CF_DATA: &str = "data";
/// Uncommitted locks, keyed by plain key (not versioned).
pub const CF_LOCK: &str = "lock";
/// Write records, keyed by `(plain_key, commit_ts)`.
pub const CF_WRITE: &str = "write";
/// Region metadata and raft state.
pub const CF_META: &str = "meta";
pub const CF_VECTOR_DATA: &str = "vector_data";
pub const CF_VECTOR_SCALAR: &str = "vector_scalar";
pub const CF_VECTOR_SCALAR_SPEEDUP: &str = "vector_scalar_speedup";
pub const CF_VECTOR_TABLE: &str = "vector_table";
pub const CF_DOCUMENT_DATA: &str = "document_data";
pub const CF_DOCUMENT_SCALAR: &str = "document_scalar";

/// The full static CF list applied at engine init.
pub const DEFAULT_CF_NAMES: &[&str] = &[
    CF_DEFAULT,
    CF_DATA,
    CF_LOCK,
    CF_WRITE,
    CF_META,
    CF_VECTOR_DATA,
    CF_VECTOR_SCALAR,
    CF_VECTOR_SCALAR_SPEEDUP,
    CF_VECTOR_TABLE,
    CF_DOCUMENT_DATA,
    CF_DOCUMENT_SCALAR,
];

/// Iterator construction options. Empty bounds mean unbounded.
#[derive(Debug, Clone, Default)]
pub struct IteratorOptions {
    pub lower_bound: Vec<u8>,
    pub upper_bound: Vec<u8>,
    /// Stop iteration once keys no longer share the seek target's prefix.
    pub prefix_mode: bool,
}

impl IteratorOptions {
    pub fn bounded(lower: impl Into<Vec<u8>>, upper: impl Into<Vec<u8>>) -> Self {
        Self {
            lower_bound: lower.into(),
            upper_bound: upper.into(),
            prefix_mode: false,
        }
    }

    pub fn upper(upper: impl Into<Vec<u8>>) -> Self {
        Self {
            lower_bound: Vec::new(),
            upper_bound: upper.into(),
            prefix_mode: false,
        }
    }
}

/// One mutation inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum WriteOp {
    Put {
        cf: String,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        cf: String,
        key: Vec<u8>,
    },
    DeleteRange {
        cf: String,
        start_key: Vec<u8>,
        end_key: Vec<u8>,
    },
}

impl WriteOp {
    pub fn cf(&self) -> &str {
        match self {
            WriteOp::Put { cf, .. } | WriteOp::Delete { cf, .. } | WriteOp::DeleteRange { cf, .. } => cf,
        }
    }
}

/// An ordered set of mutations applied atomically across column families.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, cf: &str, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(WriteOp::Put {
            cf: cf.to_string(),
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn delete(&mut self, cf: &str, key: impl Into<Vec<u8>>) {
        self.ops.push(WriteOp::Delete {
            cf: cf.to_string(),
            key: key.into(),
        });
    }

    pub fn delete_range(
        &mut self,
        cf: &str,
        start_key: impl Into<Vec<u8>>,
        end_key: impl Into<Vec<u8>>,
    ) {
        self.ops.push(WriteOp::DeleteRange {
            cf: cf.to_string(),
            start_key: start_key.into(),
            end_key: end_key.into(),
        });
    }

    pub fn merge(&mut self, other: WriteBatch) {
        self.ops.extend(other.ops);
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// SST file descriptor produced by `export_cf`, consumed by ingest decisions.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SstFileMeta {
    pub level: u32,
    pub name: String,
    pub path: PathBuf,
    pub smallest_key: Vec<u8>,
    pub largest_key: Vec<u8>,
}

/// A cursor over one column family in ascending byte order.
///
/// `key`/`value` are valid only while `valid()` returns true.
pub trait EngineIterator: Send {
    fn seek(&mut self, target: &[u8]);
    fn seek_for_prev(&mut self, target: &[u8]);
    fn seek_to_first(&mut self);
    fn seek_to_last(&mut self);
    fn next(&mut self);
    fn prev(&mut self);
    fn valid(&self) -> bool;
    fn key(&self) -> &[u8];
    fn value(&self) -> &[u8];
}

/// A consistent point-in-time view across all column families.
pub trait EngineSnapshot: Send + Sync {
    fn get(&self, cf: &str, key: &[u8]) -> Result<Option<Vec<u8>>, RawError>;

    /// The iterator owns a counted reference to this snapshot's data; the
    /// snapshot stays readable until the last cursor drops.
    fn iter(&self, cf: &str, opts: IteratorOptions) -> Result<Box<dyn EngineIterator>, RawError>;
}

/// The sorted-key engine surface the core consumes.
pub trait RawEngine: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn cf_names(&self) -> Vec<String>;

    fn get(&self, cf: &str, key: &[u8]) -> Result<Option<Vec<u8>>, RawError>;

    fn multi_get(&self, cf: &str, keys: &[Vec<u8>]) -> Result<Vec<Option<Vec<u8>>>, RawError>;

    fn put(&self, cf: &str, key: &[u8], value: &[u8]) -> Result<(), RawError>;

    fn delete(&self, cf: &str, key: &[u8]) -> Result<(), RawError>;

    fn delete_range(&self, cf: &str, start_key: &[u8], end_key: &[u8]) -> Result<(), RawError>;

    /// All-or-nothing across column families.
    fn write_batch(&self, batch: WriteBatch) -> Result<(), RawError>;

    /// Returns false (and writes nothing) when the key already exists.
    fn put_if_absent(&self, cf: &str, key: &[u8], value: &[u8]) -> Result<bool, RawError>;

    /// Atomically replace `expect` with `value`. `expect = None` asserts
    /// absence; `value = None` deletes. Returns whether the swap happened.
    fn compare_and_set(
        &self,
        cf: &str,
        key: &[u8],
        expect: Option<&[u8]>,
        value: Option<&[u8]>,
    ) -> Result<bool, RawError>;

    fn snapshot(&self) -> Arc<dyn EngineSnapshot>;

    /// Iterator over a fresh snapshot.
    fn iter(&self, cf: &str, opts: IteratorOptions) -> Result<Box<dyn EngineIterator>, RawError> {
        self.snapshot().iter(cf, opts)
    }

    /// Approximate on-disk size of a key range (exact for the memory engine).
    fn approximate_size(
        &self,
        cf: &str,
        start_key: &[u8],
        end_key: &[u8],
    ) -> Result<u64, RawError>;

    /// Produce a readable on-disk snapshot of every CF under `dir`.
    fn checkpoint(&self, dir: &Path) -> Result<(), RawError>;

    /// Checkpoint one CF and describe the produced files.
    fn export_cf(&self, cf: &str, dir: &Path) -> Result<Vec<SstFileMeta>, RawError>;

    /// Import externally produced files into a CF.
    fn ingest(&self, cf: &str, files: &[PathBuf]) -> Result<(), RawError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_batch_builders() {
        let mut batch = WriteBatch::new();
        batch.put(CF_DEFAULT, b"k".to_vec(), b"v".to_vec());
        batch.delete(CF_LOCK, b"k".to_vec());
        batch.delete_range(CF_WRITE, b"a".to_vec(), b"z".to_vec());
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.ops()[0].cf(), CF_DEFAULT);

        let mut other = WriteBatch::new();
        other.put(CF_DATA, b"x".to_vec(), b"y".to_vec());
        batch.merge(other);
        assert_eq!(batch.len(), 4);
    }

    #[test]
    fn test_default_cf_list_is_distinct() {
        let mut names: Vec<&str> = DEFAULT_CF_NAMES.to_vec();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), DEFAULT_CF_NAMES.len());
    }
}
