//! Storage layer: the raw sorted-key engine contract the core consumes,
//! plus the in-memory reference engine and iterator utilities.
//!
//! The production deployment binds these traits to a RocksDB-class engine;
//! everything above this crate is engine-agnostic.

pub mod engine;
pub mod iterator;
pub mod memory;
pub mod merged;

pub use engine::{
    EngineIterator, EngineSnapshot, IteratorOptions, RawEngine, SstFileMeta, WriteBatch, WriteOp,
    CF_DATA, CF_DEFAULT, CF_DOCUMENT_DATA, CF_DOCUMENT_SCALAR, CF_LOCK, CF_META, CF_VECTOR_DATA,
    CF_VECTOR_SCALAR, CF_VECTOR_SCALAR_SPEEDUP, CF_VECTOR_TABLE, CF_WRITE, DEFAULT_CF_NAMES,
};
pub use memory::MemoryEngine;
pub use merged::MergedIterator;
