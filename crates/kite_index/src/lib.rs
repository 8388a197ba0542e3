//! Vector and document index coordination.
//!
//! The ANN libraries themselves are external collaborators; this crate owns
//! everything around them: MVCC-consistent auxiliary storage (payloads,
//! scalar fields, selective "speedup" columns, table rows), scalar pre- and
//! post-filtering, rebuilds, and the build-task gauge that split-check
//! consults.

pub mod document;
pub mod vector;

pub use document::{DocumentIndexWrapper, DocumentWithData, ScoredDoc};
pub use vector::{
    build_index, running_build_tasks, FlatIndex, ScoredVector, VectorDistance, VectorFilter,
    VectorIndex, VectorIndexKind, VectorIndexParams, VectorIndexWrapper, VectorWithData,
};
