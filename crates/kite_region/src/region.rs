//! Region metadata and state.
//!
//! A region owns a contiguous plain-key range and is the unit of
//! replication and split. Metadata is persisted in the `meta` column family
//! under `rm_{id}` (definition + state) and `ra_{id}` (applied log index).
//!
//! `temporary_disable_change` has single set/clear ownership: the
//! split-check task sets it when a split request is admitted by the
//! coordinator, and the split application (or its explicit rejection)
//! clears it. No other site mutates the flag.

use std::sync::atomic::{AtomicBool, Ordering};

use kite_common::error::RawError;
use kite_common::types::{KeyRange, RegionId};
use kite_index::VectorIndexParams;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a region replica on this store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegionState {
    New,
    Normal,
    Standby,
    Splitting,
    Merging,
    Tombstone,
    Orphan,
}

impl std::fmt::Display for RegionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RegionState::New => "NEW",
            RegionState::Normal => "NORMAL",
            RegionState::Standby => "STANDBY",
            RegionState::Splitting => "SPLITTING",
            RegionState::Merging => "MERGING",
            RegionState::Tombstone => "TOMBSTONE",
            RegionState::Orphan => "ORPHAN",
        };
        f.write_str(name)
    }
}

/// Which sorted-key engine backs the region's data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RawEngineKind {
    /// Production disk engine, bound externally.
    Rocks,
    Memory,
}

/// How writes reach the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreEngineKind {
    /// Consensus-replicated: propose, wait for apply.
    Raft,
    /// Single-node durable store, writes applied directly.
    Mono,
    /// No persistence; tests and caches.
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RegionEpoch {
    pub conf_version: u64,
    pub version: u64,
}

/// Static definition handed out by the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionDefinition {
    pub id: RegionId,
    pub epoch: RegionEpoch,
    pub range: KeyRange,
    /// Peer store endpoints, leader included.
    pub peers: Vec<String>,
    pub raw_engine: RawEngineKind,
    pub store_engine: StoreEngineKind,
    pub vector_params: Option<VectorIndexParams>,
    pub document_index: bool,
}

impl RegionDefinition {
    pub fn kv(id: RegionId, range: KeyRange, store_engine: StoreEngineKind) -> Self {
        Self {
            id,
            epoch: RegionEpoch {
                conf_version: 1,
                version: 1,
            },
            range,
            peers: Vec::new(),
            raw_engine: RawEngineKind::Memory,
            store_engine,
            vector_params: None,
            document_index: false,
        }
    }
}

/// Persisted image of a region: definition plus state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionMeta {
    pub definition: RegionDefinition,
    pub state: RegionState,
}

/// Live region object. State transitions go through the definition lock;
/// only the leader mutates.
pub struct Region {
    definition: RwLock<RegionDefinition>,
    state: RwLock<RegionState>,
    disable_change: AtomicBool,
    temporary_disable_change: AtomicBool,
}

impl Region {
    pub fn new(definition: RegionDefinition, state: RegionState) -> Self {
        Self {
            definition: RwLock::new(definition),
            state: RwLock::new(state),
            disable_change: AtomicBool::new(false),
            temporary_disable_change: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> RegionId {
        self.definition.read().id
    }

    pub fn epoch(&self) -> RegionEpoch {
        self.definition.read().epoch
    }

    pub fn range(&self) -> KeyRange {
        self.definition.read().range.clone()
    }

    pub fn definition(&self) -> RegionDefinition {
        self.definition.read().clone()
    }

    pub fn store_engine(&self) -> StoreEngineKind {
        self.definition.read().store_engine
    }

    pub fn raw_engine(&self) -> RawEngineKind {
        self.definition.read().raw_engine
    }

    pub fn state(&self) -> RegionState {
        *self.state.read()
    }

    pub fn set_state(&self, next: RegionState) {
        let mut state = self.state.write();
        tracing::info!(region = self.id(), from = %*state, to = %next, "region state change");
        *state = next;
    }

    pub fn check_key_in_range(&self, plain_key: &[u8]) -> bool {
        self.definition.read().range.contains(plain_key)
    }

    /// Shrink to `[start, split_key)` and bump the epoch version; the split
    /// sibling takes the upper half.
    pub fn apply_range_split(&self, split_key: &[u8]) {
        let mut definition = self.definition.write();
        definition.range.end_key = split_key.to_vec();
        definition.epoch.version += 1;
    }

    pub fn disable_change(&self) -> bool {
        self.disable_change.load(Ordering::Acquire)
    }

    pub fn set_disable_change(&self, v: bool) {
        self.disable_change.store(v, Ordering::Release);
    }

    pub fn temporary_disable_change(&self) -> bool {
        self.temporary_disable_change.load(Ordering::Acquire)
    }

    /// Set by the split-check task once a split is admitted.
    pub fn set_temporary_disable_change(&self) {
        self.temporary_disable_change.store(true, Ordering::Release);
    }

    /// Cleared by the split application or its rejection.
    pub fn clear_temporary_disable_change(&self) {
        self.temporary_disable_change.store(false, Ordering::Release);
    }

    pub fn meta(&self) -> RegionMeta {
        RegionMeta {
            definition: self.definition(),
            state: self.state(),
        }
    }

    /// Whether this replica participates in split/merge at all.
    pub fn supports_split(&self) -> bool {
        !matches!(
            self.store_engine(),
            StoreEngineKind::Memory
        )
    }
}

/// Meta-CF key of the persisted region meta.
pub fn region_meta_key(region_id: RegionId) -> Vec<u8> {
    let mut key = b"rm_".to_vec();
    key.extend_from_slice(&region_id.to_be_bytes());
    key
}

/// Meta-CF key of the persisted applied index.
pub fn applied_index_key(region_id: RegionId) -> Vec<u8> {
    let mut key = b"ra_".to_vec();
    key.extend_from_slice(&region_id.to_be_bytes());
    key
}

pub fn encode_region_meta(meta: &RegionMeta) -> Result<Vec<u8>, RawError> {
    bincode::serialize(meta).map_err(|e| RawError::Codec(e.to_string()))
}

pub fn decode_region_meta(raw: &[u8]) -> Result<RegionMeta, RawError> {
    bincode::deserialize(raw).map_err(|e| RawError::Codec(e.to_string()))
}
