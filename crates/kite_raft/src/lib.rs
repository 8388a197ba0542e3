//! Consensus contract consumed by the region engine.
//!
//! The multi-replica raft library (election, replication, snapshot
//! transfer) is an external collaborator; the core consumes the surface
//! defined here: a [`StateMachine`] receiving committed entries in log
//! order, a [`ConsensusNode`] accepting proposals, and a registry of nodes
//! keyed by region id.
//!
//! Writes are submit-and-return-future: `propose` hands back a
//! [`WriteFuture`]; the apply loop resolves it exactly once after the entry
//! is applied. Synchronous callers block on `wait`, asynchronous callers
//! park the future wherever they like.

pub mod local;
pub mod segment_log;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use kite_common::error::{KiteResult, RegionError};
use kite_common::types::RegionId;
use parking_lot::{Condvar, Mutex};

pub use local::LocalNode;
pub use segment_log::SegmentLog;

/// Receives committed entries, in log order, exactly once each.
pub trait StateMachine: Send + Sync {
    fn apply(&self, index: u64, data: &[u8]) -> KiteResult<()>;
}

struct FutureInner {
    result: Mutex<Option<KiteResult<()>>>,
    cond: Condvar,
}

/// Resolution side of a proposal; consumed by `resolve`, which makes
/// double-completion unrepresentable.
pub struct WriteCompletion {
    inner: Arc<FutureInner>,
}

impl WriteCompletion {
    pub fn resolve(self, result: KiteResult<()>) {
        let mut slot = self.inner.result.lock();
        *slot = Some(result);
        self.inner.cond.notify_all();
    }
}

/// Caller side of a proposal.
pub struct WriteFuture {
    inner: Arc<FutureInner>,
}

impl WriteFuture {
    pub fn pair() -> (WriteFuture, WriteCompletion) {
        let inner = Arc::new(FutureInner {
            result: Mutex::new(None),
            cond: Condvar::new(),
        });
        (
            WriteFuture {
                inner: Arc::clone(&inner),
            },
            WriteCompletion { inner },
        )
    }

    /// Block until the apply loop resolves the proposal.
    pub fn wait(self) -> KiteResult<()> {
        let mut slot = self.inner.result.lock();
        while slot.is_none() {
            self.inner.cond.wait(&mut slot);
        }
        slot.take().unwrap_or(Ok(()))
    }

    /// Like `wait`, but gives up after `timeout`.
    pub fn wait_timeout(self, timeout: Duration) -> KiteResult<()> {
        let mut slot = self.inner.result.lock();
        while slot.is_none() {
            if self.inner.cond.wait_for(&mut slot, timeout).timed_out() && slot.is_none() {
                return Err(RegionError::Timeout(format!(
                    "proposal not applied within {timeout:?}"
                ))
                .into());
            }
        }
        slot.take().unwrap_or(Ok(()))
    }
}

/// One region's consensus handle.
pub trait ConsensusNode: Send + Sync {
    fn region_id(&self) -> RegionId;

    /// Submit a serialized write; the future resolves after apply.
    fn propose(&self, data: Vec<u8>) -> KiteResult<WriteFuture>;

    fn is_leader(&self) -> bool;

    /// Endpoint of the current leader, for `NotLeader` hints.
    fn leader_hint(&self) -> Option<String>;

    fn applied_index(&self) -> u64;

    /// Most recent apply failure, if any. Apply failures never abort the
    /// process; they surface here and in the log.
    fn last_error(&self) -> Option<String>;

    fn shutdown(&self);
}

/// Registry of live consensus nodes; the single owner of node handles.
#[derive(Default)]
pub struct NodeRegistry {
    nodes: DashMap<RegionId, Arc<dyn ConsensusNode>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, node: Arc<dyn ConsensusNode>) {
        self.nodes.insert(node.region_id(), node);
    }

    pub fn get(&self, region_id: RegionId) -> Option<Arc<dyn ConsensusNode>> {
        self.nodes.get(&region_id).map(|n| Arc::clone(n.value()))
    }

    pub fn remove(&self, region_id: RegionId) -> Option<Arc<dyn ConsensusNode>> {
        self.nodes.remove(&region_id).map(|(_, n)| n)
    }

    pub fn region_ids(&self) -> Vec<RegionId> {
        self.nodes.iter().map(|e| *e.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_future_resolves_once() {
        let (future, completion) = WriteFuture::pair();
        completion.resolve(Ok(()));
        assert!(future.wait().is_ok());
    }

    #[test]
    fn test_future_cross_thread() {
        let (future, completion) = WriteFuture::pair();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            completion.resolve(Err(kite_common::error::KiteError::Internal("boom".into())));
        });
        let err = future.wait().unwrap_err();
        assert!(err.to_string().contains("boom"));
        handle.join().unwrap();
    }

    #[test]
    fn test_future_timeout() {
        let (future, _completion) = WriteFuture::pair();
        let err = future.wait_timeout(Duration::from_millis(20)).unwrap_err();
        assert_eq!(
            err.code(),
            kite_common::error::ErrorCode::Timeout
        );
    }
}
