//! Single-voter consensus driver.
//!
//! Implements the [`ConsensusNode`] contract for deployments without peer
//! replicas (mono store engine, tests): proposals are made durable in the
//! segment log, then handed to a per-region apply thread that feeds the
//! state machine in log order and resolves each completion exactly once.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender};
use kite_common::error::{KiteResult, RegionError};
use kite_common::types::RegionId;
use parking_lot::Mutex;

use crate::segment_log::SegmentLog;
use crate::{ConsensusNode, StateMachine, WriteCompletion, WriteFuture};

struct ApplyTask {
    index: u64,
    data: Vec<u8>,
    completion: WriteCompletion,
}

/// Single-replica consensus node backed by a [`SegmentLog`].
pub struct LocalNode {
    region_id: RegionId,
    log: Arc<SegmentLog>,
    apply_tx: Mutex<Option<Sender<ApplyTask>>>,
    applied: Arc<AtomicU64>,
    last_error: Arc<Mutex<Option<String>>>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl LocalNode {
    /// Open the region's log, replay entries past `applied_index` into the
    /// state machine, and start the apply loop.
    pub fn start(
        region_id: RegionId,
        log_dir: &std::path::Path,
        max_segment_size: u64,
        state_machine: Arc<dyn StateMachine>,
        applied_index: u64,
    ) -> KiteResult<Arc<Self>> {
        let log = Arc::new(
            SegmentLog::open(log_dir, max_segment_size).map_err(|e| {
                RegionError::RaftInitFailed {
                    region_id,
                    detail: e.to_string(),
                }
            })?,
        );

        let applied = Arc::new(AtomicU64::new(applied_index));
        let last_error = Arc::new(Mutex::new(None));

        // Recovery: re-feed committed-but-unapplied entries.
        for (index, data) in log.entries_from(applied_index + 1).map_err(|e| {
            RegionError::RaftInitFailed {
                region_id,
                detail: e.to_string(),
            }
        })? {
            if let Err(e) = state_machine.apply(index, &data) {
                tracing::error!(region = region_id, index, error = %e, "recovery apply failed");
                *last_error.lock() = Some(e.to_string());
            }
            applied.store(index, Ordering::Release);
        }

        let (tx, rx) = unbounded();
        let running = Arc::new(AtomicBool::new(true));
        let worker = std::thread::Builder::new()
            .name(format!("apply-{region_id}"))
            .spawn({
                let applied = Arc::clone(&applied);
                let last_error = Arc::clone(&last_error);
                move || apply_loop(region_id, state_machine, rx, applied, last_error)
            })
            .map_err(|e| RegionError::RaftInitFailed {
                region_id,
                detail: e.to_string(),
            })?;

        Ok(Arc::new(Self {
            region_id,
            log,
            apply_tx: Mutex::new(Some(tx)),
            applied,
            last_error,
            running,
            worker: Mutex::new(Some(worker)),
        }))
    }

    pub fn log(&self) -> &Arc<SegmentLog> {
        &self.log
    }
}

impl ConsensusNode for LocalNode {
    fn region_id(&self) -> RegionId {
        self.region_id
    }

    fn propose(&self, data: Vec<u8>) -> KiteResult<WriteFuture> {
        if !self.running.load(Ordering::Acquire) {
            return Err(RegionError::RaftNotFound(self.region_id).into());
        }
        // Durable first, then visible to the apply loop.
        let index = self.log.append(&data)?;
        let (future, completion) = WriteFuture::pair();
        let tx = self.apply_tx.lock();
        match tx.as_ref() {
            Some(tx) => {
                if tx
                    .send(ApplyTask {
                        index,
                        data,
                        completion,
                    })
                    .is_err()
                {
                    return Err(RegionError::RaftNotFound(self.region_id).into());
                }
            }
            None => return Err(RegionError::RaftNotFound(self.region_id).into()),
        }
        Ok(future)
    }

    fn is_leader(&self) -> bool {
        // A single voter is always its own leader.
        true
    }

    fn leader_hint(&self) -> Option<String> {
        None
    }

    fn applied_index(&self) -> u64 {
        self.applied.load(Ordering::Acquire)
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        self.apply_tx.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

fn apply_loop(
    region_id: RegionId,
    state_machine: Arc<dyn StateMachine>,
    rx: Receiver<ApplyTask>,
    applied: Arc<AtomicU64>,
    last_error: Arc<Mutex<Option<String>>>,
) {
    while let Ok(task) = rx.recv() {
        let result = state_machine.apply(task.index, &task.data);
        if let Err(e) = &result {
            // Apply failures are recorded, never fatal to the process.
            tracing::error!(region = region_id, index = task.index, error = %e, "apply failed");
            *last_error.lock() = Some(e.to_string());
        }
        applied.store(task.index, Ordering::Release);
        task.completion.resolve(result);
    }
}
