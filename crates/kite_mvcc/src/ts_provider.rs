//! Batched timestamp provider.
//!
//! Timestamps are fetched from the cluster coordinator in batches and issued
//! locally from a pair of lock-free singly-linked queues:
//!
//! - *active*: [`BatchTs`] nodes with available timestamps, newest at tail.
//! - *dead*: exhausted or stale nodes parked until a grace interval passes.
//!
//! Both queues follow the Michael-Scott pattern with helping on tail
//! advancement. Readers never block each other; the only synchronous path
//! is a renew when the active queue drains.
//!
//! ## Reclamation contract
//!
//! Nodes are freed from the dead queue only after `clean_dead_interval_ms`
//! has elapsed since they were detached. A reader's raw head pointer is used
//! within a single non-blocking loop iteration, so the grace interval bounds
//! the window in which a detached node must stay allocated. Keep the
//! interval in seconds; never set it near zero in production.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use kite_common::config::TsProviderConfig;
use kite_common::error::{KiteError, KiteResult};
use kite_common::types::{compose_ts, now_ms, Ts, TS_LOGICAL_BITS};
use parking_lot::{Condvar, Mutex};

/// One coordinator response: `count` consecutive timestamps starting at
/// `(physical, logical)`.
#[derive(Debug, Clone, Copy)]
pub struct TsoTimestamp {
    pub physical: u64,
    pub logical: u64,
    pub count: u32,
}

/// The coordinator RPC surface the provider consumes.
pub trait TsoClient: Send + Sync + 'static {
    fn gen_tso(&self, count: u32) -> KiteResult<TsoTimestamp>;
}

/// A preallocated run of consecutive timestamps.
pub struct BatchTs {
    physical: u64,
    start_ts: u64,
    end_ts: u64,
    /// Next timestamp to hand out; runs past `end_ts` once exhausted.
    next_ts: AtomicU64,
    create_time_ms: u64,
    dead_time_ms: AtomicU64,
    next: AtomicPtr<BatchTs>,
}

impl BatchTs {
    /// Heap-allocate a batch node. The caller owns the raw pointer until it
    /// is pushed onto a queue.
    pub fn alloc(physical: u64, logical: u64, count: u32) -> *mut BatchTs {
        let start_ts = compose_ts(physical, logical);
        let end_ts = start_ts + count as u64;
        Box::into_raw(Box::new(BatchTs {
            physical,
            start_ts,
            end_ts,
            next_ts: AtomicU64::new(start_ts),
            create_time_ms: now_ms(),
            dead_time_ms: AtomicU64::new(0),
            next: AtomicPtr::new(ptr::null_mut()),
        }))
    }

    /// Empty sentinel node; issues nothing.
    fn sentinel() -> *mut BatchTs {
        Box::into_raw(Box::new(BatchTs {
            physical: 0,
            start_ts: 0,
            end_ts: 0,
            next_ts: AtomicU64::new(0),
            create_time_ms: now_ms(),
            dead_time_ms: AtomicU64::new(0),
            next: AtomicPtr::new(ptr::null_mut()),
        }))
    }

    /// Reserve the next timestamp; 0 when the batch is exhausted.
    fn issue(&self) -> u64 {
        let ts = self.next_ts.fetch_add(1, Ordering::Relaxed);
        if ts < self.end_ts {
            ts
        } else {
            0
        }
    }

    /// Mark every remaining timestamp as consumed.
    fn exhaust(&self) {
        self.next_ts.store(self.end_ts, Ordering::Relaxed);
    }

    pub fn physical(&self) -> u64 {
        self.physical
    }

    pub fn remaining(&self) -> u64 {
        self.end_ts
            .saturating_sub(self.next_ts.load(Ordering::Relaxed))
    }
}

/// The active + dead queue pair.
pub struct BatchTsList {
    head: AtomicPtr<BatchTs>,
    tail: AtomicPtr<BatchTs>,
    dead_head: AtomicPtr<BatchTs>,
    dead_tail: AtomicPtr<BatchTs>,
    /// Physical component of the most recently appended batch.
    last_physical: AtomicU64,
    active_count: AtomicU64,
    dead_count: AtomicU64,
    stale_interval_ms: u64,
    clean_interval_ms: u64,
}

impl BatchTsList {
    pub fn new(stale_interval_ms: u64, clean_interval_ms: u64) -> Self {
        let head = BatchTs::sentinel();
        let dead_head = BatchTs::sentinel();
        Self {
            head: AtomicPtr::new(head),
            tail: AtomicPtr::new(head),
            dead_head: AtomicPtr::new(dead_head),
            dead_tail: AtomicPtr::new(dead_head),
            last_physical: AtomicU64::new(0),
            active_count: AtomicU64::new(0),
            dead_count: AtomicU64::new(0),
            stale_interval_ms,
            clean_interval_ms,
        }
    }

    /// Append a batch to the active tail. Takes ownership of `node`.
    pub fn push(&self, node: *mut BatchTs) {
        debug_assert!(!node.is_null());
        loop {
            let tail = self.tail.load(Ordering::SeqCst);
            // Safety: queue nodes are only freed from the dead list after
            // the grace interval; see the module reclamation contract.
            let tail_next = unsafe { (*tail).next.load(Ordering::SeqCst) };
            if tail != self.tail.load(Ordering::SeqCst) {
                continue;
            }
            if !tail_next.is_null() {
                // Help a stalled producer move the tail forward.
                let _ = self.tail.compare_exchange_weak(
                    tail,
                    tail_next,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
                continue;
            }
            let link = unsafe { &(*tail).next };
            if link
                .compare_exchange_weak(
                    ptr::null_mut(),
                    node,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                self.active_count.fetch_add(1, Ordering::Relaxed);
                let physical = unsafe { (*node).physical };
                self.last_physical.store(physical, Ordering::Release);
                return;
            }
        }
    }

    /// A batch is stale when it sat unused past the stale interval, or when
    /// its physical clock lags the newest appended batch by more than the
    /// interval. Stale heads are skipped even when non-empty.
    fn is_stale(&self, batch: &BatchTs) -> bool {
        let local_now = now_ms();
        if batch.create_time_ms + self.stale_interval_ms < local_now {
            return true;
        }
        batch.physical + self.stale_interval_ms < self.last_physical.load(Ordering::Acquire)
    }

    /// Issue the next timestamp greater than `after_ts`; 0 when the active
    /// queue has nothing usable (caller triggers a renew).
    pub fn get_ts(&self, after_ts: Ts) -> Ts {
        loop {
            let head = self.head.load(Ordering::SeqCst);
            let tail = self.tail.load(Ordering::SeqCst);
            // Safety: see the module reclamation contract.
            let head_ref = unsafe { &*head };
            let head_next = head_ref.next.load(Ordering::SeqCst);

            if !self.is_stale(head_ref) {
                let ts = head_ref.issue();
                if ts > after_ts && ts > 0 {
                    return ts;
                }
            }

            if head_next.is_null() {
                return 0;
            }
            if head == tail {
                let _ = self.tail.compare_exchange_weak(
                    tail,
                    head_next,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
                continue;
            }
            if self
                .head
                .compare_exchange_weak(head, head_next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.active_count.fetch_sub(1, Ordering::Relaxed);
                self.push_dead(head);
            }
        }
    }

    fn push_dead(&self, node: *mut BatchTs) {
        // Safety: the node was just detached; this thread is its only owner
        // for linking purposes.
        unsafe {
            (*node).next.store(ptr::null_mut(), Ordering::SeqCst);
            (*node).dead_time_ms.store(now_ms(), Ordering::Relaxed);
        }
        loop {
            let tail = self.dead_tail.load(Ordering::SeqCst);
            let tail_next = unsafe { (*tail).next.load(Ordering::SeqCst) };
            if tail != self.dead_tail.load(Ordering::SeqCst) {
                continue;
            }
            if !tail_next.is_null() {
                let _ = self.dead_tail.compare_exchange_weak(
                    tail,
                    tail_next,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
                continue;
            }
            let link = unsafe { &(*tail).next };
            if link
                .compare_exchange_weak(
                    ptr::null_mut(),
                    node,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                self.dead_count.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
    }

    /// Free dead nodes past the grace interval. Driven synchronously from
    /// the renew path; no background timer involved.
    pub fn clean_dead(&self) {
        loop {
            let head = self.dead_head.load(Ordering::SeqCst);
            let tail = self.dead_tail.load(Ordering::SeqCst);
            // Safety: see the module reclamation contract.
            let head_ref = unsafe { &*head };
            let head_next = head_ref.next.load(Ordering::SeqCst);

            let clean_before = now_ms().saturating_sub(self.clean_interval_ms);
            if head_ref.dead_time_ms.load(Ordering::Relaxed) >= clean_before {
                return;
            }
            if head_next.is_null() {
                return;
            }
            if head == tail {
                let _ = self.dead_tail.compare_exchange_weak(
                    tail,
                    head_next,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
                continue;
            }
            if self
                .dead_head
                .compare_exchange_weak(head, head_next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.dead_count.fetch_sub(1, Ordering::Relaxed);
                // Safety: past the grace interval, no reader still holds
                // this pointer.
                unsafe { drop(Box::from_raw(head)) };
            }
        }
    }

    /// Discard every remaining timestamp in the active queue (coordinator
    /// restart). Nodes drain through the dead list as usual.
    pub fn flush(&self) {
        loop {
            let head = self.head.load(Ordering::SeqCst);
            let tail = self.tail.load(Ordering::SeqCst);
            let head_ref = unsafe { &*head };
            let head_next = head_ref.next.load(Ordering::SeqCst);

            head_ref.exhaust();

            if head_next.is_null() {
                return;
            }
            if head == tail {
                let _ = self.tail.compare_exchange_weak(
                    tail,
                    head_next,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
                continue;
            }
            if self
                .head
                .compare_exchange_weak(head, head_next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.active_count.fetch_sub(1, Ordering::Relaxed);
                self.push_dead(head);
            }
        }
    }

    pub fn active_count(&self) -> u64 {
        self.active_count.load(Ordering::Relaxed)
    }

    pub fn dead_count(&self) -> u64 {
        self.dead_count.load(Ordering::Relaxed)
    }

    pub fn debug_info(&self) -> String {
        format!(
            "active_count({}) dead_count({}) last_physical({})",
            self.active_count(),
            self.dead_count(),
            self.last_physical.load(Ordering::Acquire),
        )
    }
}

impl Drop for BatchTsList {
    fn drop(&mut self) {
        for head in [
            self.head.load(Ordering::SeqCst),
            self.dead_head.load(Ordering::SeqCst),
        ] {
            let mut node = head;
            while !node.is_null() {
                // Safety: drop has exclusive access; every node reachable
                // from a head pointer is owned by this list.
                let next = unsafe { (*node).next.load(Ordering::SeqCst) };
                unsafe { drop(Box::from_raw(node)) };
                node = next;
            }
        }
    }
}

// Raw queue pointers are only touched through atomics.
unsafe impl Send for BatchTsList {}
unsafe impl Sync for BatchTsList {}

struct SyncWaiter {
    done: Mutex<bool>,
    cond: Condvar,
}

impl SyncWaiter {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            done: Mutex::new(false),
            cond: Condvar::new(),
        })
    }

    fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cond.wait(&mut done);
        }
    }

    fn notify(&self) {
        let mut done = self.done.lock();
        *done = true;
        self.cond.notify_all();
    }
}

struct RenewTask {
    /// Renew epoch observed at launch; a newer epoch means someone already
    /// renewed and the task is a no-op.
    epoch: u64,
    waiter: Option<Arc<SyncWaiter>>,
}

struct Shared {
    list: BatchTsList,
    client: Arc<dyn TsoClient>,
    config: TsProviderConfig,
    renew_epoch: AtomicU64,
}

/// Issues strictly monotonic timestamps, amortizing coordinator round-trips
/// over batches.
pub struct TsProvider {
    shared: Arc<Shared>,
    renew_tx: Option<Sender<RenewTask>>,
    worker: Option<JoinHandle<()>>,
    issued: AtomicU64,
    failed: AtomicU64,
}

impl TsProvider {
    pub fn new(client: Arc<dyn TsoClient>, config: TsProviderConfig) -> Self {
        let shared = Arc::new(Shared {
            list: BatchTsList::new(
                config.batch_ts_stale_interval_ms,
                config.clean_dead_interval_ms,
            ),
            client,
            config,
            renew_epoch: AtomicU64::new(0),
        });
        let (tx, rx) = unbounded();
        let worker = std::thread::Builder::new()
            .name("ts-renew".into())
            .spawn({
                let shared = Arc::clone(&shared);
                move || renew_worker(shared, rx)
            })
            .ok();
        Self {
            shared,
            renew_tx: Some(tx),
            worker,
            issued: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Next unused timestamp strictly greater than `after_ts` and every
    /// previously issued timestamp.
    ///
    /// The outer retry budget (`max_retry_num`) is the single exit
    /// condition; each retry performs one synchronous renew whose RPC
    /// budget is `renew_max_retry_num`.
    pub fn get_ts(&self, after_ts: Ts) -> KiteResult<Ts> {
        let retries = self.shared.config.max_retry_num;
        for _ in 0..retries {
            let ts = self.shared.list.get_ts(after_ts);
            if ts > 0 {
                self.issued.fetch_add(1, Ordering::Relaxed);
                return Ok(ts);
            }
            self.launch_renew(true);
        }
        tracing::error!(retries, "get ts retried too much");
        self.failed.fetch_add(1, Ordering::Relaxed);
        Err(KiteError::TsUnavailable { retries })
    }

    /// Kick an asynchronous renew (prefetch before the queue drains).
    pub fn trigger_renew(&self) {
        self.launch_renew(false);
    }

    fn launch_renew(&self, sync: bool) {
        let Some(tx) = &self.renew_tx else {
            return;
        };
        let waiter = if sync { Some(SyncWaiter::new()) } else { None };
        let task = RenewTask {
            epoch: self.shared.renew_epoch.load(Ordering::Acquire),
            waiter: waiter.clone(),
        };
        if tx.send(task).is_err() {
            tracing::error!("launch renew batch ts failed, worker gone");
            return;
        }
        if let Some(waiter) = waiter {
            waiter.wait();
        }
    }

    pub fn issued_count(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }

    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn renew_epoch(&self) -> u64 {
        self.shared.renew_epoch.load(Ordering::Acquire)
    }

    pub fn debug_info(&self) -> String {
        format!(
            "{} ts_count({}/{}) renew({})",
            self.shared.list.debug_info(),
            self.issued_count(),
            self.failed_count(),
            self.renew_epoch(),
        )
    }
}

impl Drop for TsProvider {
    fn drop(&mut self) {
        self.renew_tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn renew_worker(shared: Arc<Shared>, rx: Receiver<RenewTask>) {
    while let Ok(task) = rx.recv() {
        if shared.renew_epoch.load(Ordering::Acquire) == task.epoch {
            renew_batch_ts(&shared);
        }
        if let Some(waiter) = task.waiter {
            waiter.notify();
        }
    }
}

fn renew_batch_ts(shared: &Shared) {
    let retries = shared.config.renew_max_retry_num;
    for _ in 0..retries {
        match shared.client.gen_tso(shared.config.batch_size) {
            Ok(tso) if tso.count > 0 => {
                let node = BatchTs::alloc(tso.physical, tso.logical, tso.count);
                shared.list.push(node);
                shared.renew_epoch.fetch_add(1, Ordering::Release);
                shared.list.clean_dead();
                return;
            }
            Ok(_) => {
                tracing::warn!("tso response carried zero timestamps");
            }
            Err(e) => {
                tracing::warn!(error = %e, "get remote tso failed");
            }
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    tracing::error!(retries, "renew batch ts retried too much");
}

/// In-process timestamp allocator for mono/memory deployments and tests.
/// Physical component tracks the wall clock; logical rolls within it.
pub struct LocalTsoClient {
    state: Mutex<(u64, u64)>,
}

impl LocalTsoClient {
    pub fn new() -> Self {
        Self {
            state: Mutex::new((now_ms(), 0)),
        }
    }
}

impl Default for LocalTsoClient {
    fn default() -> Self {
        Self::new()
    }
}

impl TsoClient for LocalTsoClient {
    fn gen_tso(&self, count: u32) -> KiteResult<TsoTimestamp> {
        let mut state = self.state.lock();
        let now = now_ms();
        if now > state.0 {
            *state = (now, 0);
        }
        if state.1 + count as u64 >= (1 << TS_LOGICAL_BITS) {
            *state = (state.0 + 1, 0);
        }
        let resp = TsoTimestamp {
            physical: state.0,
            logical: state.1,
            count,
        };
        state.1 += count as u64;
        Ok(resp)
    }
}
