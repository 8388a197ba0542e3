//! The two-phase-commit state machine.
//!
//! Per-key lifecycle: prewrite places a lock, commit turns it into a write
//! record, rollback turns it into a rollback marker. `COMMITTED` and
//! `ROLLED_BACK` are terminal for a given start_ts. Idempotent re-runs
//! (double commit, double rollback, repeated prewrite by the same txn)
//! report success.

use std::sync::Arc;

use kite_common::error::{KiteError, KiteResult, RawError, TxnError};
use kite_common::txn::{LockInfo, LockType, WriteKind, WriteRecord, SHORT_VALUE_LIMIT};
use kite_common::types::{hex, ts_physical, Ts, MAX_TS};
use kite_mvcc::codec::{
    encode_key, encode_plain_key, pack_value, unpack_value, ValueFlag, NS_TXN,
};
use kite_storage::engine::{
    EngineIterator, EngineSnapshot, IteratorOptions, RawEngine, WriteBatch, CF_DATA, CF_LOCK,
    CF_WRITE,
};

/// Applies a transaction's atomic batch. Raft regions submit through the
/// proposal path; mono/memory regions write the engine directly.
pub trait WriteSubmitter: Send + Sync {
    fn submit(&self, batch: WriteBatch) -> KiteResult<()>;
}

/// Submitter that applies batches straight to the raw engine.
pub struct DirectSubmitter {
    engine: Arc<dyn RawEngine>,
}

impl DirectSubmitter {
    pub fn new(engine: Arc<dyn RawEngine>) -> Self {
        Self { engine }
    }
}

impl WriteSubmitter for DirectSubmitter {
    fn submit(&self, batch: WriteBatch) -> KiteResult<()> {
        self.engine.write_batch(batch).map_err(KiteError::from)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOp {
    Put,
    Delete,
    /// Lock the key without changing its value.
    Lock,
}

#[derive(Debug, Clone)]
pub struct Mutation {
    pub op: MutationOp,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Mutation {
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            op: MutationOp::Put,
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        Self {
            op: MutationOp::Delete,
            key: key.into(),
            value: Vec::new(),
        }
    }

    pub fn lock(key: impl Into<Vec<u8>>) -> Self {
        Self {
            op: MutationOp::Lock,
            key: key.into(),
            value: Vec::new(),
        }
    }

    fn lock_type(&self) -> LockType {
        match self.op {
            MutationOp::Put => LockType::Put,
            MutationOp::Delete => LockType::Delete,
            MutationOp::Lock => LockType::Lock,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PrewriteRequest {
    pub mutations: Vec<Mutation>,
    pub primary_lock: Vec<u8>,
    pub start_ts: Ts,
    pub lock_ttl_ms: u64,
    pub txn_size: u64,
    pub try_one_pc: bool,
    pub min_commit_ts: Ts,
    pub max_commit_ts: Ts,
    /// Per-mutation pessimistic flags; empty means fully optimistic.
    pub pessimistic_flags: Vec<bool>,
    /// Per-mutation `for_update_ts` floor to verify on pessimistic keys;
    /// 0 skips the check.
    pub for_update_ts_checks: Vec<Ts>,
    pub lock_extra_data: Vec<u8>,
    /// Secondary keys, meaningful on the request carrying the primary.
    pub secondaries: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Default)]
pub struct PrewriteResult {
    /// Non-zero when the request committed in one phase.
    pub one_pc_commit_ts: Ts,
}

#[derive(Debug, Clone)]
pub struct PessimisticLockRequest {
    pub keys: Vec<Vec<u8>>,
    pub primary_lock: Vec<u8>,
    pub start_ts: Ts,
    pub for_update_ts: Ts,
    pub lock_ttl_ms: u64,
    /// Return the current committed value of each key.
    pub return_values: bool,
}

/// Outcome of `check_txn_status` on a primary key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnStatus {
    /// Lock alive; carries the remaining TTL in milliseconds.
    Locked { remaining_ttl_ms: u64, min_commit_ts: Ts },
    /// TTL elapsed; the primary has been rolled back.
    TtlExpired,
    Committed { commit_ts: Ts },
    RolledBack,
    /// No lock and no terminal record existed; a rollback marker was
    /// inserted to fence late prewrites.
    LockNotExistRollback,
}

/// Secondary lock states collected for a decided primary.
#[derive(Debug, Clone, Default)]
pub struct CheckSecondaryResult {
    pub locks: Vec<LockInfo>,
    /// Non-zero when some secondary already committed.
    pub commit_ts: Ts,
    pub rolled_back: bool,
}

/// The transaction engine, bound to one raw engine and one submitter.
pub struct TxnEngine {
    engine: Arc<dyn RawEngine>,
    submitter: Arc<dyn WriteSubmitter>,
}

impl TxnEngine {
    pub fn new(engine: Arc<dyn RawEngine>, submitter: Arc<dyn WriteSubmitter>) -> Self {
        Self { engine, submitter }
    }

    /// Engine whose batches are applied directly (mono/memory regions).
    pub fn direct(engine: Arc<dyn RawEngine>) -> Self {
        let submitter = Arc::new(DirectSubmitter::new(Arc::clone(&engine)));
        Self::new(engine, submitter)
    }

    pub fn raw_engine(&self) -> &Arc<dyn RawEngine> {
        &self.engine
    }

    pub(crate) fn submit_batch(&self, batch: WriteBatch) -> KiteResult<()> {
        self.submitter.submit(batch)
    }

    pub fn prewrite(&self, req: &PrewriteRequest) -> KiteResult<PrewriteResult> {
        if req.start_ts == 0 || req.mutations.is_empty() || req.primary_lock.is_empty() {
            return Err(RawError::IllegalParameters(
                "prewrite needs start_ts, mutations and a primary lock".into(),
            )
            .into());
        }
        let snapshot = self.engine.snapshot();
        let mut batch = WriteBatch::new();
        let mut one_pc_commit_ts = 0;

        if req.try_one_pc {
            one_pc_commit_ts = req.min_commit_ts.max(req.start_ts + 1);
            if req.max_commit_ts > 0 && one_pc_commit_ts > req.max_commit_ts {
                one_pc_commit_ts = 0;
            }
        }

        for (idx, mutation) in req.mutations.iter().enumerate() {
            if mutation.key.is_empty() {
                return Err(RawError::KeyEmpty.into());
            }
            let pessimistic = req.pessimistic_flags.get(idx).copied().unwrap_or(false);
            let lock_key = encode_plain_key(NS_TXN, &mutation.key);
            let existing = read_lock(snapshot.as_ref(), &lock_key)?;

            if pessimistic {
                let Some(lock) = existing else {
                    return Err(TxnError::PessimisticLockNotFound {
                        start_ts: req.start_ts,
                        key_hex: hex(&mutation.key),
                    }
                    .into());
                };
                if lock.start_ts != req.start_ts {
                    return Err(TxnError::KeyIsLocked { lock: Box::new(lock) }.into());
                }
                if lock.lock_type != LockType::Pessimistic {
                    // Repeated prewrite already converted this lock.
                    continue;
                }
                let floor = req.for_update_ts_checks.get(idx).copied().unwrap_or(0);
                if floor > 0 && lock.for_update_ts < floor {
                    return Err(TxnError::PessimisticLockNotFound {
                        start_ts: req.start_ts,
                        key_hex: hex(&mutation.key),
                    }
                    .into());
                }
            } else {
                if let Some(lock) = existing {
                    if lock.start_ts == req.start_ts {
                        // Idempotent repeat of our own prewrite.
                        continue;
                    }
                    return Err(TxnError::KeyIsLocked { lock: Box::new(lock) }.into());
                }
                if let Some((conflict_ts, _)) =
                    latest_write(snapshot.as_ref(), &mutation.key)?
                {
                    if conflict_ts >= req.start_ts {
                        return Err(TxnError::WriteConflict {
                            start_ts: req.start_ts,
                            conflict_ts,
                            key_hex: hex(&mutation.key),
                        }
                        .into());
                    }
                }
            }

            let short_value = (mutation.op == MutationOp::Put
                && mutation.value.len() <= SHORT_VALUE_LIMIT)
                .then(|| mutation.value.clone());

            if req.try_one_pc && one_pc_commit_ts > 0 {
                let record = WriteRecord::with_short_value(
                    req.start_ts,
                    WriteKind::from_lock_type(mutation.lock_type()),
                    short_value,
                );
                batch.put(
                    CF_WRITE,
                    encode_key(NS_TXN, &mutation.key, one_pc_commit_ts),
                    record.encode(),
                );
                if mutation.op == MutationOp::Put && mutation.value.len() > SHORT_VALUE_LIMIT {
                    batch.put(
                        CF_DATA,
                        encode_key(NS_TXN, &mutation.key, req.start_ts),
                        pack_value(ValueFlag::Normal, &mutation.value),
                    );
                }
                continue;
            }

            if mutation.op == MutationOp::Put && short_value.is_none() {
                batch.put(
                    CF_DATA,
                    encode_key(NS_TXN, &mutation.key, req.start_ts),
                    pack_value(ValueFlag::Normal, &mutation.value),
                );
            }
            let lock = LockInfo {
                primary_lock: req.primary_lock.clone(),
                key: mutation.key.clone(),
                lock_type: mutation.lock_type(),
                start_ts: req.start_ts,
                for_update_ts: req
                    .for_update_ts_checks
                    .get(idx)
                    .copied()
                    .unwrap_or(0),
                ttl_ms: req.lock_ttl_ms,
                txn_size: req.txn_size,
                min_commit_ts: req.min_commit_ts.max(req.start_ts + 1),
                secondaries: if mutation.key == req.primary_lock {
                    req.secondaries.clone()
                } else {
                    Vec::new()
                },
                short_value,
                extra_data: req.lock_extra_data.clone(),
            };
            batch.put(CF_LOCK, lock_key, lock.encode());
        }

        if !batch.is_empty() {
            self.submitter.submit(batch)?;
        }
        Ok(PrewriteResult {
            one_pc_commit_ts: if req.try_one_pc { one_pc_commit_ts } else { 0 },
        })
    }

    pub fn commit(&self, start_ts: Ts, commit_ts: Ts, keys: &[Vec<u8>]) -> KiteResult<()> {
        if commit_ts <= start_ts {
            return Err(RawError::IllegalParameters(format!(
                "commit_ts {commit_ts} must exceed start_ts {start_ts}"
            ))
            .into());
        }
        let snapshot = self.engine.snapshot();
        let mut batch = WriteBatch::new();

        for key in keys {
            let lock_key = encode_plain_key(NS_TXN, key);
            match read_lock(snapshot.as_ref(), &lock_key)? {
                Some(lock) if lock.start_ts == start_ts => {
                    if lock.lock_type == LockType::Pessimistic {
                        // Prewrite never converted this lock; committing it
                        // would fabricate a write.
                        return Err(TxnError::LockNotFound {
                            start_ts,
                            key_hex: hex(key),
                        }
                        .into());
                    }
                    if commit_ts < lock.min_commit_ts {
                        return Err(RawError::IllegalParameters(format!(
                            "commit_ts {commit_ts} below min_commit_ts {}",
                            lock.min_commit_ts
                        ))
                        .into());
                    }
                    let record = WriteRecord::with_short_value(
                        start_ts,
                        WriteKind::from_lock_type(lock.lock_type),
                        lock.short_value.clone(),
                    );
                    batch.put(CF_WRITE, encode_key(NS_TXN, key, commit_ts), record.encode());
                    batch.delete(CF_LOCK, lock_key);
                }
                Some(lock) => {
                    tracing::debug!(
                        start_ts,
                        lock_start_ts = lock.start_ts,
                        key = %hex(key),
                        "commit found lock of another txn"
                    );
                    return Err(TxnError::LockNotFound {
                        start_ts,
                        key_hex: hex(key),
                    }
                    .into());
                }
                None => {
                    // Idempotent when this txn already committed at this ts.
                    let slot = snapshot.get(CF_WRITE, &encode_key(NS_TXN, key, commit_ts))?;
                    let committed = slot
                        .as_deref()
                        .and_then(WriteRecord::decode)
                        .map(|rec| rec.start_ts == start_ts && rec.kind != WriteKind::Rollback)
                        .unwrap_or(false);
                    if !committed {
                        return Err(TxnError::TxnNotFound {
                            start_ts,
                            key_hex: hex(key),
                        }
                        .into());
                    }
                }
            }
        }

        if !batch.is_empty() {
            self.submitter.submit(batch)?;
        }
        Ok(())
    }

    /// Write rollback markers and drop any lock/payload left by `start_ts`.
    pub fn batch_rollback(&self, start_ts: Ts, keys: &[Vec<u8>]) -> KiteResult<()> {
        let snapshot = self.engine.snapshot();
        let mut batch = WriteBatch::new();
        for key in keys {
            self.rollback_one(snapshot.as_ref(), &mut batch, key, start_ts)?;
        }
        if !batch.is_empty() {
            self.submitter.submit(batch)?;
        }
        Ok(())
    }

    fn rollback_one(
        &self,
        snapshot: &dyn EngineSnapshot,
        batch: &mut WriteBatch,
        key: &[u8],
        start_ts: Ts,
    ) -> KiteResult<()> {
        let rollback_slot = encode_key(NS_TXN, key, start_ts);
        if let Some(raw) = snapshot.get(CF_WRITE, &rollback_slot)? {
            if let Some(rec) = WriteRecord::decode(&raw) {
                if rec.kind == WriteKind::Rollback {
                    // Already rolled back; idempotent.
                    return Ok(());
                }
            }
        }
        batch.put(
            CF_WRITE,
            rollback_slot,
            WriteRecord::new(start_ts, WriteKind::Rollback).encode(),
        );

        let lock_key = encode_plain_key(NS_TXN, key);
        if let Some(lock) = read_lock(snapshot, &lock_key)? {
            if lock.start_ts == start_ts {
                batch.delete(CF_LOCK, lock_key);
                batch.delete(CF_DATA, encode_key(NS_TXN, key, start_ts));
            }
        }
        Ok(())
    }

    pub fn pessimistic_lock(
        &self,
        req: &PessimisticLockRequest,
    ) -> KiteResult<Vec<Option<Vec<u8>>>> {
        if req.start_ts == 0 || req.for_update_ts == 0 || req.keys.is_empty() {
            return Err(RawError::IllegalParameters(
                "pessimistic lock needs start_ts, for_update_ts and keys".into(),
            )
            .into());
        }
        let snapshot = self.engine.snapshot();
        let mut batch = WriteBatch::new();
        let mut values = Vec::with_capacity(req.keys.len());

        for key in &req.keys {
            let lock_key = encode_plain_key(NS_TXN, key);
            let existing = read_lock(snapshot.as_ref(), &lock_key)?;
            let mut for_update_ts = req.for_update_ts;
            if let Some(lock) = existing {
                if lock.start_ts != req.start_ts || lock.lock_type != LockType::Pessimistic {
                    return Err(TxnError::KeyIsLocked { lock: Box::new(lock) }.into());
                }
                // Re-lock by the same txn: keep the largest for_update_ts.
                for_update_ts = for_update_ts.max(lock.for_update_ts);
            }

            if let Some((conflict_ts, _)) = latest_write(snapshot.as_ref(), key)? {
                if conflict_ts > req.for_update_ts {
                    return Err(TxnError::WriteConflict {
                        start_ts: req.start_ts,
                        conflict_ts,
                        key_hex: hex(key),
                    }
                    .into());
                }
            }

            values.push(if req.return_values {
                read_committed_value(snapshot.as_ref(), key, req.for_update_ts)?
            } else {
                None
            });

            let lock = LockInfo {
                primary_lock: req.primary_lock.clone(),
                key: key.clone(),
                lock_type: LockType::Pessimistic,
                start_ts: req.start_ts,
                for_update_ts,
                ttl_ms: req.lock_ttl_ms,
                txn_size: req.keys.len() as u64,
                min_commit_ts: 0,
                secondaries: Vec::new(),
                short_value: None,
                extra_data: Vec::new(),
            };
            batch.put(CF_LOCK, lock_key, lock.encode());
        }

        self.submitter.submit(batch)?;
        Ok(values)
    }

    /// Release pessimistic locks that never reached prewrite. Idempotent.
    pub fn pessimistic_rollback(
        &self,
        start_ts: Ts,
        for_update_ts: Ts,
        keys: &[Vec<u8>],
    ) -> KiteResult<()> {
        let snapshot = self.engine.snapshot();
        let mut batch = WriteBatch::new();
        for key in keys {
            let lock_key = encode_plain_key(NS_TXN, key);
            if let Some(lock) = read_lock(snapshot.as_ref(), &lock_key)? {
                if lock.start_ts == start_ts
                    && lock.lock_type == LockType::Pessimistic
                    && lock.for_update_ts <= for_update_ts
                {
                    batch.delete(CF_LOCK, lock_key);
                }
            }
        }
        if !batch.is_empty() {
            self.submitter.submit(batch)?;
        }
        Ok(())
    }

    /// Resolve the primary's fate. A zero `current_ts` is a pure status
    /// probe: TTL can never be judged elapsed against it, so live locks are
    /// reported alive, while terminal states still resolve.
    /// The legacy `force_sync_commit` flag is accepted and ignored.
    pub fn check_txn_status(
        &self,
        primary_key: &[u8],
        lock_ts: Ts,
        _caller_start_ts: Ts,
        current_ts: Ts,
    ) -> KiteResult<TxnStatus> {
        let snapshot = self.engine.snapshot();
        let lock_key = encode_plain_key(NS_TXN, primary_key);

        if let Some(lock) = read_lock(snapshot.as_ref(), &lock_key)? {
            if lock.start_ts == lock_ts {
                let expire_at = ts_physical(lock_ts) + lock.ttl_ms;
                if current_ts > 0 && ts_physical(current_ts) >= expire_at {
                    let mut batch = WriteBatch::new();
                    self.rollback_one(snapshot.as_ref(), &mut batch, primary_key, lock_ts)?;
                    self.submitter.submit(batch)?;
                    return Ok(TxnStatus::TtlExpired);
                }
                let remaining = expire_at.saturating_sub(ts_physical(current_ts));
                return Ok(TxnStatus::Locked {
                    remaining_ttl_ms: remaining,
                    min_commit_ts: lock.min_commit_ts,
                });
            }
        }

        match find_write_by_start_ts(snapshot.as_ref(), primary_key, lock_ts)? {
            Some((_, rec)) if rec.kind == WriteKind::Rollback => Ok(TxnStatus::RolledBack),
            Some((commit_ts, _)) => Ok(TxnStatus::Committed { commit_ts }),
            None => {
                // Fence late prewrites of this txn.
                let mut batch = WriteBatch::new();
                batch.put(
                    CF_WRITE,
                    encode_key(NS_TXN, primary_key, lock_ts),
                    WriteRecord::new(lock_ts, WriteKind::Rollback).encode(),
                );
                self.submitter.submit(batch)?;
                Ok(TxnStatus::LockNotExistRollback)
            }
        }
    }

    /// Commit (`commit_ts > 0`) or roll back (`commit_ts == 0`) every lock
    /// of `start_ts` on the given keys; with no keys, sweep the lock CF.
    pub fn resolve_lock(
        &self,
        start_ts: Ts,
        commit_ts: Ts,
        keys: &[Vec<u8>],
    ) -> KiteResult<()> {
        if commit_ts > 0 && commit_ts <= start_ts {
            return Err(RawError::IllegalParameters(format!(
                "resolve commit_ts {commit_ts} must exceed start_ts {start_ts}"
            ))
            .into());
        }
        let snapshot = self.engine.snapshot();
        let targets: Vec<Vec<u8>> = if keys.is_empty() {
            scan_all_lock_keys(snapshot.as_ref(), start_ts)?
        } else {
            keys.to_vec()
        };

        let mut batch = WriteBatch::new();
        for key in &targets {
            let lock_key = encode_plain_key(NS_TXN, key);
            let Some(lock) = read_lock(snapshot.as_ref(), &lock_key)? else {
                continue;
            };
            if lock.start_ts != start_ts {
                continue;
            }
            if commit_ts > 0 {
                let record = WriteRecord::with_short_value(
                    start_ts,
                    WriteKind::from_lock_type(lock.lock_type),
                    lock.short_value.clone(),
                );
                batch.put(CF_WRITE, encode_key(NS_TXN, key, commit_ts), record.encode());
                batch.delete(CF_LOCK, lock_key);
            } else {
                self.rollback_one(snapshot.as_ref(), &mut batch, key, start_ts)?;
            }
        }
        if !batch.is_empty() {
            self.submitter.submit(batch)?;
        }
        Ok(())
    }

    /// Probe secondary keys for a decided primary.
    pub fn check_secondary_locks(
        &self,
        keys: &[Vec<u8>],
        start_ts: Ts,
    ) -> KiteResult<CheckSecondaryResult> {
        let snapshot = self.engine.snapshot();
        let mut result = CheckSecondaryResult::default();
        for key in keys {
            let lock_key = encode_plain_key(NS_TXN, key);
            if let Some(lock) = read_lock(snapshot.as_ref(), &lock_key)? {
                if lock.start_ts == start_ts {
                    result.locks.push(lock);
                    continue;
                }
            }
            match find_write_by_start_ts(snapshot.as_ref(), key, start_ts)? {
                Some((_, rec)) if rec.kind == WriteKind::Rollback => result.rolled_back = true,
                Some((commit_ts, _)) => result.commit_ts = commit_ts,
                None => result.rolled_back = true,
            }
        }
        Ok(result)
    }

    /// Extend the primary lock's TTL. Returns the TTL now in force.
    pub fn heart_beat(
        &self,
        primary_key: &[u8],
        start_ts: Ts,
        advise_ttl_ms: u64,
    ) -> KiteResult<u64> {
        let snapshot = self.engine.snapshot();
        let lock_key = encode_plain_key(NS_TXN, primary_key);
        let Some(mut lock) = read_lock(snapshot.as_ref(), &lock_key)? else {
            return Err(TxnError::LockNotFound {
                start_ts,
                key_hex: hex(primary_key),
            }
            .into());
        };
        if lock.start_ts != start_ts {
            return Err(TxnError::LockNotFound {
                start_ts,
                key_hex: hex(primary_key),
            }
            .into());
        }
        lock.ttl_ms = lock.ttl_ms.max(advise_ttl_ms);
        let ttl = lock.ttl_ms;
        let mut batch = WriteBatch::new();
        batch.put(CF_LOCK, lock_key, lock.encode());
        self.submitter.submit(batch)?;
        Ok(ttl)
    }
}

pub(crate) fn read_lock(
    snapshot: &dyn EngineSnapshot,
    lock_key: &[u8],
) -> KiteResult<Option<LockInfo>> {
    let Some(raw) = snapshot.get(CF_LOCK, lock_key)? else {
        return Ok(None);
    };
    let lock = LockInfo::decode(&raw).ok_or_else(|| RawError::Corruption {
        key_hex: hex(lock_key),
        detail: "undecodable lock".into(),
    })?;
    Ok(Some(lock))
}

/// Newest write record of a plain key, any kind.
pub(crate) fn latest_write(
    snapshot: &dyn EngineSnapshot,
    plain_key: &[u8],
) -> KiteResult<Option<(Ts, WriteRecord)>> {
    let mut iter = snapshot.iter(CF_WRITE, IteratorOptions::default())?;
    iter.seek(&encode_key(NS_TXN, plain_key, MAX_TS));
    if !iter.valid() {
        return Ok(None);
    }
    let (_, plain, commit_ts) = kite_mvcc::codec::decode_key(iter.key())?;
    if plain != plain_key {
        return Ok(None);
    }
    let rec = WriteRecord::decode(iter.value()).ok_or_else(|| RawError::Corruption {
        key_hex: hex(iter.key()),
        detail: "undecodable write record".into(),
    })?;
    Ok(Some((commit_ts, rec)))
}

/// Walk a key's write records newest-first looking for one produced by
/// `start_ts`.
pub(crate) fn find_write_by_start_ts(
    snapshot: &dyn EngineSnapshot,
    plain_key: &[u8],
    start_ts: Ts,
) -> KiteResult<Option<(Ts, WriteRecord)>> {
    let mut iter = snapshot.iter(CF_WRITE, IteratorOptions::default())?;
    iter.seek(&encode_key(NS_TXN, plain_key, MAX_TS));
    while iter.valid() {
        let (_, plain, commit_ts) = kite_mvcc::codec::decode_key(iter.key())?;
        if plain != plain_key {
            return Ok(None);
        }
        let rec = WriteRecord::decode(iter.value()).ok_or_else(|| RawError::Corruption {
            key_hex: hex(iter.key()),
            detail: "undecodable write record".into(),
        })?;
        if rec.start_ts == start_ts {
            return Ok(Some((commit_ts, rec)));
        }
        if commit_ts < start_ts {
            // Older records can only carry older start timestamps.
            return Ok(None);
        }
        iter.next();
    }
    Ok(None)
}

/// Committed value of `key` visible at `ts`, resolving short values and
/// `data` CF payloads.
pub(crate) fn read_committed_value(
    snapshot: &dyn EngineSnapshot,
    plain_key: &[u8],
    ts: Ts,
) -> KiteResult<Option<Vec<u8>>> {
    let mut iter = snapshot.iter(CF_WRITE, IteratorOptions::default())?;
    iter.seek(&encode_key(NS_TXN, plain_key, ts));
    while iter.valid() {
        let (_, plain, _) = kite_mvcc::codec::decode_key(iter.key())?;
        if plain != plain_key {
            return Ok(None);
        }
        let rec = WriteRecord::decode(iter.value()).ok_or_else(|| RawError::Corruption {
            key_hex: hex(iter.key()),
            detail: "undecodable write record".into(),
        })?;
        match rec.kind {
            WriteKind::Put => {
                if let Some(short) = rec.short_value {
                    return Ok(Some(short));
                }
                let data_key = encode_key(NS_TXN, plain_key, rec.start_ts);
                let Some(raw) = snapshot.get(CF_DATA, &data_key)? else {
                    return Err(RawError::Corruption {
                        key_hex: hex(&data_key),
                        detail: "write record points at missing payload".into(),
                    }
                    .into());
                };
                let (flag, payload) = unpack_value(&raw)?;
                return Ok((flag != ValueFlag::Tombstone).then(|| payload.to_vec()));
            }
            WriteKind::Delete => return Ok(None),
            // Rollback markers and lock records carry no value.
            WriteKind::Rollback | WriteKind::Lock => iter.next(),
        }
    }
    Ok(None)
}

fn scan_all_lock_keys(
    snapshot: &dyn EngineSnapshot,
    start_ts: Ts,
) -> KiteResult<Vec<Vec<u8>>> {
    let mut iter = snapshot.iter(
        CF_LOCK,
        IteratorOptions::bounded(vec![NS_TXN], vec![NS_TXN + 1]),
    )?;
    iter.seek(&[NS_TXN]);
    let mut out = Vec::new();
    while iter.valid() {
        if let Some(lock) = LockInfo::decode(iter.value()) {
            if lock.start_ts == start_ts {
                out.push(lock.key.clone());
            }
        }
        iter.next();
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kite_common::error::ErrorCode;
    use kite_common::types::compose_ts;
    use kite_storage::MemoryEngine;

    fn engine() -> TxnEngine {
        TxnEngine::direct(Arc::new(MemoryEngine::new()))
    }

    fn prewrite_put(txn: &TxnEngine, key: &[u8], value: &[u8], start_ts: Ts) -> KiteResult<PrewriteResult> {
        txn.prewrite(&PrewriteRequest {
            mutations: vec![Mutation::put(key.to_vec(), value.to_vec())],
            primary_lock: key.to_vec(),
            start_ts,
            lock_ttl_ms: 3000,
            txn_size: 1,
            ..Default::default()
        })
    }

    fn get(txn: &TxnEngine, ts: Ts, key: &[u8]) -> Option<Vec<u8>> {
        read_committed_value(txn.raw_engine().snapshot().as_ref(), key, ts).unwrap()
    }

    #[test]
    fn test_prewrite_commit_visibility() {
        let txn = engine();
        prewrite_put(&txn, b"x", b"A", 10).unwrap();
        txn.commit(10, 20, &[b"x".to_vec()]).unwrap();

        assert_eq!(get(&txn, 20, b"x"), Some(b"A".to_vec()));
        assert_eq!(get(&txn, 19, b"x"), None);
        assert_eq!(get(&txn, MAX_TS, b"x"), Some(b"A".to_vec()));
    }

    #[test]
    fn test_long_value_goes_through_data_cf() {
        let txn = engine();
        let value = vec![7u8; SHORT_VALUE_LIMIT + 1];
        prewrite_put(&txn, b"big", &value, 10).unwrap();
        txn.commit(10, 20, &[b"big".to_vec()]).unwrap();
        assert_eq!(get(&txn, 20, b"big"), Some(value));
    }

    #[test]
    fn test_idempotent_commit() {
        let txn = engine();
        prewrite_put(&txn, b"x", b"A", 10).unwrap();
        txn.commit(10, 20, &[b"x".to_vec()]).unwrap();
        txn.commit(10, 20, &[b"x".to_vec()]).unwrap();

        // Exactly one write record at (x, 20).
        let snapshot = txn.raw_engine().snapshot();
        let slot = snapshot
            .get(CF_WRITE, &encode_key(NS_TXN, b"x", 20))
            .unwrap();
        assert!(slot.is_some());
        assert_eq!(
            find_write_by_start_ts(snapshot.as_ref(), b"x", 10)
                .unwrap()
                .unwrap()
                .0,
            20
        );
    }

    #[test]
    fn test_idempotent_prewrite() {
        let txn = engine();
        prewrite_put(&txn, b"x", b"A", 10).unwrap();
        prewrite_put(&txn, b"x", b"A", 10).unwrap();
        txn.commit(10, 20, &[b"x".to_vec()]).unwrap();
        assert_eq!(get(&txn, 20, b"x"), Some(b"A".to_vec()));
    }

    #[test]
    fn test_write_conflict() {
        let txn = engine();
        prewrite_put(&txn, b"k", b"v1", 10).unwrap();
        txn.commit(10, 20, &[b"k".to_vec()]).unwrap();

        let err = prewrite_put(&txn, b"k", b"v2", 15).unwrap_err();
        assert_eq!(err.code(), ErrorCode::WriteConflict);
    }

    #[test]
    fn test_lock_conflict_returns_lock_info() {
        let txn = engine();
        prewrite_put(&txn, b"k", b"v1", 10).unwrap();
        let err = prewrite_put(&txn, b"k", b"v2", 11).unwrap_err();
        assert_eq!(err.code(), ErrorCode::KeyIsLocked);
        let lock = err.lock_info().unwrap();
        assert_eq!(lock.start_ts, 10);
        assert_eq!(lock.primary_lock, b"k".to_vec());
    }

    #[test]
    fn test_rollback_blocks_commit() {
        let txn = engine();
        prewrite_put(&txn, b"k", b"v", 10).unwrap();
        txn.batch_rollback(10, &[b"k".to_vec()]).unwrap();

        let err = txn.commit(10, 30, &[b"k".to_vec()]).unwrap_err();
        assert!(matches!(
            err.code(),
            ErrorCode::TxnLockNotFound | ErrorCode::TxnNotFound
        ));
        assert_eq!(get(&txn, MAX_TS, b"k"), None);
    }

    #[test]
    fn test_double_rollback_is_success() {
        let txn = engine();
        prewrite_put(&txn, b"k", b"v", 10).unwrap();
        txn.batch_rollback(10, &[b"k".to_vec()]).unwrap();
        txn.batch_rollback(10, &[b"k".to_vec()]).unwrap();
    }

    #[test]
    fn test_commit_ts_must_exceed_start_ts() {
        let txn = engine();
        prewrite_put(&txn, b"k", b"v", 10).unwrap();
        assert!(txn.commit(10, 10, &[b"k".to_vec()]).is_err());
    }

    #[test]
    fn test_commit_unknown_txn() {
        let txn = engine();
        let err = txn.commit(10, 20, &[b"ghost".to_vec()]).unwrap_err();
        assert_eq!(err.code(), ErrorCode::TxnNotFound);
    }

    #[test]
    fn test_pessimistic_flow() {
        let txn = engine();
        let values = txn
            .pessimistic_lock(&PessimisticLockRequest {
                keys: vec![b"k".to_vec()],
                primary_lock: b"k".to_vec(),
                start_ts: 10,
                for_update_ts: 12,
                lock_ttl_ms: 3000,
                return_values: true,
            })
            .unwrap();
        assert_eq!(values, vec![None]);

        // Prewrite with the pessimistic flag converts the lock.
        txn.prewrite(&PrewriteRequest {
            mutations: vec![Mutation::put(b"k".to_vec(), b"v".to_vec())],
            primary_lock: b"k".to_vec(),
            start_ts: 10,
            lock_ttl_ms: 3000,
            txn_size: 1,
            pessimistic_flags: vec![true],
            for_update_ts_checks: vec![12],
            ..Default::default()
        })
        .unwrap();
        txn.commit(10, 20, &[b"k".to_vec()]).unwrap();
        assert_eq!(get(&txn, 20, b"k"), Some(b"v".to_vec()));
    }

    #[test]
    fn test_pessimistic_prewrite_without_lock_fails() {
        let txn = engine();
        let err = txn
            .prewrite(&PrewriteRequest {
                mutations: vec![Mutation::put(b"k".to_vec(), b"v".to_vec())],
                primary_lock: b"k".to_vec(),
                start_ts: 10,
                pessimistic_flags: vec![true],
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::PessimisticLockNotFound);
    }

    #[test]
    fn test_pessimistic_lock_write_conflict() {
        let txn = engine();
        prewrite_put(&txn, b"k", b"v", 10).unwrap();
        txn.commit(10, 20, &[b"k".to_vec()]).unwrap();

        let err = txn
            .pessimistic_lock(&PessimisticLockRequest {
                keys: vec![b"k".to_vec()],
                primary_lock: b"k".to_vec(),
                start_ts: 15,
                for_update_ts: 15,
                lock_ttl_ms: 3000,
                return_values: false,
            })
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::WriteConflict);
    }

    #[test]
    fn test_pessimistic_rollback() {
        let txn = engine();
        txn.pessimistic_lock(&PessimisticLockRequest {
            keys: vec![b"k".to_vec()],
            primary_lock: b"k".to_vec(),
            start_ts: 10,
            for_update_ts: 10,
            lock_ttl_ms: 3000,
            return_values: false,
        })
        .unwrap();
        txn.pessimistic_rollback(10, 10, &[b"k".to_vec()]).unwrap();

        // The key is free again for another txn.
        prewrite_put(&txn, b"k", b"v", 11).unwrap();
    }

    #[test]
    fn test_check_txn_status_alive_lock() {
        let txn = engine();
        let start_ts = compose_ts(1000, 0);
        prewrite_put(&txn, b"p", b"v", start_ts).unwrap();

        let current = compose_ts(1500, 0);
        let status = txn.check_txn_status(b"p", start_ts, 0, current).unwrap();
        assert!(matches!(status, TxnStatus::Locked { .. }));
    }

    #[test]
    fn test_check_txn_status_expired_lock_rolls_back() {
        let txn = engine();
        let start_ts = compose_ts(1000, 0);
        prewrite_put(&txn, b"p", b"v", start_ts).unwrap();

        let current = compose_ts(1000 + 10_000, 0);
        let status = txn.check_txn_status(b"p", start_ts, 0, current).unwrap();
        assert_eq!(status, TxnStatus::TtlExpired);

        // The primary is now terminally rolled back.
        let again = txn.check_txn_status(b"p", start_ts, 0, current).unwrap();
        assert_eq!(again, TxnStatus::RolledBack);
    }

    #[test]
    fn test_check_txn_status_zero_current_ts_is_probe() {
        let txn = engine();
        let start_ts = compose_ts(1000, 0);
        prewrite_put(&txn, b"p", b"v", start_ts).unwrap();

        // A zero current_ts can never expire a live lock.
        let status = txn.check_txn_status(b"p", start_ts, 0, 0).unwrap();
        assert!(matches!(status, TxnStatus::Locked { .. }));
    }

    #[test]
    fn test_check_txn_status_committed() {
        let txn = engine();
        prewrite_put(&txn, b"p", b"v", 10).unwrap();
        txn.commit(10, 20, &[b"p".to_vec()]).unwrap();
        let status = txn.check_txn_status(b"p", 10, 0, 30).unwrap();
        assert_eq!(status, TxnStatus::Committed { commit_ts: 20 });
    }

    #[test]
    fn test_check_txn_status_inserts_fencing_rollback() {
        let txn = engine();
        let status = txn.check_txn_status(b"p", 10, 0, 30).unwrap();
        assert_eq!(status, TxnStatus::LockNotExistRollback);

        // A late prewrite of that txn now conflicts.
        let err = prewrite_put(&txn, b"p", b"v", 10).unwrap_err();
        assert_eq!(err.code(), ErrorCode::WriteConflict);
    }

    #[test]
    fn test_resolve_lock_commit_and_rollback() {
        let txn = engine();
        txn.prewrite(&PrewriteRequest {
            mutations: vec![
                Mutation::put(b"a".to_vec(), b"1".to_vec()),
                Mutation::put(b"b".to_vec(), b"2".to_vec()),
            ],
            primary_lock: b"a".to_vec(),
            start_ts: 10,
            lock_ttl_ms: 3000,
            txn_size: 2,
            secondaries: vec![b"b".to_vec()],
            ..Default::default()
        })
        .unwrap();

        // Commit via resolve (no explicit key list: sweep the lock CF).
        txn.resolve_lock(10, 20, &[]).unwrap();
        assert_eq!(get(&txn, 20, b"a"), Some(b"1".to_vec()));
        assert_eq!(get(&txn, 20, b"b"), Some(b"2".to_vec()));

        prewrite_put(&txn, b"c", b"3", 30).unwrap();
        txn.resolve_lock(30, 0, &[b"c".to_vec()]).unwrap();
        assert_eq!(get(&txn, MAX_TS, b"c"), None);
        let err = txn.commit(30, 40, &[b"c".to_vec()]).unwrap_err();
        assert!(matches!(
            err.code(),
            ErrorCode::TxnLockNotFound | ErrorCode::TxnNotFound
        ));
    }

    #[test]
    fn test_check_secondary_locks() {
        let txn = engine();
        txn.prewrite(&PrewriteRequest {
            mutations: vec![
                Mutation::put(b"p".to_vec(), b"1".to_vec()),
                Mutation::put(b"s".to_vec(), b"2".to_vec()),
            ],
            primary_lock: b"p".to_vec(),
            start_ts: 10,
            lock_ttl_ms: 3000,
            txn_size: 2,
            secondaries: vec![b"s".to_vec()],
            ..Default::default()
        })
        .unwrap();

        let probe = txn.check_secondary_locks(&[b"s".to_vec()], 10).unwrap();
        assert_eq!(probe.locks.len(), 1);
        assert!(!probe.rolled_back);

        txn.commit(10, 20, &[b"p".to_vec(), b"s".to_vec()]).unwrap();
        let probe = txn.check_secondary_locks(&[b"s".to_vec()], 10).unwrap();
        assert!(probe.locks.is_empty());
        assert_eq!(probe.commit_ts, 20);
    }

    #[test]
    fn test_heart_beat() {
        let txn = engine();
        prewrite_put(&txn, b"p", b"v", 10).unwrap();
        let ttl = txn.heart_beat(b"p", 10, 9000).unwrap();
        assert_eq!(ttl, 9000);

        // Smaller advice never shrinks the TTL.
        let ttl = txn.heart_beat(b"p", 10, 100).unwrap();
        assert_eq!(ttl, 9000);

        let err = txn.heart_beat(b"p", 99, 9000).unwrap_err();
        assert_eq!(err.code(), ErrorCode::TxnLockNotFound);
    }

    #[test]
    fn test_one_pc() {
        let txn = engine();
        let result = txn
            .prewrite(&PrewriteRequest {
                mutations: vec![Mutation::put(b"k".to_vec(), b"v".to_vec())],
                primary_lock: b"k".to_vec(),
                start_ts: 10,
                try_one_pc: true,
                min_commit_ts: 15,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(result.one_pc_commit_ts, 15);
        assert_eq!(get(&txn, 15, b"k"), Some(b"v".to_vec()));
        // No lock left behind.
        let snapshot = txn.raw_engine().snapshot();
        assert!(read_lock(snapshot.as_ref(), &encode_plain_key(NS_TXN, b"k"))
            .unwrap()
            .is_none());
    }
}
