//! Error taxonomy for the store core.
//!
//! Every error carries a stable [`ErrorCode`] plus a human-readable message.
//! Layer-specific enums (`RawError`, `TxnError`, `RegionError`) convert into
//! the top-level [`KiteError`]; callers match on `code()` for dispatch and on
//! `kind()` for retry decisions.

use thiserror::Error;

use crate::txn::LockInfo;
use crate::types::{RegionId, Ts};

/// Convenience alias used across the workspace.
pub type KiteResult<T> = Result<T, KiteError>;

/// Stable error codes surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // Not-found
    KeyNotFound,
    RegionNotFound,
    RaftNotFound,
    VectorIndexNotFound,
    VectorScalarDataNotFound,
    // Leadership / placement
    NotLeader,
    RegionIdNotMatch,
    RegionVersionChanged,
    // Validation
    IllegalParameters,
    KeyEmpty,
    RangeEmptyOrInverted,
    // Transactional conflict
    WriteConflict,
    KeyIsLocked,
    TxnLockNotFound,
    TxnNotFound,
    PessimisticLockNotFound,
    TtlExpired,
    // Capacity / policy
    DisableChange,
    ClusterReadOnly,
    VectorNotSupport,
    // Infrastructure
    Internal,
    Timeout,
    TransferLeaderFailed,
    RaftInitFailed,
    TsUnavailable,
}

/// Classification for retry/escalation decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input; retrying the same request cannot succeed.
    Invalid,
    /// Conflict or placement change; the client should retry.
    Retryable,
    /// Resource or timing issue; the client may retry after back-off.
    Transient,
    /// Should never happen; logged with full context.
    Internal,
}

/// Storage-layer errors.
#[derive(Error, Debug)]
pub enum RawError {
    #[error("key not found")]
    KeyNotFound,

    #[error("empty key")]
    KeyEmpty,

    #[error("range empty or inverted")]
    RangeEmptyOrInverted,

    #[error("column family not found: {0}")]
    CfNotFound(String),

    #[error("illegal parameters: {0}")]
    IllegalParameters(String),

    #[error("data corruption at key {key_hex}: {detail}")]
    Corruption { key_hex: String, detail: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(String),
}

impl RawError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RawError::KeyNotFound => ErrorCode::KeyNotFound,
            RawError::KeyEmpty => ErrorCode::KeyEmpty,
            RawError::RangeEmptyOrInverted => ErrorCode::RangeEmptyOrInverted,
            RawError::CfNotFound(_) | RawError::IllegalParameters(_) => {
                ErrorCode::IllegalParameters
            }
            RawError::Corruption { .. } | RawError::Io(_) | RawError::Codec(_) => {
                ErrorCode::Internal
            }
        }
    }
}

/// Transaction-layer errors.
#[derive(Error, Debug)]
pub enum TxnError {
    #[error("write conflict on key {key_hex}: committed at {conflict_ts}, txn started at {start_ts}")]
    WriteConflict {
        start_ts: Ts,
        conflict_ts: Ts,
        key_hex: String,
    },

    #[error("key is locked by txn {}", .lock.start_ts)]
    KeyIsLocked { lock: Box<LockInfo> },

    #[error("lock of txn {start_ts} not found on key {key_hex}")]
    LockNotFound { start_ts: Ts, key_hex: String },

    #[error("txn {start_ts} not found for key {key_hex}")]
    TxnNotFound { start_ts: Ts, key_hex: String },

    #[error("pessimistic lock of txn {start_ts} not found on key {key_hex}")]
    PessimisticLockNotFound { start_ts: Ts, key_hex: String },

    #[error("lock of txn {start_ts} expired")]
    TtlExpired { start_ts: Ts },
}

impl TxnError {
    pub fn code(&self) -> ErrorCode {
        match self {
            TxnError::WriteConflict { .. } => ErrorCode::WriteConflict,
            TxnError::KeyIsLocked { .. } => ErrorCode::KeyIsLocked,
            TxnError::LockNotFound { .. } => ErrorCode::TxnLockNotFound,
            TxnError::TxnNotFound { .. } => ErrorCode::TxnNotFound,
            TxnError::PessimisticLockNotFound { .. } => ErrorCode::PessimisticLockNotFound,
            TxnError::TtlExpired { .. } => ErrorCode::TtlExpired,
        }
    }
}

/// Region / consensus layer errors.
#[derive(Error, Debug)]
pub enum RegionError {
    #[error("region {0} not found")]
    RegionNotFound(RegionId),

    #[error("raft node for region {0} not found")]
    RaftNotFound(RegionId),

    #[error("not leader of region {region_id}, leader hint: {leader_hint:?}")]
    NotLeader {
        region_id: RegionId,
        leader_hint: Option<String>,
    },

    #[error("region id mismatch: request {request}, actual {actual}")]
    RegionIdNotMatch { request: RegionId, actual: RegionId },

    #[error("region {region_id} version changed: expect {expect}, actual {actual}")]
    RegionVersionChanged {
        region_id: RegionId,
        expect: u64,
        actual: u64,
    },

    #[error("region {0} change disabled")]
    DisableChange(RegionId),

    #[error("cluster is read-only: {0}")]
    ClusterReadOnly(String),

    #[error("vector operation not supported: {0}")]
    VectorNotSupport(String),

    #[error("vector index of region {0} not found")]
    VectorIndexNotFound(RegionId),

    #[error("scalar data of vector {0} not found")]
    VectorScalarDataNotFound(u64),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("transfer leader failed: {0}")]
    TransferLeaderFailed(String),

    #[error("raft init failed for region {region_id}: {detail}")]
    RaftInitFailed { region_id: RegionId, detail: String },
}

impl RegionError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RegionError::RegionNotFound(_) => ErrorCode::RegionNotFound,
            RegionError::RaftNotFound(_) => ErrorCode::RaftNotFound,
            RegionError::NotLeader { .. } => ErrorCode::NotLeader,
            RegionError::RegionIdNotMatch { .. } => ErrorCode::RegionIdNotMatch,
            RegionError::RegionVersionChanged { .. } => ErrorCode::RegionVersionChanged,
            RegionError::DisableChange(_) => ErrorCode::DisableChange,
            RegionError::ClusterReadOnly(_) => ErrorCode::ClusterReadOnly,
            RegionError::VectorNotSupport(_) => ErrorCode::VectorNotSupport,
            RegionError::VectorIndexNotFound(_) => ErrorCode::VectorIndexNotFound,
            RegionError::VectorScalarDataNotFound(_) => ErrorCode::VectorScalarDataNotFound,
            RegionError::Timeout(_) => ErrorCode::Timeout,
            RegionError::TransferLeaderFailed(_) => ErrorCode::TransferLeaderFailed,
            RegionError::RaftInitFailed { .. } => ErrorCode::RaftInitFailed,
        }
    }
}

/// Top-level error type that all layer errors convert into.
#[derive(Error, Debug)]
pub enum KiteError {
    #[error("storage error: {0}")]
    Raw(#[from] RawError),

    #[error("txn error: {0}")]
    Txn(#[from] TxnError),

    #[error("region error: {0}")]
    Region(#[from] RegionError),

    #[error("timestamp unavailable after {retries} retries")]
    TsUnavailable { retries: u32 },

    #[error("internal error: {0}")]
    Internal(String),
}

impl KiteError {
    pub fn code(&self) -> ErrorCode {
        match self {
            KiteError::Raw(e) => e.code(),
            KiteError::Txn(e) => e.code(),
            KiteError::Region(e) => e.code(),
            KiteError::TsUnavailable { .. } => ErrorCode::TsUnavailable,
            KiteError::Internal(_) => ErrorCode::Internal,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self.code() {
            ErrorCode::IllegalParameters
            | ErrorCode::KeyEmpty
            | ErrorCode::RangeEmptyOrInverted
            | ErrorCode::RegionIdNotMatch
            | ErrorCode::VectorNotSupport => ErrorKind::Invalid,

            ErrorCode::NotLeader
            | ErrorCode::RegionVersionChanged
            | ErrorCode::WriteConflict
            | ErrorCode::KeyIsLocked
            | ErrorCode::TtlExpired => ErrorKind::Retryable,

            ErrorCode::Timeout
            | ErrorCode::TsUnavailable
            | ErrorCode::ClusterReadOnly
            | ErrorCode::DisableChange => ErrorKind::Transient,

            ErrorCode::KeyNotFound
            | ErrorCode::RegionNotFound
            | ErrorCode::RaftNotFound
            | ErrorCode::VectorIndexNotFound
            | ErrorCode::VectorScalarDataNotFound
            | ErrorCode::TxnLockNotFound
            | ErrorCode::TxnNotFound
            | ErrorCode::PessimisticLockNotFound => ErrorKind::Invalid,

            ErrorCode::Internal
            | ErrorCode::TransferLeaderFailed
            | ErrorCode::RaftInitFailed => ErrorKind::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Retryable)
    }

    /// The lock blocking this operation, when the error carries one.
    pub fn lock_info(&self) -> Option<&LockInfo> {
        match self {
            KiteError::Txn(TxnError::KeyIsLocked { lock }) => Some(lock),
            _ => None,
        }
    }
}
