//! Error types for tierio
//!
//! This module defines the common error types used throughout the system.

use crate::types::{BlockId, SessionId};
use thiserror::Error;

/// Common result type for tierio operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for tierio
#[derive(Debug, Error)]
pub enum Error {
    // Space errors
    #[error("no space available in tier {tier} for {required} bytes")]
    NoSpaceAvailable { tier: String, required: u64 },

    #[error("eviction failed in tier {tier}: could not free {required} bytes")]
    EvictionFailed { tier: String, required: u64 },

    // Block errors
    #[error("block not found: {0}")]
    BlockNotFound(BlockId),

    #[error("block already exists: {0}")]
    BlockAlreadyExists(BlockId),

    #[error("block {block_id} is {state}, expected {expected}")]
    InvalidBlockState {
        block_id: BlockId,
        state: &'static str,
        expected: &'static str,
    },

    #[error("block {0} is locked by readers")]
    BlockLocked(BlockId),

    #[error("block size exceeded: {written} bytes written, limit {limit}")]
    BlockSizeExceeded { written: u64, limit: u64 },

    // Persistence errors
    #[error("persist failed for block {block_id}: {reason}")]
    PersistFailed { block_id: BlockId, reason: String },

    #[error("under file system error: {0}")]
    Ufs(String),

    // Session errors
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("session {session} is {state}")]
    InvalidSessionState {
        session: SessionId,
        state: &'static str,
    },

    #[error("request timeout")]
    Timeout,

    // Master errors
    #[error("master unavailable: {0}")]
    MasterUnavailable(String),

    // Generic errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create an under file system error
    pub fn ufs(msg: impl Into<String>) -> Self {
        Self::Ufs(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Check if this is a retryable error
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::MasterUnavailable(_) | Self::Ufs(_) | Self::Io(_)
        )
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::BlockNotFound(_) | Self::SessionNotFound(_))
    }

    /// Short stable name of the error kind, used in logs and metrics
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::NoSpaceAvailable { .. } => "no_space_available",
            Self::EvictionFailed { .. } => "eviction_failed",
            Self::BlockNotFound(_) => "block_not_found",
            Self::BlockAlreadyExists(_) => "block_already_exists",
            Self::InvalidBlockState { .. } => "invalid_block_state",
            Self::BlockLocked(_) => "block_locked",
            Self::BlockSizeExceeded { .. } => "block_size_exceeded",
            Self::PersistFailed { .. } => "persist_failed",
            Self::Ufs(_) => "ufs",
            Self::SessionNotFound(_) => "session_not_found",
            Self::InvalidSessionState { .. } => "invalid_session_state",
            Self::Timeout => "timeout",
            Self::MasterUnavailable(_) => "master_unavailable",
            Self::Io(_) => "io",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::Configuration(_) => "configuration",
            Self::Internal(_) => "internal",
        }
    }

    /// Eviction failures surface to writers as plain space exhaustion
    #[must_use]
    pub fn into_space_error(self) -> Self {
        match self {
            Self::EvictionFailed { tier, required } => Self::NoSpaceAvailable { tier, required },
            other => other,
        }
    }
}
