//! Core type definitions for tierio
//!
//! This module defines the identifiers and per-write options shared by the
//! worker, the placement layer and the client.

use crate::error::{Error, Result};
use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Globally unique block identifier, issued by the master before a write begins
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into, Display,
)]
#[display("{_0}")]
pub struct BlockId(u64);

impl BlockId {
    /// Wrap a raw 64-bit id
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw id
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({})", self.0)
    }
}

/// Unique identifier for a worker node
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into)]
pub struct WorkerId(Uuid);

impl WorkerId {
    /// Generate a new random worker ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from existing UUID
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Create from bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Get as bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WorkerId({})", self.0)
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle for an open write session or read handle on a worker
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, From, Into, Display)]
#[display("session-{_0}")]
pub struct SessionId(u64);

impl SessionId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
}

/// Persistence behaviour requested for a block
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteType {
    /// Never leaves the tier; lost if evicted or if the worker dies
    CacheOnly,
    /// Acknowledged once committed to the tier, flushed to the UFS in the background
    #[default]
    AsyncThrough,
    /// Flushed to the UFS before the commit is acknowledged
    MustCacheAndThrough,
}

impl WriteType {
    /// Whether the block is expected to end up in the UFS
    #[must_use]
    pub const fn requires_persistence(&self) -> bool {
        !matches!(self, Self::CacheOnly)
    }

    /// Whether the UFS write happens before commit
    #[must_use]
    pub const fn is_synchronous(&self) -> bool {
        matches!(self, Self::MustCacheAndThrough)
    }
}

impl fmt::Display for WriteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CacheOnly => write!(f, "cache_only"),
            Self::AsyncThrough => write!(f, "async_through"),
            Self::MustCacheAndThrough => write!(f, "must_cache_and_through"),
        }
    }
}

/// Which placement variant picks the workers for a new block
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "worker")]
pub enum LocationPolicyKind {
    /// Prefer the client's co-located worker, then remote candidates
    #[default]
    LocalFirst,
    /// Rank by free space in the write tier, descending
    MostAvailable,
    /// Rotate across candidates ordered by worker id
    RoundRobin,
    /// Only the named worker
    SpecificWorker(WorkerId),
    /// Rendezvous hashing of the block id
    DeterministicHash,
}

/// Options for writing one block, fixed for the duration of that write
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteRequest {
    /// Signed tier index: 0 is the fastest tier, -1 the slowest
    pub tier: i32,
    /// Upper bound on the block length
    pub block_size: u64,
    /// Bytes reserved up front (never more than `block_size`)
    pub expected_length: u64,
    pub write_type: WriteType,
    pub replication_min: u32,
    pub replication_max: u32,
    pub replication_durable: u32,
    pub location_policy: LocationPolicyKind,
    /// UFS location; only the primary replica carries one
    pub ufs_path: Option<String>,
    /// Number of workers the client actually placed this block on
    pub target_replicas: u32,
}

impl WriteRequest {
    /// Create a request with the given block size and defaults for everything else
    #[must_use]
    pub fn new(block_size: u64) -> Self {
        Self {
            tier: 0,
            block_size,
            expected_length: block_size,
            write_type: WriteType::default(),
            replication_min: 0,
            replication_max: 1,
            replication_durable: 1,
            location_policy: LocationPolicyKind::default(),
            ufs_path: None,
            target_replicas: 1,
        }
    }

    #[must_use]
    pub const fn with_tier(mut self, tier: i32) -> Self {
        self.tier = tier;
        self
    }

    #[must_use]
    pub const fn with_write_type(mut self, write_type: WriteType) -> Self {
        self.write_type = write_type;
        self
    }

    #[must_use]
    pub const fn with_expected_length(mut self, expected_length: u64) -> Self {
        self.expected_length = expected_length;
        self
    }

    #[must_use]
    pub const fn with_replication(mut self, min: u32, max: u32, durable: u32) -> Self {
        self.replication_min = min;
        self.replication_max = max;
        self.replication_durable = durable;
        self
    }

    #[must_use]
    pub const fn with_location_policy(mut self, policy: LocationPolicyKind) -> Self {
        self.location_policy = policy;
        self
    }

    #[must_use]
    pub fn with_ufs_path(mut self, path: impl Into<String>) -> Self {
        self.ufs_path = Some(path.into());
        self
    }

    #[must_use]
    pub const fn with_target_replicas(mut self, replicas: u32) -> Self {
        self.target_replicas = replicas;
        self
    }

    /// Check the request is internally consistent
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(Error::invalid_argument("block size must be positive"));
        }
        if self.expected_length > self.block_size {
            return Err(Error::invalid_argument(format!(
                "expected length {} exceeds block size {}",
                self.expected_length, self.block_size
            )));
        }
        if self.replication_min > self.replication_max {
            return Err(Error::invalid_argument(format!(
                "replication min {} exceeds replication max {}",
                self.replication_min, self.replication_max
            )));
        }
        Ok(())
    }

    /// True when fewer replicas were placed than the minimum asks for
    #[must_use]
    pub const fn is_under_replicated(&self) -> bool {
        self.target_replicas < self.replication_min
    }
}

/// Map a signed tier index onto `count` tiers ordered fastest first.
///
/// Non-negative values count from the top and clamp to the last tier;
/// negative values count from the bottom (-1 is the slowest tier) and clamp
/// to the first tier.
#[must_use]
pub fn resolve_tier_index(tier: i32, count: usize) -> Option<usize> {
    if count == 0 {
        return None;
    }
    if tier >= 0 {
        let idx = usize::try_from(tier).unwrap_or(usize::MAX);
        Some(idx.min(count - 1))
    } else {
        let back = usize::try_from(tier.unsigned_abs()).unwrap_or(usize::MAX);
        Some(count.saturating_sub(back))
    }
}

/// Space accounting for one tier
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierUsage {
    /// Tier alias (e.g. "MEM", "SSD", "HDD")
    pub alias: String,
    pub capacity: u64,
    pub used: u64,
}

impl TierUsage {
    #[must_use]
    pub const fn available(&self) -> u64 {
        self.capacity.saturating_sub(self.used)
    }
}
