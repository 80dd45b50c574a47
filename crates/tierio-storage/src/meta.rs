//! Block metadata
//!
//! Each resident block has one [`BlockEntry`] in the store index. Its state
//! and location sit behind a per-block mutex; access statistics are atomics
//! so reads never contend with each other.

use crate::tier::DirRef;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tierio_common::{BlockId, WriteType};

/// Lifecycle state of a block on this worker
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockState {
    /// Space reserved, bytes still arriving; invisible to readers
    Allocating,
    /// Immutable and readable
    Committed,
    /// Chosen for removal or demotion
    Evicting,
}

impl BlockState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Allocating => "allocating",
            Self::Committed => "committed",
            Self::Evicting => "evicting",
        }
    }
}

/// Backing-store status of a block
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PersistState {
    /// Cache-only block or a secondary replica
    NotRequired,
    /// Background flush scheduled or running
    Pending,
    /// A durable copy exists in the UFS
    Persisted,
    /// Background flush gave up
    Failed,
}

impl PersistState {
    /// True when the tier holds the only copy of data that must be durable
    #[must_use]
    pub const fn is_sole_copy(&self) -> bool {
        matches!(self, Self::Pending | Self::Failed)
    }
}

/// Options fixed when a block is created
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockOptions {
    pub write_type: WriteType,
    /// Set only on the primary replica of a persisting write
    pub ufs_path: Option<String>,
    /// Workers the client placed this block on
    pub target_replicas: u32,
    pub replication_min: u32,
}

impl BlockOptions {
    #[must_use]
    pub fn cache_only() -> Self {
        Self {
            write_type: WriteType::CacheOnly,
            ufs_path: None,
            target_replicas: 1,
            replication_min: 0,
        }
    }

    #[must_use]
    pub const fn is_under_replicated(&self) -> bool {
        self.target_replicas < self.replication_min
    }
}

/// Point-in-time view of a block
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMeta {
    pub block_id: BlockId,
    pub location: DirRef,
    /// Bytes written so far; fixed once committed
    pub length: u64,
    pub state: BlockState,
    pub persist: PersistState,
    pub options: BlockOptions,
    /// crc32c of the block bytes, known once committed
    pub checksum: u32,
    pub last_access_ms: u64,
    /// Logical clock value of the last access, for LRU ordering
    pub last_access_seq: u64,
    pub access_count: u64,
}

/// Mutable part of an entry, guarded by the entry mutex
#[derive(Debug)]
pub(crate) struct EntryState {
    pub location: DirRef,
    pub length: u64,
    pub state: BlockState,
    pub persist: PersistState,
    pub options: BlockOptions,
    pub checksum: u32,
}

/// One block in the store index
#[derive(Debug)]
pub struct BlockEntry {
    block_id: BlockId,
    pub(crate) inner: Mutex<EntryState>,
    /// Open read handles; pinned blocks are never evicted
    readers: AtomicUsize,
    last_access_ms: AtomicU64,
    last_access_seq: AtomicU64,
    access_count: AtomicU64,
}

impl BlockEntry {
    pub(crate) fn new(block_id: BlockId, state: EntryState, seq: u64) -> Self {
        Self {
            block_id,
            inner: Mutex::new(state),
            readers: AtomicUsize::new(0),
            last_access_ms: AtomicU64::new(now_ms()),
            last_access_seq: AtomicU64::new(seq),
            access_count: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub const fn block_id(&self) -> BlockId {
        self.block_id
    }

    /// Record an access
    pub fn touch(&self, seq: u64) {
        self.last_access_ms.store(now_ms(), Ordering::Relaxed);
        self.last_access_seq.store(seq, Ordering::Relaxed);
        self.access_count.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn readers(&self) -> usize {
        self.readers.load(Ordering::Acquire)
    }

    /// Must be called with `inner` locked so eviction sees a consistent count
    pub(crate) fn pin(&self) {
        self.readers.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn unpin(&self) {
        let _ = self
            .readers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)));
    }

    #[must_use]
    pub fn state(&self) -> BlockState {
        self.inner.lock().state
    }

    /// Snapshot of the entry
    #[must_use]
    pub fn snapshot(&self) -> BlockMeta {
        let inner = self.inner.lock();
        BlockMeta {
            block_id: self.block_id,
            location: inner.location,
            length: inner.length,
            state: inner.state,
            persist: inner.persist,
            options: inner.options.clone(),
            checksum: inner.checksum,
            last_access_ms: self.last_access_ms.load(Ordering::Relaxed),
            last_access_seq: self.last_access_seq.load(Ordering::Relaxed),
            access_count: self.access_count.load(Ordering::Relaxed),
        }
    }
}

/// Milliseconds since the Unix epoch
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}
