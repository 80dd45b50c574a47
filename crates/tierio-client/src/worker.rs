//! Worker data plane as seen by a client

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tierio_common::{BlockId, Result, SessionId, WorkerId, WriteRequest};

/// Block operations a worker serves to clients.
///
/// Writes go through a session: create, stream chunks at strictly
/// sequential offsets, then commit or abort. Reads go through a handle
/// that pins the block against eviction until it is closed.
#[async_trait]
pub trait WorkerDataPlane: Send + Sync {
    fn worker_id(&self) -> WorkerId;

    /// Open a write session for a new block
    async fn create_block_write(&self, block_id: BlockId, request: WriteRequest)
    -> Result<SessionId>;

    /// Append a chunk; `offset` must equal the bytes accepted so far
    async fn write_chunk(&self, session: SessionId, offset: u64, data: Bytes) -> Result<()>;

    /// Commit the block; returns its final length
    async fn commit_block(&self, session: SessionId) -> Result<u64>;

    /// Discard the block and release its space
    async fn abort_block(&self, session: SessionId) -> Result<()>;

    /// Open a read handle positioned at `offset`
    async fn open_block_read(&self, block_id: BlockId, offset: u64) -> Result<SessionId>;

    /// Read up to `len` bytes from the handle; empty at end of block
    async fn read_chunk(&self, handle: SessionId, len: u64) -> Result<Bytes>;

    async fn close_block_read(&self, handle: SessionId) -> Result<()>;
}

/// Workers a client can reach, keyed by id
#[derive(Clone, Default)]
pub struct WorkerPool {
    workers: Arc<RwLock<BTreeMap<WorkerId, Arc<dyn WorkerDataPlane>>>>,
}

impl WorkerPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, worker: Arc<dyn WorkerDataPlane>) {
        self.workers.write().insert(worker.worker_id(), worker);
    }

    pub fn remove(&self, id: WorkerId) -> Option<Arc<dyn WorkerDataPlane>> {
        self.workers.write().remove(&id)
    }

    #[must_use]
    pub fn get(&self, id: WorkerId) -> Option<Arc<dyn WorkerDataPlane>> {
        self.workers.read().get(&id).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.read().is_empty()
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers.read().keys().collect::<Vec<_>>())
            .finish()
    }
}
