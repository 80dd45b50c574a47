//! In-memory worker for client tests

use crate::worker::WorkerDataPlane;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tierio_common::{BlockId, Error, Result, SessionId, TierUsage, WorkerId, WriteRequest};
use tierio_placement::WorkerInfo;

struct Write {
    block_id: BlockId,
    data: Vec<u8>,
}

struct Read {
    data: Bytes,
    position: usize,
}

pub(crate) struct FakeWorker {
    id: WorkerId,
    hostname: String,
    capacity: u64,
    next_session: AtomicU64,
    fail_writes: AtomicBool,
    chunks: AtomicU64,
    aborted: AtomicU64,
    blocks: Mutex<HashMap<BlockId, Bytes>>,
    writes: Mutex<HashMap<SessionId, Write>>,
    reads: Mutex<HashMap<SessionId, Read>>,
    requests: Mutex<Vec<WriteRequest>>,
}

impl FakeWorker {
    pub(crate) fn new(hostname: &str, capacity: u64) -> Arc<Self> {
        Arc::new(Self {
            id: WorkerId::new(),
            hostname: hostname.to_string(),
            capacity,
            next_session: AtomicU64::new(1),
            fail_writes: AtomicBool::new(false),
            chunks: AtomicU64::new(0),
            aborted: AtomicU64::new(0),
            blocks: Mutex::new(HashMap::new()),
            writes: Mutex::new(HashMap::new()),
            reads: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn id(&self) -> WorkerId {
        self.id
    }

    pub(crate) fn info(&self) -> WorkerInfo {
        let used: u64 = self.blocks.lock().values().map(|b| b.len() as u64).sum();
        WorkerInfo::new(
            self.id,
            self.hostname.clone(),
            vec![TierUsage {
                alias: "MEM".to_string(),
                capacity: self.capacity,
                used,
            }],
        )
    }

    pub(crate) fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn block(&self, block_id: BlockId) -> Option<Bytes> {
        self.blocks.lock().get(&block_id).cloned()
    }

    pub(crate) fn insert_block(&self, block_id: BlockId, data: Bytes) {
        self.blocks.lock().insert(block_id, data);
    }

    pub(crate) fn requests(&self) -> Vec<WriteRequest> {
        self.requests.lock().clone()
    }

    pub(crate) fn chunks_received(&self) -> u64 {
        self.chunks.load(Ordering::SeqCst)
    }

    pub(crate) fn aborted(&self) -> u64 {
        self.aborted.load(Ordering::SeqCst)
    }

    fn session(&self) -> SessionId {
        SessionId::new(self.next_session.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl WorkerDataPlane for FakeWorker {
    fn worker_id(&self) -> WorkerId {
        self.id
    }

    async fn create_block_write(
        &self,
        block_id: BlockId,
        request: WriteRequest,
    ) -> Result<SessionId> {
        if self.blocks.lock().contains_key(&block_id) {
            return Err(Error::BlockAlreadyExists(block_id));
        }
        self.requests.lock().push(request);
        let session = self.session();
        self.writes.lock().insert(
            session,
            Write {
                block_id,
                data: Vec::new(),
            },
        );
        Ok(session)
    }

    async fn write_chunk(&self, session: SessionId, offset: u64, data: Bytes) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::internal("injected write failure"));
        }
        let mut writes = self.writes.lock();
        let write = writes
            .get_mut(&session)
            .ok_or(Error::SessionNotFound(session))?;
        if offset != write.data.len() as u64 {
            return Err(Error::invalid_argument("out of order chunk"));
        }
        write.data.extend_from_slice(&data);
        self.chunks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn commit_block(&self, session: SessionId) -> Result<u64> {
        let write = self
            .writes
            .lock()
            .remove(&session)
            .ok_or(Error::SessionNotFound(session))?;
        let length = write.data.len() as u64;
        self.blocks
            .lock()
            .insert(write.block_id, Bytes::from(write.data));
        Ok(length)
    }

    async fn abort_block(&self, session: SessionId) -> Result<()> {
        self.writes
            .lock()
            .remove(&session)
            .ok_or(Error::SessionNotFound(session))?;
        self.aborted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn open_block_read(&self, block_id: BlockId, offset: u64) -> Result<SessionId> {
        let data = self.block(block_id).ok_or(Error::BlockNotFound(block_id))?;
        let session = self.session();
        let position = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
        self.reads.lock().insert(session, Read { data, position });
        Ok(session)
    }

    async fn read_chunk(&self, handle: SessionId, len: u64) -> Result<Bytes> {
        let mut reads = self.reads.lock();
        let read = reads
            .get_mut(&handle)
            .ok_or(Error::SessionNotFound(handle))?;
        let end = read
            .position
            .saturating_add(usize::try_from(len).unwrap_or(usize::MAX))
            .min(read.data.len());
        let chunk = read.data.slice(read.position..end);
        read.position = end;
        Ok(chunk)
    }

    async fn close_block_read(&self, handle: SessionId) -> Result<()> {
        self.reads
            .lock()
            .remove(&handle)
            .ok_or(Error::SessionNotFound(handle))?;
        Ok(())
    }
}
