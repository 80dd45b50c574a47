//! Block worker data plane
//!
//! Serves the client-facing block operations on top of the local block
//! store. Each write session and read handle sits behind its own async
//! mutex, so calls on one session are serialized while different sessions
//! run in parallel.

use crate::metrics::WorkerMetrics;
use crate::persist::{PersistCoordinator, PersistMode};
use crate::session::{ReadSession, SessionState, WriteSession};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tierio_client::WorkerDataPlane;
use tierio_common::config::SessionConfig;
use tierio_common::{BlockId, Error, Result, SessionId, WorkerId, WriteRequest};
use tierio_storage::{BlockOptions, BlockStore};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

type Shared<T> = Arc<Mutex<T>>;

/// One worker's block service
pub struct BlockWorker {
    id: WorkerId,
    hostname: String,
    store: Arc<BlockStore>,
    persist: Arc<PersistCoordinator>,
    metrics: Arc<WorkerMetrics>,
    writes: DashMap<SessionId, Shared<WriteSession>>,
    reads: DashMap<SessionId, Shared<ReadSession>>,
    next_session: AtomicU64,
    session_timeout: Duration,
}

impl BlockWorker {
    #[must_use]
    pub fn new(
        id: WorkerId,
        hostname: impl Into<String>,
        store: Arc<BlockStore>,
        persist: Arc<PersistCoordinator>,
        metrics: Arc<WorkerMetrics>,
        sessions: &SessionConfig,
    ) -> Self {
        Self {
            id,
            hostname: hostname.into(),
            store,
            persist,
            metrics,
            writes: DashMap::new(),
            reads: DashMap::new(),
            next_session: AtomicU64::new(1),
            session_timeout: sessions.timeout(),
        }
    }

    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    #[must_use]
    pub fn store(&self) -> &Arc<BlockStore> {
        &self.store
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<WorkerMetrics> {
        &self.metrics
    }

    #[must_use]
    pub fn persist(&self) -> &Arc<PersistCoordinator> {
        &self.persist
    }

    /// Write sessions not yet committed or aborted
    #[must_use]
    pub fn open_writes(&self) -> usize {
        self.writes.len()
    }

    #[must_use]
    pub fn open_reads(&self) -> usize {
        self.reads.len()
    }

    fn next_session_id(&self) -> SessionId {
        SessionId::new(self.next_session.fetch_add(1, Ordering::Relaxed))
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.session_timeout
    }

    fn write_session(&self, id: SessionId) -> Result<Shared<WriteSession>> {
        self.writes
            .get(&id)
            .map(|s| Arc::clone(s.value()))
            .ok_or(Error::SessionNotFound(id))
    }

    fn read_session(&self, id: SessionId) -> Result<Shared<ReadSession>> {
        self.reads
            .get(&id)
            .map(|s| Arc::clone(s.value()))
            .ok_or(Error::SessionNotFound(id))
    }

    /// Abort a session in place: release its space and forget it
    fn abort_session(&self, session: &mut WriteSession) {
        if session.transition(SessionState::Aborted).is_err() {
            return;
        }
        if let Some(writer) = session.take_writer() {
            self.store.abort_block(writer);
        }
        self.writes.remove(&session.id());
        WorkerMetrics::inc(&self.metrics.writes_aborted);
    }

    /// Abort the session when its deadline passed
    fn check_deadline(&self, session: &mut WriteSession) -> Result<()> {
        if session.is_expired(Instant::now()) {
            warn!(session = %session.id(), block_id = %session.block_id(), "write session deadline exceeded");
            WorkerMetrics::inc(&self.metrics.write_timeouts);
            self.abort_session(session);
            return Err(Error::Timeout);
        }
        Ok(())
    }

    /// Abort expired write sessions and close expired read handles
    pub async fn reap_expired(&self) -> usize {
        let now = Instant::now();
        let mut reaped = 0;

        let writes: Vec<_> = self
            .writes
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();
        for shared in writes {
            // A session busy with a call is not idle
            let Ok(mut session) = shared.try_lock() else {
                continue;
            };
            if session.is_expired(now) {
                info!(session = %session.id(), block_id = %session.block_id(), "reaping idle write session");
                self.abort_session(&mut session);
                reaped += 1;
            }
        }

        let expired_reads: Vec<SessionId> = self
            .reads
            .iter()
            .filter(|e| e.value().try_lock().is_ok_and(|r| r.is_expired(now)))
            .map(|e| *e.key())
            .collect();
        for id in expired_reads {
            if self.reads.remove(&id).is_some() {
                debug!(handle = %id, "reaping idle read handle");
                reaped += 1;
            }
        }

        if reaped > 0 {
            WorkerMetrics::add(&self.metrics.sessions_reaped, reaped as u64);
        }
        reaped
    }

    async fn finish_commit(&self, session: &mut WriteSession) -> Result<u64> {
        let block_id = session.block_id();
        let mode = PersistMode::decide(session.request());
        let mut writer = session.take_writer().ok_or(Error::InvalidSessionState {
            session: session.id(),
            state: session.state().as_str(),
        })?;

        if let PersistMode::Sync { ufs_path } = &mode {
            // The block stays invisible and unevictable while it is flushed
            let flushed = match writer.contents() {
                Ok(data) => self.persist.persist_sync(block_id, ufs_path, data).await,
                Err(e) => Err(e),
            };
            if let Err(e) = flushed {
                warn!(%block_id, error = %e, "synchronous persist failed, aborting write");
                session.attach(writer);
                self.abort_session(session);
                return Err(e);
            }
        }

        let meta = match self.store.commit_block(writer, mode.initial_state()) {
            Ok(meta) => meta,
            Err(e) => {
                self.abort_session(session);
                return Err(e);
            }
        };
        session.transition(SessionState::Committed)?;
        self.writes.remove(&session.id());

        if let PersistMode::Async { ufs_path } = mode {
            self.persist.schedule(block_id, ufs_path);
        }
        WorkerMetrics::inc(&self.metrics.writes_committed);
        Ok(meta.length)
    }
}

#[async_trait]
impl WorkerDataPlane for BlockWorker {
    fn worker_id(&self) -> WorkerId {
        self.id
    }

    async fn create_block_write(
        &self,
        block_id: BlockId,
        request: WriteRequest,
    ) -> Result<SessionId> {
        request.validate()?;
        let id = self.next_session_id();
        let mut session = WriteSession::new(id, block_id, request, self.deadline());

        session.transition(SessionState::Allocating)?;
        let request = session.request();
        let options = BlockOptions {
            write_type: request.write_type,
            ufs_path: request.ufs_path.clone(),
            target_replicas: request.target_replicas,
            replication_min: request.replication_min,
        };
        let writer = match self.store.create_block(
            block_id,
            request.tier,
            request.expected_length,
            request.block_size,
            options,
        ) {
            Ok(writer) => writer,
            Err(e) => {
                session.transition(SessionState::Aborted)?;
                WorkerMetrics::inc(&self.metrics.writes_aborted);
                debug!(%block_id, error = %e, "block write refused");
                return Err(e);
            }
        };
        session.attach(writer);
        session.transition(SessionState::Streaming)?;

        self.writes.insert(id, Arc::new(Mutex::new(session)));
        debug!(%block_id, session = %id, "write session opened");
        Ok(id)
    }

    async fn write_chunk(&self, id: SessionId, offset: u64, data: Bytes) -> Result<()> {
        let shared = self.write_session(id)?;
        let mut session = shared.lock().await;
        session.expect(SessionState::Streaming)?;
        self.check_deadline(&mut session)?;

        let written = session.written();
        if offset != written {
            return Err(Error::invalid_argument(format!(
                "chunk offset {offset} does not follow {written} bytes written"
            )));
        }

        let appended = {
            let writer = session.writer_mut()?;
            self.store.append(writer, &data)
        };
        if let Err(e) = appended {
            warn!(session = %id, block_id = %session.block_id(), error = %e, "write failed, aborting session");
            self.abort_session(&mut session);
            return Err(e);
        }

        WorkerMetrics::add(&self.metrics.bytes_written, data.len() as u64);
        session.extend(self.session_timeout);
        Ok(())
    }

    async fn commit_block(&self, id: SessionId) -> Result<u64> {
        let shared = self.write_session(id)?;
        let mut session = shared.lock().await;
        session.expect(SessionState::Streaming)?;
        self.check_deadline(&mut session)?;
        session.transition(SessionState::Committing)?;
        self.finish_commit(&mut session).await
    }

    async fn abort_block(&self, id: SessionId) -> Result<()> {
        let shared = self.write_session(id)?;
        let mut session = shared.lock().await;
        debug!(session = %id, block_id = %session.block_id(), "write aborted by client");
        self.abort_session(&mut session);
        Ok(())
    }

    async fn open_block_read(&self, block_id: BlockId, offset: u64) -> Result<SessionId> {
        let reader = match self.store.open_reader(block_id) {
            Ok(reader) => reader,
            Err(e) => {
                if e.is_not_found() {
                    WorkerMetrics::inc(&self.metrics.read_misses);
                }
                return Err(e);
            }
        };
        let id = self.next_session_id();
        self.reads.insert(
            id,
            Arc::new(Mutex::new(ReadSession::new(reader, offset, self.deadline()))),
        );
        WorkerMetrics::inc(&self.metrics.reads_opened);
        Ok(id)
    }

    async fn read_chunk(&self, handle: SessionId, len: u64) -> Result<Bytes> {
        let shared = self.read_session(handle)?;
        let mut session = shared.lock().await;
        if session.is_expired(Instant::now()) {
            self.reads.remove(&handle);
            return Err(Error::Timeout);
        }
        let position = session.position;
        let data = session.reader.read(position, len)?;
        session.position += data.len() as u64;
        session.extend(self.session_timeout);
        WorkerMetrics::add(&self.metrics.bytes_read, data.len() as u64);
        Ok(data)
    }

    async fn close_block_read(&self, handle: SessionId) -> Result<()> {
        self.reads
            .remove(&handle)
            .map(|_| ())
            .ok_or(Error::SessionNotFound(handle))
    }
}
