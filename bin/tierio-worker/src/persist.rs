//! Persist coordinator
//!
//! Decides how a committed block reaches the under file system and runs
//! the flushes. Synchronous flushes run inside the committing session and
//! are bounded by `sync_timeout`. Background flushes go through a job
//! queue drained by a small pool of tasks; they retry with backoff and,
//! after the retry budget, mark the block persist-failed so the heartbeat
//! can report it.

use crate::metrics::WorkerMetrics;
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tierio_common::config::PersistConfig;
use tierio_common::{BlockId, Error, Result, WriteRequest, WriteType};
use tierio_storage::{BlockStore, PersistState};
use tierio_ufs::UnderFileSystem;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How a block is persisted
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PersistMode {
    /// Never leaves the tier
    CacheOnly,
    /// Flushed in the background after commit
    Async { ufs_path: String },
    /// Flushed before the commit is acknowledged
    Sync { ufs_path: String },
}

impl PersistMode {
    /// Decide the mode for a write. Only a replica that carries a UFS path
    /// persists; the others are cache copies.
    #[must_use]
    pub fn decide(request: &WriteRequest) -> Self {
        match (&request.ufs_path, request.write_type) {
            (None, _) | (_, WriteType::CacheOnly) => Self::CacheOnly,
            (Some(path), WriteType::AsyncThrough) => Self::Async {
                ufs_path: path.clone(),
            },
            (Some(path), WriteType::MustCacheAndThrough) => Self::Sync {
                ufs_path: path.clone(),
            },
        }
    }

    /// Persist state a block commits with under this mode
    #[must_use]
    pub const fn initial_state(&self) -> PersistState {
        match self {
            Self::CacheOnly => PersistState::NotRequired,
            Self::Async { .. } => PersistState::Pending,
            Self::Sync { .. } => PersistState::Persisted,
        }
    }
}

/// A queued background flush
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PersistJob {
    pub block_id: BlockId,
    pub ufs_path: String,
}

pub struct PersistCoordinator {
    store: Arc<BlockStore>,
    ufs: Arc<dyn UnderFileSystem>,
    config: PersistConfig,
    metrics: Arc<WorkerMetrics>,
    queue: mpsc::UnboundedSender<PersistJob>,
    jobs: Arc<Mutex<mpsc::UnboundedReceiver<PersistJob>>>,
    pending: AtomicU64,
}

impl PersistCoordinator {
    #[must_use]
    pub fn new(
        store: Arc<BlockStore>,
        ufs: Arc<dyn UnderFileSystem>,
        config: PersistConfig,
        metrics: Arc<WorkerMetrics>,
    ) -> Self {
        let (queue, jobs) = mpsc::unbounded_channel();
        Self {
            store,
            ufs,
            config,
            metrics,
            queue,
            jobs: Arc::new(Mutex::new(jobs)),
            pending: AtomicU64::new(0),
        }
    }

    /// Background flushes queued or running
    #[must_use]
    pub fn pending(&self) -> u64 {
        self.pending.load(Ordering::SeqCst)
    }

    /// Write a block to the UFS before its commit is acknowledged
    pub async fn persist_sync(&self, block_id: BlockId, ufs_path: &str, data: Bytes) -> Result<()> {
        let timeout = self.config.sync_timeout();
        match tokio::time::timeout(timeout, self.write_with_retry(block_id, ufs_path, data)).await
        {
            Ok(Ok(())) => {
                WorkerMetrics::inc(&self.metrics.persist_succeeded);
                info!(%block_id, path = ufs_path, "block persisted synchronously");
                Ok(())
            }
            Ok(Err(e)) => {
                WorkerMetrics::inc(&self.metrics.persist_failed);
                Err(e)
            }
            Err(_) => {
                WorkerMetrics::inc(&self.metrics.persist_failed);
                Err(Error::PersistFailed {
                    block_id,
                    reason: format!("timed out after {timeout:?}"),
                })
            }
        }
    }

    /// Queue a committed block for background flushing
    pub fn schedule(&self, block_id: BlockId, ufs_path: String) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.queue.send(PersistJob { block_id, ufs_path }).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            error!(%block_id, "persist queue closed, block stays unpersisted");
            if let Err(e) = self.store.mark_persist_failed(block_id) {
                debug!(%block_id, error = %e, "marking persist failure");
            }
        }
    }

    /// Start the background flush tasks
    pub fn spawn_workers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        (0..self.config.workers.max(1))
            .map(|n| {
                let coordinator = Arc::clone(self);
                tokio::spawn(async move {
                    debug!(worker = n, "persist worker started");
                    loop {
                        let job = coordinator.jobs.lock().await.recv().await;
                        let Some(job) = job else {
                            break;
                        };
                        coordinator.run_job(job).await;
                        coordinator.pending.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect()
    }

    /// Flush one block; the outcome is recorded on the block itself
    pub async fn run_job(&self, job: PersistJob) {
        let PersistJob { block_id, ufs_path } = job;
        let data = match self
            .store
            .open_reader(block_id)
            .and_then(|mut reader| reader.read_all())
        {
            Ok(data) => data,
            Err(e) => {
                warn!(%block_id, error = %e, "block gone before it was persisted");
                return;
            }
        };

        match self.write_with_retry(block_id, &ufs_path, data).await {
            Ok(()) => {
                WorkerMetrics::inc(&self.metrics.persist_succeeded);
                if let Err(e) = self.store.mark_persisted(block_id) {
                    debug!(%block_id, error = %e, "block removed while persisting");
                }
                info!(%block_id, path = %ufs_path, "block persisted");
            }
            Err(e) => {
                WorkerMetrics::inc(&self.metrics.persist_failed);
                error!(%block_id, path = %ufs_path, error = %e, "giving up on persisting block");
                if let Err(e) = self.store.mark_persist_failed(block_id) {
                    debug!(%block_id, error = %e, "block removed while persisting");
                }
            }
        }
    }

    async fn write_with_retry(&self, block_id: BlockId, ufs_path: &str, data: Bytes) -> Result<()> {
        let attempts = self.config.max_attempts.max(1);
        let mut last = String::new();
        for attempt in 1..=attempts {
            match self.ufs.write_all(ufs_path, data.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(%block_id, attempt, attempts, error = %e, "ufs write failed");
                    last = e.to_string();
                    if attempt < attempts {
                        WorkerMetrics::inc(&self.metrics.persist_retries);
                        tokio::time::sleep(self.config.backoff(attempt)).await;
                    }
                }
            }
        }
        Err(Error::PersistFailed {
            block_id,
            reason: format!("{attempts} attempts failed, last: {last}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};
    use tierio_common::config::{DirConfig, StorageSection, TierConfig};
    use tierio_storage::BlockOptions;
    use tierio_ufs::MemoryUfs;

    fn config() -> PersistConfig {
        PersistConfig {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
            sync_timeout_ms: 500,
            workers: 2,
        }
    }

    fn setup(config: PersistConfig) -> (TempDir, Arc<BlockStore>, Arc<MemoryUfs>, PersistCoordinator) {
        let dir = tempdir().unwrap();
        let tiers = vec![TierConfig {
            alias: "MEM".to_string(),
            dirs: vec![DirConfig {
                path: dir.path().join("mem"),
                capacity: 1 << 20,
            }],
        }];
        let store = Arc::new(BlockStore::open(&tiers, &StorageSection::default()).unwrap());
        let ufs = Arc::new(MemoryUfs::new());
        let coordinator = PersistCoordinator::new(
            store.clone(),
            ufs.clone(),
            config,
            Arc::new(WorkerMetrics::default()),
        );
        (dir, store, ufs, coordinator)
    }

    fn commit(store: &BlockStore, id: u64, data: &[u8]) {
        let mut writer = store
            .create_block(BlockId::new(id), 0, 0, 1024, BlockOptions::default())
            .unwrap();
        store.append(&mut writer, data).unwrap();
        store.commit_block(writer, PersistState::Pending).unwrap();
    }

    #[test]
    fn test_decide() {
        let base = WriteRequest::new(16);
        assert_eq!(PersistMode::decide(&base), PersistMode::CacheOnly);
        assert_eq!(
            PersistMode::decide(&base.clone().with_ufs_path("a")),
            PersistMode::Async {
                ufs_path: "a".to_string()
            }
        );
        assert_eq!(
            PersistMode::decide(
                &base
                    .clone()
                    .with_ufs_path("a")
                    .with_write_type(WriteType::MustCacheAndThrough)
            ),
            PersistMode::Sync {
                ufs_path: "a".to_string()
            }
        );
        assert_eq!(
            PersistMode::decide(
                &base
                    .with_ufs_path("a")
                    .with_write_type(WriteType::CacheOnly)
            ),
            PersistMode::CacheOnly
        );
    }

    #[tokio::test]
    async fn test_background_flush_marks_persisted() {
        let (_dir, store, ufs, coordinator) = setup(config());
        commit(&store, 1, b"payload");

        coordinator
            .run_job(PersistJob {
                block_id: BlockId::new(1),
                ufs_path: "blocks/1".to_string(),
            })
            .await;

        assert_eq!(ufs.get("blocks/1").unwrap(), Bytes::from_static(b"payload"));
        assert_eq!(
            store.block_meta(BlockId::new(1)).unwrap().persist,
            PersistState::Persisted
        );
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let (_dir, store, ufs, coordinator) = setup(config());
        commit(&store, 2, b"x");
        ufs.fail_next_writes(2);

        coordinator
            .run_job(PersistJob {
                block_id: BlockId::new(2),
                ufs_path: "blocks/2".to_string(),
            })
            .await;

        assert_eq!(ufs.write_attempts(), 3);
        assert_eq!(
            store.block_meta(BlockId::new(2)).unwrap().persist,
            PersistState::Persisted
        );
        assert_eq!(coordinator.metrics.persist_retries.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted_marks_failed() {
        let (_dir, store, ufs, coordinator) = setup(config());
        let mut events = store.subscribe();
        commit(&store, 3, b"x");
        ufs.fail_next_writes(10);

        coordinator
            .run_job(PersistJob {
                block_id: BlockId::new(3),
                ufs_path: "blocks/3".to_string(),
            })
            .await;

        assert_eq!(ufs.write_attempts(), 3);
        let meta = store.block_meta(BlockId::new(3)).unwrap();
        assert_eq!(meta.persist, PersistState::Failed);
        // Still readable from the tier
        assert!(store.has_block(BlockId::new(3)));

        let mut saw_failure = false;
        while let Ok(event) = events.try_recv() {
            saw_failure |= event == tierio_storage::StoreEvent::PersistFailed(BlockId::new(3));
        }
        assert!(saw_failure);
    }

    #[tokio::test]
    async fn test_sync_persist_times_out() {
        let (_dir, _store, ufs, coordinator) = setup(PersistConfig {
            sync_timeout_ms: 20,
            ..config()
        });
        ufs.set_write_delay(Duration::from_millis(200));

        let err = coordinator
            .persist_sync(BlockId::new(4), "blocks/4", Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PersistFailed { .. }));
        assert!(ufs.get("blocks/4").is_none());
    }

    #[tokio::test]
    async fn test_scheduled_jobs_drain() {
        let (_dir, store, ufs, coordinator) = setup(config());
        let coordinator = Arc::new(coordinator);
        let handles = coordinator.spawn_workers();
        for id in 10..20 {
            commit(&store, id, b"data");
            coordinator.schedule(BlockId::new(id), format!("blocks/{id}"));
        }

        for _ in 0..200 {
            if coordinator.pending() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(coordinator.pending(), 0);
        assert_eq!(ufs.len(), 10);
        for handle in handles {
            handle.abort();
        }
    }
}
