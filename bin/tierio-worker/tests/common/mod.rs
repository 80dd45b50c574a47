//! Shared setup for end-to-end tests: workers over temp directories, an
//! in-process master and an in-memory UFS

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tierio_client::{BlockReader, BlockWriter, ClientOptions, InProcessMaster, WorkerPool};
use tierio_common::WorkerConfig;
use tierio_common::config::{DirConfig, TierConfig};
use tierio_storage::BlockStore;
use tierio_ufs::{MemoryUfs, UnderFileSystem};
use tierio_worker::WorkerHandle;

pub const MIB: u64 = 1024 * 1024;

pub struct Cluster {
    pub dir: TempDir,
    pub master: Arc<InProcessMaster>,
    pub ufs: Arc<MemoryUfs>,
    pub pool: WorkerPool,
    pub workers: Vec<WorkerHandle>,
}

pub fn worker_config(dir: &TempDir, name: &str, capacity: u64) -> WorkerConfig {
    let mut config = WorkerConfig::default();
    config.worker.hostname = name.to_string();
    config.tiers = vec![TierConfig {
        alias: "MEM".to_string(),
        dirs: vec![DirConfig {
            path: dir.path().join(name).join("mem"),
            capacity,
        }],
    }];
    config.heartbeat.interval_ms = 50;
    config.heartbeat.initial_backoff_ms = 10;
    config.persist.initial_backoff_ms = 1;
    config.persist.max_backoff_ms = 5;
    config.persist.max_attempts = 3;
    config.persist.sync_timeout_ms = 2_000;
    config.session.reaper_interval_ms = 20;
    config
}

impl Cluster {
    /// Start one worker per capacity and wait until the master knows them all
    pub async fn start(capacities: &[u64]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let master = Arc::new(InProcessMaster::new());
        let ufs = Arc::new(MemoryUfs::new());
        let pool = WorkerPool::new();
        let mut workers = Vec::new();

        for (i, capacity) in capacities.iter().enumerate() {
            let config = worker_config(&dir, &format!("worker-{i}"), *capacity);
            let store = Arc::new(BlockStore::open(&config.tiers, &config.storage).unwrap());
            let ufs_dyn: Arc<dyn UnderFileSystem> = ufs.clone();
            let handle = WorkerHandle::start(&config, store, ufs_dyn, master.clone());
            pool.add(handle.worker.clone());
            workers.push(handle);
        }

        let cluster = Self {
            dir,
            master,
            ufs,
            pool,
            workers,
        };
        let expected = capacities.len();
        let master = cluster.master.clone();
        eventually("workers registered", || master.worker_count() == expected).await;
        cluster
    }

    pub fn writer(&self) -> BlockWriter {
        BlockWriter::new(self.master.clone(), self.pool.clone(), ClientOptions::default())
    }

    pub fn reader(&self) -> BlockReader {
        let ufs: Arc<dyn UnderFileSystem> = self.ufs.clone();
        BlockReader::new(
            self.master.clone(),
            self.pool.clone(),
            Some(ufs),
            ClientOptions::default(),
        )
    }

    pub fn store(&self, worker: usize) -> &Arc<BlockStore> {
        self.workers[worker].worker.store()
    }

    pub fn used(&self, worker: usize) -> u64 {
        self.store(worker).tier_usage()[0].used
    }
}

/// Poll `cond` until it holds, failing the test after five seconds
pub async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Deterministic test payload
pub fn payload(len: u64, seed: u8) -> bytes::Bytes {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect::<Vec<u8>>()
        .into()
}
