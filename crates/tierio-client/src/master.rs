//! Master collaborator
//!
//! Workers and clients only need a narrow slice of the master: block ids,
//! block locations, the worker list for placement, and the heartbeat that
//! carries inventory deltas one way and commands the other.
//! [`InProcessMaster`] keeps all of that in memory for single-process
//! deployments and tests.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tierio_common::{BlockId, Error, Result, TierUsage, WorkerId};
use tierio_placement::{ClusterView, WorkerInfo};
use tracing::{debug, info};

/// A committed block as reported by a worker
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockReport {
    pub block_id: BlockId,
    pub length: u64,
}

/// A block placed on fewer workers than its replication minimum
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnderReplicated {
    pub block_id: BlockId,
    /// Replicas the client managed to place
    pub replicas: u32,
    /// Replication minimum requested for the block
    pub min: u32,
}

/// Periodic report from a worker
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HeartbeatReport {
    pub worker_id: WorkerId,
    pub hostname: String,
    pub tier_usage: Vec<TierUsage>,
    /// When set, `added` is the complete inventory and replaces what the
    /// master knew about this worker
    pub full_inventory: bool,
    pub added: Vec<BlockReport>,
    pub removed: Vec<BlockId>,
    /// Blocks whose asynchronous persistence gave up
    pub persist_failed: Vec<BlockId>,
    pub under_replicated: Vec<UnderReplicated>,
}

impl HeartbeatReport {
    #[must_use]
    pub fn new(worker_id: WorkerId, hostname: impl Into<String>) -> Self {
        Self {
            worker_id,
            hostname: hostname.into(),
            ..Self::default()
        }
    }

    /// Whether the report carries anything besides usage
    #[must_use]
    pub fn has_deltas(&self) -> bool {
        !self.added.is_empty()
            || !self.removed.is_empty()
            || !self.persist_failed.is_empty()
            || !self.under_replicated.is_empty()
    }
}

/// Command returned to a worker in a heartbeat response
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MasterCommand {
    /// Drop these blocks from the worker
    Free { block_ids: Vec<BlockId> },
    /// The master lost track of the worker; send a full inventory next
    Register,
}

/// What a worker or client needs from the master
#[async_trait]
pub trait MasterClient: Send + Sync {
    /// Allocate a fresh, cluster-unique block id
    async fn allocate_block_id(&self) -> Result<BlockId>;

    /// Record one committed replica right away
    async fn report_block_committed(
        &self,
        worker_id: WorkerId,
        block_id: BlockId,
        length: u64,
    ) -> Result<()>;

    /// Send a heartbeat; returns the commands queued for the worker
    async fn report_heartbeat(&self, report: HeartbeatReport) -> Result<Vec<MasterCommand>>;

    /// Workers currently holding a block, in id order
    async fn block_locations(&self, block_id: BlockId) -> Result<Vec<WorkerId>>;

    /// Workers known to the master, for placement
    async fn cluster_view(&self) -> Result<ClusterView>;
}

/// Master state kept in memory
#[derive(Debug)]
pub struct InProcessMaster {
    next_block_id: AtomicU64,
    available: AtomicBool,
    heartbeats: AtomicU64,
    locations: DashMap<BlockId, BTreeSet<WorkerId>>,
    lengths: DashMap<BlockId, u64>,
    view: RwLock<ClusterView>,
    commands: Mutex<HashMap<WorkerId, Vec<MasterCommand>>>,
    under_replicated: DashMap<BlockId, UnderReplicated>,
    persist_failed: Mutex<BTreeSet<BlockId>>,
}

impl Default for InProcessMaster {
    fn default() -> Self {
        Self::new()
    }
}

impl InProcessMaster {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_block_id: AtomicU64::new(1),
            available: AtomicBool::new(true),
            heartbeats: AtomicU64::new(0),
            locations: DashMap::new(),
            lengths: DashMap::new(),
            view: RwLock::new(ClusterView::new()),
            commands: Mutex::new(HashMap::new()),
            under_replicated: DashMap::new(),
            persist_failed: Mutex::new(BTreeSet::new()),
        }
    }

    /// Simulate the master going away and coming back
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Register a worker before its first heartbeat
    pub fn register_worker(&self, info: WorkerInfo) {
        self.view.write().upsert_worker(info);
    }

    /// Queue a command for the worker's next heartbeat
    pub fn enqueue_command(&self, worker_id: WorkerId, command: MasterCommand) {
        self.commands
            .lock()
            .entry(worker_id)
            .or_default()
            .push(command);
    }

    /// Forget everything about a worker, as after a master restart
    pub fn forget_worker(&self, worker_id: WorkerId) {
        self.view.write().remove_worker(worker_id);
        self.locations.retain(|_, workers| {
            workers.remove(&worker_id);
            !workers.is_empty()
        });
    }

    #[must_use]
    pub fn replicas(&self, block_id: BlockId) -> Vec<WorkerId> {
        self.locations
            .get(&block_id)
            .map(|w| w.iter().copied().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn block_length(&self, block_id: BlockId) -> Option<u64> {
        self.lengths.get(&block_id).map(|l| *l)
    }

    /// Workers the master currently knows
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.view.read().len()
    }

    #[must_use]
    pub fn heartbeat_count(&self) -> u64 {
        self.heartbeats.load(Ordering::SeqCst)
    }

    /// Under-replicated blocks reported so far, sorted by block id
    #[must_use]
    pub fn under_replicated(&self) -> Vec<UnderReplicated> {
        let mut blocks: Vec<_> = self.under_replicated.iter().map(|e| *e.value()).collect();
        blocks.sort_by_key(|u| u.block_id);
        blocks
    }

    #[must_use]
    pub fn persist_failed(&self) -> Vec<BlockId> {
        self.persist_failed.lock().iter().copied().collect()
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::MasterUnavailable("master is not reachable".to_string()))
        }
    }

    fn add_location(&self, worker_id: WorkerId, block_id: BlockId, length: u64) {
        self.locations.entry(block_id).or_default().insert(worker_id);
        self.lengths.insert(block_id, length);
    }

    fn remove_location(&self, worker_id: WorkerId, block_id: BlockId) {
        let emptied = self
            .locations
            .get_mut(&block_id)
            .is_some_and(|mut workers| {
                workers.remove(&worker_id);
                workers.is_empty()
            });
        if emptied {
            self.locations.remove(&block_id);
        }
    }
}

#[async_trait]
impl MasterClient for InProcessMaster {
    async fn allocate_block_id(&self) -> Result<BlockId> {
        self.check_available()?;
        Ok(BlockId::new(
            self.next_block_id.fetch_add(1, Ordering::SeqCst),
        ))
    }

    async fn report_block_committed(
        &self,
        worker_id: WorkerId,
        block_id: BlockId,
        length: u64,
    ) -> Result<()> {
        self.check_available()?;
        self.add_location(worker_id, block_id, length);
        debug!(%worker_id, %block_id, length, "block committed on worker");
        Ok(())
    }

    async fn report_heartbeat(&self, report: HeartbeatReport) -> Result<Vec<MasterCommand>> {
        self.check_available()?;
        self.heartbeats.fetch_add(1, Ordering::SeqCst);
        let worker_id = report.worker_id;

        let known = self.view.read().get_worker(worker_id).is_some();
        if !known && !report.full_inventory {
            info!(%worker_id, "heartbeat from unknown worker, asking it to register");
            return Ok(vec![MasterCommand::Register]);
        }

        {
            let mut view = self.view.write();
            if known {
                view.update_usage(worker_id, report.tier_usage.clone());
            } else {
                view.upsert_worker(WorkerInfo::new(
                    worker_id,
                    report.hostname.clone(),
                    report.tier_usage.clone(),
                ));
            }
        }

        if !report.full_inventory && !report.has_deltas() {
            return Ok(self.commands.lock().remove(&worker_id).unwrap_or_default());
        }
        if report.full_inventory {
            self.locations.retain(|_, workers| {
                workers.remove(&worker_id);
                !workers.is_empty()
            });
        }
        for added in &report.added {
            self.add_location(worker_id, added.block_id, added.length);
        }
        for block_id in &report.removed {
            self.remove_location(worker_id, *block_id);
        }
        for under in &report.under_replicated {
            self.under_replicated.insert(under.block_id, *under);
        }
        self.persist_failed
            .lock()
            .extend(report.persist_failed.iter().copied());

        Ok(self.commands.lock().remove(&worker_id).unwrap_or_default())
    }

    async fn block_locations(&self, block_id: BlockId) -> Result<Vec<WorkerId>> {
        self.check_available()?;
        Ok(self.replicas(block_id))
    }

    async fn cluster_view(&self) -> Result<ClusterView> {
        self.check_available()?;
        Ok(self.view.read().clone())
    }
}
