//! Heartbeat bridge between the block store and the master
//!
//! Store events arrive over a channel. Commits are reported to the master
//! right away; anything that cannot be delivered, along with removals and
//! persist failures, is kept as a pending delta and sent with the next
//! heartbeat. A failed heartbeat puts its delta back, so nothing is lost
//! while the master is unreachable.

use crate::metrics::WorkerMetrics;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tierio_client::{BlockReport, HeartbeatReport, MasterClient, MasterCommand, UnderReplicated};
use tierio_common::config::HeartbeatConfig;
use tierio_common::{BlockId, Error, Result, WorkerId};
use tierio_storage::{BlockStore, StoreEvent};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Inventory changes not yet acknowledged by the master
#[derive(Debug, Default)]
struct PendingDelta {
    added: BTreeMap<BlockId, u64>,
    removed: BTreeSet<BlockId>,
    persist_failed: BTreeSet<BlockId>,
    under_replicated: BTreeMap<BlockId, UnderReplicated>,
    /// Send the whole inventory instead of `added`
    full_inventory: bool,
}

impl PendingDelta {
    fn record_added(&mut self, block_id: BlockId, length: u64) {
        self.removed.remove(&block_id);
        self.added.insert(block_id, length);
    }

    fn record_removed(&mut self, block_id: BlockId) {
        self.added.remove(&block_id);
        self.under_replicated.remove(&block_id);
        self.removed.insert(block_id);
    }

    /// Fold `newer` into this delta; where both mention a block, the newer
    /// entry wins
    fn merge(&mut self, newer: Self) {
        for block_id in newer.removed {
            self.record_removed(block_id);
        }
        for (block_id, length) in newer.added {
            self.record_added(block_id, length);
        }
        self.persist_failed.extend(newer.persist_failed);
        self.under_replicated.extend(newer.under_replicated);
        self.full_inventory |= newer.full_inventory;
    }
}

pub struct HeartbeatBridge {
    worker_id: WorkerId,
    hostname: String,
    store: Arc<BlockStore>,
    master: Arc<dyn MasterClient>,
    config: HeartbeatConfig,
    metrics: Arc<WorkerMetrics>,
    pending: Mutex<PendingDelta>,
    /// Free commands for blocks that were busy, retried every heartbeat
    deferred_frees: Mutex<BTreeSet<BlockId>>,
}

impl HeartbeatBridge {
    /// The first heartbeat carries the full inventory
    #[must_use]
    pub fn new(
        worker_id: WorkerId,
        hostname: impl Into<String>,
        store: Arc<BlockStore>,
        master: Arc<dyn MasterClient>,
        config: HeartbeatConfig,
        metrics: Arc<WorkerMetrics>,
    ) -> Self {
        Self {
            worker_id,
            hostname: hostname.into(),
            store,
            master,
            config,
            metrics,
            pending: Mutex::new(PendingDelta {
                full_inventory: true,
                ..PendingDelta::default()
            }),
            deferred_frees: Mutex::new(BTreeSet::new()),
        }
    }

    /// Blocks whose free command is waiting for readers or writers
    #[must_use]
    pub fn deferred_frees(&self) -> Vec<BlockId> {
        self.deferred_frees.lock().iter().copied().collect()
    }

    /// Fold one store event into the pending delta
    pub async fn handle_event(&self, event: StoreEvent) {
        match event {
            StoreEvent::Committed(meta) => {
                if meta.options.is_under_replicated() {
                    info!(
                        block_id = %meta.block_id,
                        replicas = meta.options.target_replicas,
                        min = meta.options.replication_min,
                        "block committed below its replication minimum"
                    );
                    self.pending.lock().under_replicated.insert(
                        meta.block_id,
                        UnderReplicated {
                            block_id: meta.block_id,
                            replicas: meta.options.target_replicas,
                            min: meta.options.replication_min,
                        },
                    );
                }
                match self
                    .master
                    .report_block_committed(self.worker_id, meta.block_id, meta.length)
                    .await
                {
                    Ok(()) => {
                        // An earlier removal must not undo this report
                        self.pending.lock().removed.remove(&meta.block_id);
                        debug!(block_id = %meta.block_id, "commit reported");
                    }
                    Err(e) => {
                        debug!(block_id = %meta.block_id, error = %e, "commit report deferred");
                        self.pending.lock().record_added(meta.block_id, meta.length);
                    }
                }
            }
            StoreEvent::Removed { block_id, reason } => {
                debug!(%block_id, ?reason, "block left the store");
                self.pending.lock().record_removed(block_id);
            }
            StoreEvent::PersistFailed(block_id) => {
                self.pending.lock().persist_failed.insert(block_id);
            }
        }
    }

    fn build_report(&self, delta: &PendingDelta) -> HeartbeatReport {
        let mut report = HeartbeatReport::new(self.worker_id, self.hostname.clone());
        report.tier_usage = self.store.tier_usage();
        report.full_inventory = delta.full_inventory;
        report.added = if delta.full_inventory {
            self.store
                .inventory()
                .into_iter()
                .map(|m| BlockReport {
                    block_id: m.block_id,
                    length: m.length,
                })
                .collect()
        } else {
            delta
                .added
                .iter()
                .map(|(&block_id, &length)| BlockReport { block_id, length })
                .collect()
        };
        report.removed = delta.removed.iter().copied().collect();
        report.persist_failed = delta.persist_failed.iter().copied().collect();
        report.under_replicated = delta.under_replicated.values().copied().collect();
        report
    }

    /// Send one heartbeat and apply the returned commands
    pub async fn heartbeat(&self) -> Result<usize> {
        self.retry_deferred_frees();

        let delta = std::mem::take(&mut *self.pending.lock());
        let report = self.build_report(&delta);
        if report.has_deltas() {
            debug!(
                added = report.added.len(),
                removed = report.removed.len(),
                full = report.full_inventory,
                "sending heartbeat with inventory changes"
            );
        }
        match self.master.report_heartbeat(report).await {
            Ok(commands) => {
                WorkerMetrics::inc(&self.metrics.heartbeats_ok);
                let count = commands.len();
                self.apply(commands);
                Ok(count)
            }
            Err(e) => {
                WorkerMetrics::inc(&self.metrics.heartbeats_failed);
                let mut pending = self.pending.lock();
                let newer = std::mem::take(&mut *pending);
                *pending = delta;
                pending.merge(newer);
                Err(e)
            }
        }
    }

    fn apply(&self, commands: Vec<MasterCommand>) {
        for command in commands {
            match command {
                MasterCommand::Free { block_ids } => {
                    for block_id in block_ids {
                        self.free(block_id);
                    }
                }
                MasterCommand::Register => {
                    info!("master asked for re-registration");
                    self.pending.lock().full_inventory = true;
                }
            }
        }
    }

    /// Remove a block on master request; busy blocks are retried later
    fn free(&self, block_id: BlockId) -> bool {
        match self.store.remove_block(block_id) {
            Ok(length) => {
                WorkerMetrics::inc(&self.metrics.blocks_freed);
                info!(%block_id, length, "block freed on master request");
                self.deferred_frees.lock().remove(&block_id);
                true
            }
            Err(Error::BlockNotFound(_)) => {
                self.deferred_frees.lock().remove(&block_id);
                true
            }
            Err(e) => {
                debug!(%block_id, error = %e, "block busy, free deferred");
                self.deferred_frees.lock().insert(block_id);
                false
            }
        }
    }

    fn retry_deferred_frees(&self) {
        let deferred = self.deferred_frees();
        for block_id in deferred {
            self.free(block_id);
        }
    }

    /// Consume store events and send heartbeats until the event channel closes
    pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<StoreEvent>) {
        let mut failures = 0u32;
        let mut next = Instant::now();
        info!(worker_id = %self.worker_id, interval = ?self.config.interval(), "heartbeat bridge started");

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                () = tokio::time::sleep_until(next) => {
                    match self.heartbeat().await {
                        Ok(_) => {
                            if failures > 0 {
                                info!(failures, "master reachable again");
                            }
                            failures = 0;
                            next = Instant::now() + self.config.interval();
                        }
                        Err(e) => {
                            failures += 1;
                            let delay = self.config.backoff(failures);
                            warn!(failures, retry_in = ?delay, error = %e, "heartbeat failed");
                            next = Instant::now() + delay;
                        }
                    }
                }
            }
        }
        debug!("store event channel closed, heartbeat bridge stopping");
    }
}
