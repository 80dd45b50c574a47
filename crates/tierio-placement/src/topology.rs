//! Cluster view used for placement decisions

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tierio_common::{TierUsage, WorkerId, resolve_tier_index};

/// Snapshot of the workers a client can place blocks on
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ClusterView {
    /// Version number (incremented on changes)
    pub version: u64,
    /// Workers keyed by id; ordered so iteration is stable
    workers: BTreeMap<WorkerId, WorkerInfo>,
}

impl ClusterView {
    /// Create a new empty view
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all workers in id order
    pub fn all_workers(&self) -> impl Iterator<Item = &WorkerInfo> {
        self.workers.values()
    }

    /// Get a specific worker by ID
    #[must_use]
    pub fn get_worker(&self, id: WorkerId) -> Option<&WorkerInfo> {
        self.workers.get(&id)
    }

    /// Get all active workers in id order
    pub fn active_workers(&self) -> impl Iterator<Item = &WorkerInfo> {
        self.all_workers()
            .filter(|w| w.status == WorkerStatus::Active)
    }

    /// Add or update a worker
    pub fn upsert_worker(&mut self, worker: WorkerInfo) {
        self.workers.insert(worker.id, worker);
        self.version += 1;
    }

    /// Replace the tier usage of a known worker
    pub fn update_usage(&mut self, id: WorkerId, tiers: Vec<TierUsage>) -> bool {
        match self.workers.get_mut(&id) {
            Some(worker) => {
                worker.tiers = tiers;
                self.version += 1;
                true
            }
            None => false,
        }
    }

    /// Remove a worker
    pub fn remove_worker(&mut self, id: WorkerId) -> Option<WorkerInfo> {
        let removed = self.workers.remove(&id);
        if removed.is_some() {
            self.version += 1;
        }
        removed
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

/// Worker liveness as last seen by the master
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerStatus {
    #[default]
    Active,
    /// Missed heartbeats; never chosen
    Lost,
    /// Draining; never chosen for new blocks
    Decommissioned,
}

/// Worker information
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerInfo {
    /// Worker unique identifier
    pub id: WorkerId,
    /// Hostname, compared against the client's host for local-first placement
    pub hostname: String,
    pub status: WorkerStatus,
    /// Per-tier usage, fastest tier first
    pub tiers: Vec<TierUsage>,
}

impl WorkerInfo {
    /// Create an active worker with the given tiers
    #[must_use]
    pub fn new(id: WorkerId, hostname: impl Into<String>, tiers: Vec<TierUsage>) -> Self {
        Self {
            id,
            hostname: hostname.into(),
            status: WorkerStatus::Active,
            tiers,
        }
    }

    /// Free bytes in the tier a signed index resolves to on this worker
    #[must_use]
    pub fn available_in_tier(&self, tier: i32) -> u64 {
        resolve_tier_index(tier, self.tiers.len())
            .and_then(|idx| self.tiers.get(idx))
            .map_or(0, TierUsage::available)
    }

    /// Check if the worker can take a block of the given size in a tier
    #[must_use]
    pub fn has_capacity(&self, tier: i32, size: u64) -> bool {
        self.status == WorkerStatus::Active && self.available_in_tier(tier) >= size
    }
}
