//! Location policy implementation
//!
//! Every variant first drops workers that cannot hold the block in the
//! requested tier, then orders what is left. Ties are broken by worker id so
//! the same snapshot always yields the same answer.

use crate::topology::{ClusterView, WorkerInfo};
use parking_lot::RwLock;
use std::cmp::Reverse;
use std::sync::Arc;
use tierio_common::{BlockId, LocationPolicyKind, WorkerId};
use tracing::debug;

/// Inputs for one placement decision
#[derive(Clone, Debug)]
pub struct PlacementRequest {
    pub block_id: BlockId,
    /// Space each target must have free in `tier`
    pub block_size: u64,
    /// Number of workers wanted
    pub replicas: usize,
    /// Signed tier index the block will be written to
    pub tier: i32,
}

impl PlacementRequest {
    #[must_use]
    pub const fn new(block_id: BlockId, block_size: u64, replicas: usize) -> Self {
        Self {
            block_id,
            block_size,
            replicas,
            tier: 0,
        }
    }

    #[must_use]
    pub const fn with_tier(mut self, tier: i32) -> Self {
        self.tier = tier;
        self
    }
}

/// A placement variant plus the client context it needs
#[derive(Clone, Debug)]
pub struct LocationPolicy {
    kind: LocationPolicyKind,
    /// Hostname of the client, for local-first placement
    local_hostname: Option<String>,
}

impl LocationPolicy {
    #[must_use]
    pub const fn new(kind: LocationPolicyKind) -> Self {
        Self {
            kind,
            local_hostname: None,
        }
    }

    #[must_use]
    pub fn with_local_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.local_hostname = Some(hostname.into());
        self
    }

    #[must_use]
    pub const fn kind(&self) -> LocationPolicyKind {
        self.kind
    }

    /// Choose up to `request.replicas` workers, primary first.
    ///
    /// Returns fewer workers than asked for when not enough are eligible;
    /// the caller decides whether that satisfies its replication minimum.
    pub fn choose<'a>(
        &self,
        candidates: impl IntoIterator<Item = &'a WorkerInfo>,
        request: &PlacementRequest,
    ) -> Vec<WorkerId> {
        let mut eligible: Vec<&WorkerInfo> = candidates
            .into_iter()
            .filter(|w| w.has_capacity(request.tier, request.block_size))
            .collect();
        eligible.sort_by_key(|w| w.id);
        eligible.dedup_by_key(|w| w.id);

        let ordered: Vec<WorkerId> = match self.kind {
            LocationPolicyKind::LocalFirst => self.local_first(&eligible, request.tier),
            LocationPolicyKind::MostAvailable => most_available(&eligible, request.tier),
            LocationPolicyKind::RoundRobin => round_robin(&eligible, request.block_id),
            LocationPolicyKind::SpecificWorker(id) => eligible
                .iter()
                .filter(|w| w.id == id)
                .map(|w| w.id)
                .collect(),
            LocationPolicyKind::DeterministicHash => rendezvous(&eligible, request.block_id),
        };

        let chosen: Vec<WorkerId> = ordered.into_iter().take(request.replicas).collect();
        debug!(
            block_id = %request.block_id,
            policy = ?self.kind,
            eligible = eligible.len(),
            chosen = chosen.len(),
            "placement decided"
        );
        chosen
    }

    fn local_first(&self, eligible: &[&WorkerInfo], tier: i32) -> Vec<WorkerId> {
        let mut ordered = most_available(eligible, tier);
        if let Some(host) = &self.local_hostname {
            // Stable partition: local workers first, each half keeps its order
            let (local, remote): (Vec<WorkerId>, Vec<WorkerId>) =
                ordered.into_iter().partition(|id| {
                    eligible
                        .iter()
                        .any(|w| w.id == *id && &w.hostname == host)
                });
            ordered = local;
            ordered.extend(remote);
        }
        ordered
    }
}

/// Free space in the tier, descending; ties by id
fn most_available(eligible: &[&WorkerInfo], tier: i32) -> Vec<WorkerId> {
    let mut ranked: Vec<(u64, WorkerId)> = eligible
        .iter()
        .map(|w| (w.available_in_tier(tier), w.id))
        .collect();
    ranked.sort_by_key(|&(free, id)| (Reverse(free), id));
    ranked.into_iter().map(|(_, id)| id).collect()
}

/// Id order rotated by the block id
fn round_robin(eligible: &[&WorkerInfo], block_id: BlockId) -> Vec<WorkerId> {
    if eligible.is_empty() {
        return Vec::new();
    }
    let mut ids: Vec<WorkerId> = eligible.iter().map(|w| w.id).collect();
    let offset = usize::try_from(block_id.as_u64() % ids.len() as u64).unwrap_or(0);
    ids.rotate_left(offset);
    ids
}

/// Highest random weight: `score = xxh64(worker_id, seed = hash(block_id))`
fn rendezvous(eligible: &[&WorkerInfo], block_id: BlockId) -> Vec<WorkerId> {
    let seed = xxhash_rust::xxh64::xxh64(&block_id.as_u64().to_le_bytes(), 0);
    let mut scored: Vec<(u64, WorkerId)> = eligible
        .iter()
        .map(|w| (xxhash_rust::xxh64::xxh64(w.id.as_bytes(), seed), w.id))
        .collect();
    scored.sort_by_key(|&(score, id)| (Reverse(score), id));
    scored.into_iter().map(|(_, id)| id).collect()
}

/// Placement against a shared, refreshable cluster view
pub struct PlacementEngine {
    view: Arc<RwLock<ClusterView>>,
}

impl PlacementEngine {
    #[must_use]
    pub fn new(view: ClusterView) -> Self {
        Self {
            view: Arc::new(RwLock::new(view)),
        }
    }

    /// Replace the cluster view
    pub fn update_view(&self, view: ClusterView) {
        *self.view.write() = view;
    }

    /// Apply an in-place change to the cluster view
    pub fn modify_view(&self, f: impl FnOnce(&mut ClusterView)) {
        f(&mut self.view.write());
    }

    /// Current view version
    #[must_use]
    pub fn version(&self) -> u64 {
        self.view.read().version
    }

    /// Choose workers for a block from the active workers in the view
    #[must_use]
    pub fn place(&self, policy: &LocationPolicy, request: &PlacementRequest) -> Vec<WorkerId> {
        let view = self.view.read();
        policy.choose(view.active_workers(), request)
    }
}
