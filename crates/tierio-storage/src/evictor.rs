//! Victim selection
//!
//! Eviction is split in two. [`Evictor::plan`] looks at a snapshot of the
//! committed blocks and picks victims inside a single directory, without
//! touching any state. The block store then applies the plan, moving each
//! victim to `Evicting` under its entry lock and rolling back if any of them
//! changed in the meantime.

use crate::meta::{BlockMeta, BlockState, PersistState};
use crate::tier::{DirRef, StorageTier};
use std::collections::BTreeMap;
use tierio_common::config::EvictionPolicy;
use tierio_common::{BlockId, Error, Result};
use tracing::debug;

/// What happens to a victim
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VictimAction {
    /// Delete the block from this worker
    Remove,
    /// Move the block to the next slower tier
    Demote,
}

/// A block the evictor may choose
#[derive(Clone, Debug)]
pub struct Candidate {
    pub block_id: BlockId,
    pub location: DirRef,
    pub length: u64,
    pub last_access_seq: u64,
    pub access_count: u64,
    pub action: VictimAction,
}

/// A chosen victim
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Victim {
    pub block_id: BlockId,
    pub location: DirRef,
    pub length: u64,
    pub action: VictimAction,
}

/// Victims that together free enough room in `target`
#[derive(Clone, Debug)]
pub struct EvictionPlan {
    pub target: DirRef,
    pub victims: Vec<Victim>,
    pub freed: u64,
}

/// Victim selection policy
#[derive(Clone, Copy, Debug)]
pub struct Evictor {
    policy: EvictionPolicy,
}

impl Evictor {
    #[must_use]
    pub const fn new(policy: EvictionPolicy) -> Self {
        Self { policy }
    }

    #[must_use]
    pub const fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    /// Decide whether a block can be a victim, and what would happen to it.
    ///
    /// Blocks being written or read are never chosen. A block whose only
    /// copy of must-persist data lives here can only be demoted, never
    /// removed.
    #[must_use]
    pub fn candidate(
        &self,
        meta: &BlockMeta,
        readers: usize,
        has_lower_tier: bool,
    ) -> Option<Candidate> {
        if meta.state != BlockState::Committed || readers > 0 {
            return None;
        }
        let action = match self.policy {
            EvictionPolicy::Demote if has_lower_tier && meta.persist != PersistState::Persisted => {
                VictimAction::Demote
            }
            _ if meta.persist.is_sole_copy() => return None,
            _ => VictimAction::Remove,
        };
        Some(Candidate {
            block_id: meta.block_id,
            location: meta.location,
            length: meta.length,
            last_access_seq: meta.last_access_seq,
            access_count: meta.access_count,
            action,
        })
    }

    /// Pick victims so that one directory of `tier` gains `size` free bytes.
    ///
    /// With `only_dir` set, only that directory is considered. Fails with
    /// `EvictionFailed` when no directory can be freed far enough.
    pub fn plan(
        &self,
        tier: &StorageTier,
        mut candidates: Vec<Candidate>,
        size: u64,
        only_dir: Option<usize>,
    ) -> Result<EvictionPlan> {
        let in_scope = |loc: DirRef| loc.tier == tier.index() && only_dir.is_none_or(|d| d == loc.dir);

        for dir in tier.dirs() {
            if in_scope(dir.location()) && dir.available() >= size {
                return Ok(EvictionPlan {
                    target: dir.location(),
                    victims: Vec::new(),
                    freed: 0,
                });
            }
        }

        candidates.retain(|c| in_scope(c.location));
        match self.policy {
            EvictionPolicy::Lru | EvictionPolicy::Demote => {
                candidates.sort_by_key(|c| (c.last_access_seq, c.block_id));
            }
            EvictionPolicy::Lfu => {
                candidates.sort_by_key(|c| (c.access_count, c.last_access_seq, c.block_id));
            }
        }

        let mut per_dir: BTreeMap<usize, (u64, Vec<Victim>)> = BTreeMap::new();
        for candidate in candidates {
            let Some(dir) = tier.dir(candidate.location.dir) else {
                continue;
            };
            if dir.capacity() < size {
                continue;
            }
            let (freed, victims) = per_dir.entry(candidate.location.dir).or_default();
            *freed += candidate.length;
            victims.push(Victim {
                block_id: candidate.block_id,
                location: candidate.location,
                length: candidate.length,
                action: candidate.action,
            });
            if dir.available().saturating_add(*freed) >= size {
                let freed = *freed;
                let victims = std::mem::take(victims);
                debug!(
                    tier = tier.alias(),
                    dir = candidate.location.dir,
                    victims = victims.len(),
                    freed,
                    required = size,
                    "eviction planned"
                );
                return Ok(EvictionPlan {
                    target: candidate.location,
                    victims,
                    freed,
                });
            }
        }

        Err(Error::EvictionFailed {
            tier: tier.alias().to_string(),
            required: size,
        })
    }
}
