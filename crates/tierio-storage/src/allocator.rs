//! Tier space allocator
//!
//! Picks a directory inside a tier for a new reservation. Reservations are
//! provisional: the block store releases them on abort and turns them into
//! block accounting on commit.

use crate::tier::{DirRef, StorageTier};
use std::cmp::Reverse;
use std::sync::atomic::{AtomicUsize, Ordering};
use tierio_common::config::AllocationStrategy;
use tierio_common::{Error, Result};

/// Directory allocator for one worker
#[derive(Debug)]
pub struct Allocator {
    strategy: AllocationStrategy,
    /// Round-robin cursor per tier
    cursors: Vec<AtomicUsize>,
}

impl Allocator {
    #[must_use]
    pub fn new(strategy: AllocationStrategy, tier_count: usize) -> Self {
        Self {
            strategy,
            cursors: (0..tier_count).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    #[must_use]
    pub const fn strategy(&self) -> AllocationStrategy {
        self.strategy
    }

    /// Reserve `size` bytes in some directory of `tier`.
    ///
    /// Fails with `NoSpaceAvailable` when no directory has room; the caller
    /// treats that as a request to evict.
    pub fn reserve(&self, tier: &StorageTier, size: u64) -> Result<DirRef> {
        let order = self.candidate_order(tier);
        for idx in order {
            if let Some(dir) = tier.dir(idx)
                && dir.try_reserve(size)
            {
                return Ok(dir.location());
            }
        }
        Err(Error::NoSpaceAvailable {
            tier: tier.alias().to_string(),
            required: size,
        })
    }

    /// Reserve more bytes in a specific directory (growing a block in place)
    pub fn reserve_in(&self, tier: &StorageTier, location: DirRef, size: u64) -> Result<()> {
        match tier.dir(location.dir) {
            Some(dir) if dir.try_reserve(size) => Ok(()),
            Some(_) => Err(Error::NoSpaceAvailable {
                tier: tier.alias().to_string(),
                required: size,
            }),
            None => Err(Error::internal(format!("unknown directory {location:?}"))),
        }
    }

    fn candidate_order(&self, tier: &StorageTier) -> Vec<usize> {
        let count = tier.dirs().len();
        match self.strategy {
            AllocationStrategy::MostAvailable => {
                let mut order: Vec<(u64, usize)> = tier
                    .dirs()
                    .iter()
                    .enumerate()
                    .map(|(i, d)| (d.available(), i))
                    .collect();
                order.sort_by_key(|&(free, i)| (Reverse(free), i));
                order.into_iter().map(|(_, i)| i).collect()
            }
            AllocationStrategy::RoundRobin => {
                if count == 0 {
                    return Vec::new();
                }
                let start = self
                    .cursors
                    .get(tier.index())
                    .map_or(0, |c| c.fetch_add(1, Ordering::Relaxed));
                (0..count).map(|i| (start + i) % count).collect()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tier::TierLayout;
    use std::path::PathBuf;
    use tierio_common::config::{DirConfig, TierConfig};

    fn tier_layout(capacities: &[u64]) -> TierLayout {
        TierLayout::from_config(&[TierConfig {
            alias: "MEM".to_string(),
            dirs: capacities
                .iter()
                .enumerate()
                .map(|(d, cap)| DirConfig {
                    path: PathBuf::from(format!("/tmp/d{d}")),
                    capacity: *cap,
                })
                .collect(),
        }])
        .unwrap()
    }

    #[test]
    fn test_most_available_balances() {
        let layout = tier_layout(&[100, 100]);
        let tier = layout.tier(0).unwrap();
        let allocator = Allocator::new(AllocationStrategy::MostAvailable, 1);

        assert_eq!(allocator.reserve(tier, 30).unwrap(), DirRef::new(0, 0));
        assert_eq!(allocator.reserve(tier, 30).unwrap(), DirRef::new(0, 1));
        assert_eq!(allocator.reserve(tier, 50).unwrap(), DirRef::new(0, 0));
        assert_eq!(allocator.reserve(tier, 70).unwrap(), DirRef::new(0, 1));
        assert!(matches!(
            allocator.reserve(tier, 21),
            Err(Error::NoSpaceAvailable { required: 21, .. })
        ));
        assert_eq!(tier.used(), 180);
    }

    #[test]
    fn test_round_robin_rotates() {
        let layout = tier_layout(&[100, 100, 100]);
        let tier = layout.tier(0).unwrap();
        let allocator = Allocator::new(AllocationStrategy::RoundRobin, 1);

        let dirs: Vec<usize> = (0..4)
            .map(|_| allocator.reserve(tier, 10).unwrap().dir)
            .collect();
        assert_eq!(dirs, vec![0, 1, 2, 0]);
    }

    #[test]
    fn test_round_robin_skips_full_dir() {
        let layout = tier_layout(&[10, 100]);
        let tier = layout.tier(0).unwrap();
        let allocator = Allocator::new(AllocationStrategy::RoundRobin, 1);

        assert_eq!(allocator.reserve(tier, 50).unwrap().dir, 1);
        assert_eq!(allocator.reserve(tier, 50).unwrap().dir, 1);
    }

    #[test]
    fn test_reserve_in_place() {
        let layout = tier_layout(&[100]);
        let tier = layout.tier(0).unwrap();
        let allocator = Allocator::new(AllocationStrategy::MostAvailable, 1);
        let loc = allocator.reserve(tier, 60).unwrap();
        assert!(allocator.reserve_in(tier, loc, 40).is_ok());
        assert!(allocator.reserve_in(tier, loc, 1).is_err());
    }
}
