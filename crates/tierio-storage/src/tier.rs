//! Storage tiers and directories
//!
//! A worker has an ordered list of tiers (fastest first). Each tier owns one
//! or more directories with a fixed byte capacity and a live used counter.
//! The counter is only ever moved with compare-and-swap, so it can never pass
//! the capacity even while reservations race.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tierio_common::config::TierConfig;
use tierio_common::{Error, Result, TierUsage, resolve_tier_index};

/// Address of one directory: (tier index, directory index within the tier)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DirRef {
    pub tier: usize,
    pub dir: usize,
}

impl DirRef {
    #[must_use]
    pub const fn new(tier: usize, dir: usize) -> Self {
        Self { tier, dir }
    }
}

/// One local directory holding block files
#[derive(Debug)]
pub struct StorageDir {
    location: DirRef,
    path: PathBuf,
    capacity: u64,
    used: AtomicU64,
}

impl StorageDir {
    #[must_use]
    pub fn new(location: DirRef, path: impl Into<PathBuf>, capacity: u64) -> Self {
        Self {
            location,
            path: path.into(),
            capacity,
            used: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub const fn location(&self) -> DirRef {
        self.location
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn capacity(&self) -> u64 {
        self.capacity
    }

    #[must_use]
    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn available(&self) -> u64 {
        self.capacity.saturating_sub(self.used())
    }

    /// Reserve `bytes` if they fit; never lets `used` exceed `capacity`
    pub fn try_reserve(&self, bytes: u64) -> bool {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|next| *next <= self.capacity)
            })
            .is_ok()
    }

    /// Return previously reserved bytes
    pub fn release(&self, bytes: u64) {
        // Saturate rather than wrap if a caller over-releases
        let _ = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(bytes))
            });
    }

    /// Directory for partially written blocks
    #[must_use]
    pub fn temp_dir(&self) -> PathBuf {
        self.path.join(".tmp")
    }
}

/// One storage tier
#[derive(Debug)]
pub struct StorageTier {
    index: usize,
    alias: String,
    dirs: Vec<StorageDir>,
    /// Serializes eviction with the reservations that depend on it
    space_lock: Mutex<()>,
}

impl StorageTier {
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub fn alias(&self) -> &str {
        &self.alias
    }

    #[must_use]
    pub fn dirs(&self) -> &[StorageDir] {
        &self.dirs
    }

    #[must_use]
    pub fn dir(&self, index: usize) -> Option<&StorageDir> {
        self.dirs.get(index)
    }

    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.dirs.iter().map(StorageDir::capacity).sum()
    }

    #[must_use]
    pub fn used(&self) -> u64 {
        self.dirs.iter().map(StorageDir::used).sum()
    }

    pub(crate) fn space_lock(&self) -> parking_lot::MutexGuard<'_, ()> {
        self.space_lock.lock()
    }

    #[must_use]
    pub fn usage(&self) -> TierUsage {
        TierUsage {
            alias: self.alias.clone(),
            capacity: self.capacity(),
            used: self.used(),
        }
    }
}

/// All tiers of a worker, fastest first
#[derive(Debug)]
pub struct TierLayout {
    tiers: Vec<StorageTier>,
}

impl TierLayout {
    /// Build the layout from configuration
    pub fn from_config(tiers: &[TierConfig]) -> Result<Self> {
        if tiers.is_empty() {
            return Err(Error::configuration("at least one storage tier is required"));
        }
        let tiers = tiers
            .iter()
            .enumerate()
            .map(|(t, tier)| StorageTier {
                index: t,
                alias: tier.alias.clone(),
                dirs: tier
                    .dirs
                    .iter()
                    .enumerate()
                    .map(|(d, dir)| StorageDir::new(DirRef::new(t, d), &dir.path, dir.capacity))
                    .collect(),
                space_lock: Mutex::new(()),
            })
            .collect();
        Ok(Self { tiers })
    }

    /// Resolve a signed tier index to a tier position
    pub fn resolve(&self, tier: i32) -> Result<usize> {
        resolve_tier_index(tier, self.tiers.len())
            .ok_or_else(|| Error::invalid_argument(format!("no tier for index {tier}")))
    }

    #[must_use]
    pub fn tiers(&self) -> &[StorageTier] {
        &self.tiers
    }

    #[must_use]
    pub fn tier(&self, index: usize) -> Option<&StorageTier> {
        self.tiers.get(index)
    }

    #[must_use]
    pub fn dir(&self, location: DirRef) -> Option<&StorageDir> {
        self.tier(location.tier).and_then(|t| t.dir(location.dir))
    }

    /// Every directory across every tier
    pub fn all_dirs(&self) -> impl Iterator<Item = &StorageDir> {
        self.tiers.iter().flat_map(|t| t.dirs.iter())
    }

    #[must_use]
    pub fn usage(&self) -> Vec<TierUsage> {
        self.tiers.iter().map(StorageTier::usage).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tierio_common::config::DirConfig;

    fn layout(capacities: &[&[u64]]) -> TierLayout {
        let tiers: Vec<TierConfig> = capacities
            .iter()
            .enumerate()
            .map(|(t, dirs)| TierConfig {
                alias: format!("T{t}"),
                dirs: dirs
                    .iter()
                    .enumerate()
                    .map(|(d, cap)| DirConfig {
                        path: PathBuf::from(format!("/tmp/t{t}/d{d}")),
                        capacity: *cap,
                    })
                    .collect(),
            })
            .collect();
        TierLayout::from_config(&tiers).unwrap()
    }

    #[test]
    fn test_reserve_and_release() {
        let dir = StorageDir::new(DirRef::new(0, 0), "/tmp/x", 100);
        assert!(dir.try_reserve(60));
        assert!(!dir.try_reserve(41));
        assert!(dir.try_reserve(40));
        assert_eq!(dir.available(), 0);
        dir.release(100);
        assert_eq!(dir.used(), 0);
        dir.release(5);
        assert_eq!(dir.used(), 0);
    }

    #[test]
    fn test_concurrent_reserve_never_exceeds_capacity() {
        let dir = Arc::new(StorageDir::new(DirRef::new(0, 0), "/tmp/x", 1000));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let dir = Arc::clone(&dir);
                std::thread::spawn(move || (0..100).filter(|_| dir.try_reserve(7)).count())
            })
            .collect();
        let granted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(granted, 1000 / 7);
        assert!(dir.used() <= dir.capacity());
    }

    #[test]
    fn test_layout_resolve() {
        let layout = layout(&[&[10], &[20, 30], &[40]]);
        assert_eq!(layout.resolve(0).unwrap(), 0);
        assert_eq!(layout.resolve(-1).unwrap(), 2);
        assert_eq!(layout.resolve(9).unwrap(), 2);
        assert_eq!(layout.tier(1).unwrap().capacity(), 50);
        assert_eq!(layout.all_dirs().count(), 4);
        assert_eq!(layout.dir(DirRef::new(1, 1)).unwrap().capacity(), 30);
    }

    #[test]
    fn test_empty_layout_rejected() {
        assert!(TierLayout::from_config(&[]).is_err());
    }
}
