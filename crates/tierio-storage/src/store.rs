//! Block store
//!
//! Owns every block resident on this worker. Blocks move through
//! `Allocating -> Committed -> Evicting -> removed`; the state lives in the
//! block's index entry and every transition happens under that entry's lock.
//! Space comes from the [`Allocator`]; when a tier is full the [`Evictor`]
//! plans victims and the store applies the plan.

use crate::allocator::Allocator;
use crate::evictor::{EvictionPlan, Evictor, Victim, VictimAction};
use crate::file::{
    BlockReader, BlockWriter, ReadPin, TempBlockFile, block_path, parse_block_file, temp_path,
};
use crate::meta::{BlockEntry, BlockMeta, BlockOptions, BlockState, EntryState, PersistState};
use crate::tier::{DirRef, StorageDir, StorageTier, TierLayout};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tierio_common::config::{StorageSection, TierConfig};
use tierio_common::{BlockId, Error, Result, TierUsage};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Why a block left the store
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemovalReason {
    /// Chosen by the evictor
    Evicted,
    /// Removed on request (master free command)
    Freed,
}

/// Inventory changes, consumed by the heartbeat bridge
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreEvent {
    Committed(BlockMeta),
    Removed {
        block_id: BlockId,
        reason: RemovalReason,
    },
    PersistFailed(BlockId),
}

/// Block store statistics
#[derive(Debug, Default)]
pub struct StoreStats {
    pub blocks_committed: AtomicU64,
    pub blocks_aborted: AtomicU64,
    pub bytes_committed: AtomicU64,
    pub evictions: AtomicU64,
    pub evicted_bytes: AtomicU64,
    pub demotions: AtomicU64,
    pub reserve_failures: AtomicU64,
}

/// Tiered block store for one worker
pub struct BlockStore {
    layout: TierLayout,
    allocator: Allocator,
    evictor: Evictor,
    index: DashMap<BlockId, Arc<BlockEntry>>,
    /// Logical clock for access ordering
    clock: Arc<AtomicU64>,
    events: Mutex<Option<mpsc::UnboundedSender<StoreEvent>>>,
    stats: StoreStats,
}

impl BlockStore {
    /// Wipe every configured directory
    pub fn format(tiers: &[TierConfig]) -> Result<()> {
        for dir in tiers.iter().flat_map(|t| t.dirs.iter()) {
            if dir.path.exists() {
                std::fs::remove_dir_all(&dir.path)?;
            }
            std::fs::create_dir_all(&dir.path)?;
            info!(path = %dir.path.display(), "formatted storage directory");
        }
        Ok(())
    }

    /// Open the store, creating missing directories and reloading
    /// committed block files left by a previous run
    pub fn open(tiers: &[TierConfig], storage: &StorageSection) -> Result<Self> {
        let layout = TierLayout::from_config(tiers)?;
        let store = Self {
            allocator: Allocator::new(storage.allocation, layout.tiers().len()),
            evictor: Evictor::new(storage.eviction),
            layout,
            index: DashMap::new(),
            clock: Arc::new(AtomicU64::new(0)),
            events: Mutex::new(None),
            stats: StoreStats::default(),
        };

        for dir in store.layout.all_dirs() {
            std::fs::create_dir_all(dir.path())?;
            let tmp = dir.temp_dir();
            if tmp.exists() {
                std::fs::remove_dir_all(&tmp)?;
            }
            std::fs::create_dir_all(&tmp)?;
            store.reload_dir(dir)?;
        }

        info!(
            tiers = store.layout.tiers().len(),
            blocks = store.index.len(),
            "block store opened"
        );
        Ok(store)
    }

    fn reload_dir(&self, dir: &StorageDir) -> Result<()> {
        for item in std::fs::read_dir(dir.path())? {
            let path = item?.path();
            if !path.is_file() {
                continue;
            }
            let Some(block_id) = parse_block_file(&path) else {
                continue;
            };
            let bytes = std::fs::read(&path)?;
            let length = bytes.len() as u64;
            if self.index.contains_key(&block_id) || !dir.try_reserve(length) {
                warn!(%block_id, path = %path.display(), "discarding block file on open");
                remove_file_quietly(&path);
                continue;
            }
            let entry = BlockEntry::new(
                block_id,
                EntryState {
                    location: dir.location(),
                    length,
                    state: BlockState::Committed,
                    persist: PersistState::NotRequired,
                    options: BlockOptions::cache_only(),
                    checksum: crc32c::crc32c(&bytes),
                },
                self.tick(),
            );
            self.index.insert(block_id, Arc::new(entry));
            debug!(%block_id, length, "reloaded block");
        }
        Ok(())
    }

    /// Receive inventory events; replaces any earlier subscriber
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<StoreEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events.lock() = Some(tx);
        rx
    }

    fn emit(&self, event: StoreEvent) {
        if let Some(tx) = self.events.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    #[must_use]
    pub const fn layout(&self) -> &TierLayout {
        &self.layout
    }

    #[must_use]
    pub const fn stats(&self) -> &StoreStats {
        &self.stats
    }

    #[must_use]
    pub fn tier_usage(&self) -> Vec<TierUsage> {
        self.layout.usage()
    }

    fn tier(&self, index: usize) -> Result<&StorageTier> {
        self.layout
            .tier(index)
            .ok_or_else(|| Error::internal(format!("unknown tier {index}")))
    }

    fn dir(&self, location: DirRef) -> Result<&StorageDir> {
        self.layout
            .dir(location)
            .ok_or_else(|| Error::internal(format!("unknown directory {location:?}")))
    }

    fn entry(&self, block_id: BlockId) -> Option<Arc<BlockEntry>> {
        self.index.get(&block_id).map(|e| Arc::clone(e.value()))
    }

    // ---- write path ----

    /// Start a new block in `tier`, reserving `initial` bytes up front.
    ///
    /// The block stays invisible to readers until [`Self::commit_block`].
    pub fn create_block(
        &self,
        block_id: BlockId,
        tier: i32,
        initial: u64,
        limit: u64,
        options: BlockOptions,
    ) -> Result<BlockWriter> {
        if initial > limit {
            return Err(Error::invalid_argument(format!(
                "initial reservation {initial} exceeds block size {limit}"
            )));
        }
        let tier_idx = self.layout.resolve(tier)?;

        let entry = match self.index.entry(block_id) {
            Entry::Occupied(_) => return Err(Error::BlockAlreadyExists(block_id)),
            Entry::Vacant(slot) => {
                let entry = Arc::new(BlockEntry::new(
                    block_id,
                    EntryState {
                        location: DirRef::new(tier_idx, 0),
                        length: 0,
                        state: BlockState::Allocating,
                        persist: PersistState::NotRequired,
                        options,
                        checksum: 0,
                    },
                    self.tick(),
                ));
                slot.insert(Arc::clone(&entry));
                entry
            }
        };

        let location = match self.reserve_space(tier_idx, initial, None) {
            Ok(location) => location,
            Err(e) => {
                self.index.remove(&block_id);
                return Err(e);
            }
        };
        entry.inner.lock().location = location;

        let dir = self.dir(location)?;
        let file = match TempBlockFile::create(temp_path(dir, block_id)) {
            Ok(file) => file,
            Err(e) => {
                dir.release(initial);
                self.index.remove(&block_id);
                return Err(e);
            }
        };

        debug!(%block_id, tier = tier_idx, dir = location.dir, reserved = initial, "block created");
        Ok(BlockWriter {
            block_id,
            location,
            reserved: initial,
            limit,
            file,
            entry,
        })
    }

    /// Append bytes, growing the reservation in place when needed
    pub fn append(&self, writer: &mut BlockWriter, data: &[u8]) -> Result<()> {
        let next = writer.written() + data.len() as u64;
        if next > writer.limit {
            return Err(Error::BlockSizeExceeded {
                written: next,
                limit: writer.limit,
            });
        }
        if next > writer.reserved {
            let extra = next - writer.reserved;
            self.reserve_space(writer.location.tier, extra, Some(writer.location.dir))?;
            writer.reserved += extra;
        }
        writer.file.append(data)?;
        writer.entry.inner.lock().length = next;
        Ok(())
    }

    /// Make a block immutable and visible; returns its final metadata
    pub fn commit_block(&self, writer: BlockWriter, persist: PersistState) -> Result<BlockMeta> {
        let BlockWriter {
            block_id,
            location,
            reserved,
            file,
            entry,
            ..
        } = writer;
        let dir = self.dir(location)?;
        let temp = file.path().to_path_buf();

        let finished = file.finish().and_then(|(path, length, crc)| {
            std::fs::rename(&path, block_path(dir, block_id))?;
            Ok((length, crc))
        });
        let (length, checksum) = match finished {
            Ok(done) => done,
            Err(e) => {
                warn!(%block_id, error = %e, "commit failed, discarding block");
                remove_file_quietly(&temp);
                dir.release(reserved);
                self.index.remove(&block_id);
                return Err(e);
            }
        };

        if reserved > length {
            dir.release(reserved - length);
        }
        {
            let mut inner = entry.inner.lock();
            inner.state = BlockState::Committed;
            inner.length = length;
            inner.checksum = checksum;
            inner.persist = persist;
        }
        entry.touch(self.tick());

        self.stats.blocks_committed.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_committed.fetch_add(length, Ordering::Relaxed);
        let meta = entry.snapshot();
        info!(%block_id, length, tier = location.tier, dir = location.dir, persist = ?persist, "block committed");
        self.emit(StoreEvent::Committed(meta.clone()));
        Ok(meta)
    }

    /// Drop a block that was never committed and release its space
    pub fn abort_block(&self, writer: BlockWriter) {
        let block_id = writer.block_id;
        let reserved = writer.reserved;
        let location = writer.location;
        let temp = writer.file.path().to_path_buf();
        drop(writer);

        remove_file_quietly(&temp);
        if let Some(dir) = self.layout.dir(location) {
            dir.release(reserved);
        }
        self.index.remove(&block_id);
        self.stats.blocks_aborted.fetch_add(1, Ordering::Relaxed);
        debug!(%block_id, released = reserved, "block aborted");
    }

    // ---- read path ----

    /// Open a committed block for reading; pins it until the reader drops
    pub fn open_reader(&self, block_id: BlockId) -> Result<BlockReader> {
        let entry = self.entry(block_id).ok_or(Error::BlockNotFound(block_id))?;
        let (location, length) = {
            let inner = entry.inner.lock();
            if inner.state != BlockState::Committed {
                return Err(Error::BlockNotFound(block_id));
            }
            entry.pin();
            (inner.location, inner.length)
        };
        let pin = ReadPin(Arc::clone(&entry));
        entry.touch(self.tick());

        let file = File::open(block_path(self.dir(location)?, block_id))?;
        Ok(BlockReader::new(file, length, pin, Arc::clone(&self.clock)))
    }

    // ---- removal ----

    /// Remove a committed block on request. Blocks being written or read
    /// are refused so the caller can retry later.
    pub fn remove_block(&self, block_id: BlockId) -> Result<u64> {
        let entry = self.entry(block_id).ok_or(Error::BlockNotFound(block_id))?;
        let (location, length) = {
            let mut inner = entry.inner.lock();
            match inner.state {
                BlockState::Committed if entry.readers() == 0 => {
                    inner.state = BlockState::Evicting;
                    (inner.location, inner.length)
                }
                BlockState::Committed => return Err(Error::BlockLocked(block_id)),
                other => {
                    return Err(Error::InvalidBlockState {
                        block_id,
                        state: other.as_str(),
                        expected: BlockState::Committed.as_str(),
                    });
                }
            }
        };
        self.discard(block_id, location, length, RemovalReason::Freed)?;
        Ok(length)
    }

    fn discard(
        &self,
        block_id: BlockId,
        location: DirRef,
        length: u64,
        reason: RemovalReason,
    ) -> Result<()> {
        self.unlink(block_id, location, length, reason)?;
        self.dir(location)?.release(length);
        Ok(())
    }

    /// Delete a block and forget it, leaving its bytes counted as used
    fn unlink(
        &self,
        block_id: BlockId,
        location: DirRef,
        length: u64,
        reason: RemovalReason,
    ) -> Result<()> {
        let dir = self.dir(location)?;
        remove_file_quietly(&block_path(dir, block_id));
        self.index.remove(&block_id);
        debug!(%block_id, length, reason = ?reason, "block removed");
        self.emit(StoreEvent::Removed { block_id, reason });
        Ok(())
    }

    // ---- persistence bookkeeping ----

    /// Record that a durable copy now exists in the UFS
    pub fn mark_persisted(&self, block_id: BlockId) -> Result<()> {
        let entry = self.entry(block_id).ok_or(Error::BlockNotFound(block_id))?;
        entry.inner.lock().persist = PersistState::Persisted;
        Ok(())
    }

    /// Record that background persistence gave up; the block stays pinned
    /// in the tier until freed
    pub fn mark_persist_failed(&self, block_id: BlockId) -> Result<()> {
        let entry = self.entry(block_id).ok_or(Error::BlockNotFound(block_id))?;
        entry.inner.lock().persist = PersistState::Failed;
        self.emit(StoreEvent::PersistFailed(block_id));
        Ok(())
    }

    // ---- queries ----

    #[must_use]
    pub fn block_meta(&self, block_id: BlockId) -> Option<BlockMeta> {
        self.entry(block_id).map(|e| e.snapshot())
    }

    /// True when a committed copy of the block is readable here
    #[must_use]
    pub fn has_block(&self, block_id: BlockId) -> bool {
        self.entry(block_id)
            .is_some_and(|e| e.state() == BlockState::Committed)
    }

    /// Committed blocks, ordered by id
    #[must_use]
    pub fn inventory(&self) -> Vec<BlockMeta> {
        let mut blocks: Vec<BlockMeta> = self
            .entries()
            .iter()
            .map(|e| e.snapshot())
            .filter(|m| m.state == BlockState::Committed)
            .collect();
        blocks.sort_by_key(|m| m.block_id);
        blocks
    }

    fn entries(&self) -> Vec<Arc<BlockEntry>> {
        self.index.iter().map(|e| Arc::clone(e.value())).collect()
    }

    // ---- space management ----

    /// Reserve `size` bytes in a tier, evicting if necessary. With `in_dir`
    /// the reservation must land in that directory.
    fn reserve_space(&self, tier_idx: usize, size: u64, in_dir: Option<usize>) -> Result<DirRef> {
        let tier = self.tier(tier_idx)?;
        let attempt = || match in_dir {
            Some(d) => {
                let location = DirRef::new(tier_idx, d);
                self.allocator
                    .reserve_in(tier, location, size)
                    .map(|()| location)
            }
            None => self.allocator.reserve(tier, size),
        };
        if let Ok(location) = attempt() {
            return Ok(location);
        }

        let _guard = tier.space_lock();
        if let Ok(location) = attempt() {
            return Ok(location);
        }

        let result = self
            .evictor
            .plan(tier, self.eviction_candidates(tier_idx), size, in_dir)
            .and_then(|plan| self.reserve_with_eviction(&plan, size));
        result.map_err(|e| {
            self.stats.reserve_failures.fetch_add(1, Ordering::Relaxed);
            warn!(tier = tier.alias(), required = size, error = %e, "space reservation failed");
            e.into_space_error()
        })
    }

    /// Reserve `size` bytes in the plan's directory by evicting its victims.
    ///
    /// Unlocked reservations can race with this, so the free share the plan
    /// counts on is taken before any victim is touched, and the victims'
    /// bytes pass straight to the caller instead of back to the directory.
    fn reserve_with_eviction(&self, plan: &EvictionPlan, size: u64) -> Result<DirRef> {
        let dir = self.dir(plan.target)?;
        let from_free = size.saturating_sub(plan.freed);
        if from_free > 0 && !dir.try_reserve(from_free) {
            return Err(self.eviction_failed(plan));
        }
        let held = match self.apply_eviction(plan) {
            Ok(held) => from_free + held,
            Err(e) => {
                dir.release(from_free);
                return Err(e);
            }
        };

        if held >= size {
            dir.release(held - size);
            Ok(plan.target)
        } else if dir.try_reserve(size - held) {
            Ok(plan.target)
        } else {
            dir.release(held);
            Err(self.eviction_failed(plan))
        }
    }

    fn eviction_candidates(&self, tier_idx: usize) -> Vec<crate::evictor::Candidate> {
        let has_lower = tier_idx + 1 < self.layout.tiers().len();
        self.entries()
            .iter()
            .filter_map(|e| {
                let meta = e.snapshot();
                if meta.location.tier != tier_idx {
                    return None;
                }
                self.evictor.candidate(&meta, e.readers(), has_lower)
            })
            .collect()
    }

    /// Apply a plan. Every victim is claimed (`Committed -> Evicting`)
    /// before anything is deleted; if one cannot be claimed the claims are
    /// rolled back and nothing changes.
    ///
    /// Returns the bytes vacated in the plan's directory. They stay counted
    /// as used and belong to the caller.
    fn apply_eviction(&self, plan: &EvictionPlan) -> Result<u64> {
        let mut claimed: Vec<(Arc<BlockEntry>, &Victim)> = Vec::with_capacity(plan.victims.len());
        for victim in &plan.victims {
            let entry = self.entry(victim.block_id);
            let ok = entry.as_ref().is_some_and(|e| {
                let mut inner = e.inner.lock();
                let removable = victim.action == VictimAction::Demote || !inner.persist.is_sole_copy();
                if inner.state == BlockState::Committed
                    && e.readers() == 0
                    && inner.location == victim.location
                    && removable
                {
                    inner.state = BlockState::Evicting;
                    true
                } else {
                    false
                }
            });
            match entry {
                Some(e) if ok => claimed.push((e, victim)),
                _ => {
                    debug!(block_id = %victim.block_id, "eviction victim changed, rolling back");
                    rollback(&claimed);
                    return Err(self.eviction_failed(plan));
                }
            }
        }

        // Room in the next tier for every demotion, before anything moves
        let mut targets: Vec<(DirRef, u64)> = Vec::new();
        for (_, victim) in claimed.iter().filter(|(_, v)| v.action == VictimAction::Demote) {
            let reserved = self
                .tier(victim.location.tier + 1)
                .and_then(|lower| self.allocator.reserve(lower, victim.length));
            match reserved {
                Ok(location) => targets.push((location, victim.length)),
                Err(_) => {
                    for (location, length) in &targets {
                        if let Some(dir) = self.layout.dir(*location) {
                            dir.release(*length);
                        }
                    }
                    rollback(&claimed);
                    return Err(self.eviction_failed(plan));
                }
            }
        }

        let mut targets = targets.into_iter();
        let mut held = 0;
        for (entry, victim) in &claimed {
            let outcome = match victim.action {
                VictimAction::Remove => {
                    self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .evicted_bytes
                        .fetch_add(victim.length, Ordering::Relaxed);
                    self.unlink(victim.block_id, victim.location, victim.length, RemovalReason::Evicted)
                }
                VictimAction::Demote => match targets.next() {
                    Some((target, _)) => self.demote(entry, victim, target),
                    None => Err(Error::internal("missing demotion target")),
                },
            };
            match outcome {
                Ok(()) if victim.location == plan.target => held += victim.length,
                Ok(()) => {
                    if let Some(dir) = self.layout.dir(victim.location) {
                        dir.release(victim.length);
                    }
                }
                Err(e) => warn!(block_id = %victim.block_id, error = %e, "eviction of victim failed"),
            }
        }
        Ok(held)
    }

    /// Move a claimed block one tier down. The source bytes stay counted
    /// as used; the caller decides who gets them.
    fn demote(&self, entry: &BlockEntry, victim: &Victim, target: DirRef) -> Result<()> {
        let src_dir = self.dir(victim.location)?;
        let dst_dir = self.dir(target)?;
        let src = block_path(src_dir, victim.block_id);
        let dst = block_path(dst_dir, victim.block_id);

        if let Err(e) = std::fs::copy(&src, &dst) {
            warn!(block_id = %victim.block_id, error = %e, "demotion copy failed");
            remove_file_quietly(&dst);
            dst_dir.release(victim.length);
            entry.inner.lock().state = BlockState::Committed;
            return Err(e.into());
        }
        {
            let mut inner = entry.inner.lock();
            inner.location = target;
            inner.state = BlockState::Committed;
        }
        remove_file_quietly(&src);
        self.stats.demotions.fetch_add(1, Ordering::Relaxed);
        debug!(block_id = %victim.block_id, from = victim.location.tier, to = target.tier, "block demoted");
        Ok(())
    }

    fn eviction_failed(&self, plan: &EvictionPlan) -> Error {
        let alias = self
            .layout
            .tier(plan.target.tier)
            .map(|t| t.alias().to_string())
            .unwrap_or_default();
        Error::EvictionFailed {
            tier: alias,
            required: plan.freed,
        }
    }
}

fn rollback(claimed: &[(Arc<BlockEntry>, &Victim)]) {
    for (entry, _) in claimed {
        entry.inner.lock().state = BlockState::Committed;
    }
}

fn remove_file_quietly(path: &Path) {
    if let Err(e) = std::fs::remove_file(path)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "failed to remove block file");
    }
}
