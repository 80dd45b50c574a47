//! tierio Storage Engine - tiered block storage
//!
//! This crate implements the worker-side storage engine:
//! - Storage tiers and directories with exact space accounting
//! - Directory allocation (most-available or round-robin)
//! - Victim selection and eviction (LRU, LFU, demotion)
//! - Block files with write-then-rename commit
//! - The block store tying these together

pub mod allocator;
pub mod evictor;
pub mod file;
pub mod meta;
pub mod store;
pub mod tier;

// Re-exports
pub use allocator::Allocator;
pub use evictor::{Candidate, EvictionPlan, Evictor, Victim, VictimAction};
pub use file::{BlockReader, BlockWriter};
pub use meta::{BlockMeta, BlockOptions, BlockState, PersistState, now_ms};
pub use store::{BlockStore, RemovalReason, StoreEvent, StoreStats};
pub use tier::{DirRef, StorageDir, StorageTier, TierLayout};
