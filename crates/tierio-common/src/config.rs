//! Configuration types for tierio
//!
//! This module defines the configuration structures read by the worker.
//! Every section has defaults so a config file only needs to name what it
//! changes.

use crate::error::{Error, Result};
use crate::types::{LocationPolicyKind, WorkerId, WriteRequest, WriteType};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for a worker
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker identity and listeners
    pub worker: WorkerSection,
    /// Storage tiers, fastest first
    pub tiers: Vec<TierConfig>,
    /// Allocation and eviction strategy
    pub storage: StorageSection,
    /// Defaults applied to client writes
    pub user: UserDefaults,
    /// Backing-store flush behaviour
    pub persist: PersistConfig,
    /// Master reporting
    pub heartbeat: HeartbeatConfig,
    /// Client session deadlines
    pub session: SessionConfig,
    /// Backing store location
    pub ufs: UfsConfig,
    /// Logging
    pub logging: LoggingConfig,
}

impl WorkerConfig {
    /// Check the configuration before the worker starts
    pub fn validate(&self) -> Result<()> {
        if self.tiers.is_empty() {
            return Err(Error::configuration("at least one storage tier is required"));
        }
        for tier in &self.tiers {
            if tier.dirs.is_empty() {
                return Err(Error::configuration(format!(
                    "tier {} has no directories",
                    tier.alias
                )));
            }
            if let Some(dir) = tier.dirs.iter().find(|d| d.capacity == 0) {
                return Err(Error::configuration(format!(
                    "directory {} in tier {} has zero capacity",
                    dir.path.display(),
                    tier.alias
                )));
            }
        }
        if self.user.block_size == 0 {
            return Err(Error::configuration("block size must be positive"));
        }
        if self.user.replication_min > self.user.replication_max {
            return Err(Error::configuration(format!(
                "replication min {} exceeds replication max {}",
                self.user.replication_min, self.user.replication_max
            )));
        }
        if self.persist.max_attempts == 0 {
            return Err(Error::configuration("persist max_attempts must be at least 1"));
        }
        Ok(())
    }
}

/// Worker identity and network configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    /// Fixed worker id; a random one is generated when absent
    pub id: Option<WorkerId>,
    /// Hostname advertised to clients (used by local-first placement)
    pub hostname: String,
    /// Port for the Prometheus endpoint
    pub metrics_port: u16,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            id: None,
            hostname: "localhost".to_string(),
            metrics_port: 9203,
        }
    }
}

/// One storage tier
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TierConfig {
    /// Tier alias (e.g. "MEM", "SSD", "HDD")
    pub alias: String,
    /// Directories backing this tier
    pub dirs: Vec<DirConfig>,
}

/// One storage directory inside a tier
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DirConfig {
    /// Local path holding block files
    pub path: PathBuf,
    /// Byte capacity granted to this directory
    pub capacity: u64,
}

/// How a directory is chosen within a tier
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStrategy {
    /// Directory with the most free bytes first
    #[default]
    MostAvailable,
    /// Rotate across directories
    RoundRobin,
}

/// How eviction victims are chosen
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Least recently accessed first
    #[default]
    Lru,
    /// Least frequently accessed first
    Lfu,
    /// LRU order, but blocks without a UFS copy move to the next tier
    Demote,
}

/// Storage strategy configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub allocation: AllocationStrategy,
    pub eviction: EvictionPolicy,
}

/// Defaults applied when a client does not override them
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct UserDefaults {
    /// Upper bound on bytes per block (default: 64 MB)
    pub block_size: u64,
    pub write_type: WriteType,
    pub replication_min: u32,
    pub replication_max: u32,
    pub replication_durable: u32,
    pub location_policy: LocationPolicyKind,
    /// Preferred tier (signed, -1 is the slowest)
    pub write_tier: i32,
}

impl Default for UserDefaults {
    fn default() -> Self {
        Self {
            block_size: 64 * 1024 * 1024, // 64 MB
            write_type: WriteType::AsyncThrough,
            replication_min: 0,
            replication_max: 1,
            replication_durable: 1,
            location_policy: LocationPolicyKind::LocalFirst,
            write_tier: 0,
        }
    }
}

impl UserDefaults {
    /// Build a write request from these defaults
    #[must_use]
    pub fn write_request(&self) -> WriteRequest {
        WriteRequest::new(self.block_size)
            .with_tier(self.write_tier)
            .with_write_type(self.write_type)
            .with_replication(
                self.replication_min,
                self.replication_max,
                self.replication_durable,
            )
            .with_location_policy(self.location_policy)
    }
}

/// Backing-store flush configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistConfig {
    /// Attempts per block before it is marked persist-failed
    pub max_attempts: u32,
    /// Backoff before the second attempt (milliseconds)
    pub initial_backoff_ms: u64,
    /// Backoff ceiling (milliseconds)
    pub max_backoff_ms: u64,
    /// Bound on a synchronous flush (milliseconds)
    pub sync_timeout_ms: u64,
    /// Concurrent background flushes
    pub workers: usize,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
            sync_timeout_ms: 30_000,
            workers: 4,
        }
    }
}

impl PersistConfig {
    /// Backoff to wait after `attempt` failures (1-based)
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }

    #[must_use]
    pub const fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }
}

/// Master reporting configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Interval between heartbeats (milliseconds)
    pub interval_ms: u64,
    /// First retry delay after a failed heartbeat (milliseconds)
    pub initial_backoff_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            initial_backoff_ms: 500,
        }
    }
}

impl HeartbeatConfig {
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Delay after `failures` consecutive failed heartbeats, capped at 8 intervals
    #[must_use]
    pub fn backoff(&self, failures: u32) -> Duration {
        let shift = failures.saturating_sub(1).min(16);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.interval_ms.saturating_mul(8));
        Duration::from_millis(ms)
    }
}

/// Client session configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Deadline for an idle session before it is reaped (milliseconds)
    pub timeout_ms: u64,
    /// How often expired sessions are looked for (milliseconds)
    pub reaper_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 60_000,
            reaper_interval_ms: 5_000,
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    #[must_use]
    pub const fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms)
    }
}

/// Backing store configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct UfsConfig {
    /// Root directory of the local UFS connector
    pub root: PathBuf,
}

impl Default for UfsConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/lib/tierio/ufs"),
        }
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
