//! tierio Worker - block worker service
//!
//! This crate provides:
//! - The client-facing block data plane over the local block store
//! - Write and read sessions with deadlines
//! - The persist coordinator for UFS write-through
//! - The heartbeat bridge to the master
//! - Prometheus metrics

pub mod heartbeat;
pub mod metrics;
pub mod persist;
pub mod runtime;
pub mod service;
pub mod session;

// Re-exports
pub use heartbeat::HeartbeatBridge;
pub use metrics::WorkerMetrics;
pub use persist::{PersistCoordinator, PersistJob, PersistMode};
pub use runtime::{WorkerHandle, spawn_reaper};
pub use service::BlockWorker;
pub use session::{ReadSession, SessionState, WriteSession};
