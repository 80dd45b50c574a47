//! tierio Client - block write and read paths
//!
//! This crate provides:
//! - The master collaborator interface and an in-process master
//! - The worker data-plane interface a client talks to
//! - A replicating block writer and a block reader with UFS fallback

pub mod master;
pub mod reader;
pub mod worker;
pub mod writer;

#[cfg(test)]
mod testing;

// Re-exports
pub use master::{
    BlockReport, HeartbeatReport, InProcessMaster, MasterClient, MasterCommand, UnderReplicated,
};
pub use reader::{BlockReader, ReadOutcome, ReadSource};
pub use worker::{WorkerDataPlane, WorkerPool};
pub use writer::{BlockWriter, ClientOptions, WriteOutcome};
