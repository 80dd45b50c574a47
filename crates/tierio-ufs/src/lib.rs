//! tierio UFS - under file system connectors
//!
//! The worker only needs three operations from a backing store: read a byte
//! range, write a whole object, and check existence. `write_all` either
//! fully succeeds or leaves no valid data at the path.

use async_trait::async_trait;
use bytes::Bytes;
use tierio_common::Result;

pub mod local;
pub mod memory;

pub use local::LocalUfs;
pub use memory::MemoryUfs;

/// Byte-addressable durable store beneath the cache tier
#[async_trait]
pub trait UnderFileSystem: Send + Sync {
    /// Connector name for logging
    fn name(&self) -> &str;

    /// Read up to `len` bytes at `offset`; shorter at end of object
    async fn read_range(&self, path: &str, offset: u64, len: u64) -> Result<Bytes>;

    /// Write a whole object
    async fn write_all(&self, path: &str, data: Bytes) -> Result<()>;

    async fn exists(&self, path: &str) -> Result<bool>;
}
