//! In-memory connector, used by tests and single-process setups

use crate::UnderFileSystem;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tierio_common::{Error, Result};

/// UFS held in a map, with switches for injecting failures
#[derive(Debug, Default)]
pub struct MemoryUfs {
    objects: RwLock<HashMap<String, Bytes>>,
    /// Number of upcoming writes that fail
    failing_writes: AtomicU32,
    /// When false every call fails
    unavailable: AtomicBool,
    /// Added latency per write, in milliseconds
    write_delay_ms: AtomicU64,
    write_attempts: AtomicU64,
}

impl MemoryUfs {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` writes fail
    pub fn fail_next_writes(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn set_write_delay(&self, delay: Duration) {
        self.write_delay_ms.store(
            u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            Ordering::SeqCst,
        );
    }

    /// Writes attempted so far, failed ones included
    #[must_use]
    pub fn write_attempts(&self) -> u64 {
        self.write_attempts.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn get(&self, path: &str) -> Option<Bytes> {
        self.objects.read().get(path).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::ufs("memory ufs unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl UnderFileSystem for MemoryUfs {
    fn name(&self) -> &str {
        "memory"
    }

    async fn read_range(&self, path: &str, offset: u64, len: u64) -> Result<Bytes> {
        self.check_available()?;
        let object = self
            .get(path)
            .ok_or_else(|| Error::ufs(format!("no such object: {path}")))?;
        let size = object.len() as u64;
        let start = offset.min(size);
        let end = offset.saturating_add(len).min(size);
        let (start, end) = (
            usize::try_from(start).unwrap_or(usize::MAX),
            usize::try_from(end).unwrap_or(usize::MAX),
        );
        Ok(object.slice(start..end))
    }

    async fn write_all(&self, path: &str, data: Bytes) -> Result<()> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        let delay = self.write_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.check_available()?;
        let injected = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::ufs(format!("injected write failure: {path}")));
        }
        self.objects.write().insert(path.to_string(), data);
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.check_available()?;
        Ok(self.objects.read().contains_key(path))
    }
}
