//! Block reader with UFS fallback
//!
//! Cached replicas are tried in the order the master lists them. When none
//! can serve the block it is read from the under file system and, if
//! enabled, written back into a worker as a cache-only copy.

use crate::master::MasterClient;
use crate::worker::{WorkerDataPlane, WorkerPool};
use crate::writer::{ClientOptions, stream_block};
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use tierio_common::{BlockId, Error, Result, WorkerId, WriteRequest, WriteType};
use tierio_placement::PlacementRequest;
use tierio_ufs::UnderFileSystem;
use tracing::{debug, info, warn};

/// Where the bytes of a read came from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadSource {
    Worker(WorkerId),
    Ufs,
}

#[derive(Clone, Debug)]
pub struct ReadOutcome {
    pub data: Bytes,
    pub source: ReadSource,
}

/// Reads block ranges from workers, falling back to the UFS
pub struct BlockReader {
    master: Arc<dyn MasterClient>,
    workers: WorkerPool,
    ufs: Option<Arc<dyn UnderFileSystem>>,
    options: ClientOptions,
}

impl BlockReader {
    #[must_use]
    pub fn new(
        master: Arc<dyn MasterClient>,
        workers: WorkerPool,
        ufs: Option<Arc<dyn UnderFileSystem>>,
        options: ClientOptions,
    ) -> Self {
        Self {
            master,
            workers,
            ufs,
            options,
        }
    }

    /// Read up to `len` bytes of a block starting at `offset`
    pub async fn read(
        &self,
        block_id: BlockId,
        ufs_path: Option<&str>,
        offset: u64,
        len: u64,
    ) -> Result<ReadOutcome> {
        let locations = match self.master.block_locations(block_id).await {
            Ok(locations) => locations,
            Err(e) => {
                warn!(%block_id, error = %e, "block locations unavailable, trying the UFS");
                Vec::new()
            }
        };

        for worker_id in locations {
            let Some(worker) = self.workers.get(worker_id) else {
                continue;
            };
            match read_range(worker.as_ref(), block_id, offset, len, self.options.chunk_size).await {
                Ok(data) => {
                    return Ok(ReadOutcome {
                        data,
                        source: ReadSource::Worker(worker_id),
                    });
                }
                Err(e) => debug!(%block_id, %worker_id, error = %e, "cached read failed"),
            }
        }

        let (Some(ufs), Some(path)) = (&self.ufs, ufs_path) else {
            return Err(Error::BlockNotFound(block_id));
        };
        if !self.options.recache {
            let data = ufs.read_range(path, offset, len).await?;
            return Ok(ReadOutcome {
                data,
                source: ReadSource::Ufs,
            });
        }

        let whole = ufs.read_range(path, 0, u64::MAX).await?;
        self.recache(block_id, whole.clone()).await;
        Ok(ReadOutcome {
            data: slice_range(&whole, offset, len),
            source: ReadSource::Ufs,
        })
    }

    /// Write a block fetched from the UFS back into a worker.
    /// Failures only cost the next reader another UFS fetch.
    async fn recache(&self, block_id: BlockId, data: Bytes) {
        if data.is_empty() {
            return;
        }
        let length = data.len() as u64;
        let request = WriteRequest::new(length)
            .with_write_type(WriteType::CacheOnly)
            .with_expected_length(length);

        let view = match self.master.cluster_view().await {
            Ok(view) => view,
            Err(e) => {
                debug!(%block_id, error = %e, "no cluster view, skipping re-cache");
                return;
            }
        };
        let placement = PlacementRequest::new(block_id, length, 1).with_tier(request.tier);
        let Some(worker) = self
            .options
            .location_policy(&request)
            .choose(view.active_workers(), &placement)
            .into_iter()
            .find_map(|id| self.workers.get(id))
        else {
            debug!(%block_id, "no worker with room for re-cache");
            return;
        };

        match stream_block(worker.as_ref(), block_id, request, data, self.options.chunk_size).await {
            Ok(_) => info!(%block_id, worker_id = %worker.worker_id(), length, "block re-cached"),
            Err(e) => warn!(%block_id, error = %e, "re-cache failed"),
        }
    }
}

/// Read a range through a worker read handle, closing it afterwards
async fn read_range(
    worker: &dyn WorkerDataPlane,
    block_id: BlockId,
    offset: u64,
    len: u64,
    chunk_size: usize,
) -> Result<Bytes> {
    let handle = worker.open_block_read(block_id, offset).await?;
    let read = async {
        let mut buf = BytesMut::new();
        let mut remaining = len;
        while remaining > 0 {
            let want = remaining.min(chunk_size.max(1) as u64);
            let chunk = worker.read_chunk(handle, want).await?;
            if chunk.is_empty() {
                break;
            }
            remaining = remaining.saturating_sub(chunk.len() as u64);
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }
    .await;

    if let Err(e) = worker.close_block_read(handle).await {
        debug!(%block_id, %handle, error = %e, "closing read handle");
    }
    read
}

fn slice_range(data: &Bytes, offset: u64, len: u64) -> Bytes {
    let size = data.len();
    let start = usize::try_from(offset).unwrap_or(usize::MAX).min(size);
    let end = start
        .saturating_add(usize::try_from(len).unwrap_or(usize::MAX))
        .min(size);
    data.slice(start..end)
}
