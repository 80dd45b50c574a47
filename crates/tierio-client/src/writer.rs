//! Replicating block writer
//!
//! A write picks its workers through the placement policy, then streams the
//! same bytes to every worker concurrently. The first worker is the primary
//! replica and the only one that carries the UFS path, so a block is
//! persisted at most once however many copies are cached.

use crate::master::MasterClient;
use crate::worker::{WorkerDataPlane, WorkerPool};
use bytes::Bytes;
use futures::future::join_all;
use std::sync::Arc;
use tierio_common::{BlockId, Error, Result, WorkerId, WriteRequest, WriteType};
use tierio_placement::{ClusterView, LocationPolicy, PlacementEngine, PlacementRequest};
use tracing::{debug, info, warn};

/// Client-side settings
#[derive(Clone, Debug)]
pub struct ClientOptions {
    /// Largest chunk sent in one write or read call
    pub chunk_size: usize,
    /// Host the client runs on, for local-first placement
    pub local_hostname: Option<String>,
    /// Write blocks read from the UFS back into a worker
    pub recache: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            chunk_size: 1024 * 1024,
            local_hostname: None,
            recache: true,
        }
    }
}

impl ClientOptions {
    /// Placement policy for a request, bound to the client's host
    pub(crate) fn location_policy(&self, request: &WriteRequest) -> LocationPolicy {
        let policy = LocationPolicy::new(request.location_policy);
        match &self.local_hostname {
            Some(host) => policy.with_local_hostname(host.clone()),
            None => policy,
        }
    }
}

/// Result of a successful block write
#[derive(Clone, Debug)]
pub struct WriteOutcome {
    pub block_id: BlockId,
    pub length: u64,
    /// Workers that committed a replica, primary first when it succeeded
    pub replicas: Vec<WorkerId>,
    /// Write type actually used, after any durability upgrade
    pub write_type: WriteType,
    /// Fewer replicas than the requested minimum were committed
    pub under_replicated: bool,
}

/// UFS path used when the request does not name one
#[must_use]
pub fn default_ufs_path(block_id: BlockId) -> String {
    format!("blocks/{block_id}")
}

/// Asynchronous persistence needs enough cached copies to count as durable
/// in the meantime; with fewer, the write falls back to synchronous
/// persistence.
#[must_use]
pub const fn effective_write_type(requested: WriteType, placed: u32, durable: u32) -> WriteType {
    match requested {
        WriteType::AsyncThrough if placed < durable => WriteType::MustCacheAndThrough,
        other => other,
    }
}

/// Writes whole blocks to one or more workers
pub struct BlockWriter {
    master: Arc<dyn MasterClient>,
    workers: WorkerPool,
    placement: PlacementEngine,
    options: ClientOptions,
}

impl BlockWriter {
    #[must_use]
    pub fn new(master: Arc<dyn MasterClient>, workers: WorkerPool, options: ClientOptions) -> Self {
        Self {
            master,
            workers,
            placement: PlacementEngine::new(ClusterView::new()),
            options,
        }
    }

    /// Write `data` as a new block.
    ///
    /// Succeeds when at least one replica commits. When the block must be
    /// persisted, the primary replica has to be among them.
    pub async fn write(&self, request: WriteRequest, data: Bytes) -> Result<WriteOutcome> {
        request.validate()?;
        let length = data.len() as u64;
        if length > request.block_size {
            return Err(Error::BlockSizeExceeded {
                written: length,
                limit: request.block_size,
            });
        }

        let block_id = self.master.allocate_block_id().await?;
        self.placement.update_view(self.master.cluster_view().await?);

        let wanted = usize::try_from(request.replication_max.max(1)).unwrap_or(1);
        let placement = PlacementRequest::new(block_id, length, wanted).with_tier(request.tier);
        let targets: Vec<Arc<dyn WorkerDataPlane>> = self
            .placement
            .place(&self.options.location_policy(&request), &placement)
            .into_iter()
            .filter_map(|id| self.workers.get(id))
            .collect();
        if targets.is_empty() {
            return Err(Error::NoSpaceAvailable {
                tier: request.tier.to_string(),
                required: length,
            });
        }

        let placed = u32::try_from(targets.len()).unwrap_or(u32::MAX);
        let write_type =
            effective_write_type(request.write_type, placed, request.replication_durable);
        if write_type != request.write_type {
            info!(
                %block_id,
                placed,
                durable = request.replication_durable,
                "too few replicas for asynchronous persistence, persisting synchronously"
            );
        }
        let ufs_path = write_type.requires_persistence().then(|| {
            request
                .ufs_path
                .clone()
                .unwrap_or_else(|| default_ufs_path(block_id))
        });

        let writes = targets.iter().enumerate().map(|(i, worker)| {
            let mut replica = request
                .clone()
                .with_write_type(write_type)
                .with_target_replicas(placed)
                .with_expected_length(length);
            replica.ufs_path = if i == 0 { ufs_path.clone() } else { None };
            let worker = Arc::clone(worker);
            let data = data.clone();
            let chunk_size = self.options.chunk_size;
            async move {
                let result = stream_block(worker.as_ref(), block_id, replica, data, chunk_size).await;
                (worker.worker_id(), result)
            }
        });
        let results = join_all(writes).await;

        let mut replicas = Vec::with_capacity(results.len());
        let mut first_error = None;
        for (i, (worker_id, result)) in results.into_iter().enumerate() {
            match result {
                Ok(_) => replicas.push(worker_id),
                Err(e) => {
                    warn!(%block_id, %worker_id, error = %e, "replica write failed");
                    if i == 0 && write_type.requires_persistence() {
                        return Err(e);
                    }
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        if replicas.is_empty() {
            return Err(first_error
                .unwrap_or_else(|| Error::internal(format!("no replica written for {block_id}"))));
        }

        let under_replicated = (replicas.len() as u64) < u64::from(request.replication_min);
        debug!(%block_id, length, replicas = replicas.len(), ?write_type, "block written");
        Ok(WriteOutcome {
            block_id,
            length,
            replicas,
            write_type,
            under_replicated,
        })
    }
}

/// Stream one block through a worker session, aborting on any failure
pub(crate) async fn stream_block(
    worker: &dyn WorkerDataPlane,
    block_id: BlockId,
    request: WriteRequest,
    data: Bytes,
    chunk_size: usize,
) -> Result<u64> {
    let session = worker.create_block_write(block_id, request).await?;
    let streamed = async {
        let chunk_size = chunk_size.max(1);
        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + chunk_size).min(data.len());
            worker
                .write_chunk(session, offset as u64, data.slice(offset..end))
                .await?;
            offset = end;
        }
        worker.commit_block(session).await
    }
    .await;

    if streamed.is_err()
        && let Err(e) = worker.abort_block(session).await
    {
        // The worker may already have aborted the session itself
        debug!(%block_id, %session, error = %e, "abort after failed write");
    }
    streamed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::master::InProcessMaster;
    use crate::testing::FakeWorker;

    fn setup(workers: &[Arc<FakeWorker>]) -> (Arc<InProcessMaster>, BlockWriter) {
        let master = Arc::new(InProcessMaster::new());
        let pool = WorkerPool::new();
        for worker in workers {
            master.register_worker(worker.info());
            pool.add(worker.clone());
        }
        let options = ClientOptions {
            chunk_size: 3,
            ..ClientOptions::default()
        };
        let writer = BlockWriter::new(master.clone(), pool, options);
        (master, writer)
    }

    #[test]
    fn test_durability_upgrade() {
        assert_eq!(
            effective_write_type(WriteType::AsyncThrough, 1, 2),
            WriteType::MustCacheAndThrough
        );
        assert_eq!(
            effective_write_type(WriteType::AsyncThrough, 2, 2),
            WriteType::AsyncThrough
        );
        assert_eq!(
            effective_write_type(WriteType::CacheOnly, 1, 3),
            WriteType::CacheOnly
        );
    }

    #[tokio::test]
    async fn test_single_replica_write() {
        let worker = FakeWorker::new("host-a", 1000);
        let (_, writer) = setup(&[worker.clone()]);

        let outcome = writer
            .write(
                WriteRequest::new(100).with_write_type(WriteType::CacheOnly),
                Bytes::from_static(b"hello world"),
            )
            .await
            .unwrap();
        assert_eq!(outcome.length, 11);
        assert_eq!(outcome.replicas, vec![worker.id()]);
        assert_eq!(
            worker.block(outcome.block_id).unwrap(),
            Bytes::from_static(b"hello world")
        );
        // Chunked at 3 bytes
        assert_eq!(worker.chunks_received(), 4);
    }

    #[tokio::test]
    async fn test_only_primary_carries_ufs_path() {
        let a = FakeWorker::new("host-a", 1000);
        let b = FakeWorker::new("host-b", 1000);
        let (_, writer) = setup(&[a.clone(), b.clone()]);

        let outcome = writer
            .write(
                WriteRequest::new(100).with_replication(1, 2, 1),
                Bytes::from_static(b"data"),
            )
            .await
            .unwrap();
        assert_eq!(outcome.replicas.len(), 2);
        assert_eq!(outcome.write_type, WriteType::AsyncThrough);

        let requests: Vec<WriteRequest> = [&a, &b]
            .iter()
            .flat_map(|w| w.requests())
            .collect();
        assert_eq!(requests.len(), 2);
        let with_path: Vec<_> = requests.iter().filter(|r| r.ufs_path.is_some()).collect();
        assert_eq!(with_path.len(), 1);
        assert_eq!(
            with_path[0].ufs_path.as_deref(),
            Some(default_ufs_path(outcome.block_id).as_str())
        );
        assert!(requests.iter().all(|r| r.target_replicas == 2));
    }

    #[tokio::test]
    async fn test_one_worker_with_durable_two_persists_synchronously() {
        let worker = FakeWorker::new("host-a", 1000);
        let (_, writer) = setup(&[worker.clone()]);

        let outcome = writer
            .write(
                WriteRequest::new(100)
                    .with_replication(2, 3, 2)
                    .with_ufs_path("files/a"),
                Bytes::from_static(b"data"),
            )
            .await
            .unwrap();
        assert_eq!(outcome.write_type, WriteType::MustCacheAndThrough);
        assert!(outcome.under_replicated);
        let request = &worker.requests()[0];
        assert_eq!(request.ufs_path.as_deref(), Some("files/a"));
        assert_eq!(request.target_replicas, 1);
        assert!(request.is_under_replicated());
    }

    #[tokio::test]
    async fn test_secondary_failure_keeps_write() {
        // More free space makes `a` the primary
        let a = FakeWorker::new("host-a", 2000);
        let b = FakeWorker::new("host-b", 1000);
        let (_, writer) = setup(&[a.clone(), b.clone()]);
        let request = WriteRequest::new(100)
            .with_write_type(WriteType::CacheOnly)
            .with_replication(2, 2, 1);
        b.fail_writes(true);

        let outcome = writer
            .write(request, Bytes::from_static(b"data"))
            .await
            .unwrap();
        assert_eq!(outcome.replicas, vec![a.id()]);
        assert!(outcome.under_replicated);
        assert_eq!(b.aborted(), 1);
    }

    #[tokio::test]
    async fn test_no_worker_with_room() {
        let worker = FakeWorker::new("host-a", 4);
        let (_, writer) = setup(&[worker]);
        let err = writer
            .write(WriteRequest::new(100), Bytes::from_static(b"too large"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoSpaceAvailable { required: 9, .. }));
    }

    #[tokio::test]
    async fn test_oversized_data_rejected() {
        let worker = FakeWorker::new("host-a", 1000);
        let (_, writer) = setup(&[worker]);
        let err = writer
            .write(WriteRequest::new(4), Bytes::from_static(b"12345"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::BlockSizeExceeded {
                written: 5,
                limit: 4
            }
        ));
    }
}
