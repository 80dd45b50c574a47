//! Block writes and reads through the client against real workers

mod common;

use bytes::Bytes;
use common::{Cluster, MIB, eventually, payload};
use std::sync::Arc;
use tierio_client::{MasterClient, MasterCommand, ReadSource, WorkerDataPlane};
use tierio_common::{BlockId, Error, WriteRequest, WriteType};
use tierio_storage::{BlockOptions, PersistState};

#[tokio::test]
async fn test_async_through_write_commits_reads_back_and_persists() {
    let cluster = Cluster::start(&[10 * MIB]).await;
    let data = payload(4 * MIB, 7);

    let outcome = cluster
        .writer()
        .write(WriteRequest::new(4 * MIB), data.clone())
        .await
        .unwrap();
    assert_eq!(outcome.length, 4 * MIB);
    assert_eq!(outcome.write_type, WriteType::AsyncThrough);
    assert_eq!(outcome.replicas.len(), 1);

    // Immediate read-back from the cache
    let read = cluster
        .reader()
        .read(outcome.block_id, None, 0, 4 * MIB)
        .await
        .unwrap();
    assert_eq!(read.source, ReadSource::Worker(outcome.replicas[0]));
    assert_eq!(read.data, data);

    // Background persist lands in the UFS
    let path = format!("blocks/{}", outcome.block_id);
    let store = cluster.store(0).clone();
    let block_id = outcome.block_id;
    eventually("block persisted", || {
        store
            .block_meta(block_id)
            .is_some_and(|m| m.persist == PersistState::Persisted)
    })
    .await;
    assert_eq!(cluster.ufs.get(&path).unwrap(), data);
    assert_eq!(cluster.master.replicas(block_id), outcome.replicas);
    assert_eq!(cluster.master.block_length(block_id), Some(4 * MIB));
}

#[tokio::test]
async fn test_no_space_without_evictable_victims() {
    let cluster = Cluster::start(&[5 * MIB]).await;
    let store = cluster.store(0).clone();

    // 4 MiB not yet persisted: unevictable
    let mut writer = store
        .create_block(
            BlockId::new(1_000),
            0,
            4 * MIB,
            4 * MIB,
            BlockOptions::default(),
        )
        .unwrap();
    store.append(&mut writer, &payload(4 * MIB, 1)).unwrap();
    store.commit_block(writer, PersistState::Pending).unwrap();
    assert_eq!(cluster.used(0), 4 * MIB);

    let worker = &cluster.workers[0].worker;
    let err = worker
        .create_block_write(BlockId::new(1_001), WriteRequest::new(2 * MIB))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoSpaceAvailable { .. }));
    assert_eq!(cluster.used(0), 4 * MIB);
    assert!(!store.has_block(BlockId::new(1_001)));
    assert!(store.has_block(BlockId::new(1_000)));
}

#[tokio::test]
async fn test_concurrent_writers_never_overcommit() {
    let cluster = Cluster::start(&[1_000]).await;
    let worker = cluster.workers[0].worker.clone();

    let request = |len: u64| WriteRequest::new(len).with_write_type(WriteType::CacheOnly);
    let (a, b) = tokio::join!(
        worker.create_block_write(BlockId::new(1), request(500)),
        worker.create_block_write(BlockId::new(2), request(501)),
    );

    // Open reservations are not evictable, so only one fits
    assert_eq!([&a, &b].iter().filter(|r| r.is_ok()).count(), 1);
    let failed = if a.is_err() { &a } else { &b };
    assert!(matches!(failed, Err(Error::NoSpaceAvailable { .. })));
    assert!(cluster.used(0) <= 1_000);

    let (session, len) = match (a, b) {
        (Ok(session), _) => (session, 500),
        (_, Ok(session)) => (session, 501),
        _ => unreachable!(),
    };
    worker.write_chunk(session, 0, payload(len, 3)).await.unwrap();
    assert_eq!(worker.commit_block(session).await.unwrap(), len);
    assert_eq!(cluster.used(0), len);
}

#[tokio::test]
async fn test_under_replicated_write_is_reported() {
    let cluster = Cluster::start(&[10 * MIB]).await;

    let outcome = cluster
        .writer()
        .write(
            WriteRequest::new(MIB).with_replication(2, 3, 1),
            payload(MIB, 9),
        )
        .await
        .unwrap();
    assert_eq!(outcome.replicas.len(), 1);
    assert!(outcome.under_replicated);

    let master = cluster.master.clone();
    let block_id = outcome.block_id;
    eventually("under-replication reported", || {
        master
            .under_replicated()
            .iter()
            .any(|u| u.block_id == block_id && u.replicas == 1 && u.min == 2)
    })
    .await;
}

#[tokio::test]
async fn test_abort_mid_stream_releases_reservation() {
    let cluster = Cluster::start(&[5 * MIB]).await;
    let worker = &cluster.workers[0].worker;

    let session = worker
        .create_block_write(
            BlockId::new(1),
            WriteRequest::new(2 * MIB).with_write_type(WriteType::CacheOnly),
        )
        .await
        .unwrap();
    worker
        .write_chunk(session, 0, payload(MIB, 2))
        .await
        .unwrap();
    assert_eq!(cluster.used(0), 2 * MIB);

    worker.abort_block(session).await.unwrap();
    assert_eq!(cluster.used(0), 0);
    assert!(!cluster.store(0).has_block(BlockId::new(1)));

    // The whole directory is free again
    let session = worker
        .create_block_write(
            BlockId::new(2),
            WriteRequest::new(5 * MIB).with_write_type(WriteType::CacheOnly),
        )
        .await
        .unwrap();
    worker.abort_block(session).await.unwrap();
}

#[tokio::test]
async fn test_must_cache_and_through_failure_leaves_nothing() {
    let cluster = Cluster::start(&[10 * MIB]).await;
    cluster.ufs.set_available(false);

    let err = cluster
        .writer()
        .write(
            WriteRequest::new(MIB).with_write_type(WriteType::MustCacheAndThrough),
            payload(MIB, 4),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PersistFailed { .. }));
    assert_eq!(cluster.used(0), 0);
    assert!(cluster.store(0).inventory().is_empty());
    assert_eq!(cluster.workers[0].worker.open_writes(), 0);
}

#[tokio::test]
async fn test_replicated_write_persists_once() {
    let cluster = Cluster::start(&[10 * MIB, 10 * MIB, 10 * MIB]).await;
    let data = payload(MIB, 5);

    let outcome = cluster
        .writer()
        .write(
            WriteRequest::new(MIB)
                .with_write_type(WriteType::MustCacheAndThrough)
                .with_replication(2, 3, 2),
            data.clone(),
        )
        .await
        .unwrap();
    assert_eq!(outcome.replicas.len(), 3);
    assert!(!outcome.under_replicated);
    assert_eq!(cluster.ufs.write_attempts(), 1);
    assert_eq!(
        cluster.ufs.get(&format!("blocks/{}", outcome.block_id)),
        Some(data)
    );

    let master = cluster.master.clone();
    let block_id = outcome.block_id;
    eventually("all replicas known", || master.replicas(block_id).len() == 3).await;
}

#[tokio::test]
async fn test_freed_block_is_read_from_ufs_and_recached() {
    let cluster = Cluster::start(&[10 * MIB]).await;
    let data = payload(MIB, 6);

    let outcome = cluster
        .writer()
        .write(
            WriteRequest::new(MIB).with_write_type(WriteType::MustCacheAndThrough),
            data.clone(),
        )
        .await
        .unwrap();
    let block_id = outcome.block_id;
    let path = format!("blocks/{block_id}");
    let worker_id = cluster.workers[0].worker_id();

    cluster.master.enqueue_command(
        worker_id,
        MasterCommand::Free {
            block_ids: vec![block_id],
        },
    );
    let store = cluster.store(0).clone();
    eventually("block freed", || !store.has_block(block_id)).await;
    let master = cluster.master.clone();
    eventually("removal reported", || master.replicas(block_id).is_empty()).await;

    let read = cluster
        .reader()
        .read(block_id, Some(&path), 10, 100)
        .await
        .unwrap();
    assert_eq!(read.source, ReadSource::Ufs);
    assert_eq!(read.data, data.slice(10..110));

    // Re-cached as a cache-only copy and served from the worker again
    assert!(store.has_block(block_id));
    assert_eq!(
        store.block_meta(block_id).unwrap().options.write_type,
        WriteType::CacheOnly
    );
    eventually("re-cached copy reported", || {
        master.replicas(block_id) == vec![worker_id]
    })
    .await;
    let read = cluster
        .reader()
        .read(block_id, Some(&path), 0, MIB)
        .await
        .unwrap();
    assert_eq!(read.source, ReadSource::Worker(worker_id));
    assert_eq!(read.data, data);
}

#[tokio::test]
async fn test_eviction_makes_room_and_is_reported() {
    let cluster = Cluster::start(&[3 * MIB]).await;
    let worker = cluster.workers[0].worker.clone();

    for id in 1..=4u64 {
        let session = worker
            .create_block_write(
                BlockId::new(id),
                WriteRequest::new(MIB).with_write_type(WriteType::CacheOnly),
            )
            .await
            .unwrap();
        worker
            .write_chunk(session, 0, payload(MIB, id as u8))
            .await
            .unwrap();
        worker.commit_block(session).await.unwrap();
    }

    let store = cluster.store(0).clone();
    assert!(!store.has_block(BlockId::new(1)));
    assert!((2..=4).all(|id| store.has_block(BlockId::new(id))));
    assert_eq!(cluster.used(0), 3 * MIB);

    let master = cluster.master.clone();
    eventually("eviction reported", || {
        master.replicas(BlockId::new(1)).is_empty()
            && (2..=4).all(|id| master.replicas(BlockId::new(id)).len() == 1)
    })
    .await;
}

#[tokio::test]
async fn test_worker_keeps_serving_while_master_is_down() {
    let cluster = Cluster::start(&[10 * MIB]).await;
    let worker: Arc<dyn WorkerDataPlane> = cluster.workers[0].worker.clone();
    cluster.master.set_available(false);

    let session = worker
        .create_block_write(
            BlockId::new(77),
            WriteRequest::new(16).with_write_type(WriteType::CacheOnly),
        )
        .await
        .unwrap();
    worker
        .write_chunk(session, 0, Bytes::from_static(b"offline"))
        .await
        .unwrap();
    worker.commit_block(session).await.unwrap();
    let handle = worker.open_block_read(BlockId::new(77), 0).await.unwrap();
    assert_eq!(
        &worker.read_chunk(handle, 16).await.unwrap()[..],
        b"offline"
    );
    worker.close_block_read(handle).await.unwrap();

    cluster.master.set_available(true);
    let master = cluster.master.clone();
    eventually("queued commit delivered", || {
        !master.replicas(BlockId::new(77)).is_empty()
    })
    .await;
    assert!(master.block_locations(BlockId::new(77)).await.unwrap().len() == 1);
}
