//! Wiring of a running worker and its background tasks

use crate::heartbeat::HeartbeatBridge;
use crate::metrics::WorkerMetrics;
use crate::persist::PersistCoordinator;
use crate::service::BlockWorker;
use std::sync::Arc;
use std::time::Duration;
use tierio_client::{MasterClient, WorkerDataPlane};
use tierio_common::{WorkerConfig, WorkerId};
use tierio_storage::BlockStore;
use tierio_ufs::UnderFileSystem;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// A started worker: the data plane plus its persist, heartbeat and
/// reaper tasks
pub struct WorkerHandle {
    pub worker: Arc<BlockWorker>,
    pub heartbeat: Arc<HeartbeatBridge>,
    pub metrics: Arc<WorkerMetrics>,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Start a worker over an opened store. Must be called inside a tokio
    /// runtime.
    pub fn start(
        config: &WorkerConfig,
        store: Arc<BlockStore>,
        ufs: Arc<dyn UnderFileSystem>,
        master: Arc<dyn MasterClient>,
    ) -> Self {
        let worker_id = config.worker.id.unwrap_or_default();
        let hostname = config.worker.hostname.clone();
        let metrics = Arc::new(WorkerMetrics::default());
        let events = store.subscribe();

        let persist = Arc::new(PersistCoordinator::new(
            Arc::clone(&store),
            ufs,
            config.persist.clone(),
            Arc::clone(&metrics),
        ));
        let mut tasks = persist.spawn_workers();

        let worker = Arc::new(BlockWorker::new(
            worker_id,
            hostname.clone(),
            Arc::clone(&store),
            persist,
            Arc::clone(&metrics),
            &config.session,
        ));
        let heartbeat = Arc::new(HeartbeatBridge::new(
            worker_id,
            hostname,
            store,
            master,
            config.heartbeat.clone(),
            Arc::clone(&metrics),
        ));

        tasks.push(tokio::spawn(Arc::clone(&heartbeat).run(events)));
        tasks.push(spawn_reaper(
            Arc::clone(&worker),
            config.session.reaper_interval(),
        ));

        info!(%worker_id, tasks = tasks.len(), "worker started");
        Self {
            worker,
            heartbeat,
            metrics,
            tasks,
        }
    }

    #[must_use]
    pub fn worker_id(&self) -> WorkerId {
        self.worker.worker_id()
    }

    /// Stop the background tasks
    pub fn shutdown(self) {
        for task in self.tasks {
            task.abort();
        }
        debug!("worker tasks stopped");
    }
}

/// Periodically abort idle sessions
pub fn spawn_reaper(worker: Arc<BlockWorker>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let reaped = worker.reap_expired().await;
            if reaped > 0 {
                debug!(reaped, "idle sessions reaped");
            }
        }
    })
}
