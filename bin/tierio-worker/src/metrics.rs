//! Worker metrics and Prometheus export

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use tierio_storage::BlockStore;

/// Counters for worker operations
#[derive(Debug, Default)]
pub struct WorkerMetrics {
    pub writes_committed: AtomicU64,
    pub writes_aborted: AtomicU64,
    pub write_timeouts: AtomicU64,
    pub bytes_written: AtomicU64,
    pub reads_opened: AtomicU64,
    pub read_misses: AtomicU64,
    pub bytes_read: AtomicU64,
    pub persist_succeeded: AtomicU64,
    pub persist_failed: AtomicU64,
    pub persist_retries: AtomicU64,
    pub heartbeats_ok: AtomicU64,
    pub heartbeats_failed: AtomicU64,
    pub blocks_freed: AtomicU64,
    pub sessions_reaped: AtomicU64,
}

impl WorkerMetrics {
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    /// Export worker and store metrics in Prometheus text format
    #[must_use]
    pub fn export_prometheus(&self, worker_id: &str, store: &BlockStore) -> String {
        let mut output = String::with_capacity(4 * 1024);

        let counters = [
            ("tierio_worker_writes_committed_total", "Block writes committed", &self.writes_committed),
            ("tierio_worker_writes_aborted_total", "Block writes aborted", &self.writes_aborted),
            ("tierio_worker_write_timeouts_total", "Sessions aborted by deadline", &self.write_timeouts),
            ("tierio_worker_bytes_written_total", "Bytes accepted from clients", &self.bytes_written),
            ("tierio_worker_reads_opened_total", "Read handles opened", &self.reads_opened),
            ("tierio_worker_read_misses_total", "Reads of blocks not resident", &self.read_misses),
            ("tierio_worker_bytes_read_total", "Bytes served to clients", &self.bytes_read),
            ("tierio_worker_persist_succeeded_total", "Blocks written to the UFS", &self.persist_succeeded),
            ("tierio_worker_persist_failed_total", "Blocks whose persistence gave up", &self.persist_failed),
            ("tierio_worker_persist_retries_total", "Retried UFS writes", &self.persist_retries),
            ("tierio_worker_heartbeats_ok_total", "Heartbeats accepted by the master", &self.heartbeats_ok),
            ("tierio_worker_heartbeats_failed_total", "Heartbeats that failed", &self.heartbeats_failed),
            ("tierio_worker_blocks_freed_total", "Blocks removed on master command", &self.blocks_freed),
            ("tierio_worker_sessions_reaped_total", "Expired sessions reaped", &self.sessions_reaped),
        ];
        for (name, help, counter) in counters {
            let _ = writeln!(output, "# HELP {name} {help}");
            let _ = writeln!(output, "# TYPE {name} counter");
            let _ = writeln!(
                output,
                "{name}{{worker_id=\"{worker_id}\"}} {}",
                counter.load(Ordering::Relaxed)
            );
        }

        let stats = store.stats();
        let store_counters = [
            ("tierio_store_evictions_total", "Blocks evicted", &stats.evictions),
            ("tierio_store_evicted_bytes_total", "Bytes freed by eviction", &stats.evicted_bytes),
            ("tierio_store_demotions_total", "Blocks moved to a slower tier", &stats.demotions),
            ("tierio_store_reserve_failures_total", "Space requests that failed", &stats.reserve_failures),
        ];
        for (name, help, counter) in store_counters {
            let _ = writeln!(output, "# HELP {name} {help}");
            let _ = writeln!(output, "# TYPE {name} counter");
            let _ = writeln!(
                output,
                "{name}{{worker_id=\"{worker_id}\"}} {}",
                counter.load(Ordering::Relaxed)
            );
        }

        let _ = writeln!(output, "# HELP tierio_tier_capacity_bytes Tier capacity");
        let _ = writeln!(output, "# TYPE tierio_tier_capacity_bytes gauge");
        let _ = writeln!(output, "# HELP tierio_tier_used_bytes Tier used space");
        let _ = writeln!(output, "# TYPE tierio_tier_used_bytes gauge");
        for usage in store.tier_usage() {
            let _ = writeln!(
                output,
                "tierio_tier_capacity_bytes{{worker_id=\"{worker_id}\",tier=\"{}\"}} {}",
                usage.alias, usage.capacity
            );
            let _ = writeln!(
                output,
                "tierio_tier_used_bytes{{worker_id=\"{worker_id}\",tier=\"{}\"}} {}",
                usage.alias, usage.used
            );
        }

        let _ = writeln!(output, "# HELP tierio_worker_blocks Committed blocks resident");
        let _ = writeln!(output, "# TYPE tierio_worker_blocks gauge");
        let _ = writeln!(
            output,
            "tierio_worker_blocks{{worker_id=\"{worker_id}\"}} {}",
            store.inventory().len()
        );

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tierio_common::config::{DirConfig, StorageSection, TierConfig};

    #[test]
    fn test_export_contains_counters_and_tiers() {
        let dir = tempdir().unwrap();
        let tiers = vec![TierConfig {
            alias: "MEM".to_string(),
            dirs: vec![DirConfig {
                path: dir.path().join("mem"),
                capacity: 1024,
            }],
        }];
        let store = BlockStore::open(&tiers, &StorageSection::default()).unwrap();
        let metrics = WorkerMetrics::default();
        WorkerMetrics::inc(&metrics.writes_committed);
        WorkerMetrics::add(&metrics.bytes_written, 42);

        let text = metrics.export_prometheus("w1", &store);
        assert!(text.contains("tierio_worker_writes_committed_total{worker_id=\"w1\"} 1"));
        assert!(text.contains("tierio_worker_bytes_written_total{worker_id=\"w1\"} 42"));
        assert!(text.contains("tierio_tier_capacity_bytes{worker_id=\"w1\",tier=\"MEM\"} 1024"));
        assert!(text.contains("tierio_worker_blocks{worker_id=\"w1\"} 0"));
    }
}
