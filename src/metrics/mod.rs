use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry};
use serde_json::{Map, Value};
use std::sync::Arc;

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter, prometheus::Error> {
    let c = IntCounter::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(c.clone()))?;
    Ok(c)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge, prometheus::Error> {
    let g = IntGauge::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(g.clone()))?;
    Ok(g)
}

/// Prometheus statistics for one index
#[derive(Clone)]
pub struct IndexStats {
    // Batches
    pub tot_batches: IntCounter,
    pub tot_batches_empty: IntCounter,
    pub tot_updates: IntCounter,
    pub tot_deletes: IntCounter,

    // Introducer
    pub tot_introduced_segments_batch: IntCounter,
    pub tot_introduced_segments_merge: IntCounter,
    pub tot_introduced_items: IntCounter,

    // Persister
    pub tot_persisted_segments: IntCounter,
    pub tot_persisted_snapshots: IntCounter,
    pub tot_persist_errors: IntCounter,
    pub tot_files_removed: IntCounter,
    pub tot_meta_records_removed: IntCounter,

    // Merger
    pub tot_file_merge_ops: IntCounter,
    pub tot_file_merge_segments: IntCounter,
    pub tot_merge_errors: IntCounter,
    pub tot_merge_introductions_obsoleted: IntCounter,
    pub tot_merge_introductions_skipped: IntCounter,

    pub tot_rollback_ops: IntCounter,
    pub tot_async_errors: IntCounter,

    // Gauges
    pub current_root_epoch: IntGauge,
    pub last_persisted_epoch: IntGauge,
    pub root_segments: IntGauge,

    // Histograms
    pub batch_latency: Histogram,
    pub persist_latency: Histogram,

    registry: Arc<Registry>,
}

impl IndexStats {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let r = &registry;

        let batch_latency = Histogram::with_opts(
            HistogramOpts::new("sediment_batch_latency_seconds", "Time from batch submission to return")
                .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]),
        )?;
        registry.register(Box::new(batch_latency.clone()))?;

        let persist_latency = Histogram::with_opts(
            HistogramOpts::new("sediment_persist_latency_seconds", "Duration of one persister pass")
                .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0]),
        )?;
        registry.register(Box::new(persist_latency.clone()))?;

        Ok(Self {
            tot_batches: counter(r, "sediment_batches_total", "Batches applied")?,
            tot_batches_empty: counter(r, "sediment_batches_empty_total", "Batches with no operations")?,
            tot_updates: counter(r, "sediment_updates_total", "Documents inserted or replaced")?,
            tot_deletes: counter(r, "sediment_deletes_total", "Documents deleted")?,
            tot_introduced_segments_batch: counter(
                r,
                "sediment_introduced_segments_batch_total",
                "Segments introduced from batches",
            )?,
            tot_introduced_segments_merge: counter(
                r,
                "sediment_introduced_segments_merge_total",
                "Segments introduced from merges",
            )?,
            tot_introduced_items: counter(r, "sediment_introduced_items_total", "Documents introduced")?,
            tot_persisted_segments: counter(r, "sediment_persisted_segments_total", "Segments written to disk")?,
            tot_persisted_snapshots: counter(r, "sediment_persisted_snapshots_total", "Metadata records written")?,
            tot_persist_errors: counter(r, "sediment_persist_errors_total", "Failed persister passes")?,
            tot_files_removed: counter(r, "sediment_files_removed_total", "Unreferenced segment files deleted")?,
            tot_meta_records_removed: counter(
                r,
                "sediment_meta_records_removed_total",
                "Metadata records pruned",
            )?,
            tot_file_merge_ops: counter(r, "sediment_file_merge_ops_total", "Merge tasks executed")?,
            tot_file_merge_segments: counter(r, "sediment_file_merge_segments_total", "Input segments merged")?,
            tot_merge_errors: counter(r, "sediment_merge_errors_total", "Failed merge tasks")?,
            tot_merge_introductions_obsoleted: counter(
                r,
                "sediment_merge_introductions_obsoleted_total",
                "Merge results discarded because their inputs were superseded",
            )?,
            tot_merge_introductions_skipped: counter(
                r,
                "sediment_merge_introductions_skipped_total",
                "Merge results with no documents that only removed inputs",
            )?,
            tot_rollback_ops: counter(r, "sediment_rollback_ops_total", "Rollbacks applied")?,
            tot_async_errors: counter(r, "sediment_async_errors_total", "Errors raised by background tasks")?,
            current_root_epoch: gauge(r, "sediment_current_root_epoch", "Epoch of the root snapshot")?,
            last_persisted_epoch: gauge(r, "sediment_last_persisted_epoch", "Newest epoch made durable")?,
            root_segments: gauge(r, "sediment_root_segments", "Segments in the root snapshot")?,
            batch_latency,
            persist_latency,
            registry: Arc::new(registry),
        })
    }

    /// Get the Prometheus registry
    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    /// Record a root swap
    pub fn record_root(&self, epoch: u64, segments: usize) {
        self.current_root_epoch.set(epoch as i64);
        self.root_segments.set(segments as i64);
    }

    /// Flat name → value view of every counter and gauge
    pub fn stats_map(&self) -> Value {
        let mut map = Map::new();
        for family in self.registry.gather() {
            let Some(metric) = family.get_metric().first() else {
                continue;
            };
            let name = family.get_name().trim_start_matches("sediment_");
            let value = if metric.has_counter() {
                Value::from(metric.get_counter().get_value() as u64)
            } else if metric.has_gauge() {
                Value::from(metric.get_gauge().get_value() as i64)
            } else if metric.has_histogram() {
                Value::from(metric.get_histogram().get_sample_count())
            } else {
                continue;
            };
            map.insert(name.to_string(), value);
        }
        Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_map_reflects_counters() {
        let stats = IndexStats::new().unwrap();
        stats.tot_batches.inc();
        stats.tot_batches.inc();
        stats.tot_merge_introductions_obsoleted.inc();
        stats.record_root(12, 3);

        let map = stats.stats_map();
        assert_eq!(map["batches_total"], 2);
        assert_eq!(map["merge_introductions_obsoleted_total"], 1);
        assert_eq!(map["current_root_epoch"], 12);
        assert_eq!(map["root_segments"], 3);
        assert_eq!(map["rollback_ops_total"], 0);
    }

    #[test]
    fn test_independent_registries() {
        let a = IndexStats::new().unwrap();
        let b = IndexStats::new().unwrap();
        a.tot_updates.inc();
        assert_eq!(b.tot_updates.get(), 0);
        assert!(!a.registry().gather().is_empty());
    }
}
