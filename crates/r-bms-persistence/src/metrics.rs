//! ---
//! bms_section: "03-persistence-logging"
//! bms_subsection: "module"
//! bms_type: "source"
//! bms_scope: "code"
//! bms_description: "Prometheus counters for the data log."
//! bms_version: "v0.0.0-prealpha"
//! bms_owner: "tbd"
//! ---
use std::sync::Arc;

use prometheus::{IntCounter, IntCounterVec, Opts, Registry};
use r_bms_registers::Category;

use crate::Result;

/// Metrics published by the data log.
#[derive(Clone)]
pub struct DataLogMetrics {
    records_enqueued: IntCounterVec,
    records_dropped: IntCounterVec,
    records_written: IntCounter,
    bytes_written: IntCounter,
    write_failures: IntCounter,
}

impl DataLogMetrics {
    /// Register all data log metrics with the provided registry.
    pub fn new(registry: Arc<Registry>) -> Result<Self> {
        let records_enqueued = IntCounterVec::new(
            Opts::new(
                "r_bms_datalog_records_enqueued_total",
                "Records accepted onto the data log queue",
            ),
            &["category"],
        )?;
        registry.register(Box::new(records_enqueued.clone()))?;

        let records_dropped = IntCounterVec::new(
            Opts::new(
                "r_bms_datalog_records_dropped_total",
                "Records rejected because the data log queue was full",
            ),
            &["category"],
        )?;
        registry.register(Box::new(records_dropped.clone()))?;

        let records_written = IntCounter::with_opts(Opts::new(
            "r_bms_datalog_records_written_total",
            "Records serialized into the flush buffer",
        ))?;
        registry.register(Box::new(records_written.clone()))?;

        let bytes_written = IntCounter::with_opts(Opts::new(
            "r_bms_datalog_bytes_written_total",
            "Bytes committed to data log files",
        ))?;
        registry.register(Box::new(bytes_written.clone()))?;

        let write_failures = IntCounter::with_opts(Opts::new(
            "r_bms_datalog_write_failures_total",
            "Chunk writes that failed and were retried",
        ))?;
        registry.register(Box::new(write_failures.clone()))?;

        Ok(Self {
            records_enqueued,
            records_dropped,
            records_written,
            bytes_written,
            write_failures,
        })
    }

    /// Count a record accepted onto the queue.
    pub fn record_enqueued(&self, category: Category) {
        self.records_enqueued
            .with_label_values(&[&category.to_string()])
            .inc();
    }

    /// Count a record rejected by a full queue.
    pub fn record_dropped(&self, category: Category) {
        self.records_dropped
            .with_label_values(&[&category.to_string()])
            .inc();
    }

    /// Count a record serialized by the writer thread.
    pub fn record_written(&self) {
        self.records_written.inc();
    }

    /// Add committed bytes.
    pub fn bytes_written(&self, bytes: usize) {
        self.bytes_written.inc_by(bytes as u64);
    }

    /// Count a failed chunk write.
    pub fn write_failed(&self) {
        self.write_failures.inc();
    }

    /// Number of dropped records for `category`.
    pub fn dropped(&self, category: Category) -> u64 {
        self.records_dropped
            .with_label_values(&[&category.to_string()])
            .get()
    }
}

impl std::fmt::Debug for DataLogMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataLogMetrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_exported() {
        let registry = Arc::new(Registry::new());
        let metrics = DataLogMetrics::new(Arc::clone(&registry)).unwrap();
        metrics.record_dropped(Category::BmsFast);
        metrics.bytes_written(4096);
        assert_eq!(metrics.dropped(Category::BmsFast), 1);
        assert_eq!(metrics.dropped(Category::Esc), 0);

        let names: Vec<String> = registry
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.contains(&"r_bms_datalog_bytes_written_total".to_string()));
        assert!(names.contains(&"r_bms_datalog_records_dropped_total".to_string()));
    }

    #[test]
    fn double_registration_fails() {
        let registry = Arc::new(Registry::new());
        DataLogMetrics::new(Arc::clone(&registry)).unwrap();
        assert!(DataLogMetrics::new(registry).is_err());
    }
}
