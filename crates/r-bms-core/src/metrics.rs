//! ---
//! bms_section: "01-core-functionality"
//! bms_subsection: "module"
//! bms_type: "source"
//! bms_scope: "code"
//! bms_description: "Prometheus counters for both RS485 links."
//! bms_version: "v0.0.0-prealpha"
//! bms_owner: "tbd"
//! ---
use std::sync::Arc;

use prometheus::{IntCounterVec, Opts, Registry};
use r_bms_registers::Category;

use crate::bridge::RequestOutcome;
use crate::Result;

/// Counters for the poller and the bridge.
#[derive(Clone)]
pub struct LinkMetrics {
    register_reads: IntCounterVec,
    bridge_requests: IntCounterVec,
    events_published: IntCounterVec,
}

impl LinkMetrics {
    pub fn new(registry: Arc<Registry>) -> Result<Self> {
        let register_reads = IntCounterVec::new(
            Opts::new(
                "r_bms_register_reads_total",
                "Register reads against the BMS by parameter and outcome",
            ),
            &["parameter", "outcome"],
        )?;
        registry.register(Box::new(register_reads.clone()))?;

        let bridge_requests = IntCounterVec::new(
            Opts::new(
                "r_bms_bridge_requests_total",
                "Frames handled by the ESC bridge by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(bridge_requests.clone()))?;

        let events_published = IntCounterVec::new(
            Opts::new(
                "r_bms_events_published_total",
                "Update events published by category",
            ),
            &["category"],
        )?;
        registry.register(Box::new(events_published.clone()))?;

        Ok(Self {
            register_reads,
            bridge_requests,
            events_published,
        })
    }

    pub fn record_read(&self, parameter: &str, success: bool) {
        let outcome = if success { "ok" } else { "timeout" };
        self.register_reads
            .with_label_values(&[parameter, outcome])
            .inc();
    }

    pub fn record_bridge(&self, outcome: RequestOutcome) {
        self.bridge_requests
            .with_label_values(&[outcome.as_str()])
            .inc();
    }

    pub fn record_publish(&self, category: Category) {
        self.events_published
            .with_label_values(&[&category.to_string()])
            .inc();
    }

    /// Count of bridge frames with the given outcome.
    pub fn bridge_count(&self, outcome: RequestOutcome) -> u64 {
        self.bridge_requests
            .with_label_values(&[outcome.as_str()])
            .get()
    }

    /// Count of published events for `category`.
    pub fn published(&self, category: Category) -> u64 {
        self.events_published
            .with_label_values(&[&category.to_string()])
            .get()
    }
}

impl std::fmt::Debug for LinkMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkMetrics").finish_non_exhaustive()
    }
}
