//! ---
//! bms_section: "01-core-functionality"
//! bms_subsection: "module"
//! bms_type: "source"
//! bms_scope: "code"
//! bms_description: "Scheduling jitter bookkeeping for periodic loops."
//! bms_version: "v0.0.0-prealpha"
//! bms_owner: "tbd"
//! ---
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::time::duration_to_micros;

/// Running mean and variance (Welford) with extremes. Constant size no
/// matter how many samples were recorded.
#[derive(Debug, Default, Clone, Copy)]
struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
    min: u64,
    max: u64,
}

impl RunningStats {
    fn push(&mut self, value: u64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        let delta = value as f64 - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value as f64 - self.mean);
    }
}

#[derive(Debug, Default)]
pub struct JitterHistogram {
    stats: Mutex<RunningStats>,
}

impl JitterHistogram {
    pub fn record(&self, jitter: Duration) {
        self.stats.lock().push(duration_to_micros(jitter));
    }

    pub fn summary(&self) -> Option<JitterSummary> {
        let stats = *self.stats.lock();
        if stats.count == 0 {
            return None;
        }
        let variance = if stats.count > 1 {
            stats.m2 / (stats.count - 1) as f64
        } else {
            0.0
        };
        Some(JitterSummary {
            mean_us: stats.mean,
            std_dev_us: variance.sqrt(),
            max_us: stats.max,
            min_us: stats.min,
            samples: stats.count,
        })
    }

    pub fn write_json<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        if let Some(summary) = self.summary() {
            let mut file = File::create(path)?;
            let json = serde_json::to_vec_pretty(&summary).map_err(std::io::Error::other)?;
            file.write_all(&json)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JitterSummary {
    pub mean_us: f64,
    pub std_dev_us: f64,
    pub max_us: u64,
    pub min_us: u64,
    pub samples: u64,
}

/// Records how late each tick of a periodic loop started.
#[derive(Debug)]
pub struct TickJitter {
    target_interval: Duration,
    overruns: AtomicU64,
    histogram: JitterHistogram,
}

impl TickJitter {
    pub fn new(target_interval: Duration) -> Self {
        Self {
            target_interval,
            overruns: AtomicU64::new(0),
            histogram: JitterHistogram::default(),
        }
    }

    /// Record a tick that was due at `scheduled` and started at `started`.
    ///
    /// A start later than a full interval past its deadline is counted as an
    /// overrun.
    pub fn record_tick(&self, scheduled: Instant, started: Instant) {
        let lateness = started.saturating_duration_since(scheduled);
        if lateness >= self.target_interval {
            self.overruns.fetch_add(1, Ordering::Relaxed);
        }
        self.histogram.record(lateness);
    }

    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    pub fn target_interval(&self) -> Duration {
        self.target_interval
    }

    pub fn histogram(&self) -> &JitterHistogram {
        &self.histogram
    }
}
