//! ---
//! bms_section: "05-networking-external-interfaces"
//! bms_subsection: "module"
//! bms_type: "source"
//! bms_scope: "code"
//! bms_description: "JSON views of data log records and per-category statistics."
//! bms_version: "v0.0.0-prealpha"
//! bms_owner: "tbd"
//! ---
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use r_bms_persistence::LogRecord;
use r_bms_registers::catalogue::describe;
use r_bms_registers::{Category, RegisterSnapshot, BMS_ADDRESS, ESC_ADDRESS};
use serde::Serialize;

fn address_of(category: Category) -> u16 {
    if category.is_bms() {
        BMS_ADDRESS
    } else {
        ESC_ADDRESS
    }
}

/// One line of `dump` output. Values are keyed by register name, hex encoded.
#[derive(Debug, Serialize, PartialEq)]
pub struct RecordView {
    pub time: DateTime<Utc>,
    pub category: String,
    pub values: BTreeMap<String, String>,
}

impl RecordView {
    /// Values as stored in the record, i.e. only those that changed.
    pub fn changes(record: &LogRecord) -> Self {
        let address = address_of(record.category);
        Self {
            time: record.time,
            category: record.category.to_string(),
            values: record
                .values
                .iter()
                .map(|value| (describe(address, value.param), hex::encode(&value.data)))
                .collect(),
        }
    }

    /// Every value known for the category after replaying up to `time`.
    pub fn full(time: DateTime<Utc>, category: Category, snapshot: &RegisterSnapshot) -> Self {
        let address = address_of(category);
        Self {
            time,
            category: category.to_string(),
            values: snapshot
                .iter()
                .map(|(param, data)| (describe(address, param), hex::encode(data)))
                .collect(),
        }
    }
}

#[derive(Debug, Default, Serialize, PartialEq, Eq)]
pub struct CategoryStats {
    pub records: u64,
    /// Changed values stored across all records.
    pub values: u64,
    /// Records that carried no change at all.
    pub empty: u64,
}

/// Output of `stats`.
#[derive(Debug, Default, Serialize, PartialEq)]
pub struct LogStats {
    pub records: u64,
    pub bytes: u64,
    pub first: Option<DateTime<Utc>>,
    pub last: Option<DateTime<Utc>>,
    pub span_seconds: f64,
    pub categories: BTreeMap<String, CategoryStats>,
}

impl LogStats {
    pub fn add(&mut self, record: &LogRecord) {
        self.records += 1;
        self.first = Some(self.first.map_or(record.time, |first| first.min(record.time)));
        self.last = Some(self.last.map_or(record.time, |last| last.max(record.time)));
        if let (Some(first), Some(last)) = (self.first, self.last) {
            self.span_seconds = (last - first).num_milliseconds() as f64 / 1000.0;
        }
        let entry = self
            .categories
            .entry(record.category.to_string())
            .or_default();
        entry.records += 1;
        entry.values += record.values.len() as u64;
        if record.values.is_empty() {
            entry.empty += 1;
        }
    }
}
