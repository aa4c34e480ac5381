//! ---
//! bms_section: "03-persistence-logging"
//! bms_subsection: "module"
//! bms_type: "source"
//! bms_scope: "code"
//! bms_description: "Rebuilds full register state from change-only records."
//! bms_version: "v0.0.0-prealpha"
//! bms_owner: "tbd"
//! ---
use std::collections::BTreeMap;

use r_bms_registers::{Category, RegisterCache, RegisterSnapshot};

use crate::record::LogRecord;

/// Last known value of every parameter, per category, while replaying a log.
#[derive(Debug, Default)]
pub struct ValueStore {
    categories: BTreeMap<Category, RegisterCache>,
}

impl ValueStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge the values of `record` and return the full state of its category.
    pub fn apply(&mut self, record: &LogRecord) -> RegisterSnapshot {
        let cache = self.categories.entry(record.category).or_default();
        for value in &record.values {
            cache.update(value.param, &value.data);
        }
        cache.snapshot()
    }

    /// Current state of `category`.
    pub fn current(&self, category: Category) -> RegisterSnapshot {
        self.categories
            .get(&category)
            .map(RegisterCache::snapshot)
            .unwrap_or_default()
    }
}
