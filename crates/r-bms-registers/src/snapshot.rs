//! ---
//! bms_section: "02-messaging-ipc-data-model"
//! bms_subsection: "module"
//! bms_type: "source"
//! bms_scope: "code"
//! bms_description: "Log categories, the 256-slot register cache and immutable snapshots."
//! bms_version: "v0.0.0-prealpha"
//! bms_owner: "tbd"
//! ---
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::CatalogueError;

const SLOT_COUNT: usize = u8::MAX as usize + 1;

/// Origin of a group of register values.
///
/// The discriminant is the category byte of the data log. Zero is reserved
/// as the "no record here" marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Category {
    /// Registers polled on every tick.
    BmsFast = 1,
    /// Registers polled on every Nth tick.
    BmsSlow = 2,
    /// Status values observed from the ESC.
    Esc = 3,
}

impl Category {
    /// Byte written to the data log.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether the values originate from polling the BMS.
    pub const fn is_bms(self) -> bool {
        matches!(self, Self::BmsFast | Self::BmsSlow)
    }
}

impl TryFrom<u8> for Category {
    type Error = CatalogueError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::BmsFast),
            2 => Ok(Self::BmsSlow),
            3 => Ok(Self::Esc),
            other => Err(CatalogueError::UnknownCategory(other)),
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::BmsFast => "bms_fast",
            Self::BmsSlow => "bms_slow",
            Self::Esc => "esc",
        };
        f.write_str(name)
    }
}

/// Mutable register cache owned by a single producer.
///
/// Slots are indexed directly by register id, so lookups never hash and a
/// slot's allocation is reused for every update of the same register.
pub struct RegisterCache {
    slots: Box<[Option<Vec<u8>>]>,
    populated: usize,
}

impl RegisterCache {
    /// Create an empty cache covering every possible register id.
    pub fn new() -> Self {
        Self {
            slots: vec![None; SLOT_COUNT].into_boxed_slice(),
            populated: 0,
        }
    }

    /// Store `data` as the latest value of register `id`.
    pub fn update(&mut self, id: u8, data: &[u8]) {
        match &mut self.slots[usize::from(id)] {
            Some(slot) => {
                slot.clear();
                slot.extend_from_slice(data);
            }
            empty => {
                *empty = Some(data.to_vec());
                self.populated += 1;
            }
        }
    }

    /// Latest value of register `id`, if it was ever observed.
    pub fn get(&self, id: u8) -> Option<&[u8]> {
        self.slots[usize::from(id)].as_deref()
    }

    /// Number of registers with a value.
    pub fn len(&self) -> usize {
        self.populated
    }

    /// Whether no register has been observed yet.
    pub fn is_empty(&self) -> bool {
        self.populated == 0
    }

    /// Copy the current values into an immutable snapshot.
    pub fn snapshot(&self) -> RegisterSnapshot {
        let entries = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| {
                slot.as_ref()
                    .map(|data| (id as u8, data.clone().into_boxed_slice()))
            })
            .collect();
        RegisterSnapshot { entries }
    }
}

impl Default for RegisterCache {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RegisterCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisterCache")
            .field("populated", &self.populated)
            .finish_non_exhaustive()
    }
}

/// Immutable copy of register values, sorted by id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterSnapshot {
    entries: Vec<(u8, Box<[u8]>)>,
}

impl RegisterSnapshot {
    /// Value of register `id`.
    pub fn get(&self, id: u8) -> Option<&[u8]> {
        self.entries
            .binary_search_by_key(&id, |(key, _)| *key)
            .ok()
            .map(|index| &*self.entries[index].1)
    }

    /// Iterate over `(id, value)` pairs in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = (u8, &[u8])> + '_ {
        self.entries.iter().map(|(id, data)| (*id, &**data))
    }

    /// Number of registers in the snapshot.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the snapshot carries no values.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(u8, Vec<u8>)> for RegisterSnapshot {
    fn from_iter<I: IntoIterator<Item = (u8, Vec<u8>)>>(iter: I) -> Self {
        let mut cache = RegisterCache::new();
        for (id, data) in iter {
            cache.update(id, &data);
        }
        cache.snapshot()
    }
}
