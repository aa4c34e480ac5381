//! ---
//! bms_section: "02-messaging-ipc-data-model"
//! bms_subsection: "module"
//! bms_type: "source"
//! bms_scope: "code"
//! bms_description: "Register catalogue and snapshot data model."
//! bms_version: "v0.0.0-prealpha"
//! bms_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Static register catalogue of the BMS and ESC plus the cache and snapshot
//! types that carry register values between the link threads.

/// Result alias used throughout the registers crate.
pub type Result<T> = std::result::Result<T, CatalogueError>;

/// Errors raised while resolving configured parameter names.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogueError {
    /// The name does not match any catalogue entry.
    #[error("unknown parameter '{0}'")]
    UnknownParameter(String),
    /// The same register was requested twice in one set.
    #[error("parameter '{0}' listed more than once")]
    DuplicateParameter(String),
    /// The byte is not a known log category.
    #[error("unknown category {0}")]
    UnknownCategory(u8),
}

pub mod catalogue;
pub mod events;
pub mod snapshot;

pub use catalogue::{
    resolve_bms_parameters, BmsParameter, EscParameter, ParameterDefinition, BMS_ADDRESS,
    ESC_ADDRESS,
};
pub use events::{Publisher, Subscriber, UpdateEvent};
pub use snapshot::{Category, RegisterCache, RegisterSnapshot};
