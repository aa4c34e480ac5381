//! ---
//! bms_section: "01-core-functionality"
//! bms_subsection: "module"
//! bms_type: "source"
//! bms_scope: "code"
//! bms_description: "Shared primitives and utilities for the link runtime."
//! bms_version: "v0.0.0-prealpha"
//! bms_owner: "tbd"
//! ---
//! Core shared primitives for the R-BMS workspace.
//! This crate exposes configuration loading, logging, cooperative
//! cancellation and timing utilities consumed across the workspace.

pub mod cancel;
pub mod config;
pub mod logging;
pub mod metrics;
pub mod time;

pub use cancel::CancellationToken;
pub use config::{
    AppConfig, DataLogConfig, DriverConfig, EscConfig, LoggingConfig, PollingConfig,
    SerialPortConfig,
};
pub use logging::{init_tracing, ComponentLevels, LogFormat, LogGuard, LogRotation};
pub use metrics::{JitterHistogram, JitterSummary, TickJitter};
