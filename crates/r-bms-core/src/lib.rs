//! ---
//! bms_section: "01-core-functionality"
//! bms_subsection: "module"
//! bms_type: "source"
//! bms_scope: "code"
//! bms_description: "Link runtime: poller, bridge responder and orchestration."
//! bms_version: "v0.0.0-prealpha"
//! bms_owner: "tbd"
//! ---
//! Link runtime of the R-BMS bridge.
//!
//! The [`Poller`] reads the BMS on a two-tier schedule and publishes its
//! caches. The [`BridgeResponder`] answers the ESC from its own copy of the
//! mirrored registers. Both publish into the data log. [`runtime`] wires the
//! three threads together and owns the shutdown order.

use r_bms_persistence::PersistenceError;
use r_bms_protocol::ProtocolError;
use r_bms_registers::CatalogueError;

pub mod bridge;
pub mod clock;
pub mod metrics;
pub mod poller;
pub mod runtime;
pub mod schedule;
pub mod simulator;

pub use bridge::{BridgeHandle, BridgeResponder, RequestOutcome};
pub use clock::{clock_offset, decode_rtc, read_bms_clock};
pub use metrics::LinkMetrics;
pub use poller::Poller;
pub use runtime::{LinkRuntime, RuntimeReport, Transports};
pub use schedule::TickSchedule;
pub use simulator::{BatterySimulator, EscSimulator};

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Catalogue(#[from] CatalogueError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
    #[error("BMS clock value {0} is not a valid date")]
    InvalidClock(String),
    #[error("failed to spawn {0} thread: {1}")]
    Spawn(&'static str, #[source] std::io::Error),
    #[error("{0} thread panicked")]
    ThreadPanicked(&'static str),
}

impl CoreError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Protocol(err) if err.is_cancelled())
    }
}
