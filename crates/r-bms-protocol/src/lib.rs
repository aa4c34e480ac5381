//! ---
//! bms_section: "02-messaging-ipc-data-model"
//! bms_subsection: "module"
//! bms_type: "source"
//! bms_scope: "code"
//! bms_description: "RS485 register protocol: codec, transports and driver."
//! bms_version: "v0.0.0-prealpha"
//! bms_owner: "tbd"
//! ---
//! Half-duplex register protocol spoken by the BMS and the ESC.
//!
//! [`packet`] is the pure framing codec, [`transport`] the byte-stream
//! contract with its in-memory and serial implementations, and [`driver`]
//! the request/response logic with retries and resynchronisation.

/// Result alias used throughout the protocol crate.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Transport level failures. Timeouts are not errors, see [`transport::Transport`].
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Wrapper for IO errors raised by the underlying byte stream.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for serial port configuration or open failures.
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
    /// The shared cancellation token fired while waiting.
    #[error("operation cancelled")]
    Cancelled,
}

impl ProtocolError {
    /// Whether the error stems from cancellation rather than the bus.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

pub mod driver;
pub mod memory;
pub mod packet;
pub mod serial;
pub mod transport;

pub use driver::{ProtocolDriver, ReadOutcome, ReceiveOutcome};
pub use memory::MemoryTransport;
pub use packet::{Command, DecodeError, Frame, FrameError, MAX_FRAME_LENGTH};
pub use serial::SerialTransport;
pub use transport::Transport;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_is_distinguishable() {
        assert!(ProtocolError::Cancelled.is_cancelled());
        let io = ProtocolError::from(std::io::Error::other("wire cut"));
        assert!(!io.is_cancelled());
        assert_eq!(io.to_string(), "io error: wire cut");
    }
}
