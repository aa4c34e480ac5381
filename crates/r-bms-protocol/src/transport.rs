//! ---
//! bms_section: "02-messaging-ipc-data-model"
//! bms_subsection: "module"
//! bms_type: "source"
//! bms_scope: "code"
//! bms_description: "Byte-stream contract implemented by every bus backend."
//! bms_version: "v0.0.0-prealpha"
//! bms_owner: "tbd"
//! ---
use std::time::Duration;

use r_bms_common::CancellationToken;

use crate::Result;

/// Byte-stream abstraction used by the protocol driver.
///
/// A normal timeout is reported as `Ok(false)` from [`Transport::read_exactly`],
/// never as an error. Cancellation surfaces as
/// [`ProtocolError::Cancelled`](crate::ProtocolError::Cancelled).
pub trait Transport: Send {
    /// Write all bytes to the bus.
    fn write(&mut self, bytes: &[u8]) -> Result<()>;

    /// Fill `buffer` completely within `timeout` (`None` waits forever).
    ///
    /// Bytes received before a timeout are consumed and lost.
    fn read_exactly(
        &mut self,
        buffer: &mut [u8],
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<bool>;

    /// Drop any bytes already received but not yet read.
    fn discard_input(&mut self) -> Result<()>;

    /// Fully reinitialise the transport. Safe on a broken transport.
    fn reset(&mut self) -> Result<()>;

    /// Human-readable bus name for logging.
    fn name(&self) -> &str;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        (**self).write(bytes)
    }

    fn read_exactly(
        &mut self,
        buffer: &mut [u8],
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        (**self).read_exactly(buffer, timeout, cancel)
    }

    fn discard_input(&mut self) -> Result<()> {
        (**self).discard_input()
    }

    fn reset(&mut self) -> Result<()> {
        (**self).reset()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
