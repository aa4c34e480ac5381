//! ---
//! bms_section: "02-messaging-ipc-data-model"
//! bms_subsection: "module"
//! bms_type: "source"
//! bms_scope: "code"
//! bms_description: "Request/response driver with retries and stream resynchronisation."
//! bms_version: "v0.0.0-prealpha"
//! bms_owner: "tbd"
//! ---
use std::ops::Range;
use std::time::{Duration, Instant};

use r_bms_common::{CancellationToken, DriverConfig};
use tracing::{debug, trace, warn};

use crate::packet::{expected_length, Command, Frame, HEADER_LENGTH, MAX_FRAME_LENGTH};
use crate::transport::Transport;
use crate::{ProtocolError, Result};

/// Result of waiting for one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome {
    Frame(Frame),
    /// Nothing complete arrived before the deadline.
    Timeout,
    /// A frame arrived but failed validation.
    InvalidData,
}

/// Result of a register read after all retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Value(Vec<u8>),
    Timeout,
}

impl ReadOutcome {
    pub fn into_value(self) -> Option<Vec<u8>> {
        match self {
            Self::Value(value) => Some(value),
            Self::Timeout => None,
        }
    }
}

/// Drives exchanges on one bus.
///
/// Holds nothing between calls except the transport and two scratch buffers
/// reused for every frame.
pub struct ProtocolDriver<T> {
    transport: T,
    settings: DriverConfig,
    rx: [u8; MAX_FRAME_LENGTH],
    tx: Vec<u8>,
}

impl<T: Transport> ProtocolDriver<T> {
    pub fn new(transport: T, settings: DriverConfig) -> Self {
        Self {
            transport,
            settings,
            rx: [0; MAX_FRAME_LENGTH],
            tx: Vec::with_capacity(MAX_FRAME_LENGTH),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn settings(&self) -> &DriverConfig {
        &self.settings
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Read one register, retrying on timeouts, corrupt or mismatched replies.
    ///
    /// Returns [`ReadOutcome::Timeout`] once every attempt failed. Only
    /// cancellation is reported as an error.
    pub fn read_register(
        &mut self,
        address: u16,
        parameter: u8,
        length: u8,
        cancel: &CancellationToken,
    ) -> Result<ReadOutcome> {
        let request = Frame::read_request(address, parameter, length);
        let attempts = self.settings.retries.max(1);

        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                return Err(ProtocolError::Cancelled);
            }
            match self.exchange(&request, cancel) {
                Ok(ReceiveOutcome::Frame(frame)) => {
                    if frame.command() == Command::ReadResponse
                        && frame.address() == address
                        && frame.parameter() == parameter
                        && frame.data_length() == length
                    {
                        return Ok(ReadOutcome::Value(frame.into_payload().unwrap_or_default()));
                    }
                    warn!(
                        bus = %self.transport.name(),
                        attempt,
                        parameter,
                        received = %frame,
                        "response does not match request"
                    );
                }
                Ok(ReceiveOutcome::Timeout) => {
                    debug!(bus = %self.transport.name(), attempt, parameter, "no response before timeout");
                }
                Ok(ReceiveOutcome::InvalidData) => {
                    debug!(bus = %self.transport.name(), attempt, parameter, "invalid response");
                }
                Err(ProtocolError::Cancelled) => return Err(ProtocolError::Cancelled),
                Err(err) => {
                    warn!(bus = %self.transport.name(), attempt, parameter, error = %err, "transport failure");
                    self.reset_transport();
                }
            }
            if attempt < attempts && cancel.wait_timeout(self.settings.retry_delay) {
                return Err(ProtocolError::Cancelled);
            }
        }

        debug!(bus = %self.transport.name(), parameter, attempts, "register read gave up");
        Ok(ReadOutcome::Timeout)
    }

    fn exchange(&mut self, request: &Frame, cancel: &CancellationToken) -> Result<ReceiveOutcome> {
        self.transport.discard_input()?;
        self.send_frame(request, cancel)?;
        self.receive_frame(Some(self.settings.receive_timeout), cancel)
    }

    /// Encode and write one frame.
    pub fn send_frame(&mut self, frame: &Frame, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(ProtocolError::Cancelled);
        }
        self.tx.clear();
        frame.encode_into(&mut self.tx);
        trace!(bus = %self.transport.name(), frame = %hex::encode(&self.tx), "tx");
        self.transport.write(&self.tx)
    }

    /// Wait for the next valid frame.
    ///
    /// Leading bytes that are not a command byte are skipped, which
    /// resynchronises the stream after noise or a partial frame. The whole
    /// reception shares one deadline; `None` waits until cancelled. Timeouts
    /// and invalid frames reset the transport.
    pub fn receive_frame(
        &mut self,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<ReceiveOutcome> {
        let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));

        let mut skipped = 0usize;
        loop {
            if !self.fill(0..1, deadline, cancel)? {
                return Ok(self.fail(ReceiveOutcome::Timeout));
            }
            if Command::try_from(self.rx[0]).is_ok() {
                break;
            }
            skipped += 1;
        }
        if skipped > 0 {
            debug!(bus = %self.transport.name(), skipped, "skipped bytes while resynchronising");
        }

        if !self.fill(1..HEADER_LENGTH, deadline, cancel)? {
            return Ok(self.fail(ReceiveOutcome::Timeout));
        }
        let total = match expected_length(&self.rx[..HEADER_LENGTH]) {
            Ok(total) => total,
            Err(err) => {
                debug!(bus = %self.transport.name(), error = %err, "invalid header");
                return Ok(self.fail(ReceiveOutcome::InvalidData));
            }
        };
        if !self.fill(HEADER_LENGTH..total, deadline, cancel)? {
            return Ok(self.fail(ReceiveOutcome::Timeout));
        }

        let raw = &self.rx[..total];
        match Frame::decode(raw) {
            Ok(frame) => {
                trace!(bus = %self.transport.name(), frame = %hex::encode(raw), "rx");
                Ok(ReceiveOutcome::Frame(frame))
            }
            Err(err) => {
                debug!(bus = %self.transport.name(), error = %err, frame = %hex::encode(raw), "dropping corrupt frame");
                Ok(self.fail(ReceiveOutcome::InvalidData))
            }
        }
    }

    fn fill(
        &mut self,
        range: Range<usize>,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        if range.is_empty() {
            return Ok(true);
        }
        let remaining = deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()));
        self.transport
            .read_exactly(&mut self.rx[range], remaining, cancel)
    }

    fn fail(&mut self, outcome: ReceiveOutcome) -> ReceiveOutcome {
        self.reset_transport();
        outcome
    }

    fn reset_transport(&mut self) {
        if let Err(err) = self.transport.reset() {
            warn!(bus = %self.transport.name(), error = %err, "transport reset failed");
        }
    }
}
