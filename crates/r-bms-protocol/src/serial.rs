//! ---
//! bms_section: "02-messaging-ipc-data-model"
//! bms_subsection: "module"
//! bms_type: "source"
//! bms_scope: "code"
//! bms_description: "Serial port backend for the RS485 buses."
//! bms_version: "v0.0.0-prealpha"
//! bms_owner: "tbd"
//! ---
use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use r_bms_common::{CancellationToken, SerialPortConfig};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use tracing::{debug, info};

use crate::transport::Transport;
use crate::{ProtocolError, Result};

// Longest single blocking read; bounds the cancellation latency.
const READ_SLICE: Duration = Duration::from_millis(50);
const MIN_READ_SLICE: Duration = Duration::from_millis(1);

/// RS485 adapter exposed as a serial port, 8N1 without flow control.
///
/// The port is opened lazily on first use and dropped by [`Transport::reset`],
/// so a yanked adapter is reopened on the next exchange.
pub struct SerialTransport {
    name: String,
    path: String,
    baud_rate: u32,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialTransport {
    pub fn new(name: &str, config: &SerialPortConfig) -> Self {
        Self {
            name: name.to_owned(),
            path: config.port.clone(),
            baud_rate: config.baud_rate,
            port: None,
        }
    }

    /// Open eagerly, surfacing configuration errors at startup.
    pub fn open(name: &str, config: &SerialPortConfig) -> Result<Self> {
        let mut transport = Self::new(name, config);
        transport.port()?;
        Ok(transport)
    }

    fn port(&mut self) -> Result<&mut dyn SerialPort> {
        if self.port.is_none() {
            let port = serialport::new(self.path.as_str(), self.baud_rate)
                .data_bits(DataBits::Eight)
                .parity(Parity::None)
                .stop_bits(StopBits::One)
                .flow_control(FlowControl::None)
                .timeout(READ_SLICE)
                .open()?;
            info!(bus = %self.name, port = %self.path, baud = self.baud_rate, "serial port opened");
            self.port = Some(port);
        }
        match self.port.as_mut() {
            Some(port) => Ok(port.as_mut()),
            None => Err(ProtocolError::Io(ErrorKind::NotConnected.into())),
        }
    }
}

impl Transport for SerialTransport {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let port = self.port()?;
        port.write_all(bytes)?;
        port.flush()?;
        Ok(())
    }

    fn read_exactly(
        &mut self,
        buffer: &mut [u8],
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));
        let port = self.port()?;
        let mut filled = 0;
        while filled < buffer.len() {
            if cancel.is_cancelled() {
                return Err(ProtocolError::Cancelled);
            }
            let slice = match deadline {
                Some(deadline) => deadline
                    .saturating_duration_since(Instant::now())
                    .clamp(MIN_READ_SLICE, READ_SLICE),
                None => READ_SLICE,
            };
            port.set_timeout(slice)?;
            match port.read(&mut buffer[filled..]) {
                Ok(read) => filled += read,
                Err(err) if err.kind() == ErrorKind::TimedOut => {}
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
            if filled < buffer.len() && deadline.is_some_and(|deadline| Instant::now() >= deadline)
            {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn discard_input(&mut self) -> Result<()> {
        if let Some(port) = self.port.as_mut() {
            port.clear(ClearBuffer::Input)?;
        }
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        if self.port.take().is_some() {
            debug!(bus = %self.name, port = %self.path, "serial port closed for reset");
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
