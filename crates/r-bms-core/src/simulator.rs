//! ---
//! bms_section: "14-simulation-test-harness"
//! bms_subsection: "module"
//! bms_type: "source"
//! bms_scope: "code"
//! bms_description: "Bench simulators for a battery and an ESC on an RS485 bus."
//! bms_version: "v0.0.0-prealpha"
//! bms_owner: "tbd"
//! ---
//! Bench simulators.
//!
//! [`BatterySimulator`] answers register reads like a BMS with synthetic
//! values. [`EscSimulator`] polls a BMS the way the motor controller does.
//! Wiring one to the daemon's BMS port and the other to its ESC port
//! exercises the whole bridge without hardware.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Datelike, Timelike, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use r_bms_common::{CancellationToken, EscConfig};
use r_bms_protocol::{Command, Frame, ProtocolDriver, ReadOutcome, ReceiveOutcome, Transport};
use r_bms_registers::catalogue::describe;
use r_bms_registers::{resolve_bms_parameters, BmsParameter, ParameterDefinition, BMS_ADDRESS};
use strum::IntoEnumIterator;
use tracing::{debug, info, warn};

use crate::bridge::fit_to_length;
use crate::Result;

const ESC_PERIOD: Duration = Duration::from_millis(100);

/// Fixed skew of the simulated RTC against the host clock.
fn rtc_skew() -> chrono::Duration {
    chrono::Duration::hours(8) + chrono::Duration::minutes(20) + chrono::Duration::seconds(54)
}

/// Register map of a simulated battery.
pub struct BatterySimulator<T> {
    driver: ProtocolDriver<T>,
    values: BTreeMap<u8, Vec<u8>>,
    rng: StdRng,
}

impl<T: Transport> BatterySimulator<T> {
    pub fn new(driver: ProtocolDriver<T>) -> Self {
        Self::with_rng(driver, StdRng::from_entropy())
    }

    /// Simulator with reproducible values.
    pub fn with_seed(driver: ProtocolDriver<T>, seed: u64) -> Self {
        Self::with_rng(driver, StdRng::seed_from_u64(seed))
    }

    fn with_rng(driver: ProtocolDriver<T>, rng: StdRng) -> Self {
        let mut values: BTreeMap<u8, Vec<u8>> = BmsParameter::iter()
            .map(|parameter| (parameter.id(), vec![0; usize::from(parameter.length())]))
            .collect();
        values.insert(BmsParameter::Unknown7.id(), vec![0x05]);
        values.insert(
            BmsParameter::Temperatures.id(),
            vec![0x15, 0x15, 0x15, 0x00, 0x16, 0x16, 0x16, 0x00],
        );
        values.insert(BmsParameter::BatteryPercent.id(), vec![0x4B]);
        let mut status = vec![0; usize::from(BmsParameter::BmsStatus.length())];
        status[0] = 0x20;
        values.insert(BmsParameter::BmsStatus.id(), status);
        Self { driver, values, rng }
    }

    /// Override the value served for `parameter`.
    pub fn set_value(&mut self, parameter: BmsParameter, value: Vec<u8>) {
        self.values.insert(parameter.id(), value);
    }

    /// Current value of a register.
    pub fn value(&self, parameter: BmsParameter) -> Option<&[u8]> {
        self.values.get(&parameter.id()).map(Vec::as_slice)
    }

    /// Draw new voltage, current and charge values and advance the RTC.
    pub fn refresh(&mut self, now: DateTime<Utc>) {
        let voltage: i32 = self.rng.gen_range(-50_000..67_000);
        let current: i32 = self.rng.gen_range(-90_000..10_000);
        let percent: u8 = self.rng.gen_range(0..=100);
        self.values
            .insert(BmsParameter::BatteryVoltage.id(), voltage.to_le_bytes().to_vec());
        self.values
            .insert(BmsParameter::BatteryCurrent.id(), current.to_le_bytes().to_vec());
        self.values.insert(BmsParameter::BatteryPercent.id(), vec![percent]);
        self.values
            .insert(BmsParameter::RtcTime.id(), encode_rtc(now + rtc_skew()));
    }

    /// Response to `frame`, if it is a read this battery answers.
    pub fn respond(&self, frame: &Frame) -> Option<Frame> {
        if frame.command() != Command::ReadRequest || frame.address() != BMS_ADDRESS {
            return None;
        }
        let value = self.values.get(&frame.parameter())?;
        Frame::read_response(
            BMS_ADDRESS,
            frame.parameter(),
            fit_to_length(value, frame.data_length()),
        )
        .ok()
    }

    /// Serve reads until `cancel` fires.
    pub fn run(mut self, cancel: &CancellationToken) -> Result<()> {
        info!(bus = %self.driver.transport().name(), "battery simulator started");
        loop {
            self.refresh(Utc::now());
            let frame = match self.driver.receive_frame(None, cancel) {
                Ok(ReceiveOutcome::Frame(frame)) => frame,
                Ok(_) => continue,
                Err(err) if err.is_cancelled() => break,
                Err(err) => return Err(err.into()),
            };
            let Some(response) = self.respond(&frame) else {
                debug!(frame = %frame, "not answering");
                continue;
            };
            debug!(response = %response, "answering");
            match self.driver.send_frame(&response, cancel) {
                Ok(()) => {}
                Err(err) if err.is_cancelled() => break,
                Err(err) => warn!(error = %err, "failed to send simulated response"),
            }
        }
        info!("battery simulator stopped");
        Ok(())
    }
}

fn encode_rtc(time: DateTime<Utc>) -> Vec<u8> {
    let year = u8::try_from(time.year() - 2000).unwrap_or_default();
    [
        year,
        time.month() as u8,
        time.day() as u8,
        time.hour() as u8,
        time.minute() as u8,
        time.second() as u8,
    ]
    .to_vec()
}

/// Polls a BMS like the motor controller does.
pub struct EscSimulator<T> {
    driver: ProtocolDriver<T>,
    parameters: Vec<ParameterDefinition>,
    period: Duration,
}

impl<T: Transport> EscSimulator<T> {
    pub fn new(driver: ProtocolDriver<T>, parameters: Vec<ParameterDefinition>) -> Self {
        Self {
            driver,
            parameters,
            period: ESC_PERIOD,
        }
    }

    /// Poll the registers the bridge mirrors.
    pub fn from_config(driver: ProtocolDriver<T>, config: &EscConfig) -> Result<Self> {
        Ok(Self::new(driver, resolve_bms_parameters(&config.mirrored)?))
    }

    /// Pause between two reads.
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Read every register once. `None` marks a read that timed out.
    pub fn read_cycle(&mut self, cancel: &CancellationToken) -> Result<Vec<(u8, Option<Vec<u8>>)>> {
        let mut results = Vec::with_capacity(self.parameters.len());
        for definition in &self.parameters {
            let value = self
                .driver
                .read_register(BMS_ADDRESS, definition.id, definition.length, cancel)?;
            results.push((definition.id, value.into_value()));
        }
        Ok(results)
    }

    /// Broadcast a status frame the way the controller announces its state.
    pub fn send_status(&mut self, status: &Frame, cancel: &CancellationToken) -> Result<()> {
        self.driver.send_frame(status, cancel)?;
        Ok(())
    }

    /// Poll until `cancel` fires.
    pub fn run(mut self, cancel: &CancellationToken) -> Result<()> {
        info!(
            bus = %self.driver.transport().name(),
            registers = self.parameters.len(),
            "ESC simulator started"
        );
        if self.parameters.is_empty() {
            cancel.wait();
        }
        'outer: while !cancel.is_cancelled() {
            for definition in self.parameters.clone() {
                let name = describe(BMS_ADDRESS, definition.id);
                match self
                    .driver
                    .read_register(BMS_ADDRESS, definition.id, definition.length, cancel)
                {
                    Ok(ReadOutcome::Value(value)) => {
                        info!(parameter = %name, value = %hex::encode(&value), "read")
                    }
                    Ok(ReadOutcome::Timeout) => info!(parameter = %name, "<timeout>"),
                    Err(err) if err.is_cancelled() => break 'outer,
                    Err(err) => return Err(err.into()),
                }
                if cancel.wait_timeout(self.period) {
                    break 'outer;
                }
            }
        }
        info!("ESC simulator stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use r_bms_common::DriverConfig;
    use r_bms_protocol::MemoryTransport;
    use std::thread;

    fn quick() -> DriverConfig {
        DriverConfig {
            retries: 3,
            receive_timeout: Duration::from_millis(100),
            retry_delay: Duration::from_millis(1),
        }
    }

    fn battery() -> BatterySimulator<MemoryTransport> {
        let (bus, _) = MemoryTransport::pair("battery", "peer");
        BatterySimulator::with_seed(ProtocolDriver::new(bus, quick()), 7)
    }

    #[test]
    fn serves_every_register_with_requested_length() {
        let sim = battery();
        let response = sim
            .respond(&Frame::read_request(BMS_ADDRESS, BmsParameter::Temperatures.id(), 8))
            .unwrap();
        assert_eq!(
            response.payload(),
            Some(&[0x15, 0x15, 0x15, 0x00, 0x16, 0x16, 0x16, 0x00][..])
        );

        let padded = sim
            .respond(&Frame::read_request(BMS_ADDRESS, BmsParameter::Unknown7.id(), 3))
            .unwrap();
        assert_eq!(padded.payload(), Some(&[0x05, 0x00, 0x00][..]));

        let serial = sim
            .respond(&Frame::read_request(BMS_ADDRESS, BmsParameter::SerialNumber.id(), 32))
            .unwrap();
        assert_eq!(serial.payload(), Some(&[0u8; 32][..]));
    }

    #[test]
    fn ignores_other_addresses_and_unknown_registers() {
        let sim = battery();
        assert!(sim.respond(&Frame::read_request(0x0117, 9, 4)).is_none());
        assert!(sim.respond(&Frame::read_request(BMS_ADDRESS, 99, 4)).is_none());
    }

    #[test]
    fn refresh_keeps_values_in_range() {
        let mut sim = battery();
        let now = Utc.with_ymd_and_hms(2024, 5, 17, 12, 0, 0).unwrap();
        for _ in 0..100 {
            sim.refresh(now);
            let voltage =
                i32::from_le_bytes(sim.value(BmsParameter::BatteryVoltage).unwrap().try_into().unwrap());
            assert!((-50_000..67_000).contains(&voltage));
            assert!(sim.value(BmsParameter::BatteryPercent).unwrap()[0] <= 100);
        }
        assert_eq!(sim.value(BmsParameter::RtcTime).unwrap(), &[24, 5, 17, 20, 20, 54]);
    }

    #[test]
    fn esc_simulator_reads_from_battery() {
        let (esc_bus, battery_bus) = MemoryTransport::pair("esc", "battery");
        let cancel = CancellationToken::new();
        let battery = BatterySimulator::with_seed(ProtocolDriver::new(battery_bus, quick()), 1);
        let battery_cancel = cancel.clone();
        let handle = thread::spawn(move || battery.run(&battery_cancel));

        let mut esc = EscSimulator::from_config(
            ProtocolDriver::new(esc_bus, quick()),
            &EscConfig::default(),
        )
        .unwrap();
        let results = esc.read_cycle(&cancel).unwrap();
        assert_eq!(results.len(), 5);
        assert!(results.iter().all(|(_, value)| value.is_some()));
        assert_eq!(results[0], (7, Some(vec![0x05])));

        cancel.cancel();
        handle.join().unwrap().unwrap();
    }
}
