//! ---
//! bms_section: "01-core-functionality"
//! bms_subsection: "module"
//! bms_type: "source"
//! bms_scope: "code"
//! bms_description: "Reads and decodes the BMS real-time clock."
//! bms_version: "v0.0.0-prealpha"
//! bms_owner: "tbd"
//! ---
use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use r_bms_common::CancellationToken;
use r_bms_protocol::{ProtocolDriver, ProtocolError, ReadOutcome, Transport};
use r_bms_registers::{BmsParameter, BMS_ADDRESS};
use tracing::debug;

use crate::{CoreError, Result};

/// Decode the `[year - 2000, month, day, hour, minute, second]` register.
pub fn decode_rtc(raw: &[u8]) -> Option<NaiveDateTime> {
    let [year, month, day, hour, minute, second, ..] = *raw else {
        return None;
    };
    NaiveDate::from_ymd_opt(2000 + i32::from(year), u32::from(month), u32::from(day))?
        .and_hms_opt(u32::from(hour), u32::from(minute), u32::from(second))
}

/// How far the BMS clock runs ahead of `host`.
pub fn clock_offset(bms: NaiveDateTime, host: DateTime<Utc>) -> chrono::Duration {
    bms - host.naive_utc()
}

/// Read the BMS clock.
///
/// The register is read twice, `settle` apart: right after the BMS wakes up
/// the first answer still carries the time it went to sleep. Returns `None`
/// when the second read times out.
pub fn read_bms_clock<T: Transport>(
    driver: &mut ProtocolDriver<T>,
    cancel: &CancellationToken,
    settle: Duration,
) -> Result<Option<NaiveDateTime>> {
    let rtc = BmsParameter::RtcTime.definition();
    let first = driver.read_register(BMS_ADDRESS, rtc.id, rtc.length, cancel)?;
    debug!(answered = matches!(first, ReadOutcome::Value(_)), "wake-up clock read");
    if cancel.wait_timeout(settle) {
        return Err(ProtocolError::Cancelled.into());
    }
    let Some(raw) = driver
        .read_register(BMS_ADDRESS, rtc.id, rtc.length, cancel)?
        .into_value()
    else {
        return Ok(None);
    };
    decode_rtc(&raw)
        .map(Some)
        .ok_or_else(|| CoreError::InvalidClock(hex::encode(&raw)))
}
