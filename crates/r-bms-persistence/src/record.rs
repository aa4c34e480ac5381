//! ---
//! bms_section: "03-persistence-logging"
//! bms_subsection: "module"
//! bms_type: "source"
//! bms_scope: "code"
//! bms_description: "Binary log record codec."
//! bms_version: "v0.0.0-prealpha"
//! bms_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};
use r_bms_common::time::{from_unix_ticks, to_unix_ticks};
use r_bms_registers::{Category, RegisterSnapshot};

const TIMESTAMP_LENGTH: usize = 8;
const FIXED_LENGTH: usize = TIMESTAMP_LENGTH + 2 + 1;
const VALUE_HEADER_LENGTH: usize = 2;
const MAX_VALUES: usize = u8::MAX as usize;
const MAX_VALUE_LENGTH: usize = u8::MAX as usize;

/// Largest possible encoded record: 255 values of 255 bytes each.
pub const MAX_RECORD_LENGTH: usize =
    FIXED_LENGTH + MAX_VALUES * (VALUE_HEADER_LENGTH + MAX_VALUE_LENGTH);

/// A record cannot be represented in the log format.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LogCodecError {
    /// More than 255 values in one record.
    #[error("record carries {0} values, at most 255 fit")]
    TooManyValues(usize),
    /// A single value is longer than 255 bytes.
    #[error("value of parameter {param} is {length} bytes, at most 255 fit")]
    ValueTooLong {
        /// Offending parameter id.
        param: u8,
        /// Its length.
        length: usize,
    },
}

/// One register value inside a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogValue {
    /// Parameter id.
    pub param: u8,
    /// Raw register bytes.
    pub data: Vec<u8>,
}

/// One timestamped group of changed register values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Publish time, stored with 100 ns precision.
    pub time: DateTime<Utc>,
    /// Producer of the values.
    pub category: Category,
    /// Values that changed since the previous record of this category.
    pub values: Vec<LogValue>,
}

impl LogRecord {
    /// Record without values, used as a timing marker.
    pub fn empty(time: DateTime<Utc>, category: Category) -> Self {
        Self {
            time,
            category,
            values: Vec::new(),
        }
    }

    /// Record carrying every value of `snapshot`.
    pub fn from_snapshot(time: DateTime<Utc>, category: Category, snapshot: &RegisterSnapshot) -> Self {
        Self {
            time,
            category,
            values: snapshot
                .iter()
                .map(|(param, data)| LogValue {
                    param,
                    data: data.to_vec(),
                })
                .collect(),
        }
    }

    /// Size of the encoded record in bytes.
    pub fn encoded_len(&self) -> usize {
        FIXED_LENGTH
            + self
                .values
                .iter()
                .map(|value| VALUE_HEADER_LENGTH + value.data.len())
                .sum::<usize>()
    }

    fn validate(&self) -> Result<(), LogCodecError> {
        if self.values.len() > MAX_VALUES {
            return Err(LogCodecError::TooManyValues(self.values.len()));
        }
        if let Some(value) = self.values.iter().find(|v| v.data.len() > MAX_VALUE_LENGTH) {
            return Err(LogCodecError::ValueTooLong {
                param: value.param,
                length: value.data.len(),
            });
        }
        Ok(())
    }
}

/// Encode `record` into a fresh buffer.
pub fn serialize(record: &LogRecord) -> Result<Vec<u8>, LogCodecError> {
    let mut out = Vec::with_capacity(record.encoded_len());
    serialize_into(record, &mut out)?;
    Ok(out)
}

/// Append the encoding of `record` to `out`, returning the number of bytes
/// written. Nothing is appended when the record is rejected.
pub fn serialize_into(record: &LogRecord, out: &mut Vec<u8>) -> Result<usize, LogCodecError> {
    record.validate()?;
    let start = out.len();
    out.extend_from_slice(&to_unix_ticks(record.time).to_le_bytes());
    out.push(record.category.as_u8());
    out.push(record.values.len() as u8);
    for value in &record.values {
        out.push(value.param);
        out.push(value.data.len() as u8);
        out.extend_from_slice(&value.data);
    }
    let sum = checksum(&out[start..]);
    out.push(sum);
    Ok(out.len() - start)
}

/// Decode one record from the front of `bytes`.
///
/// Returns the consumed length and the record, or `(0, None)` when no
/// complete valid record starts at `bytes[0]`. This covers empty input, the
/// zero category marker, a truncated tail, an unknown category and a bad
/// checksum.
pub fn deserialize(bytes: &[u8]) -> (usize, Option<LogRecord>) {
    match decode(bytes) {
        Some((consumed, record)) => (consumed, Some(record)),
        None => (0, None),
    }
}

fn decode(bytes: &[u8]) -> Option<(usize, LogRecord)> {
    let mut cursor = Cursor { bytes, position: 0 };
    let ticks = i64::from_le_bytes(cursor.take(TIMESTAMP_LENGTH)?.try_into().ok()?);
    let category = match cursor.byte()? {
        0 => return None,
        raw => Category::try_from(raw).ok()?,
    };
    let count = cursor.byte()?;
    let mut values = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        let param = cursor.byte()?;
        let length = cursor.byte()?;
        let data = cursor.take(usize::from(length))?.to_vec();
        values.push(LogValue { param, data });
    }
    let end = cursor.position;
    if cursor.byte()? != checksum(&bytes[..end]) {
        return None;
    }
    let time = from_unix_ticks(ticks)?;
    Some((
        cursor.position,
        LogRecord {
            time,
            category,
            values,
        },
    ))
}

fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, byte| acc.wrapping_add(*byte))
}

struct Cursor<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, length: usize) -> Option<&'a [u8]> {
        let slice = self.bytes.get(self.position..self.position.checked_add(length)?)?;
        self.position += length;
        Some(slice)
    }

    fn byte(&mut self) -> Option<u8> {
        self.take(1).map(|slice| slice[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> LogRecord {
        LogRecord {
            time: Utc.timestamp_opt(1_700_000_000, 250_000_000).unwrap(),
            category: Category::BmsFast,
            values: vec![
                LogValue {
                    param: 9,
                    data: vec![0x10, 0x27, 0x00, 0x00],
                },
                LogValue {
                    param: 13,
                    data: vec![0x4B],
                },
            ],
        }
    }

    #[test]
    fn record_round_trips() {
        let record = sample();
        let bytes = serialize(&record).unwrap();
        assert_eq!(bytes.len(), record.encoded_len());
        assert_eq!(deserialize(&bytes), (bytes.len(), Some(record)));
    }

    #[test]
    fn layout_is_little_endian_ticks_then_values() {
        let record = LogRecord {
            time: Utc.timestamp_opt(0, 100).unwrap(),
            category: Category::Esc,
            values: vec![LogValue {
                param: 75,
                data: vec![0xAA, 0x01],
            }],
        };
        let bytes = serialize(&record).unwrap();
        assert_eq!(
            bytes,
            vec![1, 0, 0, 0, 0, 0, 0, 0, 3, 1, 75, 2, 0xAA, 0x01, 0xFD]
        );
    }

    #[test]
    fn empty_record_is_a_timing_marker() {
        let record = LogRecord::empty(Utc.timestamp_opt(1_000, 0).unwrap(), Category::BmsSlow);
        let bytes = serialize(&record).unwrap();
        assert_eq!(bytes.len(), MAX_RECORD_LENGTH - 255 * 257);
        assert_eq!(deserialize(&bytes), (bytes.len(), Some(record)));
    }

    #[test]
    fn every_strict_prefix_is_incomplete() {
        let bytes = serialize(&sample()).unwrap();
        for end in 0..bytes.len() {
            assert_eq!(deserialize(&bytes[..end]), (0, None), "prefix of {end} bytes");
        }
    }

    #[test]
    fn trailing_bytes_are_not_consumed() {
        let mut bytes = serialize(&sample()).unwrap();
        let length = bytes.len();
        bytes.extend_from_slice(&[0; 32]);
        assert_eq!(deserialize(&bytes).0, length);
        assert_eq!(deserialize(&bytes[length..]), (0, None));
    }

    #[test]
    fn zero_category_and_unknown_category_stop_decoding() {
        let mut bytes = serialize(&sample()).unwrap();
        bytes[8] = 0;
        assert_eq!(deserialize(&bytes), (0, None));
        bytes[8] = 9;
        assert_eq!(deserialize(&bytes), (0, None));
    }

    #[test]
    fn corrupted_record_is_rejected() {
        let mut bytes = serialize(&sample()).unwrap();
        let last = bytes.len() - 1;
        bytes[last] = bytes[last].wrapping_add(1);
        assert_eq!(deserialize(&bytes), (0, None));
    }

    #[test]
    fn limits_are_enforced_without_partial_output() {
        let mut record = sample();
        record.values[1].data = vec![0; 256];
        let mut out = vec![0xEE];
        assert_eq!(
            serialize_into(&record, &mut out),
            Err(LogCodecError::ValueTooLong {
                param: 13,
                length: 256
            })
        );
        assert_eq!(out, vec![0xEE]);

        record.values = (0..256)
            .map(|i| LogValue {
                param: i as u8,
                data: Vec::new(),
            })
            .collect();
        assert_eq!(serialize(&record), Err(LogCodecError::TooManyValues(256)));
    }

    #[test]
    fn largest_record_fits_the_declared_maximum() {
        let record = LogRecord {
            time: Utc.timestamp_opt(0, 0).unwrap(),
            category: Category::BmsSlow,
            values: (0..255)
                .map(|i| LogValue {
                    param: i as u8,
                    data: vec![0xFF; 255],
                })
                .collect(),
        };
        let bytes = serialize(&record).unwrap();
        assert_eq!(bytes.len(), MAX_RECORD_LENGTH);
        assert_eq!(deserialize(&bytes).0, MAX_RECORD_LENGTH);
    }
}
