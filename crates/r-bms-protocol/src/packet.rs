//! ---
//! bms_section: "02-messaging-ipc-data-model"
//! bms_subsection: "module"
//! bms_type: "source"
//! bms_scope: "code"
//! bms_description: "Framing codec for the RS485 register protocol."
//! bms_version: "v0.0.0-prealpha"
//! bms_owner: "tbd"
//! ---
//! Wire layout of one frame:
//!
//! ```text
//! +---------+-------------+-----------+--------+-----------------+----------+
//! | command | address LE  | parameter | length | payload         | checksum |
//! | 1 byte  | 2 bytes     | 1 byte    | 1 byte | 0..=255 bytes   | 1 byte   |
//! +---------+-------------+-----------+--------+-----------------+----------+
//! ```
//!
//! Read requests carry no payload even though their length byte is set to
//! the requested register length. Status frames announce one byte more than
//! they carry. The checksum is the wrapping sum of all preceding bytes.

use std::fmt;

/// Command byte, address, parameter and length byte.
pub const HEADER_LENGTH: usize = 5;
/// Trailing checksum byte.
pub const CHECKSUM_LENGTH: usize = 1;
/// Shortest frame on the wire: a header and a checksum.
pub const MIN_FRAME_LENGTH: usize = HEADER_LENGTH + CHECKSUM_LENGTH;
/// Longest frame on the wire.
pub const MAX_FRAME_LENGTH: usize = HEADER_LENGTH + u8::MAX as usize + CHECKSUM_LENGTH;

/// Failures while decoding bytes into a [`Frame`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Fewer bytes than the fixed header (and checksum) require.
    #[error("frame too short: {length} bytes")]
    TooShort {
        /// Bytes available.
        length: usize,
    },
    /// The trailing checksum does not match the frame contents.
    #[error("checksum mismatch: calculated {calculated:#04x}, received {received:#04x}")]
    ChecksumMismatch {
        /// Sum over the received bytes.
        calculated: u8,
        /// Checksum byte found on the wire.
        received: u8,
    },
    /// The first byte is not a known command.
    #[error("unknown command byte {0:#04x}")]
    UnknownCommand(u8),
    /// The header announces a different frame size than was supplied.
    #[error("length mismatch: header announces {expected} bytes, got {actual}")]
    LengthMismatch {
        /// Size derived from the header.
        expected: usize,
        /// Size of the supplied slice.
        actual: usize,
    },
}

/// Invariant violations when building a [`Frame`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// Read requests never carry a payload.
    #[error("read requests must not carry a payload")]
    UnexpectedPayload,
    /// Responses and status frames always carry a payload.
    #[error("{0:?} frames require a payload")]
    MissingPayload(Command),
    /// Payload size disagrees with the declared data length.
    #[error("payload holds {actual} bytes but data length is {declared}")]
    PayloadLength {
        /// Declared data length.
        declared: u8,
        /// Bytes in the payload.
        actual: usize,
    },
    /// Payload does not fit the one-byte length field.
    #[error("payload of {0} bytes exceeds 255")]
    PayloadTooLong(usize),
}

/// Frame command byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// Ask a device for a register.
    ReadRequest = 0x46,
    /// Register value sent in reply to a request.
    ReadResponse = 0x47,
    /// Unsolicited status broadcast.
    Status = 0x57,
}

impl Command {
    /// Raw command byte.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether frames of this command carry payload bytes.
    pub const fn carries_payload(self) -> bool {
        !matches!(self, Self::ReadRequest)
    }

    /// Length byte written on the wire for a given data length.
    pub const fn wire_length(self, data_length: u8) -> u8 {
        match self {
            Self::Status => data_length.wrapping_add(1),
            _ => data_length,
        }
    }

    /// Data length represented by a length byte read from the wire.
    pub const fn data_length(self, wire_length: u8) -> u8 {
        match self {
            Self::Status => wire_length.wrapping_sub(1),
            _ => wire_length,
        }
    }

    /// Total frame size for a given data length.
    pub const fn frame_length(self, data_length: u8) -> usize {
        let payload = if self.carries_payload() {
            data_length as usize
        } else {
            0
        };
        HEADER_LENGTH + payload + CHECKSUM_LENGTH
    }
}

impl TryFrom<u8> for Command {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x46 => Ok(Self::ReadRequest),
            0x47 => Ok(Self::ReadResponse),
            0x57 => Ok(Self::Status),
            other => Err(DecodeError::UnknownCommand(other)),
        }
    }
}

/// Wrapping 8-bit sum used as frame checksum.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, byte| sum.wrapping_add(*byte))
}

/// Total frame length announced by a header.
///
/// Only the first [`HEADER_LENGTH`] bytes are inspected, which lets a
/// receiver read the rest of the frame without over-reading the stream.
pub fn expected_length(header: &[u8]) -> Result<usize, DecodeError> {
    if header.len() < HEADER_LENGTH {
        return Err(DecodeError::TooShort {
            length: header.len(),
        });
    }
    let command = Command::try_from(header[0])?;
    Ok(command.frame_length(command.data_length(header[4])))
}

/// One message exchanged on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    command: Command,
    address: u16,
    parameter: u8,
    data_length: u8,
    payload: Option<Vec<u8>>,
}

impl Frame {
    /// Build a frame, checking the payload against the command.
    pub fn new(
        command: Command,
        address: u16,
        parameter: u8,
        data_length: u8,
        payload: Option<Vec<u8>>,
    ) -> Result<Self, FrameError> {
        match (&payload, command.carries_payload()) {
            (Some(_), false) => return Err(FrameError::UnexpectedPayload),
            (None, true) => return Err(FrameError::MissingPayload(command)),
            (Some(data), true) if data.len() != usize::from(data_length) => {
                return Err(FrameError::PayloadLength {
                    declared: data_length,
                    actual: data.len(),
                })
            }
            _ => {}
        }
        Ok(Self {
            command,
            address,
            parameter,
            data_length,
            payload,
        })
    }

    /// Request `data_length` bytes of register `parameter`.
    pub fn read_request(address: u16, parameter: u8, data_length: u8) -> Self {
        Self {
            command: Command::ReadRequest,
            address,
            parameter,
            data_length,
            payload: None,
        }
    }

    /// Answer a read request with `payload`.
    pub fn read_response(address: u16, parameter: u8, payload: Vec<u8>) -> Result<Self, FrameError> {
        Self::with_payload(Command::ReadResponse, address, parameter, payload)
    }

    /// Status broadcast carrying `payload`.
    pub fn status(address: u16, parameter: u8, payload: Vec<u8>) -> Result<Self, FrameError> {
        Self::with_payload(Command::Status, address, parameter, payload)
    }

    fn with_payload(
        command: Command,
        address: u16,
        parameter: u8,
        payload: Vec<u8>,
    ) -> Result<Self, FrameError> {
        let data_length =
            u8::try_from(payload.len()).map_err(|_| FrameError::PayloadTooLong(payload.len()))?;
        Ok(Self {
            command,
            address,
            parameter,
            data_length,
            payload: Some(payload),
        })
    }

    pub fn command(&self) -> Command {
        self.command
    }

    pub fn address(&self) -> u16 {
        self.address
    }

    pub fn parameter(&self) -> u8 {
        self.parameter
    }

    pub fn data_length(&self) -> u8 {
        self.data_length
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    pub fn into_payload(self) -> Option<Vec<u8>> {
        self.payload
    }

    /// Size of the encoded frame.
    pub fn encoded_len(&self) -> usize {
        self.command.frame_length(self.data_length)
    }

    /// Encode into a fresh buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut out);
        out
    }

    /// Append the encoded frame to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        let start = out.len();
        out.push(self.command.as_u8());
        out.extend_from_slice(&self.address.to_le_bytes());
        out.push(self.parameter);
        out.push(self.command.wire_length(self.data_length));
        if let Some(payload) = &self.payload {
            out.extend_from_slice(payload);
        }
        let sum = checksum(&out[start..]);
        out.push(sum);
    }

    /// Decode exactly one frame from `bytes`.
    ///
    /// The checksum is verified before the header is interpreted.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < MIN_FRAME_LENGTH {
            return Err(DecodeError::TooShort {
                length: bytes.len(),
            });
        }
        let (body, trailer) = bytes.split_at(bytes.len() - CHECKSUM_LENGTH);
        let calculated = checksum(body);
        if calculated != trailer[0] {
            return Err(DecodeError::ChecksumMismatch {
                calculated,
                received: trailer[0],
            });
        }

        let command = Command::try_from(bytes[0])?;
        let expected = expected_length(bytes)?;
        if expected != bytes.len() {
            return Err(DecodeError::LengthMismatch {
                expected,
                actual: bytes.len(),
            });
        }

        let data_length = command.data_length(bytes[4]);
        let payload = command
            .carries_payload()
            .then(|| bytes[HEADER_LENGTH..HEADER_LENGTH + usize::from(data_length)].to_vec());

        Ok(Self {
            command,
            address: u16::from_le_bytes([bytes[1], bytes[2]]),
            parameter: bytes[3],
            data_length,
            payload,
        })
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} addr={:#06x} param={} len={}",
            self.command, self.address, self.parameter, self.data_length
        )?;
        if let Some(payload) = &self.payload {
            write!(f, " data={}", hex::encode_upper(payload))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(text: &str) -> Vec<u8> {
        hex::decode(text.replace(' ', "")).unwrap()
    }

    #[test]
    fn read_request_vector() {
        let frame = Frame::decode(&bytes("46 16 01 07 01 65")).unwrap();
        assert_eq!(frame, Frame::read_request(0x0116, 7, 1));
        assert_eq!(frame.payload(), None);
        assert_eq!(frame.encode(), bytes("46 16 01 07 01 65"));
    }

    #[test]
    fn read_response_vector() {
        let frame = Frame::decode(&bytes("47 16 01 07 01 05 6B")).unwrap();
        assert_eq!(frame.command(), Command::ReadResponse);
        assert_eq!(frame.address(), 0x0116);
        assert_eq!(frame.parameter(), 7);
        assert_eq!(frame.payload(), Some(&[0x05][..]));
        assert_eq!(frame.encode(), bytes("47 16 01 07 01 05 6B"));
    }

    #[test]
    fn status_vector_keeps_length_quirk() {
        let wire = bytes("57 83 01 48 0C 4B 63 F2 00 00 00 00 80 00 00 00 4F");
        let frame = Frame::decode(&wire).unwrap();
        assert_eq!(frame.command(), Command::Status);
        assert_eq!(frame.address(), 0x0183);
        assert_eq!(frame.parameter(), 0x48);
        assert_eq!(frame.data_length(), 11);
        assert_eq!(
            frame.payload(),
            Some(&bytes("4B 63 F2 00 00 00 00 80 00 00 00")[..])
        );
        assert_eq!(frame.encode(), wire);
    }

    #[test]
    fn status_wire_length_is_one_more() {
        for data_length in [0u8, 1, 11, 200, 254, 255] {
            let frame = Frame::status(0x0183, 72, vec![0xAA; usize::from(data_length)]).unwrap();
            let encoded = frame.encode();
            assert_eq!(encoded[4], data_length.wrapping_add(1));
            assert_eq!(encoded.len(), frame.encoded_len());
            assert_eq!(Frame::decode(&encoded).unwrap(), frame);
        }
    }

    #[test]
    fn bad_checksum_is_reported_first() {
        assert_eq!(
            Frame::decode(&bytes("46 16 01 07 01 FF")).unwrap_err(),
            DecodeError::ChecksumMismatch {
                calculated: 0x65,
                received: 0xFF
            }
        );
        // unknown command with a broken checksum still reports the checksum
        assert!(matches!(
            Frame::decode(&bytes("10 16 01 07 01 00")).unwrap_err(),
            DecodeError::ChecksumMismatch { .. }
        ));
    }

    #[test]
    fn short_input_is_rejected() {
        assert_eq!(
            Frame::decode(&bytes("46 16")).unwrap_err(),
            DecodeError::TooShort { length: 2 }
        );
        assert_eq!(
            Frame::decode(&[]).unwrap_err(),
            DecodeError::TooShort { length: 0 }
        );
    }

    #[test]
    fn unknown_command_after_valid_checksum() {
        let mut wire = vec![0x10, 0x16, 0x01, 0x07, 0x01];
        wire.push(checksum(&wire));
        assert_eq!(
            Frame::decode(&wire).unwrap_err(),
            DecodeError::UnknownCommand(0x10)
        );
    }

    #[test]
    fn slice_longer_than_header_announces() {
        let mut wire = bytes("47 16 01 07 01 05 06");
        let last = wire.len() - 1;
        wire[last] = 0;
        wire.push(0);
        let sum = checksum(&wire[..wire.len() - 1]);
        *wire.last_mut().unwrap() = sum;
        assert_eq!(
            Frame::decode(&wire).unwrap_err(),
            DecodeError::LengthMismatch {
                expected: 7,
                actual: 8
            }
        );
    }

    #[test]
    fn any_flipped_byte_breaks_checksum() {
        let wire = bytes("57 83 01 48 0C 4B 63 F2 00 00 00 00 80 00 00 00 4F");
        for index in 0..wire.len() {
            let mut corrupted = wire.clone();
            corrupted[index] ^= 0x01;
            assert!(
                matches!(
                    Frame::decode(&corrupted),
                    Err(DecodeError::ChecksumMismatch { .. })
                ),
                "byte {index} flip not detected"
            );
        }
    }

    #[test]
    fn expected_length_reads_header_only() {
        assert_eq!(expected_length(&bytes("46 16 01 07 20")).unwrap(), 6);
        assert_eq!(expected_length(&bytes("47 16 01 07 20")).unwrap(), 38);
        assert_eq!(expected_length(&bytes("57 83 01 48 0C")).unwrap(), 17);
        assert_eq!(expected_length(&bytes("57 83 01 48 00")).unwrap(), MAX_FRAME_LENGTH);
        assert_eq!(
            expected_length(&bytes("33 83 01 48 0C")).unwrap_err(),
            DecodeError::UnknownCommand(0x33)
        );
    }

    #[test]
    fn constructor_enforces_payload_rules() {
        assert_eq!(
            Frame::new(Command::ReadRequest, 1, 2, 3, Some(vec![0; 3])).unwrap_err(),
            FrameError::UnexpectedPayload
        );
        assert_eq!(
            Frame::new(Command::ReadResponse, 1, 2, 3, None).unwrap_err(),
            FrameError::MissingPayload(Command::ReadResponse)
        );
        assert_eq!(
            Frame::new(Command::Status, 1, 2, 3, Some(vec![0; 2])).unwrap_err(),
            FrameError::PayloadLength {
                declared: 3,
                actual: 2
            }
        );
        assert_eq!(
            Frame::read_response(1, 2, vec![0; 256]).unwrap_err(),
            FrameError::PayloadTooLong(256)
        );
    }

    #[test]
    fn display_includes_hex_payload() {
        let frame = Frame::read_response(0x0116, 9, vec![0xDE, 0xAD]).unwrap();
        assert_eq!(
            frame.to_string(),
            "ReadResponse addr=0x0116 param=9 len=2 data=DEAD"
        );
    }
}
