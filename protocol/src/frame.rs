//! Wire framing of the MCU serial protocol.
//!
//! Every message, in both directions, has the following layout:
//!
//! | Offset      | Field                           |
//! |-------------|---------------------------------|
//! | 0           | `0x55`                          |
//! | 1           | `0xAA`                          |
//! | 2           | protocol version                |
//! | 3           | command                         |
//! | 4..6        | payload length (big-endian)     |
//! | 6..6+len    | payload                         |
//! | 6+len       | checksum                        |
//!
//! The checksum is the sum of all preceding bytes modulo 256.
//! There is no end delimiter: a frame is complete as soon as
//! its checksum byte has been received.

use alloc::vec::Vec;
use core::{
    fmt::{Display, Formatter},
    num::Wrapping,
};
use log::{trace, warn};
use strum::FromRepr;

/// First header byte.
pub const HEADER_1: u8 = 0x55;

/// Second header byte.
pub const HEADER_2: u8 = 0xaa;

/// Length of the fixed frame header.
pub const HEADER_LEN: usize = 6;

/// Protocol version used for frames sent by the module.
pub const MODULE_VERSION: u8 = 0x00;

/// Command code carried in byte 3 of a frame.
///
/// Not every command is handled by the [`Engine`](crate::engine::Engine),
/// but all codes used by the lock firmware are listed here.
#[derive(FromRepr, strum::Display, PartialEq, Eq, Copy, Clone, Debug)]
#[repr(u8)]
pub enum CommandType {
    /// Product information query (heartbeat during initialization).
    ProductQuery = 0x01,
    /// Network status report.
    WifiState = 0x02,
    /// Network reset request.
    WifiReset = 0x03,
    /// Network pairing mode selection.
    WifiSelect = 0x04,
    /// Real-time datapoint report.
    DatapointReport = 0x05,
    /// Local time query.
    LocalTimeQuery = 0x06,
    /// Network functional test.
    WifiTest = 0x07,
    /// Record-type datapoint report, prefixed with a timestamp.
    DatapointRecordReport = 0x08,
    /// Datapoint command sent by the module.
    ModuleSendCommand = 0x09,
    /// Module firmware update request.
    WifiModuleFwUpdate = 0x0a,
    /// Signal strength query.
    WifiRssi = 0x0b,
    /// MCU firmware update request.
    McuFwUpdate = 0x0c,
    /// Firmware update start.
    StartUpdate = 0x0d,
    /// Firmware update package transfer.
    TransmitUpdatePackage = 0x0e,
    /// GMT time query.
    GmtTimeQuery = 0x10,
    /// Single cloud temporary password request.
    TempPasswordCloudSingle = 0x11,
    /// Dynamic password verification.
    VerifyDynamicPassword = 0x12,
    /// Multiple cloud temporary passwords request.
    TempPasswordCloudMultiple = 0x13,
    /// Scheduled cloud temporary password request.
    TempPasswordCloudSchedule = 0x14,
    /// Datapoint cache query.
    GetDatapointCache = 0x15,
    /// Offline dynamic password verification.
    OfflineDynamicPassword = 0x16,
    /// MCU serial number report.
    ReportSerialNumber = 0x17,
    /// Positional notation negotiation.
    PositionalNotation = 0x1c,
    /// Automatic update.
    AutomaticUpdate = 0x21,
    /// Module reset notification.
    NotifyModuleReset = 0x25,
    /// Production test.
    WifiTest2 = 0xf0,
}

impl CommandType {
    /// Returns whether the MCU answers this command with a frame of the same type.
    ///
    /// Only commands with a response keep the scheduler busy until they are answered.
    #[must_use]
    pub const fn expects_response(self) -> bool {
        matches!(self, Self::ProductQuery)
    }
}

/// An outbound command waiting in the scheduler queue.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Command {
    /// Command code.
    pub kind: CommandType,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

impl Command {
    /// Constructs a new command.
    #[must_use]
    pub fn new(kind: CommandType, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    /// Constructs a command without payload.
    #[must_use]
    pub fn empty(kind: CommandType) -> Self {
        Self::new(kind, Vec::new())
    }

    /// Serializes the command into a complete frame.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        encode(MODULE_VERSION, self.kind as u8, &self.payload)
    }
}

/// A complete, checksum-validated frame.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Frame {
    /// Protocol version announced by the sender.
    pub version: u8,
    /// Raw command code.
    pub command: u8,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

/// Reason a partially received frame was discarded.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum Rejection {
    /// A header byte did not match the fixed header.
    InvalidHeader(u8),
    /// The received checksum does not match the computed one.
    IncorrectChecksum {
        /// Checksum computed over the received bytes.
        expected: u8,
        /// Checksum byte that was received.
        received: u8,
    },
}

impl Display for Rejection {
    fn fmt(&self, f: &mut Formatter) -> core::fmt::Result {
        match self {
            Self::InvalidHeader(byte) => write!(f, "invalid header byte {byte:02x}"),
            Self::IncorrectChecksum { expected, received } => {
                write!(f, "incorrect checksum {received:02x} != {expected:02x}")
            }
        }
    }
}

/// Result of validating the receive buffer after a new byte.
enum Validation {
    Incomplete,
    Complete,
    Rejected(Rejection),
}

/// Computes the checksum over a byte slice.
#[must_use]
pub fn compute_checksum(data: &[u8]) -> u8 {
    data.iter().map(|&x| Wrapping(x)).sum::<Wrapping<_>>().0
}

/// Serializes a frame, appending length and checksum.
///
/// Payloads longer than 65535 bytes cannot be represented and are truncated.
#[must_use]
pub fn encode(version: u8, command: u8, payload: &[u8]) -> Vec<u8> {
    let payload = &payload[..payload.len().min(usize::from(u16::MAX))];
    let len = payload.len() as u16;
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len() + 1);

    buf.extend_from_slice(&[HEADER_1, HEADER_2, version, command]);
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(payload);
    buf.push(compute_checksum(&buf));

    buf
}

/// Incremental frame decoder.
///
/// Bytes are pushed one at a time and the buffer is validated after every byte.
/// The buffer is cleared whenever a frame completes or is rejected;
/// there is no further resynchronization, since a corrupted length field
/// cannot be told apart from valid data before the checksum arrives.
#[derive(Default, Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    last_byte_at: Option<u64>,
}

impl FrameDecoder {
    /// Constructs an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether no frame is currently being received.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Discards any partially received frame.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Pushes a received byte at time `now` (milliseconds).
    ///
    /// Returns the decoded frame once its checksum byte has been accepted.
    pub fn push(&mut self, byte: u8, now: u64) -> Option<Frame> {
        self.buf.push(byte);

        match self.validate() {
            Validation::Incomplete => {
                self.last_byte_at = Some(now);

                None
            }
            Validation::Complete => {
                let frame = Frame {
                    version: self.buf[2],
                    command: self.buf[3],
                    payload: self.buf[HEADER_LEN..self.buf.len() - 1].to_vec(),
                };

                trace!(
                    "Received frame: command={:02x} version={} payload={:02x?}",
                    frame.command, frame.version, frame.payload
                );
                self.buf.clear();

                Some(frame)
            }
            Validation::Rejected(reason) => {
                self.buf.clear();

                match reason {
                    // A stray byte may hide the start of the next frame
                    Rejection::InvalidHeader(HEADER_1) => {
                        self.buf.push(HEADER_1);
                        self.last_byte_at = Some(now);
                    }
                    Rejection::InvalidHeader(_) => trace!("Discarding byte: {reason}"),
                    Rejection::IncorrectChecksum { .. } => warn!("Discarding frame: {reason}"),
                }

                None
            }
        }
    }

    /// Clears a stalled partial frame if no byte arrived for longer than `timeout`.
    ///
    /// Returns whether the buffer was cleared.
    pub fn expire(&mut self, now: u64, timeout: u64) -> bool {
        match self.last_byte_at {
            Some(at) if !self.buf.is_empty() && now.saturating_sub(at) > timeout => {
                trace!("Receive timeout, discarding {} bytes", self.buf.len());
                self.buf.clear();

                true
            }
            _ => false,
        }
    }

    fn validate(&self) -> Validation {
        let at = self.buf.len() - 1;
        let byte = self.buf[at];

        match at {
            0 if byte != HEADER_1 => return Validation::Rejected(Rejection::InvalidHeader(byte)),
            1 if byte != HEADER_2 => return Validation::Rejected(Rejection::InvalidHeader(byte)),
            // Version, command and length are not validated
            0..HEADER_LEN => return Validation::Incomplete,
            _ => {}
        }

        let len = usize::from(u16::from_be_bytes([self.buf[4], self.buf[5]]));

        // Wait for the remaining payload
        if at < HEADER_LEN + len {
            return Validation::Incomplete;
        }

        let expected = compute_checksum(&self.buf[..at]);

        if byte == expected {
            Validation::Complete
        } else {
            Validation::Rejected(Rejection::IncorrectChecksum {
                expected,
                received: byte,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::init_logger;
    use alloc::vec;

    fn push_all(dec: &mut FrameDecoder, bytes: &[u8]) -> Vec<Frame> {
        bytes.iter().filter_map(|&b| dec.push(b, 0)).collect()
    }

    fn sample_frame() -> Vec<u8> {
        let mut bytes = vec![0x55, 0xaa, 0x00, 0x01, 0x00, 0x02, 0xaa, 0xbb];

        bytes.push(compute_checksum(&bytes));

        bytes
    }

    #[test]
    fn checksum_wraps() {
        assert_eq!(compute_checksum(&[0xff, 0x02]), 0x01);
        assert_eq!(compute_checksum(&[]), 0x00);
    }

    #[test]
    fn encode_frame() {
        assert_eq!(
            Command::new(CommandType::DatapointReport, [0x00]).encode(),
            [0x55, 0xaa, 0x00, 0x05, 0x00, 0x01, 0x00, 0x05],
            "frame should be correct"
        );
        assert_eq!(
            Command::empty(CommandType::ProductQuery).encode(),
            [0x55, 0xaa, 0x00, 0x01, 0x00, 0x00, 0x00],
            "frame should be correct"
        );
    }

    #[test]
    fn decode_frame() {
        init_logger();

        let mut dec = FrameDecoder::new();
        let frames = push_all(&mut dec, &sample_frame());

        assert_eq!(
            frames,
            [Frame {
                version: 0x00,
                command: 0x01,
                payload: vec![0xaa, 0xbb],
            }],
            "exactly one frame should be decoded"
        );
        assert!(dec.is_empty(), "buffer should be cleared");
    }

    #[test]
    fn decode_empty_payload() {
        let mut dec = FrameDecoder::new();
        let frames = push_all(&mut dec, &[0x55, 0xaa, 0x03, 0x02, 0x00, 0x00, 0x04]);

        assert_eq!(frames.len(), 1, "frame should be decoded");
        assert_eq!(frames[0].version, 0x03, "version should be passed through");
        assert!(frames[0].payload.is_empty(), "payload should be empty");
    }

    #[test]
    fn reject_corrupted_payload() {
        init_logger();

        for idx in HEADER_LEN..HEADER_LEN + 2 {
            for bit in 0..8 {
                let mut bytes = sample_frame();

                bytes[idx] ^= 1 << bit;

                let mut dec = FrameDecoder::new();

                assert!(
                    push_all(&mut dec, &bytes).is_empty(),
                    "frame with bit {bit} of byte {idx} flipped should be rejected"
                );
                assert!(dec.is_empty(), "buffer should be cleared");
            }
        }
    }

    #[test]
    fn resync_after_garbage() {
        init_logger();

        let mut bytes = vec![0x00, 0x12, 0xaa, 0x55, 0x55];

        bytes.extend(sample_frame());

        let mut dec = FrameDecoder::new();
        let frames = push_all(&mut dec, &bytes);

        assert_eq!(frames.len(), 1, "valid frame should be decoded");
        assert_eq!(frames[0].payload, [0xaa, 0xbb], "payload should be correct");
    }

    #[test]
    fn decode_back_to_back_frames() {
        let mut bytes = sample_frame();

        bytes.extend(Command::new(CommandType::WifiState, [0x04]).encode());

        let mut dec = FrameDecoder::new();
        let frames = push_all(&mut dec, &bytes);

        assert_eq!(frames.len(), 2, "both frames should be decoded");
        assert_eq!(frames[1].command, CommandType::WifiState as u8);
    }

    #[test]
    fn expire_partial_frame() {
        let mut dec = FrameDecoder::new();

        for &b in &sample_frame()[..4] {
            assert!(dec.push(b, 100).is_none());
        }

        assert!(!dec.expire(400, 300), "buffer should survive until timeout");
        assert!(dec.expire(401, 300), "buffer should expire after timeout");
        assert!(dec.is_empty(), "buffer should be cleared");
        assert!(!dec.expire(1000, 300), "empty buffer should not expire");
    }
}
