//! Wire format of the image transfer protocol.
//!
//! Control frame (4 bytes):
//! - START (1 byte): 0x55
//! - COMMAND (1 byte): `Command` or, from device to host, `Response`
//! - CHECKSUM (1 byte): truncated sum of the two preceding bytes
//! - STOP (1 byte): 0xAA
//!
//! Data frame (259 bytes):
//! - START (1 byte): 0x55
//! - TYPE (1 byte): 0x10
//! - FRAME_NUM (2 bytes): little endian
//! - SLOT (1 byte): see `ImageId::from_tag`
//! - CRC32 (4 bytes): little endian, over the full payload
//! - PAYLOAD (248 bytes)
//! - CHECKSUM (1 byte): truncated sum of all preceding bytes
//! - STOP (1 byte): 0xAA
//!
//! Per-frame responses (6 bytes): START, code, frame number (2 bytes, little endian), checksum
//! over the four preceding bytes, STOP.

use crate::platform::Crc;
use crate::raw::MAX_PAYLOAD_SIZE;
use heapless::Vec;

pub const START_MARK: u8 = 0x55;
pub const STOP_MARK: u8 = 0xAA;
pub const FRAME_TYPE_DATA: u8 = 0x10;

pub const CONTROL_FRAME_LEN: usize = 4;
pub const RESPONSE_FRAME_LEN: usize = 6;
pub const DATA_FRAME_LEN: usize = DATA_STOP_OFFSET + 1;

const TYPE_OFFSET: usize = 1;
const FRAME_NUM_OFFSET: usize = 2;
const SLOT_OFFSET: usize = 4;
const CRC_OFFSET: usize = 5;
const PAYLOAD_OFFSET: usize = 9;
const DATA_CHECKSUM_OFFSET: usize = PAYLOAD_OFFSET + MAX_PAYLOAD_SIZE;
const DATA_STOP_OFFSET: usize = DATA_CHECKSUM_OFFSET + 1;

const _: () = assert!(DATA_FRAME_LEN == 259);

/// Commands sent by the host
#[derive(strum::FromRepr, strum::Display, Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Command {
    Start = 0x01,
    End = 0x02,
}

impl Command {
    pub fn encode(self) -> [u8; CONTROL_FRAME_LEN] {
        control_frame(self as u8)
    }
}

/// Codes sent by the device. `Ready`, `Complete` and `Fail` travel in control frames, all others
/// in per-frame responses carrying the frame number.
#[derive(strum::FromRepr, strum::Display, Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Response {
    Ready = 0x03,
    Complete = 0x04,
    Fail = 0x05,
    Ack = 0x20,
    NakChecksum = 0x22,
    NakCrc = 0x23,
    NakStateMismatch = 0x24,
    NakBufferOverflow = 0x25,
    NakInvalidFrame = 0x26,
    NakFlashWriteFail = 0x27,
}

impl Response {
    pub fn control_frame(self) -> [u8; CONTROL_FRAME_LEN] {
        control_frame(self as u8)
    }

    pub fn frame_response(self, frame_num: u16) -> [u8; RESPONSE_FRAME_LEN] {
        let [lo, hi] = frame_num.to_le_bytes();
        let mut frame = [START_MARK, self as u8, lo, hi, 0, STOP_MARK];
        frame[4] = checksum(&frame[..4]);
        frame
    }
}

/// Truncated byte sum
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

fn control_frame(code: u8) -> [u8; CONTROL_FRAME_LEN] {
    let mut frame = [START_MARK, code, 0, STOP_MARK];
    frame[2] = checksum(&frame[..2]);
    frame
}

/// Frame number of a (possibly truncated) data frame, 0 if it is too short to carry one
pub fn frame_num_of(raw: &[u8]) -> u16 {
    match raw.get(FRAME_NUM_OFFSET..FRAME_NUM_OFFSET + 2) {
        Some(&[lo, hi]) => u16::from_le_bytes([lo, hi]),
        _ => 0,
    }
}

/// Command of a control frame, `None` if the checksum does not match or the command is unknown.
pub fn parse_control(raw: &[u8; CONTROL_FRAME_LEN]) -> Option<Command> {
    if raw[2] != checksum(&raw[..2]) {
        return None;
    }
    Command::from_repr(raw[1])
}

#[derive(Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub frame_num: u16,
    pub slot: u8,
    pub crc: u32,
    pub payload: [u8; MAX_PAYLOAD_SIZE],
}

impl DataFrame {
    /// Builds a frame around `data`, zero padded to the full payload size.
    pub fn new<C: Crc>(frame_num: u16, slot: u8, data: &[u8]) -> Self {
        let mut payload = [0u8; MAX_PAYLOAD_SIZE];
        let len = data.len().min(MAX_PAYLOAD_SIZE);
        payload[..len].copy_from_slice(&data[..len]);
        Self {
            frame_num,
            slot,
            crc: C::crc32(&payload),
            payload,
        }
    }

    pub fn encode(&self) -> [u8; DATA_FRAME_LEN] {
        let mut raw = [0u8; DATA_FRAME_LEN];
        raw[0] = START_MARK;
        raw[TYPE_OFFSET] = FRAME_TYPE_DATA;
        raw[FRAME_NUM_OFFSET..SLOT_OFFSET].copy_from_slice(&self.frame_num.to_le_bytes());
        raw[SLOT_OFFSET] = self.slot;
        raw[CRC_OFFSET..PAYLOAD_OFFSET].copy_from_slice(&self.crc.to_le_bytes());
        raw[PAYLOAD_OFFSET..DATA_CHECKSUM_OFFSET].copy_from_slice(&self.payload);
        raw[DATA_CHECKSUM_OFFSET] = checksum(&raw[..DATA_CHECKSUM_OFFSET]);
        raw[DATA_STOP_OFFSET] = STOP_MARK;
        raw
    }

    /// Extracts the fields without validating anything.
    pub fn decode(raw: &[u8; DATA_FRAME_LEN]) -> Self {
        let mut payload = [0u8; MAX_PAYLOAD_SIZE];
        payload.copy_from_slice(&raw[PAYLOAD_OFFSET..DATA_CHECKSUM_OFFSET]);
        Self {
            frame_num: frame_num_of(raw),
            slot: raw[SLOT_OFFSET],
            crc: u32::from_le_bytes([
                raw[CRC_OFFSET],
                raw[CRC_OFFSET + 1],
                raw[CRC_OFFSET + 2],
                raw[CRC_OFFSET + 3],
            ]),
            payload,
        }
    }

    pub fn checksum_valid(raw: &[u8; DATA_FRAME_LEN]) -> bool {
        raw[DATA_CHECKSUM_OFFSET] == checksum(&raw[..DATA_CHECKSUM_OFFSET])
    }

    pub fn crc_valid<C: Crc>(&self) -> bool {
        C::crc32(&self.payload) == self.crc
    }
}

impl core::fmt::Debug for DataFrame {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let frame_num = self.frame_num;
        let slot = self.slot;
        let crc = self.crc;
        f.write_fmt(format_args!(
            "DataFrame {{ frame_num: {frame_num}, slot: 0x{slot:0>2x}, crc: 0x{crc:0>8x} }}"
        ))
    }
}

/// Outcome of feeding a byte into the `FrameAssembler`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    Control([u8; CONTROL_FRAME_LEN]),
    Data([u8; DATA_FRAME_LEN]),
    /// A data frame of full length without a stop mark at its end
    Malformed { frame_num: u16 },
    /// A frame grew to the maximum length without being terminated
    Overflow { frame_num: u16 },
}

/// Cuts the byte stream into frames.
///
/// Bytes outside of a frame are dropped until a start mark shows up. A data frame is only complete
/// at its full length since the payload may contain stop marks. Any other frame ends at the first
/// stop mark once 4 bytes are buffered and is dropped unless it is exactly 4 bytes long.
#[derive(Debug, Clone, Default)]
pub struct FrameAssembler {
    buffer: Vec<u8, DATA_FRAME_LEN>,
}

impl FrameAssembler {
    pub const fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// `true` while a frame is partially buffered
    pub fn in_frame(&self) -> bool {
        !self.buffer.is_empty()
    }

    pub fn push(&mut self, byte: u8) -> Option<FrameEvent> {
        if self.buffer.is_empty() && byte != START_MARK {
            return None;
        }

        // never full here, a buffer at maximum length is always drained below
        if self.buffer.push(byte).is_err() {
            self.buffer.clear();
            return None;
        }

        let len = self.buffer.len();
        let is_data = self.buffer.get(TYPE_OFFSET) == Some(&FRAME_TYPE_DATA);

        let event = if is_data {
            if len < DATA_FRAME_LEN {
                return None;
            }
            match <[u8; DATA_FRAME_LEN]>::try_from(self.buffer.as_slice()) {
                Ok(raw) if raw[DATA_STOP_OFFSET] == STOP_MARK => Some(FrameEvent::Data(raw)),
                _ => Some(FrameEvent::Malformed {
                    frame_num: frame_num_of(&self.buffer),
                }),
            }
        } else if byte == STOP_MARK && len >= CONTROL_FRAME_LEN {
            match <[u8; CONTROL_FRAME_LEN]>::try_from(self.buffer.as_slice()) {
                Ok(raw) => Some(FrameEvent::Control(raw)),
                Err(_) => None,
            }
        } else if len == DATA_FRAME_LEN {
            Some(FrameEvent::Overflow {
                frame_num: frame_num_of(&self.buffer),
            })
        } else {
            return None;
        };

        self.buffer.clear();
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Software;
    impl Crc for Software {}

    fn feed(assembler: &mut FrameAssembler, bytes: &[u8]) -> std::vec::Vec<FrameEvent> {
        bytes.iter().filter_map(|&b| assembler.push(b)).collect()
    }

    #[test]
    fn control_frames() {
        assert_eq!(Command::Start.encode(), [0x55, 0x01, 0x56, 0xAA]);
        assert_eq!(Command::End.encode(), [0x55, 0x02, 0x57, 0xAA]);
        assert_eq!(Response::Ready.control_frame(), [0x55, 0x03, 0x58, 0xAA]);
        assert_eq!(
            Response::NakCrc.frame_response(0x0102),
            [0x55, 0x23, 0x02, 0x01, 0x7B, 0xAA]
        );
        assert_eq!(parse_control(&Command::End.encode()), Some(Command::End));
        assert_eq!(parse_control(&[0x55, 0x01, 0x00, 0xAA]), None);
        assert_eq!(parse_control(&[0x55, 0x07, 0x5C, 0xAA]), None);
    }

    #[test]
    fn data_frame_layout() {
        let frame = DataFrame::new::<Software>(0x0102, 0x83, &[0xAB; 120]);
        let raw = frame.encode();
        assert_eq!(&raw[..5], &[0x55, 0x10, 0x02, 0x01, 0x83]);
        assert_eq!(&raw[5..9], &Software::crc32(&frame.payload).to_le_bytes());
        assert_eq!(raw[9], 0xAB);
        assert_eq!(raw[9 + 120], 0x00);
        assert_eq!(raw[258], 0xAA);
        assert!(DataFrame::checksum_valid(&raw));

        let decoded = DataFrame::decode(&raw);
        assert_eq!(decoded, frame);
        assert!(decoded.crc_valid::<Software>());
    }

    #[test]
    fn skips_noise_and_finds_frames() {
        let mut assembler = FrameAssembler::new();
        let mut stream = std::vec![0x00, 0xAA, 0x13];
        stream.extend_from_slice(&Command::Start.encode());
        stream.push(0x42);
        stream.extend_from_slice(&Command::End.encode());

        assert_eq!(
            feed(&mut assembler, &stream),
            std::vec![
                FrameEvent::Control(Command::Start.encode()),
                FrameEvent::Control(Command::End.encode()),
            ]
        );
        assert!(!assembler.in_frame());
    }

    #[test]
    fn payload_may_contain_marks() {
        let mut payload = [0u8; MAX_PAYLOAD_SIZE];
        for (i, b) in payload.iter_mut().enumerate() {
            *b = if i % 2 == 0 { STOP_MARK } else { START_MARK };
        }
        let raw = DataFrame::new::<Software>(7, 0, &payload).encode();

        let mut assembler = FrameAssembler::new();
        assert_eq!(
            feed(&mut assembler, &raw),
            std::vec![FrameEvent::Data(raw)]
        );
    }

    #[test]
    fn malformed_and_overflowing_frames() {
        let mut raw = DataFrame::new::<Software>(9, 0, &[1; 248]).encode();
        raw[258] = 0x00;

        let mut assembler = FrameAssembler::new();
        assert_eq!(
            feed(&mut assembler, &raw),
            std::vec![FrameEvent::Malformed { frame_num: 9 }]
        );

        // unknown type, never terminated
        let mut garbage = std::vec![0x55, 0x33, 0x05, 0x00];
        garbage.resize(DATA_FRAME_LEN, 0x01);
        assert_eq!(
            feed(&mut assembler, &garbage),
            std::vec![FrameEvent::Overflow { frame_num: 5 }]
        );

        // terminated but too long for a control frame
        assert_eq!(feed(&mut assembler, &[0x55, 0x01, 0x02, 0x56, 0xAA]), std::vec![]);
        assert!(!assembler.in_frame());
    }
}
