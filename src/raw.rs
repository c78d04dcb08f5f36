//! Byte exact layouts of everything that is persisted in a segment. All multi byte fields are
//! little endian.

use crate::platform::Crc;
use core::fmt::{Debug, Formatter};

pub const FLASH_PAGE_SIZE: usize = 256;
pub const FLASH_SECTOR_SIZE: usize = 4096;
/// Largest payload a single record can carry
pub const MAX_PAYLOAD_SIZE: usize = 248;
/// Reserved key. Reading it from a data page means the page was never written.
pub const INVALID_DATA_ID: u16 = 0xFFFF;

pub(crate) const SEGMENT_MAGIC: u8 = 0xA5;

// segment header: magic(1) + segment_id(1) + status(4) + gc_count(4) + crc32(4)
const HEADER_MAGIC_OFFSET: usize = 0;
const HEADER_ID_OFFSET: usize = 1;
pub(crate) const HEADER_STATUS_OFFSET: usize = 2;
const HEADER_GC_COUNT_OFFSET: usize = 6;
const HEADER_CRC_OFFSET: usize = 10;
pub(crate) const SEGMENT_HEADER_SIZE: usize = 14;

// data page: data_id(2) + data_size(1) + payload(248) + crc32(4)
const PAGE_ID_OFFSET: usize = 0;
const PAGE_SIZE_OFFSET: usize = 2;
pub(crate) const PAGE_PAYLOAD_OFFSET: usize = 3;
const PAGE_CRC_OFFSET: usize = PAGE_PAYLOAD_OFFSET + MAX_PAYLOAD_SIZE;
const DATA_PAGE_SIZE: usize = PAGE_CRC_OFFSET + 4;

const _: () = assert!(
    DATA_PAGE_SIZE <= FLASH_PAGE_SIZE,
    "Data page must fit into a flash page"
);
const _: () = assert!(FLASH_SECTOR_SIZE.is_multiple_of(FLASH_PAGE_SIZE));

const SSB_BACKUP: u32 = 0x1;
const SSB_GC: u32 = 0x2;
const SSB_ACTIVE: u32 = 0x4;

/// Every transition a segment header goes through only clears bits, so the status can be
/// reprogrammed in place without erasing the header sector.
#[derive(strum::FromRepr, strum::Display, Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u32)]
pub enum SegmentStatus {
    // All bits set, default state after flash erase.
    Uninitialized = u32::MAX,

    // Empty segment, target of the next garbage collection.
    Backup = SegmentStatus::Uninitialized as u32 & !SSB_BACKUP,

    // Live records are being copied into this segment.
    GcInProgress = SegmentStatus::Uninitialized as u32 & !SSB_GC,

    // Segment serves reads and writes.
    Active = SegmentStatus::GcInProgress as u32 & !SSB_ACTIVE,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SegmentHeader {
    pub segment_id: u8,
    pub status: SegmentStatus,
    pub gc_count: u32,
}

impl SegmentHeader {
    /// The status is not covered so that it can change without invalidating the crc.
    pub(crate) fn calculate_crc32<C: Crc>(&self) -> u32 {
        let [a, b, c, d] = self.gc_count.to_le_bytes();
        C::crc32(&[SEGMENT_MAGIC, self.segment_id, a, b, c, d])
    }

    pub(crate) fn to_bytes<C: Crc>(&self) -> [u8; FLASH_PAGE_SIZE] {
        let mut buf = [0u8; FLASH_PAGE_SIZE];
        buf[HEADER_MAGIC_OFFSET] = SEGMENT_MAGIC;
        buf[HEADER_ID_OFFSET] = self.segment_id;
        buf[HEADER_STATUS_OFFSET..HEADER_GC_COUNT_OFFSET]
            .copy_from_slice(&(self.status as u32).to_le_bytes());
        buf[HEADER_GC_COUNT_OFFSET..HEADER_CRC_OFFSET]
            .copy_from_slice(&self.gc_count.to_le_bytes());
        buf[HEADER_CRC_OFFSET..SEGMENT_HEADER_SIZE]
            .copy_from_slice(&self.calculate_crc32::<C>().to_le_bytes());
        buf
    }

    /// Returns `None` for erased, corrupted or otherwise unrecognizable headers.
    pub(crate) fn from_bytes<C: Crc>(buf: &[u8]) -> Option<Self> {
        if buf.len() < SEGMENT_HEADER_SIZE || buf[HEADER_MAGIC_OFFSET] != SEGMENT_MAGIC {
            return None;
        }

        let status = u32::from_le_bytes(read_array(buf, HEADER_STATUS_OFFSET));
        let header = SegmentHeader {
            segment_id: buf[HEADER_ID_OFFSET],
            status: SegmentStatus::from_repr(status)?,
            gc_count: u32::from_le_bytes(read_array(buf, HEADER_GC_COUNT_OFFSET)),
        };

        let crc = u32::from_le_bytes(read_array(buf, HEADER_CRC_OFFSET));
        if crc != header.calculate_crc32::<C>() {
            return None;
        }

        Some(header)
    }
}

/// One record as stored in a flash page.
#[derive(Clone, PartialEq, Eq)]
pub struct DataPage {
    pub data_id: u16,
    pub data_size: u8,
    pub payload: [u8; MAX_PAYLOAD_SIZE],
    pub crc: u32,
}

impl DataPage {
    /// `data` must not exceed `MAX_PAYLOAD_SIZE`, the store checks that before.
    pub(crate) fn new<C: Crc>(data_id: u16, data: &[u8]) -> Self {
        let mut payload = [0u8; MAX_PAYLOAD_SIZE];
        payload[..data.len()].copy_from_slice(data);
        Self {
            data_id,
            data_size: data.len() as u8,
            payload,
            crc: C::crc32(data),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data_id == INVALID_DATA_ID
    }

    /// The stored payload, clamped to the payload area in case the size byte is corrupted
    pub fn payload(&self) -> &[u8] {
        &self.payload[..(self.data_size as usize).min(MAX_PAYLOAD_SIZE)]
    }

    pub fn is_valid<C: Crc>(&self) -> bool {
        let size = self.data_size as usize;
        (1..=MAX_PAYLOAD_SIZE).contains(&size) && C::crc32(&self.payload[..size]) == self.crc
    }

    pub(crate) fn to_bytes(&self) -> [u8; FLASH_PAGE_SIZE] {
        let mut buf = [0xFFu8; FLASH_PAGE_SIZE];
        buf[PAGE_ID_OFFSET..PAGE_SIZE_OFFSET].copy_from_slice(&self.data_id.to_le_bytes());
        buf[PAGE_SIZE_OFFSET] = self.data_size;
        buf[PAGE_PAYLOAD_OFFSET..PAGE_CRC_OFFSET].copy_from_slice(&self.payload);
        buf[PAGE_CRC_OFFSET..DATA_PAGE_SIZE].copy_from_slice(&self.crc.to_le_bytes());
        buf
    }

    pub(crate) fn from_bytes(buf: &[u8; FLASH_PAGE_SIZE]) -> Self {
        Self {
            data_id: u16::from_le_bytes(read_array(buf, PAGE_ID_OFFSET)),
            data_size: buf[PAGE_SIZE_OFFSET],
            payload: read_array(buf, PAGE_PAYLOAD_OFFSET),
            crc: u32::from_le_bytes(read_array(buf, PAGE_CRC_OFFSET)),
        }
    }
}

impl Debug for DataPage {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        let data_id = self.data_id;
        let data_size = self.data_size;
        let crc = self.crc;
        match data_id {
            INVALID_DATA_ID => f.write_fmt(format_args!("DataPage {{ empty }}")),
            _ => f.write_fmt(format_args!(
                "DataPage {{ data_id: 0x{data_id:0>4x}, data_size: {data_size:>3}, crc: 0x{crc:0>8x} }}"
            )),
        }
    }
}

#[inline(always)]
fn read_array<const N: usize>(buf: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&buf[offset..offset + N]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Software;
    impl Crc for Software {}

    #[test]
    fn status_transitions_only_clear_bits() {
        let uninit = SegmentStatus::Uninitialized as u32;
        let backup = SegmentStatus::Backup as u32;
        let gc = SegmentStatus::GcInProgress as u32;
        let active = SegmentStatus::Active as u32;

        assert_eq!(backup & uninit, backup);
        assert_eq!(gc & uninit, gc);
        assert_eq!(active & gc, active);
        assert_eq!(backup, 0xFFFF_FFFE);
        assert_eq!(gc, 0xFFFF_FFFD);
        assert_eq!(active, 0xFFFF_FFF9);
    }

    #[test]
    fn header_layout() {
        let header = SegmentHeader {
            segment_id: 1,
            status: SegmentStatus::Active,
            gc_count: 0x0102_0304,
        };
        let buf = header.to_bytes::<Software>();
        assert_eq!(
            &buf[..10],
            &[0xA5, 0x01, 0xF9, 0xFF, 0xFF, 0xFF, 0x04, 0x03, 0x02, 0x01]
        );
        assert!(buf[SEGMENT_HEADER_SIZE..].iter().all(|&b| b == 0));
        assert_eq!(SegmentHeader::from_bytes::<Software>(&buf), Some(header));

        // status is outside of the crc
        let mut flipped = buf;
        flipped[HEADER_STATUS_OFFSET..HEADER_GC_COUNT_OFFSET]
            .copy_from_slice(&(SegmentStatus::Backup as u32).to_le_bytes());
        assert_eq!(
            SegmentHeader::from_bytes::<Software>(&flipped).map(|h| h.status),
            Some(SegmentStatus::Backup)
        );

        let mut corrupted = buf;
        corrupted[HEADER_GC_COUNT_OFFSET] ^= 0x10;
        assert_eq!(SegmentHeader::from_bytes::<Software>(&corrupted), None);

        assert_eq!(
            SegmentHeader::from_bytes::<Software>(&[0xFF; FLASH_PAGE_SIZE]),
            None
        );
    }

    #[test]
    fn data_page_layout() {
        let page = DataPage::new::<Software>(0x2001, b"Small test data\0");
        let buf = page.to_bytes();
        assert_eq!(&buf[..3], &[0x01, 0x20, 16]);
        assert_eq!(&buf[3..19], b"Small test data\0");
        assert_eq!(&buf[251..255], &Software::crc32(b"Small test data\0").to_le_bytes());
        assert_eq!(buf[255], 0xFF);

        let decoded = DataPage::from_bytes(&buf);
        assert_eq!(decoded, page);
        assert!(decoded.is_valid::<Software>());
        assert_eq!(decoded.payload(), b"Small test data\0");

        let erased = DataPage::from_bytes(&[0xFF; FLASH_PAGE_SIZE]);
        assert!(erased.is_empty());
        assert!(!erased.is_valid::<Software>());
    }
}
