#![allow(dead_code)]

// filename according to https://doc.rust-lang.org/book/ch11-03-test-organization.html
use embedded_storage::nor_flash::{
    ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
};
use epd_flash::Layout;
use std::convert::Infallible;

pub const FLASH_SECTOR_SIZE: usize = 4096;
pub const FLASH_PAGE_SIZE: usize = 256;
pub const WORD_SIZE: usize = 4;

/// Two segments of two sectors each (31 data pages) behind one unused sector
pub const SEGMENT0: u32 = 0x1000;
pub const SEGMENT1: u32 = 0x3000;
pub const SEGMENT_SIZE: u32 = 0x2000;
pub const SECTORS: usize = 5;
pub const DATA_PAGES: u32 = SEGMENT_SIZE / FLASH_PAGE_SIZE as u32 - 1;

pub fn small_layout() -> Layout {
    Layout::new(SEGMENT0, SEGMENT1, SEGMENT_SIZE).unwrap()
}

/// Two segments of 16 sectors (255 data pages), room for four image planes
pub const IMAGE_SEGMENT0: u32 = 0x1000;
pub const IMAGE_SEGMENT1: u32 = 0x11000;
pub const IMAGE_SEGMENT_SIZE: u32 = 0x10000;
pub const IMAGE_SECTORS: usize = 33;

pub fn image_layout() -> Layout {
    Layout::new(IMAGE_SEGMENT0, IMAGE_SEGMENT1, IMAGE_SEGMENT_SIZE).unwrap()
}

/// Address of data page `page` (1 based) in the segment starting at `base`
pub fn page_address(base: u32, page: u32) -> usize {
    (base + page * FLASH_PAGE_SIZE as u32) as usize
}

/// A full color plane, distinct for every seed
pub fn test_plane(seed: u8) -> Vec<u8> {
    (0..epd_flash::image::PLANE_SIZE)
        .map(|i| (i as u8).wrapping_mul(7) ^ (i >> 8) as u8 ^ seed)
        .collect()
}

#[derive(Default, Clone)]
pub struct Flash {
    pub buf: Vec<u8>,
    pub fail_after_operation: usize,
    /// Operation number of a write that only programs the first half of its bytes and fails
    pub torn_write: Option<usize>,
    pub operations: Vec<Operation>,
}

#[derive(Debug, PartialEq, Clone)]
pub enum Operation {
    Read { offset: u32, len: usize },
    Write { offset: u32, len: usize },
    Erase { offset: u32, len: usize },
}

impl Flash {
    pub fn new(sectors: usize) -> Self {
        Self {
            buf: vec![0xffu8; FLASH_SECTOR_SIZE * sectors],
            fail_after_operation: usize::MAX,
            ..Default::default()
        }
    }

    pub fn new_with_fault(sectors: usize, fail_after_operation: usize) -> Self {
        Self {
            buf: vec![0xffu8; FLASH_SECTOR_SIZE * sectors],
            fail_after_operation,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn disable_faults(&mut self) {
        self.fail_after_operation = usize::MAX;
    }

    /// Lets the next `count` operations pass and fails every one after them
    pub fn fail_after(&mut self, count: usize) {
        self.fail_after_operation = self.operations.len() + count;
    }

    /// Tears the write issued as the `count`th operation from now, everything else passes
    pub fn tear_write_after(&mut self, count: usize) {
        self.torn_write = Some(self.operations.len() + count);
    }

    pub fn erases(&self) -> usize {
        self.operations
            .iter()
            .filter(|op| matches!(op, Operation::Erase { .. }))
            .count()
    }

    pub fn writes(&self) -> usize {
        self.operations
            .iter()
            .filter(|op| matches!(op, Operation::Write { .. }))
            .count()
    }
}

#[derive(Debug)]
pub struct FlashError;

impl NorFlashError for FlashError {
    fn kind(&self) -> NorFlashErrorKind {
        NorFlashErrorKind::Other
    }
}

impl ErrorType for Flash {
    type Error = FlashError;
}

impl ReadNorFlash for Flash {
    const READ_SIZE: usize = WORD_SIZE;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        assert!(offset.is_multiple_of(Self::READ_SIZE as _));

        if self.operations.len() >= self.fail_after_operation {
            println!("    flash: read FAULT #{}", self.operations.len());
            return Err(FlashError);
        }
        self.operations.push(Operation::Read {
            offset,
            len: bytes.len(),
        });

        let offset = offset as usize;
        bytes.copy_from_slice(&self.buf[offset..offset + bytes.len()]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.buf.len()
    }
}

impl NorFlash for Flash {
    const WRITE_SIZE: usize = WORD_SIZE;

    const ERASE_SIZE: usize = FLASH_SECTOR_SIZE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        assert!(from.is_multiple_of(Self::ERASE_SIZE as _));
        assert!(to.is_multiple_of(Self::ERASE_SIZE as _));
        // address 0 holds the boot image on the device
        assert_ne!(from, 0);

        println!(
            "    flash: erase: {from:04X} - {to:04X} #{:>2}",
            self.operations.len()
        );

        if self.operations.len() >= self.fail_after_operation {
            println!("    flash: FAULT");
            return Err(FlashError);
        }

        self.operations.push(Operation::Erase {
            offset: from,
            len: (to - from) as usize,
        });

        for addr in from..to {
            self.buf[addr as usize] = 0xff;
        }
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        assert!(offset.is_multiple_of(Self::WRITE_SIZE as _));
        assert!(bytes.len().is_multiple_of(Self::WRITE_SIZE as _));
        assert!(!bytes.is_empty());
        // a page program must not wrap around the page
        assert!(offset as usize % FLASH_PAGE_SIZE + bytes.len() <= FLASH_PAGE_SIZE);

        println!(
            "    flash: write: 0x{offset:04X}[0x{:04X}] #{:>2}",
            bytes.len(),
            self.operations.len()
        );

        if self.operations.len() >= self.fail_after_operation {
            println!("    flash: FAULT");
            return Err(FlashError);
        }

        let torn = self.torn_write == Some(self.operations.len());
        self.operations.push(Operation::Write {
            offset,
            len: bytes.len(),
        });

        let programmed = if torn { bytes.len() / 2 } else { bytes.len() };
        let offset = offset as usize;
        for (i, &val) in bytes[..programmed].iter().enumerate() {
            // NOR flash can only flip bits from 1 to 0
            self.buf[offset + i] &= val;
        }

        if torn {
            println!("    flash: TORN");
            return Err(FlashError);
        }
        Ok(())
    }
}

impl epd_flash::platform::Crc for Flash {
    fn crc32(data: &[u8]) -> u32 {
        unsafe { libz_sys::crc32(0, data.as_ptr(), data.len() as u32) as u32 }
    }
}

/// Collects everything the receiver transmits.
#[derive(Default)]
pub struct Uart {
    pub sent: Vec<u8>,
}

impl Uart {
    /// Takes the bytes sent since the last call
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.sent)
    }
}

impl embedded_io::ErrorType for Uart {
    type Error = Infallible;
}

impl embedded_io::Write for Uart {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.sent.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}
