#![doc = include_str!("../README.md")]
#![cfg_attr(not(target_arch = "x86_64"), no_std)]

pub mod assembly;
pub mod error;
mod get;
pub mod image;
mod internal;
pub mod layout;
pub mod platform;
pub mod protocol;
pub mod raw;
pub mod receiver;
mod set;
mod u24;

pub use get::Get;
pub use layout::Layout;
pub use set::Set;

extern crate alloc;

use crate::error::Error;
use crate::internal::{IndexEntry, Segment};
use crate::platform::Platform;
use crate::raw::{DataPage, FLASH_PAGE_SIZE, FLASH_SECTOR_SIZE, INVALID_DATA_ID, MAX_PAYLOAD_SIZE};
use alloc::vec::Vec;

/// Page accounting of the active segment, the header page is not counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StoreStatus {
    pub total_pages: u32,
    /// Pages between the header and the write cursor, including superseded ones
    pub used_pages: u32,
    pub free_pages: u32,
    /// Number of live keys
    pub data_count: u32,
    /// Used pages that are not referenced by a live key and would be freed by a garbage collection
    pub reclaimable_pages: u32,
}

/// Log structured key value store over two flash segments. Every record occupies one page,
/// rewriting a key appends a new page and the newest page wins. Space of superseded and deleted
/// records is only reclaimed by a garbage collection which copies the live records into the other
/// segment.
///
/// Keeps an index entry per live key in memory.
pub struct FlashStore<T: Platform> {
    pub(crate) hal: T,
    pub(crate) layout: Layout,
    pub(crate) active: Segment,
    pub(crate) backup: Segment,
    /// `None` once the active segment is full
    pub(crate) next_write: Option<u32>,
    pub(crate) index: Vec<IndexEntry>,
    pub(crate) gc_in_progress: bool,
}

impl<T: Platform> FlashStore<T> {
    /// Reads both segment headers and decides which one is active:
    ///  * one active and one backup segment: the active one is scanned
    ///  * one segment marked as gc destination: the other one is scanned and `gc_in_progress()`
    ///    reports `true` until `recover_gc()` was called
    ///  * one active segment next to an unrecognized one: the latter is reformatted as backup
    ///  * no usable header: both segments are erased and formatted
    ///
    /// Pages with invalid CRC32 values are skipped while rebuilding the index.
    pub fn new(layout: Layout, hal: T) -> Result<FlashStore<T>, Error> {
        if layout.end() as usize > hal.capacity()
            || !FLASH_SECTOR_SIZE.is_multiple_of(T::ERASE_SIZE)
            || !FLASH_PAGE_SIZE.is_multiple_of(T::WRITE_SIZE)
        {
            return Err(Error::InvalidLayout);
        }

        let placeholder = Segment {
            id: 0,
            base: layout.segment_base(0),
            gc_count: 0,
        };
        let mut store = Self {
            hal,
            layout,
            active: placeholder,
            backup: Segment {
                id: 1,
                base: layout.segment_base(1),
                ..placeholder
            },
            next_write: None,
            index: Vec::new(),
            gc_in_progress: false,
        };

        store.load_segments()?;
        Ok(store)
    }

    /// Appends a record for `data_id`. Runs a garbage collection first if the active segment is full.
    ///
    /// `data` has to be 1 to `MAX_PAYLOAD_SIZE` bytes long and `data_id` must not be `INVALID_DATA_ID`.
    pub fn write(&mut self, data_id: u16, data: &[u8]) -> Result<(), Error> {
        if data_id == INVALID_DATA_ID || data.is_empty() || data.len() > MAX_PAYLOAD_SIZE {
            return Err(Error::InvalidParam);
        }
        if self.gc_in_progress {
            return Err(Error::GcInterrupted);
        }

        let address = match self.next_write {
            Some(address) => address,
            None => {
                self.collect()?;
                self.next_write.ok_or(Error::NoSpace)?
            }
        };

        #[cfg(feature = "debug-logs")]
        println!("  store: write 0x{data_id:04x} [{}] @{address:#08x}", data.len());

        let page = DataPage::new::<T>(data_id, data);
        if let Err(e) = self.write_raw(address, &page.to_bytes()) {
            self.next_write = self.cursor_after_failed_program(address);
            return Err(e);
        }
        self.next_write = self.page_after(address);
        self.upsert(data_id, address);
        Ok(())
    }

    /// Copies the payload of `data_id` into `buf` and returns its length.
    ///
    /// If `buf` is too small nothing is copied and `Error::BufferTooSmall` reports the required size.
    pub fn read(&mut self, data_id: u16, buf: &mut [u8]) -> Result<usize, Error> {
        let address = self.locate(data_id).ok_or(Error::NotFound)?;
        let page = DataPage::from_bytes(&self.read_raw(address)?);

        if page.data_id != data_id || !page.is_valid::<T>() {
            return Err(Error::CrcFail);
        }

        let size = page.data_size as usize;
        if buf.len() < size {
            return Err(Error::BufferTooSmall { required: size });
        }
        buf[..size].copy_from_slice(page.payload());
        Ok(size)
    }

    /// Removes `data_id` from the index. The page stays on flash until the next garbage collection.
    pub fn delete(&mut self, data_id: u16) -> Result<(), Error> {
        let position = self
            .index
            .iter()
            .position(|entry| entry.data_id == data_id)
            .ok_or(Error::NotFound)?;
        self.index.remove(position);
        Ok(())
    }

    /// Address of the page currently holding `data_id`
    pub fn locate(&self, data_id: u16) -> Option<u32> {
        self.index
            .iter()
            .find(|entry| entry.data_id == data_id)
            .map(|entry| entry.address)
    }

    pub fn contains(&self, data_id: u16) -> bool {
        self.locate(data_id).is_some()
    }

    /// Live keys in index order
    pub fn keys(&self) -> impl Iterator<Item = u16> + '_ {
        self.index.iter().map(|entry| entry.data_id)
    }

    /// Reads the raw page at `address` without validating it. The address has to point to a data
    /// page of the active segment.
    pub fn read_page(&mut self, address: u32) -> Result<DataPage, Error> {
        let base = self.active.base;
        let end = base + self.layout.segment_size();
        if address < base + FLASH_PAGE_SIZE as u32
            || address >= end
            || !(address - base).is_multiple_of(FLASH_PAGE_SIZE as u32)
        {
            return Err(Error::InvalidParam);
        }
        Ok(DataPage::from_bytes(&self.read_raw(address)?))
    }

    /// Forces a garbage collection. Blocks until the old segment is erased.
    pub fn garbage_collect(&mut self) -> Result<(), Error> {
        if self.gc_in_progress {
            return Err(Error::GcInterrupted);
        }
        self.collect()
    }

    /// Completes or reverts a garbage collection that was interrupted by a reset. Does nothing
    /// if none is pending.
    pub fn recover_gc(&mut self) -> Result<(), Error> {
        if !self.gc_in_progress {
            return Ok(());
        }
        self.repair_gc()
    }

    /// `true` if an interrupted garbage collection was found while loading the segments
    pub fn gc_in_progress(&self) -> bool {
        self.gc_in_progress
    }

    /// Garbage collection counter of the active segment. Changes whenever records are relocated.
    pub fn generation(&self) -> u32 {
        self.active.gc_count
    }

    pub fn active_segment(&self) -> u8 {
        self.active.id
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Direct access to the flash, bypassing the index. Anything written this way is only seen
    /// by the store after the next load.
    pub fn platform_mut(&mut self) -> &mut T {
        &mut self.hal
    }

    pub fn status(&self) -> StoreStatus {
        let total_pages = self.layout.data_pages();
        let used_pages = match self.next_write {
            Some(address) => (address - self.active.base) / FLASH_PAGE_SIZE as u32 - 1,
            None => total_pages,
        };
        let data_count = self.index.len() as u32;

        StoreStatus {
            total_pages,
            used_pages,
            free_pages: total_pages - used_pages,
            data_count,
            reclaimable_pages: used_pages.saturating_sub(data_count),
        }
    }

    /// Reads a typed value.
    ///
    /// Supported types are bool, u8, u16, u32 and `Vec<u8>`.
    pub fn get<R>(&mut self, data_id: u16) -> Result<R, Error>
    where
        FlashStore<T>: Get<R>,
    {
        Get::get(self, data_id)
    }

    /// Writes a typed value.
    ///
    /// Integers are stored little endian with their natural width, bool as a single byte.
    pub fn set<R>(&mut self, data_id: u16, value: R) -> Result<(), Error>
    where
        FlashStore<T>: Set<R>,
    {
        Set::set(self, data_id, value)
    }
}
