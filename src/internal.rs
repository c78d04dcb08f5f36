use crate::FlashStore;
use crate::error::Error;
use crate::platform::{AlignedOps, Platform};
use crate::raw::{
    DataPage, FLASH_PAGE_SIZE, FLASH_SECTOR_SIZE, HEADER_STATUS_OFFSET, PAGE_PAYLOAD_OFFSET,
    SEGMENT_HEADER_SIZE, SegmentHeader, SegmentStatus,
};
use alloc::vec::Vec;
#[cfg(feature = "defmt")]
use defmt::{debug, trace, warn};

const PAGE: u32 = FLASH_PAGE_SIZE as u32;

/// In-memory view of one of the two segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) struct Segment {
    pub(crate) id: u8,
    pub(crate) base: u32,
    pub(crate) gc_count: u32,
}

/// Maps a key to the address of its newest page. Entries keep the order in which keys were first
/// written, garbage collection copies in that order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) struct IndexEntry {
    pub(crate) data_id: u16,
    pub(crate) address: u32,
}

impl<T: Platform> FlashStore<T> {
    pub(crate) fn read_raw(&mut self, address: u32) -> Result<[u8; FLASH_PAGE_SIZE], Error> {
        let mut buf = [0u8; FLASH_PAGE_SIZE];
        self.hal
            .read(address, &mut buf)
            .map_err(|_| Error::ReadFail)?;
        Ok(buf)
    }

    pub(crate) fn write_raw(&mut self, address: u32, bytes: &[u8]) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("write_raw @{:#08x}: [{}]", address, bytes.len());

        self.hal.write(address, bytes).map_err(|_| Error::WriteFail)
    }

    pub(crate) fn read_header(&mut self, base: u32) -> Result<Option<SegmentHeader>, Error> {
        let len = T::align_read(SEGMENT_HEADER_SIZE).min(FLASH_PAGE_SIZE);
        let mut buf = [0u8; FLASH_PAGE_SIZE];
        self.hal
            .read(base, &mut buf[..len])
            .map_err(|_| Error::ReadFail)?;
        Ok(SegmentHeader::from_bytes::<T>(&buf[..len]))
    }

    fn write_header(&mut self, base: u32, header: SegmentHeader) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("write_header: @{:#08x} {}", base, header);

        #[cfg(feature = "debug-logs")]
        println!("  internal: write_header @{base:#08x} {header:?}");

        self.write_raw(base, &header.to_bytes::<T>())
    }

    /// Reprograms only the leading bytes of an existing header. The new status must only clear bits.
    fn write_status(&mut self, base: u32, header: SegmentHeader) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("write_status: @{:#08x} {}", base, header.status);

        let bytes = header.to_bytes::<T>();
        let len = T::align_write_ceil(HEADER_STATUS_OFFSET + 4).min(FLASH_PAGE_SIZE);
        self.write_raw(base, &bytes[..len])
    }

    /// Erases sector by sector in ascending order, so the header goes first.
    fn erase_segment(&mut self, base: u32) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("erase_segment: @{:#08x}", base);

        #[cfg(feature = "debug-logs")]
        println!("  internal: erase_segment @{base:#08x}");

        for sector in 0..self.layout.sectors_per_segment() {
            let from = base + sector * FLASH_SECTOR_SIZE as u32;
            self.hal
                .erase(from, from + FLASH_SECTOR_SIZE as u32)
                .map_err(|_| Error::EraseFail)?;
        }
        Ok(())
    }

    fn segment(&self, id: u8, header: Option<SegmentHeader>) -> Segment {
        Segment {
            id,
            base: self.layout.segment_base(id),
            gc_count: header.map_or(0, |h| h.gc_count),
        }
    }

    /// Address of the page following `address` or `None` once the active segment is exhausted.
    pub(crate) fn page_after(&self, address: u32) -> Option<u32> {
        let next = address + PAGE;
        (next < self.active.base + self.layout.segment_size()).then_some(next)
    }

    /// Where to continue after programming the page at `address` failed. An untouched page is
    /// used again. A partially programmed one gets its id and size zeroed so the scan neither
    /// stops at it nor accepts it as a record, then it is left behind.
    pub(crate) fn cursor_after_failed_program(&mut self, address: u32) -> Option<u32> {
        let Ok(raw) = self.read_raw(address) else {
            return Some(address);
        };
        if raw.iter().all(|&b| b == 0xFF) {
            return Some(address);
        }

        #[cfg(feature = "defmt")]
        warn!("write: burning partially programmed page @{:#08x}", address);

        let len = T::align_write_ceil(PAGE_PAYLOAD_OFFSET).min(FLASH_PAGE_SIZE);
        match self.write_raw(address, &[0u8; FLASH_PAGE_SIZE][..len]) {
            Ok(()) => self.page_after(address),
            Err(_) => Some(address),
        }
    }

    pub(crate) fn upsert(&mut self, data_id: u16, address: u32) {
        match self.index.iter_mut().find(|entry| entry.data_id == data_id) {
            Some(entry) => entry.address = address,
            None => self.index.push(IndexEntry { data_id, address }),
        }
    }

    /// Decides which segment is active from the two headers and rebuilds the index.
    pub(crate) fn load_segments(&mut self) -> Result<(), Error> {
        use SegmentStatus::{Active, Backup, GcInProgress};

        let header0 = self.read_header(self.layout.segment_base(0))?;
        let header1 = self.read_header(self.layout.segment_base(1))?;
        let status0 = header0.map(|h| h.status);
        let status1 = header1.map(|h| h.status);

        #[cfg(feature = "defmt")]
        debug!("load_segments: {} {}", header0, header1);

        #[cfg(feature = "debug-logs")]
        println!("  internal: load_segments: {header0:?} {header1:?}");

        let active_id = match (status0, status1) {
            (Some(GcInProgress), _) => {
                self.gc_in_progress = true;
                1
            }
            (_, Some(GcInProgress)) => {
                self.gc_in_progress = true;
                0
            }
            (Some(Active), Some(Backup)) => 0,
            (Some(Backup), Some(Active)) => 1,
            (Some(Active), Some(Active)) => {
                let count0 = header0.map_or(0, |h| h.gc_count);
                let count1 = header1.map_or(0, |h| h.gc_count);
                if count1 > count0 { 1 } else { 0 }
            }
            (Some(Active), _) => {
                self.reformat_backup(1, header0)?;
                0
            }
            (_, Some(Active)) => {
                self.reformat_backup(0, header1)?;
                1
            }
            _ => return self.format(),
        };

        let (active_header, backup_header) = if active_id == 0 {
            (header0, header1)
        } else {
            (header1, header0)
        };
        self.active = self.segment(active_id, active_header);
        self.backup = self.segment(1 - active_id, backup_header);
        if !self.gc_in_progress && backup_header.map(|h| h.status) != Some(Backup) {
            // freshly reformatted, carries the counter of the active segment
            self.backup.gc_count = self.active.gc_count;
        }

        #[cfg(feature = "defmt")]
        if self.gc_in_progress {
            warn!("load_segments: interrupted gc, segment {} active", active_id);
        }

        self.scan()
    }

    /// Fresh partition: segment 0 active, segment 1 backup, both empty.
    fn format(&mut self) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        debug!("format: no valid segment found");

        #[cfg(feature = "debug-logs")]
        println!("  internal: format");

        let base0 = self.layout.segment_base(0);
        let base1 = self.layout.segment_base(1);
        self.erase_segment(base0)?;
        self.erase_segment(base1)?;

        let active = SegmentHeader {
            segment_id: 0,
            status: SegmentStatus::Active,
            gc_count: 0,
        };
        self.write_header(base0, active)?;
        self.write_header(
            base1,
            SegmentHeader {
                segment_id: 1,
                status: SegmentStatus::Backup,
                gc_count: 0,
            },
        )?;

        if self.read_header(base0)? != Some(active) {
            return Err(Error::InitFail);
        }

        self.active = self.segment(0, Some(active));
        self.backup = self.segment(1, None);
        self.index.clear();
        self.next_write = Some(base0 + PAGE);
        Ok(())
    }

    /// The segment next to an active one is neither backup nor gc target: start it over as backup.
    fn reformat_backup(&mut self, id: u8, active: Option<SegmentHeader>) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        warn!("reformat_backup: segment {}", id);

        let base = self.layout.segment_base(id);
        self.erase_segment(base)?;
        self.write_header(
            base,
            SegmentHeader {
                segment_id: id,
                status: SegmentStatus::Backup,
                gc_count: active.map_or(0, |h| h.gc_count),
            },
        )
    }

    /// Rebuilds the index from the active segment. Pages are scanned up to the first empty one,
    /// corrupt pages are skipped and the last valid page of a key wins.
    pub(crate) fn scan(&mut self) -> Result<(), Error> {
        self.index.clear();
        self.next_write = None;

        #[cfg(any(feature = "defmt", feature = "debug-logs"))]
        let mut skipped = 0u32;

        for page in 1..self.layout.pages_per_segment() {
            let address = self.active.base + page * PAGE;
            let raw = DataPage::from_bytes(&self.read_raw(address)?);

            if raw.is_empty() {
                self.next_write = Some(address);
                break;
            }

            if !raw.is_valid::<T>() {
                #[cfg(feature = "defmt")]
                warn!("scan: skipping corrupt page @{:#08x}", address);

                #[cfg(any(feature = "defmt", feature = "debug-logs"))]
                {
                    skipped += 1;
                }
                continue;
            }

            self.upsert(raw.data_id, address);
        }

        #[cfg(feature = "defmt")]
        debug!(
            "scan: segment {}: {} keys, {} corrupt, next write {}",
            self.active.id,
            self.index.len(),
            skipped,
            self.next_write
        );

        #[cfg(feature = "debug-logs")]
        println!(
            "  internal: scan: segment {} keys {} corrupt {skipped} next_write {:?}",
            self.active.id,
            self.index.len(),
            self.next_write
        );

        Ok(())
    }

    /// Copies every live record into the backup segment and swaps the roles of both segments.
    ///
    /// A failure while copying leaves the active segment untouched and lowers `gc_in_progress`
    /// again. Once the old segment is being erased the destination holds the only complete copy,
    /// a failure from there on keeps `gc_in_progress` raised until `recover_gc()` rolls forward.
    pub(crate) fn collect(&mut self) -> Result<(), Error> {
        let source = self.active;
        let target = self.backup;
        let gc_count = source.gc_count.max(target.gc_count).wrapping_add(1);

        #[cfg(feature = "defmt")]
        debug!(
            "gc: segment {} -> {}, {} live keys, gc_count {}",
            source.id,
            target.id,
            self.index.len(),
            gc_count
        );

        #[cfg(feature = "debug-logs")]
        println!(
            "  internal: gc: segment {} -> {} keys {} gc_count {gc_count}",
            source.id,
            target.id,
            self.index.len()
        );

        self.gc_in_progress = true;
        let relocated = match self.copy_live(target, gc_count) {
            Ok(relocated) => relocated,
            Err(e) => {
                #[cfg(feature = "defmt")]
                warn!("gc: aborted while copying: {}", e);

                self.gc_in_progress = false;
                return Err(e);
            }
        };

        if let Err(e) = self.swap(source, target, gc_count) {
            #[cfg(feature = "defmt")]
            warn!("gc: interrupted after copying: {}", e);

            #[cfg(feature = "debug-logs")]
            println!("  internal: gc: interrupted after copying: {e:?}");

            return Err(e);
        }

        self.active = Segment { gc_count, ..target };
        self.backup = source;
        self.next_write = self.page_after(target.base + relocated.len() as u32 * PAGE);
        for (entry, address) in self.index.iter_mut().zip(relocated) {
            entry.address = address;
        }
        self.gc_in_progress = false;

        #[cfg(feature = "defmt")]
        debug!(
            "gc: done, segment {} active, next write {}",
            self.active.id, self.next_write
        );

        Ok(())
    }

    /// Checkpoint 1: erases `target`, marks it as gc destination and copies the live pages in
    /// index order. Returns their new addresses.
    fn copy_live(&mut self, target: Segment, gc_count: u32) -> Result<Vec<u32>, Error> {
        self.erase_segment(target.base)?;
        self.write_header(
            target.base,
            SegmentHeader {
                segment_id: target.id,
                status: SegmentStatus::GcInProgress,
                gc_count,
            },
        )?;

        let mut relocated = Vec::with_capacity(self.index.len());
        let mut destination = target.base + PAGE;
        for i in 0..self.index.len() {
            let entry = self.index[i];
            let raw = self.read_raw(entry.address)?;
            self.write_raw(destination, &raw)?;
            relocated.push(destination);
            destination += PAGE;
        }

        #[cfg(feature = "defmt")]
        trace!("gc: copied {} pages", relocated.len());

        Ok(relocated)
    }

    /// Checkpoints 2 and 3: the old segment becomes an empty backup and the destination active.
    fn swap(&mut self, source: Segment, target: Segment, gc_count: u32) -> Result<(), Error> {
        self.erase_segment(source.base)?;
        self.write_header(
            source.base,
            SegmentHeader {
                segment_id: source.id,
                status: SegmentStatus::Backup,
                gc_count: source.gc_count,
            },
        )?;

        let header = self.activate(target.base)?;
        if header.gc_count != gc_count || header.segment_id != target.id {
            return Err(Error::WriteFail);
        }
        Ok(())
    }

    /// Flips a gc destination to active in place and verifies the result. A destination that
    /// already reads as active was flipped before the verification failed.
    fn activate(&mut self, base: u32) -> Result<SegmentHeader, Error> {
        let header = match self.read_header(base)? {
            Some(header) if header.status == SegmentStatus::GcInProgress => header,
            Some(header) if header.status == SegmentStatus::Active => return Ok(header),
            _ => return Err(Error::WriteFail),
        };

        let active = SegmentHeader {
            status: SegmentStatus::Active,
            ..header
        };
        self.write_status(base, active)?;

        if self.read_header(base)? != Some(active) {
            return Err(Error::WriteFail);
        }
        Ok(active)
    }

    /// Finishes or reverts a garbage collection that was cut short by a reset.
    ///
    /// The old active segment is erased header first and only after every live page was copied.
    /// If its header still reads as active, the copy never completed and the gc destination is
    /// dropped. Otherwise the copy is complete and the destination becomes the active segment.
    pub(crate) fn repair_gc(&mut self) -> Result<(), Error> {
        let stale = self.active;
        let destination = self.backup;
        let stale_header = self.read_header(stale.base)?;

        match stale_header.map(|h| h.status) {
            Some(SegmentStatus::Active) => {
                #[cfg(feature = "defmt")]
                debug!("repair_gc: rolling back into segment {}", stale.id);

                #[cfg(feature = "debug-logs")]
                println!("  internal: repair_gc: roll back to segment {}", stale.id);

                self.erase_segment(destination.base)?;
                self.write_header(
                    destination.base,
                    SegmentHeader {
                        segment_id: destination.id,
                        status: SegmentStatus::Backup,
                        gc_count: stale.gc_count,
                    },
                )?;
                self.backup.gc_count = stale.gc_count;
            }
            status => {
                #[cfg(feature = "defmt")]
                debug!("repair_gc: rolling forward into segment {}", destination.id);

                #[cfg(feature = "debug-logs")]
                println!(
                    "  internal: repair_gc: roll forward to segment {}",
                    destination.id
                );

                let header = self.activate(destination.base)?;
                let stale_count = match (status, stale_header) {
                    (Some(SegmentStatus::Backup), Some(h)) => h.gc_count,
                    _ => {
                        let count = header.gc_count.wrapping_sub(1);
                        self.erase_segment(stale.base)?;
                        self.write_header(
                            stale.base,
                            SegmentHeader {
                                segment_id: stale.id,
                                status: SegmentStatus::Backup,
                                gc_count: count,
                            },
                        )?;
                        count
                    }
                };

                self.active = Segment {
                    gc_count: header.gc_count,
                    ..destination
                };
                self.backup = Segment {
                    gc_count: stale_count,
                    ..stale
                };
                self.scan()?;
            }
        }

        self.gc_in_progress = false;
        Ok(())
    }
}
