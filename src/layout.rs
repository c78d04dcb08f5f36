use crate::error::Error;
use crate::raw::{FLASH_PAGE_SIZE, FLASH_SECTOR_SIZE};

/// Placement of the two equally sized segments in the linear flash address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Layout {
    segment0_base: u32,
    segment1_base: u32,
    segment_size: u32,
}

impl Layout {
    /// Two 256 KiB segments behind the first 64 KiB of a 4 MiB W25Q32.
    pub const W25Q32: Layout = Layout {
        segment0_base: 0x01_0000,
        segment1_base: 0x05_0000,
        segment_size: 0x04_0000,
    };

    /// Both bases and the size have to be multiples of the sector size (4k). Address 0 is
    /// never part of a segment since it is never erased.
    pub fn new(segment0_base: u32, segment1_base: u32, segment_size: u32) -> Result<Self, Error> {
        let sector = FLASH_SECTOR_SIZE as u32;
        if segment_size == 0
            || !segment_size.is_multiple_of(sector)
            || !segment0_base.is_multiple_of(sector)
            || !segment1_base.is_multiple_of(sector)
            || segment0_base == 0
            || segment1_base == 0
        {
            return Err(Error::InvalidLayout);
        }

        let end0 = segment0_base
            .checked_add(segment_size)
            .ok_or(Error::InvalidLayout)?;
        let end1 = segment1_base
            .checked_add(segment_size)
            .ok_or(Error::InvalidLayout)?;
        if segment0_base < end1 && segment1_base < end0 {
            return Err(Error::InvalidLayout);
        }

        Ok(Self {
            segment0_base,
            segment1_base,
            segment_size,
        })
    }

    pub fn segment_base(&self, segment_id: u8) -> u32 {
        if segment_id == 0 {
            self.segment0_base
        } else {
            self.segment1_base
        }
    }

    pub fn segment_size(&self) -> u32 {
        self.segment_size
    }

    /// Pages per segment including the header page
    pub fn pages_per_segment(&self) -> u32 {
        self.segment_size / FLASH_PAGE_SIZE as u32
    }

    /// Pages per segment available for records
    pub fn data_pages(&self) -> u32 {
        self.pages_per_segment() - 1
    }

    pub(crate) fn sectors_per_segment(&self) -> u32 {
        self.segment_size / FLASH_SECTOR_SIZE as u32
    }

    /// Highest address covered by either segment, exclusive
    pub(crate) fn end(&self) -> u32 {
        self.segment0_base.max(self.segment1_base) + self.segment_size
    }
}

impl Default for Layout {
    fn default() -> Self {
        Self::W25Q32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_w25q32() {
        let layout = Layout::default();
        assert_eq!(layout.segment_base(0), 0x01_0000);
        assert_eq!(layout.segment_base(1), 0x05_0000);
        assert_eq!(layout.pages_per_segment(), 1024);
        assert_eq!(layout.data_pages(), 1023);
        assert_eq!(layout.sectors_per_segment(), 64);
        assert_eq!(
            Layout::new(0x01_0000, 0x05_0000, 0x04_0000),
            Ok(Layout::W25Q32)
        );
    }

    #[test]
    fn rejects_bad_layouts() {
        assert_eq!(Layout::new(0, 0x2000, 0x1000), Err(Error::InvalidLayout));
        assert_eq!(Layout::new(0x1000, 0x2000, 0x2000), Err(Error::InvalidLayout));
        assert_eq!(Layout::new(0x1100, 0x3000, 0x1000), Err(Error::InvalidLayout));
        assert_eq!(Layout::new(0x1000, 0x3000, 0x1800), Err(Error::InvalidLayout));
        assert_eq!(Layout::new(0x1000, 0x3000, 0), Err(Error::InvalidLayout));
        assert_eq!(
            Layout::new(0xFFFF_F000, 0x1000, 0x2000),
            Err(Error::InvalidLayout)
        );
        assert!(Layout::new(0x3000, 0x1000, 0x2000).is_ok());
    }
}
