use embedded_storage::nor_flash::NorFlash;

/// Everything the store needs from the board: a NOR flash that only clears bits on write and
/// reads back 0xFF after an erase, plus a CRC32 engine.
///
/// The busy-wait for the flash to become ready after a program or erase belongs inside the
/// `NorFlash` implementation.
pub trait Platform: Crc + NorFlash {}

impl<T: Crc + NorFlash> Platform for T {}

const CRC32: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

/// Standard IEEE CRC32 (reflected polynomial 0xEDB88320, initial value 0xFFFFFFFF, final
/// complement). Override it if the MCU has a hardware CRC unit.
pub trait Crc {
    fn crc32(data: &[u8]) -> u32 {
        CRC32.checksum(data)
    }
}

impl<T: Crc> Crc for &mut T {
    fn crc32(data: &[u8]) -> u32 {
        T::crc32(data)
    }
}

pub trait AlignedOps: Platform {
    fn align_read(size: usize) -> usize {
        align_ceil(size, Self::READ_SIZE)
    }

    fn align_write_ceil(size: usize) -> usize {
        align_ceil(size, Self::WRITE_SIZE)
    }
}

#[inline(always)]
const fn align_ceil(size: usize, alignment: usize) -> usize {
    if alignment.is_power_of_two() {
        size.saturating_add(alignment - 1) & !(alignment - 1)
    } else {
        size.saturating_add(alignment - 1) / alignment * alignment
    }
}

impl<T: Platform> AlignedOps for T {}

#[cfg(test)]
mod tests {
    use super::*;

    struct Software;
    impl Crc for Software {}

    #[test]
    fn crc32_check_value() {
        assert_eq!(Software::crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(Software::crc32(&[]), 0);
    }

    #[test]
    fn alignment() {
        assert_eq!(align_ceil(14, 4), 16);
        assert_eq!(align_ceil(16, 4), 16);
        assert_eq!(align_ceil(6, 1), 6);
        assert_eq!(align_ceil(7, 3), 9);
    }
}
