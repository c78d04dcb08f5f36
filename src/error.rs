use thiserror::Error;

/// Errors returned by the record store and the image layers built on top of it. Transfer protocol
/// failures are never returned as values, they are answered on the wire instead.
#[derive(Error, Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// Key, payload size or address outside the accepted range
    #[error("invalid parameter")]
    InvalidParam,

    /// The caller's buffer cannot hold the stored payload. Nothing was copied.
    #[error("buffer too small, {required} bytes required")]
    BufferTooSmall { required: usize },

    /// Segment bases and size have to be sector aligned, non-overlapping and must not touch address 0
    #[error("invalid layout")]
    InvalidLayout,

    /// The underlying `NorFlash::read` failed
    #[error("flash read failed")]
    ReadFail,

    /// The underlying `NorFlash::write` failed or a header did not read back as written
    #[error("flash write failed")]
    WriteFail,

    /// The underlying `NorFlash::erase` failed
    #[error("flash erase failed")]
    EraseFail,

    /// A stored page or record did not match its CRC32
    #[error("crc mismatch")]
    CrcFail,

    /// Key not present in the index
    #[error("not found")]
    NotFound,

    /// Every data page of the active segment holds a live record, garbage collection can not help.
    #[error("no space left")]
    NoSpace,

    /// The segment headers could not be established
    #[error("initialization failed")]
    InitFail,

    /// A garbage collection was interrupted by a power loss. Writes are refused until
    /// `FlashStore::recover_gc` has repaired the segments.
    #[error("interrupted garbage collection pending")]
    GcInterrupted,
}
