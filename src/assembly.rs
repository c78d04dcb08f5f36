//! Rebuilds full color planes from the page records and the image header of a slot.

use crate::FlashStore;
use crate::error::Error;
use crate::image::{
    IMAGE_PAGES, ImageHeader, ImageId, LAST_PAGE_SIZE, PAGE_PAYLOAD_SIZE, PLANE_SIZE, Plane,
};
use crate::platform::Platform;
use crate::raw::MAX_PAYLOAD_SIZE;
#[cfg(feature = "defmt")]
use defmt::{debug, warn};

/// Loads one color plane into `out`, which has to hold at least `PLANE_SIZE` bytes.
///
/// Every page is checked against the header before it is copied: the high byte of its key has to
/// match the image tag, the low byte the sequence number, and its CRC32 has to be valid. The first
/// page that fails aborts the load, `out` may be partially written in that case.
///
/// If a garbage collection relocated the pages after the header was written, the addresses are
/// looked up in the store index instead.
pub fn load_plane<T: Platform>(
    store: &mut FlashStore<T>,
    image: ImageId,
    out: &mut [u8],
) -> Result<ImageHeader, Error> {
    if out.len() < PLANE_SIZE {
        return Err(Error::InvalidParam);
    }

    let mut raw = [0u8; MAX_PAYLOAD_SIZE];
    let size = store.read(image.header_id(), &mut raw)?;
    let header = ImageHeader::from_bytes(&raw[..size])?;

    let stale = header.generation != store.generation() as u16;

    #[cfg(feature = "defmt")]
    debug!(
        "load_plane: {} header {:#06x}, stale {}",
        image,
        image.header_id(),
        stale
    );

    #[cfg(feature = "debug-logs")]
    println!(
        "  assembly: load_plane {image:?} header 0x{:04x} stale {stale}",
        image.header_id()
    );

    for (index, entry) in header.entries.iter().enumerate() {
        let address = if stale {
            store
                .locate(image.data_id(entry.sequence as u16))
                .ok_or(Error::NotFound)?
        } else {
            entry.address
        };
        if address == 0 {
            return Err(Error::NotFound);
        }

        let page = store.read_page(address)?;
        let [tag, sequence] = page.data_id.to_be_bytes();
        if tag != image.tag()
            || sequence != entry.sequence
            || sequence as usize != index
            || page.data_size as usize != PAGE_PAYLOAD_SIZE
        {
            #[cfg(feature = "defmt")]
            warn!(
                "load_plane: page {} @{:#08x} has key {:#06x}",
                index, address, page.data_id
            );
            return Err(Error::InvalidParam);
        }
        if !page.is_valid::<T>() {
            #[cfg(feature = "defmt")]
            warn!("load_plane: page {} @{:#08x} crc mismatch", index, address);
            return Err(Error::CrcFail);
        }

        let len = if index == IMAGE_PAGES - 1 {
            LAST_PAGE_SIZE
        } else {
            PAGE_PAYLOAD_SIZE
        };
        let offset = index * PAGE_PAYLOAD_SIZE;
        out[offset..offset + len].copy_from_slice(&page.payload[..len]);
    }

    Ok(header)
}

/// Loads both planes of `slot`. The red plane is the one named as partner by the black/white header.
pub fn load_slot<T: Platform>(
    store: &mut FlashStore<T>,
    slot: u8,
    black_white: &mut [u8],
    red: &mut [u8],
) -> Result<(), Error> {
    let header = load_plane(store, ImageId::new(slot, Plane::BlackWhite)?, black_white)?;
    let partner = ImageId::from_header_id(header.partner_id).ok_or(Error::NotFound)?;
    load_plane(store, partner, red)?;
    Ok(())
}
