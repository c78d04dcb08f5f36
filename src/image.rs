//! Geometry of the 400x300 panel and the record conventions used to keep images in the store.
//!
//! One color plane is split into `IMAGE_PAGES` records of `PAGE_PAYLOAD_SIZE` bytes. The record
//! of page `n` is keyed `(tag << 8) | n` where the tag encodes slot and plane. Each plane has an
//! image header record listing the addresses of its pages and naming the header of the other plane.

use crate::FlashStore;
use crate::error::Error;
use crate::platform::Platform;
use crate::raw::MAX_PAYLOAD_SIZE;
use crate::u24::u24;
#[cfg(feature = "defmt")]
use defmt::{debug, trace};

pub const IMAGE_WIDTH: usize = 400;
pub const IMAGE_HEIGHT: usize = 300;
/// Bytes of one 1-bit color plane
pub const PLANE_SIZE: usize = IMAGE_WIDTH * IMAGE_HEIGHT / 8;
pub const PAGE_PAYLOAD_SIZE: usize = MAX_PAYLOAD_SIZE;
pub const IMAGE_PAGES: usize = PLANE_SIZE.div_ceil(PAGE_PAYLOAD_SIZE);
/// Meaningful bytes in the final page, the rest is padding
pub const LAST_PAGE_SIZE: usize = PLANE_SIZE - (IMAGE_PAGES - 1) * PAGE_PAYLOAD_SIZE;
pub const MAX_FRAME_NUM: u16 = IMAGE_PAGES as u16 - 1;
pub const SLOT_COUNT: u8 = 8;

/// Header records live at `HEADER_ID_BASE + 2 * slot + plane`
pub const HEADER_ID_BASE: u16 = 0x1000;
/// 1 byte record holding the slot shown on the panel
pub const SELECTED_SLOT_ID: u16 = 0x7000;

const PLANE_RED_BIT: u8 = 0x80;
const SLOT_MASK: u8 = 0x7F;
const HEADER_ENTRY_SIZE: usize = 4;
const PARTNER_OFFSET: usize = IMAGE_PAGES * HEADER_ENTRY_SIZE;
const GENERATION_OFFSET: usize = PARTNER_OFFSET + 2;

const _: () = assert!(IMAGE_PAGES == 61 && LAST_PAGE_SIZE == 120);
const _: () = assert!(
    GENERATION_OFFSET + 2 == MAX_PAYLOAD_SIZE,
    "Image header must fill exactly one record"
);

#[derive(strum::FromRepr, strum::Display, Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Plane {
    BlackWhite = 0,
    Red = 1,
}

impl Plane {
    pub fn other(self) -> Plane {
        match self {
            Plane::BlackWhite => Plane::Red,
            Plane::Red => Plane::BlackWhite,
        }
    }
}

/// Slot and color plane of one stored image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ImageId {
    slot: u8,
    plane: Plane,
}

impl ImageId {
    pub fn new(slot: u8, plane: Plane) -> Result<Self, Error> {
        if slot >= SLOT_COUNT {
            return Err(Error::InvalidParam);
        }
        Ok(Self { slot, plane })
    }

    /// Decodes the slot byte of a data frame: bits 0..6 select the slot, bit 7 the red plane.
    pub fn from_tag(tag: u8) -> Option<Self> {
        let plane = if tag & PLANE_RED_BIT != 0 {
            Plane::Red
        } else {
            Plane::BlackWhite
        };
        Self::new(tag & SLOT_MASK, plane).ok()
    }

    pub fn from_header_id(header_id: u16) -> Option<Self> {
        let offset = header_id.checked_sub(HEADER_ID_BASE)?;
        let slot = u8::try_from(offset / 2).ok()?;
        let plane = Plane::from_repr((offset % 2) as u8)?;
        Self::new(slot, plane).ok()
    }

    pub fn slot(self) -> u8 {
        self.slot
    }

    pub fn plane(self) -> Plane {
        self.plane
    }

    pub fn tag(self) -> u8 {
        match self.plane {
            Plane::BlackWhite => self.slot,
            Plane::Red => self.slot | PLANE_RED_BIT,
        }
    }

    /// Key of the record holding page `page`
    pub fn data_id(self, page: u16) -> u16 {
        (self.tag() as u16) << 8 | (page & 0xFF)
    }

    pub fn header_id(self) -> u16 {
        HEADER_ID_BASE + 2 * self.slot as u16 + self.plane as u16
    }

    /// The other color plane of the same slot
    pub fn partner(self) -> Self {
        Self {
            slot: self.slot,
            plane: self.plane.other(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HeaderEntry {
    /// Absolute flash address of the page
    pub address: u32,
    pub sequence: u8,
}

/// Persisted as a 248 byte record: `IMAGE_PAGES` entries of a big endian 24-bit address plus a
/// sequence byte, then the partner header id and the store generation the addresses were taken from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHeader {
    pub entries: [HeaderEntry; IMAGE_PAGES],
    pub partner_id: u16,
    /// Low 16 bits of `FlashStore::generation()` at the time the addresses were resolved
    pub generation: u16,
}

impl ImageHeader {
    /// Looks up the current address of every page of `image`.
    pub fn resolve<T: Platform>(store: &FlashStore<T>, image: ImageId) -> Result<Self, Error> {
        let mut entries = [HeaderEntry::default(); IMAGE_PAGES];
        for (page, entry) in entries.iter_mut().enumerate() {
            *entry = HeaderEntry {
                address: store
                    .locate(image.data_id(page as u16))
                    .ok_or(Error::NotFound)?,
                sequence: page as u8,
            };
        }

        Ok(Self {
            entries,
            partner_id: image.partner().header_id(),
            generation: store.generation() as u16,
        })
    }

    pub fn to_bytes(&self) -> Result<[u8; MAX_PAYLOAD_SIZE], Error> {
        let mut buf = [0u8; MAX_PAYLOAD_SIZE];
        for (chunk, entry) in buf
            .chunks_exact_mut(HEADER_ENTRY_SIZE)
            .zip(self.entries.iter())
        {
            let address = u24::from_u32(entry.address).ok_or(Error::InvalidParam)?;
            chunk[..3].copy_from_slice(&address.to_be_bytes());
            chunk[3] = entry.sequence;
        }
        buf[PARTNER_OFFSET..GENERATION_OFFSET].copy_from_slice(&self.partner_id.to_le_bytes());
        buf[GENERATION_OFFSET..].copy_from_slice(&self.generation.to_le_bytes());
        Ok(buf)
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() != MAX_PAYLOAD_SIZE {
            return Err(Error::InvalidParam);
        }

        let mut entries = [HeaderEntry::default(); IMAGE_PAGES];
        for (entry, chunk) in entries
            .iter_mut()
            .zip(buf[..PARTNER_OFFSET].chunks_exact(HEADER_ENTRY_SIZE))
        {
            *entry = HeaderEntry {
                address: u24::from_be_bytes([chunk[0], chunk[1], chunk[2]]).to_u32(),
                sequence: chunk[3],
            };
        }

        Ok(Self {
            entries,
            partner_id: u16::from_le_bytes([buf[PARTNER_OFFSET], buf[PARTNER_OFFSET + 1]]),
            generation: u16::from_le_bytes([buf[GENERATION_OFFSET], buf[GENERATION_OFFSET + 1]]),
        })
    }
}

/// Writes the image header of `image` once all of its pages are stored.
///
/// Writing the header may run a garbage collection which relocates the pages it just listed. In
/// that case the addresses are resolved and written once more. A header that is still outdated
/// afterwards is detected by its generation when the image is loaded.
pub fn write_image_header<T: Platform>(
    store: &mut FlashStore<T>,
    image: ImageId,
) -> Result<ImageHeader, Error> {
    let mut attempts = 0;
    loop {
        let header = ImageHeader::resolve(store, image)?;
        let generation = store.generation();
        store.write(image.header_id(), &header.to_bytes()?)?;
        attempts += 1;

        #[cfg(feature = "defmt")]
        trace!(
            "write_image_header: {:#06x} generation {}",
            image.header_id(),
            generation
        );

        if store.generation() == generation || attempts == 2 {
            return Ok(header);
        }
    }
}

/// Persists the slot shown on the panel.
pub fn store_selected_slot<T: Platform>(store: &mut FlashStore<T>, slot: u8) -> Result<(), Error> {
    if slot >= SLOT_COUNT {
        return Err(Error::InvalidParam);
    }

    #[cfg(feature = "defmt")]
    debug!("store_selected_slot: {}", slot);

    store.set(SELECTED_SLOT_ID, slot)
}

/// The slot shown on the panel before the last reset, `NotFound` if none was stored yet.
pub fn load_selected_slot<T: Platform>(store: &mut FlashStore<T>) -> Result<u8, Error> {
    let slot: u8 = store.get(SELECTED_SLOT_ID)?;
    if slot >= SLOT_COUNT {
        return Err(Error::InvalidParam);
    }
    Ok(slot)
}
