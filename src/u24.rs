use core::fmt::{Debug, Formatter};

/// 24-bit flash address, packed big endian.
#[derive(Copy, Clone, PartialEq, Ord, PartialOrd, Eq)]
#[allow(non_camel_case_types)]
#[repr(transparent)]
pub struct u24([u8; 3]);

impl Debug for u24 {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.write_fmt(format_args!("0x{:0>6x}", self.to_u32()))
    }
}

impl u24 {
    pub fn to_u32(self) -> u32 {
        let u24([a, b, c]) = self;
        u32::from_be_bytes([0, a, b, c])
    }

    /// `None` if `num` does not fit into 24 bits
    pub fn from_u32(num: u32) -> Option<Self> {
        let [high, a, b, c] = num.to_be_bytes();
        (high == 0).then_some(u24([a, b, c]))
    }

    pub fn to_be_bytes(self) -> [u8; 3] {
        self.0
    }

    pub fn from_be_bytes(bytes: [u8; 3]) -> Self {
        u24(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn big_endian_packing() {
        let address = u24::from_u32(0x05_1200).unwrap();
        assert_eq!(address.to_be_bytes(), [0x05, 0x12, 0x00]);
        assert_eq!(u24::from_be_bytes([0x05, 0x12, 0x00]).to_u32(), 0x05_1200);
        assert_eq!(u24::from_u32(0xFF_FFFF).map(u24::to_u32), Some(0xFF_FFFF));
        assert_eq!(u24::from_u32(0x0100_0000), None);
        assert_eq!(format!("{:?}", address), "0x051200");
    }
}
