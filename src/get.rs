//! The `Get<T>` trait and its implementation in this module allows providing a single generic,
//! overloaded function `get<T>()` for all supported record types.

use crate::FlashStore;
use crate::error::Error;
use crate::platform::Platform;
use crate::raw::MAX_PAYLOAD_SIZE;
use alloc::vec::Vec;

pub trait Get<T> {
    fn get(&mut self, data_id: u16) -> Result<T, Error>;
}

impl<T, G: Get<T>> Get<T> for &mut G {
    fn get(&mut self, data_id: u16) -> Result<T, Error> {
        (*self).get(data_id)
    }
}

impl<T: Platform> FlashStore<T> {
    /// Reads a record that has to be exactly `N` bytes long.
    fn get_exact<const N: usize>(&mut self, data_id: u16) -> Result<[u8; N], Error> {
        let mut buf = [0u8; N];
        match self.read(data_id, &mut buf) {
            Ok(size) if size == N => Ok(buf),
            Ok(_) | Err(Error::BufferTooSmall { .. }) => Err(Error::InvalidParam),
            Err(e) => Err(e),
        }
    }
}

impl<T: Platform> Get<bool> for FlashStore<T> {
    fn get(&mut self, data_id: u16) -> Result<bool, Error> {
        let [value] = self.get_exact::<1>(data_id)?;
        Ok(value != 0)
    }
}

impl<T: Platform> Get<u8> for FlashStore<T> {
    fn get(&mut self, data_id: u16) -> Result<u8, Error> {
        let [value] = self.get_exact::<1>(data_id)?;
        Ok(value)
    }
}

impl<T: Platform> Get<u16> for FlashStore<T> {
    fn get(&mut self, data_id: u16) -> Result<u16, Error> {
        Ok(u16::from_le_bytes(self.get_exact(data_id)?))
    }
}

impl<T: Platform> Get<u32> for FlashStore<T> {
    fn get(&mut self, data_id: u16) -> Result<u32, Error> {
        Ok(u32::from_le_bytes(self.get_exact(data_id)?))
    }
}

impl<T: Platform> Get<Vec<u8>> for FlashStore<T> {
    fn get(&mut self, data_id: u16) -> Result<Vec<u8>, Error> {
        let mut buf = [0u8; MAX_PAYLOAD_SIZE];
        let size = self.read(data_id, &mut buf)?;
        Ok(buf[..size].to_vec())
    }
}
