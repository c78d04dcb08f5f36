use crate::FlashStore;
use crate::error::Error;
use crate::platform::Platform;

pub trait Set<T> {
    fn set(&mut self, data_id: u16, value: T) -> Result<(), Error>;
}

impl<T, S: Set<T>> Set<T> for &mut S {
    fn set(&mut self, data_id: u16, value: T) -> Result<(), Error> {
        (*self).set(data_id, value)
    }
}

impl<T: Platform> Set<bool> for FlashStore<T> {
    fn set(&mut self, data_id: u16, value: bool) -> Result<(), Error> {
        self.write(data_id, &[value as u8])
    }
}

impl<T: Platform> Set<u8> for FlashStore<T> {
    fn set(&mut self, data_id: u16, value: u8) -> Result<(), Error> {
        self.write(data_id, &[value])
    }
}

impl<T: Platform> Set<u16> for FlashStore<T> {
    fn set(&mut self, data_id: u16, value: u16) -> Result<(), Error> {
        self.write(data_id, &value.to_le_bytes())
    }
}

impl<T: Platform> Set<u32> for FlashStore<T> {
    fn set(&mut self, data_id: u16, value: u32) -> Result<(), Error> {
        self.write(data_id, &value.to_le_bytes())
    }
}

impl<T: Platform> Set<&[u8]> for FlashStore<T> {
    fn set(&mut self, data_id: u16, value: &[u8]) -> Result<(), Error> {
        self.write(data_id, value)
    }
}
