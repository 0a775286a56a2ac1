//! The `Get<T>` trait and its implementations in this module allow a single generic, overloaded
//! function `get_as<T>()` for all supported types of the store.

use crate::error::Error;
use crate::platform::Platform;
use crate::{Key, Nvds};
use alloc::string::String;
use alloc::vec::Vec;
use embassy_sync::blocking_mutex::raw::RawMutex;

pub trait Get<T> {
    fn get(&self, namespace: Option<&Key>, key: &Key) -> Result<T, Error>;
}

impl<T, G: Get<T>> Get<T> for &G {
    fn get(&self, namespace: Option<&Key>, key: &Key) -> Result<T, Error> {
        (*self).get(namespace, key)
    }
}

/// Reads a value that has to be exactly `buf.len()` bytes long.
fn get_exact<T: Platform, M: RawMutex>(
    nvds: &Nvds<T, M>,
    namespace: Option<&Key>,
    key: &Key,
    buf: &mut [u8],
) -> Result<(), Error> {
    let mut value = [0u8; 8];
    let len = nvds.get(namespace, key, Some(&mut value[..]))?;
    if len != buf.len() {
        return Err(Error::InvalidLength(len as u32));
    }
    buf.copy_from_slice(&value[..len]);
    Ok(())
}

impl<T: Platform, M: RawMutex> Get<bool> for Nvds<T, M> {
    fn get(&self, namespace: Option<&Key>, key: &Key) -> Result<bool, Error> {
        let mut value = [0u8; 1];
        get_exact(self, namespace, key, &mut value)?;
        Ok(value[0] != 0)
    }
}

macro_rules! impl_get_integer {
    ($($ty:ty),+) => {$(
        impl<T: Platform, M: RawMutex> Get<$ty> for Nvds<T, M> {
            fn get(&self, namespace: Option<&Key>, key: &Key) -> Result<$ty, Error> {
                let mut value = [0u8; size_of::<$ty>()];
                get_exact(self, namespace, key, &mut value)?;
                Ok(<$ty>::from_le_bytes(value))
            }
        }
    )+};
}

impl_get_integer!(u8, u16, u32, u64, i8, i16, i32, i64);

impl<T: Platform, M: RawMutex> Get<String> for Nvds<T, M> {
    fn get(&self, namespace: Option<&Key>, key: &Key) -> Result<String, Error> {
        let value = self.get_vec(namespace, key)?;
        String::from_utf8(value).map_err(|_| Error::InvalidParam)
    }
}

impl<T: Platform, M: RawMutex> Get<Vec<u8>> for Nvds<T, M> {
    fn get(&self, namespace: Option<&Key>, key: &Key) -> Result<Vec<u8>, Error> {
        self.get_vec(namespace, key)
    }
}
