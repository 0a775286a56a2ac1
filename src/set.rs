use crate::error::Error;
use crate::platform::Platform;
use crate::{Key, Nvds};
use alloc::string::String;
use alloc::vec::Vec;
use embassy_sync::blocking_mutex::raw::RawMutex;

/// Integers are stored little endian at their own width, `bool` as a single byte. Strings are
/// stored without terminator.
pub trait Set<T> {
    fn set(&self, namespace: Option<&Key>, key: &Key, value: T) -> Result<(), Error>;
}

impl<T, S: Set<T>> Set<T> for &S {
    fn set(&self, namespace: Option<&Key>, key: &Key, value: T) -> Result<(), Error> {
        (*self).set(namespace, key, value)
    }
}

impl<T: Platform, M: RawMutex> Set<bool> for Nvds<T, M> {
    fn set(&self, namespace: Option<&Key>, key: &Key, value: bool) -> Result<(), Error> {
        self.put(namespace, key, &[value as u8])
    }
}

macro_rules! impl_set_integer {
    ($($ty:ty),+) => {$(
        impl<T: Platform, M: RawMutex> Set<$ty> for Nvds<T, M> {
            fn set(&self, namespace: Option<&Key>, key: &Key, value: $ty) -> Result<(), Error> {
                self.put(namespace, key, &value.to_le_bytes())
            }
        }
    )+};
}

impl_set_integer!(u8, u16, u32, u64, i8, i16, i32, i64);

impl<T: Platform, M: RawMutex> Set<&str> for Nvds<T, M> {
    fn set(&self, namespace: Option<&Key>, key: &Key, value: &str) -> Result<(), Error> {
        self.put(namespace, key, value.as_bytes())
    }
}

impl<T: Platform, M: RawMutex> Set<String> for Nvds<T, M> {
    fn set(&self, namespace: Option<&Key>, key: &Key, value: String) -> Result<(), Error> {
        self.put(namespace, key, value.as_bytes())
    }
}

impl<T: Platform, M: RawMutex> Set<&[u8]> for Nvds<T, M> {
    fn set(&self, namespace: Option<&Key>, key: &Key, value: &[u8]) -> Result<(), Error> {
        self.put(namespace, key, value)
    }
}

impl<T: Platform, M: RawMutex> Set<Vec<u8>> for Nvds<T, M> {
    fn set(&self, namespace: Option<&Key>, key: &Key, value: Vec<u8>) -> Result<(), Error> {
        self.put(namespace, key, &value)
    }
}
