//! Flash access of the store. Entries pass through the optional cipher here, page headers and
//! entry state tables are always accessed in clear text.

use crate::crypt::{self, BlockCipher};
use crate::error::Error;
use crate::platform::{AlignedOps, Platform};
use crate::raw::{ENTRY_SIZE, FLASH_SECTOR_SIZE, RawEntry, write_aligned};
use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
#[cfg(feature = "defmt")]
use defmt::trace;

pub(crate) struct FlashIo<T: Platform> {
    pub(crate) hal: T,
    cipher: Option<Box<dyn BlockCipher + Send>>,
}

impl<T: Platform> FlashIo<T> {
    pub(crate) fn new(hal: T, cipher: Option<Box<dyn BlockCipher + Send>>) -> Self {
        Self { hal, cipher }
    }

    pub(crate) fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    pub(crate) fn read_raw(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), Error> {
        self.hal.read(offset, buf).map_err(|_| Error::FlashIoFail)
    }

    pub(crate) fn write_raw(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Error> {
        write_aligned(&mut self.hal, offset, bytes).map_err(|_| Error::FlashIoFail)
    }

    pub(crate) fn erase_sector(&mut self, offset: u32) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("erase_sector: @{:#08x}", offset);

        self.hal
            .erase(offset, offset + FLASH_SECTOR_SIZE as u32)
            .map_err(|_| Error::FlashIoFail)
    }

    /// Turns an entry as stored on flash into clear text.
    pub(crate) fn open_entry(&self, raw: &mut RawEntry) -> Result<(), Error> {
        match &self.cipher {
            Some(cipher) => crypt::decrypt(cipher.as_ref(), raw).map_err(|_| Error::DecryptFail),
            None => Ok(()),
        }
    }

    pub(crate) fn read_entry(&mut self, offset: u32) -> Result<RawEntry, Error> {
        let mut raw = [0u8; ENTRY_SIZE];
        self.read_raw(offset, &mut raw)?;
        self.open_entry(&mut raw)?;
        Ok(raw)
    }

    pub(crate) fn write_entry(&mut self, offset: u32, raw: &RawEntry) -> Result<(), Error> {
        let mut sealed = *raw;
        if let Some(cipher) = &self.cipher {
            crypt::encrypt(cipher.as_ref(), &mut sealed).map_err(|_| Error::EncryptFail)?;
        }
        self.write_raw(offset, &sealed)
    }

    /// Reads `len` bytes of continuation data starting at the entry at `offset`.
    pub(crate) fn read_data(&mut self, offset: u32, len: usize) -> Result<Vec<u8>, Error> {
        let padded = match self.cipher {
            Some(_) => len.div_ceil(ENTRY_SIZE) * ENTRY_SIZE,
            None => T::align_read(len),
        };

        let mut buf = vec![0u8; padded];
        self.read_raw(offset, &mut buf)?;
        if let Some(cipher) = &self.cipher {
            crypt::decrypt(cipher.as_ref(), &mut buf).map_err(|_| Error::DecryptFail)?;
        }
        buf.truncate(len);
        Ok(buf)
    }

    /// Writes continuation data starting at the entry at `offset`. The tail of the last entry
    /// stays erased, or is padded with 0xFF before encryption.
    pub(crate) fn write_data(&mut self, offset: u32, data: &[u8]) -> Result<(), Error> {
        match &self.cipher {
            Some(cipher) => {
                let mut sealed = vec![0xFFu8; data.len().div_ceil(ENTRY_SIZE) * ENTRY_SIZE];
                sealed[..data.len()].copy_from_slice(data);
                crypt::encrypt(cipher.as_ref(), &mut sealed).map_err(|_| Error::EncryptFail)?;
                self.write_raw(offset, &sealed)
            }
            None => self.write_raw(offset, data),
        }
    }
}
