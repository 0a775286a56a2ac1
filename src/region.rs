use crate::Nvds;
use crate::crypt::BlockCipher;
use crate::error::Error;
use crate::platform::Platform;
use crate::raw::FLASH_SECTOR_SIZE;
use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use core::ops::Range;
#[cfg(feature = "defmt")]
use defmt::warn;
use embassy_sync::blocking_mutex::raw::RawMutex;

pub(crate) const MAX_LABEL_LENGTH: usize = 32;

const INTERNAL_BASE: u32 = 0x003F_B000;
const INTERNAL_SIZE: u32 = 0x4000;
const INTERNAL_LABEL: &str = "inner_nvds";

/// A contiguous, sector aligned range of flash holding one store.
///
/// Offsets are absolute flash offsets, the driver passed to [`crate::Nvds::new`] is expected to
/// address the whole flash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    base: u32,
    size: u32,
    label: String,
}

impl Region {
    /// Both `base` and `size` need to be multiples of the sector size and the region has to span
    /// at least two sectors, one of which is kept free for garbage collection. The label is
    /// limited to 32 bytes.
    pub fn new(base: u32, size: u32, label: &str) -> Result<Self, Error> {
        if !(base as usize).is_multiple_of(FLASH_SECTOR_SIZE)
            || !(size as usize).is_multiple_of(FLASH_SECTOR_SIZE)
        {
            return Err(Error::InvalidParam);
        }

        if (size as usize) < 2 * FLASH_SECTOR_SIZE || base.checked_add(size).is_none() {
            return Err(Error::InvalidParam);
        }

        if label.is_empty() || label.len() > MAX_LABEL_LENGTH {
            return Err(Error::InvalidParam);
        }

        Ok(Self {
            base,
            size,
            label: String::from(label),
        })
    }

    /// The region reserved for the system's own settings at the end of the 4 MiB flash.
    pub fn internal() -> Self {
        Self {
            base: INTERNAL_BASE,
            size: INTERNAL_SIZE,
            label: String::from(INTERNAL_LABEL),
        }
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn sectors(&self) -> usize {
        self.size as usize / FLASH_SECTOR_SIZE
    }

    pub(crate) fn sector_address(&self, sector: usize) -> u32 {
        self.base + (sector * FLASH_SECTOR_SIZE) as u32
    }

    fn span(&self) -> Range<u32> {
        self.base..self.base + self.size
    }

    pub fn overlaps(&self, other: &Region) -> bool {
        let a = self.span();
        let b = other.span();
        a.start < b.end && b.start < a.end
    }
}

/// Bookkeeping of the regions mounted on one flash. Mounting through [`Regions::mount`] rejects
/// regions which overlap a mounted one or reuse its label.
#[derive(Debug, Default)]
pub struct Regions {
    active: Vec<Region>,
}

impl Regions {
    pub const fn new() -> Self {
        Self { active: Vec::new() }
    }

    /// Registers `region`. Fails with [`Error::InvalidParam`] if it overlaps a registered
    /// region or reuses its label.
    pub fn claim(&mut self, region: &Region) -> Result<(), Error> {
        if let Some(_existing) = self
            .active
            .iter()
            .find(|it| it.overlaps(region) || it.label == region.label)
        {
            #[cfg(feature = "defmt")]
            warn!(
                "region {=str} collides with {=str}",
                region.label(),
                _existing.label()
            );
            return Err(Error::InvalidParam);
        }

        self.active.push(region.clone());
        Ok(())
    }

    /// Claims `region` and mounts it, see [`Nvds::open`]. The claim is dropped again if the
    /// mount fails.
    pub fn mount<T: Platform, M: RawMutex>(
        &mut self,
        region: Region,
        hal: T,
        cipher: Option<Box<dyn BlockCipher + Send>>,
    ) -> Result<Nvds<T, M>, Error> {
        self.claim(&region)?;
        let label = region.label.clone();
        Nvds::open(region, hal, cipher).inspect_err(|_| {
            let _ = self.release(&label);
        })
    }

    /// Releases the region of `nvds` and hands back its flash driver.
    pub fn unmount<T: Platform, M: RawMutex>(&mut self, nvds: Nvds<T, M>) -> Result<T, Error> {
        self.release(nvds.region().label())?;
        Ok(nvds.deinit())
    }

    pub fn release(&mut self, label: &str) -> Result<Region, Error> {
        let idx = self
            .active
            .iter()
            .position(|it| it.label == label)
            .ok_or(Error::NotFound)?;
        Ok(self.active.swap_remove(idx))
    }

    pub fn find(&self, label: &str) -> Option<&Region> {
        self.active.iter().find(|it| it.label == label)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        self.active.iter()
    }
}
