#![doc = include_str!("../README.md")]
#![cfg_attr(not(target_arch = "x86_64"), no_std)]

mod allocator;
pub mod crypt;
mod dump;
mod element;
pub mod error;
mod get;
mod internal;
mod medium;
mod namespace;
mod page;
pub mod platform;
mod raw;
pub mod region;
mod set;

extern crate alloc;

pub use get::Get;
pub use region::{Region, Regions};
pub use set::Set;

use crate::crypt::BlockCipher;
use crate::error::Error;
use crate::internal::Store;
use crate::medium::FlashIo;
use crate::platform::Platform;
use crate::raw::{ENTRIES_PER_PAGE, PageState};
use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use core::cell::RefCell;
use core::fmt;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::{NoopRawMutex, RawMutex};
use embedded_storage::nor_flash::ReadNorFlash;

/// Maximum name length is 15 bytes + 1 byte for the null terminator.
const MAX_KEY_LENGTH: usize = 15;
const MAX_KEY_NUL_TERMINATED_LENGTH: usize = MAX_KEY_LENGTH + 1;

/// A 16-byte, null-padded name used for keys and namespaces.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Key([u8; MAX_KEY_NUL_TERMINATED_LENGTH]);

impl Key {
    /// Creates a key from a byte array of up to 15 bytes.
    ///
    /// Usage: `Key::from_array(b"my_key")`
    ///
    /// Tip: use a const context if possible to ensure that the key is transformed at compile time:
    ///   `let my_key = const { Key::from_array(b"my_key") };`
    pub const fn from_array<const M: usize>(src: &[u8; M]) -> Self {
        assert!(M <= MAX_KEY_LENGTH);
        let mut dst = [0u8; MAX_KEY_NUL_TERMINATED_LENGTH];
        let mut i = 0;
        while i < M {
            dst[i] = src[i];
            i += 1;
        }
        Self(dst)
    }

    /// Creates a key from a slice of up to 15 bytes, panics on longer input.
    pub const fn from_slice(src: &[u8]) -> Self {
        assert!(src.len() <= MAX_KEY_LENGTH);
        let mut dst = [0u8; MAX_KEY_NUL_TERMINATED_LENGTH];
        let mut i = 0;
        while i < src.len() {
            dst[i] = src[i];
            i += 1;
        }
        Self(dst)
    }

    /// Usage: `const { Key::from_str("my_key") }`
    pub const fn from_str(s: &str) -> Self {
        Self::from_slice(s.as_bytes())
    }

    /// Fallible variant of [`Key::from_str`] for names that are only known at runtime.
    pub fn try_from_str(s: &str) -> Result<Self, Error> {
        if s.is_empty() || s.len() > MAX_KEY_LENGTH || s.as_bytes().contains(&0) {
            return Err(Error::InvalidParam);
        }
        Ok(Self::from_slice(s.as_bytes()))
    }

    pub const fn as_bytes(&self) -> &[u8; MAX_KEY_NUL_TERMINATED_LENGTH] {
        &self.0
    }

    /// The bytes up to the first null byte.
    pub fn name(&self) -> &[u8] {
        let len = self
            .0
            .iter()
            .position(|&byte| byte == 0)
            .unwrap_or(self.0.len());
        &self.0[..len]
    }

    /// A key needs a non-empty name, a null terminator and nothing but null bytes behind it.
    pub(crate) fn is_valid(&self) -> bool {
        let name = self.name();
        !name.is_empty()
            && self.0[MAX_KEY_LENGTH] == 0
            && self.0[name.len()..].iter().all(|&byte| byte == 0)
    }

    /// On flash the name is null terminated and padded with erased bytes.
    pub(crate) fn to_flash_field(&self) -> [u8; MAX_KEY_NUL_TERMINATED_LENGTH] {
        let mut field = [0xFFu8; MAX_KEY_NUL_TERMINATED_LENGTH];
        let name = self.name();
        field[..name.len()].copy_from_slice(name);
        if name.len() < MAX_KEY_NUL_TERMINATED_LENGTH {
            field[name.len()] = 0;
        }
        field
    }

    pub(crate) fn from_flash_field(field: &[u8; MAX_KEY_NUL_TERMINATED_LENGTH]) -> Self {
        let mut dst = [0u8; MAX_KEY_NUL_TERMINATED_LENGTH];
        for (dst, &byte) in dst.iter_mut().zip(field.iter().take_while(|&&byte| byte != 0)) {
            *dst = byte;
        }
        Self(dst)
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key(b\"")?;

        // the terminator is always null and only clutters the output
        for &byte in &self.0[..MAX_KEY_LENGTH] {
            if byte == 0 {
                write!(f, "\\0")?;
                continue;
            }

            write!(f, "{}", core::ascii::escape_default(byte))?;
        }

        write!(f, "\")")
    }
}

impl AsRef<[u8]> for Key {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NamespaceInfo {
    pub index: u8,
    pub live_keys: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NvdsStatistics {
    pub pages: PageStatistics,
    pub entries_per_page: Vec<EntryStatistics>,
    pub entries_overall: EntryStatistics,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageStatistics {
    pub uninitialized: u16,
    pub active: u16,
    pub full: u16,
    pub candidate: u16,
    /// Pages with a corrupt header or content, they are erased before reuse.
    pub error: u16,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntryStatistics {
    pub free: u32,
    pub used: u32,
    pub updated: u32,
    pub illegal: u32,
}

/// Handle of one mounted region.
///
/// All operations take `&self` and are serialized by a lock owned by the handle. With the
/// default [`NoopRawMutex`] the handle can't be shared between tasks, use [`Nvds::open`] with a
/// `CriticalSectionRawMutex` for that.
///
/// The in-memory state grows with the number of sectors and the number of stored elements.
pub struct Nvds<T: Platform, M: RawMutex = NoopRawMutex> {
    store: Mutex<M, RefCell<Store<T>>>,
}

impl<T: Platform> Nvds<T> {
    /// Mounts the region. All sectors are read to
    /// 1. classify pages as free or in use and restore their order
    /// 2. resolve all namespaces and build a hash list per page for quicker lookups
    /// 3. finish an interrupted garbage collection and drop leftovers of interrupted writes
    ///
    /// Pages or entries with invalid CRC32 values are recycled, they don't prevent the mount.
    pub fn new(region: Region, hal: T) -> Result<Self, Error> {
        Self::open(region, hal, None)
    }

    /// Like [`Nvds::new`], every entry passes through `cipher` on its way to and from flash.
    pub fn new_encrypted(
        region: Region,
        hal: T,
        cipher: impl BlockCipher + Send + 'static,
    ) -> Result<Self, Error> {
        Self::open(region, hal, Some(Box::new(cipher)))
    }

    /// Mounts the fixed internal region, see [`Region::internal`].
    pub fn internal(hal: T) -> Result<Self, Error> {
        Self::new(Region::internal(), hal)
    }
}

impl<T: Platform, M: RawMutex> Nvds<T, M> {
    /// Mounts `region` on its own. Several regions on one flash are mounted through
    /// [`Regions::mount`], which rejects overlapping regions.
    ///
    /// Fails with [`Error::InvalidParam`] if the region reaches past the end of the flash.
    pub fn open(
        region: Region,
        hal: T,
        cipher: Option<Box<dyn BlockCipher + Send>>,
    ) -> Result<Self, Error> {
        if !cfg!(feature = "flash") {
            return Err(Error::NotUsingFlash);
        }

        if region.base() as usize + region.size() as usize > hal.capacity() {
            return Err(Error::InvalidParam);
        }

        let store = Store::load(FlashIo::new(hal, cipher), region)?;
        Ok(Self {
            store: Mutex::new(RefCell::new(store)),
        })
    }

    /// Releases the flash driver.
    pub fn deinit(self) -> T {
        self.store.into_inner().into_inner().io.hal
    }

    pub fn region(&self) -> Region {
        self.store.lock(|cell| cell.borrow().region.clone())
    }

    /// Runs `op` with the lock held. A failed flash access leaves the in-memory state
    /// unreliable, every following operation fails until [`Nvds::erase_all`] succeeds.
    fn with_store<R>(&self, op: impl FnOnce(&mut Store<T>) -> Result<R, Error>) -> Result<R, Error> {
        self.store.lock(|cell| {
            let mut store = cell.borrow_mut();
            if store.faulted {
                return Err(Error::FlashIoFail);
            }

            let result = op(&mut store);
            if let Err(Error::FlashIoFail) = result {
                store.faulted = true;
            }
            result
        })
    }

    /// Stores `value` under `key`. `namespace = None` selects the default namespace, any other
    /// namespace is created on first use.
    ///
    /// Values of up to 8 bytes take a single entry, up to 256 bytes one run of entries on a
    /// single page and up to 12800 bytes are split in fragments spanning several pages.
    /// Storing the value already stored doesn't write to flash.
    pub fn put(&self, namespace: Option<&Key>, key: &Key, value: &[u8]) -> Result<(), Error> {
        self.with_store(|store| store.put(namespace, key, value))
    }

    /// Copies the value into `buf` and returns its length.
    ///
    /// Without a buffer only the length is returned. If `buf` is too short,
    /// [`Error::InvalidLength`] reports the required length.
    pub fn get(
        &self,
        namespace: Option<&Key>,
        key: &Key,
        buf: Option<&mut [u8]>,
    ) -> Result<usize, Error> {
        self.with_store(|store| store.get(namespace, key, buf))
    }

    pub fn get_vec(&self, namespace: Option<&Key>, key: &Key) -> Result<Vec<u8>, Error> {
        self.with_store(|store| store.get_vec(namespace, key))
    }

    /// Get a typed value, see [`Get`] for the supported types.
    pub fn get_as<R>(&self, namespace: Option<&Key>, key: &Key) -> Result<R, Error>
    where
        Self: Get<R>,
    {
        Get::get(self, namespace, key)
    }

    /// Set a typed value, see [`Set`] for the supported types.
    pub fn set<R>(&self, namespace: Option<&Key>, key: &Key, value: R) -> Result<(), Error>
    where
        Self: Set<R>,
    {
        Set::set(self, namespace, key, value)
    }

    /// Returns [`Error::NotFound`] for missing keys. The namespace is released together with
    /// its last key.
    pub fn delete(&self, namespace: Option<&Key>, key: &Key) -> Result<(), Error> {
        self.with_store(|store| store.delete(namespace, key))
    }

    pub fn find(&self, namespace: Option<&Key>, key: &Key) -> Result<bool, Error> {
        self.with_store(|store| store.find(namespace, key))
    }

    /// Deletes all keys of the namespace and the namespace itself.
    pub fn delete_namespace(&self, namespace: &Key) -> Result<(), Error> {
        self.with_store(|store| store.delete_namespace(namespace))
    }

    /// Resolves the namespace, creating it if necessary.
    pub fn namespace_index(&self, namespace: &Key) -> Result<NamespaceInfo, Error> {
        self.with_store(|store| {
            let (index, live_keys) = store.namespace_info(namespace)?;
            Ok(NamespaceInfo { index, live_keys })
        })
    }

    /// Calls `f` with every key of the namespace and the length of its value.
    ///
    /// The keys are collected first, `f` runs after the lock is released and may use the
    /// store itself.
    pub fn for_each_key(
        &self,
        namespace: Option<&Key>,
        mut f: impl FnMut(&Key, usize),
    ) -> Result<(), Error> {
        let keys = self.with_store(|store| store.keys(namespace))?;
        for (key, len) in &keys {
            f(key, *len);
        }
        Ok(())
    }

    /// Erases the whole region. Also recovers a handle that failed on a flash access.
    pub fn erase_all(&self) -> Result<(), Error> {
        self.store.lock(|cell| {
            let mut store = cell.borrow_mut();
            let result = store.erase_all();
            store.faulted = result.is_err();
            result
        })
    }

    /// Human readable summary of the region. `verbose` lists every entry of every page, with a
    /// namespace only its keys are listed.
    pub fn dump(&self, verbose: bool, namespace: Option<&Key>) -> Result<String, Error> {
        self.with_store(|store| store.dump(verbose, namespace))
    }

    /// Returns detailed statistics about the region usage.
    pub fn statistics(&self) -> Result<NvdsStatistics, Error> {
        self.with_store(|store| Ok(store.statistics()))
    }
}

impl<T: Platform> Store<T> {
    fn statistics(&self) -> NvdsStatistics {
        let mut pages = PageStatistics::default();

        // pages are kept in address order, which keeps the output stable
        let entries_per_page: Vec<EntryStatistics> = self
            .pages
            .iter()
            .map(|page| {
                match page.state() {
                    PageState::Uninitialized => pages.uninitialized += 1,
                    PageState::Active => pages.active += 1,
                    PageState::Full => pages.full += 1,
                    PageState::Candidate => pages.candidate += 1,
                    PageState::Error | PageState::Invalid => pages.error += 1,
                }

                match page.state() {
                    PageState::Error | PageState::Invalid => EntryStatistics {
                        illegal: ENTRIES_PER_PAGE as u32,
                        ..Default::default()
                    },
                    _ => {
                        let (free, used, updated, illegal) = page.entry_statistics();
                        EntryStatistics {
                            free,
                            used,
                            updated,
                            illegal,
                        }
                    }
                }
            })
            .collect();

        let entries_overall = entries_per_page.iter().fold(
            EntryStatistics::default(),
            |acc, it| EntryStatistics {
                free: acc.free + it.free,
                used: acc.used + it.used,
                updated: acc.updated + it.updated,
                illegal: acc.illegal + it.illegal,
            },
        );

        NvdsStatistics {
            pages,
            entries_per_page,
            entries_overall,
        }
    }
}
