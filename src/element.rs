//! Mapping of values onto entries: one Small entry, one Middle run or a number of Bulk fragments
//! finished by a BulkInfo entry.

use crate::Key;
use crate::error::Error;
use crate::internal::Store;
use crate::namespace::validate_name;
use crate::platform::Platform;
use crate::raw::{
    BULK_MAX_SIZE, ENTRIES_PER_PAGE, ENTRY_SIZE, ElementType, Entry, EntryState, EntryValue,
    MAX_FRAGMENTS, MIDDLE_MAX_SIZE, SMALL_MAX_SIZE, Tag, data_crc32,
    element_hash,
};
use alloc::vec;
use alloc::vec::Vec;
use core::cmp;
use core::ops::Range;
#[cfg(feature = "defmt")]
use defmt::trace;

/// A live element header and where it is stored.
#[derive(Debug, Clone)]
pub(crate) struct Element {
    pub(crate) page: usize,
    pub(crate) slot: u8,
    pub(crate) entry: Entry,
}

impl Element {
    /// Slots of the header and its continuation entries.
    pub(crate) fn slots(&self) -> Range<u8> {
        let end = cmp::min(self.slot as usize + self.entry.span(), ENTRIES_PER_PAGE);
        self.slot..end as u8
    }

    /// Length of the value as seen by callers.
    pub(crate) fn value_len(&self) -> usize {
        match self.entry.tag.element_type {
            ElementType::BulkInfo => self.entry.bulk_size().unwrap_or_default() as usize,
            _ => self.entry.length as usize,
        }
    }

    /// Bulk fragments are internal, everything else is a value as seen by callers.
    pub(crate) fn is_value(&self) -> bool {
        self.entry.tag.element_type != ElementType::Bulk
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lookup {
    /// A Small, Middle or BulkInfo header.
    Value,
    Fragment(u8),
}

impl Lookup {
    fn matches(&self, tag: &Tag) -> bool {
        match self {
            Lookup::Value => tag.element_type != ElementType::Bulk,
            Lookup::Fragment(fragno) => {
                tag.element_type == ElementType::Bulk && tag.fragno == *fragno
            }
        }
    }
}

impl<T: Platform> Store<T> {
    pub(crate) fn find_element(
        &mut self,
        namespace: u8,
        key: &Key,
        lookup: Lookup,
    ) -> Result<Option<Element>, Error> {
        self.find_element_where(namespace, key, |tag| lookup.matches(tag))
    }

    /// Walks the pages in use from newest to oldest and returns the first live header with a
    /// matching namespace, key and tag. Only slots with a matching hash are read.
    pub(crate) fn find_element_where(
        &mut self,
        namespace: u8,
        key: &Key,
        matches: impl Fn(&Tag) -> bool,
    ) -> Result<Option<Element>, Error> {
        #[cfg(feature = "debug-logs")]
        println!("element: find ns {namespace} {key:?}");

        let hash = element_hash::<T>(namespace, key);

        for &page_index in self.used.iter().rev() {
            let page = &self.pages[page_index];
            for slot in page.slots_with_hash(hash) {
                if page.entry_state(slot) != EntryState::Used {
                    continue;
                }

                let entry = match page.read_entry(&mut self.io, slot) {
                    Ok(entry) => entry,
                    Err(Error::NotFound) => continue,
                    Err(e) => return Err(e),
                };

                if entry.tag.namespace == namespace && entry.key == *key && matches(&entry.tag) {
                    return Ok(Some(Element {
                        page: page_index,
                        slot,
                        entry,
                    }));
                }
            }
        }

        Ok(None)
    }

    /// All live element headers in the pages in use, oldest page first.
    pub(crate) fn live_elements(&mut self) -> Result<Vec<Element>, Error> {
        let mut elements = Vec::new();
        for &page_index in &self.used {
            let page = &self.pages[page_index];
            for it in page.hash_list() {
                match page.read_entry(&mut self.io, it.slot) {
                    Ok(entry) => elements.push(Element {
                        page: page_index,
                        slot: it.slot,
                        entry,
                    }),
                    Err(Error::NotFound) => continue,
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(elements)
    }

    pub(crate) fn put(
        &mut self,
        namespace: Option<&Key>,
        key: &Key,
        data: &[u8],
    ) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("put: [{}]", data.len());

        validate_name(key)?;
        if data.is_empty() || data.len() > BULK_MAX_SIZE {
            return Err(Error::InvalidParam);
        }

        let namespace_index = self.resolve_or_create_namespace(namespace)?;
        let result = self.put_element(namespace_index, key, data);
        if result.is_err() {
            // the namespace might have been created for this value only
            self.release_namespace_if_empty(namespace_index)?;
        }
        result
    }

    fn put_element(&mut self, namespace: u8, key: &Key, data: &[u8]) -> Result<(), Error> {
        if let Some(existing) = self.find_element(namespace, key, Lookup::Value)? {
            if self.element_equals(&existing, data)? {
                #[cfg(feature = "debug-logs")]
                println!("element: put: value already stored");
                return Ok(());
            }

            self.delete_element(&existing)?;
            self.namespaces.decrement(namespace);
        }

        if data.len() <= SMALL_MAX_SIZE {
            self.write_small(namespace, key, data)?;
        } else if data.len() <= MIDDLE_MAX_SIZE {
            self.write_middle(namespace, key, data)?;
        } else {
            self.write_bulk(namespace, key, data)?;
        }

        self.namespaces.increment(namespace);
        Ok(())
    }

    pub(crate) fn write_small(&mut self, namespace: u8, key: &Key, data: &[u8]) -> Result<(), Error> {
        let entry = Entry::small::<T>(namespace, *key, data);
        let page_index = self.tail_page_with_room(ENTRY_SIZE)?;
        self.pages[page_index].write_element(&mut self.io, &entry, &[])?;
        Ok(())
    }

    fn write_middle(&mut self, namespace: u8, key: &Key, data: &[u8]) -> Result<(), Error> {
        let entry = Entry::new::<T>(
            Tag::new(namespace, ElementType::Middle),
            data.len() as u16,
            *key,
            EntryValue::Varlen {
                data_crc: data_crc32::<T>(data),
            },
        );
        let page_index = self.tail_page_with_room(entry.span() * ENTRY_SIZE)?;
        self.pages[page_index].write_element(&mut self.io, &entry, data)?;
        Ok(())
    }

    /// Fragments are written first, the BulkInfo entry last. Until it is written, the value
    /// can't be found. If anything fails, the fragments written so far are retired.
    fn write_bulk(&mut self, namespace: u8, key: &Key, data: &[u8]) -> Result<(), Error> {
        let mut fragments = 0u8;
        let result = self
            .write_bulk_fragments(namespace, key, data, &mut fragments)
            .and_then(|()| self.write_bulk_info(namespace, key, data.len(), fragments));

        if let Err(_e) = result {
            #[cfg(feature = "defmt")]
            defmt::warn!("bulk write failed after {} fragments: {}", fragments, _e);

            self.discard_fragments(namespace, key, fragments)?;
        }
        result
    }

    fn write_bulk_fragments(
        &mut self,
        namespace: u8,
        key: &Key,
        data: &[u8],
        fragments: &mut u8,
    ) -> Result<(), Error> {
        let mut offset = 0usize;
        while offset < data.len() {
            if *fragments >= MAX_FRAGMENTS {
                return Err(Error::NoSpace);
            }

            // a fragment needs its header and at least one continuation entry
            let page_index = self.tail_page_with_room(2 * ENTRY_SIZE)?;
            let len = cmp::min(
                self.pages[page_index].room() - ENTRY_SIZE,
                data.len() - offset,
            );
            let chunk = &data[offset..offset + len];

            let entry = Entry::new::<T>(
                Tag::fragment(namespace, *fragments),
                len as u16,
                *key,
                EntryValue::Varlen {
                    data_crc: data_crc32::<T>(chunk),
                },
            );

            #[cfg(feature = "debug-logs")]
            println!(
                "element: bulk fragment {} [{offset}..{}] -> page {page_index}",
                *fragments,
                offset + len
            );

            self.pages[page_index].write_element(&mut self.io, &entry, chunk)?;
            *fragments += 1;
            offset += len;
        }
        Ok(())
    }

    fn write_bulk_info(
        &mut self,
        namespace: u8,
        key: &Key,
        size: usize,
        fragments: u8,
    ) -> Result<(), Error> {
        let entry = Entry::new::<T>(
            Tag::new(namespace, ElementType::BulkInfo),
            fragments as u16,
            *key,
            EntryValue::BulkInfo { size: size as u32 },
        );
        let page_index = self.tail_page_with_room(ENTRY_SIZE)?;
        self.pages[page_index].write_element(&mut self.io, &entry, &[])?;
        Ok(())
    }

    /// Fragments are looked up again as garbage collection may have moved them.
    fn discard_fragments(&mut self, namespace: u8, key: &Key, fragments: u8) -> Result<(), Error> {
        for fragno in 0..fragments {
            if let Some(fragment) = self.find_element(namespace, key, Lookup::Fragment(fragno))? {
                self.retire(&fragment)?;
            }
        }
        Ok(())
    }

    /// Marks the slots of exactly this header and its continuation entries updated.
    pub(crate) fn retire(&mut self, element: &Element) -> Result<(), Error> {
        self.pages[element.page].mark_updated(&mut self.io, element.slots())
    }

    /// Retires all entries of a value. The BulkInfo entry goes first so an interruption leaves
    /// orphaned fragments rather than a broken value.
    pub(crate) fn delete_element(&mut self, element: &Element) -> Result<(), Error> {
        self.retire(element)?;
        if element.entry.tag.element_type == ElementType::BulkInfo {
            let fragments = cmp::min(element.entry.length, MAX_FRAGMENTS as u16) as u8;
            self.discard_fragments(element.entry.tag.namespace, &element.entry.key, fragments)?;
        }
        Ok(())
    }

    fn element_equals(&mut self, element: &Element, data: &[u8]) -> Result<bool, Error> {
        if element.value_len() != data.len() {
            return Ok(false);
        }

        match self.read_value(element) {
            Ok(value) => Ok(value == data),
            Err(Error::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Reads and verifies the value of a Small, Middle or BulkInfo element.
    pub(crate) fn read_value(&mut self, element: &Element) -> Result<Vec<u8>, Error> {
        let entry = &element.entry;
        match (entry.tag.element_type, entry.value) {
            (ElementType::Small, EntryValue::Inline(bytes)) => {
                let len = entry.length as usize;
                if len > SMALL_MAX_SIZE {
                    return Err(Error::NotFound);
                }
                Ok(bytes[..len].to_vec())
            }
            (ElementType::Middle, _) => self.read_varlen(element),
            (ElementType::BulkInfo, EntryValue::BulkInfo { size }) => {
                self.read_bulk(entry.tag.namespace, &entry.key, entry.length, size as usize)
            }
            _ => Err(Error::NotFound),
        }
    }

    /// Continuation data of a Middle element or Bulk fragment, checked against its crc.
    fn read_varlen(&mut self, element: &Element) -> Result<Vec<u8>, Error> {
        let data = self.pages[element.page].read_data(&mut self.io, element.slot, &element.entry)?;

        if element.entry.data_crc() != Some(data_crc32::<T>(&data)) {
            #[cfg(feature = "defmt")]
            defmt::warn!(
                "payload crc mismatch @{:#08x}[{}]",
                self.pages[element.page].address,
                element.slot
            );
            return Err(Error::NotFound);
        }
        Ok(data)
    }

    /// Fragments are concatenated by fragment number, their physical order is irrelevant.
    fn read_bulk(
        &mut self,
        namespace: u8,
        key: &Key,
        fragments: u16,
        size: usize,
    ) -> Result<Vec<u8>, Error> {
        if size > BULK_MAX_SIZE || fragments == 0 || fragments > MAX_FRAGMENTS as u16 {
            return Err(Error::NotFound);
        }

        let mut value = Vec::with_capacity(size);
        for fragno in 0..fragments as u8 {
            let fragment = self
                .find_element(namespace, key, Lookup::Fragment(fragno))?
                .ok_or(Error::NotFound)?;
            let data = self.read_varlen(&fragment)?;
            if value.len() + data.len() > size {
                return Err(Error::NotFound);
            }
            value.extend_from_slice(&data);
        }

        if value.len() != size {
            return Err(Error::NotFound);
        }
        Ok(value)
    }

    /// Copies the value into `buf` and returns its length. Without a buffer only the length is
    /// returned.
    pub(crate) fn get(
        &mut self,
        namespace: Option<&Key>,
        key: &Key,
        buf: Option<&mut [u8]>,
    ) -> Result<usize, Error> {
        validate_name(key)?;
        let namespace_index = self.resolve_namespace(namespace)?;
        let element = self
            .find_element(namespace_index, key, Lookup::Value)?
            .ok_or(Error::NotFound)?;

        let len = element.value_len();
        let Some(buf) = buf else {
            return Ok(len);
        };

        if buf.len() < len {
            return Err(Error::InvalidLength(len as u32));
        }

        let value = self.read_value(&element)?;
        buf[..value.len()].copy_from_slice(&value);
        Ok(value.len())
    }

    pub(crate) fn get_vec(&mut self, namespace: Option<&Key>, key: &Key) -> Result<Vec<u8>, Error> {
        validate_name(key)?;
        let namespace_index = self.resolve_namespace(namespace)?;
        let element = self
            .find_element(namespace_index, key, Lookup::Value)?
            .ok_or(Error::NotFound)?;
        self.read_value(&element)
    }

    pub(crate) fn delete(&mut self, namespace: Option<&Key>, key: &Key) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("delete");

        validate_name(key)?;
        let namespace_index = self.resolve_namespace(namespace)?;
        let element = self
            .find_element(namespace_index, key, Lookup::Value)?
            .ok_or(Error::NotFound)?;

        self.delete_element(&element)?;
        if self.namespaces.decrement(namespace_index) == Some(0) {
            self.release_namespace(namespace_index)?;
        }
        Ok(())
    }

    pub(crate) fn find(&mut self, namespace: Option<&Key>, key: &Key) -> Result<bool, Error> {
        validate_name(key)?;
        let namespace_index = match self.resolve_namespace(namespace) {
            Ok(index) => index,
            Err(Error::NotFound) => return Ok(false),
            Err(e) => return Err(e),
        };
        Ok(self
            .find_element(namespace_index, key, Lookup::Value)?
            .is_some())
    }

    /// Keys and value lengths of a namespace, namespace records are never reported.
    pub(crate) fn keys(&mut self, namespace: Option<&Key>) -> Result<Vec<(Key, usize)>, Error> {
        let namespace_index = self.resolve_namespace(namespace)?;
        Ok(self
            .live_elements()?
            .into_iter()
            .filter(|it| it.entry.tag.namespace == namespace_index && it.is_value())
            .map(|it| (it.entry.key, it.value_len()))
            .collect())
    }

    /// Reads the raw continuation entries of a header as stored, used when moving elements.
    pub(crate) fn read_stored_run(
        &mut self,
        page_index: usize,
        slot: u8,
        span: usize,
    ) -> Result<Vec<u8>, Error> {
        let mut buf = vec![0u8; span * ENTRY_SIZE];
        let address = self.pages[page_index].entry_address(slot);
        self.io.read_raw(address, &mut buf)?;
        Ok(buf)
    }
}
