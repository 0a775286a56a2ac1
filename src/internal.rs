use crate::Key;
use crate::error::Error;
use crate::medium::FlashIo;
use crate::namespace::Namespaces;
use crate::page::Page;
use crate::platform::Platform;
use crate::raw::{
    ENTRIES_OFFSET, ENTRIES_PER_PAGE, ENTRY_SIZE, ENTRY_STATE_TABLE_OFFSET,
    ENTRY_STATE_TABLE_SIZE, ElementType, Entry, EntryState, EntryStateTable, EntryValue,
    FLASH_SECTOR_SIZE, NAMESPACE_DEFAULT, NAMESPACE_DEFINITIONS, PAGE_HEADER_SIZE, PAGE_MAGIC,
    PageHeader, PageState, RawEntry,
};
use crate::region::Region;
use alloc::collections::VecDeque;
use alloc::vec;
use alloc::vec::Vec;
#[cfg(feature = "defmt")]
use defmt::{trace, warn};

/// Everything known about one mounted region. All access is serialized by the lock of the
/// owning [`crate::Nvds`].
pub(crate) struct Store<T: Platform> {
    pub(crate) io: FlashIo<T>,
    pub(crate) region: Region,
    pub(crate) namespaces: Namespaces,
    /// One mirror per sector, in address order.
    pub(crate) pages: Vec<Page>,
    /// Indices of the pages in use, ascending by sequence number. The last one takes writes.
    pub(crate) used: Vec<usize>,
    pub(crate) free: VecDeque<usize>,
    pub(crate) faulted: bool,
}

enum LoadPageResult {
    Free(Page),
    Used(Page, Vec<NamespaceRecord>),
}

struct NamespaceRecord {
    name: Key,
    index: Option<u8>,
    page: usize,
    slot: u8,
}

impl<T: Platform> Store<T> {
    /// Reads all sectors of the region to
    /// 1. classify pages as free or in use and restore their order
    /// 2. rebuild the namespace table and the per page hash lists
    /// 3. repair what an interrupted write, delete or garbage collection left behind
    ///
    /// Corruption is never fatal: broken pages are recycled and broken entries retired.
    pub(crate) fn load(io: FlashIo<T>, region: Region) -> Result<Self, Error> {
        let mut store = Self {
            io,
            namespaces: Namespaces::new(),
            pages: Vec::with_capacity(region.sectors()),
            used: Vec::new(),
            free: VecDeque::new(),
            region,
            faulted: false,
        };
        store.load_pages()?;
        Ok(store)
    }

    fn load_pages(&mut self) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("load_pages");

        #[cfg(feature = "debug-logs")]
        println!("internal: load_pages {}", self.region.label());

        let mut records = Vec::new();
        let mut candidates = Vec::new();
        for sector in 0..self.region.sectors() {
            let address = self.region.sector_address(sector);
            let page_index = self.pages.len();
            match self.load_page(address, page_index)? {
                LoadPageResult::Free(page) => {
                    self.pages.push(page);
                    self.free.push_back(page_index);
                }
                LoadPageResult::Used(page, found) => {
                    if page.state() == PageState::Candidate {
                        candidates.push(page_index);
                    } else {
                        self.used.push(page_index);
                    }
                    self.pages.push(page);
                    records.extend(found);
                }
            }
        }

        // erased pages first, they can be handed out without an erase
        let pages = &self.pages;
        self.free
            .make_contiguous()
            .sort_by_key(|&idx| pages[idx].state() != PageState::Uninitialized);
        self.used.sort_by_key(|&idx| pages[idx].sequence());

        self.ensure_single_active_page()?;
        self.load_namespaces(records)?;

        for candidate in candidates {
            self.continue_garbage_collection(candidate)?;
        }

        self.discard_unreachable()?;
        self.count_live_keys()?;

        if self.used.is_empty() {
            self.new_page_request(0)?;
        }

        #[cfg(feature = "debug-logs")]
        for page in &self.pages {
            println!("internal: {page:?}");
        }

        Ok(())
    }

    fn load_page(&mut self, address: u32, page_index: usize) -> Result<LoadPageResult, Error> {
        #[cfg(feature = "defmt")]
        trace!("load_page: @{:#08x}", address);

        let mut buf = vec![0u8; FLASH_SECTOR_SIZE];
        self.io.read_raw(address, &mut buf)?;

        let mut raw_header = [0u8; PAGE_HEADER_SIZE];
        raw_header.copy_from_slice(&buf[..PAGE_HEADER_SIZE]);
        let header = PageHeader::decode(&raw_header);

        let mut raw_states = [0u8; ENTRY_STATE_TABLE_SIZE];
        raw_states.copy_from_slice(
            &buf[ENTRY_STATE_TABLE_OFFSET..ENTRY_STATE_TABLE_OFFSET + ENTRY_STATE_TABLE_SIZE],
        );

        let mut page = Page::loaded(address, header, EntryStateTable::from_bytes(raw_states));

        match header.state {
            PageState::Uninitialized => {
                // validate that the page is truly empty
                if buf.iter().any(|&it| it != 0xFF) {
                    #[cfg(feature = "defmt")]
                    warn!("uninitialized page with content @{:#08x}", address);
                    page.header.state = PageState::Error;
                }
                return Ok(LoadPageResult::Free(page));
            }
            PageState::Error | PageState::Invalid => return Ok(LoadPageResult::Free(page)),
            PageState::Active | PageState::Full | PageState::Candidate => {}
        }

        if header.magic != PAGE_MAGIC || header.crc != PageHeader::calculate_crc32::<T>(&raw_header)
        {
            #[cfg(feature = "defmt")]
            warn!("corrupt page header @{:#08x}", address);
            page.header.state = PageState::Error;
            return Ok(LoadPageResult::Free(page));
        }

        let mut records = Vec::new();
        let mut slot = 0u8;
        while (slot as usize) < ENTRIES_PER_PAGE {
            let offset = ENTRIES_OFFSET + slot as usize * ENTRY_SIZE;
            let mut raw: RawEntry = [0u8; ENTRY_SIZE];
            raw.copy_from_slice(&buf[offset..offset + ENTRY_SIZE]);

            match page.entry_state(slot) {
                EntryState::Updated => {}
                EntryState::Free => {
                    // written, but the state table update got lost
                    if raw.iter().any(|&it| it != 0xFF) {
                        #[cfg(feature = "defmt")]
                        warn!("retiring uncommitted entry @{:#08x}[{}]", address, slot);
                        page.mark_updated(&mut self.io, slot..slot + 1)?;
                    }
                }
                EntryState::Illegal => {
                    #[cfg(feature = "defmt")]
                    warn!("retiring illegal entry @{:#08x}[{}]", address, slot);
                    page.mark_updated(&mut self.io, slot..slot + 1)?;
                }
                EntryState::Used => {
                    self.io.open_entry(&mut raw)?;
                    let entry = match Entry::decode::<T>(&raw) {
                        Ok(entry) if slot as usize + entry.span() <= ENTRIES_PER_PAGE => entry,
                        _ => {
                            // the length of a broken header can't be trusted, only this slot
                            // is retired
                            #[cfg(feature = "defmt")]
                            warn!("retiring corrupt entry @{:#08x}[{}]", address, slot);
                            page.mark_updated(&mut self.io, slot..slot + 1)?;
                            slot += 1;
                            continue;
                        }
                    };

                    #[cfg(feature = "debug-logs")]
                    println!("internal: load_page: [{slot}] {entry:?}");

                    if entry.tag.namespace == NAMESPACE_DEFINITIONS {
                        records.push(NamespaceRecord {
                            name: entry.key,
                            index: namespace_record_index(&entry),
                            page: page_index,
                            slot,
                        });
                    }

                    page.push_hash(entry.hash::<T>(), slot);
                    slot += entry.span() as u8;
                    continue;
                }
            }
            slot += 1;
        }

        Ok(LoadPageResult::Used(page, records))
    }

    /// The newest page in use is the only one that takes writes. Any other page still marked
    /// active was left behind by an interrupted page switch.
    fn ensure_single_active_page(&mut self) -> Result<(), Error> {
        let Some((_, older)) = self.used.split_last() else {
            return Ok(());
        };

        for &page_index in older {
            let page = &mut self.pages[page_index];
            if page.state() == PageState::Active {
                #[cfg(feature = "defmt")]
                warn!(
                    "detected duplicate active page, marking as full ({:#08x})",
                    page.address
                );
                page.set_state(&mut self.io, PageState::Full)?;
            }
        }
        Ok(())
    }

    fn load_namespaces(&mut self, records: Vec<NamespaceRecord>) -> Result<(), Error> {
        for record in records {
            let accepted = match record.index {
                Some(index) => self.namespaces.insert(record.name, index),
                None => false,
            };

            if !accepted {
                #[cfg(feature = "defmt")]
                warn!("dropping invalid or duplicate namespace record");
                self.pages[record.page].mark_updated(&mut self.io, record.slot..record.slot + 1)?;
            }
        }
        Ok(())
    }

    /// Finishes a garbage collection that was interrupted after the victim was marked as
    /// candidate. Elements that already made it to another page are not copied again.
    fn continue_garbage_collection(&mut self, candidate: usize) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        warn!(
            "continuing interrupted garbage collection of @{:#08x}",
            self.pages[candidate].address
        );

        self.prepare_collection_target()?;

        let slots: Vec<u8> = self.pages[candidate]
            .hash_list()
            .iter()
            .map(|it| it.slot)
            .collect();

        for slot in slots {
            let entry = match self.pages[candidate].read_entry(&mut self.io, slot) {
                Ok(entry) => entry,
                Err(Error::NotFound) => continue,
                Err(e) => return Err(e),
            };

            let tag = entry.tag;
            if self
                .find_element_where(tag.namespace, &entry.key, |it| *it == tag)?
                .is_some()
            {
                continue;
            }

            let data = if entry.span() > 1 {
                self.pages[candidate].read_data(&mut self.io, slot, &entry)?
            } else {
                Vec::new()
            };

            let target = self.tail_page_with_room(entry.span() * ENTRY_SIZE)?;
            self.pages[target].write_element(&mut self.io, &entry, &data)?;
        }

        self.pages[candidate].erase(&mut self.io)?;
        self.free.push_back(candidate);
        Ok(())
    }

    /// The collection copies to the newest page. Without live entries, it only holds what an
    /// interrupted copy left behind and is started over. If the interruption happened before
    /// it was activated, the newest page is still marked full and a free page is activated.
    fn prepare_collection_target(&mut self) -> Result<(), Error> {
        match self.used.last().copied() {
            Some(tail) if self.pages[tail].state() == PageState::Active => {
                let page = &mut self.pages[tail];
                if page.used_count() == 0 && page.next_free() > 0 {
                    let sequence = page.sequence();
                    page.erase(&mut self.io)?;
                    page.initialize(&mut self.io, sequence)?;
                }
                Ok(())
            }
            _ => {
                let sequence = self.next_sequence();
                self.activate_free_page(sequence).map(|_| ())
            }
        }
    }

    /// Retires elements of unknown namespaces and bulk fragments without a matching BulkInfo
    /// entry, e.g. left behind by an interrupted delete.
    fn discard_unreachable(&mut self) -> Result<(), Error> {
        let elements = self.live_elements()?;
        for element in &elements {
            let tag = element.entry.tag;

            let known_namespace = match tag.namespace {
                NAMESPACE_DEFINITIONS | NAMESPACE_DEFAULT => true,
                index => self.namespaces.get(index).is_some(),
            };

            let complete = tag.element_type != ElementType::Bulk
                || elements.iter().any(|info| {
                    info.entry.tag.element_type == ElementType::BulkInfo
                        && info.entry.tag.namespace == tag.namespace
                        && info.entry.key == element.entry.key
                        && (tag.fragno as u16) < info.entry.length
                });

            if !known_namespace || !complete {
                #[cfg(feature = "defmt")]
                warn!(
                    "retiring unreachable element @{:#08x}[{}]",
                    self.pages[element.page].address, element.slot
                );
                self.retire(element)?;
            }
        }
        Ok(())
    }

    /// Counts the values of every namespace. Namespaces without values are released.
    fn count_live_keys(&mut self) -> Result<(), Error> {
        for element in self.live_elements()? {
            if element.is_value() {
                self.namespaces.increment(element.entry.tag.namespace);
            }
        }

        let empty: Vec<u8> = self
            .namespaces
            .iter()
            .filter(|it| it.live_keys == 0)
            .map(|it| it.index)
            .collect();
        for index in empty {
            self.release_namespace(index)?;
        }
        Ok(())
    }

    /// Erases every page of the region and starts over with a single active page.
    pub(crate) fn erase_all(&mut self) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("erase_all");

        for page in self.pages.iter_mut() {
            page.erase(&mut self.io)?;
        }

        self.namespaces.clear();
        self.used.clear();
        self.free = (0..self.pages.len()).collect();
        self.new_page_request(0)?;
        Ok(())
    }
}

/// A namespace record is a Small element holding the one byte index.
fn namespace_record_index(entry: &Entry) -> Option<u8> {
    match (entry.tag.element_type, entry.value) {
        (ElementType::Small, EntryValue::Inline(bytes)) if entry.length == 1 => Some(bytes[0]),
        _ => None,
    }
}
