use crate::error::Error;
use crate::medium::FlashIo;
use crate::platform::{AlignedOps, Platform};
use crate::raw::{
    ENTRIES_OFFSET, ENTRIES_PER_PAGE, ENTRY_SIZE, ENTRY_STATE_TABLE_OFFSET, ElementHash, Entry,
    EntryState, EntryStateTable, PAGE_STATE_OFFSET, PageHeader, PageState,
};
use alloc::vec::Vec;
#[cfg(feature = "debug-logs")]
use core::fmt::{Debug, Formatter};
use core::ops::Range;
#[cfg(feature = "defmt")]
use defmt::trace;

#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "debug-logs", derive(Debug))]
pub(crate) struct HashListEntry {
    pub(crate) hash: ElementHash,
    pub(crate) slot: u8,
}

/// In-memory mirror of one flash sector: its header, the entry state table and a hash list of
/// the element headers stored on it.
pub(crate) struct Page {
    pub(crate) address: u32,
    pub(crate) header: PageHeader,
    states: EntryStateTable,
    hash_list: Vec<HashListEntry>,
    used_count: u8,
    updated_count: u8,
    next_free: u8,
}

impl Page {
    pub(crate) fn uninitialized(address: u32) -> Self {
        Self {
            address,
            header: PageHeader::uninitialized(),
            states: EntryStateTable::erased(),
            hash_list: Vec::new(),
            used_count: 0,
            updated_count: 0,
            next_free: 0,
        }
    }

    /// Mirror of a page read from flash. Counters and the allocation cursor are derived from
    /// the state table, the hash list is filled by the caller.
    pub(crate) fn loaded(address: u32, header: PageHeader, states: EntryStateTable) -> Self {
        let mut page = Self {
            address,
            header,
            states,
            hash_list: Vec::new(),
            used_count: 0,
            updated_count: 0,
            next_free: 0,
        };
        page.recount();
        page
    }

    pub(crate) fn recount(&mut self) {
        let (free, used, updated, illegal) = self.entry_statistics();
        debug_assert_eq!(free + used + updated + illegal, ENTRIES_PER_PAGE as u32);

        self.used_count = used as u8;
        self.updated_count = updated as u8;
        self.next_free = (0..ENTRIES_PER_PAGE as u8)
            .rev()
            .find(|&slot| self.states.get(slot) != EntryState::Free)
            .map_or(0, |slot| slot + 1);
    }

    pub(crate) fn state(&self) -> PageState {
        self.header.state
    }

    pub(crate) fn sequence(&self) -> u32 {
        self.header.ordering_sequence()
    }

    pub(crate) fn entry_address(&self, slot: u8) -> u32 {
        self.address + (ENTRIES_OFFSET + slot as usize * ENTRY_SIZE) as u32
    }

    pub(crate) fn entry_state(&self, slot: u8) -> EntryState {
        self.states.get(slot)
    }

    pub(crate) fn used_count(&self) -> u8 {
        self.used_count
    }

    pub(crate) fn updated_count(&self) -> u8 {
        self.updated_count
    }

    pub(crate) fn next_free(&self) -> u8 {
        self.next_free
    }

    /// Bytes left behind the allocation cursor.
    pub(crate) fn room(&self) -> usize {
        (ENTRIES_PER_PAGE - self.next_free as usize) * ENTRY_SIZE
    }

    pub(crate) fn hash_list(&self) -> &[HashListEntry] {
        &self.hash_list
    }

    pub(crate) fn slots_with_hash(&self, hash: ElementHash) -> impl Iterator<Item = u8> + '_ {
        self.hash_list
            .iter()
            .rev()
            .filter(move |it| it.hash == hash)
            .map(|it| it.slot)
    }

    pub(crate) fn push_hash(&mut self, hash: ElementHash, slot: u8) {
        self.hash_list.push(HashListEntry { hash, slot });
    }

    pub(crate) fn initialize<T: Platform>(
        &mut self,
        io: &mut FlashIo<T>,
        sequence: u32,
    ) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("initialize: @{:#08x} seq {}", self.address, sequence);

        #[cfg(feature = "debug-logs")]
        println!("  page: initialize {:#08x} seq {sequence}", self.address);

        let header = PageHeader::active::<T>(sequence);
        io.write_raw(self.address, &header.encode())?;

        *self = Self::uninitialized(self.address);
        self.header = header;
        Ok(())
    }

    /// Only the state field is rewritten, it is not covered by the header crc.
    pub(crate) fn set_state<T: Platform>(
        &mut self,
        io: &mut FlashIo<T>,
        state: PageState,
    ) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("set_state: @{:#08x}: {}", self.address, state);

        #[cfg(feature = "debug-logs")]
        println!("  page: set_state {:#08x} -> {state}", self.address);

        io.write_raw(
            self.address + PAGE_STATE_OFFSET as u32,
            &(state as u16).to_le_bytes(),
        )?;
        self.header.state = state;
        Ok(())
    }

    pub(crate) fn erase<T: Platform>(&mut self, io: &mut FlashIo<T>) -> Result<(), Error> {
        #[cfg(feature = "debug-logs")]
        println!("  page: erase {:#08x}", self.address);

        io.erase_sector(self.address)?;
        *self = Self::uninitialized(self.address);
        Ok(())
    }

    /// Reserves `count` consecutive slots behind the allocation cursor.
    pub(crate) fn alloc_entries(&mut self, count: usize) -> Option<u8> {
        let start = self.next_free as usize;
        if count == 0 || start + count > ENTRIES_PER_PAGE {
            return None;
        }
        self.next_free = (start + count) as u8;
        Some(start as u8)
    }

    pub(crate) fn mark_used<T: Platform>(
        &mut self,
        io: &mut FlashIo<T>,
        slots: Range<u8>,
    ) -> Result<(), Error> {
        let fresh = slots
            .clone()
            .filter(|&slot| self.states.get(slot) == EntryState::Free)
            .count() as u8;
        self.set_entry_state_range(io, slots, EntryState::Used)?;
        self.used_count += fresh;
        Ok(())
    }

    /// Retires the given slots. Removes the hash list entry of an element header at the start
    /// of the range.
    pub(crate) fn mark_updated<T: Platform>(
        &mut self,
        io: &mut FlashIo<T>,
        slots: Range<u8>,
    ) -> Result<(), Error> {
        let (used, retired) = slots.clone().fold((0u8, 0u8), |(used, retired), slot| {
            match self.states.get(slot) {
                EntryState::Used => (used + 1, retired + 1),
                EntryState::Updated => (used, retired),
                _ => (used, retired + 1),
            }
        });

        self.set_entry_state_range(io, slots.clone(), EntryState::Updated)?;

        self.used_count -= used;
        self.updated_count += retired;
        self.hash_list.retain(|it| it.slot != slots.start);
        if slots.end > self.next_free {
            self.next_free = slots.end;
        }
        Ok(())
    }

    /// Writes an element header followed by its continuation data and marks the whole run used.
    pub(crate) fn write_element<T: Platform>(
        &mut self,
        io: &mut FlashIo<T>,
        entry: &Entry,
        data: &[u8],
    ) -> Result<u8, Error> {
        let span = entry.span();
        let slot = self.alloc_entries(span).ok_or(Error::NoSpace)?;

        #[cfg(feature = "defmt")]
        trace!(
            "write_element: @{:#08x}[{}..{}]",
            self.address,
            slot,
            slot as usize + span
        );

        io.write_entry(self.entry_address(slot), &entry.encode())?;
        if span > 1 {
            io.write_data(self.entry_address(slot + 1), data)?;
        }

        self.mark_used(io, slot..slot + span as u8)?;
        self.push_hash(entry.hash::<T>(), slot);
        Ok(slot)
    }

    /// Reads the decrypted header entry of a slot.
    pub(crate) fn read_entry<T: Platform>(
        &self,
        io: &mut FlashIo<T>,
        slot: u8,
    ) -> Result<Entry, Error> {
        let raw = io.read_entry(self.entry_address(slot))?;
        Ok(Entry::decode::<T>(&raw)?)
    }

    pub(crate) fn read_data<T: Platform>(
        &self,
        io: &mut FlashIo<T>,
        slot: u8,
        entry: &Entry,
    ) -> Result<Vec<u8>, Error> {
        #[cfg(feature = "defmt")]
        trace!(
            "read_data: @{:#08x}[{}..{}]",
            self.address,
            slot + 1,
            slot as usize + entry.span()
        );

        io.read_data(self.entry_address(slot + 1), entry.length as usize)
    }

    pub(crate) fn entry_statistics(&self) -> (u32, u32, u32, u32) {
        let mut free = 0u32;
        let mut used = 0u32;
        let mut updated = 0u32;
        let mut illegal = 0u32;

        for slot in 0..ENTRIES_PER_PAGE as u8 {
            match self.states.get(slot) {
                EntryState::Free => free += 1,
                EntryState::Used => used += 1,
                EntryState::Updated => updated += 1,
                EntryState::Illegal => illegal += 1,
            }
        }

        (free, used, updated, illegal)
    }

    /// Persists the bytes of the state table covering `slots`, widened to the write size.
    fn set_entry_state_range<T: Platform>(
        &mut self,
        io: &mut FlashIo<T>,
        slots: Range<u8>,
        state: EntryState,
    ) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!(
            "set_entry_state_range: @{:#08x}[{}..{}]: {}",
            self.address, slots.start, slots.end, state
        );

        if slots.is_empty() {
            return Ok(());
        }

        self.states.set_range(slots.clone(), state);

        let bytes = EntryStateTable::byte_range(&slots);
        let start = T::align_write_floor(bytes.start);
        let end = T::align_write_ceil(bytes.end).min(self.states.as_bytes().len());

        io.write_raw(
            self.address + (ENTRY_STATE_TABLE_OFFSET + start) as u32,
            &self.states.as_bytes()[start..end],
        )
    }
}

#[cfg(feature = "debug-logs")]
impl Debug for Page {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        let address = self.address;
        let state = self.header.state;
        match state {
            PageState::Active | PageState::Full | PageState::Candidate => f.write_fmt(
                format_args!(
                    "Page {{ address: 0x{address:0>8x}, state: {state}, seq: {}, used: {}, updated: {}, next_free: {}, hashes: {} }}",
                    self.sequence(),
                    self.used_count,
                    self.updated_count,
                    self.next_free,
                    self.hash_list.len()
                ),
            ),
            _ => f.write_fmt(format_args!(
                "Page {{ address: 0x{address:0>8x}, state: {state} }}"
            )),
        }
    }
}
