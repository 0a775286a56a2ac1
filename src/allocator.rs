//! Page allocation and garbage collection.
//!
//! Pages in use are ordered by sequence number, the newest one is the only page accepting
//! writes. As soon as the last free page is about to be handed out, the page with the fewest
//! live entries is selected as victim, its live entries are moved to the new page and the
//! victim is erased and returned to the free list.

use crate::error::Error;
use crate::internal::Store;
use crate::platform::Platform;
use crate::raw::{ENTRIES_PER_PAGE, Entry, EntryState, PageState};
#[cfg(feature = "defmt")]
use defmt::{trace, warn};

impl<T: Platform> Store<T> {
    pub(crate) fn next_sequence(&self) -> u32 {
        self.used
            .iter()
            .map(|&idx| self.pages[idx].sequence())
            .max()
            .map_or(0, |sequence| sequence + 1)
    }

    /// Returns the active tail page if it has `required` bytes of room, otherwise marks it full
    /// and requests new pages until one fits.
    pub(crate) fn tail_page_with_room(&mut self, required: usize) -> Result<usize, Error> {
        // every request recycles at most one page, so this bounds the number of attempts
        for _ in 0..=self.pages.len() {
            if let Some(&tail) = self.used.last() {
                let page = &mut self.pages[tail];
                if page.state() == PageState::Active {
                    if page.room() >= required {
                        return Ok(tail);
                    }
                    page.set_state(&mut self.io, PageState::Full)?;
                }
            }

            let sequence = self.next_sequence();
            self.new_page_request(sequence)?;
        }

        #[cfg(feature = "defmt")]
        warn!("no page with {} bytes of room", required);

        Err(Error::NoSpace)
    }

    /// Activates a free page with the given sequence number and appends it to the pages in
    /// use. Takes the last free page only together with a victim page which is collected
    /// right away.
    ///
    /// The victim is marked as candidate before the new page is touched, so the collection can
    /// be finished when mounting no matter where it was interrupted.
    pub(crate) fn new_page_request(&mut self, sequence: u32) -> Result<usize, Error> {
        #[cfg(feature = "defmt")]
        trace!("new_page_request: seq {}", sequence);

        #[cfg(feature = "debug-logs")]
        println!("allocator: new_page_request seq {sequence}, free {}", self.free.len());

        if self.free.is_empty() {
            return Err(Error::NoSpace);
        }

        let victim = if self.free.len() == 1 {
            let victim = self.select_victim()?;
            self.pages[victim].set_state(&mut self.io, PageState::Candidate)?;
            self.used.retain(|&idx| idx != victim);
            Some(victim)
        } else {
            None
        };

        let page_index = self.activate_free_page(sequence)?;

        if let Some(victim) = victim {
            self.collect_garbage(victim, page_index)?;
        }

        Ok(page_index)
    }

    pub(crate) fn activate_free_page(&mut self, sequence: u32) -> Result<usize, Error> {
        let page_index = self.free.pop_front().ok_or(Error::NoSpace)?;
        let page = &mut self.pages[page_index];
        if page.state() != PageState::Uninitialized {
            page.erase(&mut self.io)?;
        }
        page.initialize(&mut self.io, sequence)?;
        self.used.push(page_index);
        Ok(page_index)
    }

    /// The page in use with the fewest used entries, the first one found on a tie.
    fn select_victim(&self) -> Result<usize, Error> {
        self.used
            .iter()
            .copied()
            .filter(|&idx| (self.pages[idx].used_count() as usize) < ENTRIES_PER_PAGE)
            .min_by_key(|&idx| self.pages[idx].used_count())
            .ok_or(Error::NoSpace)
    }

    fn collect_garbage(&mut self, victim: usize, target: usize) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!(
            "collect_garbage: @{:#08x} -> @{:#08x}",
            self.pages[victim].address, self.pages[target].address
        );

        #[cfg(feature = "debug-logs")]
        println!(
            "allocator: collect {:#08x} ({} used) -> {:#08x}",
            self.pages[victim].address,
            self.pages[victim].used_count(),
            self.pages[target].address
        );

        self.move_live_entries(victim, target)?;
        self.pages[victim].erase(&mut self.io)?;
        self.free.push_back(victim);
        Ok(())
    }

    /// Copies every live element of `source` behind the allocation cursor of `target`. Entries
    /// are copied as stored, the state table of `target` is updated once at the end.
    fn move_live_entries(&mut self, source: usize, target: usize) -> Result<(), Error> {
        let first = self.pages[target].next_free();

        let mut slot = 0u8;
        while (slot as usize) < ENTRIES_PER_PAGE {
            if self.pages[source].entry_state(slot) != EntryState::Used {
                slot += 1;
                continue;
            }

            let entry = match self.pages[source].read_entry(&mut self.io, slot) {
                Ok(entry) if slot as usize + entry.span() <= ENTRIES_PER_PAGE => entry,
                Ok(_) | Err(Error::NotFound) => {
                    #[cfg(feature = "defmt")]
                    warn!(
                        "skipping corrupt entry @{:#08x}[{}]",
                        self.pages[source].address, slot
                    );
                    slot += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let span = entry.span();
            let run = self.read_stored_run(source, slot, span)?;

            let target_page = &mut self.pages[target];
            let target_slot = target_page.alloc_entries(span).ok_or(Error::NoSpace)?;
            self.io
                .write_raw(target_page.entry_address(target_slot), &run)?;
            target_page.push_hash(Entry::hash::<T>(&entry), target_slot);

            slot += span as u8;
        }

        let last = self.pages[target].next_free();
        self.pages[target].mark_used(&mut self.io, first..last)
    }
}

