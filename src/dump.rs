//! Human readable representation of a mounted region, meant for consoles and logs.

use crate::Key;
use crate::error::Error;
use crate::internal::Store;
use crate::platform::Platform;
use crate::raw::{ElementType, Entry, EntryValue};
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::{self, Write};

/// Slot and entry of every element of a page, `None` for entries which failed to decode.
type PageEntries = Vec<(u8, Option<Entry>)>;

fn display_name(key: &Key) -> &str {
    core::str::from_utf8(key.name()).unwrap_or("<binary>")
}

impl<T: Platform> Store<T> {
    pub(crate) fn dump(&mut self, verbose: bool, namespace: Option<&Key>) -> Result<String, Error> {
        let mut out = String::new();
        match namespace {
            Some(name) => {
                let index = self.resolve_namespace(Some(name))?;
                let keys = self.keys(Some(name))?;
                write_namespace(&mut out, name, index, &keys)
            }
            None => {
                let entries = if verbose {
                    self.read_entries()?
                } else {
                    Vec::new()
                };
                self.write_region(&mut out, &entries)
            }
        }
        .map_err(|_| Error::Fail)?;
        Ok(out)
    }

    /// Entries of the pages in use, in the order the pages were written.
    fn read_entries(&mut self) -> Result<Vec<PageEntries>, Error> {
        let mut pages = Vec::with_capacity(self.used.len());
        for position in 0..self.used.len() {
            let page_index = self.used[position];
            let slots: Vec<u8> = self.pages[page_index]
                .hash_list()
                .iter()
                .map(|it| it.slot)
                .collect();

            let mut entries = Vec::with_capacity(slots.len());
            for slot in slots {
                match self.pages[page_index].read_entry(&mut self.io, slot) {
                    Ok(entry) => entries.push((slot, Some(entry))),
                    Err(Error::NotFound) => entries.push((slot, None)),
                    Err(e) => return Err(e),
                }
            }
            pages.push(entries);
        }
        Ok(pages)
    }

    fn write_region(&self, out: &mut String, entries: &[PageEntries]) -> fmt::Result {
        writeln!(
            out,
            "region \"{}\" @{:#010x}, {} sectors{}",
            self.region.label(),
            self.region.base(),
            self.region.sectors(),
            if self.io.is_encrypted() { ", encrypted" } else { "" }
        )?;

        writeln!(out, "pages in use:")?;
        for (position, &page_index) in self.used.iter().enumerate() {
            let page = &self.pages[page_index];
            writeln!(
                out,
                "  @{:#010x} seq {} {}: used {}, updated {}, next free {}",
                page.address,
                page.sequence(),
                page.state(),
                page.used_count(),
                page.updated_count(),
                page.next_free()
            )?;

            if let Some(page_entries) = entries.get(position) {
                for (slot, entry) in page_entries {
                    write_entry(out, *slot, entry.as_ref())?;
                }
            }
        }

        write!(out, "free pages:")?;
        for &page_index in &self.free {
            let page = &self.pages[page_index];
            write!(out, " @{:#010x} ({})", page.address, page.state())?;
        }
        writeln!(out)?;

        writeln!(out, "namespaces:")?;
        for namespace in self.namespaces.iter() {
            writeln!(
                out,
                "  \"{}\" ({}): {} keys",
                display_name(&namespace.name),
                namespace.index,
                namespace.live_keys
            )?;
        }
        Ok(())
    }
}

fn write_entry(out: &mut String, slot: u8, entry: Option<&Entry>) -> fmt::Result {
    let Some(entry) = entry else {
        return writeln!(out, "    [{slot:>3}] <corrupt>");
    };

    write!(
        out,
        "    [{slot:>3}] ns {:>3} {:<8} len {:>5} \"{}\"",
        entry.tag.namespace,
        entry.tag.element_type,
        entry.length,
        display_name(&entry.key)
    )?;

    match (entry.tag.element_type, &entry.value) {
        (ElementType::Small, EntryValue::Inline(bytes)) => {
            let len = (entry.length as usize).min(bytes.len());
            write!(out, " {:02x?}", &bytes[..len])?;
        }
        (ElementType::Bulk, _) => write!(out, " fragment {}", entry.tag.fragno)?,
        (ElementType::BulkInfo, EntryValue::BulkInfo { size }) => write!(out, " size {size}")?,
        _ => {}
    }
    writeln!(out)
}

fn write_namespace(out: &mut String, name: &Key, index: u8, keys: &[(Key, usize)]) -> fmt::Result {
    writeln!(out, "namespace \"{}\" ({index}):", display_name(name))?;
    for (key, len) in keys {
        writeln!(out, "  \"{}\": {len} bytes", display_name(key))?;
    }
    Ok(())
}
