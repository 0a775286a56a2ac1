use crate::Key;
use crate::element::Lookup;
use crate::error::Error;
use crate::internal::Store;
use crate::platform::Platform;
use crate::raw::{NAMESPACE_DEFAULT, NAMESPACE_DEFINITIONS, NAMESPACE_MAX_INDEX};
use alloc::vec::Vec;
#[cfg(feature = "defmt")]
use defmt::trace;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Namespace {
    pub(crate) name: Key,
    pub(crate) index: u8,
    pub(crate) live_keys: u32,
}

/// Name to index mapping of all namespaces, mirrored from the records in namespace 0.
pub(crate) struct Namespaces {
    list: Vec<Namespace>,
    // one bit per index, index 0 is never handed out
    bitmap: [u32; 8],
}

impl Namespaces {
    pub(crate) const fn new() -> Self {
        Self {
            list: Vec::new(),
            bitmap: [0; 8],
        }
    }

    pub(crate) fn clear(&mut self) {
        self.list.clear();
        self.bitmap = [0; 8];
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Namespace> {
        self.list.iter()
    }

    pub(crate) fn lookup(&self, name: &Key) -> Option<&Namespace> {
        self.list.iter().find(|it| it.name == *name)
    }

    pub(crate) fn get(&self, index: u8) -> Option<&Namespace> {
        self.list.iter().find(|it| it.index == index)
    }

    fn is_taken(&self, index: u8) -> bool {
        self.bitmap[index as usize / 32] & (1 << (index % 32)) != 0
    }

    /// Lowest index not handed out yet.
    pub(crate) fn next_free_index(&self) -> Option<u8> {
        (1..=NAMESPACE_MAX_INDEX).find(|&index| !self.is_taken(index))
    }

    /// Returns false if either the name or the index is already known.
    pub(crate) fn insert(&mut self, name: Key, index: u8) -> bool {
        if !(1..=NAMESPACE_MAX_INDEX).contains(&index)
            || self.is_taken(index)
            || self.lookup(&name).is_some()
        {
            return false;
        }

        self.bitmap[index as usize / 32] |= 1 << (index % 32);
        self.list.push(Namespace {
            name,
            index,
            live_keys: 0,
        });
        true
    }

    pub(crate) fn remove(&mut self, index: u8) -> Option<Namespace> {
        let position = self.list.iter().position(|it| it.index == index)?;
        self.bitmap[index as usize / 32] &= !(1 << (index % 32));
        Some(self.list.swap_remove(position))
    }

    pub(crate) fn increment(&mut self, index: u8) {
        if let Some(namespace) = self.list.iter_mut().find(|it| it.index == index) {
            namespace.live_keys += 1;
        }
    }

    /// Returns the remaining number of live keys, `None` for indices without accounting.
    pub(crate) fn decrement(&mut self, index: u8) -> Option<u32> {
        let namespace = self.list.iter_mut().find(|it| it.index == index)?;
        namespace.live_keys = namespace.live_keys.saturating_sub(1);
        Some(namespace.live_keys)
    }
}

impl<T: Platform> Store<T> {
    /// Index of an existing namespace, `None` selects the default namespace.
    pub(crate) fn resolve_namespace(&self, namespace: Option<&Key>) -> Result<u8, Error> {
        match namespace {
            None => Ok(NAMESPACE_DEFAULT),
            Some(name) => {
                validate_name(name)?;
                self.namespaces
                    .lookup(name)
                    .map(|it| it.index)
                    .ok_or(Error::NotFound)
            }
        }
    }

    pub(crate) fn resolve_or_create_namespace(
        &mut self,
        namespace: Option<&Key>,
    ) -> Result<u8, Error> {
        match self.resolve_namespace(namespace) {
            Err(Error::NotFound) => {}
            other => return other,
        }

        let Some(name) = namespace else {
            return Err(Error::Fail);
        };

        let index = self.namespaces.next_free_index().ok_or(Error::NoSpace)?;

        #[cfg(feature = "defmt")]
        trace!("create_namespace: {}", index);

        #[cfg(feature = "debug-logs")]
        println!("namespace: create {name:?} -> {index}");

        self.write_small(NAMESPACE_DEFINITIONS, name, &[index])?;
        self.namespaces.insert(*name, index);
        Ok(index)
    }

    /// Drops the namespace record. Elements still stored under the index become unreachable.
    pub(crate) fn release_namespace(&mut self, index: u8) -> Result<(), Error> {
        let Some(namespace) = self.namespaces.remove(index) else {
            return Ok(());
        };

        #[cfg(feature = "debug-logs")]
        println!("namespace: release {:?} ({index})", namespace.name);

        if let Some(record) =
            self.find_element(NAMESPACE_DEFINITIONS, &namespace.name, Lookup::Value)?
        {
            self.delete_element(&record)?;
        }
        Ok(())
    }

    pub(crate) fn release_namespace_if_empty(&mut self, index: u8) -> Result<(), Error> {
        match self.namespaces.get(index) {
            Some(namespace) if namespace.live_keys == 0 => self.release_namespace(index),
            _ => Ok(()),
        }
    }

    /// Retires every element of the namespace, then the namespace itself.
    pub(crate) fn delete_namespace(&mut self, name: &Key) -> Result<(), Error> {
        let index = self.resolve_namespace(Some(name))?;

        #[cfg(feature = "defmt")]
        trace!("delete_namespace: {}", index);

        for element in self.live_elements()? {
            if element.entry.tag.namespace == index {
                self.retire(&element)?;
            }
        }

        self.release_namespace(index)
    }

    /// Index and live key count, the namespace is created if it doesn't exist yet.
    pub(crate) fn namespace_info(&mut self, name: &Key) -> Result<(u8, u32), Error> {
        let index = self.resolve_or_create_namespace(Some(name))?;
        let live_keys = self
            .namespaces
            .get(index)
            .map(|it| it.live_keys)
            .ok_or(Error::Fail)?;
        Ok((index, live_keys))
    }
}

pub(crate) fn validate_name(name: &Key) -> Result<(), Error> {
    if name.is_valid() {
        Ok(())
    } else {
        Err(Error::InvalidParam)
    }
}
