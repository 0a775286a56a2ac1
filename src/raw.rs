use crate::Key;
use crate::platform::{AlignedOps, Crc, Platform};
use alloc::vec;
use core::ops::Range;
#[cfg(feature = "defmt")]
use defmt::trace;

pub(crate) const FLASH_SECTOR_SIZE: usize = 4096;
pub(crate) const ENTRY_SIZE: usize = 32;
pub(crate) const PAGE_HEADER_SIZE: usize = 32;
pub(crate) const ENTRY_STATE_TABLE_OFFSET: usize = PAGE_HEADER_SIZE;
pub(crate) const ENTRY_STATE_TABLE_SIZE: usize = 32;
pub(crate) const ENTRIES_OFFSET: usize = ENTRY_STATE_TABLE_OFFSET + ENTRY_STATE_TABLE_SIZE;
// header and entry state table take the room of two entries
pub(crate) const ENTRIES_PER_PAGE: usize = FLASH_SECTOR_SIZE / ENTRY_SIZE - 2;

const _: () = assert!(
    ENTRIES_OFFSET + ENTRIES_PER_PAGE * ENTRY_SIZE == FLASH_SECTOR_SIZE,
    "Page structure size must equal flash sector size"
);
const _: () = assert!(ENTRIES_PER_PAGE * 2 <= ENTRY_STATE_TABLE_SIZE * 8);

pub(crate) const PAGE_MAGIC: u32 = 0x4E56_4453; // "NVDS"
pub(crate) const PAGE_VERSION: u16 = 0xFFFF;
pub(crate) const PAGE_STATE_OFFSET: usize = 6;
const SEQUENCE_MASK: u32 = !(1 << 31);

pub(crate) const SMALL_MAX_SIZE: usize = 8;
pub(crate) const MIDDLE_MAX_SIZE: usize = 256;
pub(crate) const BULK_MAX_SIZE: usize = 400 * ENTRY_SIZE;
pub(crate) const FRAGNO_NONE: u8 = 0x1F;
/// Fragment numbers range from 0 to 30, 31 is reserved for "no fragment".
pub(crate) const MAX_FRAGMENTS: u8 = FRAGNO_NONE;

/// Namespace 0 holds the name to index mapping of all other namespaces.
pub(crate) const NAMESPACE_DEFINITIONS: u8 = 0;
/// Used for values stored without a namespace. Never recorded in namespace 0.
pub(crate) const NAMESPACE_DEFAULT: u8 = 0xFE;
pub(crate) const NAMESPACE_MAX_INDEX: u8 = 253;

pub(crate) type RawEntry = [u8; ENTRY_SIZE];

#[derive(strum::FromRepr, strum::Display, Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub(crate) enum EntryState {
    Free = 0b11,
    Used = 0b10,
    Updated = 0b00,
    Illegal = 0b01,
}

/// Two bits per entry, four entries per byte, lowest entry in the lowest bits. This is the same
/// as sixteen entries per little endian 32-bit word.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct EntryStateTable([u8; ENTRY_STATE_TABLE_SIZE]);

impl EntryStateTable {
    pub(crate) const fn erased() -> Self {
        Self([0xFF; ENTRY_STATE_TABLE_SIZE])
    }

    pub(crate) const fn from_bytes(raw: [u8; ENTRY_STATE_TABLE_SIZE]) -> Self {
        Self(raw)
    }

    pub(crate) fn as_bytes(&self) -> &[u8; ENTRY_STATE_TABLE_SIZE] {
        &self.0
    }

    pub(crate) fn get(&self, index: u8) -> EntryState {
        let byte = self.0[index as usize / 4];
        let two_bits = (byte >> ((index % 4) * 2)) & 0b11;

        // every two bit pattern maps to a state
        EntryState::from_repr(two_bits).unwrap_or(EntryState::Illegal)
    }

    /// Bits can only be cleared, which keeps the transitions Free -> Used -> Updated monotonic
    /// and matches what the flash will end up with after programming.
    pub(crate) fn set(&mut self, index: u8, state: EntryState) {
        let shift = (index % 4) * 2;
        let mask = 0b11u8 << shift;
        let bits = (state as u8) << shift;
        self.0[index as usize / 4] &= bits | !mask;
    }

    pub(crate) fn set_range(&mut self, indices: Range<u8>, state: EntryState) {
        for index in indices {
            self.set(index, state);
        }
    }

    /// Byte range of the table touched by the given entry indices.
    pub(crate) fn byte_range(indices: &Range<u8>) -> Range<usize> {
        let start = indices.start as usize / 4;
        let end = (indices.end as usize - 1) / 4 + 1;
        start..end
    }
}

#[derive(strum::FromRepr, strum::Display, Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u16)]
pub(crate) enum PageState {
    // All bits set, default state after flash erase. Page has not been initialized yet.
    Uninitialized = 0xFFFF,

    // Page accepts new entries.
    Active = 0xFFFE,

    // Not enough room left for the next element.
    Full = 0xFFFC,

    // Selected by the garbage collector, live entries are being moved away.
    Candidate = 0xFFF8,

    // Page was found in an unrecoverable state and will be erased before reuse.
    Error = 0xFFF0,

    Invalid = 0x0000,
}

impl From<u16> for PageState {
    fn from(raw: u16) -> Self {
        PageState::from_repr(raw).unwrap_or(PageState::Error)
    }
}

#[derive(strum::FromRepr, strum::Display, Debug, Eq, PartialEq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub(crate) enum ElementType {
    Small = 0,
    Middle = 1,
    Bulk = 2,
    BulkInfo = 3,
    Any = 7,
}

impl ElementType {
    /// Middle elements and bulk fragments are followed by continuation entries holding raw data.
    pub(crate) fn has_continuation(&self) -> bool {
        matches!(self, ElementType::Middle | ElementType::Bulk)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) struct Tag {
    pub(crate) namespace: u8,
    pub(crate) element_type: ElementType,
    pub(crate) fragno: u8,
}

impl Tag {
    const NAMESPACE_MASK: u16 = 0xFF;
    const FRAGNO_SHIFT: u16 = 8;
    const FRAGNO_MASK: u16 = 0x1F;
    const TYPE_SHIFT: u16 = 13;
    const TYPE_MASK: u16 = 0x7;

    pub(crate) fn new(namespace: u8, element_type: ElementType) -> Self {
        Self {
            namespace,
            element_type,
            fragno: FRAGNO_NONE,
        }
    }

    pub(crate) fn fragment(namespace: u8, fragno: u8) -> Self {
        Self {
            namespace,
            element_type: ElementType::Bulk,
            fragno,
        }
    }

    pub(crate) fn to_raw(self) -> u16 {
        (self.namespace as u16 & Self::NAMESPACE_MASK)
            | ((self.fragno as u16 & Self::FRAGNO_MASK) << Self::FRAGNO_SHIFT)
            | ((self.element_type as u16 & Self::TYPE_MASK) << Self::TYPE_SHIFT)
    }

    /// Returns `None` for the three undefined element type codes.
    pub(crate) fn from_raw(raw: u16) -> Option<Self> {
        let element_type =
            ElementType::from_repr(((raw >> Self::TYPE_SHIFT) & Self::TYPE_MASK) as u8)?;
        Some(Self {
            namespace: (raw & Self::NAMESPACE_MASK) as u8,
            element_type,
            fragno: ((raw >> Self::FRAGNO_SHIFT) & Self::FRAGNO_MASK) as u8,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PageHeader {
    pub(crate) magic: u32,
    pub(crate) version: u16,
    pub(crate) state: PageState,
    pub(crate) sequence: u32,
    pub(crate) crc: u32,
}

impl PageHeader {
    pub(crate) fn uninitialized() -> Self {
        Self {
            magic: u32::MAX,
            version: u16::MAX,
            state: PageState::Uninitialized,
            sequence: u32::MAX,
            crc: u32::MAX,
        }
    }

    pub(crate) fn active<C: Crc>(sequence: u32) -> Self {
        let mut header = Self {
            magic: PAGE_MAGIC,
            version: PAGE_VERSION,
            state: PageState::Active,
            sequence,
            crc: 0,
        };
        header.crc = Self::calculate_crc32::<C>(&header.encode());
        header
    }

    pub(crate) fn encode(&self) -> [u8; PAGE_HEADER_SIZE] {
        let mut raw = [0xFFu8; PAGE_HEADER_SIZE];
        raw[0..4].copy_from_slice(&self.magic.to_le_bytes());
        raw[4..6].copy_from_slice(&self.version.to_le_bytes());
        raw[6..8].copy_from_slice(&(self.state as u16).to_le_bytes());
        raw[8..12].copy_from_slice(&self.sequence.to_le_bytes());
        raw[28..32].copy_from_slice(&self.crc.to_le_bytes());
        raw
    }

    pub(crate) fn decode(raw: &[u8; PAGE_HEADER_SIZE]) -> Self {
        Self {
            magic: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            version: u16::from_le_bytes([raw[4], raw[5]]),
            state: PageState::from(u16::from_le_bytes([raw[6], raw[7]])),
            sequence: u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]),
            crc: u32::from_le_bytes([raw[28], raw[29], raw[30], raw[31]]),
        }
    }

    /// The state field is excluded so the page state can be advanced without rewriting the crc.
    pub(crate) fn calculate_crc32<C: Crc>(raw: &[u8; PAGE_HEADER_SIZE]) -> u32 {
        let crc = C::crc32(0, &raw[..PAGE_STATE_OFFSET]);
        C::crc32(crc, &raw[8..28])
    }

    /// Sequence number used for ordering, the top bit is ignored.
    pub(crate) fn ordering_sequence(&self) -> u32 {
        self.sequence & SEQUENCE_MASK
    }
}

/// The 8-byte value field of an entry, interpreted according to the element type of its tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryValue {
    Inline([u8; SMALL_MAX_SIZE]),
    Varlen { data_crc: u32 },
    BulkInfo { size: u32 },
}

impl EntryValue {
    fn encode(&self) -> [u8; 8] {
        let mut raw = [0xFFu8; 8];
        match self {
            EntryValue::Inline(bytes) => raw.copy_from_slice(bytes),
            EntryValue::Varlen { data_crc } => raw[4..8].copy_from_slice(&data_crc.to_le_bytes()),
            EntryValue::BulkInfo { size } => raw[4..8].copy_from_slice(&size.to_le_bytes()),
        }
        raw
    }

    fn decode(element_type: ElementType, raw: &[u8]) -> Self {
        let upper = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
        match element_type {
            ElementType::Middle | ElementType::Bulk => EntryValue::Varlen { data_crc: upper },
            ElementType::BulkInfo => EntryValue::BulkInfo { size: upper },
            ElementType::Small | ElementType::Any => {
                let mut bytes = [0u8; SMALL_MAX_SIZE];
                bytes.copy_from_slice(&raw[..SMALL_MAX_SIZE]);
                EntryValue::Inline(bytes)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CrcMismatch;

/// A decoded 32-byte header entry: tag | length | crc32 | key[16] | value[8].
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Entry {
    pub(crate) tag: Tag,
    pub(crate) length: u16,
    pub(crate) crc: u32,
    pub(crate) key: Key,
    pub(crate) value: EntryValue,
}

impl Entry {
    pub(crate) fn new<C: Crc>(tag: Tag, length: u16, key: Key, value: EntryValue) -> Self {
        let mut entry = Self {
            tag,
            length,
            crc: 0,
            key,
            value,
        };
        entry.crc = Self::calculate_crc32::<C>(&entry.encode());
        entry
    }

    pub(crate) fn small<C: Crc>(namespace: u8, key: Key, data: &[u8]) -> Self {
        let mut inline = [0xFFu8; SMALL_MAX_SIZE];
        inline[..data.len()].copy_from_slice(data);
        Self::new::<C>(
            Tag::new(namespace, ElementType::Small),
            data.len() as u16,
            key,
            EntryValue::Inline(inline),
        )
    }

    pub(crate) fn encode(&self) -> RawEntry {
        let mut raw = [0xFFu8; ENTRY_SIZE];
        raw[0..2].copy_from_slice(&self.tag.to_raw().to_le_bytes());
        raw[2..4].copy_from_slice(&self.length.to_le_bytes());
        raw[4..8].copy_from_slice(&self.crc.to_le_bytes());
        raw[8..24].copy_from_slice(&self.key.to_flash_field());
        raw[24..32].copy_from_slice(&self.value.encode());
        raw
    }

    /// Decodes a header entry, the crc is checked against the raw bytes so reserved fields with
    /// unexpected content still validate.
    pub(crate) fn decode<C: Crc>(raw: &RawEntry) -> Result<Self, CrcMismatch> {
        let crc = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
        if crc != Self::calculate_crc32::<C>(raw) {
            return Err(CrcMismatch);
        }

        // an undefined element type can only come from a corrupted tag
        let tag = Tag::from_raw(u16::from_le_bytes([raw[0], raw[1]])).ok_or(CrcMismatch)?;

        let mut key = [0u8; 16];
        key.copy_from_slice(&raw[8..24]);

        Ok(Self {
            tag,
            length: u16::from_le_bytes([raw[2], raw[3]]),
            crc,
            key: Key::from_flash_field(&key),
            value: EntryValue::decode(tag.element_type, &raw[24..32]),
        })
    }

    pub(crate) fn calculate_crc32<C: Crc>(raw: &RawEntry) -> u32 {
        let mut crc = C::crc32(0, &raw[0..4]);
        crc = C::crc32(crc, &raw[8..24]);
        C::crc32(crc, &raw[24..32])
    }

    /// Number of raw data entries following this header entry.
    pub(crate) fn continuation_count(&self) -> usize {
        if self.tag.element_type.has_continuation() {
            continuation_count(self.length as usize)
        } else {
            0
        }
    }

    /// Header plus continuation entries.
    pub(crate) fn span(&self) -> usize {
        1 + self.continuation_count()
    }

    pub(crate) fn data_crc(&self) -> Option<u32> {
        match self.value {
            EntryValue::Varlen { data_crc } => Some(data_crc),
            _ => None,
        }
    }

    pub(crate) fn bulk_size(&self) -> Option<u32> {
        match self.value {
            EntryValue::BulkInfo { size } => Some(size),
            _ => None,
        }
    }

    pub(crate) fn hash<C: Crc>(&self) -> ElementHash {
        element_hash::<C>(self.tag.namespace, &self.key)
    }
}

pub(crate) fn continuation_count(data_len: usize) -> usize {
    data_len.div_ceil(ENTRY_SIZE)
}

/// Crc of namespace and key name truncated to 24 bits. Keeps the per-page lookup lists small,
/// collisions are resolved by reading the entry.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) struct ElementHash([u8; 3]);

impl ElementHash {
    fn from_crc(crc: u32) -> Self {
        let [a, b, c, _] = crc.to_le_bytes();
        Self([a, b, c])
    }
}

/// All entries of one element share the same hash, so bulk fragments are found with the hash
/// of their key and told apart by their tag afterwards.
pub(crate) fn element_hash<C: Crc>(namespace: u8, key: &Key) -> ElementHash {
    let crc = C::crc32(0, &[namespace]);
    ElementHash::from_crc(C::crc32(crc, key.name()))
}

pub(crate) fn data_crc32<C: Crc>(data: &[u8]) -> u32 {
    C::crc32(0, data)
}

/// Writes `bytes` at an arbitrary offset. Leading and trailing bytes needed to satisfy
/// `WRITE_SIZE` are padded with 0xFF, which leaves the flash content untouched.
#[inline(always)]
pub(crate) fn write_aligned<T: Platform>(
    hal: &mut T,
    offset: u32,
    bytes: &[u8],
) -> Result<(), T::Error> {
    #[cfg(feature = "defmt")]
    trace!("write_aligned @{:#08x}: [{}]", offset, bytes.len());

    if bytes.is_empty() {
        return Ok(());
    }

    let lead = offset as usize - T::align_write_floor(offset as usize);
    if lead == 0 && bytes.len().is_multiple_of(T::WRITE_SIZE) {
        return hal.write(offset, bytes);
    }

    if lead == 0 {
        let pivot = T::align_write_floor(bytes.len());
        let header = &bytes[..pivot];
        let trailer = &bytes[pivot..];
        if !header.is_empty() {
            hal.write(offset, header)?;
        }

        // no need to write the trailer if remaining data is all ones - this the default state of the flash
        if trailer.iter().any(|&e| e != 0xFF) {
            let mut buf = vec![0xFFu8; T::WRITE_SIZE];
            buf[..trailer.len()].copy_from_slice(trailer);
            hal.write(offset + (pivot as u32), &buf)?
        }

        return Ok(());
    }

    let mut buf = vec![0xFFu8; T::align_write_ceil(lead + bytes.len())];
    buf[lead..lead + bytes.len()].copy_from_slice(bytes);
    hal.write(offset - lead as u32, &buf)
}
