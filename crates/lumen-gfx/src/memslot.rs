//! Translation of untrusted guest physical addresses into byte spans.
//!
//! A guest physical address is a 64-bit integer whose high bits encode a
//! `(group, slot)` pair and whose low bits are an offset into the slot's
//! registered window. Every dereference is validated; faults are values,
//! never panics, and translation is a pure function of the slot table.

use bytes::Bytes;
use thiserror::Error;

use crate::chunk::MAX_DATA_CHUNK;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemSlotError {
    #[error("memslot group {group} out of range (have {num_groups})")]
    InvalidGroup { group: u64, num_groups: usize },

    #[error("memslot {slot} in group {group} is not registered")]
    InvalidSlot { group: u64, slot: u64 },

    #[error("guest address 0x{addr:x} wraps during translation")]
    AddressOverflow { addr: u64 },

    #[error("guest span 0x{addr:x}+{len} escapes its memslot window")]
    OutOfRange { addr: u64, len: u64 },

    #[error("guest span length {len} exceeds the per-command cap")]
    LenTooLarge { len: u64 },
}

pub type MemSlotResult<T> = Result<T, MemSlotError>;

/// Bit widths used to split a guest physical address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressLayout {
    pub group_bits: u32,
    pub slot_bits: u32,
}

impl AddressLayout {
    pub fn new(group_bits: u32, slot_bits: u32) -> Self {
        debug_assert!(group_bits + slot_bits < 64);
        Self {
            group_bits,
            slot_bits,
        }
    }

    /// Splits `addr` into `(group, slot, offset)`.
    pub fn split(&self, addr: u64) -> (u64, u64, u64) {
        let offset_bits = 64 - self.group_bits - self.slot_bits;
        let group = if self.group_bits == 0 {
            0
        } else {
            addr >> (64 - self.group_bits)
        };
        let slot = if self.slot_bits == 0 {
            0
        } else {
            (addr >> offset_bits) & ((1u64 << self.slot_bits) - 1)
        };
        let offset = addr & ((1u64 << offset_bits) - 1);
        (group, slot, offset)
    }
}

/// One registered guest memory window covering `[base, base + len)` of
/// the host-virtual view.
#[derive(Debug, Clone)]
pub struct MemSlot {
    /// Virtual start of the window; translated addresses land at
    /// `base + offset + delta`.
    base: u64,
    /// Added to the in-slot offset before range checking.
    delta: u64,
    data: Bytes,
}

impl MemSlot {
    pub fn new(base: u64, delta: u64, data: Bytes) -> Self {
        Self { base, delta, data }
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// One past the last virtual address of the window; `None` when the
    /// registration itself wraps.
    fn virt_end(&self) -> Option<u64> {
        self.base.checked_add(self.len())
    }
}

/// The slot registry one worker consults for every guest pointer.
#[derive(Debug)]
pub struct MemSlotTable {
    layout: AddressLayout,
    groups: Vec<Vec<Option<MemSlot>>>,
}

impl MemSlotTable {
    pub fn new(num_groups: usize, slots_per_group: usize, layout: AddressLayout) -> Self {
        Self {
            layout,
            groups: vec![vec![None; slots_per_group]; num_groups],
        }
    }

    pub fn layout(&self) -> AddressLayout {
        self.layout
    }

    pub fn add_slot(&mut self, group: usize, slot: usize, window: MemSlot) {
        self.groups[group][slot] = Some(window);
    }

    pub fn del_slot(&mut self, group: usize, slot: usize) {
        self.groups[group][slot] = None;
    }

    /// Slot id encoded in `addr` (no validation of the rest).
    pub fn slot_id(&self, addr: u64) -> u64 {
        self.layout.split(addr).1
    }

    fn slot(&self, addr: u64) -> MemSlotResult<(&MemSlot, u64)> {
        let (group, slot, offset) = self.layout.split(addr);
        let slots = self
            .groups
            .get(group as usize)
            .ok_or(MemSlotError::InvalidGroup {
                group,
                num_groups: self.groups.len(),
            })?;
        let window = slots
            .get(slot as usize)
            .and_then(Option::as_ref)
            .ok_or(MemSlotError::InvalidSlot { group, slot })?;
        Ok((window, offset))
    }

    /// Validates `[addr, addr + len)` and returns the backing bytes.
    ///
    /// The translated span `[base + offset + delta, .. + len)` must lie
    /// inside the slot's window. All arithmetic is unsigned 64-bit; a
    /// wrapped end or a length above [`MAX_DATA_CHUNK`] is a fault, not a
    /// truncation.
    pub fn validate(&self, addr: u64, len: u64) -> MemSlotResult<&[u8]> {
        if len > MAX_DATA_CHUNK {
            return Err(MemSlotError::LenTooLarge { len });
        }
        let (window, offset) = self.slot(addr)?;
        let virt = offset
            .checked_add(window.delta)
            .and_then(|adjusted| window.base.checked_add(adjusted))
            .ok_or(MemSlotError::AddressOverflow { addr })?;
        let end = virt
            .checked_add(len)
            .ok_or(MemSlotError::AddressOverflow { addr })?;
        let window_end = window
            .virt_end()
            .ok_or(MemSlotError::AddressOverflow { addr })?;
        if end > window_end {
            return Err(MemSlotError::OutOfRange { addr, len });
        }
        let start = (virt - window.base) as usize;
        Ok(&window.data[start..start + len as usize])
    }

    /// Bytes available from `addr` to the end of its slot window.
    pub fn max_size_from(&self, addr: u64) -> MemSlotResult<u64> {
        let (window, offset) = self.slot(addr)?;
        let virt = offset
            .checked_add(window.delta)
            .and_then(|adjusted| window.base.checked_add(adjusted))
            .ok_or(MemSlotError::AddressOverflow { addr })?;
        let window_end = window
            .virt_end()
            .ok_or(MemSlotError::AddressOverflow { addr })?;
        if virt > window_end {
            return Err(MemSlotError::OutOfRange { addr, len: 0 });
        }
        Ok(window_end - virt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with_one_slot(data_len: usize, delta: u64) -> MemSlotTable {
        let mut table = MemSlotTable::new(1, 2, AddressLayout::new(2, 8));
        table.add_slot(0, 1, MemSlot::new(0, delta, Bytes::from(vec![0xaa; data_len])));
        table
    }

    /// Builds an address for group 0, slot 1 with the test layout.
    fn addr(offset: u64) -> u64 {
        (1u64 << (64 - 2 - 8)) | offset
    }

    #[test]
    fn validate_in_range() {
        let table = table_with_one_slot(64, 0);
        let span = table.validate(addr(8), 16).unwrap();
        assert_eq!(span.len(), 16);
    }

    #[test]
    fn validate_rejects_escape() {
        let table = table_with_one_slot(64, 0);
        assert!(matches!(
            table.validate(addr(60), 8),
            Err(MemSlotError::OutOfRange { .. })
        ));
    }

    #[test]
    fn validate_rejects_unregistered_slot() {
        let table = table_with_one_slot(64, 0);
        assert!(matches!(
            table.validate(0, 1),
            Err(MemSlotError::InvalidSlot { group: 0, slot: 0 })
        ));
        let bad_group = 1u64 << 62;
        assert!(matches!(
            table.validate(bad_group, 1),
            Err(MemSlotError::InvalidGroup { .. })
        ));
    }

    #[test]
    fn window_base_anchors_the_virtual_range() {
        // A window starting at a nonzero virtual base serves the same
        // bytes and enforces the same bounds.
        let mut table = MemSlotTable::new(1, 2, AddressLayout::new(2, 8));
        let mut bytes = vec![0u8; 64];
        bytes[8] = 0x5a;
        table.add_slot(0, 1, MemSlot::new(0x10_0000, 0, Bytes::from(bytes)));

        let span = table.validate(addr(8), 4).unwrap();
        assert_eq!(span[0], 0x5a);
        assert!(matches!(
            table.validate(addr(60), 8),
            Err(MemSlotError::OutOfRange { .. })
        ));
        assert_eq!(table.max_size_from(addr(16)).unwrap(), 48);

        // A registration whose end wraps the address space can never
        // validate anything.
        let mut table = MemSlotTable::new(1, 2, AddressLayout::new(2, 8));
        table.add_slot(0, 1, MemSlot::new(u64::MAX - 16, 0, Bytes::from(vec![0u8; 64])));
        assert!(matches!(
            table.validate(addr(0), 4),
            Err(MemSlotError::AddressOverflow { .. })
        ));
    }

    #[test]
    fn validate_rejects_wrap_and_oversize() {
        let table = table_with_one_slot(64, u64::MAX - 4);
        assert!(matches!(
            table.validate(addr(16), 8),
            Err(MemSlotError::AddressOverflow { .. })
        ));
        let table = table_with_one_slot(64, 0);
        assert!(matches!(
            table.validate(addr(0), MAX_DATA_CHUNK + 1),
            Err(MemSlotError::LenTooLarge { .. })
        ));
    }

    #[test]
    fn validate_is_idempotent() {
        let table = table_with_one_slot(64, 0);
        let a = table.validate(addr(4), 8).map(<[u8]>::to_vec);
        let b = table.validate(addr(4), 8).map(<[u8]>::to_vec);
        assert_eq!(a, b);
    }

    #[test]
    fn max_size_from_counts_to_window_end() {
        let table = table_with_one_slot(64, 0);
        assert_eq!(table.max_size_from(addr(16)).unwrap(), 48);
        assert_eq!(table.max_size_from(addr(64)).unwrap(), 0);
        assert!(table.max_size_from(addr(65)).is_err());
    }
}
