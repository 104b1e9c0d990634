//! Handler placement and lookup across the three storage tiers.
//!
//! A registration lands in exactly one of: the exact-address hash table, the
//! 1 MiB flat IO table, or the IO two-level sparse map, chosen automatically
//! from its range and alignment. Lookup probes the tiers in that order.
//! Duplicate registration at the same exact position is a fatal device-model
//! configuration error.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use super::{IoFlags, NativeWidth, Registration};
use crate::map::{FIRST_LEVEL_SLOTS, FIRST_LEVEL_SPAN};

const FIRST_LEVEL_SHIFT: u32 = FIRST_LEVEL_SPAN.trailing_zeros();
const FIRST_LEVEL_MASK: u32 = FIRST_LEVEL_SPAN - 1;

struct IoTable {
    slots: Vec<Option<Registration>>,
    used: usize,
}

impl IoTable {
    fn new(entries: usize) -> Box<Self> {
        Box::new(Self {
            slots: vec![None; entries],
            used: 0,
        })
    }
}

pub(crate) struct IoRegistry {
    granule: u32,
    entries_per_table: usize,
    exact: HashMap<u32, Registration>,
    flat: Vec<Option<Registration>>,
    sparse: Vec<Option<Box<IoTable>>>,
}

impl IoRegistry {
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn new(granule: u32) -> Self {
        Self {
            granule,
            entries_per_table: (FIRST_LEVEL_SPAN / granule) as usize,
            exact: HashMap::new(),
            flat: vec![None; FIRST_LEVEL_SLOTS],
            sparse: (0..FIRST_LEVEL_SLOTS).map(|_| None).collect(),
        }
    }

    pub(crate) const fn granule(&self) -> u32 {
        self.granule
    }

    /// Registers a single-address handler, replicating it across every byte
    /// of its native width when [`IoFlags::BYTE_REPLICATE`] is set.
    pub(crate) fn add_single(&mut self, addr: u32, reg: Registration) {
        let replicas = if reg.flags.contains(IoFlags::BYTE_REPLICATE) {
            reg.width.bytes()
        } else {
            1
        };
        for i in 0..replicas {
            self.insert_exact(addr.wrapping_add(i), reg.clone());
        }
    }

    fn insert_exact(&mut self, addr: u32, reg: Registration) {
        match self.exact.entry(addr) {
            Entry::Occupied(_) => {
                tracing::error!(
                    addr = format_args!("{addr:#010x}"),
                    "duplicate io handler registration"
                );
                panic!("duplicate io handler registration at {addr:#010x}");
            }
            Entry::Vacant(slot) => {
                slot.insert(reg);
            }
        }
    }

    /// Removes a single-address registration, mirroring [`Self::add_single`].
    ///
    /// A replicated group is walked using the flags recovered from the first
    /// removed entry, stopping early as soon as an address turns out not to
    /// belong to the group.
    pub(crate) fn remove_single(&mut self, addr: u32, width: NativeWidth) {
        let Some(reg) = self.exact.remove(&addr) else {
            tracing::warn!(
                addr = format_args!("{addr:#010x}"),
                "unregistering io handler that was never registered"
            );
            return;
        };
        if reg.width != width {
            tracing::warn!(
                addr = format_args!("{addr:#010x}"),
                "io handler unregistered at a width other than its declared one"
            );
        }
        if reg.flags.contains(IoFlags::BYTE_REPLICATE) {
            for i in 1..reg.width.bytes() {
                if self.exact.remove(&addr.wrapping_add(i)).is_none() {
                    break;
                }
            }
        }
    }

    /// Registers one shared handler across `[base, base + len)`.
    ///
    /// Placement: 1 MiB-aligned multiples of 1 MiB use the flat IO table;
    /// granule-aligned multiples of the IO granule use the sparse map;
    /// anything else registers address by address into the hash table.
    /// IO handler regions are assumed disjoint from direct-memory regions at
    /// the same addresses; the registry does not defend against overlap.
    pub(crate) fn add_region(&mut self, base: u32, len: u32, reg: Registration) {
        if base % FIRST_LEVEL_SPAN == 0 && len >= FIRST_LEVEL_SPAN && len % FIRST_LEVEL_SPAN == 0 {
            for slot in Self::flat_range(base, len) {
                assert!(
                    self.flat[slot].is_none(),
                    "duplicate io handler registration in flat tier slot {slot}"
                );
                self.flat[slot] = Some(reg.clone());
            }
        } else if base % self.granule == 0 && len >= self.granule && len % self.granule == 0 {
            let end = u64::from(base) + u64::from(len);
            let mut addr = u64::from(base);
            while addr < end {
                self.insert_sparse(u32::try_from(addr & 0xFFFF_FFFF).unwrap_or(0), reg.clone());
                addr += u64::from(self.granule);
            }
        } else {
            for i in 0..len {
                self.insert_exact(base.wrapping_add(i), reg.clone());
            }
        }
    }

    /// Removes a region registration; must mirror the bounds of the matching
    /// [`Self::add_region`] call exactly.
    pub(crate) fn remove_region(&mut self, base: u32, len: u32) {
        if base % FIRST_LEVEL_SPAN == 0 && len >= FIRST_LEVEL_SPAN && len % FIRST_LEVEL_SPAN == 0 {
            for slot in Self::flat_range(base, len) {
                if self.flat[slot].take().is_none() {
                    tracing::warn!(slot, "unregistering absent flat io region entry");
                }
            }
        } else if base % self.granule == 0 && len >= self.granule && len % self.granule == 0 {
            let end = u64::from(base) + u64::from(len);
            let mut addr = u64::from(base);
            while addr < end {
                let page = u32::try_from(addr & 0xFFFF_FFFF).unwrap_or(0);
                if !self.remove_sparse(page) {
                    tracing::warn!(
                        addr = format_args!("{page:#010x}"),
                        "unregistering absent sparse io region entry"
                    );
                }
                addr += u64::from(self.granule);
            }
        } else {
            for i in 0..len {
                if self.exact.remove(&base.wrapping_add(i)).is_none() {
                    tracing::warn!(
                        addr = format_args!("{:#010x}", base.wrapping_add(i)),
                        "unregistering absent per-address io region entry"
                    );
                }
            }
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn flat_range(base: u32, len: u32) -> std::ops::Range<usize> {
        let first = (base >> FIRST_LEVEL_SHIFT) as usize;
        first..first + (len / FIRST_LEVEL_SPAN) as usize
    }

    #[allow(clippy::cast_possible_truncation)]
    const fn sparse_indices(&self, addr: u32) -> (usize, usize) {
        let first = (addr >> FIRST_LEVEL_SHIFT) as usize;
        let second = ((addr & FIRST_LEVEL_MASK) / self.granule) as usize;
        (first, second)
    }

    fn insert_sparse(&mut self, addr: u32, reg: Registration) {
        let (first, second) = self.sparse_indices(addr);
        let entries = self.entries_per_table;
        let table = self.sparse[first].get_or_insert_with(|| IoTable::new(entries));
        assert!(
            table.slots[second].is_none(),
            "duplicate io handler registration at {addr:#010x}"
        );
        table.slots[second] = Some(reg);
        table.used += 1;
    }

    fn remove_sparse(&mut self, addr: u32) -> bool {
        let (first, second) = self.sparse_indices(addr);
        let Some(table) = self.sparse[first].as_mut() else {
            return false;
        };
        if table.slots[second].take().is_none() {
            return false;
        }
        table.used -= 1;
        if table.used == 0 {
            self.sparse[first] = None;
        }
        true
    }

    /// Finds the registration covering `addr`: hash, then flat, then sparse.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn lookup(&self, addr: u32) -> Option<Registration> {
        if let Some(reg) = self.exact.get(&addr) {
            return Some(reg.clone());
        }
        if let Some(reg) = self.flat[(addr >> FIRST_LEVEL_SHIFT) as usize].as_ref() {
            return Some(reg.clone());
        }
        let (first, second) = self.sparse_indices(addr);
        self.sparse[first]
            .as_ref()
            .and_then(|table| table.slots[second].as_ref())
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::super::{ByteOrder, IoFlags, IoHandler, NativeWidth, Registration};
    use super::IoRegistry;
    use crate::map::FIRST_LEVEL_SPAN;
    use crate::Bus;

    struct Inert;

    impl IoHandler for Inert {
        fn read(&mut self, _bus: &mut Bus, _addr: u32) -> u32 {
            0
        }

        fn write(&mut self, _bus: &mut Bus, _addr: u32, _value: u32) {}
    }

    fn reg(width: NativeWidth, flags: IoFlags) -> Registration {
        Registration {
            width,
            order: ByteOrder::host(),
            flags,
            handler: Rc::new(RefCell::new(Inert)),
        }
    }

    #[test]
    fn byte_replication_covers_every_byte_of_the_native_width() {
        let mut registry = IoRegistry::new(0x4000);
        registry.add_single(0x1000, reg(NativeWidth::W32, IoFlags::BYTE_REPLICATE));

        for offset in 0..4 {
            assert!(registry.lookup(0x1000 + offset).is_some());
        }
        assert!(registry.lookup(0x1004).is_none());
    }

    #[test]
    fn replicated_group_removal_clears_all_byte_entries() {
        let mut registry = IoRegistry::new(0x4000);
        registry.add_single(0x1000, reg(NativeWidth::W32, IoFlags::BYTE_REPLICATE));
        registry.remove_single(0x1000, NativeWidth::W32);

        for offset in 0..4 {
            assert!(registry.lookup(0x1000 + offset).is_none());
        }
    }

    #[test]
    #[should_panic(expected = "duplicate io handler registration")]
    fn duplicate_exact_registration_is_fatal() {
        let mut registry = IoRegistry::new(0x4000);
        registry.add_single(0x2000, reg(NativeWidth::W16, IoFlags::empty()));
        registry.add_single(0x2000, reg(NativeWidth::W16, IoFlags::empty()));
    }

    #[test]
    fn megabyte_aligned_regions_use_the_flat_tier() {
        let mut registry = IoRegistry::new(0x4000);
        registry.add_region(
            FIRST_LEVEL_SPAN * 3,
            FIRST_LEVEL_SPAN,
            reg(NativeWidth::W32, IoFlags::empty()),
        );

        assert!(registry.lookup(FIRST_LEVEL_SPAN * 3 + 0x1234).is_some());
        registry.remove_region(FIRST_LEVEL_SPAN * 3, FIRST_LEVEL_SPAN);
        assert!(registry.lookup(FIRST_LEVEL_SPAN * 3 + 0x1234).is_none());
    }

    #[test]
    fn granule_aligned_regions_use_the_sparse_tier_and_free_tables() {
        let mut registry = IoRegistry::new(0x4000);
        registry.add_region(0x0050_0000, 0x8000, reg(NativeWidth::W32, IoFlags::empty()));

        assert!(registry.lookup(0x0050_7FFF).is_some());
        registry.remove_region(0x0050_0000, 0x8000);
        assert!(registry.lookup(0x0050_0000).is_none());
        assert!(registry.sparse[0x5].is_none());
    }

    #[test]
    fn unaligned_regions_fall_back_to_per_address_entries() {
        let mut registry = IoRegistry::new(0x4000);
        registry.add_region(0x3001, 0x10, reg(NativeWidth::W8, IoFlags::empty()));

        assert!(registry.lookup(0x3001).is_some());
        assert!(registry.lookup(0x3010).is_some());
        assert!(registry.lookup(0x3011).is_none());
        registry.remove_region(0x3001, 0x10);
        assert!(registry.lookup(0x3001).is_none());
    }
}
