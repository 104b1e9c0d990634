//! Finer-granularity translation built lazily over 1 MiB first-level slots.
//!
//! Second-level tables are allocated on the first populated entry and freed
//! when the last entry is cleared; the per-table population count always
//! equals the number of occupied entries. Write-side slots carry the one-shot
//! trace flag.

use super::{BackingStore, MapFlags, Slot, FIRST_LEVEL_SLOTS, FIRST_LEVEL_SPAN};

const FIRST_LEVEL_SHIFT: u32 = FIRST_LEVEL_SPAN.trailing_zeros();
const FIRST_LEVEL_MASK: u32 = FIRST_LEVEL_SPAN - 1;

struct Table {
    slots: Vec<Option<Slot>>,
    used: usize,
}

impl Table {
    fn new(entries: usize) -> Box<Self> {
        Box::new(Self {
            slots: vec![None; entries],
            used: 0,
        })
    }
}

/// Outcome of arming the trace flag on a page.
pub(crate) enum TraceArm {
    /// Flag was clear and is now set.
    Armed,
    /// Flag was already set; tolerated misuse.
    AlreadyTraced,
    /// No write-side mapping exists at the page; tolerated misuse.
    NotMapped,
}

/// Two-level sparse translation map, one per direction.
pub(crate) struct SparseMap {
    granule: u32,
    entries_per_table: usize,
    read: Vec<Option<Box<Table>>>,
    write: Vec<Option<Box<Table>>>,
}

impl SparseMap {
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn new(granule: u32) -> Self {
        let entries_per_table = (FIRST_LEVEL_SPAN / granule) as usize;
        Self {
            granule,
            entries_per_table,
            read: (0..FIRST_LEVEL_SLOTS).map(|_| None).collect(),
            write: (0..FIRST_LEVEL_SLOTS).map(|_| None).collect(),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    const fn indices(&self, addr: u32) -> (usize, usize) {
        let first = (addr >> FIRST_LEVEL_SHIFT) as usize;
        let second = ((addr & FIRST_LEVEL_MASK) / self.granule) as usize;
        (first, second)
    }

    /// Installs one granule at `addr` for the directions selected by `flags`,
    /// allocating the second-level table on demand.
    pub(crate) fn map(&mut self, addr: u32, backing: &BackingStore, offset: usize, flags: MapFlags) {
        let (first, second) = self.indices(addr);
        let entries = self.entries_per_table;
        if flags.contains(MapFlags::READABLE) {
            Self::install(&mut self.read, first, second, entries, backing, offset);
        }
        if flags.contains(MapFlags::WRITABLE) {
            Self::install(&mut self.write, first, second, entries, backing, offset);
        }
    }

    fn install(
        side: &mut [Option<Box<Table>>],
        first: usize,
        second: usize,
        entries: usize,
        backing: &BackingStore,
        offset: usize,
    ) {
        let table = side[first].get_or_insert_with(|| Table::new(entries));
        if table.slots[second].is_none() {
            table.used += 1;
        }
        table.slots[second] = Some(Slot::new(backing, offset));
    }

    /// Clears one granule at `addr` in both directions, freeing a table when
    /// its last entry goes away. Reports whether anything was cleared.
    pub(crate) fn unmap(&mut self, addr: u32) -> bool {
        let (first, second) = self.indices(addr);
        let removed_read = Self::clear(&mut self.read, first, second);
        let removed_write = Self::clear(&mut self.write, first, second);
        removed_read || removed_write
    }

    fn clear(side: &mut [Option<Box<Table>>], first: usize, second: usize) -> bool {
        let Some(table) = side[first].as_mut() else {
            return false;
        };
        if table.slots[second].take().is_none() {
            return false;
        }
        table.used -= 1;
        if table.used == 0 {
            side[first] = None;
        }
        true
    }

    pub(crate) fn read_span(&self, addr: u32, len: usize) -> Option<(BackingStore, usize)> {
        let (first, second) = self.indices(addr);
        let slot = self.read[first].as_ref()?.slots[second].as_ref()?;
        let in_page = self.in_page(addr, len)?;
        Some((slot.backing.clone(), slot.offset + in_page))
    }

    /// Resolves a write span, clearing the trace flag first when it was set
    /// (`fired` in the return value). One-shot: the flag will not fire again
    /// until re-armed.
    pub(crate) fn write_span(
        &mut self,
        addr: u32,
        len: usize,
    ) -> Option<(BackingStore, usize, bool)> {
        let in_page = self.in_page(addr, len)?;
        let (first, second) = self.indices(addr);
        let slot = self.write[first].as_mut()?.slots[second].as_mut()?;
        let fired = slot.traced;
        slot.traced = false;
        Some((slot.backing.clone(), slot.offset + in_page, fired))
    }

    /// Checks write-side presence without consuming the trace flag.
    pub(crate) fn is_write_mapped(&self, addr: u32) -> bool {
        let (first, second) = self.indices(addr);
        self.write[first]
            .as_ref()
            .is_some_and(|table| table.slots[second].is_some())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn in_page(&self, addr: u32, len: usize) -> Option<usize> {
        let in_page = (addr % self.granule) as usize;
        (in_page + len <= self.granule as usize).then_some(in_page)
    }

    /// Sets the trace flag on `addr`'s write-side page.
    pub(crate) fn arm_trace(&mut self, addr: u32) -> TraceArm {
        let (first, second) = self.indices(addr);
        let Some(slot) = self.write[first]
            .as_mut()
            .and_then(|table| table.slots[second].as_mut())
        else {
            return TraceArm::NotMapped;
        };
        if slot.traced {
            TraceArm::AlreadyTraced
        } else {
            slot.traced = true;
            TraceArm::Armed
        }
    }

    /// Clears the trace flag; reports whether the page was mapped at all.
    pub(crate) fn disarm_trace(&mut self, addr: u32) -> bool {
        let (first, second) = self.indices(addr);
        let Some(slot) = self.write[first]
            .as_mut()
            .and_then(|table| table.slots[second].as_mut())
        else {
            return false;
        };
        slot.traced = false;
        true
    }
}
