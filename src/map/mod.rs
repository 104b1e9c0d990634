//! Direct-memory translation: flat block map, two-level sparse map, and the
//! range walker device models use to install passive memory.

use std::cell::RefCell;
use std::rc::Rc;

use bitflags::bitflags;

/// Flat block map entries (32 KiB granularity).
pub mod flat;
/// Lazily allocated two-level map with the write-side trace flag.
pub mod sparse;

pub(crate) use flat::FlatMap;
pub(crate) use sparse::SparseMap;

/// Size in bytes of one flat block map entry (32 KiB).
pub const FLAT_BLOCK_SIZE: u32 = 1 << 15;

/// Number of flat blocks covering the 4 GiB space, per direction.
pub(crate) const FLAT_BLOCK_COUNT: usize = 1 << (32 - 15);

/// Span in bytes of one first-level slot of the two-level maps (1 MiB).
pub const FIRST_LEVEL_SPAN: u32 = 1 << 20;

/// Number of first-level slots in a two-level map.
pub(crate) const FIRST_LEVEL_SLOTS: usize = 1 << 12;

/// Smallest accepted two-level granule in bytes.
pub const MIN_GRANULE: u32 = 2;

/// Largest accepted two-level granule in bytes (one first-level slot).
pub const MAX_GRANULE: u32 = FIRST_LEVEL_SPAN;

/// Shared backing store for directly mapped memory.
///
/// Devices allocate these and keep their own handle; the bus only borrows
/// positions into them through map slots and never outlives the mapping
/// relationship. Single-threaded shared ownership, matching the bus
/// concurrency model.
pub type BackingStore = Rc<RefCell<Box<[u8]>>>;

/// Allocates a zeroed backing store of `len` bytes.
#[must_use]
pub fn new_backing(len: usize) -> BackingStore {
    Rc::new(RefCell::new(vec![0; len].into_boxed_slice()))
}

/// Allocates a backing store initialized from `data` (ROM images, fixtures).
#[must_use]
pub fn backing_from_bytes(data: &[u8]) -> BackingStore {
    Rc::new(RefCell::new(data.to_vec().into_boxed_slice()))
}

bitflags! {
    /// Direction selection for mappings and device capability masks.
    ///
    /// Read and write directions are tracked independently: a region may be
    /// mapped write-only, read-only, or both.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MapFlags: u32 {
        /// Reads at the mapped range resolve to the backing store.
        const READABLE = 1 << 0;
        /// Writes at the mapped range resolve to the backing store.
        const WRITABLE = 1 << 1;
    }
}

/// One populated translation slot: a borrowed position in a backing store.
///
/// `traced` is meaningful only on write-side two-level slots; it is the
/// one-shot write-trap flag (the redesigned form of the original low
/// pointer-tag bit).
#[derive(Debug, Clone)]
pub(crate) struct Slot {
    pub(crate) backing: BackingStore,
    pub(crate) offset: usize,
    pub(crate) traced: bool,
}

impl Slot {
    pub(crate) fn new(backing: &BackingStore, offset: usize) -> Self {
        Self {
            backing: Rc::clone(backing),
            offset,
            traced: false,
        }
    }
}

/// Both direct-memory maps plus the range walker that feeds them.
pub(crate) struct MemoryMap {
    pub(crate) flat: FlatMap,
    pub(crate) sparse: SparseMap,
    granule: u32,
}

impl MemoryMap {
    pub(crate) fn new(granule: u32) -> Self {
        Self {
            flat: FlatMap::new(),
            sparse: SparseMap::new(granule),
            granule,
        }
    }

    pub(crate) const fn granule(&self) -> u32 {
        self.granule
    }

    /// Installs `[base, base + window)` over `backing`, choosing flat blocks
    /// where the span allows and two-level granules otherwise. The backing
    /// repeats cyclically when the window is larger than it, modeling a
    /// chip select that decodes more address bits than the device implements.
    ///
    /// # Panics
    ///
    /// Panics when a remainder of the range cannot be represented at either
    /// granularity; that is a device-model configuration bug.
    pub(crate) fn map_range(
        &mut self,
        base: u32,
        backing: &BackingStore,
        window: u32,
        flags: MapFlags,
    ) {
        let backing_len = u64::try_from(backing.borrow().len()).unwrap_or(u64::MAX);
        assert!(
            backing_len > 0,
            "cannot map empty backing store at {base:#010x}"
        );

        let end = u64::from(base) + u64::from(window);
        let mut cursor = u64::from(base);
        while cursor < end {
            let remaining = end - cursor;
            let offset = (cursor - u64::from(base)) % backing_len;
            let addr = truncate_addr(cursor);

            if remaining >= u64::from(FLAT_BLOCK_SIZE)
                && cursor % u64::from(FLAT_BLOCK_SIZE) == 0
                && offset + u64::from(FLAT_BLOCK_SIZE) <= backing_len
            {
                self.flat.map(addr, backing, as_offset(offset), flags);
                cursor += u64::from(FLAT_BLOCK_SIZE);
            } else if remaining >= u64::from(self.granule)
                && cursor % u64::from(self.granule) == 0
                && offset + u64::from(self.granule) <= backing_len
            {
                self.sparse.map(addr, backing, as_offset(offset), flags);
                cursor += u64::from(self.granule);
            } else {
                tracing::error!(
                    addr = format_args!("{addr:#010x}"),
                    remaining,
                    granule = self.granule,
                    "mapping range not representable at any supported granularity"
                );
                panic!("unrepresentable mapping range at {addr:#010x}");
            }
        }
    }

    /// Exact inverse of [`Self::map_range`]. Probes both maps each step, so
    /// a region that was mapped flat, two-level, or a mix (after a trace
    /// split) tears down the same way.
    ///
    /// # Panics
    ///
    /// Panics on a remainder that could never have been produced by
    /// `map_range` over the same bounds.
    pub(crate) fn unmap_range(&mut self, base: u32, window: u32) {
        let end = u64::from(base) + u64::from(window);
        let mut cursor = u64::from(base);
        while cursor < end {
            let remaining = end - cursor;
            let addr = truncate_addr(cursor);

            if remaining >= u64::from(FLAT_BLOCK_SIZE)
                && cursor % u64::from(FLAT_BLOCK_SIZE) == 0
                && self.flat.unmap(addr)
            {
                cursor += u64::from(FLAT_BLOCK_SIZE);
            } else if remaining >= u64::from(self.granule) && cursor % u64::from(self.granule) == 0
            {
                self.sparse.unmap(addr);
                cursor += u64::from(self.granule);
            } else {
                tracing::error!(
                    addr = format_args!("{addr:#010x}"),
                    remaining,
                    "unmap range not representable at any supported granularity"
                );
                panic!("unrepresentable unmap range at {addr:#010x}");
            }
        }
    }

    /// Resolves a read span entirely contained in one block or granule.
    pub(crate) fn read_span(&self, addr: u32, len: usize) -> Option<(BackingStore, usize)> {
        self.flat
            .read_span(addr, len)
            .or_else(|| self.sparse.read_span(addr, len))
    }

    /// True when a write at `addr` resolves through either map, without
    /// touching trace state.
    pub(crate) fn is_write_mapped(&self, addr: u32) -> bool {
        self.flat.write_span(addr, 1).is_some() || self.sparse.is_write_mapped(addr)
    }

    /// Resolves a write span entirely contained in one block or granule.
    ///
    /// On a traced two-level page the trace flag is cleared here, before the
    /// caller applies the value; `fired` tells the caller to emit the
    /// one-shot notification first.
    pub(crate) fn write_span(&mut self, addr: u32, len: usize) -> Option<WriteSpan> {
        if let Some((backing, offset)) = self.flat.write_span(addr, len) {
            return Some(WriteSpan {
                backing,
                offset,
                fired: false,
            });
        }
        self.sparse
            .write_span(addr, len)
            .map(|(backing, offset, fired)| WriteSpan {
                backing,
                offset,
                fired,
            })
    }
}

/// Resolved write destination plus the one-shot trace outcome.
pub(crate) struct WriteSpan {
    pub(crate) backing: BackingStore,
    pub(crate) offset: usize,
    pub(crate) fired: bool,
}

fn truncate_addr(cursor: u64) -> u32 {
    u32::try_from(cursor & 0xFFFF_FFFF).unwrap_or_else(|_| unreachable!())
}

fn as_offset(offset: u64) -> usize {
    usize::try_from(offset).unwrap_or_else(|_| panic!("backing offset {offset:#x} escapes usize"))
}

#[cfg(test)]
#[allow(clippy::cast_possible_truncation)]
mod tests {
    use super::{backing_from_bytes, new_backing, MapFlags, MemoryMap, FLAT_BLOCK_SIZE};

    #[test]
    fn range_walker_prefers_flat_blocks_for_aligned_spans() {
        let mut map = MemoryMap::new(0x1000);
        let backing = new_backing(FLAT_BLOCK_SIZE as usize);
        map.map_range(0x0010_0000, &backing, FLAT_BLOCK_SIZE, MapFlags::all());

        assert!(map.flat.read_span(0x0010_0000, 1).is_some());
        assert!(map.sparse.read_span(0x0010_0000, 1).is_none());
    }

    #[test]
    fn range_walker_uses_granules_for_small_windows() {
        let mut map = MemoryMap::new(0x1000);
        let backing = new_backing(0x2000);
        map.map_range(0x0020_0000, &backing, 0x2000, MapFlags::all());

        assert!(map.flat.read_span(0x0020_0000, 1).is_none());
        assert!(map.sparse.read_span(0x0020_0000, 1).is_some());
        assert!(map.sparse.read_span(0x0020_1000, 1).is_some());
    }

    #[test]
    fn cyclic_backing_repeats_offsets_across_the_window() {
        let mut map = MemoryMap::new(0x1000);
        let backing = backing_from_bytes(&[0xA5; 0x1000]);
        map.map_range(0x0030_0000, &backing, 0x4000, MapFlags::READABLE);

        let (first, off_first) = map.read_span(0x0030_0000, 1).expect("mapped");
        let (aliased, off_aliased) = map.read_span(0x0030_3000, 1).expect("aliased");
        assert_eq!(off_first, off_aliased);
        assert!(std::rc::Rc::ptr_eq(&first, &aliased));
    }

    #[test]
    #[should_panic(expected = "unrepresentable mapping range")]
    fn misaligned_remainder_is_fatal() {
        let mut map = MemoryMap::new(0x1000);
        let backing = new_backing(0x1000);
        map.map_range(0x0040_0000, &backing, 0x1234, MapFlags::all());
    }

    #[test]
    fn unmap_range_restores_pristine_state() {
        let mut map = MemoryMap::new(0x1000);
        let backing = new_backing(FLAT_BLOCK_SIZE as usize * 2);
        map.map_range(
            0x0050_0000,
            &backing,
            FLAT_BLOCK_SIZE * 2 + 0x3000,
            MapFlags::all(),
        );
        map.unmap_range(0x0050_0000, FLAT_BLOCK_SIZE * 2 + 0x3000);

        assert!(map.read_span(0x0050_0000, 1).is_none());
        assert!(map.read_span(0x0050_0000 + FLAT_BLOCK_SIZE, 1).is_none());
        assert!(map
            .read_span(0x0050_0000 + FLAT_BLOCK_SIZE * 2, 1)
            .is_none());
    }
}
