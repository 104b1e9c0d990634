//! Coarse O(1) translation for naturally aligned, directly backed regions.

use super::{BackingStore, MapFlags, Slot, FLAT_BLOCK_COUNT, FLAT_BLOCK_SIZE};

const BLOCK_SHIFT: u32 = FLAT_BLOCK_SIZE.trailing_zeros();
const BLOCK_MASK: u32 = FLAT_BLOCK_SIZE - 1;

/// Parallel read/write slot arrays at fixed 32 KiB block granularity.
///
/// Slots borrow positions in device backing stores; the map owns nothing.
pub(crate) struct FlatMap {
    read: Vec<Option<Slot>>,
    write: Vec<Option<Slot>>,
}

impl FlatMap {
    pub(crate) fn new() -> Self {
        Self {
            read: vec![None; FLAT_BLOCK_COUNT],
            write: vec![None; FLAT_BLOCK_COUNT],
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    const fn index(addr: u32) -> usize {
        (addr >> BLOCK_SHIFT) as usize
    }

    /// Installs `backing[offset..offset + 32 KiB]` at `addr`'s block for the
    /// directions selected by `flags`.
    pub(crate) fn map(&mut self, addr: u32, backing: &BackingStore, offset: usize, flags: MapFlags) {
        let index = Self::index(addr);
        if flags.contains(MapFlags::READABLE) {
            self.read[index] = Some(Slot::new(backing, offset));
        }
        if flags.contains(MapFlags::WRITABLE) {
            self.write[index] = Some(Slot::new(backing, offset));
        }
    }

    /// Clears both directions at `addr`'s block; reports whether either was
    /// populated so callers can decide to fall through to the two-level path.
    pub(crate) fn unmap(&mut self, addr: u32) -> bool {
        let index = Self::index(addr);
        let was_mapped = self.read[index].is_some() || self.write[index].is_some();
        self.read[index] = None;
        self.write[index] = None;
        was_mapped
    }

    /// Clones of both direction slots at `addr`'s block, for a trace split.
    pub(crate) fn slots(&self, addr: u32) -> (Option<Slot>, Option<Slot>) {
        let index = Self::index(addr);
        (self.read[index].clone(), self.write[index].clone())
    }

    pub(crate) fn read_span(&self, addr: u32, len: usize) -> Option<(BackingStore, usize)> {
        Self::span(&self.read, addr, len)
    }

    pub(crate) fn write_span(&self, addr: u32, len: usize) -> Option<(BackingStore, usize)> {
        Self::span(&self.write, addr, len)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn span(side: &[Option<Slot>], addr: u32, len: usize) -> Option<(BackingStore, usize)> {
        let slot = side[Self::index(addr)].as_ref()?;
        let in_block = (addr & BLOCK_MASK) as usize;
        if in_block + len > FLAT_BLOCK_SIZE as usize {
            return None;
        }
        Some((slot.backing.clone(), slot.offset + in_block))
    }
}

#[cfg(test)]
#[allow(clippy::cast_possible_truncation)]
mod tests {
    use super::super::{new_backing, MapFlags};
    use super::{FlatMap, FLAT_BLOCK_SIZE};

    #[test]
    fn mapping_respects_direction_flags() {
        let mut map = FlatMap::new();
        let backing = new_backing(FLAT_BLOCK_SIZE as usize);
        map.map(0x0000_8000, &backing, 0, MapFlags::READABLE);

        assert!(map.read_span(0x0000_8000, 4).is_some());
        assert!(map.write_span(0x0000_8000, 4).is_none());
    }

    #[test]
    fn unmap_reports_whether_anything_was_mapped() {
        let mut map = FlatMap::new();
        let backing = new_backing(FLAT_BLOCK_SIZE as usize);
        map.map(0x0001_0000, &backing, 0, MapFlags::all());

        assert!(map.unmap(0x0001_0000));
        assert!(!map.unmap(0x0001_0000));
    }

    #[test]
    fn span_rejects_accesses_crossing_the_block_boundary() {
        let mut map = FlatMap::new();
        let backing = new_backing(FLAT_BLOCK_SIZE as usize);
        map.map(0, &backing, 0, MapFlags::all());

        assert!(map.read_span(FLAT_BLOCK_SIZE - 4, 4).is_some());
        assert!(map.read_span(FLAT_BLOCK_SIZE - 2, 4).is_none());
    }

    #[test]
    fn offsets_compose_with_the_in_block_address() {
        let mut map = FlatMap::new();
        let backing = new_backing(FLAT_BLOCK_SIZE as usize * 2);
        map.map(0x0002_0000, &backing, FLAT_BLOCK_SIZE as usize, MapFlags::all());

        let (_, offset) = map.read_span(0x0002_0010, 1).expect("mapped");
        assert_eq!(offset, FLAT_BLOCK_SIZE as usize + 0x10);
    }
}
