//! One-shot write traps for external invalidation schemes (TLB shootdown,
//! self-modifying-code detection).
//!
//! The trap flag lives on two-level write-side pages only, so tracing an
//! address inside a flat block first splits that block into equivalent
//! two-level granules over the same backing. Firing is one-shot: the first
//! write to a traced page clears the flag, notifies listeners through the
//! IO dispatch seam, then lands normally.

use crate::map::sparse::TraceArm;
use crate::map::{MapFlags, FLAT_BLOCK_SIZE};
use crate::Bus;

impl Bus {
    /// Arms the write trap on the page containing `addr`.
    ///
    /// Tracing an unmapped page, or re-tracing an already-traced one, is
    /// tolerated misuse: it logs a diagnostic and changes nothing.
    #[allow(clippy::cast_possible_truncation)]
    pub fn trace_page(&mut self, addr: u32) {
        let granule = self.mem.granule();
        let page = addr & !(granule - 1);

        let (read_slot, write_slot) = self.mem.flat.slots(addr);
        if read_slot.is_some() || write_slot.is_some() {
            if granule > FLAT_BLOCK_SIZE {
                tracing::warn!(
                    addr = format_args!("{addr:#010x}"),
                    granule,
                    "granule exceeds a flat block; cannot split for tracing"
                );
                return;
            }
            let block_base = addr & !(FLAT_BLOCK_SIZE - 1);
            self.mem.flat.unmap(block_base);
            for i in 0..FLAT_BLOCK_SIZE / granule {
                let sub = block_base + i * granule;
                let delta = (i * granule) as usize;
                if let Some(slot) = &read_slot {
                    self.mem
                        .sparse
                        .map(sub, &slot.backing, slot.offset + delta, MapFlags::READABLE);
                }
                if let Some(slot) = &write_slot {
                    self.mem
                        .sparse
                        .map(sub, &slot.backing, slot.offset + delta, MapFlags::WRITABLE);
                }
            }
        }

        match self.mem.sparse.arm_trace(page) {
            TraceArm::Armed => {
                tracing::trace!(page = format_args!("{page:#010x}"), "page trace armed");
            }
            TraceArm::AlreadyTraced => {
                tracing::warn!(
                    page = format_args!("{page:#010x}"),
                    "page is already traced"
                );
            }
            TraceArm::NotMapped => {
                tracing::warn!(
                    page = format_args!("{page:#010x}"),
                    "tracing a page with no write mapping"
                );
            }
        }
    }

    /// Disarms the write trap on the page containing `addr`.
    pub fn untrace_page(&mut self, addr: u32) {
        let granule = self.mem.granule();
        let page = addr & !(granule - 1);
        if !self.mem.sparse.disarm_trace(page) {
            tracing::warn!(
                page = format_args!("{page:#010x}"),
                "untracing a page with no write mapping"
            );
        }
    }

    /// Arms the write trap on every page intersecting `[base, base + len)`.
    pub fn trace_region(&mut self, base: u32, len: u32) {
        self.for_each_page(base, len, Self::trace_page);
    }

    /// Disarms the write trap across `[base, base + len)`.
    pub fn untrace_region(&mut self, base: u32, len: u32) {
        self.for_each_page(base, len, Self::untrace_page);
    }

    fn for_each_page(&mut self, base: u32, len: u32, mut apply: impl FnMut(&mut Self, u32)) {
        let granule = self.mem.granule();
        let end = u64::from(base) + u64::from(len);
        let mut page = u64::from(base & !(granule - 1));
        while page < end {
            apply(self, u32::try_from(page & 0xFFFF_FFFF).unwrap_or(0));
            page += u64::from(granule);
        }
    }
}

#[cfg(test)]
#[allow(clippy::cast_possible_truncation)]
mod tests {
    use crate::map::{new_backing, MapFlags, FLAT_BLOCK_SIZE};
    use crate::{Bus, BusConfig};

    fn bus() -> Bus {
        Bus::new(&BusConfig::default(), Box::new(|| {})).expect("valid default config")
    }

    #[test]
    fn tracing_splits_a_flat_block_without_losing_contents() {
        let mut bus = bus();
        let backing = new_backing(FLAT_BLOCK_SIZE as usize);
        bus.map_range(0x0010_0000, &backing, FLAT_BLOCK_SIZE, MapFlags::all());
        bus.write32(0x0010_4000, 0xCAFE_F00D);

        bus.trace_page(0x0010_4000);

        // Flat entry is gone, contents still resolve through the split.
        assert!(bus.mem.flat.read_span(0x0010_0000, 1).is_none());
        assert_eq!(bus.read32(0x0010_4000), 0xCAFE_F00D);
        assert_eq!(bus.read32(0x0010_0000), 0);
    }

    #[test]
    fn tracing_unmapped_or_traced_pages_does_not_abort() {
        let mut bus = bus();
        bus.trace_page(0x0300_0000);
        bus.untrace_page(0x0300_0000);

        let backing = new_backing(0x1000);
        bus.map_range(0x0020_0000, &backing, 0x1000, MapFlags::all());
        bus.trace_page(0x0020_0000);
        bus.trace_page(0x0020_0000);
    }

    #[test]
    fn region_tracing_covers_every_intersecting_page() {
        let mut bus = bus();
        let backing = new_backing(0x4000);
        bus.map_range(0x0030_0000, &backing, 0x4000, MapFlags::all());

        bus.trace_region(0x0030_0800, 0x2000);

        // Pages at 0x0000, 0x1000, and 0x2000 intersect the span.
        for page in [0x0030_0000_u32, 0x0030_1000, 0x0030_2000] {
            let (_, _, fired) = bus.mem.sparse.write_span(page, 1).expect("mapped");
            assert!(fired, "page {page:#010x} should be armed");
        }
        let (_, _, fired) = bus.mem.sparse.write_span(0x0030_3000, 1).expect("mapped");
        assert!(!fired);
    }
}
