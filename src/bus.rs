//! The bus context object: initialization, the typed access API every bus
//! master calls, and the IO dispatch fall-through with its partial-access
//! policies.
//!
//! Resolution order for every access: flat block map, two-level sparse map,
//! IO handler registry, then the no-handler default (reads return 0, writes
//! are dropped, both with a diagnostic). Direct-memory paths never convert
//! byte order; a device that memory-maps RAM/ROM stores content in host
//! order already.

use std::rc::Rc;

use crate::device::DeviceRecord;
use crate::error::BusError;
use crate::io::registry::IoRegistry;
use crate::io::{
    swap_native, AccessWidth, ByteOrder, IoFlags, NativeWidth, Registration, SharedHandler,
};
use crate::map::{BackingStore, MapFlags, MemoryMap, MAX_GRANULE, MIN_GRANULE};

/// Default two-level granule when the embedder has no preference.
pub const DEFAULT_GRANULE: u32 = 0x1000;

/// Invalidation seam to the CPU emulation: runs after every mapping change
/// so translation caches can be flushed.
pub type InvalidationHook = Box<dyn FnMut()>;

/// Process-lifetime configuration for one bus instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusConfig {
    /// Minimum two-level mapping granule in bytes; a power of two in
    /// `2..=1 MiB`, fixed for the lifetime of the bus.
    pub granule: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            granule: DEFAULT_GRANULE,
        }
    }
}

/// One simulated 32-bit physical address space shared by all device models
/// and the CPU emulation.
///
/// Single-threaded, synchronous, cooperative: no locking, no reentrancy
/// guards. Nested calls (a register write remapping its own device, which
/// registers handlers in turn) are expected and work as long as they stay
/// strictly sequential on the one execution context.
pub struct Bus {
    pub(crate) mem: MemoryMap,
    pub(crate) io: IoRegistry,
    pub(crate) devices: Vec<DeviceRecord>,
    invalidate: InvalidationHook,
}

impl Bus {
    /// Builds a bus, allocating all top-level translation tables.
    ///
    /// The IO two-level map uses its own, coarser granule derived from the
    /// memory granule. Multiple independent buses per process are fine; an
    /// emulator instance normally has exactly one.
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] when the configured granule is not a power of
    /// two or falls outside `2..=1 MiB`.
    pub fn new(config: &BusConfig, invalidate: InvalidationHook) -> Result<Self, BusError> {
        let granule = config.granule;
        if !granule.is_power_of_two() {
            return Err(BusError::GranuleNotPowerOfTwo { granule });
        }
        if !(MIN_GRANULE..=MAX_GRANULE).contains(&granule) {
            return Err(BusError::GranuleOutOfRange { granule });
        }
        let io_granule = (granule * 4).min(MAX_GRANULE);
        Ok(Self {
            mem: MemoryMap::new(granule),
            io: IoRegistry::new(io_granule),
            devices: Vec::new(),
            invalidate,
        })
    }

    /// The configured minimum memory-mapping granule.
    #[must_use]
    pub const fn granule(&self) -> u32 {
        self.mem.granule()
    }

    /// The derived minimum IO-region granule.
    #[must_use]
    pub const fn io_granule(&self) -> u32 {
        self.io.granule()
    }

    pub(crate) fn run_invalidate(&mut self) {
        (self.invalidate)();
    }

    // --- typed access API -------------------------------------------------

    /// Reads an 8-bit value.
    pub fn read8(&mut self, addr: u32) -> u8 {
        let mut buf = [0_u8; 1];
        if self.mem_read(addr, &mut buf) {
            buf[0]
        } else {
            truncate::<u8>(self.io_read(addr, AccessWidth::W8))
        }
    }

    /// Reads a 16-bit value.
    pub fn read16(&mut self, addr: u32) -> u16 {
        let mut buf = [0_u8; 2];
        if self.mem_read(addr, &mut buf) {
            u16::from_ne_bytes(buf)
        } else {
            truncate::<u16>(self.io_read(addr, AccessWidth::W16))
        }
    }

    /// Reads a 32-bit value.
    pub fn read32(&mut self, addr: u32) -> u32 {
        let mut buf = [0_u8; 4];
        if self.mem_read(addr, &mut buf) {
            u32::from_ne_bytes(buf)
        } else {
            truncate::<u32>(self.io_read(addr, AccessWidth::W32))
        }
    }

    /// Reads a 64-bit value.
    pub fn read64(&mut self, addr: u32) -> u64 {
        let mut buf = [0_u8; 8];
        if self.mem_read(addr, &mut buf) {
            u64::from_ne_bytes(buf)
        } else {
            self.io_read(addr, AccessWidth::W64)
        }
    }

    /// Writes an 8-bit value.
    pub fn write8(&mut self, addr: u32, value: u8) {
        if !self.mem_write(addr, &[value]) {
            self.io_write(addr, u64::from(value), AccessWidth::W8);
        }
    }

    /// Writes a 16-bit value.
    pub fn write16(&mut self, addr: u32, value: u16) {
        if !self.mem_write(addr, &value.to_ne_bytes()) {
            self.io_write(addr, u64::from(value), AccessWidth::W16);
        }
    }

    /// Writes a 32-bit value.
    pub fn write32(&mut self, addr: u32, value: u32) {
        if !self.mem_write(addr, &value.to_ne_bytes()) {
            self.io_write(addr, u64::from(value), AccessWidth::W32);
        }
    }

    /// Writes a 64-bit value.
    pub fn write64(&mut self, addr: u32, value: u64) {
        if !self.mem_write(addr, &value.to_ne_bytes()) {
            self.io_write(addr, value, AccessWidth::W64);
        }
    }

    /// Copies `buf.len()` bytes out of the address space, one byte at a
    /// time through the full fall-through (crosses blocks transparently at
    /// per-byte dispatch cost).
    pub fn read_bytes(&mut self, addr: u32, buf: &mut [u8]) {
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = self.read8(addr.wrapping_add(index_u32(i)));
        }
    }

    /// Copies `data` into the address space, one byte at a time through the
    /// full fall-through.
    pub fn write_bytes(&mut self, addr: u32, data: &[u8]) {
        for (i, byte) in data.iter().enumerate() {
            self.write8(addr.wrapping_add(index_u32(i)), *byte);
        }
    }

    /// Byte copy with 32-bit lane reflection (`addr ^ 3` per byte), for a
    /// bus master whose byte order differs from the host's.
    pub fn read_bytes_xlated(&mut self, addr: u32, buf: &mut [u8]) {
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = self.read8(addr.wrapping_add(index_u32(i)) ^ 3);
        }
    }

    /// Write counterpart of [`Self::read_bytes_xlated`].
    pub fn write_bytes_xlated(&mut self, addr: u32, data: &[u8]) {
        for (i, byte) in data.iter().enumerate() {
            self.write8(addr.wrapping_add(index_u32(i)) ^ 3, *byte);
        }
    }

    // --- direct-memory resolution -----------------------------------------

    fn mem_read(&mut self, addr: u32, buf: &mut [u8]) -> bool {
        let len = buf.len();
        if let Some((backing, offset)) = self.mem.read_span(addr, len) {
            buf.copy_from_slice(&backing.borrow()[offset..offset + len]);
            return true;
        }
        if len > 1 && self.mem.read_span(addr, 1).is_some() {
            // Crosses a block or granule boundary; assemble per byte.
            for (i, byte) in buf.iter_mut().enumerate() {
                let a = addr.wrapping_add(index_u32(i));
                if let Some((backing, offset)) = self.mem.read_span(a, 1) {
                    *byte = backing.borrow()[offset];
                } else {
                    tracing::warn!(
                        addr = format_args!("{a:#010x}"),
                        "read ran off the end of mapped memory; padding with 0"
                    );
                    *byte = 0;
                }
            }
            return true;
        }
        false
    }

    fn mem_write(&mut self, addr: u32, data: &[u8]) -> bool {
        let len = data.len();
        if let Some(span) = self.mem.write_span(addr, len) {
            if span.fired {
                self.notify_trace(addr);
            }
            span.backing.borrow_mut()[span.offset..span.offset + len].copy_from_slice(data);
            return true;
        }
        if len > 1 && self.mem.is_write_mapped(addr) {
            for (i, byte) in data.iter().enumerate() {
                let a = addr.wrapping_add(index_u32(i));
                if let Some(span) = self.mem.write_span(a, 1) {
                    if span.fired {
                        self.notify_trace(a);
                    }
                    span.backing.borrow_mut()[span.offset] = *byte;
                } else {
                    tracing::warn!(
                        addr = format_args!("{a:#010x}"),
                        "write ran off the end of mapped memory; dropping tail"
                    );
                }
            }
            return true;
        }
        false
    }

    // --- io dispatch ------------------------------------------------------

    pub(crate) fn io_read(&mut self, addr: u32, width: AccessWidth) -> u64 {
        let Some(reg) = self.io.lookup(addr) else {
            tracing::warn!(
                addr = format_args!("{addr:#010x}"),
                bits = width.bits(),
                "read with no io handler; returning 0"
            );
            return 0;
        };
        self.dispatch_read(&reg, addr, width)
    }

    pub(crate) fn io_write(&mut self, addr: u32, value: u64, width: AccessWidth) {
        let Some(reg) = self.io.lookup(addr) else {
            tracing::warn!(
                addr = format_args!("{addr:#010x}"),
                bits = width.bits(),
                "write with no io handler; dropped"
            );
            return;
        };
        self.dispatch_write(&reg, addr, value, width);
    }

    /// One-shot page-trace notification, routed through the IO dispatch
    /// seam so invalidation listeners hear about the write before it lands.
    pub(crate) fn notify_trace(&mut self, addr: u32) {
        if let Some(reg) = self.io.lookup(addr) {
            let handler = Rc::clone(&reg.handler);
            handler.borrow_mut().trace_notify(self, addr);
        } else {
            tracing::debug!(
                addr = format_args!("{addr:#010x}"),
                "page trace fired with no listener registered"
            );
        }
    }

    fn dispatch_read(&mut self, reg: &Registration, addr: u32, width: AccessWidth) -> u64 {
        let native = reg.width.bytes();
        let access = width.bytes();
        if access == native {
            return u64::from(self.call_read_swapped(reg, addr));
        }
        if access < native {
            let aligned = addr & !(native - 1);
            if reg.flags.contains(IoFlags::PARTIAL_READ_REALIGN) {
                let raw = self.call_read_raw(reg, aligned);
                let lane = addr & (native - 1);
                let shift = match reg.order {
                    ByteOrder::Little => lane,
                    ByteOrder::Big => (native - access).saturating_sub(lane),
                } * 8;
                let field = (u64::from(raw) >> shift) & width_mask(access);
                return if access > 1 && reg.swaps() {
                    u64::from(swap_access(truncate::<u32>(field), access))
                } else {
                    field
                };
            }
            // Default partial-read policy: promote to native width, call
            // through, hand back the low bits.
            return u64::from(self.call_read_swapped(reg, aligned)) & width_mask(access);
        }
        // Wider than native: fill what the handler covers, leave the rest
        // zero unless the following handler is pulled in.
        let mut value = u64::from(self.call_read_swapped(reg, addr));
        if reg.flags.contains(IoFlags::OVERSIZE_READ_NEXT) {
            let next_addr = addr.wrapping_add(native);
            if let Some(next) = self.io.lookup(next_addr) {
                let hi = u64::from(self.call_read_swapped(&next, next_addr));
                value |= hi << (native * 8);
            } else {
                tracing::warn!(
                    addr = format_args!("{next_addr:#010x}"),
                    "oversized read found no following handler; upper bits are 0"
                );
            }
        }
        value & width_mask(access)
    }

    fn dispatch_write(&mut self, reg: &Registration, addr: u32, value: u64, width: AccessWidth) {
        let native = reg.width.bytes();
        let access = width.bytes();
        if access == native {
            self.call_write(reg, addr, truncate::<u32>(value));
            return;
        }
        if access < native {
            if reg.flags.contains(IoFlags::PARTIAL_WRITE_RMW) {
                // The merge semantics of the original are unspecified, so
                // the flag only marks the gap; the write still goes through
                // the default promoted path.
                tracing::warn!(
                    addr = format_args!("{addr:#010x}"),
                    "partial-write read-modify-write merge not implemented; promoting"
                );
            }
            let aligned = addr & !(native - 1);
            self.call_write(reg, aligned, truncate::<u32>(value & width_mask(access)));
            return;
        }
        self.call_write(reg, addr, truncate::<u32>(value & width_mask(native)));
        if reg.flags.contains(IoFlags::OVERSIZE_WRITE_NEXT) {
            let next_addr = addr.wrapping_add(native);
            if let Some(next) = self.io.lookup(next_addr) {
                let hi = (value >> (native * 8)) & width_mask(next.width.bytes());
                self.call_write(&next, next_addr, truncate::<u32>(hi));
            } else {
                tracing::warn!(
                    addr = format_args!("{next_addr:#010x}"),
                    "oversized write found no following handler; upper bits dropped"
                );
            }
        }
    }

    fn call_read_raw(&mut self, reg: &Registration, addr: u32) -> u32 {
        let handler = Rc::clone(&reg.handler);
        let mut handler = handler.borrow_mut();
        handler.read(self, addr)
    }

    fn call_read_swapped(&mut self, reg: &Registration, addr: u32) -> u32 {
        let raw = self.call_read_raw(reg, addr);
        if reg.swaps() {
            swap_native(raw, reg.width)
        } else {
            raw
        }
    }

    fn call_write(&mut self, reg: &Registration, addr: u32, value: u32) {
        let value = if reg.swaps() {
            swap_native(value, reg.width)
        } else {
            value
        };
        let handler = Rc::clone(&reg.handler);
        handler.borrow_mut().write(self, addr, value);
    }

    // --- mapping API (passive memory) -------------------------------------

    /// Maps `[base, base + window)` over `backing`, selecting flat blocks or
    /// two-level granules automatically. The backing repeats cyclically when
    /// the window exceeds it. This is the one entry point a device's `map`
    /// callback should use for passive memory.
    ///
    /// # Panics
    ///
    /// Panics when part of the range cannot be represented at any supported
    /// granularity; that is a device-model configuration bug, not a runtime
    /// condition.
    pub fn map_range(&mut self, base: u32, backing: &BackingStore, window: u32, flags: MapFlags) {
        self.mem.map_range(base, backing, window, flags);
    }

    /// Exact inverse of [`Self::map_range`]; tolerates flat, two-level, or
    /// mixed prior state (e.g. after a trace split).
    ///
    /// # Panics
    ///
    /// Panics on bounds `map_range` could never have accepted.
    pub fn unmap_range(&mut self, base: u32, window: u32) {
        self.mem.unmap_range(base, window);
    }

    // --- registration API (active registers) ------------------------------

    /// Registers an 8-bit handler at `addr` with host byte order and default
    /// access policies.
    ///
    /// # Panics
    ///
    /// Panics on duplicate registration at an already-bound address.
    pub fn add_io8(&mut self, addr: u32, handler: SharedHandler) {
        self.add_io8_flagged(addr, handler, ByteOrder::host(), IoFlags::empty());
    }

    /// Registers an 8-bit handler with an explicit byte order and policy
    /// flags.
    ///
    /// # Panics
    ///
    /// Panics on duplicate registration at an already-bound address.
    pub fn add_io8_flagged(
        &mut self,
        addr: u32,
        handler: SharedHandler,
        order: ByteOrder,
        flags: IoFlags,
    ) {
        self.add_io(addr, handler, NativeWidth::W8, order, flags);
    }

    /// Registers a 16-bit handler at `addr` with host byte order and default
    /// access policies.
    ///
    /// # Panics
    ///
    /// Panics on duplicate registration at an already-bound address.
    pub fn add_io16(&mut self, addr: u32, handler: SharedHandler) {
        self.add_io16_flagged(addr, handler, ByteOrder::host(), IoFlags::empty());
    }

    /// Registers a 16-bit handler with an explicit byte order and policy
    /// flags.
    ///
    /// # Panics
    ///
    /// Panics on duplicate registration at an already-bound address.
    pub fn add_io16_flagged(
        &mut self,
        addr: u32,
        handler: SharedHandler,
        order: ByteOrder,
        flags: IoFlags,
    ) {
        self.add_io(addr, handler, NativeWidth::W16, order, flags);
    }

    /// Registers a 32-bit handler at `addr` with host byte order and default
    /// access policies.
    ///
    /// # Panics
    ///
    /// Panics on duplicate registration at an already-bound address.
    pub fn add_io32(&mut self, addr: u32, handler: SharedHandler) {
        self.add_io32_flagged(addr, handler, ByteOrder::host(), IoFlags::empty());
    }

    /// Registers a 32-bit handler with an explicit byte order and policy
    /// flags.
    ///
    /// # Panics
    ///
    /// Panics on duplicate registration at an already-bound address.
    pub fn add_io32_flagged(
        &mut self,
        addr: u32,
        handler: SharedHandler,
        order: ByteOrder,
        flags: IoFlags,
    ) {
        self.add_io(addr, handler, NativeWidth::W32, order, flags);
    }

    fn add_io(
        &mut self,
        addr: u32,
        handler: SharedHandler,
        width: NativeWidth,
        order: ByteOrder,
        flags: IoFlags,
    ) {
        self.io.add_single(
            addr,
            Registration {
                width,
                order,
                flags,
                handler,
            },
        );
    }

    /// Unregisters the 8-bit handler at `addr`. Logs and returns on an
    /// address that was never registered.
    pub fn remove_io8(&mut self, addr: u32) {
        self.io.remove_single(addr, NativeWidth::W8);
    }

    /// Unregisters the 16-bit handler at `addr`, including all of its byte
    /// replicas when it was registered with [`IoFlags::BYTE_REPLICATE`].
    pub fn remove_io16(&mut self, addr: u32) {
        self.io.remove_single(addr, NativeWidth::W16);
    }

    /// Unregisters the 32-bit handler at `addr`, including all of its byte
    /// replicas when it was registered with [`IoFlags::BYTE_REPLICATE`].
    pub fn remove_io32(&mut self, addr: u32) {
        self.io.remove_single(addr, NativeWidth::W32);
    }

    /// Registers one shared handler across `[base, base + len)`.
    ///
    /// IO regions are assumed disjoint from direct-memory mappings at the
    /// same addresses; direct memory wins deterministically when both exist,
    /// and the registry does not defend against the overlap.
    ///
    /// # Panics
    ///
    /// Panics on duplicate registration over an already-bound position.
    pub fn add_io_region(
        &mut self,
        base: u32,
        len: u32,
        handler: SharedHandler,
        width: NativeWidth,
        order: ByteOrder,
        flags: IoFlags,
    ) {
        self.io.add_region(
            base,
            len,
            Registration {
                width,
                order,
                flags,
                handler,
            },
        );
    }

    /// Removes a region registration. Must mirror the bounds of the
    /// matching [`Self::add_io_region`] call exactly.
    pub fn remove_io_region(&mut self, base: u32, len: u32) {
        self.io.remove_region(base, len);
    }
}

fn index_u32(i: usize) -> u32 {
    u32::try_from(i).unwrap_or(u32::MAX)
}

const fn width_mask(bytes: u32) -> u64 {
    if bytes >= 8 {
        u64::MAX
    } else {
        (1_u64 << (bytes * 8)) - 1
    }
}

fn truncate<T: TryFrom<u64>>(value: u64) -> T {
    T::try_from(value & mask_for::<T>()).unwrap_or_else(|_| unreachable!())
}

#[allow(clippy::cast_possible_truncation)]
const fn mask_for<T>() -> u64 {
    let bytes = std::mem::size_of::<T>() as u32;
    width_mask(bytes)
}

const fn swap_access(value: u32, bytes: u32) -> u32 {
    match bytes {
        2 => swap_native(value, NativeWidth::W16),
        4 => swap_native(value, NativeWidth::W32),
        _ => value,
    }
}

#[cfg(test)]
mod tests {
    use super::{width_mask, Bus, BusConfig};
    use crate::error::BusError;
    use crate::map::{new_backing, MapFlags};

    fn bus() -> Bus {
        Bus::new(&BusConfig::default(), Box::new(|| {})).expect("valid default config")
    }

    #[test]
    fn granule_validation_rejects_bad_configs() {
        let err = Bus::new(&BusConfig { granule: 0x300 }, Box::new(|| {}));
        assert_eq!(
            err.err(),
            Some(BusError::GranuleNotPowerOfTwo { granule: 0x300 })
        );

        let err = Bus::new(&BusConfig { granule: 1 }, Box::new(|| {}));
        assert_eq!(err.err(), Some(BusError::GranuleOutOfRange { granule: 1 }));

        let err = Bus::new(&BusConfig { granule: 0x0020_0000 }, Box::new(|| {}));
        assert_eq!(
            err.err(),
            Some(BusError::GranuleOutOfRange {
                granule: 0x0020_0000
            })
        );
    }

    #[test]
    fn io_granule_is_coarser_than_the_memory_granule() {
        let bus = bus();
        assert_eq!(bus.granule(), 0x1000);
        assert_eq!(bus.io_granule(), 0x4000);
    }

    #[test]
    fn typed_round_trip_through_flat_memory() {
        let mut bus = bus();
        let backing = new_backing(0x8000);
        bus.map_range(0x0010_0000, &backing, 0x8000, MapFlags::all());

        bus.write32(0x0010_0100, 0xDEAD_BEEF);
        assert_eq!(bus.read32(0x0010_0100), 0xDEAD_BEEF);
        bus.write64(0x0010_0200, 0x0123_4567_89AB_CDEF);
        assert_eq!(bus.read64(0x0010_0200), 0x0123_4567_89AB_CDEF);
    }

    #[test]
    fn unmapped_reads_are_zero_and_writes_are_dropped() {
        let mut bus = bus();
        bus.write32(0x4000_0000, 0x1234_5678);
        assert_eq!(bus.read32(0x4000_0000), 0);
        assert_eq!(bus.read8(0x4000_0000), 0);
    }

    #[test]
    fn bulk_copies_cross_granule_boundaries() {
        let mut bus = bus();
        let backing = new_backing(0x2000);
        bus.map_range(0x0020_0000, &backing, 0x2000, MapFlags::all());

        let data: Vec<u8> = (0_u8..16).collect();
        bus.write_bytes(0x0020_0FF8, &data);
        let mut readback = [0_u8; 16];
        bus.read_bytes(0x0020_0FF8, &mut readback);
        assert_eq!(readback, data.as_slice());
    }

    #[test]
    fn xlated_copies_reflect_within_32_bit_lanes() {
        let mut bus = bus();
        let backing = new_backing(0x1000);
        bus.map_range(0x0030_0000, &backing, 0x1000, MapFlags::all());

        bus.write_bytes_xlated(0x0030_0000, &[1, 2, 3, 4]);
        assert_eq!(backing.borrow()[0..4], [4, 3, 2, 1]);

        let mut readback = [0_u8; 4];
        bus.read_bytes_xlated(0x0030_0000, &mut readback);
        assert_eq!(readback, [1, 2, 3, 4]);
    }

    #[test]
    fn width_mask_saturates_at_64_bits() {
        assert_eq!(width_mask(1), 0xFF);
        assert_eq!(width_mask(4), 0xFFFF_FFFF);
        assert_eq!(width_mask(8), u64::MAX);
    }
}
