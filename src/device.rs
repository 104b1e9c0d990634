//! The contract every peripheral model implements to install and remove its
//! presence on the bus, and the protocol that keeps per-device placement
//! records and the CPU-side invalidation seam consistent.

use crate::map::MapFlags;
use crate::Bus;

/// Identity handed out by [`Bus::register_device`]; devices hold on to it
/// and report it from [`BusDevice::device_id`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(pub(crate) usize);

/// One placement record binding a device to a base address and size.
///
/// Created and destroyed only by the mapping protocol, never by a device
/// directly. A device may hold many concurrent mappings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemMapping {
    /// Base address of the placement.
    pub base: u32,
    /// Size of the placement in bytes.
    pub size: u32,
    /// Effective direction flags (requested flags masked by the device's
    /// capability mask).
    pub flags: MapFlags,
}

/// Per-device bookkeeping held by the bus.
pub(crate) struct DeviceRecord {
    pub(crate) caps: MapFlags,
    /// Most-recent mapping first.
    pub(crate) mappings: Vec<MemMapping>,
}

/// The bus-facing identity of a peripheral device model.
///
/// `map`/`unmap` install or remove the device's registrations (direct
/// memory via [`Bus::map_range`], active registers via the registration
/// API). They are invoked only from the mapping protocol, possibly nested
/// inside one of the device's own register writes (bank switching); every
/// nested call must leave the translation tables consistent on return,
/// which is why mapping mutation goes through the protocol entry points
/// only.
///
/// Devices that master the bus themselves (DMA engines, PCI bridges) need
/// no extra contract: their callbacks already receive `&mut Bus` and use
/// the access API directly.
pub trait BusDevice {
    /// The identity obtained from [`Bus::register_device`].
    fn device_id(&self) -> DeviceId;

    /// Installs the device's registrations over `[base, base + size)`.
    fn map(&mut self, bus: &mut Bus, base: u32, size: u32, flags: MapFlags);

    /// Removes the device's registrations from `[base, base + size)`.
    fn unmap(&mut self, bus: &mut Bus, base: u32, size: u32);
}

impl Bus {
    /// Admits a device to the bus with its capability mask (the directions
    /// it can ever be mapped with) and returns its identity.
    pub fn register_device(&mut self, caps: MapFlags) -> DeviceId {
        let id = DeviceId(self.devices.len());
        self.devices.push(DeviceRecord {
            caps,
            mappings: Vec::new(),
        });
        id
    }

    /// Places `dev` at `[base, base + size)`: records the mapping (most
    /// recent first), invokes the device's `map` with the requested flags
    /// masked by its capabilities, then runs the invalidation hook.
    pub fn add_mapping(&mut self, dev: &mut dyn BusDevice, base: u32, size: u32, flags: MapFlags) {
        let id = dev.device_id();
        let effective = flags & self.devices[id.0].caps;
        self.devices[id.0].mappings.insert(
            0,
            MemMapping {
                base,
                size,
                flags: effective,
            },
        );
        dev.map(self, base, size, effective);
        self.run_invalidate();
    }

    /// Removes every mapping of `dev`, invoking its `unmap` per record and
    /// invalidating once at the end.
    pub fn delete_mappings(&mut self, dev: &mut dyn BusDevice) {
        let id = dev.device_id();
        let mappings = std::mem::take(&mut self.devices[id.0].mappings);
        for mapping in &mappings {
            dev.unmap(self, mapping.base, mapping.size);
        }
        self.run_invalidate();
    }

    /// Re-applies every current mapping of `dev`: each one is unmapped and
    /// mapped again with its recorded flags, so the device's `map` callback
    /// can reflect whatever its control registers now decode. Called by
    /// bank-switching devices, typically from inside one of their own
    /// register write handlers; the nesting is synchronous and expected.
    pub fn update_mappings(&mut self, dev: &mut dyn BusDevice) {
        let id = dev.device_id();
        let mappings = self.devices[id.0].mappings.clone();
        for mapping in &mappings {
            dev.unmap(self, mapping.base, mapping.size);
            dev.map(self, mapping.base, mapping.size, mapping.flags);
        }
        self.run_invalidate();
    }

    /// The device's current placements, most recent first.
    #[must_use]
    pub fn mappings(&self, id: DeviceId) -> &[MemMapping] {
        &self.devices[id.0].mappings
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::{BusDevice, DeviceId};
    use crate::map::{new_backing, BackingStore, MapFlags};
    use crate::{Bus, BusConfig};

    struct Ram {
        id: DeviceId,
        backing: BackingStore,
    }

    impl BusDevice for Ram {
        fn device_id(&self) -> DeviceId {
            self.id
        }

        fn map(&mut self, bus: &mut Bus, base: u32, size: u32, flags: MapFlags) {
            bus.map_range(base, &self.backing, size, flags);
        }

        fn unmap(&mut self, bus: &mut Bus, base: u32, size: u32) {
            bus.unmap_range(base, size);
        }
    }

    fn bus_with_counter() -> (Bus, Rc<Cell<u32>>) {
        let counter = Rc::new(Cell::new(0));
        let hook = Rc::clone(&counter);
        let bus = Bus::new(
            &BusConfig::default(),
            Box::new(move || hook.set(hook.get() + 1)),
        )
        .expect("valid config");
        (bus, counter)
    }

    #[test]
    fn add_mapping_records_invokes_and_invalidates() {
        let (mut bus, invalidations) = bus_with_counter();
        let id = bus.register_device(MapFlags::all());
        let mut ram = Ram {
            id,
            backing: new_backing(0x1000),
        };

        bus.add_mapping(&mut ram, 0x0010_0000, 0x1000, MapFlags::all());
        assert_eq!(bus.mappings(id).len(), 1);
        assert_eq!(invalidations.get(), 1);

        bus.write8(0x0010_0000, 0x5A);
        assert_eq!(bus.read8(0x0010_0000), 0x5A);
    }

    #[test]
    fn capability_mask_limits_requested_directions() {
        let (mut bus, _) = bus_with_counter();
        let id = bus.register_device(MapFlags::READABLE);
        let mut rom = Ram {
            id,
            backing: new_backing(0x1000),
        };

        bus.add_mapping(&mut rom, 0x0020_0000, 0x1000, MapFlags::all());
        assert_eq!(bus.mappings(id)[0].flags, MapFlags::READABLE);

        // Write side was never installed, so the store is dropped.
        bus.write8(0x0020_0000, 0xFF);
        assert_eq!(rom.backing.borrow()[0], 0);
    }

    #[test]
    fn delete_mappings_unmaps_everything_and_invalidates_once() {
        let (mut bus, invalidations) = bus_with_counter();
        let id = bus.register_device(MapFlags::all());
        let mut ram = Ram {
            id,
            backing: new_backing(0x1000),
        };

        bus.add_mapping(&mut ram, 0x0010_0000, 0x1000, MapFlags::all());
        bus.add_mapping(&mut ram, 0x0030_0000, 0x1000, MapFlags::all());
        assert_eq!(bus.mappings(id).len(), 2);
        // Most recent first.
        assert_eq!(bus.mappings(id)[0].base, 0x0030_0000);

        let before = invalidations.get();
        bus.delete_mappings(&mut ram);
        assert_eq!(invalidations.get(), before + 1);
        assert!(bus.mappings(id).is_empty());
        assert_eq!(bus.read8(0x0010_0000), 0);
    }
}
