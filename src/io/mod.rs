//! IO handler contracts: the per-register callback trait, declared widths,
//! byte order, and partial/oversized access policy flags.

use std::cell::RefCell;
use std::rc::Rc;

use bitflags::bitflags;

use crate::Bus;

/// Three-tier handler storage and placement.
pub mod registry;

/// One device register or register bank standing in for active hardware.
///
/// Callbacks run at the handler's declared native width; the bus performs
/// all promotion, lane extraction, combining, and byte-order conversion
/// around them. Every callback receives the bus so a register write may
/// reenter it (self-remapping devices, nested registration); calls are
/// strictly sequential on the single execution context.
pub trait IoHandler {
    /// Reads the register at its declared native width.
    fn read(&mut self, bus: &mut Bus, addr: u32) -> u32;

    /// Writes the register at its declared native width.
    fn write(&mut self, bus: &mut Bus, addr: u32, value: u32);

    /// One-shot page-trace notification: fired when a traced page covering
    /// this handler's address is written, before the value lands. The
    /// default does nothing; invalidation listeners override it.
    fn trace_notify(&mut self, bus: &mut Bus, addr: u32) {
        let _ = (bus, addr);
    }
}

/// Shared single-threaded handle under which handlers are registered.
pub type SharedHandler = Rc<RefCell<dyn IoHandler>>;

/// Declared native access width of a registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeWidth {
    /// 8-bit register.
    W8,
    /// 16-bit register.
    W16,
    /// 32-bit register.
    W32,
}

impl NativeWidth {
    /// Width in bytes.
    #[must_use]
    pub const fn bytes(self) -> u32 {
        match self {
            Self::W8 => 1,
            Self::W16 => 2,
            Self::W32 => 4,
        }
    }

    /// Width in bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.bytes() * 8
    }
}

/// Runtime width of one bus access, which may differ from the native width
/// of the handler it lands on (a partial access).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessWidth {
    /// 8-bit access.
    W8,
    /// 16-bit access.
    W16,
    /// 32-bit access.
    W32,
    /// 64-bit access.
    W64,
}

impl AccessWidth {
    /// Width in bytes.
    #[must_use]
    pub const fn bytes(self) -> u32 {
        match self {
            Self::W8 => 1,
            Self::W16 => 2,
            Self::W32 => 4,
            Self::W64 => 8,
        }
    }

    /// Width in bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.bytes() * 8
    }
}

/// Byte order a handler declares for its register contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ByteOrder {
    /// Least significant byte at the lowest address.
    Little,
    /// Most significant byte at the lowest address.
    Big,
}

impl ByteOrder {
    /// The host's byte order.
    #[must_use]
    pub const fn host() -> Self {
        if cfg!(target_endian = "little") {
            Self::Little
        } else {
            Self::Big
        }
    }
}

bitflags! {
    /// Partial/oversized access policies selected at registration time.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct IoFlags: u32 {
        /// Narrow read: extract the sub-field selected by the low address
        /// bits from a full native-width read, instead of returning the low
        /// bits of the promoted value.
        const PARTIAL_READ_REALIGN = 1 << 0;
        /// Narrow write: read-modify-write merge before calling through.
        /// The merge itself is not implemented; see the registry docs.
        const PARTIAL_WRITE_RMW = 1 << 1;
        /// Wide read: combine the immediately following handler into the
        /// upper half instead of leaving it zero.
        const OVERSIZE_READ_NEXT = 1 << 2;
        /// Wide write: forward the upper half to the immediately following
        /// handler instead of dropping it.
        const OVERSIZE_WRITE_NEXT = 1 << 3;
        /// Replicate the registration across every byte address of the
        /// handler's native width, so byte accesses anywhere inside it hit.
        const BYTE_REPLICATE = 1 << 4;
    }
}

/// One bus-owned registration binding a handler to an address.
#[derive(Clone)]
pub(crate) struct Registration {
    pub(crate) width: NativeWidth,
    pub(crate) order: ByteOrder,
    pub(crate) flags: IoFlags,
    pub(crate) handler: SharedHandler,
}

impl Registration {
    /// True when the declared order differs from the host's, requiring a
    /// swap on every read return and write argument.
    pub(crate) fn swaps(&self) -> bool {
        self.order != ByteOrder::host()
    }
}

/// Swaps `value` at the given native width (no-op for 8-bit).
pub(crate) const fn swap_native(value: u32, width: NativeWidth) -> u32 {
    match width {
        NativeWidth::W8 => value,
        NativeWidth::W16 => ((value & 0x00FF) << 8) | ((value & 0xFF00) >> 8),
        NativeWidth::W32 => value.swap_bytes(),
    }
}

#[cfg(test)]
mod tests {
    use super::{swap_native, AccessWidth, ByteOrder, NativeWidth};

    #[test]
    fn widths_report_consistent_sizes() {
        assert_eq!(NativeWidth::W8.bytes(), 1);
        assert_eq!(NativeWidth::W16.bits(), 16);
        assert_eq!(NativeWidth::W32.bytes(), 4);
        assert_eq!(AccessWidth::W64.bits(), 64);
    }

    #[test]
    fn host_order_matches_target_endianness() {
        let expected = if cfg!(target_endian = "little") {
            ByteOrder::Little
        } else {
            ByteOrder::Big
        };
        assert_eq!(ByteOrder::host(), expected);
    }

    #[test]
    fn swap_is_width_limited() {
        assert_eq!(swap_native(0xAB, NativeWidth::W8), 0xAB);
        assert_eq!(swap_native(0x1234, NativeWidth::W16), 0x3412);
        assert_eq!(swap_native(0x1234_5678, NativeWidth::W32), 0x7856_3412);
    }
}
