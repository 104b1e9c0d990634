//! Shared memory/IO bus core for whole-system hardware emulation.
//!
//! One simulated 32-bit physical address space, shared by every peripheral
//! device model and the CPU emulation. A load or store resolves through the
//! flat block map (coarse, directly backed regions), then the two-level
//! sparse map (finer granules, lazily allocated), then the IO handler
//! registry (active device registers), then a benign no-handler default.
//! Devices install themselves through the mapping protocol and may remap
//! themselves from inside their own register writes.

/// Bus context object, typed access API, and IO dispatch policies.
pub mod bus;
pub use bus::{Bus, BusConfig, InvalidationHook, DEFAULT_GRANULE};

/// Device mapping protocol and the per-device placement records.
pub mod device;
pub use device::{BusDevice, DeviceId, MemMapping};

/// Configuration-error taxonomy.
pub mod error;
pub use error::BusError;

/// IO handler contracts, widths, byte order, and policy flags.
pub mod io;
pub use io::{AccessWidth, ByteOrder, IoFlags, IoHandler, NativeWidth, SharedHandler};

/// Direct-memory translation maps and backing stores.
pub mod map;
pub use map::{
    backing_from_bytes, new_backing, BackingStore, MapFlags, FIRST_LEVEL_SPAN, FLAT_BLOCK_SIZE,
    MAX_GRANULE, MIN_GRANULE,
};

/// Page-tracing API (implemented on [`Bus`]).
pub mod trace;

#[cfg(test)]
use proptest as _;
#[cfg(test)]
use rstest as _;
