//! Architecture Abstraction Layer
//!
//! Hardware-facing interfaces consumed by the memory core. The MPU and the
//! DMA queue are reached only through the [`MpuHardware`] and [`DmaHardware`]
//! traits, so the paging algorithms stay independent of chip register
//! layouts. [`riscv`] holds the memory-mapped implementations used on the
//! target; `platform::sim` provides the host-side ones used by tests.
//!
//! # Design Principles
//! - Minimal abstraction overhead
//! - Clear separation of architecture-specific code
//! - Safe abstractions over unsafe hardware operations

#![deny(missing_docs)]
#![warn(clippy::undocumented_unsafe_blocks)]

use core::cell::Cell;
use core::fmt;

use bitflags::bitflags;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_time::Instant;

use crate::dma::DmaCommand;

pub mod riscv;

bitflags! {
    /// MPU attribute register bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MpuAttr: u32 {
        /// User read
        const UR = 1 << 0;
        /// User write
        const UW = 1 << 1;
        /// User execute
        const UX = 1 << 2;
        /// Supervisor read
        const SR = 1 << 3;
        /// Supervisor write
        const SW = 1 << 4;
        /// Supervisor execute
        const SX = 1 << 5;
        /// Cacheable
        const CACHEABLE = 1 << 6;
        /// Coherent with the DMA fabric
        const COHERENT = 1 << 7;
    }
}

impl MpuAttr {
    /// Read-only code mapping
    pub const CODE: Self = Self::UR.union(Self::UX).union(Self::SR).union(Self::SX);
    /// Read-write data mapping
    pub const DATA: Self = Self::UR.union(Self::UW).union(Self::SR).union(Self::SW);

    /// Whether the mapping allows writes from any privilege level
    pub const fn writable(self) -> bool {
        self.intersects(Self::UW.union(Self::SW))
    }
}

/// Contents of one hardware MPU slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MpuRegion {
    /// Virtual base address
    pub va: usize,
    /// Physical base address
    pub pa: u64,
    /// Length in bytes
    pub range: usize,
    /// Attribute bits
    pub attr: MpuAttr,
    /// Valid bit of the VA register
    pub valid: bool,
}

impl MpuRegion {
    /// Whether `va` falls inside this region
    pub const fn contains(&self, va: usize) -> bool {
        va >= self.va && va - self.va < self.range
    }
}

/// Hardware MPU register access.
///
/// Models a selector register plus four per-slot registers (VA with valid
/// bit, PA, range, attributes) and a per-slot dirty bit set by hardware on
/// the first write through the mapping.
pub trait MpuHardware {
    /// Number of hardware slots
    fn slot_count(&self) -> usize;

    /// Program all four registers of `slot` and set its valid bit
    fn write(&mut self, slot: usize, region: &MpuRegion);

    /// Flip only the valid bit of `slot`
    fn set_valid(&mut self, slot: usize, valid: bool);

    /// Read back `slot`
    fn read(&self, slot: usize) -> MpuRegion;

    /// Dirty bit of `slot`
    fn is_dirty(&self, slot: usize) -> bool;

    /// Clear the dirty bit of `slot`
    fn clear_dirty(&mut self, slot: usize);
}

bitflags! {
    /// DMA queue status bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DmaStatus: u32 {
        /// Queue empty and engine idle
        const IDLE = 1 << 0;
        /// No room for another command
        const FULL = 1 << 1;
        /// Last transfer was rejected by the fabric
        const NACK = 1 << 2;
        /// Backing aperture gated (low-power state)
        const SUSPENDED = 1 << 3;
    }
}

/// Memory ordering operation around DMA
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceKind {
    /// Invalidate the data cache and fence all memory and I/O
    InvalidateAndFence,
    /// Fence only; used when the aperture is known to be inaccessible
    Light,
}

/// Hardware DMA queue access
pub trait DmaHardware {
    /// Current status register
    fn status(&self) -> DmaStatus;

    /// Clear the NACK latch
    fn clear_nack(&mut self);

    /// Push one block command; the queue must not be full
    fn issue(&mut self, cmd: &DmaCommand);

    /// Ordering barrier between the core and the DMA engine
    fn fence(&mut self, kind: FenceKind);

    /// Monotonic timestamp used for timeouts and statistics
    fn now(&self) -> Instant;
}

/// Console hook installed by the debug print subsystem
pub type ConsoleHook = fn(&str);

static CONSOLE: Mutex<CriticalSectionRawMutex, Cell<Option<ConsoleHook>>> =
    Mutex::new(Cell::new(None));

/// Route debug output to `hook`
pub fn install_console(hook: ConsoleHook) {
    CONSOLE.lock(|c| c.set(Some(hook)));
}

/// Debug writer forwarding to the installed console
pub struct DebugWriter {
    hook: Option<ConsoleHook>,
}

impl DebugWriter {
    /// Snapshot the current console hook
    pub fn new() -> Self {
        Self {
            hook: CONSOLE.lock(Cell::get),
        }
    }
}

impl Default for DebugWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Write for DebugWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        if let Some(hook) = self.hook {
            hook(s);
        }
        Ok(())
    }
}

/// Stop the hart permanently
pub fn halt() -> ! {
    riscv::halt()
}
