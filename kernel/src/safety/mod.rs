//! Zero OS Safety Systems
//!
//! Fail-fast path for conditions the memory core cannot recover from.
//! Continuing with an inconsistent protection state is worse than stopping,
//! so these are never surfaced as `Err`: the caller dumps whatever state it
//! owns and then calls [`fatal`], which logs the reason and halts.
//!
//! # Fault Model
//!
//! - DMA engine wedged (idle or not-full timeout)
//! - MPU slot stolen from an owner that still needs it
//! - Page bookkeeping disagreeing with the VA lookup tables
//! - An index into the page, pool or slot tables falling outside them

#![deny(missing_docs)]
#![warn(clippy::undocumented_unsafe_blocks)]

use core::fmt;

/// Unrecoverable invariant violations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalReason {
    /// DMA queue did not drain in time
    DmaIdleTimeout,
    /// DMA queue stayed full in time
    DmaNotFullTimeout,
    /// Hardware slot reassigned while its owner still required it
    SlotStolenFromLiveOwner {
        /// Hardware slot
        slot: usize,
    },
    /// Soft entry bookkeeping corrupted
    EntryCorrupted {
        /// Soft entry index
        entry: usize,
    },
    /// TCM page record disagrees with the VA lookup tables
    PageInconsistent {
        /// TCM page index
        page: usize,
        /// Virtual address being serviced
        va: usize,
    },
    /// ODP slot pool named by a region does not exist
    PoolMissing {
        /// Pool index
        pool: usize,
    },
    /// Hardware slot index past the MPU's slot table
    SlotOutOfRange {
        /// Hardware slot
        slot: usize,
    },
    /// Unhandled memory fault at the trap boundary
    UnhandledFault {
        /// Faulting virtual address
        va: usize,
    },
}

impl fmt::Display for FatalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DmaIdleTimeout => write!(f, "DMA idle timeout"),
            Self::DmaNotFullTimeout => write!(f, "DMA queue-full timeout"),
            Self::SlotStolenFromLiveOwner { slot } => {
                write!(f, "MPU slot {slot} evicted from a live owner")
            }
            Self::EntryCorrupted { entry } => write!(f, "soft MPU entry {entry} corrupted"),
            Self::PageInconsistent { page, va } => {
                write!(f, "TCM page {page} inconsistent for va {va:#x}")
            }
            Self::PoolMissing { pool } => write!(f, "ODP slot pool {pool} missing"),
            Self::SlotOutOfRange { slot } => write!(f, "MPU slot {slot} out of range"),
            Self::UnhandledFault { va } => write!(f, "unhandled memory fault at {va:#x}"),
        }
    }
}

/// Log `reason` and halt the system
#[cold]
#[inline(never)]
pub fn fatal(reason: FatalReason) -> ! {
    debug_print!(ERROR, "FATAL: {}", reason);

    #[cfg(test)]
    #[allow(clippy::panic)]
    {
        panic!("fatal: {reason}");
    }

    #[cfg(not(test))]
    crate::arch::halt()
}
