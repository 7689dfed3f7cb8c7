//! Zero OS Memory Core
//!
//! Memory virtualization stack for the Zero OS RISC-V microcontroller firmware.
//! It lets a program far larger than the on-chip tightly-coupled memory (TCM)
//! execute by paging code and data in and out of frame-buffer or system memory.
//!
//! # Architecture
//!
//! The core is built from four cooperating subsystems, leaves first:
//! - [`memory::vm`]: flat virtual-address range allocator for dynamic mappings
//! - [`dma`]: block transfer engine driving the fixed-depth hardware DMA queue
//! - [`mpu`]: software MPU that virtualizes a few hardware protection slots
//!   into a larger pool of reference-counted soft entries
//! - [`odp`]: on-demand paging engine (fault servicing, eviction, dirty
//!   write-back, pin/unpin and flush)
//!
//! [`memory::init`] normalizes the link-time section table and brings all of
//! them up as one [`memory::init::MemoryContext`], which
//! [`memory::global::GlobalMemory`] holds for the fault trap, the scheduler
//! and drivers.
//!
//! # Safety
//!
//! All global memory-management state is mutated only while interrupts are
//! masked. Every mutating entry point takes a
//! [`critical_section::CriticalSection`] token as proof. Conditions that
//! would leave memory protection inconsistent are never returned as errors:
//! they go through [`safety::fatal`], which dumps state and halts.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![deny(missing_docs)]
#![warn(clippy::undocumented_unsafe_blocks)]
#![warn(clippy::panic)]
#![warn(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::indexing_slicing, clippy::unwrap_used))]

#[macro_use]
pub mod macros;

pub mod arch;
pub mod dma;
pub mod memory;
pub mod mpu;
pub mod odp;
pub mod platform;
pub mod safety;

// Single-hart `critical-section` implementation.
#[cfg(any(target_arch = "riscv32", target_arch = "riscv64"))]
use riscv as _;

use thiserror_no_std::Error;

use crate::dma::DmaError;
use crate::memory::MemoryError;
use crate::memory::vm::VmError;
use crate::mpu::MpuError;
use crate::odp::OdpError;

/// Coarse error taxonomy shared by every subsystem
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Misaligned address or length, null buffer, out-of-range index
    InvalidArgument,
    /// No free soft entry, hardware slot or TCM page
    ResourceExhausted,
    /// Double pin, unpin of an unpinned page, overlapping range
    IllegalOperation,
    /// DMA suspended by low-power gating, DMA NACK
    Transient,
}

/// Core kernel error types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KernelError {
    /// Section table or address error
    #[error("memory: {0}")]
    Memory(MemoryError),
    /// Virtual address space allocator error
    #[error("vm: {0}")]
    Vm(VmError),
    /// DMA engine error
    #[error("dma: {0}")]
    Dma(DmaError),
    /// Software MPU error
    #[error("mpu: {0}")]
    Mpu(MpuError),
    /// On-demand paging error
    #[error("odp: {0}")]
    Odp(OdpError),
}

impl KernelError {
    /// Classify the error
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Memory(e) => e.kind(),
            Self::Vm(e) => e.kind(),
            Self::Dma(e) => e.kind(),
            Self::Mpu(e) => e.kind(),
            Self::Odp(e) => e.kind(),
        }
    }
}

impl From<MemoryError> for KernelError {
    fn from(e: MemoryError) -> Self {
        Self::Memory(e)
    }
}

impl From<VmError> for KernelError {
    fn from(e: VmError) -> Self {
        Self::Vm(e)
    }
}

impl From<DmaError> for KernelError {
    fn from(e: DmaError) -> Self {
        Self::Dma(e)
    }
}

impl From<MpuError> for KernelError {
    fn from(e: MpuError) -> Self {
        Self::Mpu(e)
    }
}

impl From<OdpError> for KernelError {
    fn from(e: OdpError) -> Self {
        Self::Odp(e)
    }
}

/// Result type for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;
