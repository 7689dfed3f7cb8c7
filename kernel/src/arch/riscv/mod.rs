//! RISC-V Architecture Implementation
//!
//! Memory-mapped MPU and DMA drivers plus the handful of instructions the
//! memory core needs (fences, `wfi`). Host builds get inert fallbacks so the
//! algorithms above can still be exercised by unit tests.
//!
//! Interrupt masking for [`critical_section`] comes from the `riscv` crate's
//! single-hart implementation, enabled in the crate manifest.

#![deny(missing_docs)]
#![warn(clippy::undocumented_unsafe_blocks)]

pub mod dma;
pub mod mpu;

pub use dma::MmioDma;
pub use mpu::MmioMpu;

/// Full memory and I/O fence
#[inline(always)]
pub fn fence() {
    #[cfg(any(target_arch = "riscv32", target_arch = "riscv64"))]
    // SAFETY: `fence` has no operands and only orders memory accesses
    unsafe {
        core::arch::asm!("fence iorw, iorw", options(nostack, preserves_flags));
    }
    #[cfg(not(any(target_arch = "riscv32", target_arch = "riscv64")))]
    core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
}

/// Instruction stream fence, required after DMA writes into ITCM
#[inline(always)]
pub fn fence_i() {
    #[cfg(any(target_arch = "riscv32", target_arch = "riscv64"))]
    // SAFETY: `fence.i` has no operands and only synchronizes instruction fetch
    unsafe {
        core::arch::asm!("fence.i", options(nostack, preserves_flags));
    }
}

/// Halt the hart; only an external reset recovers
pub fn halt() -> ! {
    loop {
        #[cfg(any(target_arch = "riscv32", target_arch = "riscv64"))]
        // SAFETY: `wfi` only stalls the hart until the next interrupt
        unsafe {
            core::arch::asm!("wfi", options(nomem, nostack, preserves_flags));
        }
        #[cfg(not(any(target_arch = "riscv32", target_arch = "riscv64")))]
        core::hint::spin_loop();
    }
}
