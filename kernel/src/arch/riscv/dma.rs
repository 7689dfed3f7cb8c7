//! Memory-mapped DMA queue driver
//!
//! ```text
//! +0x00 TCM_OFF  byte offset inside the selected TCM bank
//! +0x04 EXT_LO   aperture offset [31:0]
//! +0x08 EXT_HI   aperture offset [63:32]
//! +0x0C SIZE     block size in bytes
//! +0x10 CMD      writing pushes the command (see CMD_* bits)
//! +0x14 STATUS   IDLE(0) FULL(1) NACK(2, write 1 to clear) SUSPENDED(3)
//! ```

#![deny(missing_docs)]
#![warn(clippy::undocumented_unsafe_blocks)]

use core::ptr::{addr_of, addr_of_mut, read_volatile, write_volatile};

use embassy_time::Instant;

use crate::arch::{DmaHardware, DmaStatus, FenceKind};
use crate::dma::{DmaCommand, DmaDirection};
use crate::memory::{Aperture, TcmKind};

const CMD_WRITE_EXT: u32 = 1 << 0;
const CMD_DTCM: u32 = 1 << 1;
const CMD_SYSMEM: u32 = 1 << 2;
const CMD_SECURE: u32 = 1 << 3;

/// DMA register block
#[repr(C)]
pub struct DmaRegisters {
    tcm_off: u32,
    ext_lo: u32,
    ext_hi: u32,
    size: u32,
    cmd: u32,
    status: u32,
}

/// DMA queue driven through its register block
pub struct MmioDma {
    regs: *mut DmaRegisters,
    mtime: *const u64,
    ticks_per_us: u64,
}

// SAFETY: the register block is only touched inside critical sections
unsafe impl Send for MmioDma {}

impl MmioDma {
    /// Bind the driver to its register block and the machine timer
    ///
    /// # Safety
    ///
    /// `base` must be the DMA register block and `mtime` the free-running
    /// machine timer counter, ticking `ticks_per_us` times per microsecond.
    pub const unsafe fn new(base: usize, mtime: usize, ticks_per_us: u64) -> Self {
        Self {
            regs: base as *mut DmaRegisters,
            mtime: mtime as *const u64,
            ticks_per_us,
        }
    }
}

impl DmaHardware for MmioDma {
    fn status(&self) -> DmaStatus {
        // SAFETY: `regs` points at the DMA block per the constructor contract
        let raw = unsafe { read_volatile(addr_of!((*self.regs).status)) };
        DmaStatus::from_bits_truncate(raw)
    }

    fn clear_nack(&mut self) {
        // SAFETY: `regs` points at the DMA block per the constructor contract
        unsafe { write_volatile(addr_of_mut!((*self.regs).status), DmaStatus::NACK.bits()) };
    }

    fn issue(&mut self, cmd: &DmaCommand) {
        let mut bits = 0;
        if cmd.direction == DmaDirection::FromTcm {
            bits |= CMD_WRITE_EXT;
        }
        if cmd.tcm == TcmKind::Dtcm {
            bits |= CMD_DTCM;
        }
        if cmd.ext.aperture == Aperture::SysMem {
            bits |= CMD_SYSMEM;
        }
        if cmd.secure {
            bits |= CMD_SECURE;
        }
        // SAFETY: `regs` points at the DMA block per the constructor contract
        unsafe {
            write_volatile(addr_of_mut!((*self.regs).tcm_off), cmd.tcm_offset as u32);
            write_volatile(addr_of_mut!((*self.regs).ext_lo), cmd.ext.offset as u32);
            write_volatile(addr_of_mut!((*self.regs).ext_hi), (cmd.ext.offset >> 32) as u32);
            write_volatile(addr_of_mut!((*self.regs).size), cmd.size as u32);
            write_volatile(addr_of_mut!((*self.regs).cmd), bits);
        }
    }

    fn fence(&mut self, kind: FenceKind) {
        super::fence();
        if kind == FenceKind::InvalidateAndFence {
            super::fence_i();
        }
    }

    fn now(&self) -> Instant {
        // SAFETY: `mtime` points at the timer counter per the constructor contract
        let ticks = unsafe { read_volatile(self.mtime) };
        Instant::from_micros(ticks / self.ticks_per_us)
    }
}
