//! Memory-mapped MPU driver
//!
//! The MPU exposes a slot selector and four registers that act on the
//! selected slot:
//!
//! ```text
//! +0x00 INDEX   slot selector
//! +0x04 VLO     VA[31:12] | VALID(bit 0)
//! +0x08 PLO     PA[31:0]
//! +0x0C PHI     PA[63:32]
//! +0x10 RNG     range in bytes
//! +0x14 ATTR    attribute bits | DIRTY(bit 31)
//! ```

#![deny(missing_docs)]
#![warn(clippy::undocumented_unsafe_blocks)]

use core::ptr::{addr_of, addr_of_mut, read_volatile, write_volatile};

use crate::arch::{MpuAttr, MpuHardware, MpuRegion};

const VALID: u32 = 1 << 0;
const DIRTY: u32 = 1 << 31;

/// MPU register block
#[repr(C)]
pub struct MpuRegisters {
    index: u32,
    vlo: u32,
    plo: u32,
    phi: u32,
    rng: u32,
    attr: u32,
}

/// MPU driven through its register block
pub struct MmioMpu {
    regs: *mut MpuRegisters,
    slots: usize,
}

// SAFETY: the register block is only touched inside critical sections
unsafe impl Send for MmioMpu {}

impl MmioMpu {
    /// Bind the driver to the register block at `base`
    ///
    /// # Safety
    ///
    /// `base` must be the MPU register block, and no other code may program
    /// the MPU for the lifetime of the driver.
    pub const unsafe fn new(base: usize, slots: usize) -> Self {
        Self {
            regs: base as *mut MpuRegisters,
            slots,
        }
    }

    fn select(&self, slot: usize) {
        // SAFETY: `regs` points at the MPU block per the constructor contract
        unsafe { write_volatile(addr_of_mut!((*self.regs).index), slot as u32) };
    }

    fn read_reg(&self, reg: Reg) -> u32 {
        // SAFETY: `regs` points at the MPU block per the constructor contract
        unsafe {
            match reg {
                Reg::Vlo => read_volatile(addr_of!((*self.regs).vlo)),
                Reg::Plo => read_volatile(addr_of!((*self.regs).plo)),
                Reg::Phi => read_volatile(addr_of!((*self.regs).phi)),
                Reg::Rng => read_volatile(addr_of!((*self.regs).rng)),
                Reg::Attr => read_volatile(addr_of!((*self.regs).attr)),
            }
        }
    }

    fn write_reg(&mut self, reg: Reg, value: u32) {
        // SAFETY: `regs` points at the MPU block per the constructor contract
        unsafe {
            match reg {
                Reg::Vlo => write_volatile(addr_of_mut!((*self.regs).vlo), value),
                Reg::Plo => write_volatile(addr_of_mut!((*self.regs).plo), value),
                Reg::Phi => write_volatile(addr_of_mut!((*self.regs).phi), value),
                Reg::Rng => write_volatile(addr_of_mut!((*self.regs).rng), value),
                Reg::Attr => write_volatile(addr_of_mut!((*self.regs).attr), value),
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Reg {
    Vlo,
    Plo,
    Phi,
    Rng,
    Attr,
}

impl MpuHardware for MmioMpu {
    fn slot_count(&self) -> usize {
        self.slots
    }

    fn write(&mut self, slot: usize, region: &MpuRegion) {
        self.select(slot);
        // Invalidate before rewriting so no half-programmed slot is live.
        self.write_reg(Reg::Vlo, 0);
        self.write_reg(Reg::Plo, region.pa as u32);
        self.write_reg(Reg::Phi, (region.pa >> 32) as u32);
        self.write_reg(Reg::Rng, region.range as u32);
        self.write_reg(Reg::Attr, region.attr.bits());
        self.write_reg(Reg::Vlo, region.va as u32 | VALID);
        super::fence();
    }

    fn set_valid(&mut self, slot: usize, valid: bool) {
        self.select(slot);
        let vlo = self.read_reg(Reg::Vlo);
        let vlo = if valid { vlo | VALID } else { vlo & !VALID };
        self.write_reg(Reg::Vlo, vlo);
        super::fence();
    }

    fn read(&self, slot: usize) -> MpuRegion {
        self.select(slot);
        let vlo = self.read_reg(Reg::Vlo);
        let pa = u64::from(self.read_reg(Reg::Plo)) | (u64::from(self.read_reg(Reg::Phi)) << 32);
        MpuRegion {
            va: (vlo & !VALID) as usize,
            pa,
            range: self.read_reg(Reg::Rng) as usize,
            attr: MpuAttr::from_bits_truncate(self.read_reg(Reg::Attr)),
            valid: vlo & VALID != 0,
        }
    }

    fn is_dirty(&self, slot: usize) -> bool {
        self.select(slot);
        self.read_reg(Reg::Attr) & DIRTY != 0
    }

    fn clear_dirty(&mut self, slot: usize) {
        self.select(slot);
        let attr = self.read_reg(Reg::Attr);
        self.write_reg(Reg::Attr, attr & !DIRTY);
    }
}
