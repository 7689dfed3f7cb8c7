//! Host simulation of the MPU and DMA hardware
//!
//! Backs the hardware traits with plain memory so the paging algorithms can
//! be exercised by unit tests: DMA commands complete synchronously against
//! byte arrays standing in for ITCM, DTCM and the external apertures, and the
//! MPU keeps a software copy of every slot with a dirty bit tests can set.

use core::cell::Cell;
use std::vec;
use std::vec::Vec;

use embassy_time::Instant;

use crate::arch::{DmaHardware, DmaStatus, FenceKind, MpuHardware, MpuRegion};
use crate::dma::{DmaCommand, DmaDirection};
use crate::memory::{Aperture, MemDesc, TcmKind};
use crate::platform::PlatformConfig;

/// Simulated MPU
#[derive(Debug, Clone)]
pub struct SimMpu {
    slots: Vec<MpuRegion>,
    dirty: Vec<bool>,
    /// Full slot writes performed
    pub writes: usize,
    /// Valid-bit toggles performed
    pub toggles: usize,
}

impl SimMpu {
    /// MPU with `slots` empty slots
    pub fn new(slots: usize) -> Self {
        Self {
            slots: vec![MpuRegion::default(); slots],
            dirty: vec![false; slots],
            writes: 0,
            toggles: 0,
        }
    }

    /// Valid slot mapping `va`, if any
    pub fn slot_for(&self, va: usize) -> Option<usize> {
        self.slots.iter().position(|s| s.valid && s.contains(va))
    }

    /// Model a store through the mapping of `va`; returns false on a fault
    pub fn store(&mut self, va: usize) -> bool {
        match self.slot_for(va) {
            Some(slot) if self.slots[slot].attr.writable() => {
                self.dirty[slot] = true;
                true
            }
            _ => false,
        }
    }
}

impl MpuHardware for SimMpu {
    fn slot_count(&self) -> usize {
        self.slots.len()
    }

    fn write(&mut self, slot: usize, region: &MpuRegion) {
        self.slots[slot] = MpuRegion {
            valid: true,
            ..*region
        };
        self.dirty[slot] = false;
        self.writes += 1;
    }

    fn set_valid(&mut self, slot: usize, valid: bool) {
        self.slots[slot].valid = valid;
        self.toggles += 1;
    }

    fn read(&self, slot: usize) -> MpuRegion {
        self.slots[slot]
    }

    fn is_dirty(&self, slot: usize) -> bool {
        self.dirty[slot]
    }

    fn clear_dirty(&mut self, slot: usize) {
        self.dirty[slot] = false;
    }
}

/// Simulated DMA queue with attached memories
#[derive(Debug)]
pub struct SimDma {
    itcm: Vec<u8>,
    dtcm: Vec<u8>,
    framebuffer: Vec<u8>,
    sysmem: Vec<u8>,
    clock_us: Cell<u64>,
    /// Commands issued, in order
    pub log: Vec<DmaCommand>,
    /// Fences issued, in order
    pub fences: Vec<FenceKind>,
    /// Aperture gated
    pub suspended: bool,
    /// Queue never drains
    pub stalled: bool,
    /// Latch NACK on the next command
    pub nack_next: bool,
    nack: bool,
}

impl SimDma {
    /// Memories sized after `config`'s windows
    pub fn new(config: &PlatformConfig) -> Self {
        Self {
            itcm: vec![0; config.itcm.size as usize],
            dtcm: vec![0; config.dtcm.size as usize],
            framebuffer: vec![0; config.framebuffer.size as usize],
            sysmem: vec![0; config.sysmem.size as usize],
            clock_us: Cell::new(0),
            log: Vec::new(),
            fences: Vec::new(),
            suspended: false,
            stalled: false,
            nack_next: false,
            nack: false,
        }
    }

    /// TCM bank contents
    pub fn tcm(&mut self, tcm: TcmKind) -> &mut [u8] {
        match tcm {
            TcmKind::Itcm => &mut self.itcm,
            TcmKind::Dtcm => &mut self.dtcm,
        }
    }

    /// External memory at `desc`
    pub fn ext(&mut self, desc: MemDesc, len: usize) -> &mut [u8] {
        let mem = match desc.aperture {
            Aperture::FrameBuffer => &mut self.framebuffer,
            Aperture::SysMem => &mut self.sysmem,
        };
        let start = desc.offset as usize;
        &mut mem[start..start + len]
    }

    /// Commands that wrote external memory
    pub fn writebacks(&self) -> usize {
        self.log
            .iter()
            .filter(|c| c.direction == DmaDirection::FromTcm)
            .count()
    }
}

impl DmaHardware for SimDma {
    fn status(&self) -> DmaStatus {
        let mut status = DmaStatus::empty();
        if self.stalled {
            status |= DmaStatus::FULL;
        } else {
            status |= DmaStatus::IDLE;
        }
        if self.nack {
            status |= DmaStatus::NACK;
        }
        if self.suspended {
            status |= DmaStatus::SUSPENDED;
        }
        status
    }

    fn clear_nack(&mut self) {
        self.nack = false;
    }

    fn issue(&mut self, cmd: &DmaCommand) {
        self.log.push(*cmd);
        if self.nack_next {
            self.nack_next = false;
            self.nack = true;
            return;
        }
        let len = cmd.size;
        let tcm_off = cmd.tcm_offset;
        match cmd.direction {
            DmaDirection::ToTcm => {
                let src = self.ext(cmd.ext, len).to_vec();
                self.tcm(cmd.tcm)[tcm_off..tcm_off + len].copy_from_slice(&src);
            }
            DmaDirection::FromTcm => {
                let src = self.tcm(cmd.tcm)[tcm_off..tcm_off + len].to_vec();
                self.ext(cmd.ext, len).copy_from_slice(&src);
            }
        }
    }

    fn fence(&mut self, kind: FenceKind) {
        self.fences.push(kind);
    }

    fn now(&self) -> Instant {
        // Every read advances the clock so busy-polls eventually time out.
        let now = self.clock_us.get();
        self.clock_us.set(now + 1000);
        Instant::from_micros(now)
    }
}

/// Small platform profile that keeps simulated memories cheap
pub fn test_config() -> PlatformConfig {
    use crate::platform::{OdpPoolLayout, Window};

    PlatformConfig {
        itcm: Window::new(0x0010_0000, 4 * 4096),
        dtcm: Window::new(0x0018_0000, 4 * 4096),
        framebuffer: Window::new(0x8000_0000, 1024 * 1024),
        sysmem: Window::new(0x1_0000_0000, 256 * 1024),
        mpu_slots: 16,
        odp_pools: OdpPoolLayout::Split { code: 8..12, data: 12..16 },
        vm_base: 0x4000_0000,
        vm_pages: 16,
        ..PlatformConfig::DEFAULT
    }
}
