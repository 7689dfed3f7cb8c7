//! Platform Configuration
//!
//! Chip geometry consumed by the memory core: TCM banks, ODP page sizes,
//! DMA queue shape, MPU slot layout and the external apertures the DMA
//! engine can reach. Integrators start from [`PlatformConfig::DEFAULT`]
//! and override what differs on their part.
//!
//! [`sim`] provides host-side MPU and DMA models for tests.

#![deny(missing_docs)]
#![warn(clippy::undocumented_unsafe_blocks)]

use core::ops::Range;

use embassy_time::Duration;

use crate::memory::{Aperture, MemDesc, MemoryError, MemoryResult, PAGE_SIZE, PhysicalAddress, TcmKind};

#[cfg(test)]
pub mod sim;

/// Physical window of one memory bank or aperture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    /// Base physical address
    pub base: u64,
    /// Size in bytes
    pub size: u64,
}

impl Window {
    /// Create a window
    pub const fn new(base: u64, size: u64) -> Self {
        Self { base, size }
    }

    /// Whether `[pa, pa + len)` lies fully inside the window
    pub const fn contains(&self, pa: u64, len: u64) -> bool {
        pa >= self.base && len <= self.size && pa - self.base <= self.size - len
    }
}

/// DMA queue geometry and timeouts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaConfig {
    /// Commands the hardware queue holds
    pub queue_depth: usize,
    /// Smallest block the engine moves to or from ITCM
    pub min_block_itcm: usize,
    /// Smallest block the engine moves to or from DTCM
    pub min_block_dtcm: usize,
    /// Largest block the engine moves in one command
    pub max_block: usize,
    /// Wait for queue drain before declaring the engine wedged
    pub idle_timeout: Duration,
    /// Wait for a free queue slot before declaring the engine wedged
    pub not_full_timeout: Duration,
}

impl DmaConfig {
    /// Minimum block size for a TCM bank
    pub const fn min_block(&self, tcm: TcmKind) -> usize {
        match tcm {
            TcmKind::Itcm => self.min_block_itcm,
            TcmKind::Dtcm => self.min_block_dtcm,
        }
    }

    /// Bytes the whole queue moves without waiting
    pub const fn queue_capacity(&self) -> usize {
        self.queue_depth * self.max_block
    }
}

/// Hardware MPU slots handed to the ODP engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OdpPoolLayout {
    /// Code and data pages share one round-robin pool
    Shared(Range<usize>),
    /// Separate pools for code and data pages
    Split {
        /// Slots for ITCM pages
        code: Range<usize>,
        /// Slots for DTCM pages
        data: Range<usize>,
    },
}

/// Platform configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformConfig {
    /// Instruction TCM
    pub itcm: Window,
    /// Data TCM
    pub dtcm: Window,
    /// Frame-buffer aperture
    pub framebuffer: Window,
    /// System memory aperture
    pub sysmem: Window,
    /// ODP page size for code
    pub code_page_size: usize,
    /// ODP page size for data
    pub data_page_size: usize,
    /// Alignment the MPU requires of region bases
    pub mpu_granularity: usize,
    /// Number of hardware MPU slots
    pub mpu_slots: usize,
    /// Slots reserved for ODP pages
    pub odp_pools: OdpPoolLayout,
    /// Whether soft MPU entries may map external apertures
    pub full_aperture_access: bool,
    /// DMA queue parameters
    pub dma: DmaConfig,
    /// Base of the dynamic VM range
    pub vm_base: usize,
    /// Pages in the dynamic VM range
    pub vm_pages: usize,
}

impl PlatformConfig {
    /// Default profile
    pub const DEFAULT: Self = Self {
        itcm: Window::new(0x0010_0000, 64 * 1024),
        dtcm: Window::new(0x0018_0000, 64 * 1024),
        framebuffer: Window::new(0x8000_0000, 16 * 1024 * 1024),
        sysmem: Window::new(0x1_0000_0000, 16 * 1024 * 1024),
        code_page_size: 4096,
        data_page_size: 4096,
        mpu_granularity: PAGE_SIZE,
        mpu_slots: 64,
        odp_pools: OdpPoolLayout::Split {
            code: 32..48,
            data: 48..64,
        },
        full_aperture_access: false,
        dma: DmaConfig {
            queue_depth: 16,
            min_block_itcm: 16,
            min_block_dtcm: 4,
            max_block: 256,
            idle_timeout: Duration::from_millis(1000),
            not_full_timeout: Duration::from_millis(500),
        },
        vm_base: 0x4000_0000,
        vm_pages: 256,
    };

    /// Window of a TCM bank
    pub const fn tcm(&self, tcm: TcmKind) -> Window {
        match tcm {
            TcmKind::Itcm => self.itcm,
            TcmKind::Dtcm => self.dtcm,
        }
    }

    /// Classify an external physical address range
    pub fn describe(&self, pa: PhysicalAddress, len: usize) -> MemoryResult<MemDesc> {
        let raw = pa.as_u64();
        for (aperture, window) in [
            (Aperture::FrameBuffer, self.framebuffer),
            (Aperture::SysMem, self.sysmem),
        ] {
            if window.contains(raw, len as u64) {
                return Ok(MemDesc {
                    aperture,
                    offset: raw - window.base,
                });
            }
        }
        Err(MemoryError::InvalidAddress)
    }

    /// Whether `[pa, pa + len)` lies in an external aperture
    pub fn is_external(&self, pa: PhysicalAddress, len: usize) -> bool {
        self.describe(pa, len).is_ok()
    }

    /// Basic consistency checks, logged on failure
    pub fn validate(&self) -> MemoryResult<()> {
        let pow2 = [
            self.code_page_size,
            self.data_page_size,
            self.mpu_granularity,
            self.dma.max_block,
            self.dma.min_block_itcm,
            self.dma.min_block_dtcm,
        ];
        if pow2.iter().any(|v| !v.is_power_of_two()) {
            debug_print!(ERROR, "platform: sizes must be powers of two");
            return Err(MemoryError::InvalidSize);
        }
        if self.dma.queue_depth == 0
            || self.dma.min_block_itcm > self.dma.max_block
            || self.dma.min_block_dtcm > self.dma.max_block
        {
            debug_print!(ERROR, "platform: inconsistent DMA queue shape");
            return Err(MemoryError::InvalidSize);
        }
        let pools_fit = match &self.odp_pools {
            OdpPoolLayout::Shared(r) => !r.is_empty() && r.end <= self.mpu_slots,
            OdpPoolLayout::Split { code, data } => {
                !code.is_empty()
                    && !data.is_empty()
                    && code.end <= self.mpu_slots
                    && data.end <= self.mpu_slots
                    && (code.end <= data.start || data.end <= code.start)
            }
        };
        if !pools_fit {
            debug_print!(ERROR, "platform: ODP MPU pools exceed {} slots", self.mpu_slots);
            return Err(MemoryError::InvalidSize);
        }
        Ok(())
    }
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}
