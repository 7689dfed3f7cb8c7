//! DMA Transfer Engine
//!
//! Moves blocks between TCM and an external aperture (frame buffer or system
//! memory) through the fixed-depth hardware DMA queue.
//!
//! Two paths are offered:
//! - [`DmaEngine::mem_transfer`]: general purpose. Validates alignment,
//!   splits the buffer into power-of-two hardware blocks and re-translates
//!   the TCM side only when a physical run ends.
//! - [`DmaEngine::odp_xfer`]: lean page path used by the ODP engine. The
//!   queue is empty on entry, the direction is fixed by a precomputed
//!   template and every block is the hardware maximum.
//!
//! Waiting is a bounded busy-poll. A timeout means the engine is wedged and
//! is fatal. The only transient condition is a suspended (power-gated)
//! aperture, which callers may retry after yielding.

#![deny(missing_docs)]
#![warn(clippy::undocumented_unsafe_blocks)]

use core::convert::Infallible;

use embassy_time::Duration;
use thiserror_no_std::Error;

use crate::ErrorKind;
use crate::arch::{DmaHardware, DmaStatus, FenceKind};
use crate::memory::{MemDesc, TcmKind, VirtualAddress};
use crate::platform::DmaConfig;
use crate::safety::{FatalReason, fatal};

/// Address, offset and size granularity of every transfer
pub const DMA_GRANULARITY: usize = 4;

/// DMA errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DmaError {
    /// Address, offset or size not a multiple of the DMA granularity
    #[error("misaligned transfer")]
    Alignment,
    /// Buffer not translatable, or a write into ITCM was requested
    #[error("invalid transfer argument")]
    InvalidArgument,
    /// Backing aperture gated by a low-power state
    #[error("DMA suspended")]
    Suspended,
    /// Last transfer rejected by the fabric
    #[error("DMA NACK")]
    Nack,
}

impl DmaError {
    /// Classify the error
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Alignment | Self::InvalidArgument => ErrorKind::InvalidArgument,
            Self::Suspended | Self::Nack => ErrorKind::Transient,
        }
    }
}

/// Transfer direction, seen from TCM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    /// External memory into TCM
    ToTcm,
    /// TCM out to external memory
    FromTcm,
}

/// One hardware block command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaCommand {
    /// Direction
    pub direction: DmaDirection,
    /// TCM bank
    pub tcm: TcmKind,
    /// Byte offset inside the TCM bank
    pub tcm_offset: usize,
    /// External side
    pub ext: MemDesc,
    /// Block size in bytes (power of two)
    pub size: usize,
    /// Mark the transaction secure
    pub secure: bool,
}

/// Fixed part of an ODP page command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaTemplate {
    /// Direction
    pub direction: DmaDirection,
    /// TCM bank
    pub tcm: TcmKind,
    /// Block size (the hardware maximum)
    pub block: usize,
}

impl DmaTemplate {
    /// Instantiate a block command
    #[inline(always)]
    pub const fn command(&self, tcm_offset: usize, ext: MemDesc) -> DmaCommand {
        DmaCommand {
            direction: self.direction,
            tcm: self.tcm,
            tcm_offset,
            ext,
            size: self.block,
            secure: true,
        }
    }
}

/// Command templates used on the paging hot path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OdpTemplates {
    /// Dirty data page write-back
    pub dtcm_to_ext: DmaTemplate,
    /// Code page fill
    pub ext_to_itcm: DmaTemplate,
    /// Data page fill
    pub ext_to_dtcm: DmaTemplate,
}

impl OdpTemplates {
    /// Precompute the three page templates
    pub const fn new(config: &DmaConfig) -> Self {
        Self {
            dtcm_to_ext: DmaTemplate {
                direction: DmaDirection::FromTcm,
                tcm: TcmKind::Dtcm,
                block: config.max_block,
            },
            ext_to_itcm: DmaTemplate {
                direction: DmaDirection::ToTcm,
                tcm: TcmKind::Itcm,
                block: config.max_block,
            },
            ext_to_dtcm: DmaTemplate {
                direction: DmaDirection::ToTcm,
                tcm: TcmKind::Dtcm,
                block: config.max_block,
            },
        }
    }

    /// Fill template for a TCM bank
    pub const fn fill(&self, tcm: TcmKind) -> &DmaTemplate {
        match tcm {
            TcmKind::Itcm => &self.ext_to_itcm,
            TcmKind::Dtcm => &self.ext_to_dtcm,
        }
    }
}

/// Physically contiguous TCM run backing a virtual address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcmRun {
    /// TCM bank
    pub tcm: TcmKind,
    /// Byte offset inside the bank
    pub offset: usize,
    /// Contiguous bytes from `offset`
    pub len: usize,
}

/// Application transfer between a TCM buffer and external memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaRequest {
    /// TCM-side buffer (paged or resident)
    pub buf: VirtualAddress,
    /// External buffer
    pub desc: MemDesc,
    /// Byte offset into `desc`
    pub offset: u64,
    /// Bytes to move
    pub size: usize,
    /// Direction, seen from TCM
    pub direction: DmaDirection,
    /// Mark the transaction secure
    pub secure: bool,
}

/// DMA engine bound to its hardware queue
pub struct DmaEngine<D: DmaHardware> {
    hw: D,
    config: DmaConfig,
    templates: OdpTemplates,
}

impl<D: DmaHardware> DmaEngine<D> {
    /// Bind the engine to `hw`
    pub fn new(hw: D, config: DmaConfig) -> Self {
        Self {
            hw,
            templates: OdpTemplates::new(&config),
            config,
        }
    }

    /// Queue geometry
    pub const fn config(&self) -> &DmaConfig {
        &self.config
    }

    /// Page command templates
    pub const fn templates(&self) -> &OdpTemplates {
        &self.templates
    }

    /// Hardware access
    pub const fn hardware(&self) -> &D {
        &self.hw
    }

    /// Mutable hardware access
    pub fn hardware_mut(&mut self) -> &mut D {
        &mut self.hw
    }

    /// Whether the backing aperture is currently gated
    pub fn is_suspended(&self) -> bool {
        self.hw.status().contains(DmaStatus::SUSPENDED)
    }

    fn poll_idle(&self) -> nb::Result<(), Infallible> {
        if self.hw.status().contains(DmaStatus::IDLE) {
            Ok(())
        } else {
            Err(nb::Error::WouldBlock)
        }
    }

    fn poll_not_full(&self) -> nb::Result<(), Infallible> {
        if self.hw.status().contains(DmaStatus::FULL) {
            Err(nb::Error::WouldBlock)
        } else {
            Ok(())
        }
    }

    fn wait(
        &self,
        timeout: Duration,
        reason: FatalReason,
        poll: fn(&Self) -> nb::Result<(), Infallible>,
    ) {
        let start = self.hw.now();
        loop {
            match poll(self) {
                Ok(()) => return,
                Err(nb::Error::WouldBlock) => {}
                Err(nb::Error::Other(never)) => match never {},
            }
            if self.hw.now().duration_since(start) > timeout {
                debug_print!(ERROR, "dma: wedged, status {:?}", self.hw.status());
                fatal(reason);
            }
            core::hint::spin_loop();
        }
    }

    /// Spin until the queue drains; fatal after the idle timeout
    pub fn wait_for_idle(&self) {
        self.wait(self.config.idle_timeout, FatalReason::DmaIdleTimeout, Self::poll_idle);
    }

    /// Spin until the queue has room; fatal after the not-full timeout
    pub fn wait_for_not_full(&self) {
        self.wait(
            self.config.not_full_timeout,
            FatalReason::DmaNotFullTimeout,
            Self::poll_not_full,
        );
    }

    /// Check and clear the NACK latch left by the last transfer
    pub fn nack_check_and_clear(&mut self) -> Result<(), DmaError> {
        if self.hw.status().contains(DmaStatus::NACK) {
            self.hw.clear_nack();
            debug_print!(WARN, "dma: transfer NACKed");
            return Err(DmaError::Nack);
        }
        Ok(())
    }

    /// General purpose transfer between a TCM buffer and external memory.
    ///
    /// `translate` resolves a virtual address of `buf` to its TCM run. It is
    /// called once per physical run, not per block.
    #[allow(clippy::too_many_arguments)]
    pub fn mem_transfer<F>(
        &mut self,
        mut translate: F,
        buf: VirtualAddress,
        desc: MemDesc,
        offset: u64,
        size: usize,
        direction: DmaDirection,
        secure: bool,
    ) -> Result<(), DmaError>
    where
        F: FnMut(VirtualAddress) -> Option<TcmRun>,
    {
        let granule = DMA_GRANULARITY as u64;
        let ext_offset = desc
            .offset
            .checked_add(offset)
            .filter(|o| o.checked_add(size as u64).is_some())
            .ok_or(DmaError::InvalidArgument)?;
        if buf.as_usize() as u64 % granule != 0 || ext_offset % granule != 0 || size as u64 % granule != 0 {
            return Err(DmaError::Alignment);
        }
        if size == 0 {
            return Ok(());
        }
        if buf.as_usize() == 0 || buf.as_usize().checked_add(size).is_none() {
            return Err(DmaError::InvalidArgument);
        }
        if self.is_suspended() {
            self.hw.fence(FenceKind::Light);
            return Err(DmaError::Suspended);
        }

        // Validate the first run before any hardware write.
        let first = translate(buf).ok_or(DmaError::InvalidArgument)?;
        self.check_run(&first, ext_offset, size, direction)?;

        self.hw.fence(FenceKind::InvalidateAndFence);
        let result = self.issue_runs(&mut translate, first, buf, desc.add(offset as usize), size, direction, secure);
        self.wait_for_idle();
        self.hw.fence(FenceKind::InvalidateAndFence);
        result?;

        if cfg!(feature = "nack-check") {
            self.nack_check_and_clear()?;
        }
        Ok(())
    }

    fn check_run(
        &self,
        run: &TcmRun,
        ext: u64,
        remaining: usize,
        direction: DmaDirection,
    ) -> Result<(), DmaError> {
        if run.tcm == TcmKind::Itcm && direction == DmaDirection::ToTcm {
            debug_print!(WARN, "dma: refusing write into ITCM");
            return Err(DmaError::InvalidArgument);
        }
        if run.len == 0 {
            return Err(DmaError::InvalidArgument);
        }
        let min = self.config.min_block(run.tcm);
        if run.offset % min != 0 || ext % min as u64 != 0 || remaining % min != 0 {
            return Err(DmaError::Alignment);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn issue_runs<F>(
        &mut self,
        translate: &mut F,
        first: TcmRun,
        buf: VirtualAddress,
        ext: MemDesc,
        size: usize,
        direction: DmaDirection,
        secure: bool,
    ) -> Result<(), DmaError>
    where
        F: FnMut(VirtualAddress) -> Option<TcmRun>,
    {
        let mut run = first;
        let mut done = 0;
        while done < size {
            if run.len == 0 {
                run = translate(buf.add(done)).ok_or(DmaError::InvalidArgument)?;
                self.check_run(&run, ext.offset + done as u64, size - done, direction)?;
            }
            let ext_block = ext.add(done);
            let avail = run.len.min(size - done);
            let block = block_size(
                run.offset,
                ext_block.offset,
                avail,
                self.config.min_block(run.tcm),
                self.config.max_block,
            )
            .ok_or(DmaError::Alignment)?;

            self.wait_for_not_full();
            self.hw.issue(&DmaCommand {
                direction,
                tcm: run.tcm,
                tcm_offset: run.offset,
                ext: ext_block,
                size: block,
                secure,
            });

            run.offset += block;
            run.len -= block;
            done += block;
        }
        Ok(())
    }

    /// Page-sized transfer on the ODP hot path.
    ///
    /// The queue must be empty on entry and `size` a multiple of the maximum
    /// block no larger than the queue capacity, both guaranteed by ODP init.
    #[inline(always)]
    pub fn odp_xfer(
        &mut self,
        template: DmaTemplate,
        tcm_offset: usize,
        ext: MemDesc,
        size: usize,
    ) -> Result<(), DmaError> {
        debug_assert!(self.hw.status().contains(DmaStatus::IDLE));
        debug_assert!(size % template.block == 0 && size <= self.config.queue_capacity());

        if self.is_suspended() {
            self.hw.fence(FenceKind::Light);
            return Err(DmaError::Suspended);
        }
        self.hw.fence(FenceKind::InvalidateAndFence);
        let mut done = 0;
        while done < size {
            self.hw.issue(&template.command(tcm_offset + done, ext.add(done)));
            done += template.block;
        }
        self.wait_for_idle();
        self.hw.fence(FenceKind::InvalidateAndFence);
        Ok(())
    }
}

/// Largest power-of-two block both sides are aligned to, bounded by `avail`
fn block_size(tcm_offset: usize, ext: u64, avail: usize, min: usize, max: usize) -> Option<usize> {
    let mut block = max;
    while block >= min {
        if block <= avail && tcm_offset % block == 0 && ext % block as u64 == 0 {
            return Some(block);
        }
        block >>= 1;
    }
    None
}

#[cfg(test)]
mod tests;
