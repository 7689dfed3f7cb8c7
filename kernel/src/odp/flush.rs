//! Write-back and invalidation of resident pages

use critical_section::CriticalSection;

use super::pin::last_byte;
use super::{OdpEngine, OdpResult};
use crate::arch::{DmaHardware, MpuHardware};
use crate::dma::DmaEngine;
use crate::memory::VirtualAddress;
use crate::mpu::MpuManager;

impl OdpEngine {
    /// Write back every dirty data page
    pub fn flush_all<M: MpuHardware, D: DmaHardware>(
        &mut self,
        _cs: CriticalSection<'_>,
        mpu: &mut MpuManager<M>,
        dma: &mut DmaEngine<D>,
    ) -> OdpResult<()> {
        self.flush_where(mpu, dma, false, |_| true)
    }

    /// Write back every dirty data page, then unmap every unpinned page
    pub fn flush_invalidate_all<M: MpuHardware, D: DmaHardware>(
        &mut self,
        _cs: CriticalSection<'_>,
        mpu: &mut MpuManager<M>,
        dma: &mut DmaEngine<D>,
    ) -> OdpResult<()> {
        self.flush_where(mpu, dma, true, |_| true)
    }

    /// Write back dirty data pages overlapping `[base, base + len)`
    pub fn flush_range<M: MpuHardware, D: DmaHardware>(
        &mut self,
        _cs: CriticalSection<'_>,
        mpu: &mut MpuManager<M>,
        dma: &mut DmaEngine<D>,
        base: VirtualAddress,
        len: usize,
    ) -> OdpResult<()> {
        self.flush_where(mpu, dma, false, overlapping(base, len)?)
    }

    /// Write back and unmap unpinned pages overlapping `[base, base + len)`
    pub fn flush_invalidate_range<M: MpuHardware, D: DmaHardware>(
        &mut self,
        _cs: CriticalSection<'_>,
        mpu: &mut MpuManager<M>,
        dma: &mut DmaEngine<D>,
        base: VirtualAddress,
        len: usize,
    ) -> OdpResult<()> {
        self.flush_where(mpu, dma, true, overlapping(base, len)?)
    }

    fn flush_where<M: MpuHardware, D: DmaHardware>(
        &mut self,
        mpu: &mut MpuManager<M>,
        dma: &mut DmaEngine<D>,
        invalidate: bool,
        matches: impl Fn((VirtualAddress, usize)) -> bool,
    ) -> OdpResult<()> {
        // The straddle cache is meaningless once pages move.
        self.last_fault = None;

        for p in 0..self.pages.len() {
            let page = *self.tcm_page(p);
            let Some(va) = page.va else { continue };
            if !matches((va, self.page_size(page.region()))) {
                continue;
            }
            if invalidate && !page.is_pinned() {
                self.evict(mpu, dma, p)?;
            } else {
                self.write_back(mpu, dma, p)?;
            }
        }
        Ok(())
    }
}

/// Predicate: page `(va, size)` overlaps `[base, base + len)`
fn overlapping(
    base: VirtualAddress,
    len: usize,
) -> OdpResult<impl Fn((VirtualAddress, usize)) -> bool> {
    if len != 0 {
        last_byte(base, len)?;
    }
    let start = base.as_usize();
    Ok(move |(va, size): (VirtualAddress, usize)| {
        let va = va.as_usize();
        if start <= va { va - start < len } else { start - va < size }
    })
}
