//! Pinning and physical translation

use critical_section::CriticalSection;
use heapless::Vec;

use super::{MAX_TCM_PAGES, OdpEngine, OdpError, OdpResult, PageFlags};
use crate::arch::{DmaHardware, MpuHardware};
use crate::dma::DmaEngine;
use crate::memory::{PhysicalAddress, SectionId, VirtualAddress};
use crate::mpu::MpuManager;

/// Last byte of a non-empty `[base, base + len)`
pub(super) fn last_byte(base: VirtualAddress, len: usize) -> OdpResult<VirtualAddress> {
    len.checked_sub(1)
        .and_then(|n| base.as_usize().checked_add(n))
        .map(VirtualAddress::new)
        .ok_or(OdpError::InvalidRange)
}

/// Page-aligned VAs covering `[base, last]`
fn covered_pages(
    base: VirtualAddress,
    last: VirtualAddress,
    page_size: usize,
) -> impl Iterator<Item = VirtualAddress> {
    let first = base.align_down(page_size);
    let count = last.align_down(page_size).offset_from(first) / page_size + 1;
    (0..count).map(move |i| first.add(i * page_size))
}

impl OdpEngine {
    /// Fault in and pin every page of `[base, base + len)`.
    ///
    /// Pinning a pinned page is an error, except for the last page of a range
    /// that ends inside it, which may already be pinned by an adjacent buffer.
    /// On failure every page pinned by this call is unpinned again.
    pub fn pin<M: MpuHardware, D: DmaHardware>(
        &mut self,
        _cs: CriticalSection<'_>,
        mpu: &mut MpuManager<M>,
        dma: &mut DmaEngine<D>,
        base: VirtualAddress,
        len: usize,
    ) -> OdpResult<()> {
        if len == 0 {
            return Ok(());
        }
        let end = last_byte(base, len)?;
        let (region, _, _) = self.locate(base)?;
        let page_size = self.page_size(region);
        let partial_tail = end.as_usize() & (page_size - 1) != page_size - 1;
        let last = end.align_down(page_size);

        let mut pinned: Vec<usize, MAX_TCM_PAGES> = Vec::new();
        let mut result = Ok(());
        for va in covered_pages(base, end, page_size) {
            let p = match self.service(mpu, dma, va, false) {
                Ok(p) => p.index(),
                Err(e) => {
                    result = Err(e);
                    break;
                }
            };
            if self.tcm_page(p).is_pinned() {
                if va == last && partial_tail {
                    continue;
                }
                result = Err(OdpError::AlreadyPinned);
                break;
            }
            self.tcm_page_mut(p).flags.insert(PageFlags::PINNED);
            if pinned.push(p).is_err() {
                result = Err(OdpError::NoFreePage);
                break;
            }
        }

        if let Err(e) = result {
            debug_print!(WARN, "odp: pin {} +{:#x} failed: {}", base, len, e);
            for p in pinned {
                self.tcm_page_mut(p).flags.remove(PageFlags::PINNED);
            }
        }
        result
    }

    /// Unpin every page of `[base, base + len)`.
    ///
    /// Checked before any page changes: each page must be resident and pinned.
    pub fn unpin(&mut self, _cs: CriticalSection<'_>, base: VirtualAddress, len: usize) -> OdpResult<()> {
        if len == 0 {
            return Ok(());
        }
        let end = last_byte(base, len)?;
        let (region, _, _) = self.locate(base)?;
        let page_size = self.page_size(region);

        for va in covered_pages(base, end, page_size) {
            let p = self.resident_page(va).ok_or(OdpError::NotResident)?;
            if !self.tcm_page(p.index()).is_pinned() {
                return Err(OdpError::NotPinned);
            }
        }
        for va in covered_pages(base, end, page_size) {
            if let Some(p) = self.resident_page(va) {
                self.tcm_page_mut(p.index()).flags.remove(PageFlags::PINNED);
            }
        }
        Ok(())
    }

    fn pinnable(&self, id: SectionId) -> OdpResult<(VirtualAddress, usize)> {
        let section = self.sections.get(id)?;
        if !section.is_paged() || section.parent.is_some() {
            debug_print!(WARN, "odp: section {} cannot be pinned", section.name);
            return Err(OdpError::InvalidSection);
        }
        Ok((section.virt_start, section.max_size))
    }

    /// Pin a whole paged section
    pub fn pin_section<M: MpuHardware, D: DmaHardware>(
        &mut self,
        cs: CriticalSection<'_>,
        mpu: &mut MpuManager<M>,
        dma: &mut DmaEngine<D>,
        id: SectionId,
    ) -> OdpResult<()> {
        let (base, len) = self.pinnable(id)?;
        self.pin(cs, mpu, dma, base, len)
    }

    /// Unpin a whole paged section
    pub fn unpin_section(&mut self, cs: CriticalSection<'_>, id: SectionId) -> OdpResult<()> {
        let (base, len) = self.pinnable(id)?;
        self.unpin(cs, base, len)
    }

    /// TCM physical address of resident `va` and the bytes left in its page.
    ///
    /// The caller may write through the returned address without MPU
    /// supervision, so data pages are marked dirty.
    #[inline(always)]
    pub fn virt_to_phys(&mut self, _cs: CriticalSection<'_>, va: VirtualAddress) -> OdpResult<(PhysicalAddress, usize)> {
        let (region, _, _) = self.locate(va)?;
        let page_size = self.page_size(region);
        let p = self.resident_page(va).ok_or(OdpError::NotResident)?;
        let page = self.tcm_page_mut(p.index());
        if page.flags.contains(PageFlags::DTCM) {
            page.flags.insert(PageFlags::DIRTY);
        }
        let page = *page;
        let offset = va.as_usize() & (page_size - 1);
        let tcm = self.tcm_window(&page);
        let phys = PhysicalAddress::new(tcm.base + (page.tcm_offset + offset) as u64);
        Ok((phys, page_size - offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn covered_pages_counts_partial_pages() {
        let count = |base, len| {
            let base = VirtualAddress::new(base);
            covered_pages(base, last_byte(base, len).unwrap(), 0x1000).count()
        };
        assert_eq!(count(0x1000, 0x1000), 1);
        assert_eq!(count(0x1000, 0x1001), 2);
        assert_eq!(count(0x1800, 0x1000), 2);
        assert_eq!(count(0x1ffc, 4), 1);
        assert_eq!(count(0x1ffc, 8), 2);
        assert_eq!(count(usize::MAX & !0xfff, 0x1000), 1);
    }

    #[test]
    fn last_byte_rejects_wrapping_ranges() {
        let top = VirtualAddress::new(usize::MAX & !0xfff);
        assert_eq!(last_byte(top, 0x1000), Ok(VirtualAddress::new(usize::MAX)));
        assert_eq!(last_byte(top, 0x1001), Err(OdpError::InvalidRange));
        assert_eq!(last_byte(top, 0), Err(OdpError::InvalidRange));
    }
}
