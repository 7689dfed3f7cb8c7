//! Fault servicing, replacement and write-back

use critical_section::CriticalSection;
use embassy_time::Instant;

use super::{MissKind, OdpEngine, OdpError, OdpResult, PageFlags, PageIndex, TcmPage, page_at};
use crate::arch::{DmaHardware, MpuHardware, MpuRegion};
use crate::dma::{DmaEngine, DmaError};
use crate::memory::{PagingRegion, SectionId, VirtualAddress};
use crate::mpu::{MpuManager, SlotIndex};
use crate::safety::{FatalReason, fatal};

impl OdpEngine {
    /// Make the page at `va` resident and mapped.
    ///
    /// Called from the memory fault trap, and proactively to bring in a
    /// stack or DMA buffer before it is touched. A repeated fault on the code
    /// page serviced last means an instruction straddles into the next page,
    /// which is brought in instead.
    #[inline(always)]
    pub fn handle_fault<M: MpuHardware, D: DmaHardware>(
        &mut self,
        _cs: CriticalSection<'_>,
        mpu: &mut MpuManager<M>,
        dma: &mut DmaEngine<D>,
        va: VirtualAddress,
    ) -> OdpResult<PageIndex> {
        self.service(mpu, dma, va, true)
    }

    pub(super) fn service<M: MpuHardware, D: DmaHardware>(
        &mut self,
        mpu: &mut MpuManager<M>,
        dma: &mut DmaEngine<D>,
        va: VirtualAddress,
        straddle: bool,
    ) -> OdpResult<PageIndex> {
        let start = dma.hardware().now();
        let (mut region, mut index, mut section) = self.locate(va)?;
        let mut page_va = va.align_down(self.page_size(region));

        if straddle
            && region == PagingRegion::Code
            && self.last_fault == Some(page_va)
            && self.is_mapped_at(region, index)
        {
            let next = page_va.add(self.page_size(region));
            (region, index, section) = self.locate(next)?;
            page_va = next;
            debug_print!(TRACE, "odp: straddle {} -> {}", va, page_va);
        }

        if let Some(p) = self.tables(region).resident(index) {
            self.check_page(p.index(), page_va);
            if self.ensure_slot(mpu, p.index())? {
                self.record(MissKind::Mpu, start, dma);
            }
            self.note_fault(region, page_va);
            return Ok(p);
        }

        let p = self.select_victim(region)?;
        let kind = match (region, self.evict(mpu, dma, p)) {
            (_, Err(e)) => return Err(self.failed(e, start, dma)),
            (PagingRegion::Code, Ok(_)) => MissKind::Code,
            (PagingRegion::Data, Ok(true)) => MissKind::DataDirty,
            (PagingRegion::Data, Ok(false)) => MissKind::DataClean,
        };
        if let Err(e) = self.fill(dma, p, region, index, section, page_va) {
            return Err(self.failed(e, start, dma));
        }
        self.ensure_slot(mpu, p)?;
        self.record(kind, start, dma);
        self.note_fault(region, page_va);
        debug_print!(TRACE, "odp: {} -> page {} ({:?})", page_va, p, kind);
        Ok(PageIndex::new(p))
    }

    fn note_fault(&mut self, region: PagingRegion, page_va: VirtualAddress) {
        if region == PagingRegion::Code {
            self.last_fault = Some(page_va);
        }
    }

    fn failed<D: DmaHardware>(&mut self, e: OdpError, start: Instant, dma: &DmaEngine<D>) -> OdpError {
        if e == OdpError::Dma(DmaError::Suspended) {
            self.record(MissKind::Suspended, start, dma);
        }
        e
    }

    fn record<D: DmaHardware>(&mut self, kind: MissKind, start: Instant, dma: &DmaEngine<D>) {
        let elapsed = dma.hardware().now().duration_since(start);
        self.stats.record(kind, elapsed);
    }

    fn is_mapped_at(&self, region: PagingRegion, index: usize) -> bool {
        self.tables(region)
            .resident(index)
            .and_then(|p| self.pages.get(p.index()))
            .is_some_and(|page| page.mpu_slot.is_some())
    }

    /// Resident page record must agree with the lookup table
    fn check_page(&self, p: usize, page_va: VirtualAddress) {
        let consistent = self
            .pages
            .get(p)
            .is_some_and(|page| page.is_valid() && page.va == Some(page_va));
        if !consistent {
            self.dump();
            fatal(FatalReason::PageInconsistent {
                page: p,
                va: page_va.as_usize(),
            });
        }
    }

    fn select_victim(&mut self, region: PagingRegion) -> OdpResult<usize> {
        let [code, data] = &mut self.regions;
        let tables = match region {
            PagingRegion::Code => code,
            PagingRegion::Data => data,
        };
        let pages = &self.pages;
        tables
            .next_victim(|p| page_at(pages, p).is_pinned())
            .ok_or_else(|| {
                debug_print!(WARN, "odp: every {:?} page is pinned", region);
                OdpError::NoFreePage
            })
    }

    /// Load the backing copy of `page_va` into page `p`
    fn fill<D: DmaHardware>(
        &mut self,
        dma: &mut DmaEngine<D>,
        p: usize,
        region: PagingRegion,
        index: usize,
        section_id: SectionId,
        page_va: VirtualAddress,
    ) -> OdpResult<()> {
        let page_size = self.page_size(region);
        let section = *self.sections.get(section_id)?;
        let entry = self.tables(region).entry(index);
        let offset = page_va.offset_from(section.virt_start);

        // Clean pages come from the run-in-place image until first written back.
        let from_image = self.elf_in_place && Some(section_id) != self.heap_section && !entry.in_framebuffer();
        let source = match section.image_phys {
            Some(image) if from_image => image,
            _ => section.phys_start,
        };
        let desc = self.config.describe(source.add(offset), page_size)?;
        let template = *self.templates.fill(region.tcm());
        dma.odp_xfer(template, self.tcm_page(p).tcm_offset, desc, page_size)?;

        let page = self.tcm_page_mut(p);
        page.va = Some(page_va);
        page.backing = Some(desc);
        page.section = Some(section_id);
        page.flags.insert(PageFlags::VALID);
        page.flags.remove(PageFlags::DIRTY);
        self.tables_mut(region).set_resident(index, Some(PageIndex::new(p)));
        Ok(())
    }

    /// Give page `p` a hardware slot from its pool; true if one was assigned
    pub(super) fn ensure_slot<M: MpuHardware>(&mut self, mpu: &mut MpuManager<M>, p: usize) -> OdpResult<bool> {
        let page = *self.tcm_page(p);
        if page.mpu_slot.is_some() {
            return Ok(false);
        }
        let (Some(va), Some(section)) = (page.va, page.section) else {
            return Err(OdpError::NotResident);
        };
        let attr = self.sections.get(section)?.attr.to_mpu_attr();

        let pool = self.pool_index(page.region());
        let pages = &self.pages;
        let Some(slots) = self.pools.get_mut(pool) else {
            fatal(FatalReason::PoolMissing { pool });
        };
        let k = slots
            .next_slot(|owner| page_at(pages, owner.index()).is_pinned())
            .ok_or(OdpError::NoFreeSlot)?;
        let (start, owner) = (slots.slots.start, slots.owner(k));
        if let Some(owner) = owner {
            self.detach_slot(mpu, owner.index())?;
        }

        let slot = SlotIndex::new(start + k).ok_or(OdpError::NoFreeSlot)?;
        let tcm = self.tcm_window(&page);
        let region = MpuRegion {
            va: va.as_usize(),
            pa: tcm.base + page.tcm_offset as u64,
            range: self.page_size(page.region()),
            attr,
            valid: true,
        };
        mpu.raw_write(slot, &region)?;

        self.pool_mut(page.region()).set_owner(k, Some(PageIndex::new(p)));
        let page = self.tcm_page_mut(p);
        page.mpu_slot = Some(slot);
        page.pool_index = Some(k as u8);
        Ok(true)
    }

    /// Take the hardware slot away from page `p`, keeping its dirty state
    pub(super) fn detach_slot<M: MpuHardware>(&mut self, mpu: &mut MpuManager<M>, p: usize) -> OdpResult<()> {
        let page = self.tcm_page_mut(p);
        let Some(slot) = page.mpu_slot.take() else {
            return Ok(());
        };
        let k = page.pool_index.take();
        let region = page.region();

        if region == PagingRegion::Data && mpu.raw_is_dirty(slot)? {
            self.tcm_page_mut(p).flags.insert(PageFlags::DIRTY);
            mpu.raw_clear_dirty(slot)?;
        }
        mpu.raw_remove(slot)?;

        if let Some(k) = k {
            self.pool_mut(region).set_owner(usize::from(k), None);
        }
        Ok(())
    }

    /// Whether page `p` differs from its backing store
    pub(super) fn is_dirty<M: MpuHardware>(&self, mpu: &MpuManager<M>, page: &TcmPage) -> OdpResult<bool> {
        if page.flags.contains(PageFlags::DIRTY) {
            return Ok(true);
        }
        match page.mpu_slot {
            Some(slot) if page.region() == PagingRegion::Data => Ok(mpu.raw_is_dirty(slot)?),
            _ => Ok(false),
        }
    }

    /// Write a dirty data page back to the frame buffer; true if written
    pub(super) fn write_back<M: MpuHardware, D: DmaHardware>(
        &mut self,
        mpu: &mut MpuManager<M>,
        dma: &mut DmaEngine<D>,
        p: usize,
    ) -> OdpResult<bool> {
        let page = *self.tcm_page(p);
        if page.region() != PagingRegion::Data || !page.is_valid() || !self.is_dirty(mpu, &page)? {
            return Ok(false);
        }
        let (Some(va), Some(section)) = (page.va, page.section) else {
            self.dump();
            fatal(FatalReason::PageInconsistent { page: p, va: 0 });
        };
        let page_size = self.config.data_page_size;
        let section = *self.sections.get(section)?;
        let desc = self
            .config
            .describe(section.phys_start.add(va.offset_from(section.virt_start)), page_size)?;
        dma.odp_xfer(self.templates.dtcm_to_ext, page.tcm_offset, desc, page_size)?;

        if let Some(slot) = page.mpu_slot {
            mpu.raw_clear_dirty(slot)?;
        }
        let record = self.tcm_page_mut(p);
        record.flags.remove(PageFlags::DIRTY);
        record.backing = Some(desc);

        // The frame-buffer copy is authoritative from now on.
        let tables = self.tables_mut(PagingRegion::Data);
        if let Some(i) = tables.index_of(va)
            && let Some(entry) = tables.sections.get_mut(i)
        {
            entry.set_framebuffer();
        }
        self.stats.writebacks = self.stats.writebacks.saturating_add(1);
        Ok(true)
    }

    /// Clean, unmap and forget page `p`; true if it had to be written back
    pub(super) fn evict<M: MpuHardware, D: DmaHardware>(
        &mut self,
        mpu: &mut MpuManager<M>,
        dma: &mut DmaEngine<D>,
        p: usize,
    ) -> OdpResult<bool> {
        if !self.tcm_page(p).is_valid() {
            return Ok(false);
        }
        let written = self.write_back(mpu, dma, p)?;
        self.detach_slot(mpu, p)?;

        let page = self.tcm_page_mut(p);
        let va = page.va.take();
        let region = page.region();
        page.backing = None;
        page.section = None;
        page.flags.remove(PageFlags::VALID | PageFlags::DIRTY | PageFlags::PINNED);
        let tables = self.tables_mut(region);
        if let Some(i) = va.and_then(|va| tables.index_of(va)) {
            tables.set_resident(i, None);
        }
        Ok(written)
    }
}
