//! Memory init
//!
//! Boot-time normalization of the link-time section table and bring-up of
//! the VM allocator, the software MPU, the DMA engine and the paging engine
//! as one [`MemoryContext`].

use critical_section::CriticalSection;
use heapless::Vec;

use super::vm::VmAllocator;
use super::{
    MAX_SECTIONS, MemoryError, MemoryResult, PAGE_SIZE, PhysicalAddress, SectionId, SectionTable, TcmKind,
    VirtualAddress,
};
use crate::arch::{DmaHardware, MpuHardware};
use crate::dma::{DmaEngine, DmaError, DmaRequest, TcmRun};
use crate::mpu::{EntryHandle, EntryId, MpuManager};
use crate::odp::{MAX_TCM_PAGES, OdpEngine, OdpError};
use crate::platform::PlatformConfig;
use crate::KernelResult;

/// Where the firmware image was placed by the loader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageLayout {
    /// Writable copy of the image in the frame buffer
    pub fb_copy: PhysicalAddress,
    /// Run-in-place image, when the loader leaves one addressable
    pub image_base: Option<PhysicalAddress>,
}

/// Rewrite paged sections from image-relative offsets to absolute addresses.
///
/// On entry `phys_start` of every paged section is its offset inside the
/// firmware image. On return it is the frame-buffer address of the writable
/// copy, and `image_phys` points at the run-in-place copy if there is one.
/// Resident sections already carry their TCM address and are left alone.
pub fn normalize_sections(table: &mut SectionTable, config: &PlatformConfig, layout: ImageLayout) -> MemoryResult<()> {
    for i in 0..table.len() {
        let section = table.get_mut(SectionId::new(i as u8))?;
        if !section.is_paged() {
            continue;
        }
        let offset = section.phys_start.as_u64() as usize;
        let phys = layout.fb_copy.add(offset);
        if config.describe(phys, section.max_size).is_err() {
            debug_print!(ERROR, "init: {} backing {} outside the frame buffer", section.name, phys);
            return Err(MemoryError::InvalidAddress);
        }
        section.phys_start = phys;
        section.image_phys = layout.image_base.map(|base| base.add(offset));
        debug_print!(DEBUG, "init: {} at {} (image {:?})", section.name, phys, section.image_phys);
    }
    Ok(())
}

/// Every memory subsystem, brought up together
pub struct MemoryContext<M: MpuHardware, D: DmaHardware> {
    config: PlatformConfig,
    vm: VmAllocator,
    mpu: MpuManager<M>,
    dma: DmaEngine<D>,
    odp: OdpEngine,
    kernel_entries: Vec<EntryHandle, MAX_SECTIONS>,
}

impl<M: MpuHardware, D: DmaHardware> MemoryContext<M, D> {
    /// Normalize `sections` and start VM, MPU, DMA and ODP in that order.
    ///
    /// Every resident section gets a mapped kernel soft MPU entry.
    pub fn init(
        cs: CriticalSection<'_>,
        config: &PlatformConfig,
        mpu_hw: M,
        dma_hw: D,
        mut sections: SectionTable,
        layout: ImageLayout,
        heap_section: Option<SectionId>,
    ) -> KernelResult<Self> {
        debug_print!(INFO, "init: bringing up memory core");
        config.validate()?;
        normalize_sections(&mut sections, config, layout)?;

        let mut vm = VmAllocator::new();
        vm.init(VirtualAddress::new(config.vm_base), config.vm_pages)?;

        let mut mpu = MpuManager::new(mpu_hw, config);
        let dma = DmaEngine::new(dma_hw, config.dma);
        let odp = OdpEngine::init(cs, config, &sections, heap_section, layout.image_base, &mut mpu)?;

        let mut kernel_entries = Vec::new();
        for (_, section) in sections.iter().filter(|(_, s)| !s.is_paged()) {
            let len = section.max_size.next_multiple_of(config.mpu_granularity);
            let handle = mpu.entry_new(cs, section.phys_start, section.virt_start, len, section.attr.to_mpu_attr())?;
            mpu.entry_map(cs, &handle)?;
            debug_print!(DEBUG, "init: {} resident at {}", section.name, section.virt_start);
            if kernel_entries.push(handle).is_err() {
                return Err(MemoryError::TooManySections.into());
            }
        }

        debug_print!(
            INFO,
            "init: {} sections, {} resident, {} VM pages at {:#x}",
            sections.len(),
            kernel_entries.len(),
            config.vm_pages,
            config.vm_base
        );
        Ok(Self {
            config: config.clone(),
            vm,
            mpu,
            dma,
            odp,
            kernel_entries,
        })
    }

    /// Platform profile the context was built from
    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    /// Dynamic VA allocator
    pub fn vm_mut(&mut self) -> &mut VmAllocator {
        &mut self.vm
    }

    /// Software MPU
    pub fn mpu(&self) -> &MpuManager<M> {
        &self.mpu
    }

    /// Software MPU, for task entry lists and context switches
    pub fn mpu_mut(&mut self) -> &mut MpuManager<M> {
        &mut self.mpu
    }

    /// DMA engine
    pub fn dma(&self) -> &DmaEngine<D> {
        &self.dma
    }

    /// DMA engine
    pub fn dma_mut(&mut self) -> &mut DmaEngine<D> {
        &mut self.dma
    }

    /// Paging engine
    pub fn odp(&self) -> &OdpEngine {
        &self.odp
    }

    /// Soft entries mapping the resident sections
    pub fn kernel_entries(&self) -> impl Iterator<Item = EntryId> + '_ {
        self.kernel_entries.iter().map(EntryHandle::id)
    }

    /// Service a memory fault; false if `va` cannot be paged in
    pub fn handle_fault(&mut self, cs: CriticalSection<'_>, va: VirtualAddress) -> bool {
        match self.odp.handle_fault(cs, &mut self.mpu, &mut self.dma, va) {
            Ok(_) => true,
            Err(e) => {
                debug_print!(WARN, "init: fault at {} not serviced: {}", va, e);
                false
            }
        }
    }

    /// Fault in and pin `[base, base + len)`
    pub fn pin(&mut self, cs: CriticalSection<'_>, base: VirtualAddress, len: usize) -> KernelResult<()> {
        Ok(self.odp.pin(cs, &mut self.mpu, &mut self.dma, base, len)?)
    }

    /// Unpin `[base, base + len)`
    pub fn unpin(&mut self, cs: CriticalSection<'_>, base: VirtualAddress, len: usize) -> KernelResult<()> {
        Ok(self.odp.unpin(cs, base, len)?)
    }

    /// Pin a whole paged section
    pub fn pin_section(&mut self, cs: CriticalSection<'_>, id: SectionId) -> KernelResult<()> {
        Ok(self.odp.pin_section(cs, &mut self.mpu, &mut self.dma, id)?)
    }

    /// Unpin a whole paged section
    pub fn unpin_section(&mut self, cs: CriticalSection<'_>, id: SectionId) -> KernelResult<()> {
        Ok(self.odp.unpin_section(cs, id)?)
    }

    /// Write back every dirty data page
    pub fn flush_all(&mut self, cs: CriticalSection<'_>) -> KernelResult<()> {
        Ok(self.odp.flush_all(cs, &mut self.mpu, &mut self.dma)?)
    }

    /// Write back every dirty data page and drop every unpinned page
    pub fn flush_invalidate_all(&mut self, cs: CriticalSection<'_>) -> KernelResult<()> {
        Ok(self.odp.flush_invalidate_all(cs, &mut self.mpu, &mut self.dma)?)
    }

    /// Write back dirty pages overlapping `[base, base + len)`
    pub fn flush_range(&mut self, cs: CriticalSection<'_>, base: VirtualAddress, len: usize) -> KernelResult<()> {
        Ok(self.odp.flush_range(cs, &mut self.mpu, &mut self.dma, base, len)?)
    }

    /// Write back and drop unpinned pages overlapping `[base, base + len)`
    pub fn flush_invalidate_range(
        &mut self,
        cs: CriticalSection<'_>,
        base: VirtualAddress,
        len: usize,
    ) -> KernelResult<()> {
        Ok(self.odp.flush_invalidate_range(cs, &mut self.mpu, &mut self.dma, base, len)?)
    }

    /// TCM address of resident `va` and the bytes left in its page
    pub fn virt_to_phys(&mut self, cs: CriticalSection<'_>, va: VirtualAddress) -> KernelResult<(PhysicalAddress, usize)> {
        Ok(self.odp.virt_to_phys(cs, va)?)
    }

    /// Move a block between a TCM buffer and external memory.
    ///
    /// Paged pages under the buffer are faulted in and held pinned for the
    /// duration of the transfer; pages some other owner already pinned are
    /// left as they are.
    pub fn dma_transfer(&mut self, cs: CriticalSection<'_>, req: &DmaRequest) -> KernelResult<()> {
        let mut pinned: Vec<VirtualAddress, MAX_TCM_PAGES> = Vec::new();
        let result = match self.pin_buffer(cs, req, &mut pinned) {
            Ok(()) => self.transfer(cs, req),
            Err(e) => Err(e),
        };
        for va in pinned.iter().rev() {
            if let Err(e) = self.odp.unpin(cs, *va, 1) {
                debug_print!(ERROR, "init: unpin {} after DMA failed: {}", va, e);
            }
        }
        result
    }

    fn pin_buffer(
        &mut self,
        cs: CriticalSection<'_>,
        req: &DmaRequest,
        pinned: &mut Vec<VirtualAddress, MAX_TCM_PAGES>,
    ) -> KernelResult<()> {
        let end = req
            .buf
            .as_usize()
            .checked_add(req.size)
            .map(VirtualAddress::new)
            .ok_or(DmaError::InvalidArgument)?;
        let mut va = req.buf;
        while va < end {
            let Some(page_size) = self.odp.page_size_at(va) else {
                // Resident or untranslatable; the translator decides.
                va = va.align_down(PAGE_SIZE).add(PAGE_SIZE);
                continue;
            };
            let page_va = va.align_down(page_size);
            let held = self
                .odp
                .resident_page(page_va)
                .and_then(|p| self.odp.page(p))
                .is_some_and(|page| page.is_pinned());
            if !held {
                self.odp.pin(cs, &mut self.mpu, &mut self.dma, page_va, page_size)?;
                if pinned.push(page_va).is_err() {
                    self.odp.unpin(cs, page_va, page_size)?;
                    return Err(OdpError::NoFreePage.into());
                }
            }
            va = page_va.add(page_size);
        }
        Ok(())
    }

    fn transfer(&mut self, cs: CriticalSection<'_>, req: &DmaRequest) -> KernelResult<()> {
        let Self { config, dma, odp, .. } = self;
        let translate = |va| tcm_run(cs, config, odp, va);
        dma.mem_transfer(translate, req.buf, req.desc, req.offset, req.size, req.direction, req.secure)?;
        Ok(())
    }
}

/// TCM run backing `va`: a resident ODP page or a resident section
fn tcm_run(cs: CriticalSection<'_>, config: &PlatformConfig, odp: &mut OdpEngine, va: VirtualAddress) -> Option<TcmRun> {
    let (pa, len) = match odp.virt_to_phys(cs, va) {
        Ok(hit) => hit,
        Err(OdpError::NotPaged) => {
            let section = odp.sections().get(odp.sections().find(va)?).ok()?;
            if section.is_paged() {
                return None;
            }
            (
                section.phys_start.add(va.offset_from(section.virt_start)),
                section.virt_end().offset_from(va),
            )
        }
        Err(_) => return None,
    };

    [TcmKind::Itcm, TcmKind::Dtcm].into_iter().find_map(|tcm| {
        let window = config.tcm(tcm);
        if !window.contains(pa.as_u64(), 1) {
            return None;
        }
        let offset = (pa.as_u64() - window.base) as usize;
        Some(TcmRun {
            tcm,
            offset,
            len: len.min(window.size as usize - offset),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KernelError;
    use crate::dma::DmaDirection;
    use crate::memory::{Aperture, Location, MemDesc, Section, SectionAttr};
    use crate::odp::PageFlags;
    use crate::platform::sim::{SimDma, SimMpu, test_config};

    const PAGE: usize = 4096;
    const TEXT: usize = 0x1000_0000;
    const DATA: usize = 0x2000_0000;
    const ITCM: usize = 0x0010_0000;
    const DTCM: usize = 0x0018_0000;

    const CODE: SectionAttr = SectionAttr::READ.union(SectionAttr::EXECUTE);
    const RW: SectionAttr = SectionAttr::READ.union(SectionAttr::WRITE);

    const LAYOUT: ImageLayout = ImageLayout {
        fb_copy: PhysicalAddress::new(0x8008_0000),
        image_base: Some(PhysicalAddress::new(0x8004_0000)),
    };

    type Ctx = MemoryContext<SimMpu, SimDma>;

    /// Resident boot code and data, then paged code and data given as image offsets
    fn sections() -> SectionTable {
        SectionTable::from_slice(&[
            Section::new(".text.boot", ITCM, ITCM as u64, PAGE, CODE, Location::Resident),
            Section::new(".data.boot", DTCM, DTCM as u64, 0x800, RW, Location::Resident),
            Section::new(".text", TEXT, 0, 4 * PAGE, CODE, Location::OdpCode),
            Section::new(".data", DATA, 0x1_0000, 4 * PAGE, RW, Location::OdpData),
        ])
        .unwrap()
    }

    fn context(cs: CriticalSection<'_>) -> Ctx {
        let config = test_config();
        MemoryContext::init(
            cs,
            &config,
            SimMpu::new(config.mpu_slots),
            SimDma::new(&config),
            sections(),
            LAYOUT,
            None,
        )
        .unwrap()
    }

    fn pattern(len: usize, seed: u8) -> std::vec::Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(7).wrapping_add(seed)).collect()
    }

    fn sysmem(offset: u64) -> MemDesc {
        MemDesc { aperture: Aperture::SysMem, offset }
    }

    fn request(buf: usize, desc: MemDesc, size: usize, direction: DmaDirection) -> DmaRequest {
        DmaRequest {
            buf: VirtualAddress::new(buf),
            desc,
            offset: 0,
            size,
            direction,
            secure: false,
        }
    }

    fn page_flags(ctx: &Ctx, va: usize) -> PageFlags {
        let p = ctx.odp().resident_page(VirtualAddress::new(va)).unwrap();
        ctx.odp().page(p).unwrap().flags
    }

    #[test]
    fn normalize_rewrites_only_paged_sections() {
        let config = test_config();
        let mut table = sections();
        normalize_sections(&mut table, &config, LAYOUT).unwrap();

        let text = table.get(SectionId::new(2)).unwrap();
        assert_eq!(text.phys_start, PhysicalAddress::new(0x8008_0000));
        assert_eq!(text.image_phys, Some(PhysicalAddress::new(0x8004_0000)));
        let data = table.get(SectionId::new(3)).unwrap();
        assert_eq!(data.phys_start, PhysicalAddress::new(0x8009_0000));
        assert_eq!(data.image_phys, Some(PhysicalAddress::new(0x8005_0000)));

        let boot = table.get(SectionId::new(0)).unwrap();
        assert_eq!(boot.phys_start, PhysicalAddress::new(ITCM as u64));
        assert_eq!(boot.image_phys, None);
    }

    #[test]
    fn normalize_rejects_copy_past_the_frame_buffer() {
        let config = test_config();
        let mut table = sections();
        let layout = ImageLayout {
            fb_copy: PhysicalAddress::new(0x800f_8000),
            image_base: None,
        };
        assert_eq!(
            normalize_sections(&mut table, &config, layout),
            Err(MemoryError::InvalidAddress)
        );
    }

    #[test]
    fn init_maps_resident_sections() {
        critical_section::with(|cs| {
            let ctx = context(cs);
            assert_eq!(ctx.kernel_entries().count(), 2);
            let hw = ctx.mpu().hardware();
            assert!(hw.slot_for(ITCM).is_some());
            // Half-page section rounded up to the MPU granularity.
            assert!(hw.slot_for(DTCM + 0xffc).is_some());
            assert!(ctx.mpu().check_invariants().is_ok());

            // One page of each bank is taken by the resident sections.
            assert_eq!(ctx.odp().region_pages(crate::memory::PagingRegion::Code).len(), 3);
            assert_eq!(ctx.odp().region_pages(crate::memory::PagingRegion::Data).len(), 3);
        });
    }

    #[test]
    fn init_rejects_bad_vm_range() {
        critical_section::with(|cs| {
            let mut config = test_config();
            config.vm_pages = 0;
            let result = MemoryContext::init(
                cs,
                &config,
                SimMpu::new(config.mpu_slots),
                SimDma::new(&config),
                sections(),
                LAYOUT,
                None,
            );
            assert!(matches!(result, Err(KernelError::Vm(_))));
        });
    }

    #[test]
    fn fault_boundary_reports_unpageable_addresses() {
        critical_section::with(|cs| {
            let mut ctx = context(cs);
            assert!(ctx.handle_fault(cs, VirtualAddress::new(TEXT + 0x10)));
            assert!(ctx.odp().resident_page(VirtualAddress::new(TEXT)).is_some());
            assert!(!ctx.handle_fault(cs, VirtualAddress::new(0x3000_0000)));
        });
    }

    #[test]
    fn dma_into_paged_buffer_dirties_and_releases_it() {
        critical_section::with(|cs| {
            let mut ctx = context(cs);
            let data = pattern(PAGE, 3);
            ctx.dma_mut().hardware_mut().ext(sysmem(0), PAGE).copy_from_slice(&data);

            ctx.dma_transfer(cs, &request(DATA, sysmem(0), PAGE, DmaDirection::ToTcm))
                .unwrap();
            let flags = page_flags(&ctx, DATA);
            assert!(flags.contains(PageFlags::DIRTY));
            assert!(!flags.contains(PageFlags::PINNED));

            // The write reaches the frame-buffer copy on flush.
            ctx.flush_all(cs).unwrap();
            let fb = MemDesc { aperture: Aperture::FrameBuffer, offset: 0x9_0000 };
            assert_eq!(ctx.dma_mut().hardware_mut().ext(fb, PAGE), &data[..]);
        });
    }

    #[test]
    fn dma_leaves_existing_pins_alone() {
        critical_section::with(|cs| {
            let mut ctx = context(cs);
            ctx.pin(cs, VirtualAddress::new(DATA), PAGE).unwrap();
            ctx.dma_transfer(cs, &request(DATA, sysmem(0x2000), PAGE, DmaDirection::FromTcm))
                .unwrap();
            assert!(page_flags(&ctx, DATA).contains(PageFlags::PINNED));
            ctx.unpin(cs, VirtualAddress::new(DATA), PAGE).unwrap();
        });
    }

    #[test]
    fn dma_through_resident_sections() {
        critical_section::with(|cs| {
            let mut ctx = context(cs);
            let data = pattern(0x800, 9);
            ctx.dma_mut().hardware_mut().tcm(TcmKind::Dtcm)[..0x800].copy_from_slice(&data);

            ctx.dma_transfer(cs, &request(DTCM, sysmem(0x1000), 0x800, DmaDirection::FromTcm))
                .unwrap();
            assert_eq!(ctx.dma_mut().hardware_mut().ext(sysmem(0x1000), 0x800), &data[..]);

            // ITCM is never a DMA destination.
            assert_eq!(
                ctx.dma_transfer(cs, &request(ITCM, sysmem(0), PAGE, DmaDirection::ToTcm)),
                Err(KernelError::Dma(DmaError::InvalidArgument))
            );
        });
    }

    #[test]
    fn wrapping_dma_buffer_pins_nothing() {
        critical_section::with(|cs| {
            let mut ctx = context(cs);
            let issued = ctx.dma_mut().hardware_mut().log.len();
            let mut req = request(DATA, sysmem(0), PAGE, DmaDirection::ToTcm);
            req.size = usize::MAX - PAGE;
            assert_eq!(
                ctx.dma_transfer(cs, &req),
                Err(KernelError::Dma(DmaError::InvalidArgument))
            );
            assert!(ctx.odp().pages().iter().all(|p| !p.is_pinned()));
            assert_eq!(ctx.dma_mut().hardware_mut().log.len(), issued);
        });
    }

    #[test]
    fn suspended_dma_releases_every_pin() {
        critical_section::with(|cs| {
            let mut ctx = context(cs);
            // Bring the first page in so the transfer itself hits the gate.
            assert!(ctx.handle_fault(cs, VirtualAddress::new(DATA)));
            ctx.dma_mut().hardware_mut().suspended = true;

            let err = ctx
                .dma_transfer(cs, &request(DATA, sysmem(0), PAGE, DmaDirection::ToTcm))
                .unwrap_err();
            assert_eq!(err, KernelError::Dma(DmaError::Suspended));
            assert!(ctx.odp().pages().iter().all(|p| !p.is_pinned()));
        });
    }
}
