//! On-Demand Paging Engine
//!
//! Runs code and data sections far larger than TCM by paging them through a
//! fixed set of TCM pages. ITCM pages hold code (never written back), DTCM
//! pages hold data (written back to the frame buffer when dirty).
//!
//! # Page Lifecycle
//!
//! ```text
//! Unmapped --fault--> Resident(VALID) --pin--> Pinned
//!    ^                    |    ^                  |
//!    |                    |    +------unpin-------+
//!    +---evict / flush----+
//! ```
//!
//! A page keeps its TCM offset for life. Its hardware MPU slot comes from a
//! round-robin pool reserved at init; a resident page can lose its slot to
//! another page and take a cheap MPU-only miss on next access.
//!
//! # Backing Store
//!
//! With `elf-in-place`, clean pages are filled straight from the run-in-place
//! firmware image. The first write-back of a data page moves it to its
//! frame-buffer copy for good (tag bit in the section table).
//!
//! # Dirty Tracking
//!
//! A data page is dirty when its `DIRTY` flag is set (its TCM address was
//! handed out through [`OdpEngine::virt_to_phys`]) or when the hardware dirty
//! bit of its MPU slot is set. Cleaning clears both.

#![deny(missing_docs)]
#![warn(clippy::undocumented_unsafe_blocks)]

use bitflags::bitflags;
use critical_section::CriticalSection;
use heapless::Vec;
use static_assertions::const_assert;
use thiserror_no_std::Error;

use crate::ErrorKind;
use crate::arch::MpuHardware;
use crate::dma::{DmaError, OdpTemplates};
use crate::memory::{
    MemDesc, MemoryError, PagingRegion, PhysicalAddress, Section, SectionId, SectionTable, VirtualAddress,
};
use crate::mpu::{MpuError, MpuManager, SlotIndex};
use crate::platform::{DmaConfig, OdpPoolLayout, PlatformConfig, Window};
use crate::safety::{FatalReason, fatal};

mod fault;
mod flush;
mod pin;
pub mod stats;
pub mod tables;

pub use stats::{MissKind, MissStats, OdpStats};
pub use tables::SectionEntry;

use tables::{MpuPool, RegionTables};

/// TCM pages across both banks
pub const MAX_TCM_PAGES: usize = 64;

/// Lookup table entries per region
pub const MAX_VA_PAGES: usize = 1024;

/// Hardware slots in one ODP pool
pub const MAX_POOL_SLOTS: usize = 32;

// Page indices are bytes, and the pool index is stored in a byte too.
const_assert!(MAX_TCM_PAGES <= u8::MAX as usize);
const_assert!(MAX_POOL_SLOTS <= u8::MAX as usize);

/// ODP errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum OdpError {
    /// Address not covered by a paged section
    #[error("address not paged")]
    NotPaged,
    /// Base, section or page geometry misaligned
    #[error("misaligned paging geometry")]
    Misaligned,
    /// Range wraps past the top of the address space
    #[error("address range wraps")]
    InvalidRange,
    /// Page size incompatible with the DMA queue or MPU
    #[error("invalid paging configuration")]
    InvalidConfig,
    /// A TCM bank has no room for a single page
    #[error("no usable TCM pages")]
    NoTcmPages,
    /// Lookup table or page array larger than supported
    #[error("paging table too large")]
    TableTooLarge,
    /// Every candidate page is pinned
    #[error("no replaceable TCM page")]
    NoFreePage,
    /// Every pool slot belongs to a pinned page
    #[error("no free ODP MPU slot")]
    NoFreeSlot,
    /// Page already pinned
    #[error("page already pinned")]
    AlreadyPinned,
    /// Page not pinned
    #[error("page not pinned")]
    NotPinned,
    /// Page not resident
    #[error("page not resident")]
    NotResident,
    /// Section not paged, or shares its parent's paging index
    #[error("section cannot be pinned")]
    InvalidSection,
    /// DMA failure while filling or writing back
    #[error("dma: {0}")]
    Dma(DmaError),
    /// MPU failure while reserving or programming pool slots
    #[error("mpu: {0}")]
    Mpu(MpuError),
    /// Section table error
    #[error("memory: {0}")]
    Memory(MemoryError),
}

impl OdpError {
    /// Classify the error
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotPaged | Self::Misaligned | Self::InvalidRange | Self::InvalidConfig => {
                ErrorKind::InvalidArgument
            }
            Self::NoTcmPages | Self::TableTooLarge | Self::NoFreePage | Self::NoFreeSlot => {
                ErrorKind::ResourceExhausted
            }
            Self::AlreadyPinned | Self::NotPinned | Self::NotResident | Self::InvalidSection => {
                ErrorKind::IllegalOperation
            }
            Self::Dma(e) => e.kind(),
            Self::Mpu(e) => e.kind(),
            Self::Memory(e) => e.kind(),
        }
    }
}

impl From<DmaError> for OdpError {
    fn from(e: DmaError) -> Self {
        Self::Dma(e)
    }
}

impl From<MpuError> for OdpError {
    fn from(e: MpuError) -> Self {
        Self::Mpu(e)
    }
}

impl From<MemoryError> for OdpError {
    fn from(e: MemoryError) -> Self {
        Self::Memory(e)
    }
}

/// Result type for paging operations
pub type OdpResult<T> = Result<T, OdpError>;

/// Index into the TCM page array
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageIndex(u8);

impl PageIndex {
    /// Wrap a raw index (must be below [`MAX_TCM_PAGES`])
    pub const fn new(index: usize) -> Self {
        Self(index as u8)
    }

    /// Raw index
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

bitflags! {
    /// TCM page state
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PageFlags: u8 {
        /// Page lives in DTCM (otherwise ITCM)
        const DTCM = 1 << 0;
        /// Page holds a resident VA
        const VALID = 1 << 1;
        /// Page may not be evicted
        const PINNED = 1 << 2;
        /// TCM copy newer than the backing store
        const DIRTY = 1 << 3;
    }
}

/// One TCM page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcmPage {
    /// Backing store the current contents were loaded from
    pub backing: Option<MemDesc>,
    /// Byte offset inside the TCM bank
    pub tcm_offset: usize,
    /// Resident VA, page aligned
    pub va: Option<VirtualAddress>,
    /// Hardware MPU slot mapping the page
    pub mpu_slot: Option<SlotIndex>,
    /// Position inside the owning MPU pool
    pub pool_index: Option<u8>,
    /// State flags
    pub flags: PageFlags,
    section: Option<SectionId>,
}

impl TcmPage {
    const fn new(tcm_offset: usize, region: PagingRegion) -> Self {
        Self {
            backing: None,
            tcm_offset,
            va: None,
            mpu_slot: None,
            pool_index: None,
            flags: match region {
                PagingRegion::Code => PageFlags::empty(),
                PagingRegion::Data => PageFlags::DTCM,
            },
            section: None,
        }
    }

    /// Region the page serves
    pub const fn region(&self) -> PagingRegion {
        if self.flags.contains(PageFlags::DTCM) {
            PagingRegion::Data
        } else {
            PagingRegion::Code
        }
    }

    /// Whether the page holds a resident VA
    pub const fn is_valid(&self) -> bool {
        self.flags.contains(PageFlags::VALID)
    }

    /// Whether the page is pinned
    pub const fn is_pinned(&self) -> bool {
        self.flags.contains(PageFlags::PINNED)
    }
}

/// On-demand paging engine
pub struct OdpEngine {
    config: PlatformConfig,
    sections: SectionTable,
    heap_section: Option<SectionId>,
    elf_in_place: bool,
    templates: OdpTemplates,
    regions: [RegionTables; 2],
    pages: Vec<TcmPage, MAX_TCM_PAGES>,
    pools: Vec<MpuPool, 2>,
    pool_of: [usize; 2],
    /// Last code page serviced, for straddling instructions
    last_fault: Option<VirtualAddress>,
    stats: OdpStats,
}

impl OdpEngine {
    /// Build the paging state for `sections` and reserve the ODP MPU pools.
    ///
    /// `heap_section` is never filled from the firmware image. `image_base`
    /// is the run-in-place image; without it every fill reads the frame
    /// buffer.
    pub fn init<M: MpuHardware>(
        cs: CriticalSection<'_>,
        config: &PlatformConfig,
        sections: &SectionTable,
        heap_section: Option<SectionId>,
        image_base: Option<PhysicalAddress>,
        mpu: &mut MpuManager<M>,
    ) -> OdpResult<Self> {
        config.validate()?;

        for (name, window) in [("ITCM", config.itcm), ("DTCM", config.dtcm)] {
            if window.base % config.mpu_granularity as u64 != 0 {
                debug_print!(ERROR, "odp: {} base {:#x} not MPU aligned", name, window.base);
                return Err(OdpError::Misaligned);
            }
        }
        for page_size in [config.code_page_size, config.data_page_size] {
            check_page_size(page_size, config.mpu_granularity, &config.dma)?;
        }

        let elf_in_place = cfg!(feature = "elf-in-place") && image_base.is_some();
        if let Some(base) = image_base
            && !config.is_external(base, 0)
        {
            debug_print!(ERROR, "odp: image base {} outside every aperture", base);
            return Err(OdpError::InvalidConfig);
        }

        let mut engine = Self {
            config: config.clone(),
            sections: sections.clone(),
            heap_section,
            elf_in_place,
            templates: OdpTemplates::new(&config.dma),
            regions: [
                RegionTables::empty(config.code_page_size),
                RegionTables::empty(config.data_page_size),
            ],
            pages: Vec::new(),
            pools: Vec::new(),
            pool_of: [0, 0],
            last_fault: None,
            stats: OdpStats::new(),
        };

        for region in PagingRegion::ALL {
            engine.build_region(region)?;
        }
        engine.reserve_pools(cs, mpu)?;

        debug_print!(
            INFO,
            "odp: {} code pages, {} data pages, elf-in-place {}",
            engine.tables(PagingRegion::Code).pages.len(),
            engine.tables(PagingRegion::Data).pages.len(),
            engine.elf_in_place
        );
        Ok(engine)
    }

    fn tables(&self, region: PagingRegion) -> &RegionTables {
        let [code, data] = &self.regions;
        match region {
            PagingRegion::Code => code,
            PagingRegion::Data => data,
        }
    }

    fn tables_mut(&mut self, region: PagingRegion) -> &mut RegionTables {
        let [code, data] = &mut self.regions;
        match region {
            PagingRegion::Code => code,
            PagingRegion::Data => data,
        }
    }

    /// Page record `p`
    fn tcm_page(&self, p: usize) -> &TcmPage {
        page_at(&self.pages, p)
    }

    fn tcm_page_mut(&mut self, p: usize) -> &mut TcmPage {
        match self.pages.get_mut(p) {
            Some(page) => page,
            None => fatal(FatalReason::PageInconsistent { page: p, va: 0 }),
        }
    }

    /// Pool index serving `region`
    const fn pool_index(&self, region: PagingRegion) -> usize {
        let [code, data] = self.pool_of;
        match region {
            PagingRegion::Code => code,
            PagingRegion::Data => data,
        }
    }

    fn pool_mut(&mut self, region: PagingRegion) -> &mut MpuPool {
        let pool = self.pool_index(region);
        match self.pools.get_mut(pool) {
            Some(p) => p,
            None => fatal(FatalReason::PoolMissing { pool }),
        }
    }

    fn page_size(&self, region: PagingRegion) -> usize {
        match region {
            PagingRegion::Code => self.config.code_page_size,
            PagingRegion::Data => self.config.data_page_size,
        }
    }

    /// Paged, non-child sections of `region`
    fn paged_sections(&self, region: PagingRegion) -> impl Iterator<Item = (SectionId, &Section)> {
        self.sections
            .iter()
            .filter(move |(_, s)| s.is_paged() && s.parent.is_none() && s.region() == region)
    }

    fn build_region(&mut self, region: PagingRegion) -> OdpResult<()> {
        let page_size = self.page_size(region);
        let tcm = self.config.tcm(region.tcm());

        // Paged VA range, trimmed to the paged sections.
        let mut range: Option<(VirtualAddress, VirtualAddress)> = None;
        for (id, s) in self.paged_sections(region) {
            if !s.virt_start.is_aligned(page_size)
                || s.max_size % page_size != 0
                || !s.phys_start.is_aligned(page_size)
            {
                debug_print!(ERROR, "odp: section {} ({}) not page aligned", id.index(), s.name);
                return Err(OdpError::Misaligned);
            }
            self.config.describe(s.phys_start, s.max_size)?;
            if self.elf_in_place
                && let Some(image) = s.image_phys
            {
                self.config.describe(image, s.max_size)?;
            }
            range = Some(match range {
                None => (s.virt_start, s.virt_end()),
                Some((lo, hi)) => (lo.min(s.virt_start), hi.max(s.virt_end())),
            });
        }
        let Some((base, end)) = range else {
            debug_print!(INFO, "odp: no paged {:?} sections", region);
            return Ok(());
        };

        let entries = end.offset_from(base) / page_size;
        if entries > MAX_VA_PAGES {
            debug_print!(ERROR, "odp: {:?} VA range needs {} entries", region, entries);
            return Err(OdpError::TableTooLarge);
        }

        // Resident sections in the same bank sit below the paged pool.
        let pool_start = self
            .sections
            .iter()
            .filter(|(_, s)| !s.is_paged())
            .filter(|(_, s)| tcm.contains(s.phys_start.as_u64(), s.max_size as u64))
            .map(|(_, s)| (s.phys_start.as_u64() - tcm.base) as usize + s.max_size)
            .max()
            .unwrap_or(0)
            .next_multiple_of(page_size);
        let count = (tcm.size as usize).saturating_sub(pool_start) / page_size;
        if count == 0 {
            debug_print!(ERROR, "odp: {:?} TCM holds no {}-byte page", region, page_size);
            return Err(OdpError::NoTcmPages);
        }
        if self.pages.len() + count > MAX_TCM_PAGES {
            debug_print!(ERROR, "odp: {} TCM pages exceed the page index", self.pages.len() + count);
            return Err(OdpError::TableTooLarge);
        }

        let first = self.pages.len();
        for i in 0..count {
            // Capacity checked above.
            let _ = self.pages.push(TcmPage::new(pool_start + i * page_size, region));
        }

        let mut tables = RegionTables::empty(page_size);
        tables.base = base;
        tables.end = end;
        tables.pages = first..first + count;
        // Sized above to at most MAX_VA_PAGES.
        let _ = tables.sections.resize(entries, SectionEntry::HOLE);
        let _ = tables.last_page.resize(entries, None);
        for (id, s) in self.paged_sections(region) {
            let start = s.virt_start.offset_from(base) / page_size;
            for entry in tables.sections.iter_mut().skip(start).take(s.max_size / page_size) {
                *entry = SectionEntry::new(id);
            }
        }
        *self.tables_mut(region) = tables;
        debug_print!(DEBUG, "odp: {:?} VA {}..{} pages {}..{}", region, base, end, first, first + count);
        Ok(())
    }

    fn reserve_pools<M: MpuHardware>(&mut self, cs: CriticalSection<'_>, mpu: &mut MpuManager<M>) -> OdpResult<()> {
        let layout = self.config.odp_pools.clone();
        let (ranges, pool_of) = match layout {
            OdpPoolLayout::Shared(r) => ([Some(r), None], [0, 0]),
            OdpPoolLayout::Split { code, data } => ([Some(code), Some(data)], [0, 1]),
        };
        for range in ranges.into_iter().flatten() {
            if range.len() > MAX_POOL_SLOTS {
                return Err(OdpError::TableTooLarge);
            }
            mpu.reserve_slots(cs, range.clone())?;
            let pool = MpuPool::new(range).ok_or(OdpError::TableTooLarge)?;
            let _ = self.pools.push(pool);
        }
        self.pool_of = pool_of;
        Ok(())
    }

    /// Page records
    pub fn pages(&self) -> &[TcmPage] {
        &self.pages
    }

    /// Page record
    pub fn page(&self, page: PageIndex) -> Option<&TcmPage> {
        self.pages.get(page.index())
    }

    /// TCM pages of a region
    pub fn region_pages(&self, region: PagingRegion) -> core::ops::Range<usize> {
        self.tables(region).pages.clone()
    }

    /// Statistics gathered so far
    pub const fn stats(&self) -> &OdpStats {
        &self.stats
    }

    /// Section table the engine pages from
    pub const fn sections(&self) -> &SectionTable {
        &self.sections
    }

    /// Section covering `va`, `None` for holes and unpaged addresses
    pub fn section_of(&self, va: VirtualAddress) -> Option<SectionId> {
        self.regions.iter().find_map(|r| r.section_of(va))
    }

    /// Page size of the paged region covering `va`
    pub fn page_size_at(&self, va: VirtualAddress) -> Option<usize> {
        self.locate(va).ok().map(|(region, _, _)| self.page_size(region))
    }

    /// Backing-store tag of the page at `va`
    pub fn section_entry(&self, va: VirtualAddress) -> Option<SectionEntry> {
        self.regions
            .iter()
            .find_map(|r| r.index_of(va).and_then(|i| r.sections.get(i).copied()))
    }

    /// TCM page resident at `va`
    pub fn resident_page(&self, va: VirtualAddress) -> Option<PageIndex> {
        self.regions
            .iter()
            .find_map(|r| r.index_of(va).and_then(|i| r.resident(i)))
    }

    /// Region, table slot and section for `va`
    fn locate(&self, va: VirtualAddress) -> OdpResult<(PagingRegion, usize, SectionId)> {
        for region in PagingRegion::ALL {
            let tables = self.tables(region);
            if let Some(index) = tables.index_of(va) {
                let section = tables
                    .sections
                    .get(index)
                    .and_then(|e| e.section())
                    .ok_or(OdpError::NotPaged)?;
                return Ok((region, index, section));
            }
        }
        Err(OdpError::NotPaged)
    }

    fn tcm_window(&self, page: &TcmPage) -> Window {
        self.config.tcm(page.region().tcm())
    }

    /// Print every page record
    pub fn dump(&self) {
        debug_print!(ERROR, "odp: pages");
        for (i, p) in self.pages.iter().enumerate() {
            debug_print!(
                ERROR,
                "  [{:2}] {:?} tcm {:#x} va {:?} slot {:?} pool {:?} flags {:?}",
                i,
                p.region(),
                p.tcm_offset,
                p.va,
                p.mpu_slot.map(SlotIndex::index),
                p.pool_index,
                p.flags
            );
        }
        debug_print!(ERROR, "odp: last code fault {:?}", self.last_fault);
    }
}

/// Page record `p`; a miss means the page bookkeeping is corrupt
fn page_at(pages: &[TcmPage], p: usize) -> &TcmPage {
    match pages.get(p) {
        Some(page) => page,
        None => fatal(FatalReason::PageInconsistent { page: p, va: 0 }),
    }
}

fn check_page_size(page_size: usize, granularity: usize, dma: &DmaConfig) -> OdpResult<()> {
    if !page_size.is_power_of_two() || page_size % granularity != 0 {
        debug_print!(ERROR, "odp: page size {:#x} not an MPU multiple", page_size);
        return Err(OdpError::Misaligned);
    }
    if page_size > dma.queue_capacity() || page_size % dma.max_block != 0 {
        debug_print!(
            ERROR,
            "odp: page size {:#x} does not fit the DMA queue ({} x {})",
            page_size,
            dma.queue_depth,
            dma.max_block
        );
        return Err(OdpError::InvalidConfig);
    }
    Ok(())
}
