//! VA lookup tables and MPU slot pools
//!
//! Each paged region keeps two dense arrays indexed by
//! `(va - base) >> page_shift` over its trimmed VA range:
//!
//! ```text
//! sections:  [ 3 | 3 | 3 |HOLE| 5 | 5|FB | 5 ]   section index + backing tag
//! last_page: [ - | 7 | - | -  | - | 2    | - ]   resident TCM page, if any
//! ```

use core::ops::Range;

use heapless::Vec;

use super::{MAX_POOL_SLOTS, MAX_VA_PAGES, PageIndex};
use crate::memory::{SectionId, VirtualAddress};

/// One byte of the VA to section table.
///
/// Bits 0..=6 hold the section index (`0x7F` marks a hole). Bit 7 records
/// that the frame-buffer copy is authoritative for a data page, i.e. the
/// page has been written back at least once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionEntry(u8);

impl SectionEntry {
    const INDEX_MASK: u8 = 0x7F;
    const FRAMEBUFFER: u8 = 0x80;

    /// No section covers this page
    pub const HOLE: Self = Self(Self::INDEX_MASK);

    /// Entry for `id`, backed by the original image
    pub const fn new(id: SectionId) -> Self {
        Self(id.index() as u8 & Self::INDEX_MASK)
    }

    /// Section covering the page
    pub const fn section(self) -> Option<SectionId> {
        let index = self.0 & Self::INDEX_MASK;
        if index == Self::INDEX_MASK {
            None
        } else {
            Some(SectionId::new(index))
        }
    }

    /// Whether the frame-buffer copy is authoritative
    pub const fn in_framebuffer(self) -> bool {
        self.0 & Self::FRAMEBUFFER != 0
    }

    /// Redirect the page to its frame-buffer copy
    pub fn set_framebuffer(&mut self) {
        self.0 |= Self::FRAMEBUFFER;
    }
}

/// Lookup state for one paged region
#[derive(Debug, Clone)]
pub(super) struct RegionTables {
    pub base: VirtualAddress,
    pub end: VirtualAddress,
    pub page_size: usize,
    pub page_shift: u32,
    pub sections: Vec<SectionEntry, MAX_VA_PAGES>,
    pub last_page: Vec<Option<PageIndex>, MAX_VA_PAGES>,
    /// TCM pages of this region, as indices into the engine's page array
    pub pages: Range<usize>,
    pub next_victim: usize,
}

impl RegionTables {
    pub const fn empty(page_size: usize) -> Self {
        Self {
            base: VirtualAddress::new(0),
            end: VirtualAddress::new(0),
            page_size,
            page_shift: page_size.trailing_zeros(),
            sections: Vec::new(),
            last_page: Vec::new(),
            pages: 0..0,
            next_victim: 0,
        }
    }

    /// Table slot for `va`, `None` outside the trimmed range
    #[inline(always)]
    pub fn index_of(&self, va: VirtualAddress) -> Option<usize> {
        if va < self.base || va >= self.end {
            return None;
        }
        Some(va.offset_from(self.base) >> self.page_shift)
    }

    /// Section covering `va`, `None` for holes and out-of-range addresses
    pub fn section_of(&self, va: VirtualAddress) -> Option<SectionId> {
        self.index_of(va)
            .and_then(|i| self.sections.get(i))
            .and_then(|e| e.section())
    }

    /// Backing-store tag of table slot `index`
    pub fn entry(&self, index: usize) -> SectionEntry {
        self.sections.get(index).copied().unwrap_or(SectionEntry::HOLE)
    }

    /// TCM page resident for table slot `index`
    pub fn resident(&self, index: usize) -> Option<PageIndex> {
        self.last_page.get(index).copied().flatten()
    }

    pub fn set_resident(&mut self, index: usize, page: Option<PageIndex>) {
        if let Some(slot) = self.last_page.get_mut(index) {
            *slot = page;
        }
    }

    /// Page-aligned VA of table slot `index`
    pub const fn va_of(&self, index: usize) -> VirtualAddress {
        self.base.add(index << self.page_shift)
    }

    /// Next unpinned victim in round-robin order, scanning one full cycle
    pub fn next_victim(&mut self, pinned: impl Fn(usize) -> bool) -> Option<usize> {
        let count = self.pages.len();
        for _ in 0..count {
            let page = self.pages.start + self.next_victim;
            self.next_victim = (self.next_victim + 1) % count;
            if !pinned(page) {
                return Some(page);
            }
        }
        None
    }
}

/// Round-robin pool of reserved hardware MPU slots
#[derive(Debug, Clone)]
pub(super) struct MpuPool {
    pub slots: Range<usize>,
    /// Page currently owning each slot
    pub owners: Vec<Option<PageIndex>, MAX_POOL_SLOTS>,
    pub next: usize,
}

impl MpuPool {
    pub fn new(slots: Range<usize>) -> Option<Self> {
        let mut owners = Vec::new();
        owners.resize(slots.len(), None).ok()?;
        Some(Self {
            slots,
            owners,
            next: 0,
        })
    }

    /// Page owning pool slot `k`
    pub fn owner(&self, k: usize) -> Option<PageIndex> {
        self.owners.get(k).copied().flatten()
    }

    pub fn set_owner(&mut self, k: usize, page: Option<PageIndex>) {
        if let Some(owner) = self.owners.get_mut(k) {
            *owner = page;
        }
    }

    /// Next slot whose owner may give it up, scanning one full cycle
    pub fn next_slot(&mut self, pinned: impl Fn(PageIndex) -> bool) -> Option<usize> {
        let count = self.owners.len();
        for _ in 0..count {
            let k = self.next;
            self.next = (self.next + 1) % count;
            match self.owners.get(k) {
                Some(None) => return Some(k),
                Some(Some(owner)) if !pinned(*owner) => return Some(k),
                _ => {}
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn section_entry_tag_is_independent_of_index() {
        let mut e = SectionEntry::new(SectionId::new(5));
        assert_eq!(e.section(), Some(SectionId::new(5)));
        assert!(!e.in_framebuffer());
        e.set_framebuffer();
        assert!(e.in_framebuffer());
        assert_eq!(e.section(), Some(SectionId::new(5)));
        assert_eq!(SectionEntry::HOLE.section(), None);
    }

    #[test]
    fn index_of_rejects_out_of_range() {
        let mut t = RegionTables::empty(4096);
        t.base = VirtualAddress::new(0x1000_0000);
        t.end = VirtualAddress::new(0x1000_4000);
        assert_eq!(t.index_of(VirtualAddress::new(0x0fff_ffff)), None);
        assert_eq!(t.index_of(VirtualAddress::new(0x1000_0000)), Some(0));
        assert_eq!(t.index_of(VirtualAddress::new(0x1000_3fff)), Some(3));
        assert_eq!(t.index_of(VirtualAddress::new(0x1000_4000)), None);
        assert_eq!(t.va_of(2), VirtualAddress::new(0x1000_2000));
    }

    #[test]
    fn table_slots_outside_the_range_read_as_holes() {
        let mut t = RegionTables::empty(4096);
        t.sections.resize(2, SectionEntry::new(SectionId::new(1))).unwrap();
        t.last_page.resize(2, None).unwrap();
        t.set_resident(1, Some(PageIndex::new(4)));
        t.set_resident(9, Some(PageIndex::new(5)));
        assert_eq!(t.resident(1), Some(PageIndex::new(4)));
        assert_eq!(t.resident(9), None);
        assert_eq!(t.entry(0).section(), Some(SectionId::new(1)));
        assert_eq!(t.entry(9), SectionEntry::HOLE);
    }

    #[test]
    fn victims_rotate_and_skip_pinned() {
        let mut t = RegionTables::empty(4096);
        t.pages = 4..7;
        assert_eq!(t.next_victim(|_| false), Some(4));
        assert_eq!(t.next_victim(|p| p == 5), Some(6));
        assert_eq!(t.next_victim(|_| false), Some(4));
        assert_eq!(t.next_victim(|_| true), None);
    }

    #[test]
    fn pool_prefers_rotation_over_free_slots() {
        let mut pool = MpuPool::new(8..11).unwrap();
        pool.set_owner(0, Some(PageIndex::new(1)));
        assert_eq!(pool.next_slot(|_| false), Some(0));
        assert_eq!(pool.next_slot(|_| false), Some(1));
        pool.set_owner(2, Some(PageIndex::new(3)));
        assert_eq!(pool.owner(2), Some(PageIndex::new(3)));
        assert_eq!(pool.next_slot(|p| p == PageIndex::new(3)), Some(0));
        assert_eq!(pool.owner(7), None);
    }
}
