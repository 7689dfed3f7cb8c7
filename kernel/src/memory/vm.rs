//! Virtual Address Space Allocator
//!
//! Hands out disjoint page-granular VA ranges for dynamically sized
//! mappings such as large scratch buffers. Allocation bumps a running
//! offset; freed ranges go on a bounded, coalescing free list that later
//! allocations search first-fit before bumping. Freeing the top-most range
//! retracts the bump offset instead.

#![deny(missing_docs)]
#![warn(clippy::undocumented_unsafe_blocks)]

use heapless::Vec;
use thiserror_no_std::Error;

use crate::ErrorKind;
use crate::memory::{PAGE_SHIFT, PAGE_SIZE, VirtualAddress};

/// Maximum number of disjoint free ranges remembered
pub const MAX_FREE_RANGES: usize = 16;

/// VM allocator errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VmError {
    /// Zero base or zero page budget
    #[error("invalid VM range")]
    InvalidRange,
    /// Zero-page or misaligned request
    #[error("invalid request")]
    InvalidRequest,
    /// Budget exhausted
    #[error("out of virtual address space")]
    OutOfSpace,
    /// Freed range was never allocated or is already free
    #[error("range not allocated")]
    NotAllocated,
    /// Free list full; the range is leaked
    #[error("free list full")]
    FreeListFull,
}

impl VmError {
    /// Classify the error
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::OutOfSpace | Self::FreeListFull => ErrorKind::ResourceExhausted,
            Self::NotAllocated => ErrorKind::IllegalOperation,
            Self::InvalidRange | Self::InvalidRequest => ErrorKind::InvalidArgument,
        }
    }
}

/// Page run `[first, first + pages)`; never ends past the bump offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeRange {
    first: usize,
    pages: usize,
}

impl FreeRange {
    const fn end(&self) -> usize {
        self.first + self.pages
    }
}

/// Page-granular VA allocator
#[derive(Debug, Default)]
pub struct VmAllocator {
    base: usize,
    page_count: usize,
    used: usize,
    free: Vec<FreeRange, MAX_FREE_RANGES>,
}

impl VmAllocator {
    /// Uninitialized allocator; every request fails until [`Self::init`]
    pub const fn new() -> Self {
        Self {
            base: 0,
            page_count: 0,
            used: 0,
            free: Vec::new(),
        }
    }

    /// Record the managed range
    pub fn init(&mut self, base: VirtualAddress, page_count: usize) -> Result<(), VmError> {
        if base.as_usize() == 0 || page_count == 0 || !base.is_aligned(PAGE_SIZE) {
            debug_print!(ERROR, "vm: bad range {} + {} pages", base, page_count);
            return Err(VmError::InvalidRange);
        }
        base.as_usize()
            .checked_add(page_count << PAGE_SHIFT)
            .ok_or(VmError::InvalidRange)?;
        *self = Self {
            base: base.as_usize(),
            page_count,
            used: 0,
            free: Vec::new(),
        };
        debug_print!(INFO, "vm: {} pages at {}", page_count, base);
        Ok(())
    }

    /// Allocate `pages` contiguous pages
    pub fn allocate(&mut self, pages: usize) -> Result<VirtualAddress, VmError> {
        if pages == 0 {
            return Err(VmError::InvalidRequest);
        }
        if self.page_count == 0 {
            return Err(VmError::InvalidRange);
        }

        if let Some((pos, range)) = self.free.iter_mut().enumerate().find(|(_, r)| r.pages >= pages) {
            let first = range.first;
            range.first += pages;
            range.pages -= pages;
            if range.pages == 0 {
                self.free.remove(pos);
            }
            return Ok(self.page_va(first));
        }

        if pages > self.page_count - self.used {
            debug_print!(
                WARN,
                "vm: {} pages requested, {} left",
                pages,
                self.page_count - self.used
            );
            return Err(VmError::OutOfSpace);
        }
        let first = self.used;
        self.used += pages;
        Ok(self.page_va(first))
    }

    /// Return `pages` pages starting at `virt`
    pub fn free(&mut self, virt: VirtualAddress, pages: usize) -> Result<(), VmError> {
        if pages == 0 || !virt.is_aligned(PAGE_SIZE) || virt.as_usize() < self.base {
            return Err(VmError::InvalidRequest);
        }
        let first = (virt.as_usize() - self.base) >> PAGE_SHIFT;
        let end = first.checked_add(pages).ok_or(VmError::InvalidRequest)?;
        if end > self.used || self.free.iter().any(|r| r.first < end && first < r.end()) {
            return Err(VmError::NotAllocated);
        }
        let range = FreeRange { first, pages };

        if end == self.used {
            self.used = first;
            // Absorb any free range now touching the top.
            while let Some(pos) = self.free.iter().position(|r| r.end() == self.used) {
                self.used = self.free.remove(pos).first;
            }
            return Ok(());
        }

        let mut merged = range;
        while let Some(pos) = self
            .free
            .iter()
            .position(|r| r.end() == merged.first || r.first == merged.end())
        {
            let other = self.free.remove(pos);
            merged = FreeRange {
                first: merged.first.min(other.first),
                pages: merged.pages + other.pages,
            };
        }
        self.free.push(merged).map_err(|_| VmError::FreeListFull)
    }

    /// Pages handed out and not yet returned
    pub fn pages_in_use(&self) -> usize {
        self.used - self.free.iter().map(|r| r.pages).sum::<usize>()
    }

    fn page_va(&self, page: usize) -> VirtualAddress {
        VirtualAddress::new(self.base + (page << PAGE_SHIFT))
    }
}
