//! Memory Management Subsystem
//!
//! Address types and the link-time section table shared by the VM
//! allocator, the software MPU and the on-demand paging engine.
//!
//! - [`vm`]: monotonic virtual address range allocator
//! - [`init`]: section table normalization and subsystem bring-up
//! - [`global`]: process-wide singleton reached under a critical section
//!
//! # Memory Layout
//!
//! ```text
//! Code VA region:  | resident | odp code | odp code | hole | odp code |
//! Data VA region:  | resident | odp data | heap (odp data) ...         |
//!
//! ITCM / DTCM:     fixed array of ODP pages, one MPU slot each when mapped
//! Frame buffer:    writable backing copy of every paged section
//! Firmware image:  run-in-place read-only copy (clean pages)
//! ```

#![deny(missing_docs)]
#![warn(clippy::undocumented_unsafe_blocks)]

use core::fmt;

use bitflags::bitflags;
use heapless::Vec;
use static_assertions::const_assert;
use thiserror_no_std::Error;

use crate::ErrorKind;
use crate::arch::MpuAttr;

pub mod global;
pub mod init;
pub mod vm;

/// VM allocator granule and minimum MPU mapping granularity
pub const PAGE_SIZE: usize = 4096;

/// log2 of [`PAGE_SIZE`]
pub const PAGE_SHIFT: usize = 12;

/// Maximum number of sections in the section table
pub const MAX_SECTIONS: usize = 64;

// Section indices share a byte with the backing-store tag bit.
const_assert!(MAX_SECTIONS <= 0x7F);
const_assert!(PAGE_SIZE == 1 << PAGE_SHIFT);

/// Memory management errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MemoryError {
    /// Address or length violates an alignment requirement
    #[error("misaligned address or length")]
    AlignmentError,
    /// Invalid memory size (too large or zero)
    #[error("invalid size")]
    InvalidSize,
    /// Address is not covered by any section
    #[error("address not covered by a section")]
    NotFound,
    /// Section index out of range
    #[error("invalid section index")]
    InvalidSection,
    /// Section table is full
    #[error("section table full")]
    TooManySections,
    /// Address does not belong to a known aperture
    #[error("address outside every aperture")]
    InvalidAddress,
    /// Memory context not installed
    #[error("memory context not installed")]
    Uninitialized,
    /// Memory context installed twice
    #[error("memory context already installed")]
    AlreadyInitialized,
    /// Memory context entered from inside its own critical section
    #[error("memory context already borrowed")]
    Reentered,
}

impl MemoryError {
    /// Classify the error
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::TooManySections => ErrorKind::ResourceExhausted,
            Self::Uninitialized | Self::AlreadyInitialized | Self::Reentered => ErrorKind::IllegalOperation,
            _ => ErrorKind::InvalidArgument,
        }
    }
}

/// Result type for memory operations
pub type MemoryResult<T> = Result<T, MemoryError>;

macro_rules! address_type {
    ($(#[$meta:meta])* $name:ident, $repr:ty) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name($repr);

        impl $name {
            /// Wrap a raw address
            pub const fn new(addr: $repr) -> Self {
                Self(addr)
            }

            /// Round down to a multiple of `align` (a power of two)
            pub const fn align_down(self, align: usize) -> Self {
                Self(self.0 & !(align as $repr - 1))
            }

            /// Round up to a multiple of `align` (a power of two)
            pub const fn align_up(self, align: usize) -> Self {
                Self((self.0 + (align as $repr - 1)) & !(align as $repr - 1))
            }

            /// Whether the address is a multiple of `align` (a power of two)
            pub const fn is_aligned(self, align: usize) -> bool {
                self.0 & (align as $repr - 1) == 0
            }

            /// Address `bytes` further on
            pub const fn add(self, bytes: usize) -> Self {
                Self(self.0 + bytes as $repr)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({:#x})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }
    };
}

address_type!(
    /// Virtual address as seen by the core
    VirtualAddress,
    usize
);

address_type!(
    /// Physical address on the system fabric
    PhysicalAddress,
    u64
);

impl VirtualAddress {
    /// Raw value
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Byte distance from `base` (which must not be above `self`)
    pub const fn offset_from(self, base: Self) -> usize {
        self.0 - base.0
    }
}

impl PhysicalAddress {
    /// Raw value
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// Tightly-coupled memory bank
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcmKind {
    /// Instruction TCM
    Itcm,
    /// Data TCM
    Dtcm,
}

/// External memory aperture reachable by the DMA engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aperture {
    /// Frame-buffer (video) memory
    FrameBuffer,
    /// Coherent system memory
    SysMem,
}

/// DMA-side description of an external buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemDesc {
    /// Aperture the buffer lives in
    pub aperture: Aperture,
    /// Byte offset inside the aperture
    pub offset: u64,
}

impl MemDesc {
    /// Descriptor `bytes` further into the same aperture
    pub const fn add(self, bytes: usize) -> Self {
        Self {
            aperture: self.aperture,
            offset: self.offset + bytes as u64,
        }
    }
}

/// Where a section's contents live at run time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// Permanently resident in TCM
    Resident,
    /// Code paged into ITCM on demand
    OdpCode,
    /// Data paged into DTCM on demand
    OdpData,
}

/// The two paged VA regions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingRegion {
    /// Code region, backed by ITCM pages
    Code = 0,
    /// Data region, backed by DTCM pages
    Data = 1,
}

impl PagingRegion {
    /// Both regions, in table order
    pub const ALL: [Self; 2] = [Self::Code, Self::Data];

    /// TCM bank holding this region's pages
    pub const fn tcm(self) -> TcmKind {
        match self {
            Self::Code => TcmKind::Itcm,
            Self::Data => TcmKind::Dtcm,
        }
    }
}

bitflags! {
    /// Section permission attributes
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SectionAttr: u32 {
        /// Readable
        const READ = 1 << 0;
        /// Writable
        const WRITE = 1 << 1;
        /// Executable
        const EXECUTE = 1 << 2;
        /// Accessible from user mode
        const USER = 1 << 3;
        /// Cacheable
        const CACHEABLE = 1 << 4;
    }
}

impl SectionAttr {
    /// Hardware MPU attribute bits granting these permissions
    pub const fn to_mpu_attr(self) -> MpuAttr {
        let mut attr = MpuAttr::empty();
        if self.contains(Self::READ) {
            attr = attr.union(MpuAttr::SR);
            if self.contains(Self::USER) {
                attr = attr.union(MpuAttr::UR);
            }
        }
        if self.contains(Self::WRITE) {
            attr = attr.union(MpuAttr::SW);
            if self.contains(Self::USER) {
                attr = attr.union(MpuAttr::UW);
            }
        }
        if self.contains(Self::EXECUTE) {
            attr = attr.union(MpuAttr::SX);
            if self.contains(Self::USER) {
                attr = attr.union(MpuAttr::UX);
            }
        }
        if self.contains(Self::CACHEABLE) {
            attr = attr.union(MpuAttr::CACHEABLE);
        }
        attr
    }
}

/// Section table index
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SectionId(u8);

impl SectionId {
    /// Create a section ID
    pub const fn new(id: u8) -> Self {
        Self(id)
    }

    /// Raw index
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Section descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Section {
    /// Human-readable name (linker section)
    pub name: &'static str,
    /// First virtual address
    pub virt_start: VirtualAddress,
    /// Writable backing copy, or TCM address for resident sections
    pub phys_start: PhysicalAddress,
    /// Run-in-place image copy, if the image is directly addressable
    pub image_phys: Option<PhysicalAddress>,
    /// Maximum size in bytes
    pub max_size: usize,
    /// Permissions
    pub attr: SectionAttr,
    /// Location classifier
    pub location: Location,
    /// Parent section whose paging index this section shares
    pub parent: Option<SectionId>,
}

impl Section {
    /// Paged or resident section without an image copy or parent
    pub const fn new(
        name: &'static str,
        virt_start: usize,
        phys_start: u64,
        max_size: usize,
        attr: SectionAttr,
        location: Location,
    ) -> Self {
        Self {
            name,
            virt_start: VirtualAddress::new(virt_start),
            phys_start: PhysicalAddress::new(phys_start),
            image_phys: None,
            max_size,
            attr,
            location,
            parent: None,
        }
    }

    /// First address past the section
    pub const fn virt_end(&self) -> VirtualAddress {
        self.virt_start.add(self.max_size)
    }

    /// Whether `va` falls inside the section
    pub const fn contains(&self, va: VirtualAddress) -> bool {
        va.as_usize() >= self.virt_start.as_usize() && va.as_usize() < self.virt_end().as_usize()
    }

    /// Whether the section is paged by the ODP engine
    pub const fn is_paged(&self) -> bool {
        !matches!(self.location, Location::Resident)
    }

    /// Paging region the section belongs to
    pub const fn region(&self) -> PagingRegion {
        match self.location {
            Location::OdpCode => PagingRegion::Code,
            Location::OdpData => PagingRegion::Data,
            Location::Resident => {
                if self.attr.contains(SectionAttr::EXECUTE) {
                    PagingRegion::Code
                } else {
                    PagingRegion::Data
                }
            }
        }
    }
}

/// Link-time section table
#[derive(Debug, Clone, Default)]
pub struct SectionTable {
    sections: Vec<Section, MAX_SECTIONS>,
}

impl SectionTable {
    /// Empty table
    pub const fn new() -> Self {
        Self { sections: Vec::new() }
    }

    /// Build a table from a static description
    pub fn from_slice(sections: &[Section]) -> MemoryResult<Self> {
        let mut table = Self::new();
        for section in sections {
            table.push(*section)?;
        }
        Ok(table)
    }

    /// Append a section
    pub fn push(&mut self, section: Section) -> MemoryResult<SectionId> {
        let id = SectionId::new(self.sections.len() as u8);
        self.sections
            .push(section)
            .map_err(|_| MemoryError::TooManySections)?;
        Ok(id)
    }

    /// Number of sections
    pub fn len(&self) -> usize {
        self.sections.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// Look up a section
    pub fn get(&self, id: SectionId) -> MemoryResult<&Section> {
        self.sections.get(id.index()).ok_or(MemoryError::InvalidSection)
    }

    /// Mutable lookup, used once at init to normalize addresses
    pub fn get_mut(&mut self, id: SectionId) -> MemoryResult<&mut Section> {
        self.sections
            .get_mut(id.index())
            .ok_or(MemoryError::InvalidSection)
    }

    /// Iterate sections with their IDs
    pub fn iter(&self) -> impl Iterator<Item = (SectionId, &Section)> {
        self.sections
            .iter()
            .enumerate()
            .map(|(i, s)| (SectionId::new(i as u8), s))
    }

    /// Linear search for the section covering `va`
    pub fn find(&self, va: VirtualAddress) -> Option<SectionId> {
        self.iter().find(|(_, s)| s.contains(va)).map(|(id, _)| id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_alignment_helpers() {
        let va = VirtualAddress::new(0x1234);
        assert_eq!(va.align_down(0x1000), VirtualAddress::new(0x1000));
        assert_eq!(va.align_up(0x1000), VirtualAddress::new(0x2000));
        assert!(!va.is_aligned(0x1000));
        assert!(VirtualAddress::new(0x3000).is_aligned(0x1000));
        assert_eq!(va.offset_from(VirtualAddress::new(0x1000)), 0x234);
    }

    #[test]
    fn section_attr_maps_to_mpu_bits() {
        let attr = (SectionAttr::READ | SectionAttr::EXECUTE | SectionAttr::USER).to_mpu_attr();
        assert_eq!(attr, MpuAttr::CODE);
        assert!(!attr.writable());
        assert!((SectionAttr::READ | SectionAttr::WRITE).to_mpu_attr().writable());
    }

    #[test]
    fn table_find_and_bounds() {
        let table = SectionTable::from_slice(&[
            Section::new("a", 0x1000, 0, 0x1000, SectionAttr::READ, Location::OdpData),
            Section::new("b", 0x3000, 0, 0x2000, SectionAttr::READ, Location::OdpData),
        ])
        .unwrap();
        assert_eq!(table.find(VirtualAddress::new(0x1fff)), Some(SectionId::new(0)));
        assert_eq!(table.find(VirtualAddress::new(0x2000)), None);
        assert_eq!(table.find(VirtualAddress::new(0x4800)), Some(SectionId::new(1)));
        assert_eq!(table.get(SectionId::new(7)), Err(MemoryError::InvalidSection));
    }
}
