//! Software MPU Manager
//!
//! Virtualizes the small, fixed set of hardware MPU slots into a larger
//! arena of soft entries. Each soft entry is reference counted twice:
//!
//! - `ref_count`: holders of the entry (task lists plus any other owner).
//!   The entry is freed when it reaches zero.
//! - `mpu_ref_count`: active requests needing the entry in hardware. The
//!   slot is released for reuse when it reaches zero, but the soft entry
//!   and its last slot assignment survive.
//!
//! # Entry States
//!
//! ```text
//! Free -> Allocated(ref=1, unmapped) -> Mapped(slot bound, mpu_ref>=1)
//!                                         ^            |
//!                                         |            v
//!                                       Unmapped(slot kept, valid bit clear)
//!                                                      |
//!                                                      v (ref == 0)
//!                                                    Freed
//! ```
//!
//! A slot is only reassigned away from an owner whose `mpu_ref_count` is
//! zero. Taking it from a live owner is a fatal logic error.

#![deny(missing_docs)]
#![warn(clippy::undocumented_unsafe_blocks)]

use critical_section::CriticalSection;
use static_assertions::const_assert;
use thiserror_no_std::Error;

use crate::ErrorKind;
use crate::arch::{MpuAttr, MpuHardware, MpuRegion};
use crate::memory::{PhysicalAddress, VirtualAddress};
use crate::platform::{PlatformConfig, Window};
use crate::safety::{FatalReason, fatal};

pub mod bitmap;
pub mod task;

pub use bitmap::SlotBitmap;
pub use task::{MAX_TASK_ENTRIES, TaskMpuInfo};

/// Soft entry arena capacity
pub const MAX_SOFT_ENTRIES: usize = 64;

/// Largest hardware slot count supported
pub const MAX_HW_SLOTS: usize = 128;

/// Ceiling for every per-entry counter
pub const MAX_REF_COUNT: u8 = u8::MAX;

const_assert!(MAX_SOFT_ENTRIES <= u8::MAX as usize);
const_assert!(MAX_HW_SLOTS <= u8::MAX as usize + 1);

/// Software MPU errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MpuError {
    /// Address or length not aligned to the MPU granularity, or zero length
    #[error("misaligned MPU entry")]
    Misaligned,
    /// Physical or virtual range runs past the top of the address space
    #[error("MPU entry range wraps")]
    InvalidRange,
    /// Entry targets an aperture soft entries may not map
    #[error("aperture not mappable")]
    ApertureDenied,
    /// Virtual range overlaps an existing entry
    #[error("overlapping virtual range")]
    Overlap,
    /// Soft entry arena exhausted
    #[error("no free soft MPU entry")]
    NoFreeEntry,
    /// Every hardware slot is claimed
    #[error("no free hardware MPU slot")]
    NoFreeSlot,
    /// Counter would exceed its maximum
    #[error("reference count overflow")]
    RefOverflow,
    /// Unmap without a matching map
    #[error("entry not mapped")]
    NotMapped,
    /// Handle does not name a live entry
    #[error("invalid handle")]
    InvalidHandle,
    /// Task entry list full
    #[error("task entry list full")]
    TaskFull,
    /// Task list capacity zero or above the supported maximum
    #[error("invalid task capacity")]
    InvalidCapacity,
    /// Entry is not part of the task
    #[error("entry not in task")]
    NotInTask,
    /// Operation requires the task to be unmapped
    #[error("task currently mapped")]
    TaskMapped,
    /// Slot index past the hardware slot count
    #[error("invalid hardware slot")]
    InvalidSlot,
    /// Raw access to a slot not reserved for the caller
    #[error("slot not reserved")]
    NotReserved,
    /// Slot already claimed
    #[error("slot busy")]
    SlotBusy,
}

impl MpuError {
    /// Classify the error
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Misaligned
            | Self::InvalidRange
            | Self::InvalidHandle
            | Self::InvalidSlot
            | Self::InvalidCapacity => ErrorKind::InvalidArgument,
            Self::NoFreeEntry | Self::NoFreeSlot | Self::RefOverflow | Self::TaskFull => {
                ErrorKind::ResourceExhausted
            }
            Self::ApertureDenied
            | Self::Overlap
            | Self::NotMapped
            | Self::NotInTask
            | Self::TaskMapped
            | Self::NotReserved
            | Self::SlotBusy => ErrorKind::IllegalOperation,
        }
    }
}

/// Result type for MPU operations
pub type MpuResult<T> = Result<T, MpuError>;

/// Soft entry arena index
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId(u8);

impl EntryId {
    /// Raw index
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Hardware MPU slot index
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotIndex(u8);

impl SlotIndex {
    /// Checked constructor
    pub const fn new(slot: usize) -> Option<Self> {
        if slot < MAX_HW_SLOTS {
            Some(Self(slot as u8))
        } else {
            None
        }
    }

    /// Raw index
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// One reference to a soft entry.
///
/// Not `Clone`: a second reference comes from [`MpuManager::entry_take`] and
/// every handle goes back through [`MpuManager::entry_release`].
#[must_use = "soft MPU entry references must be released"]
#[derive(Debug, PartialEq, Eq)]
pub struct EntryHandle(EntryId);

impl EntryHandle {
    /// Entry this handle refers to
    pub const fn id(&self) -> EntryId {
        self.0
    }
}

#[derive(Debug, Clone, Copy)]
struct SoftEntry {
    phys: PhysicalAddress,
    virt: VirtualAddress,
    len: usize,
    attr: MpuAttr,
    task_count: u8,
    ref_count: u8,
    mpu_index: Option<SlotIndex>,
    mpu_ref_count: u8,
    // Slot stays claimed while unmapped (pre-init task entries).
    sticky: bool,
}

impl SoftEntry {
    const fn region(&self) -> MpuRegion {
        MpuRegion {
            va: self.virt.as_usize(),
            pa: self.phys.as_u64(),
            range: self.len,
            attr: self.attr,
            valid: true,
        }
    }

    const fn overlaps(&self, virt: VirtualAddress, len: usize) -> bool {
        spans_overlap(
            self.virt.as_usize() as u64,
            self.len as u64,
            virt.as_usize() as u64,
            len as u64,
        )
    }
}

/// Read-only view of a soft entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryInfo {
    /// Physical base
    pub phys: PhysicalAddress,
    /// Virtual base
    pub virt: VirtualAddress,
    /// Length
    pub len: usize,
    /// Hardware attributes
    pub attr: MpuAttr,
    /// Task lists referencing the entry
    pub task_count: u8,
    /// Total references
    pub ref_count: u8,
    /// Assigned hardware slot
    pub mpu_index: Option<SlotIndex>,
    /// Active hardware residency requests
    pub mpu_ref_count: u8,
}

/// Software MPU manager owning the hardware MPU
pub struct MpuManager<M: MpuHardware> {
    hw: M,
    entries: [Option<SoftEntry>; MAX_SOFT_ENTRIES],
    in_use: SlotBitmap,
    reserved: SlotBitmap,
    owners: [Option<EntryId>; MAX_HW_SLOTS],
    slot_count: usize,
    granularity: usize,
    full_aperture_access: bool,
    apertures: [Window; 2],
}

impl<M: MpuHardware> MpuManager<M> {
    /// Take over `hw`, with every slot free
    pub fn new(hw: M, config: &PlatformConfig) -> Self {
        let slot_count = hw.slot_count().min(config.mpu_slots).min(MAX_HW_SLOTS);
        debug_print!(INFO, "mpu: {} hardware slots", slot_count);
        Self {
            hw,
            entries: [const { None }; MAX_SOFT_ENTRIES],
            in_use: SlotBitmap::new(slot_count),
            reserved: SlotBitmap::new(slot_count),
            owners: [None; MAX_HW_SLOTS],
            slot_count,
            granularity: config.mpu_granularity,
            full_aperture_access: config.full_aperture_access,
            apertures: [config.framebuffer, config.sysmem],
        }
    }

    /// Hardware access
    pub const fn hardware(&self) -> &M {
        &self.hw
    }

    /// Mutable hardware access
    pub fn hardware_mut(&mut self) -> &mut M {
        &mut self.hw
    }

    /// Number of usable hardware slots
    pub const fn slot_count(&self) -> usize {
        self.slot_count
    }

    fn entry(&self, id: EntryId) -> MpuResult<&SoftEntry> {
        self.entries
            .get(id.index())
            .and_then(Option::as_ref)
            .ok_or(MpuError::InvalidHandle)
    }

    fn entry_mut(&mut self, id: EntryId) -> MpuResult<&mut SoftEntry> {
        self.entries
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .ok_or(MpuError::InvalidHandle)
    }

    /// Entry bound to hardware slot `s`
    fn owner(&self, s: usize) -> Option<EntryId> {
        self.owners.get(s).copied().flatten()
    }

    fn owner_mut(&mut self, s: usize) -> &mut Option<EntryId> {
        match self.owners.get_mut(s) {
            Some(owner) => owner,
            None => fatal(FatalReason::SlotOutOfRange { slot: s }),
        }
    }

    /// Snapshot of an entry
    pub fn entry_info(&self, id: EntryId) -> MpuResult<EntryInfo> {
        let e = self.entry(id)?;
        Ok(EntryInfo {
            phys: e.phys,
            virt: e.virt,
            len: e.len,
            attr: e.attr,
            task_count: e.task_count,
            ref_count: e.ref_count,
            mpu_index: e.mpu_index,
            mpu_ref_count: e.mpu_ref_count,
        })
    }

    /// Create a soft entry, or take another reference on an identical one
    pub fn entry_new(
        &mut self,
        _cs: CriticalSection<'_>,
        phys: PhysicalAddress,
        virt: VirtualAddress,
        len: usize,
        attr: MpuAttr,
    ) -> MpuResult<EntryHandle> {
        if len == 0
            || !phys.is_aligned(self.granularity)
            || !virt.is_aligned(self.granularity)
            || len % self.granularity != 0
        {
            return Err(MpuError::Misaligned);
        }
        // The last byte must be addressable; a range may end at the very top.
        if virt.as_usize().checked_add(len - 1).is_none()
            || phys.as_u64().checked_add(len as u64 - 1).is_none()
        {
            return Err(MpuError::InvalidRange);
        }
        if !self.full_aperture_access
            && self
                .apertures
                .iter()
                .any(|w| overlaps_window(w, phys.as_u64(), len as u64))
        {
            debug_print!(WARN, "mpu: aperture mapping {} denied", phys);
            return Err(MpuError::ApertureDenied);
        }

        let mut free = None;
        for (i, slot) in self.entries.iter_mut().enumerate() {
            match slot {
                Some(e) if e.phys == phys && e.virt == virt && e.len == len && e.attr == attr => {
                    if e.ref_count == MAX_REF_COUNT {
                        return Err(MpuError::RefOverflow);
                    }
                    e.ref_count += 1;
                    return Ok(EntryHandle(EntryId(i as u8)));
                }
                Some(e) if e.overlaps(virt, len) => return Err(MpuError::Overlap),
                Some(_) => {}
                None => {
                    if free.is_none() {
                        free = Some(i);
                    }
                }
            }
        }

        let index = free.ok_or(MpuError::NoFreeEntry)?;
        let Some(slot) = self.entries.get_mut(index) else {
            fatal(FatalReason::EntryCorrupted { entry: index });
        };
        *slot = Some(SoftEntry {
            phys,
            virt,
            len,
            attr,
            task_count: 0,
            ref_count: 1,
            mpu_index: None,
            mpu_ref_count: 0,
            sticky: false,
        });
        debug_print!(DEBUG, "mpu: entry {} {} -> {} len {:#x}", index, virt, phys, len);
        Ok(EntryHandle(EntryId(index as u8)))
    }

    /// Take another reference on an entry
    pub fn entry_take(&mut self, _cs: CriticalSection<'_>, handle: &EntryHandle) -> MpuResult<EntryHandle> {
        self.take_id(handle.id())
    }

    fn take_id(&mut self, id: EntryId) -> MpuResult<EntryHandle> {
        let e = self.entry_mut(id)?;
        if e.ref_count == MAX_REF_COUNT {
            return Err(MpuError::RefOverflow);
        }
        e.ref_count += 1;
        Ok(EntryHandle(id))
    }

    /// Drop one reference; the last one frees the entry and detaches its slot
    pub fn entry_release(&mut self, _cs: CriticalSection<'_>, handle: EntryHandle) -> MpuResult<()> {
        self.release_id(handle.id())
    }

    fn release_id(&mut self, id: EntryId) -> MpuResult<()> {
        let e = self.entry_mut(id)?;
        e.ref_count -= 1;
        if e.ref_count != 0 {
            return Ok(());
        }
        let slot = self
            .entries
            .get_mut(id.index())
            .and_then(Option::take)
            .and_then(|e| e.mpu_index);
        if let Some(slot) = slot {
            let s = slot.index();
            if self.owner(s) == Some(id) {
                self.hw.set_valid(s, false);
                *self.owner_mut(s) = None;
                self.in_use.clear(s);
            }
        }
        debug_print!(DEBUG, "mpu: entry {} freed", id.index());
        Ok(())
    }

    /// Request hardware residency for an entry
    pub fn entry_map(&mut self, _cs: CriticalSection<'_>, handle: &EntryHandle) -> MpuResult<()> {
        self.map_id(handle.id())
    }

    /// Drop one hardware residency request
    pub fn entry_unmap(&mut self, _cs: CriticalSection<'_>, handle: &EntryHandle) -> MpuResult<()> {
        self.unmap_id(handle.id())
    }

    #[inline(always)]
    fn map_id(&mut self, id: EntryId) -> MpuResult<()> {
        let e = self.entry_mut(id)?;
        if e.mpu_ref_count == MAX_REF_COUNT {
            return Err(MpuError::RefOverflow);
        }
        e.mpu_ref_count += 1;
        if e.mpu_ref_count > 1 {
            return Ok(());
        }

        // Fast path: the slot assignment survived the last unmap.
        if let Some(slot) = e.mpu_index {
            let s = slot.index();
            if self.owner(s) == Some(id) {
                self.in_use.set(s);
                self.hw.set_valid(s, true);
                return Ok(());
            }
        }

        let Some(s) = self.in_use.find_free() else {
            if let Ok(e) = self.entry_mut(id) {
                e.mpu_ref_count = 0;
            }
            debug_print!(WARN, "mpu: no free slot for entry {}", id.index());
            return Err(MpuError::NoFreeSlot);
        };
        self.claim_slot(id, s);
        let region = self.entry(id)?.region();
        self.hw.write(s, &region);
        Ok(())
    }

    /// Bind slot `s` to `id`, evicting a previous owner that no longer needs it
    fn claim_slot(&mut self, id: EntryId, s: usize) {
        if let Some(prev) = self.owner(s) {
            let live = self
                .entries
                .get_mut(prev.index())
                .and_then(Option::as_mut)
                .map(|p| {
                    let live = p.mpu_ref_count != 0;
                    if !live {
                        p.mpu_index = None;
                    }
                    live
                });
            if live == Some(true) {
                self.dump();
                fatal(FatalReason::SlotStolenFromLiveOwner { slot: s });
            }
        }
        *self.owner_mut(s) = Some(id);
        self.in_use.set(s);
        if let Ok(e) = self.entry_mut(id) {
            e.mpu_index = SlotIndex::new(s);
        }
    }

    #[inline(always)]
    fn unmap_id(&mut self, id: EntryId) -> MpuResult<()> {
        let e = self.entry_mut(id)?;
        if e.mpu_ref_count == 0 {
            return Err(MpuError::NotMapped);
        }
        e.mpu_ref_count -= 1;
        if e.mpu_ref_count != 0 {
            return Ok(());
        }
        let sticky = e.sticky;
        let Some(slot) = e.mpu_index else {
            self.dump();
            fatal(FatalReason::EntryCorrupted { entry: id.index() });
        };
        let s = slot.index();
        self.hw.set_valid(s, false);
        if !sticky {
            self.in_use.clear(s);
        }
        Ok(())
    }

    /// Bind `id` to the lowest free slot for the rest of its life
    fn bind_sticky(&mut self, id: EntryId) -> MpuResult<()> {
        let e = self.entry(id)?;
        if e.sticky {
            return Ok(());
        }
        // Keep a slot still assigned from an earlier mapping.
        if let Some(slot) = e.mpu_index
            && self.owner(slot.index()) == Some(id)
        {
            self.in_use.set(slot.index());
            self.entry_mut(id)?.sticky = true;
            return Ok(());
        }

        let s = self.in_use.find_free().ok_or(MpuError::NoFreeSlot)?;
        self.claim_slot(id, s);
        let e = self.entry_mut(id)?;
        e.sticky = true;
        let region = e.region();
        let mapped = e.mpu_ref_count > 0;
        self.hw.write(s, &region);
        if !mapped {
            self.hw.set_valid(s, false);
        }
        Ok(())
    }

    /// Permanently claim `slots` for raw use (ODP pools, boot mappings)
    pub fn reserve_slots(
        &mut self,
        _cs: CriticalSection<'_>,
        slots: core::ops::Range<usize>,
    ) -> MpuResult<()> {
        if slots.end > self.slot_count {
            return Err(MpuError::InvalidSlot);
        }
        if slots.clone().any(|s| self.in_use.is_set(s) || self.reserved.is_set(s)) {
            return Err(MpuError::SlotBusy);
        }
        for s in slots.clone() {
            if let Some(prev) = self.owner_mut(s).take()
                && let Ok(p) = self.entry_mut(prev)
            {
                p.mpu_index = None;
            }
            self.in_use.set(s);
            self.reserved.set(s);
            self.hw.set_valid(s, false);
        }
        debug_print!(INFO, "mpu: reserved slots {}..{}", slots.start, slots.end);
        Ok(())
    }

    fn check_reserved(&self, slot: SlotIndex) -> MpuResult<usize> {
        let s = slot.index();
        if s >= self.slot_count || !self.reserved.is_set(s) {
            return Err(MpuError::NotReserved);
        }
        Ok(s)
    }

    /// Program a reserved slot directly
    #[inline(always)]
    pub fn raw_write(&mut self, slot: SlotIndex, region: &MpuRegion) -> MpuResult<()> {
        let s = self.check_reserved(slot)?;
        self.hw.write(s, region);
        Ok(())
    }

    /// Invalidate a reserved slot
    #[inline(always)]
    pub fn raw_remove(&mut self, slot: SlotIndex) -> MpuResult<()> {
        let s = self.check_reserved(slot)?;
        self.hw.set_valid(s, false);
        Ok(())
    }

    /// Hardware dirty bit of a reserved slot
    pub fn raw_is_dirty(&self, slot: SlotIndex) -> MpuResult<bool> {
        let s = self.check_reserved(slot)?;
        Ok(self.hw.is_dirty(s))
    }

    /// Clear the hardware dirty bit of a reserved slot
    pub fn raw_clear_dirty(&mut self, slot: SlotIndex) -> MpuResult<()> {
        let s = self.check_reserved(slot)?;
        self.hw.clear_dirty(s);
        Ok(())
    }

    /// Verify slot mutual exclusion and bitmap agreement.
    ///
    /// Returns the first offending slot.
    pub fn check_invariants(&self) -> Result<(), usize> {
        let mut seen = SlotBitmap::new(self.slot_count);
        for (i, e) in self.entries.iter().enumerate() {
            let Some(e) = e else { continue };
            if e.mpu_ref_count == 0 {
                continue;
            }
            let Some(slot) = e.mpu_index else {
                return Err(usize::MAX);
            };
            let s = slot.index();
            if seen.is_set(s)
                || self.owner(s) != Some(EntryId(i as u8))
                || !self.in_use.is_set(s)
                || self.reserved.is_set(s)
            {
                return Err(s);
            }
            seen.set(s);
        }
        Ok(())
    }

    /// Print the soft entry table and live hardware slots
    pub fn dump(&self) {
        debug_print!(ERROR, "mpu: soft entries");
        for (i, e) in self.entries.iter().enumerate() {
            if let Some(e) = e {
                debug_print!(
                    ERROR,
                    "  [{:2}] va {} pa {} len {:#x} attr {:?} task {} ref {} slot {:?} mpu_ref {}{}",
                    i,
                    e.virt,
                    e.phys,
                    e.len,
                    e.attr,
                    e.task_count,
                    e.ref_count,
                    e.mpu_index.map(SlotIndex::index),
                    e.mpu_ref_count,
                    if e.sticky { " sticky" } else { "" }
                );
            }
        }
        debug_print!(ERROR, "mpu: hardware slots");
        for s in 0..self.slot_count {
            let r = self.hw.read(s);
            if r.valid {
                debug_print!(
                    ERROR,
                    "  <{:3}> va {:#x} pa {:#x} range {:#x} attr {:?} owner {:?}",
                    s,
                    r.va,
                    r.pa,
                    r.range,
                    r.attr,
                    self.owner(s).map(EntryId::index)
                );
            }
        }
    }
}

const fn overlaps_window(w: &Window, pa: u64, len: u64) -> bool {
    spans_overlap(w.base, w.size, pa, len)
}

/// Whether `[a, a + a_len)` and `[b, b + b_len)` intersect, without forming
/// either end address
const fn spans_overlap(a: u64, a_len: u64, b: u64, b_len: u64) -> bool {
    if a <= b { b - a < a_len } else { a - b < b_len }
}
