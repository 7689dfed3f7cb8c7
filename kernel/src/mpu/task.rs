//! Per-task soft MPU entry lists
//!
//! A task owns one reference on each entry in its list. The list is mapped
//! into hardware on the 0 -> 1 transition of the task-level `ref_count` and
//! unmapped on 1 -> 0, so nested activations cost one counter update.

use critical_section::CriticalSection;
use heapless::Vec;

use super::{EntryHandle, EntryId, MpuError, MpuManager, MpuResult};
use crate::arch::MpuHardware;

/// Maximum entries in one task list
pub const MAX_TASK_ENTRIES: usize = 16;

/// Soft MPU entries owned by one task
#[derive(Debug)]
pub struct TaskMpuInfo {
    entries: Vec<EntryHandle, MAX_TASK_ENTRIES>,
    capacity: usize,
    ref_count: u8,
}

impl TaskMpuInfo {
    /// Entry IDs in list order
    pub fn entries(&self) -> impl Iterator<Item = EntryId> + '_ {
        self.entries.iter().map(EntryHandle::id)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the list is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Capacity fixed at creation
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether the list is currently mapped
    pub const fn is_mapped(&self) -> bool {
        self.ref_count > 0
    }

    fn position(&self, id: EntryId) -> Option<usize> {
        self.entries.iter().position(|h| h.id() == id)
    }
}

impl<M: MpuHardware> MpuManager<M> {
    /// Empty task list holding at most `capacity` entries
    pub fn task_init(&self, capacity: usize) -> MpuResult<TaskMpuInfo> {
        if capacity == 0 || capacity > MAX_TASK_ENTRIES {
            return Err(MpuError::InvalidCapacity);
        }
        Ok(TaskMpuInfo {
            entries: Vec::new(),
            capacity,
            ref_count: 0,
        })
    }

    /// Add `entry` to `task`, mapping it at once if the task is mapped
    pub fn task_entry_add(
        &mut self,
        _cs: CriticalSection<'_>,
        task: &mut TaskMpuInfo,
        entry: &EntryHandle,
    ) -> MpuResult<()> {
        self.add_to_task(task, entry.id(), false)
    }

    /// Add `entry` and bind it to the lowest free hardware slot for good.
    ///
    /// Used while a task is being built so its entries never compete for
    /// slots at context switch.
    pub fn task_entry_add_pre_init(
        &mut self,
        _cs: CriticalSection<'_>,
        task: &mut TaskMpuInfo,
        entry: &EntryHandle,
    ) -> MpuResult<()> {
        self.add_to_task(task, entry.id(), true)
    }

    fn add_to_task(&mut self, task: &mut TaskMpuInfo, id: EntryId, sticky: bool) -> MpuResult<()> {
        if task.entries.len() >= task.capacity {
            return Err(MpuError::TaskFull);
        }
        if task.position(id).is_some() {
            return Err(MpuError::Overlap);
        }
        let handle = self.take_id(id)?;

        if task.is_mapped()
            && let Err(e) = self.map_id(id)
        {
            self.release_id(handle.id())?;
            return Err(e);
        }
        if sticky && let Err(e) = self.bind_sticky(id) {
            if task.is_mapped() {
                self.unmap_id(id)?;
            }
            self.release_id(handle.id())?;
            return Err(e);
        }

        self.entry_mut(id)?.task_count += 1;
        // Capacity checked above.
        let _ = task.entries.push(handle);
        Ok(())
    }

    /// Remove `id` from `task`, unmapping it at once if the task is mapped
    pub fn task_entry_remove(
        &mut self,
        _cs: CriticalSection<'_>,
        task: &mut TaskMpuInfo,
        id: EntryId,
    ) -> MpuResult<()> {
        let pos = task.position(id).ok_or(MpuError::NotInTask)?;
        if task.is_mapped() {
            self.unmap_id(id)?;
        }
        let handle = task.entries.remove(pos);
        let e = self.entry_mut(id)?;
        e.task_count -= 1;
        self.release_id(handle.id())
    }

    /// Activate `task`; hardware is touched only on the first activation
    #[inline(always)]
    pub fn task_map(&mut self, _cs: CriticalSection<'_>, task: &mut TaskMpuInfo) -> MpuResult<()> {
        if task.ref_count == u8::MAX {
            return Err(MpuError::RefOverflow);
        }
        task.ref_count += 1;
        if task.ref_count > 1 {
            return Ok(());
        }
        for (i, handle) in task.entries.iter().enumerate() {
            if let Err(e) = self.map_id(handle.id()) {
                debug_print!(WARN, "mpu: task map failed at entry {}", handle.id().index());
                for done in task.entries.iter().take(i) {
                    self.unmap_id(done.id())?;
                }
                task.ref_count = 0;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Deactivate `task`; the last deactivation unmaps every entry
    #[inline(always)]
    pub fn task_unmap(&mut self, _cs: CriticalSection<'_>, task: &mut TaskMpuInfo) -> MpuResult<()> {
        if task.ref_count == 0 {
            return Err(MpuError::NotMapped);
        }
        task.ref_count -= 1;
        if task.ref_count > 0 {
            return Ok(());
        }
        for handle in &task.entries {
            self.unmap_id(handle.id())?;
        }
        Ok(())
    }

    /// Drop every entry reference held by an unmapped task
    pub fn task_free(&mut self, _cs: CriticalSection<'_>, task: &mut TaskMpuInfo) -> MpuResult<()> {
        if task.is_mapped() {
            return Err(MpuError::TaskMapped);
        }
        while let Some(handle) = task.entries.pop() {
            self.entry_mut(handle.id())?.task_count -= 1;
            self.release_id(handle.id())?;
        }
        Ok(())
    }

    /// Switch hardware from `prev` to `next`.
    ///
    /// `prev` is unmapped first so its slots are free for `next`. If `next`
    /// cannot be mapped, `prev` is mapped again.
    #[inline(always)]
    pub fn context_switch(
        &mut self,
        cs: CriticalSection<'_>,
        prev: Option<&mut TaskMpuInfo>,
        next: &mut TaskMpuInfo,
    ) -> MpuResult<()> {
        let prev = match prev {
            Some(prev) => {
                self.task_unmap(cs, prev)?;
                Some(prev)
            }
            None => None,
        };
        if let Err(e) = self.task_map(cs, next) {
            if let Some(prev) = prev {
                self.task_map(cs, prev)?;
            }
            return Err(e);
        }
        Ok(())
    }
}
