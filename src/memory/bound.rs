use crate::error::{PalError, PalResult};
use crate::memory::{GpuMemoryAllocator, GpuMemoryHandle, MappedMemory};

/// A byte range inside a GPU allocation, bound to some logical slot.
///
/// The binding never owns the allocation: whoever allocated it frees it. Clearing
/// or replacing a binding with [`BoundGpuMemory::update`] releases nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BoundGpuMemory {
    memory: Option<GpuMemoryHandle>,
    offset: u64,
}

impl BoundGpuMemory {
    #[must_use]
    pub const fn new(memory: GpuMemoryHandle, offset: u64) -> Self {
        Self {
            memory: Some(memory),
            offset,
        }
    }

    #[must_use]
    pub const fn unbound() -> Self {
        Self {
            memory: None,
            offset: 0,
        }
    }

    /// The same allocation, `bytes` further in, or `None` if the offset overflows.
    #[must_use]
    pub const fn offset_by(self, bytes: u64) -> Option<Self> {
        match self.offset.checked_add(bytes) {
            Some(offset) => Some(Self {
                memory: self.memory,
                offset,
            }),
            None => None,
        }
    }

    #[must_use]
    pub const fn is_bound(&self) -> bool {
        self.memory.is_some()
    }

    /// Rebinds to `memory` at `offset`, or unbinds when `memory` is `None`.
    pub fn update(&mut self, memory: Option<GpuMemoryHandle>, offset: u64) {
        self.memory = memory;
        self.offset = if memory.is_some() { offset } else { 0 };
    }

    #[must_use]
    pub const fn memory(&self) -> Option<GpuMemoryHandle> {
        self.memory
    }

    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// GPU virtual address of the bound range.
    ///
    /// # Errors
    /// Returns `Unbound` if nothing is bound, or the allocator's lookup error.
    pub fn gpu_virt_addr(&self, allocator: &dyn GpuMemoryAllocator) -> PalResult<u64> {
        let memory = self.memory.ok_or(PalError::Unbound)?;
        Ok(allocator.gpu_virt_addr(memory)? + self.offset)
    }

    /// Maps the backing allocation and returns a view starting at the bound offset.
    ///
    /// Every successful call must be paired with [`BoundGpuMemory::unmap`].
    ///
    /// # Errors
    /// Returns `Unbound` if nothing is bound, or the allocator's mapping error.
    pub fn map(&self, allocator: &dyn GpuMemoryAllocator) -> PalResult<MappedMemory> {
        let memory = self.memory.ok_or(PalError::Unbound)?;
        let mapping = allocator.map(memory)?;

        mapping.offset_by(self.offset).inspect_err(|_| {
            allocator.unmap(memory).ok();
        })
    }

    /// # Errors
    /// Returns `Unbound` if nothing is bound, or the allocator's unmapping error.
    pub fn unmap(&self, allocator: &dyn GpuMemoryAllocator) -> PalResult<()> {
        let memory = self.memory.ok_or(PalError::Unbound)?;
        allocator.unmap(memory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{GpuHeap, GpuMemoryCreateInfo, GpuMemoryInternalCreateInfo, MemoryManager};

    #[test]
    fn test_update_binds_and_unbinds() {
        let mut bound = BoundGpuMemory::default();
        assert!(!bound.is_bound());

        bound.update(Some(GpuMemoryHandle(3)), 8);
        assert!(bound.is_bound());
        assert_eq!(bound.memory(), Some(GpuMemoryHandle(3)));
        assert_eq!(bound.offset(), 8);

        bound.update(None, 8);
        assert!(!bound.is_bound());
        assert_eq!(bound.offset(), 0);
    }

    #[test]
    fn test_offset_by_checks_for_overflow() {
        let bound = BoundGpuMemory::new(GpuMemoryHandle(1), 8);
        assert_eq!(bound.offset_by(4), Some(BoundGpuMemory::new(GpuMemoryHandle(1), 12)));
        assert_eq!(bound.offset_by(u64::MAX - 8).map(|b| b.offset()), Some(u64::MAX));
        assert_eq!(bound.offset_by(u64::MAX - 7), None);
    }

    #[test]
    fn test_unbound_memory_cannot_be_mapped() {
        let mgr = MemoryManager::default();
        let bound = BoundGpuMemory::default();
        assert_eq!(bound.map(&mgr).err(), Some(PalError::Unbound));
        assert_eq!(bound.unmap(&mgr), Err(PalError::Unbound));
        assert_eq!(bound.gpu_virt_addr(&mgr), Err(PalError::Unbound));
    }

    #[test]
    fn test_map_view_starts_at_bound_offset() {
        let mgr = MemoryManager::default();
        let info = GpuMemoryCreateInfo::new(16, 4).with_heaps(&[GpuHeap::GartUswc]);
        let (mem, offset) = mgr
            .allocate_gpu_mem(&info, &GpuMemoryInternalCreateInfo::default())
            .unwrap();

        let bound = BoundGpuMemory::new(mem, offset + 4);
        let view = bound.map(&mgr).unwrap();
        view.write_u32(0, 0xABCD).unwrap();
        bound.unmap(&mgr).unwrap();

        let whole = mgr.map(mem).unwrap();
        assert_eq!(whole.read_u32(offset + 4).unwrap(), 0xABCD);
        mgr.unmap(mem).unwrap();

        assert_eq!(
            bound.gpu_virt_addr(&mgr).unwrap(),
            mgr.gpu_virt_addr(mem).unwrap() + offset + 4
        );
    }
}
