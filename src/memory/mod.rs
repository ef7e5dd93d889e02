pub mod aperture;
pub mod bound;
pub mod manager;

use crate::error::PalResult;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Classes of GPU-visible memory, in the order callers usually prefer them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuHeap {
    /// Device-local memory that is also visible to the CPU.
    Local,
    /// Device-local memory the CPU cannot map.
    Invisible,
    /// System memory, uncached and write-combined from the CPU side.
    GartUswc,
    /// System memory, CPU cached and snooped.
    GartCacheable,
}

impl GpuHeap {
    #[must_use]
    pub const fn is_cpu_visible(self) -> bool {
        !matches!(self, Self::Invisible)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum GpuMemPriority {
    Unused,
    VeryLow,
    Low,
    #[default]
    Normal,
    High,
    VeryHigh,
}

/// GPU virtual address range an allocation is placed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum VaRange {
    #[default]
    Default,
    DescriptorTable,
}

/// Public allocation parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct GpuMemoryCreateInfo {
    pub size: u64,
    pub alignment: u64,
    pub priority: GpuMemPriority,
    pub va_range: VaRange,
    /// Heaps the allocator may choose from, most preferred first.
    pub heaps: Vec<GpuHeap>,
}

impl GpuMemoryCreateInfo {
    #[must_use]
    pub fn new(size: u64, alignment: u64) -> Self {
        Self {
            size,
            alignment,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_heaps(mut self, heaps: &[GpuHeap]) -> Self {
        self.heaps = heaps.to_vec();
        self
    }

    #[must_use]
    pub const fn with_priority(mut self, priority: GpuMemPriority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub const fn with_va_range(mut self, va_range: VaRange) -> Self {
        self.va_range = va_range;
        self
    }
}

/// Allocation parameters only the driver itself may set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct GpuMemoryInternalCreateInfo {
    /// Never evicted while allocated; required for memory the host polls directly.
    pub always_resident: bool,
}

/// Index into the allocator's allocation table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GpuMemoryHandle(pub(crate) u64);

impl GpuMemoryHandle {
    #[must_use]
    pub const fn id(self) -> u64 {
        self.0
    }
}

/// A CPU view of a GPU allocation, starting at some byte offset into it.
///
/// Storage is word-granular and accessed atomically, so host reads observe
/// values written by the engine without further synchronization.
#[derive(Debug, Clone)]
pub struct MappedMemory {
    words: Arc<[AtomicU32]>,
    start: u64,
    size: u64,
}

impl MappedMemory {
    pub(crate) fn new(words: Arc<[AtomicU32]>) -> Self {
        let size = words.len() as u64 * 4;
        Self {
            words,
            start: 0,
            size,
        }
    }

    /// Narrows the view to begin `offset` bytes further in.
    ///
    /// # Errors
    /// Returns `OutOfBounds` if `offset` lies past the end of the view.
    pub fn offset_by(mut self, offset: u64) -> PalResult<Self> {
        self.check(offset, 0)?;
        self.start += offset;
        self.size -= offset;
        Ok(self)
    }

    #[must_use]
    pub const fn len(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }

    fn check(&self, offset: u64, len: u64) -> PalResult<()> {
        if offset.checked_add(len).is_none_or(|end| end > self.size) {
            return Err(crate::PalError::OutOfBounds {
                offset,
                len,
                size: self.size,
            });
        }
        Ok(())
    }

    fn check_aligned(&self, offset: u64) -> PalResult<()> {
        if (self.start + offset) % 4 != 0 {
            return Err(crate::PalError::Unaligned { offset });
        }
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn word(&self, offset: u64) -> PalResult<&AtomicU32> {
        self.check(offset, 4)?;
        self.check_aligned(offset)?;
        Ok(&self.words[((self.start + offset) / 4) as usize])
    }

    /// # Errors
    /// Returns `OutOfBounds` if the word does not fit in the view, or
    /// `Unaligned` if it does not start on a word boundary.
    pub fn read_u32(&self, offset: u64) -> PalResult<u32> {
        Ok(self.word(offset)?.load(Ordering::Acquire))
    }

    /// # Errors
    /// Returns `OutOfBounds` if the word does not fit in the view, or
    /// `Unaligned` if it does not start on a word boundary.
    pub fn write_u32(&self, offset: u64, value: u32) -> PalResult<()> {
        self.word(offset)?.store(value, Ordering::Release);
        Ok(())
    }

    /// Reads two consecutive words as a little-endian `u64`. Not atomic as a whole.
    ///
    /// # Errors
    /// Returns `OutOfBounds` if the value does not fit in the view.
    pub fn read_u64(&self, offset: u64) -> PalResult<u64> {
        self.check(offset, 8)?;
        let lo = u64::from(self.read_u32(offset)?);
        let hi = u64::from(self.read_u32(offset + 4)?);
        Ok(lo | (hi << 32))
    }

    /// # Errors
    /// Returns `OutOfBounds` if the value does not fit in the view.
    #[allow(clippy::cast_possible_truncation)]
    pub fn write_u64(&self, offset: u64, value: u64) -> PalResult<()> {
        self.check(offset, 8)?;
        self.write_u32(offset, value as u32)?;
        self.write_u32(offset + 4, (value >> 32) as u32)
    }

    /// Zeroes `len` bytes starting at `offset`. Both must be multiples of 4.
    ///
    /// # Errors
    /// Returns `OutOfBounds` if the range does not fit in the view, or
    /// `Unaligned` if either end is off a word boundary.
    pub fn write_zeroes(&self, offset: u64, len: u64) -> PalResult<()> {
        self.check(offset, len)?;
        self.check_aligned(offset)?;
        if len % 4 != 0 {
            return Err(crate::PalError::Unaligned { offset: offset + len });
        }
        for word in (offset..offset + len).step_by(4) {
            self.write_u32(word, 0)?;
        }
        Ok(())
    }
}

/// The allocator contract a [`crate::Device`] exposes to queue contexts.
///
/// Implementations must be safe to call from several threads at once.
pub trait GpuMemoryAllocator: Send + Sync {
    /// Allocates (or suballocates) memory, returning the backing allocation and the
    /// byte offset of the new range inside it.
    fn allocate_gpu_mem(
        &self,
        create_info: &GpuMemoryCreateInfo,
        internal_info: &GpuMemoryInternalCreateInfo,
    ) -> PalResult<(GpuMemoryHandle, u64)>;

    /// Releases a range previously returned by `allocate_gpu_mem`.
    fn free_gpu_mem(&self, memory: GpuMemoryHandle, offset: u64);

    /// Maps the whole allocation for CPU access.
    fn map(&self, memory: GpuMemoryHandle) -> PalResult<MappedMemory>;

    fn unmap(&self, memory: GpuMemoryHandle) -> PalResult<()>;

    fn gpu_virt_addr(&self, memory: GpuMemoryHandle) -> PalResult<u64>;

    /// Fence value of the most recent residency operation.
    fn last_paging_fence(&self) -> u64 {
        0
    }
}

pub use bound::BoundGpuMemory;
pub use manager::{GpuMemoryDesc, HeapProperties, MemoryManager, MemoryManagerBuilder};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PalError;

    fn mapping(words: usize) -> MappedMemory {
        let words: Arc<[AtomicU32]> = (0..words).map(|_| AtomicU32::new(0xFFFF_FFFF)).collect();
        MappedMemory::new(words)
    }

    #[test]
    fn test_offset_view_reads_shifted_words() {
        let map = mapping(4);
        map.write_u32(8, 7).unwrap();

        let view = map.offset_by(8).unwrap();
        assert_eq!(view.len(), 8);
        assert_eq!(view.read_u32(0).unwrap(), 7);
    }

    #[test]
    fn test_write_zeroes_only_touches_range() {
        let map = mapping(4);
        map.write_zeroes(4, 8).unwrap();

        assert_eq!(map.read_u32(0).unwrap(), 0xFFFF_FFFF);
        assert_eq!(map.read_u64(4).unwrap(), 0);
        assert_eq!(map.read_u32(12).unwrap(), 0xFFFF_FFFF);
    }

    #[test]
    fn test_u64_is_little_endian_pair() {
        let map = mapping(2);
        map.write_u64(0, 0x1122_3344_5566_7788).unwrap();
        assert_eq!(map.read_u32(0).unwrap(), 0x5566_7788);
        assert_eq!(map.read_u32(4).unwrap(), 0x1122_3344);
    }

    #[test]
    fn test_out_of_bounds_access_fails() {
        let map = mapping(1);
        assert_eq!(
            map.read_u64(0),
            Err(PalError::OutOfBounds {
                offset: 0,
                len: 8,
                size: 4
            })
        );
        assert!(map.clone().offset_by(8).is_err());
    }

    #[test]
    fn test_unaligned_access_is_rejected() {
        let map = mapping(3);
        assert_eq!(map.write_u32(6, 0xDEAD), Err(PalError::Unaligned { offset: 6 }));
        assert_eq!(map.read_u32(2), Err(PalError::Unaligned { offset: 2 }));
        assert_eq!(map.write_u64(2, 0), Err(PalError::Unaligned { offset: 2 }));
        assert_eq!(map.write_zeroes(0, 6), Err(PalError::Unaligned { offset: 6 }));
        assert_eq!(map.write_zeroes(2, 4), Err(PalError::Unaligned { offset: 2 }));
        for offset in [0, 4, 8] {
            assert_eq!(map.read_u32(offset).unwrap(), 0xFFFF_FFFF);
        }

        // A view narrowed to an odd start keeps rejecting word access.
        let view = map.offset_by(1).unwrap();
        assert_eq!(view.read_u32(0), Err(PalError::Unaligned { offset: 0 }));
        assert_eq!(view.read_u32(3).unwrap(), 0xFFFF_FFFF);
    }
}
