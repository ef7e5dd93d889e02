use crate::error::{PalError, PalResult};
use crate::memory::aperture::{Aperture, PAGE_SIZE};
use crate::memory::{
    GpuHeap, GpuMemPriority, GpuMemoryAllocator, GpuMemoryCreateInfo, GpuMemoryHandle,
    GpuMemoryInternalCreateInfo, MappedMemory, VaRange,
};
use crate::utils::{align_up, is_pow2};
use std::collections::HashMap;
use std::sync::atomic::AtomicU32;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

// GPU VA layout
const DESCRIPTOR_TABLE_VA_BASE: u64 = 0x1000_0000; // Start at 256MB
const DESCRIPTOR_TABLE_VA_LIMIT: u64 = 0x1_0000_0000; // 4GB
const DEFAULT_VA_BASE: u64 = DESCRIPTOR_TABLE_VA_LIMIT;
const DEFAULT_VA_LIMIT: u64 = (1 << 47) - 1; // 47-bit VA limit
const VA_GUARD_PAGES: u64 = 1;

/// Requests up to this size are carved out of shared base allocations.
const SUBALLOC_THRESHOLD: u64 = 16 * 1024;
const SUBALLOC_CHUNK_SIZE: u64 = 64 * 1024;
const MIN_ALIGNMENT: u64 = 4;

const MIB: u64 = 1024 * 1024;

/// Capacity of one heap exposed by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapProperties {
    pub heap: GpuHeap,
    pub size: u64,
}

/// What the manager knows about a base allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuMemoryDesc {
    pub heap: GpuHeap,
    pub size: u64,
    pub gpu_va: u64,
    pub priority: GpuMemPriority,
    pub va_range: VaRange,
    pub always_resident: bool,
    /// Backs suballocations rather than a single caller-visible range.
    pub suballocated: bool,
}

/// Configures the heaps a [`MemoryManager`] exposes.
#[derive(Debug, Clone)]
pub struct MemoryManagerBuilder {
    heaps: Vec<HeapProperties>,
    suballocate: bool,
}

impl Default for MemoryManagerBuilder {
    fn default() -> Self {
        Self::new()
            .with_heap(GpuHeap::Local, 256 * MIB)
            .with_heap(GpuHeap::Invisible, 1024 * MIB)
            .with_heap(GpuHeap::GartUswc, 256 * MIB)
            .with_heap(GpuHeap::GartCacheable, 256 * MIB)
    }
}

impl MemoryManagerBuilder {
    /// A builder with no heaps at all.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            heaps: Vec::new(),
            suballocate: true,
        }
    }

    /// Adds a heap, or resizes it if it was already present.
    #[must_use]
    pub fn with_heap(mut self, heap: GpuHeap, size: u64) -> Self {
        if let Some(props) = self.heaps.iter_mut().find(|p| p.heap == heap) {
            props.size = size;
        } else {
            self.heaps.push(HeapProperties { heap, size });
        }
        self
    }

    #[must_use]
    pub fn without_heap(mut self, heap: GpuHeap) -> Self {
        self.heaps.retain(|p| p.heap != heap);
        self
    }

    /// Gives every request its own base allocation.
    #[must_use]
    pub const fn without_suballocation(mut self) -> Self {
        self.suballocate = false;
        self
    }

    #[must_use]
    pub fn build(self) -> MemoryManager {
        MemoryManager {
            inner: Mutex::new(Inner {
                heaps: self
                    .heaps
                    .into_iter()
                    .map(|props| HeapState { props, used: 0 })
                    .collect(),
                default_va: Aperture::new(DEFAULT_VA_BASE, DEFAULT_VA_LIMIT, PAGE_SIZE, VA_GUARD_PAGES),
                descriptor_va: Aperture::new(
                    DESCRIPTOR_TABLE_VA_BASE,
                    DESCRIPTOR_TABLE_VA_LIMIT,
                    PAGE_SIZE,
                    VA_GUARD_PAGES,
                ),
                allocations: HashMap::new(),
                pools: HashMap::new(),
                next_handle: 1,
                paging_fence: 0,
            }),
            suballocate: self.suballocate,
        }
    }
}

/// Suballocations are only shared between requests that agree on all of these.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PoolKey {
    heaps: Vec<GpuHeap>,
    va_range: VaRange,
    priority: GpuMemPriority,
    always_resident: bool,
}

#[derive(Debug)]
struct HeapState {
    props: HeapProperties,
    used: u64,
}

#[derive(Debug)]
struct BaseAllocation {
    desc: GpuMemoryDesc,
    words: Arc<[AtomicU32]>,
    map_count: u32,
    // Occupied sub-ranges when this allocation backs suballocations.
    sub_ranges: Option<(PoolKey, Aperture)>,
}

#[derive(Debug)]
struct Inner {
    heaps: Vec<HeapState>,
    default_va: Aperture,
    descriptor_va: Aperture,
    allocations: HashMap<GpuMemoryHandle, BaseAllocation>,
    pools: HashMap<PoolKey, Vec<GpuMemoryHandle>>,
    next_handle: u64,
    paging_fence: u64,
}

impl Inner {
    fn va_aperture(&mut self, va_range: VaRange) -> &mut Aperture {
        match va_range {
            VaRange::Default => &mut self.default_va,
            VaRange::DescriptorTable => &mut self.descriptor_va,
        }
    }

    /// Creates a new base allocation in the first requested heap with room for it.
    fn create_base(
        &mut self,
        size: u64,
        alignment: u64,
        create_info: &GpuMemoryCreateInfo,
        internal_info: &GpuMemoryInternalCreateInfo,
        sub_ranges: Option<(PoolKey, Aperture)>,
    ) -> PalResult<GpuMemoryHandle> {
        let requested = size;
        let size = align_up(size, MIN_ALIGNMENT).ok_or(PalError::InvalidMemorySize(requested))?;
        let va_size = align_up(size, PAGE_SIZE).ok_or(PalError::InvalidMemorySize(requested))?;

        let heap_idx = create_info
            .heaps
            .iter()
            .find_map(|&heap| {
                self.heaps
                    .iter()
                    .position(|h| h.props.heap == heap && h.props.size - h.used >= size)
            })
            .ok_or(PalError::OutOfGpuMemory { size })?;

        let gpu_va = self
            .va_aperture(create_info.va_range)
            .allocate(va_size, alignment)
            .ok_or(PalError::OutOfVaSpace(create_info.va_range))?;

        let heap = &mut self.heaps[heap_idx];
        heap.used += size;

        let handle = GpuMemoryHandle(self.next_handle);
        self.next_handle += 1;
        // Every new base allocation is made resident immediately.
        self.paging_fence += 1;

        let desc = GpuMemoryDesc {
            heap: heap.props.heap,
            size,
            gpu_va,
            priority: create_info.priority,
            va_range: create_info.va_range,
            always_resident: internal_info.always_resident,
            suballocated: sub_ranges.is_some(),
        };

        log::debug!(
            "Allocated {size} bytes in {:?} at GPU VA 0x{gpu_va:012x} ({handle:?})",
            desc.heap
        );

        let words = (0..size / 4).map(|_| AtomicU32::new(0)).collect();
        self.allocations.insert(
            handle,
            BaseAllocation {
                desc,
                words,
                map_count: 0,
                sub_ranges,
            },
        );

        Ok(handle)
    }

    fn release_base(&mut self, handle: GpuMemoryHandle) {
        let Some(alloc) = self.allocations.remove(&handle) else {
            return;
        };

        if alloc.map_count > 0 {
            log::warn!("Freeing {handle:?} while it is still mapped {} time(s)", alloc.map_count);
        }

        if let Some(heap) = self.heaps.iter_mut().find(|h| h.props.heap == alloc.desc.heap) {
            heap.used -= alloc.desc.size;
        }

        if !self.va_aperture(alloc.desc.va_range).free(alloc.desc.gpu_va) {
            log::error!("GPU VA 0x{:x} of {handle:?} was not tracked", alloc.desc.gpu_va);
        }

        if let Some((key, _)) = alloc.sub_ranges {
            if let Some(chunks) = self.pools.get_mut(&key) {
                chunks.retain(|&h| h != handle);
                if chunks.is_empty() {
                    self.pools.remove(&key);
                }
            }
        }

        log::debug!("Released {} bytes of {handle:?}", alloc.desc.size);
    }

    fn suballocate(
        &mut self,
        create_info: &GpuMemoryCreateInfo,
        internal_info: &GpuMemoryInternalCreateInfo,
        alignment: u64,
    ) -> PalResult<(GpuMemoryHandle, u64)> {
        let key = PoolKey {
            heaps: create_info.heaps.clone(),
            va_range: create_info.va_range,
            priority: create_info.priority,
            always_resident: internal_info.always_resident,
        };
        let size = align_up(create_info.size, MIN_ALIGNMENT)
            .ok_or(PalError::InvalidMemorySize(create_info.size))?;

        let chunks = self.pools.get(&key).cloned().unwrap_or_default();
        for chunk in chunks {
            let Some((_, ranges)) = self
                .allocations
                .get_mut(&chunk)
                .and_then(|a| a.sub_ranges.as_mut())
            else {
                continue;
            };
            if let Some(offset) = ranges.allocate(size, alignment) {
                return Ok((chunk, offset));
            }
        }

        let mut ranges = Aperture::new(0, SUBALLOC_CHUNK_SIZE, MIN_ALIGNMENT, 0);
        let offset = ranges
            .allocate(size, alignment)
            .ok_or(PalError::OutOfGpuMemory { size })?;

        let chunk = self.create_base(
            SUBALLOC_CHUNK_SIZE,
            alignment,
            create_info,
            internal_info,
            Some((key.clone(), ranges)),
        )?;
        self.pools.entry(key).or_default().push(chunk);

        Ok((chunk, offset))
    }
}

/// Host-backed GPU memory manager.
///
/// Keeps the table of live base allocations, places them in heaps and GPU VA
/// ranges, and hands small requests out as suballocations of shared chunks.
#[derive(Debug)]
pub struct MemoryManager {
    inner: Mutex<Inner>,
    suballocate: bool,
}

impl Default for MemoryManager {
    fn default() -> Self {
        MemoryManagerBuilder::default().build()
    }
}

impl MemoryManager {
    #[must_use]
    pub fn builder() -> MemoryManagerBuilder {
        MemoryManagerBuilder::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Describes the base allocation behind `memory`.
    ///
    /// # Errors
    /// Returns `UnknownHandle` if `memory` is not a live allocation.
    pub fn query(&self, memory: GpuMemoryHandle) -> PalResult<GpuMemoryDesc> {
        self.lock()
            .allocations
            .get(&memory)
            .map(|a| a.desc.clone())
            .ok_or(PalError::UnknownHandle(memory))
    }

    /// Number of live base allocations.
    #[must_use]
    pub fn live_allocations(&self) -> usize {
        self.lock().allocations.len()
    }

    /// Bytes currently allocated from `heap`.
    #[must_use]
    pub fn heap_usage(&self, heap: GpuHeap) -> u64 {
        self.lock()
            .heaps
            .iter()
            .find(|h| h.props.heap == heap)
            .map_or(0, |h| h.used)
    }
}

impl GpuMemoryAllocator for MemoryManager {
    fn allocate_gpu_mem(
        &self,
        create_info: &GpuMemoryCreateInfo,
        internal_info: &GpuMemoryInternalCreateInfo,
    ) -> PalResult<(GpuMemoryHandle, u64)> {
        if create_info.size == 0 {
            return Err(PalError::InvalidMemorySize(0));
        }
        if create_info.alignment != 0 && !is_pow2(create_info.alignment) {
            return Err(PalError::InvalidAlignment(create_info.alignment));
        }
        if create_info.heaps.is_empty() {
            return Err(PalError::NoHeaps);
        }

        let alignment = create_info.alignment.max(MIN_ALIGNMENT);
        let mut inner = self.lock();

        let result = if self.suballocate && create_info.size <= SUBALLOC_THRESHOLD {
            inner.suballocate(create_info, internal_info, alignment)
        } else {
            inner
                .create_base(create_info.size, alignment, create_info, internal_info, None)
                .map(|handle| (handle, 0))
        };

        if let Err(e) = &result {
            log::warn!("GPU memory allocation of {} bytes failed: {e}", create_info.size);
        }
        result
    }

    fn free_gpu_mem(&self, memory: GpuMemoryHandle, offset: u64) {
        let mut inner = self.lock();

        let Some(alloc) = inner.allocations.get_mut(&memory) else {
            log::error!("Tried to free {memory:?} which is not a live allocation");
            return;
        };

        match alloc.sub_ranges.as_mut() {
            Some((_, ranges)) => {
                if !ranges.free(offset) {
                    log::error!("Tried to free offset {offset} of {memory:?} which was not tracked");
                    return;
                }
                if ranges.is_empty() {
                    inner.release_base(memory);
                }
            }
            None => {
                debug_assert_eq!(offset, 0, "whole allocations always start at offset 0");
                inner.release_base(memory);
            }
        }
    }

    fn map(&self, memory: GpuMemoryHandle) -> PalResult<MappedMemory> {
        let mut inner = self.lock();
        let alloc = inner
            .allocations
            .get_mut(&memory)
            .ok_or(PalError::UnknownHandle(memory))?;

        if !alloc.desc.heap.is_cpu_visible() {
            log::warn!("Cannot map {memory:?}: {:?} heap is not CPU visible", alloc.desc.heap);
            return Err(PalError::NotMappable(alloc.desc.heap));
        }

        alloc.map_count += 1;
        Ok(MappedMemory::new(alloc.words.clone()))
    }

    fn unmap(&self, memory: GpuMemoryHandle) -> PalResult<()> {
        let mut inner = self.lock();
        let alloc = inner
            .allocations
            .get_mut(&memory)
            .ok_or(PalError::UnknownHandle(memory))?;

        if alloc.map_count == 0 {
            return Err(PalError::NotMapped);
        }
        alloc.map_count -= 1;
        Ok(())
    }

    fn gpu_virt_addr(&self, memory: GpuMemoryHandle) -> PalResult<u64> {
        self.query(memory).map(|desc| desc.gpu_va)
    }

    fn last_paging_fence(&self) -> u64 {
        self.lock().paging_fence
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timestamp_info(size: u64) -> GpuMemoryCreateInfo {
        GpuMemoryCreateInfo::new(size, 4).with_heaps(&[GpuHeap::Local, GpuHeap::GartUswc])
    }

    fn resident() -> GpuMemoryInternalCreateInfo {
        GpuMemoryInternalCreateInfo {
            always_resident: true,
        }
    }

    #[test]
    fn test_first_preferred_heap_is_chosen() {
        let mgr = MemoryManager::default();
        let (mem, _) = mgr.allocate_gpu_mem(&timestamp_info(8), &resident()).unwrap();

        let desc = mgr.query(mem).unwrap();
        assert_eq!(desc.heap, GpuHeap::Local);
        assert!(desc.always_resident);
        assert!(desc.suballocated);
        assert!(desc.gpu_va >= DEFAULT_VA_BASE);
    }

    #[test]
    fn test_falls_back_to_next_heap_when_full() {
        let mgr = MemoryManagerBuilder::new()
            .with_heap(GpuHeap::Local, 0)
            .with_heap(GpuHeap::GartUswc, MIB)
            .build();
        let (mem, _) = mgr.allocate_gpu_mem(&timestamp_info(4), &resident()).unwrap();

        assert_eq!(mgr.query(mem).unwrap().heap, GpuHeap::GartUswc);
        assert_eq!(mgr.heap_usage(GpuHeap::GartUswc), SUBALLOC_CHUNK_SIZE);
    }

    #[test]
    fn test_out_of_memory_when_no_heap_fits() {
        let mgr = MemoryManagerBuilder::new().with_heap(GpuHeap::Local, 4096).build();
        let err = mgr.allocate_gpu_mem(&timestamp_info(4), &resident());

        assert_eq!(
            err,
            Err(PalError::OutOfGpuMemory {
                size: SUBALLOC_CHUNK_SIZE
            })
        );
        assert_eq!(mgr.live_allocations(), 0);
    }

    #[test]
    fn test_invalid_requests_are_rejected() {
        let mgr = MemoryManager::default();
        assert_eq!(
            mgr.allocate_gpu_mem(&timestamp_info(0), &resident()),
            Err(PalError::InvalidMemorySize(0))
        );
        assert_eq!(
            mgr.allocate_gpu_mem(&GpuMemoryCreateInfo::new(4, 4), &resident()),
            Err(PalError::NoHeaps)
        );
        let odd = GpuMemoryCreateInfo::new(4, 12).with_heaps(&[GpuHeap::Local]);
        assert_eq!(mgr.allocate_gpu_mem(&odd, &resident()), Err(PalError::InvalidAlignment(12)));
    }

    #[test]
    fn test_sizes_near_u64_max_are_rejected() {
        let mgr = MemoryManager::default();
        for size in [u64::MAX - 1, u64::MAX - 4094] {
            let info = GpuMemoryCreateInfo::new(size, 4).with_heaps(&[GpuHeap::Local]);
            assert_eq!(
                mgr.allocate_gpu_mem(&info, &resident()),
                Err(PalError::InvalidMemorySize(size))
            );
        }
        assert_eq!(mgr.live_allocations(), 0);
        assert_eq!(mgr.heap_usage(GpuHeap::Local), 0);
    }

    #[test]
    fn test_small_requests_share_a_chunk() {
        let mgr = MemoryManager::default();
        let (a, a_off) = mgr.allocate_gpu_mem(&timestamp_info(4), &resident()).unwrap();
        let (b, b_off) = mgr.allocate_gpu_mem(&timestamp_info(8), &resident()).unwrap();

        assert_eq!(a, b);
        assert_eq!(a_off, 0);
        assert_eq!(b_off, 4);
        assert_eq!(mgr.live_allocations(), 1);

        mgr.free_gpu_mem(a, a_off);
        assert_eq!(mgr.live_allocations(), 1);
        mgr.free_gpu_mem(b, b_off);
        assert_eq!(mgr.live_allocations(), 0);
        assert_eq!(mgr.heap_usage(GpuHeap::Local), 0);
    }

    #[test]
    fn test_different_residency_does_not_share_chunks() {
        let mgr = MemoryManager::default();
        let (a, _) = mgr.allocate_gpu_mem(&timestamp_info(4), &resident()).unwrap();
        let (b, _) = mgr
            .allocate_gpu_mem(&timestamp_info(4), &GpuMemoryInternalCreateInfo::default())
            .unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_large_requests_get_their_own_allocation() {
        let mgr = MemoryManager::default();
        let info = GpuMemoryCreateInfo::new(SUBALLOC_THRESHOLD + 4, PAGE_SIZE)
            .with_heaps(&[GpuHeap::GartCacheable])
            .with_va_range(VaRange::DescriptorTable);
        let (mem, offset) = mgr.allocate_gpu_mem(&info, &resident()).unwrap();

        assert_eq!(offset, 0);
        let desc = mgr.query(mem).unwrap();
        assert!(!desc.suballocated);
        assert!(desc.gpu_va >= DESCRIPTOR_TABLE_VA_BASE && desc.gpu_va < DESCRIPTOR_TABLE_VA_LIMIT);

        mgr.free_gpu_mem(mem, 0);
        assert!(mgr.query(mem).is_err());
    }

    #[test]
    fn test_invisible_heap_cannot_be_mapped() {
        let mgr = MemoryManager::default();
        let info = GpuMemoryCreateInfo::new(4, 4).with_heaps(&[GpuHeap::Invisible]);
        let (mem, _) = mgr.allocate_gpu_mem(&info, &resident()).unwrap();

        assert_eq!(mgr.map(mem).err(), Some(PalError::NotMappable(GpuHeap::Invisible)));
    }

    #[test]
    fn test_map_calls_nest() {
        let mgr = MemoryManager::default();
        let (mem, _) = mgr.allocate_gpu_mem(&timestamp_info(4), &resident()).unwrap();

        let first = mgr.map(mem).unwrap();
        let second = mgr.map(mem).unwrap();
        first.write_u32(0, 42).unwrap();
        assert_eq!(second.read_u32(0).unwrap(), 42);

        assert_eq!(mgr.unmap(mem), Ok(()));
        assert_eq!(mgr.unmap(mem), Ok(()));
        assert_eq!(mgr.unmap(mem), Err(PalError::NotMapped));
    }

    #[test]
    fn test_paging_fence_advances_per_base_allocation() {
        let mgr = MemoryManagerBuilder::default().without_suballocation().build();
        assert_eq!(mgr.last_paging_fence(), 0);

        mgr.allocate_gpu_mem(&timestamp_info(4), &resident()).unwrap();
        mgr.allocate_gpu_mem(&timestamp_info(4), &resident()).unwrap();
        assert_eq!(mgr.last_paging_fence(), 2);
        assert_eq!(mgr.live_allocations(), 2);
    }
}
