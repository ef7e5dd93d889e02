use crate::memory::{GpuMemoryAllocator, MemoryManager};
use std::fmt;
use std::sync::Arc;

/// A handle to the GPU device queues are created on.
///
/// The allocator lives behind an `Arc`, so the device is cheap to clone and share
/// across every queue (and queue context) that needs memory from it.
#[derive(Clone)]
pub struct Device {
    mem_mgr: Arc<dyn GpuMemoryAllocator>,
}

impl Device {
    #[must_use]
    pub fn new(mem_mgr: Arc<dyn GpuMemoryAllocator>) -> Self {
        Self { mem_mgr }
    }

    /// The allocator all internal GPU memory is taken from.
    #[must_use]
    pub fn mem_mgr(&self) -> &dyn GpuMemoryAllocator {
        self.mem_mgr.as_ref()
    }
}

impl Default for Device {
    /// A device backed by a [`MemoryManager`] with the default heap layout.
    fn default() -> Self {
        Self::new(Arc::new(MemoryManager::default()))
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("last_paging_fence", &self.mem_mgr.last_paging_fence())
            .finish_non_exhaustive()
    }
}
