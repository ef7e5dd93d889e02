use crate::device::Device;
use crate::error::{PalError, PalResult};
use crate::memory::{
    BoundGpuMemory, GpuHeap, GpuMemPriority, GpuMemoryCreateInfo, GpuMemoryInternalCreateInfo,
    VaRange,
};
use crate::queues::EngineContext;
use std::mem;

/// Size of one timestamp slot.
pub const TIMESTAMP_SIZE: u64 = mem::size_of::<u32>() as u64;

/// Timestamp slots a context owns. Both live in one allocation; the wait-for-idle
/// slot is always the word right after the exclusive-exec slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimestampSlots {
    Unbound,
    ExclusiveExec(BoundGpuMemory),
    WithWaitForIdle(BoundGpuMemory),
}

/// Owns the always-resident memory the engine writes completion timestamps into.
///
/// On its own this is the no-op [`EngineContext`]: submissions need no preamble or
/// postamble. Engine families that track completion wrap it and request timestamp
/// memory with [`QueueContext::create_timestamp_mem`].
#[derive(Debug)]
pub struct QueueContext {
    device: Device,
    slots: TimestampSlots,
}

impl QueueContext {
    #[must_use]
    pub fn new(device: Device) -> Self {
        Self {
            device,
            slots: TimestampSlots::Unbound,
        }
    }

    #[must_use]
    pub const fn device(&self) -> &Device {
        &self.device
    }

    /// Suballocates the timestamp memory, maps it and initializes it to zero.
    ///
    /// The exclusive-exec slot is always created; the wait-for-idle slot only when
    /// `need_wait_for_idle_mem` is set.
    ///
    /// # Errors
    /// Fails if the allocation, the mapping or the zeroing fails. After a failed
    /// allocation nothing is bound. After a later failure the memory stays bound
    /// (possibly not zeroed) and is released when the context is dropped.
    /// Fails with `TimestampAlreadyBound` if the context already owns timestamps.
    pub fn create_timestamp_mem(&mut self, need_wait_for_idle_mem: bool) -> PalResult<()> {
        if self.slots != TimestampSlots::Unbound {
            return Err(PalError::TimestampAlreadyBound);
        }

        let size = if need_wait_for_idle_mem {
            2 * TIMESTAMP_SIZE
        } else {
            TIMESTAMP_SIZE
        };

        // Local first, falling back to uncached system memory the host can poll cheaply.
        let create_info = GpuMemoryCreateInfo::new(size, TIMESTAMP_SIZE)
            .with_heaps(&[GpuHeap::Local, GpuHeap::GartUswc])
            .with_priority(GpuMemPriority::Normal)
            .with_va_range(VaRange::Default);

        let internal_info = GpuMemoryInternalCreateInfo {
            always_resident: true,
        };

        let mem_mgr = self.device.mem_mgr();
        let (memory, offset) = mem_mgr.allocate_gpu_mem(&create_info, &internal_info)?;

        let exclusive_exec = BoundGpuMemory::new(memory, offset);
        self.slots = if need_wait_for_idle_mem {
            TimestampSlots::WithWaitForIdle(exclusive_exec)
        } else {
            TimestampSlots::ExclusiveExec(exclusive_exec)
        };

        let mapping = exclusive_exec.map(mem_mgr).inspect_err(|e| {
            log::error!("Failed to map timestamp memory {memory:?}: {e}");
        })?;
        let zeroed = mapping.write_zeroes(0, size);
        let unmapped = exclusive_exec.unmap(mem_mgr);

        zeroed.and(unmapped)
    }

    /// Written with the most recent submission's value once it completes.
    #[must_use]
    pub const fn exclusive_exec_ts(&self) -> BoundGpuMemory {
        match self.slots {
            TimestampSlots::Unbound => BoundGpuMemory::unbound(),
            TimestampSlots::ExclusiveExec(ts) | TimestampSlots::WithWaitForIdle(ts) => ts,
        }
    }

    /// Written once the whole engine has drained; unbound unless requested at creation.
    #[must_use]
    pub const fn wait_for_idle_ts(&self) -> BoundGpuMemory {
        match self.slots {
            TimestampSlots::WithWaitForIdle(ts) => match ts.offset_by(TIMESTAMP_SIZE) {
                Some(slot) => slot,
                None => BoundGpuMemory::unbound(),
            },
            _ => BoundGpuMemory::unbound(),
        }
    }

    /// Polls the exclusive-exec slot.
    ///
    /// # Errors
    /// Returns `Unbound` without timestamp memory, or the mapping error.
    pub fn read_exclusive_exec_ts(&self) -> PalResult<u32> {
        self.read_slot(self.exclusive_exec_ts())
    }

    /// Polls the wait-for-idle slot.
    ///
    /// # Errors
    /// Returns `Unbound` without that slot, or the mapping error.
    pub fn read_wait_for_idle_ts(&self) -> PalResult<u32> {
        self.read_slot(self.wait_for_idle_ts())
    }

    fn read_slot(&self, slot: BoundGpuMemory) -> PalResult<u32> {
        let mem_mgr = self.device.mem_mgr();
        let value = slot.map(mem_mgr)?.read_u32(0);
        slot.unmap(mem_mgr)?;
        value
    }
}

impl EngineContext for QueueContext {
    fn queue_context(&self) -> &QueueContext {
        self
    }
}

impl Drop for QueueContext {
    fn drop(&mut self) {
        let exclusive_exec = match mem::replace(&mut self.slots, TimestampSlots::Unbound) {
            TimestampSlots::Unbound => return,
            TimestampSlots::ExclusiveExec(ts) => ts,
            TimestampSlots::WithWaitForIdle(ts) => {
                // Never owned its memory; it shares the exclusive-exec allocation.
                log::debug!("Unbinding wait-for-idle timestamp");
                ts
            }
        };

        debug_assert!(exclusive_exec.is_bound());

        if let Some(memory) = exclusive_exec.memory() {
            self.device
                .mem_mgr()
                .free_gpu_mem(memory, exclusive_exec.offset());
            log::debug!("Freed timestamp memory {memory:?}");
        }
    }
}
