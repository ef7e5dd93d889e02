use crate::memory::{GpuHeap, GpuMemoryHandle, VaRange};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PalError {
    #[error("Out of GPU memory: no requested heap can hold {size} bytes")]
    OutOfGpuMemory { size: u64 },

    #[error("Invalid GPU memory size: {0}")]
    InvalidMemorySize(u64),

    #[error("Invalid GPU memory alignment: {0}")]
    InvalidAlignment(u64),

    #[error("No heaps were requested for the allocation")]
    NoHeaps,

    #[error("Out of GPU virtual address space in the {0:?} range")]
    OutOfVaSpace(VaRange),

    #[error("Unknown GPU memory handle: {0:?}")]
    UnknownHandle(GpuMemoryHandle),

    #[error("GPU memory in the {0:?} heap is not CPU visible")]
    NotMappable(GpuHeap),

    #[error("GPU memory is not mapped")]
    NotMapped,

    #[error("Memory handle is not bound to an allocation")]
    Unbound,

    #[error("Access of {len} bytes at offset {offset} exceeds the {size} byte mapping")]
    OutOfBounds { offset: u64, len: u64, size: u64 },

    #[error("Access at offset {offset} is not 4-byte aligned")]
    Unaligned { offset: u64 },

    #[error("Timestamp memory is already bound to this queue context")]
    TimestampAlreadyBound,
}

// A convenient alias
pub type PalResult<T> = Result<T, PalError>;
