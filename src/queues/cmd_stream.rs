use crate::error::PalResult;
use crate::memory::{BoundGpuMemory, GpuMemoryAllocator};

/// Packets an engine context can inject around a client submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdPacket {
    Nop,
    /// Stall until residency operations up to this fence have completed.
    WaitPagingFence(u64),
    /// Stall until all previous work on the engine has drained.
    WaitForIdle,
    /// Write a 32-bit value to GPU memory.
    WriteData { dst: BoundGpuMemory, value: u32 },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CmdStream {
    packets: Vec<CmdPacket>,
}

impl CmdStream {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            packets: Vec::new(),
        }
    }

    pub fn push(&mut self, packet: CmdPacket) {
        self.packets.push(packet);
    }

    pub fn reset(&mut self) {
        self.packets.clear();
    }

    #[must_use]
    pub fn packets(&self) -> &[CmdPacket] {
        &self.packets
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Runs the stream on the host, in place of the hardware engine.
    ///
    /// Memory is always resident and work completes synchronously, so only
    /// writes have an observable effect.
    ///
    /// # Errors
    /// Returns an error if a write target cannot be mapped or is out of bounds.
    pub fn execute(&self, allocator: &dyn GpuMemoryAllocator) -> PalResult<()> {
        for packet in &self.packets {
            if let CmdPacket::WriteData { dst, value } = *packet {
                let mapping = dst.map(allocator)?;
                let written = mapping.write_u32(0, value);
                dst.unmap(allocator)?;
                written?;
            }
        }
        Ok(())
    }
}
