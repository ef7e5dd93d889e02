pub mod builder;
pub mod cmd_stream;
pub mod context;
pub mod timestamp;

use crate::error::PalResult;

pub use builder::{Queue, QueueBuilder, QueuePriority};
pub use cmd_stream::{CmdPacket, CmdStream};
pub use context::QueueContext;
pub use timestamp::TimestampQueueContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineType {
    Universal,
    Compute,
    Dma,
    Timer,
}

impl EngineType {
    /// Whether the engine can report full idleness in addition to per-submission completion.
    #[must_use]
    pub const fn supports_wait_for_idle(self) -> bool {
        matches!(self, Self::Universal | Self::Compute)
    }
}

/// One client submission.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubmitInfo<'a> {
    /// Client command streams, dispatched in order.
    pub cmd_streams: &'a [CmdStream],
    /// Ask the engine to drain all outstanding work once these streams complete.
    pub wait_for_idle: bool,
}

/// Per-submission bookkeeping an [`EngineContext`] hands back to its queue.
///
/// The all-zero value is always a valid descriptor: no extra streams, no fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InternalSubmitInfo {
    pub num_preamble_cmd_streams: u32,
    pub num_postamble_cmd_streams: u32,
    pub paging_fence: u64,
}

/// Engine-specific submission hooks, one implementation per engine family.
pub trait EngineContext: Send {
    /// The timestamp-owning context shared by every engine family.
    fn queue_context(&self) -> &QueueContext;

    /// Prepares one submission. The default needs no extra work.
    ///
    /// The returned counts must not exceed the lengths of
    /// [`EngineContext::preamble_cmd_streams`] and [`EngineContext::postamble_cmd_streams`].
    ///
    /// # Errors
    /// Implementations report failures that must abort the submission.
    fn pre_process_submit(&mut self, submit_info: &SubmitInfo<'_>) -> PalResult<InternalSubmitInfo> {
        let _ = submit_info;
        Ok(InternalSubmitInfo::default())
    }

    /// Streams dispatched ahead of the client's.
    fn preamble_cmd_streams(&self) -> &[CmdStream] {
        &[]
    }

    /// Streams dispatched after the client's.
    fn postamble_cmd_streams(&self) -> &[CmdStream] {
        &[]
    }

    /// Runs once the submission has been dispatched.
    fn post_process_submit(&mut self) {}

    /// Whether every dispatched submission has completed.
    ///
    /// # Errors
    /// Returns an error if the completion state cannot be read.
    fn is_idle(&self) -> PalResult<bool> {
        Ok(true)
    }
}
