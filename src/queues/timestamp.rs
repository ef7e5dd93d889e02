use crate::device::Device;
use crate::error::PalResult;
use crate::queues::{
    CmdPacket, CmdStream, EngineContext, EngineType, InternalSubmitInfo, QueueContext, SubmitInfo,
};

/// Engine context that reports completion through the timestamp slots.
///
/// Every submission gets a postamble writing its sequence number to the
/// exclusive-exec slot, and to the wait-for-idle slot when the client asked the
/// engine to drain. A preamble waiting on the paging fence is added whenever new
/// memory was made resident since the previous submission.
#[derive(Debug)]
pub struct TimestampQueueContext {
    base: QueueContext,
    engine_type: EngineType,

    /// Sequence number of the last dispatched submission; 0 before the first.
    last_issued: u32,
    pending: u32,
    last_paging_fence: u64,

    preamble: [CmdStream; 1],
    postamble: [CmdStream; 1],
}

impl TimestampQueueContext {
    /// Creates the context and its timestamp memory.
    ///
    /// # Errors
    /// Propagates any failure to create the timestamp memory.
    pub fn new(device: Device, engine_type: EngineType) -> PalResult<Self> {
        let mut base = QueueContext::new(device);
        base.create_timestamp_mem(engine_type.supports_wait_for_idle())?;

        Ok(Self {
            base,
            engine_type,
            last_issued: 0,
            pending: 0,
            last_paging_fence: 0,
            preamble: [CmdStream::new()],
            postamble: [CmdStream::new()],
        })
    }

    #[must_use]
    pub const fn engine_type(&self) -> EngineType {
        self.engine_type
    }

    #[must_use]
    pub const fn last_issued(&self) -> u32 {
        self.last_issued
    }

    /// Sequence number of the most recent submission the engine finished.
    ///
    /// # Errors
    /// Returns an error if the timestamp cannot be mapped.
    pub fn last_completed(&self) -> PalResult<u32> {
        self.base.read_exclusive_exec_ts()
    }

    /// Sequence number of the most recent submission after which the engine drained.
    ///
    /// # Errors
    /// Returns `Unbound` for engines without a wait-for-idle slot.
    pub fn last_idle(&self) -> PalResult<u32> {
        self.base.read_wait_for_idle_ts()
    }
}

impl EngineContext for TimestampQueueContext {
    fn queue_context(&self) -> &QueueContext {
        &self.base
    }

    fn pre_process_submit(&mut self, submit_info: &SubmitInfo<'_>) -> PalResult<InternalSubmitInfo> {
        // Zero means "nothing completed yet", so skip it on wrap-around.
        self.pending = match self.last_issued.wrapping_add(1) {
            0 => 1,
            next => next,
        };

        let paging_fence = self.base.device().mem_mgr().last_paging_fence();

        let preamble = &mut self.preamble[0];
        preamble.reset();
        if paging_fence > self.last_paging_fence {
            preamble.push(CmdPacket::WaitPagingFence(paging_fence));
            self.last_paging_fence = paging_fence;
        }

        let postamble = &mut self.postamble[0];
        postamble.reset();
        postamble.push(CmdPacket::WriteData {
            dst: self.base.exclusive_exec_ts(),
            value: self.pending,
        });

        let wait_for_idle_ts = self.base.wait_for_idle_ts();
        if submit_info.wait_for_idle && wait_for_idle_ts.is_bound() {
            postamble.push(CmdPacket::WaitForIdle);
            postamble.push(CmdPacket::WriteData {
                dst: wait_for_idle_ts,
                value: self.pending,
            });
        }

        Ok(InternalSubmitInfo {
            num_preamble_cmd_streams: u32::from(!self.preamble[0].is_empty()),
            num_postamble_cmd_streams: 1,
            paging_fence,
        })
    }

    fn preamble_cmd_streams(&self) -> &[CmdStream] {
        &self.preamble
    }

    fn postamble_cmd_streams(&self) -> &[CmdStream] {
        &self.postamble
    }

    fn post_process_submit(&mut self) {
        self.last_issued = self.pending;
    }

    fn is_idle(&self) -> PalResult<bool> {
        Ok(self.last_completed()? == self.last_issued)
    }
}
