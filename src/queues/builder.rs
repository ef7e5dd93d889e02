use crate::device::Device;
use crate::error::PalResult;
use crate::queues::{
    EngineContext, EngineType, InternalSubmitInfo, QueueContext, SubmitInfo, TimestampQueueContext,
};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueuePriority {
    Low,
    #[default]
    Normal,
    High,
    Realtime,
}

/// A hardware queue and the engine context that prepares its submissions.
///
/// Dropping the queue drops its context, which releases the timestamp memory.
pub struct Queue {
    engine_type: EngineType,
    priority: QueuePriority,
    device: Device,
    context: Box<dyn EngineContext>,
    submit_count: u64,
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("engine_type", &self.engine_type)
            .field("priority", &self.priority)
            .field("submit_count", &self.submit_count)
            .finish_non_exhaustive()
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        log::debug!(
            "[Queue] Destroying {:?} queue after {} submission(s)",
            self.engine_type,
            self.submit_count
        );
    }
}

impl Queue {
    #[must_use]
    pub const fn engine_type(&self) -> EngineType {
        self.engine_type
    }

    #[must_use]
    pub const fn priority(&self) -> QueuePriority {
        self.priority
    }

    #[must_use]
    pub const fn submit_count(&self) -> u64 {
        self.submit_count
    }

    #[must_use]
    pub fn context(&self) -> &dyn EngineContext {
        self.context.as_ref()
    }

    #[must_use]
    pub fn queue_context(&self) -> &QueueContext {
        self.context.queue_context()
    }

    /// Prepares and dispatches one submission.
    ///
    /// Streams run in order: the context's preamble, the client's streams, then the
    /// context's postamble.
    ///
    /// # Errors
    /// Returns the context's preprocessing error, or the first dispatch error.
    pub fn submit(&mut self, submit_info: &SubmitInfo<'_>) -> PalResult<InternalSubmitInfo> {
        let internal = self.context.pre_process_submit(submit_info)?;

        let preamble = self.context.preamble_cmd_streams();
        let postamble = self.context.postamble_cmd_streams();
        debug_assert!(internal.num_preamble_cmd_streams as usize <= preamble.len());
        debug_assert!(internal.num_postamble_cmd_streams as usize <= postamble.len());

        let mem_mgr = self.device.mem_mgr();
        let streams = preamble
            .iter()
            .take(internal.num_preamble_cmd_streams as usize)
            .chain(submit_info.cmd_streams)
            .chain(postamble.iter().take(internal.num_postamble_cmd_streams as usize));

        for stream in streams {
            stream.execute(mem_mgr).inspect_err(|e| {
                log::error!("[Queue] Dispatch on {:?} queue failed: {e}", self.engine_type);
            })?;
        }

        self.context.post_process_submit();
        self.submit_count += 1;

        log::debug!(
            "[Queue] Submitted {} client stream(s) to {:?} queue ({internal:?})",
            submit_info.cmd_streams.len(),
            self.engine_type
        );

        Ok(internal)
    }

    /// Whether every submission on this queue has completed.
    ///
    /// # Errors
    /// Returns an error if the context cannot read its completion state.
    pub fn is_idle(&self) -> PalResult<bool> {
        self.context.is_idle()
    }
}

pub struct QueueBuilder<'a> {
    device: &'a Device,
    engine_type: EngineType,
    priority: QueuePriority,
}

impl<'a> QueueBuilder<'a> {
    #[must_use]
    pub const fn new(device: &'a Device) -> Self {
        Self {
            device,
            engine_type: EngineType::Universal,
            priority: QueuePriority::Normal,
        }
    }

    #[must_use]
    pub const fn with_type(mut self, t: EngineType) -> Self {
        self.engine_type = t;
        self
    }

    #[must_use]
    pub const fn with_priority(mut self, p: QueuePriority) -> Self {
        self.priority = p;
        self
    }

    /// Creates the queue along with its engine context.
    ///
    /// # Errors
    /// Fails as a whole if the engine context cannot create its timestamp memory.
    pub fn create(self) -> PalResult<Queue> {
        let context: Box<dyn EngineContext> = match self.engine_type {
            EngineType::Timer => Box::new(QueueContext::new(self.device.clone())),
            engine_type => Box::new(
                TimestampQueueContext::new(self.device.clone(), engine_type).inspect_err(|e| {
                    log::error!("[Queue] Failed to create {engine_type:?} queue context: {e}");
                })?,
            ),
        };

        log::debug!(
            "[Queue] Created {:?} queue with {:?} priority",
            self.engine_type,
            self.priority
        );

        Ok(Queue {
            engine_type: self.engine_type,
            priority: self.priority,
            device: self.device.clone(),
            context,
            submit_count: 0,
        })
    }
}
