//! Queue-submission context of a GPU hardware-abstraction layer.
//!
//! A [`queues::QueueContext`] owns the always-resident memory the GPU writes
//! completion timestamps into, and [`queues::EngineContext`] is the per-engine
//! hook that prepares every submission before the [`queues::Queue`] dispatches it.

pub mod device;
pub mod error;
pub mod memory;
pub mod queues;
pub mod utils;

pub use device::Device;
pub use error::{PalError, PalResult};
