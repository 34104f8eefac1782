use crate::hw::{PreemptionMode, QueueThrottle};
use crate::memory::{GraphicsAllocation, TaskCountType};
use std::sync::Arc;

/// Identifies one OS-level submission; waited on with `wait_for_flush_stamp`.
pub type FlushStamp = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Every task is submitted as soon as it is flushed.
    ImmediateDispatch,
    /// Tasks queue up until `flush_batched_submissions`.
    BatchedDispatch,
}

/// Per-task requirements passed to `flush_task`.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchFlags {
    pub blocking: bool,
    pub dc_flush: bool,
    pub low_priority: bool,
    pub throttle: QueueThrottle,
    pub preemption_mode: PreemptionMode,
    pub use_slm: bool,
    pub media_sampler_required: bool,
    pub requires_coherency: bool,
}

impl Default for DispatchFlags {
    fn default() -> Self {
        Self {
            blocking: false,
            dc_flush: false,
            low_priority: false,
            throttle: QueueThrottle::Medium,
            preemption_mode: PreemptionMode::MidThread,
            use_slm: false,
            media_sampler_required: false,
            requires_coherency: false,
        }
    }
}

impl DispatchFlags {
    #[must_use]
    pub const fn blocking(mut self) -> Self {
        self.blocking = true;
        self
    }

    #[must_use]
    pub const fn dc_flush(mut self) -> Self {
        self.dc_flush = true;
        self
    }

    #[must_use]
    pub const fn throttle(mut self, throttle: QueueThrottle) -> Self {
        self.throttle = throttle;
        self
    }

    #[must_use]
    pub const fn preemption(mut self, mode: PreemptionMode) -> Self {
        self.preemption_mode = mode;
        self
    }
}

/// Position of the reserved `MI_BATCH_BUFFER_END` slot that chaining overwrites with
/// an `MI_BATCH_BUFFER_START`.
#[derive(Debug, Clone)]
pub struct EndLocation {
    pub allocation: Arc<GraphicsAllocation>,
    pub offset: usize,
}

/// A command buffer range ready for the OS shim.
#[derive(Debug, Clone)]
pub struct BatchBuffer {
    pub command_buffer: Arc<GraphicsAllocation>,
    pub start_offset: usize,
    /// End of the commands, as an offset into `command_buffer`.
    pub used_size: usize,
    pub end_location: Option<EndLocation>,
    /// Highest task count whose completion this batch signals.
    pub task_count: TaskCountType,
    pub low_priority: bool,
    pub throttle: QueueThrottle,
    pub preemption_mode: PreemptionMode,
    pub requires_coherency: bool,
}

impl BatchBuffer {
    #[must_use]
    pub fn new(command_buffer: Arc<GraphicsAllocation>, start_offset: usize, used_size: usize) -> Self {
        Self {
            command_buffer,
            start_offset,
            used_size,
            end_location: None,
            task_count: 0,
            low_priority: false,
            throttle: QueueThrottle::Medium,
            preemption_mode: PreemptionMode::MidThread,
            requires_coherency: false,
        }
    }

    #[must_use]
    pub fn gpu_start(&self) -> u64 {
        self.command_buffer.gpu_address() + self.start_offset as u64
    }

    #[must_use]
    pub const fn length(&self) -> usize {
        self.used_size - self.start_offset
    }

    /// Whether the two batches may run as one submission.
    #[must_use]
    pub fn is_compatible_with(&self, other: &Self) -> bool {
        self.low_priority == other.low_priority
            && self.throttle == other.throttle
            && self.preemption_mode == other.preemption_mode
            && self.requires_coherency == other.requires_coherency
    }
}

/// Result of `flush_task`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionStamp {
    pub task_count: TaskCountType,
    pub task_level: u32,
    pub flush_stamp: FlushStamp,
}
