use crate::command_stream::csr::SubmissionBackend;
use crate::command_stream::dispatch_flags::{BatchBuffer, FlushStamp};
use crate::direct_submission::DirectSubmissionOs;
use crate::error::{NeoError, NeoResult};
use crate::hw::{HardwareInfo, PreemptionMode, QueueThrottle};
use crate::memory::{GraphicsAllocation, MemoryManager};
use crate::os_interface::OsContext;
use crate::os_interface::fence::MonitoredFence;
use crate::os_interface::windows::direct_submission::WddmDirectSubmission;
use crate::os_interface::windows::os_context::OsContextWin;
use crate::os_interface::windows::wddm::Wddm;
use crate::wddm::gdi::CommandBufferHeader;
use std::sync::Arc;
use tracing::{debug, trace};

/// Builds the private command buffer header. The throttle hint selects how much of
/// the GPU topology the kernel should power for the batch.
#[must_use]
pub fn command_buffer_header(
    hw_info: &HardwareInfo,
    throttle: QueueThrottle,
    preemption_mode: PreemptionMode,
    requires_coherency: bool,
) -> CommandBufferHeader {
    let eu_per_subslice = hw_info.eu_count / hw_info.subslice_count.max(1);
    let (slice_state, subslice_count, eu_count) = match throttle {
        QueueThrottle::Low => (0, 0, eu_per_subslice),
        QueueThrottle::Medium => (0, 0, hw_info.eu_count),
        QueueThrottle::High => (hw_info.slice_count, hw_info.subslice_count, hw_info.eu_count),
    };
    CommandBufferHeader {
        needs_mid_batch_pre_emption_support: preemption_mode == PreemptionMode::MidBatch,
        requires_coherency,
        uses_resource_streamer: false,
        umd_requested_slice_state: slice_state,
        umd_requested_subslice_count: subslice_count,
        umd_requested_eu_count: eu_count,
        monitor_fence_va: 0,
        monitor_fence_value: 0,
    }
}

/// Submission through `D3DKMTSubmitCommand` signalling the context's monitored fence.
#[derive(Debug)]
pub struct WddmSubmission {
    wddm: Arc<Wddm>,
    os_context: Arc<OsContext>,
}

impl WddmSubmission {
    /// # Errors
    /// Fails if `os_context` is not a WDDM context.
    pub fn new(os_context: Arc<OsContext>) -> NeoResult<Self> {
        let wddm = os_context
            .windows()
            .map(|ctx| Arc::clone(ctx.wddm()))
            .ok_or_else(|| NeoError::General("wddm submission on a non-wddm context".into()))?;
        Ok(Self { wddm, os_context })
    }

    fn context(&self) -> NeoResult<&OsContextWin> {
        self.os_context
            .windows()
            .ok_or_else(|| NeoError::General("wddm submission on a non-wddm context".into()))
    }

    /// The fence flush stamps refer to.
    ///
    /// # Errors
    /// Fails if the context is not a WDDM context.
    pub fn monitored_fence(&self) -> NeoResult<&MonitoredFence> {
        Ok(self.context()?.residency_controller().monitored_fence())
    }

    fn notify_kmdaf(&self, batch: &BatchBuffer, allocations: &[Arc<GraphicsAllocation>]) {
        let gdi = self.wddm.gdi();
        let batch_allocation = std::iter::once(&batch.command_buffer);
        for allocation in allocations.iter().chain(batch_allocation) {
            if allocation.allocation_type().requires_kmdaf_lock()
                && let Some(w) = allocation.wddm_allocation()
            {
                gdi.kmdaf_notify_lock(w.handle());
            }
        }
    }
}

impl SubmissionBackend for WddmSubmission {
    fn os_context(&self) -> &Arc<OsContext> {
        &self.os_context
    }

    fn process_residency(&mut self, allocations: &[Arc<GraphicsAllocation>]) -> NeoResult<()> {
        self.context()?
            .residency_controller()
            .make_resident_residency_allocations(allocations)
    }

    fn process_eviction(&mut self, evictions: &[Arc<GraphicsAllocation>]) -> NeoResult<()> {
        self.context()?
            .residency_controller()
            .make_non_resident_eviction_allocations(evictions);
        Ok(())
    }

    fn exec(&mut self, batch: &BatchBuffer, allocations: &[Arc<GraphicsAllocation>]) -> NeoResult<FlushStamp> {
        if self.wddm.is_kmdaf_enabled() {
            self.notify_kmdaf(batch, allocations);
        }
        let context = self.context()?;
        let mut header = command_buffer_header(
            self.wddm.hw_info(),
            batch.throttle,
            batch.preemption_mode,
            batch.requires_coherency,
        );

        let controller = context.residency_controller();
        let _residency = controller.lock();
        let fence = controller.monitored_fence();
        let mut state = fence.state();
        header.monitor_fence_va = fence.gpu_address();
        header.monitor_fence_value = state.current_fence_value;

        self.wddm.submit(
            batch.gpu_start(),
            batch.length(),
            &header,
            context.context_handle(),
        )?;
        let stamp = MonitoredFence::advance(&mut state);
        trace!(
            context_id = self.os_context.context_id(),
            fence = stamp,
            task_count = batch.task_count,
            "submitted command buffer"
        );
        Ok(stamp)
    }

    fn wait_for_flush_stamp(&self, stamp: FlushStamp) -> NeoResult<()> {
        let fence = self.monitored_fence()?;
        self.wddm.wait_from_cpu(stamp, fence)
    }

    fn create_direct_submission_os(
        &self,
        _memory_manager: &Arc<MemoryManager>,
    ) -> NeoResult<Box<dyn DirectSubmissionOs>> {
        debug!(context_id = self.os_context.context_id(), "creating wddm direct submission");
        Ok(Box::new(WddmDirectSubmission::new(Arc::clone(&self.os_context))?))
    }
}
