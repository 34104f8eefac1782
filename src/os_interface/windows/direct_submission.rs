use crate::direct_submission::DirectSubmissionOs;
use crate::error::{NeoError, NeoResult};
use crate::memory::GraphicsAllocation;
use crate::os_interface::OsContext;
use crate::os_interface::fence::MonitoredFence;
use crate::os_interface::windows::os_context::OsContextWin;
use crate::os_interface::windows::submission::command_buffer_header;
use crate::os_interface::windows::wddm::Wddm;
use std::sync::Arc;

/// Ring submission on WDDM with a monitored fence separate from the context's.
#[derive(Debug)]
pub struct WddmDirectSubmission {
    wddm: Arc<Wddm>,
    os_context: Arc<OsContext>,
    fence: MonitoredFence,
}

impl WddmDirectSubmission {
    /// # Errors
    /// Fails on a non-WDDM context or if the fence cannot be created.
    pub fn new(os_context: Arc<OsContext>) -> NeoResult<Self> {
        let wddm = os_context
            .windows()
            .map(|ctx| Arc::clone(ctx.wddm()))
            .ok_or_else(|| NeoError::General("wddm submission on a non-wddm context".into()))?;
        let fence = wddm.create_monitored_fence()?;
        fence.cpu_address().store(0);
        Ok(Self {
            wddm,
            os_context,
            fence,
        })
    }

    fn context(&self) -> NeoResult<&OsContextWin> {
        self.os_context
            .windows()
            .ok_or_else(|| NeoError::General("wddm submission on a non-wddm context".into()))
    }
}

impl DirectSubmissionOs for WddmDirectSubmission {
    fn completion_fence(&self) -> &MonitoredFence {
        &self.fence
    }

    fn handle_residency(&mut self, allocations: &[Arc<GraphicsAllocation>]) -> NeoResult<()> {
        self.context()?
            .residency_controller()
            .make_resident_residency_allocations(allocations)
    }

    fn submit(&mut self, ring: &Arc<GraphicsAllocation>, offset: usize, size: usize) -> NeoResult<()> {
        let context = self.context()?;
        let mut header = command_buffer_header(
            self.wddm.hw_info(),
            crate::hw::QueueThrottle::Medium,
            self.os_context.preemption_mode(),
            false,
        );
        header.monitor_fence_va = self.fence.gpu_address();
        header.monitor_fence_value = self.fence.current_fence_value();
        self.wddm.submit(
            ring.gpu_address() + offset as u64,
            size,
            &header,
            context.context_handle(),
        )
    }

    fn wait_for_fence(&self, value: u64) -> NeoResult<()> {
        self.wddm.wait_from_cpu(value, &self.fence)
    }
}

impl Drop for WddmDirectSubmission {
    fn drop(&mut self) {
        self.wddm.destroy_monitored_fence(&self.fence);
    }
}
