use crate::error::NeoResult;
use crate::hw::{EngineDescriptor, EngineType, EngineUsage, PreemptionMode};
use crate::os_interface::windows::residency_controller::WddmResidencyController;
use crate::os_interface::windows::wddm::Wddm;
use crate::wddm::gdi::D3dkmtHandle;
use std::sync::Arc;
use tracing::debug;

/// WDDM GPU node ordinal for an engine.
#[must_use]
pub const fn node_ordinal(engine_type: EngineType) -> u32 {
    match engine_type {
        EngineType::Rcs => 0,
        EngineType::Vcs => 1,
        EngineType::Vecs => 2,
        EngineType::Bcs => 3,
        EngineType::Ccs(_) => 4,
    }
}

/// A kernel context plus the residency controller and monitored fence bound to it.
#[derive(Debug)]
pub struct OsContextWin {
    wddm: Arc<Wddm>,
    context_handle: D3dkmtHandle,
    residency_controller: Arc<WddmResidencyController>,
}

impl OsContextWin {
    /// # Errors
    /// Context or fence creation failures. A half-created context is destroyed.
    pub fn new(
        wddm: Arc<Wddm>,
        context_id: u32,
        engine: EngineDescriptor,
        preemption_mode: PreemptionMode,
    ) -> NeoResult<Self> {
        let context_handle = wddm.create_context(
            node_ordinal(engine.engine_type),
            engine.usage == EngineUsage::LowPriority,
            preemption_mode == PreemptionMode::Disabled,
        )?;
        let fence = match wddm.create_monitored_fence() {
            Ok(fence) => fence,
            Err(e) => {
                wddm.destroy_context(context_handle);
                return Err(e);
            }
        };
        debug!(
            context_id,
            context_handle,
            engine = ?engine.engine_type,
            fence_gpu_va = format_args!("{:#x}", fence.gpu_address()),
            "created wddm context"
        );
        let residency_controller = WddmResidencyController::new(Arc::clone(&wddm), context_id, fence);
        Ok(Self {
            wddm,
            context_handle,
            residency_controller,
        })
    }

    #[must_use]
    pub const fn wddm(&self) -> &Arc<Wddm> {
        &self.wddm
    }

    #[must_use]
    pub const fn context_handle(&self) -> D3dkmtHandle {
        self.context_handle
    }

    #[must_use]
    pub fn residency_controller(&self) -> &WddmResidencyController {
        &self.residency_controller
    }
}

impl Drop for OsContextWin {
    fn drop(&mut self) {
        self.wddm
            .destroy_monitored_fence(self.residency_controller.monitored_fence());
        self.wddm.destroy_context(self.context_handle);
    }
}
