//! Ownership tree of devices, engines and the memory manager.
//!
//! An [`ExecutionEnvironment`] owns one [`RootDeviceEnvironment`] per physical device
//! and the [`MemoryManager`] shared by all of them. A [`RootDevice`] creates one OS
//! context and one command stream receiver per engine the hardware reports.

use crate::command_stream::csr::{CommandStreamReceiver, CsrParams, SubmissionBackend};
use crate::error::{NeoError, NeoResult};
use crate::hw::{
    EngineDescriptor, EngineType, EngineUsage, HardwareInfo, HardwareOps, hw_ops_for,
};
use crate::memory::{MemoryBackend, MemoryManager};
use crate::os_interface::linux::{
    Drm, DrmMemoryBackend, DrmMemoryOperations, DrmSubmission, GemCloseWorkerMode, ResidencyMode,
};
use crate::os_interface::windows::os_context::node_ordinal;
use crate::os_interface::windows::{Wddm, WddmMemoryBackend, WddmSubmission};
use crate::os_interface::{DeviceBitfield, OsContext, OsInterface};
use crate::settings::DebugSettings;
use std::sync::Arc;
use tracing::{debug, info, warn};

// ============================================================================
// Root device environment
// ============================================================================

/// Everything known about one physical device before engines exist.
#[derive(Debug)]
pub struct RootDeviceEnvironment {
    hw_info: HardwareInfo,
    hw_ops: Arc<dyn HardwareOps>,
    os_interface: OsInterface,
    // Linux only: the resident set shared by the memory backend and every submission.
    memory_operations: Option<Arc<DrmMemoryOperations>>,
}

impl RootDeviceEnvironment {
    /// # Errors
    /// The device's core family has no registered hardware ops.
    pub fn from_drm(drm: Arc<Drm>) -> NeoResult<Self> {
        let hw_info = *drm.hw_info();
        let mode = if drm.is_vm_bind_available() {
            ResidencyMode::VmBind
        } else {
            ResidencyMode::ExecObjects
        };
        Ok(Self {
            hw_ops: hw_ops_for(hw_info.family)?,
            hw_info,
            os_interface: OsInterface::Drm(drm),
            memory_operations: Some(Arc::new(DrmMemoryOperations::new(mode))),
        })
    }

    /// # Errors
    /// The device's core family has no registered hardware ops.
    pub fn from_wddm(wddm: Arc<Wddm>) -> NeoResult<Self> {
        let hw_info = *wddm.hw_info();
        Ok(Self {
            hw_ops: hw_ops_for(hw_info.family)?,
            hw_info,
            os_interface: OsInterface::Wddm(wddm),
            memory_operations: None,
        })
    }

    #[must_use]
    pub const fn hw_info(&self) -> &HardwareInfo {
        &self.hw_info
    }

    #[must_use]
    pub const fn hw_ops(&self) -> &Arc<dyn HardwareOps> {
        &self.hw_ops
    }

    #[must_use]
    pub const fn os_interface(&self) -> &OsInterface {
        &self.os_interface
    }

    #[must_use]
    pub const fn memory_operations(&self) -> Option<&Arc<DrmMemoryOperations>> {
        self.memory_operations.as_ref()
    }

    fn create_memory_backend(&self, settings: &DebugSettings) -> NeoResult<Box<dyn MemoryBackend>> {
        match &self.os_interface {
            OsInterface::Drm(drm) => {
                let memory_operations = self.memory_operations.clone().ok_or_else(|| {
                    NeoError::General("drm environment without memory operations".into())
                })?;
                let mode = if settings.enable_gem_close_worker.unwrap_or(true) {
                    GemCloseWorkerMode::Active
                } else {
                    GemCloseWorkerMode::Inactive
                };
                Ok(Box::new(DrmMemoryBackend::new(
                    Arc::clone(drm),
                    memory_operations,
                    mode,
                )?))
            }
            OsInterface::Wddm(wddm) => Ok(Box::new(WddmMemoryBackend::new(
                Arc::clone(wddm),
                settings.make_resident_before_lock_attempts,
            ))),
        }
    }
}

// ============================================================================
// Execution environment
// ============================================================================

#[derive(Debug)]
pub struct ExecutionEnvironment {
    settings: DebugSettings,
    root_device_environments: Vec<RootDeviceEnvironment>,
    memory_manager: Option<Arc<MemoryManager>>,
}

impl ExecutionEnvironment {
    #[must_use]
    pub const fn new(settings: DebugSettings) -> Self {
        Self {
            settings,
            root_device_environments: Vec::new(),
            memory_manager: None,
        }
    }

    /// Adds a device and returns its root device index. Devices must be added before
    /// the memory manager is created.
    pub fn add_root_device_environment(&mut self, environment: RootDeviceEnvironment) -> u32 {
        crate::unrecoverable_if!(self.memory_manager.is_some());
        let index = self.root_device_environments.len() as u32;
        info!(
            root_device_index = index,
            family = ?environment.hw_info.family,
            device_id = format_args!("{:#x}", environment.hw_info.device_id),
            "added root device"
        );
        self.root_device_environments.push(environment);
        index
    }

    #[must_use]
    pub const fn settings(&self) -> &DebugSettings {
        &self.settings
    }

    #[must_use]
    pub fn root_device_count(&self) -> usize {
        self.root_device_environments.len()
    }

    /// # Errors
    /// [`NeoError::InvalidRootDevice`] for an unknown index.
    pub fn root_device_environment(&self, index: u32) -> NeoResult<&RootDeviceEnvironment> {
        self.root_device_environments
            .get(index as usize)
            .ok_or(NeoError::InvalidRootDevice(index))
    }

    /// Creates the memory manager with one backend per root device. Calling it again
    /// returns the existing manager.
    ///
    /// # Errors
    /// Backend creation failures.
    pub fn initialize_memory_manager(&mut self) -> NeoResult<Arc<MemoryManager>> {
        if let Some(existing) = &self.memory_manager {
            return Ok(Arc::clone(existing));
        }
        if self.root_device_environments.is_empty() {
            return Err(NeoError::General("no root devices".into()));
        }
        let backends = self
            .root_device_environments
            .iter()
            .map(|env| env.create_memory_backend(&self.settings))
            .collect::<NeoResult<Vec<_>>>()?;
        let memory_manager = Arc::new(MemoryManager::new(backends));
        self.memory_manager = Some(Arc::clone(&memory_manager));
        Ok(memory_manager)
    }

    #[must_use]
    pub const fn memory_manager(&self) -> Option<&Arc<MemoryManager>> {
        self.memory_manager.as_ref()
    }

    /// # Errors
    /// See [`RootDevice::create`].
    pub fn create_root_device(&mut self, root_device_index: u32) -> NeoResult<RootDevice> {
        let memory_manager = self.initialize_memory_manager()?;
        RootDevice::create(self, &memory_manager, root_device_index)
    }
}

impl Drop for ExecutionEnvironment {
    fn drop(&mut self) {
        self.root_device_environments.clear();
        if let Some(memory_manager) = self.memory_manager.take()
            && Arc::strong_count(&memory_manager) > 1
        {
            warn!("memory manager outlives its execution environment");
        }
        debug!("destroyed execution environment");
    }
}

// ============================================================================
// Root device
// ============================================================================

/// One engine of a root device.
#[derive(Debug)]
pub struct EngineControl {
    pub csr: CommandStreamReceiver,
    pub os_context: Arc<OsContext>,
}

impl EngineControl {
    #[must_use]
    pub fn engine_type(&self) -> EngineType {
        self.os_context.engine_type()
    }
}

#[derive(Debug)]
pub struct RootDevice {
    root_device_index: u32,
    engines: Vec<EngineControl>,
    memory_manager: Arc<MemoryManager>,
}

impl RootDevice {
    /// Creates an OS context and CSR for every engine the hardware exposes, honouring
    /// the node ordinal override. Direct submission is enabled where supported.
    ///
    /// # Errors
    /// Context or CSR creation failures; engines created so far are torn down.
    pub fn create(
        environment: &ExecutionEnvironment,
        memory_manager: &Arc<MemoryManager>,
        root_device_index: u32,
    ) -> NeoResult<Self> {
        let root = environment.root_device_environment(root_device_index)?;
        let settings = environment.settings();

        let mut engine_types = root.hw_ops.engine_types(&root.hw_info);
        if let Some(ordinal) = settings.node_ordinal {
            engine_types.retain(|&engine| node_ordinal(engine) == ordinal);
        }
        if engine_types.is_empty() {
            return Err(NeoError::Unsupported(format!(
                "no engines on root device {root_device_index}"
            )));
        }

        let device_bitfield = DeviceBitfield::all(root.hw_info.sub_device_count.max(1));
        let mut engines = Vec::with_capacity(engine_types.len());
        for engine_type in engine_types {
            let engine = EngineDescriptor::new(engine_type, EngineUsage::Regular);
            let os_context = OsContext::create(
                &root.os_interface,
                memory_manager.create_os_context_id(),
                root_device_index,
                device_bitfield,
                engine,
                root.hw_info.default_preemption_mode,
            )?;
            let params = CsrParams::new(
                Arc::clone(&os_context),
                Arc::clone(memory_manager),
                Arc::clone(&root.hw_ops),
                root.hw_info,
                settings,
            );
            let backend_context = Arc::clone(&os_context);
            let mut csr = CommandStreamReceiver::new(params, |tag, tag_gpu_address| {
                create_submission_backend(root, backend_context, tag, tag_gpu_address)
            })?;
            if let Err(e) = csr.init_direct_submission(settings) {
                warn!(?engine_type, error = %e, "direct submission unavailable");
            }
            debug!(
                root_device_index,
                context_id = os_context.context_id(),
                ?engine_type,
                "created engine"
            );
            engines.push(EngineControl { csr, os_context });
        }

        Ok(Self {
            root_device_index,
            engines,
            memory_manager: Arc::clone(memory_manager),
        })
    }

    #[must_use]
    pub const fn root_device_index(&self) -> u32 {
        self.root_device_index
    }

    #[must_use]
    pub fn engines(&self) -> &[EngineControl] {
        &self.engines
    }

    #[must_use]
    pub fn engine(&self, engine_type: EngineType) -> Option<&EngineControl> {
        self.engines.iter().find(|e| e.engine_type() == engine_type)
    }

    pub fn engine_mut(&mut self, engine_type: EngineType) -> Option<&mut EngineControl> {
        self.engines
            .iter_mut()
            .find(|e| e.engine_type() == engine_type)
    }

    #[must_use]
    pub const fn memory_manager(&self) -> &Arc<MemoryManager> {
        &self.memory_manager
    }
}

impl Drop for RootDevice {
    fn drop(&mut self) {
        // CSRs wait for their last task before the contexts go away.
        self.engines.clear();
        let remaining = self.memory_manager.drain_deferred_frees();
        if remaining > 0 {
            warn!(
                root_device_index = self.root_device_index,
                remaining, "allocations still busy after engine teardown"
            );
        }
    }
}

fn create_submission_backend(
    root: &RootDeviceEnvironment,
    os_context: Arc<OsContext>,
    tag: crate::os_interface::TagAddress,
    tag_gpu_address: u64,
) -> NeoResult<Box<dyn SubmissionBackend>> {
    match &root.os_interface {
        OsInterface::Drm(_) => {
            let memory_operations = root.memory_operations.clone().ok_or_else(|| {
                NeoError::General("drm environment without memory operations".into())
            })?;
            Ok(Box::new(DrmSubmission::new(
                os_context,
                memory_operations,
                tag,
                tag_gpu_address,
            )?))
        }
        OsInterface::Wddm(_) => Ok(Box::new(WddmSubmission::new(os_context)?)),
    }
}
