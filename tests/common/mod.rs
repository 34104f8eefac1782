//! Kernel-driver doubles shared by the integration tests.
#![allow(dead_code)]

use neo_rs::command_stream::csr::TaskHeaps;
use neo_rs::command_stream::dispatch_flags::{BatchBuffer, CompletionStamp, DispatchFlags, FlushStamp};
use neo_rs::command_stream::{CommandStreamReceiver, IndirectHeap, IndirectHeapType, LinearStream, SubmissionBackend};
use neo_rs::direct_submission::DirectSubmissionOs;
use neo_rs::drm::DrmDevice;
use neo_rs::drm::ioctl::{
    ContextCreateExtArgs, ContextParamArgs, ExecObject, Execbuffer2Args, GemCreateArgs,
    GemUserptrArgs, GemWaitArgs, I915_PARAM_CHIPSET_ID, I915_PARAM_HAS_EXEC_SOFTPIN,
    PRELIM_I915_PARAM_HAS_VM_BIND, RegReadArgs, VmBindArgs, VmControlArgs,
};
use neo_rs::memory::{
    AllocationProperties, AllocationType, BackendRequest, GraphicsAllocation, MemoryBackend,
    MemoryManager, OsHandle, TaskCountType,
};
use neo_rs::os_interface::{OsContext, TagAddress};
use neo_rs::wddm::gdi::{
    CreateAllocationArgs, CreateContextArgs, CreateMonitoredFenceArgs, EvictArgs, LockArgs,
    MakeResidentArgs, MapGpuVirtualAddressArgs, SubmitCommandArgs, WaitFromCpuArgs,
};
use neo_rs::wddm::{D3dkmtHandle, Gdi, NtStatus};
use neo_rs::{NeoError, NeoResult};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

// ============================================================================
// i915
// ============================================================================

#[derive(Debug, Clone)]
pub struct Exec {
    pub ctx_id: u32,
    pub batch_start_offset: u32,
    pub batch_len: u32,
    pub objects: Vec<ExecObject>,
}

#[derive(Debug, Default)]
pub struct DrmCalls {
    pub requests: Vec<&'static str>,
    pub gem_closed: Vec<u32>,
    pub waits: Vec<u32>,
    pub execs: Vec<Exec>,
    pub binds: Vec<VmBindArgs>,
    pub unbinds: Vec<VmBindArgs>,
}

type Hook = Box<dyn Fn() + Send + Sync>;

/// i915 double. Ids count up from 1; errnos can be queued per request.
pub struct MockDrm {
    next_id: AtomicU32,
    vm_bind: bool,
    errors: Mutex<HashMap<&'static str, VecDeque<i32>>>,
    on_wait: Mutex<Option<Hook>>,
    calls: Mutex<DrmCalls>,
}

impl fmt::Debug for MockDrm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockDrm").field("vm_bind", &self.vm_bind).finish_non_exhaustive()
    }
}

impl MockDrm {
    pub fn new(vm_bind: bool) -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU32::new(0),
            vm_bind,
            errors: Mutex::new(HashMap::new()),
            on_wait: Mutex::new(None),
            calls: Mutex::new(DrmCalls::default()),
        })
    }

    pub fn fail(&self, request: &'static str, errnos: &[i32]) {
        self.errors
            .lock()
            .unwrap()
            .entry(request)
            .or_default()
            .extend(errnos.iter().copied());
    }

    /// Runs `hook` inside the next `GEM_WAIT`, standing in for the GPU retiring work.
    pub fn on_next_wait(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.on_wait.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn calls(&self) -> MutexGuard<'_, DrmCalls> {
        self.calls.lock().unwrap()
    }

    pub fn count(&self, request: &str) -> usize {
        self.calls().requests.iter().filter(|r| **r == request).count()
    }

    fn id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn enter(&self, request: &'static str) -> io::Result<()> {
        self.calls().requests.push(request);
        match self.errors.lock().unwrap().get_mut(request).and_then(VecDeque::pop_front) {
            Some(errno) => Err(io::Error::from_raw_os_error(errno)),
            None => Ok(()),
        }
    }
}

impl DrmDevice for MockDrm {
    fn get_param(&self, param: i32) -> io::Result<i32> {
        self.enter("GETPARAM")?;
        match param {
            I915_PARAM_CHIPSET_ID => Ok(0x9a49),
            I915_PARAM_HAS_EXEC_SOFTPIN => Ok(1),
            PRELIM_I915_PARAM_HAS_VM_BIND if self.vm_bind => Ok(1),
            _ => Err(io::Error::from_raw_os_error(libc::EINVAL)),
        }
    }

    fn gem_create(&self, args: &mut GemCreateArgs) -> io::Result<()> {
        self.enter("GEM_CREATE")?;
        args.handle = self.id();
        Ok(())
    }

    fn gem_userptr(&self, args: &mut GemUserptrArgs) -> io::Result<()> {
        self.enter("GEM_USERPTR")?;
        args.handle = self.id();
        Ok(())
    }

    fn gem_close(&self, handle: u32) -> io::Result<()> {
        self.enter("GEM_CLOSE")?;
        self.calls().gem_closed.push(handle);
        Ok(())
    }

    fn gem_wait(&self, args: &mut GemWaitArgs) -> io::Result<()> {
        self.enter("GEM_WAIT")?;
        self.calls().waits.push(args.bo_handle);
        let hook = self.on_wait.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }
        Ok(())
    }

    fn execbuffer2(&self, args: &mut Execbuffer2Args, objects: &mut [ExecObject]) -> io::Result<()> {
        self.enter("EXECBUFFER2")?;
        self.calls().execs.push(Exec {
            ctx_id: args.rsvd1 as u32,
            batch_start_offset: args.batch_start_offset,
            batch_len: args.batch_len,
            objects: objects.to_vec(),
        });
        Ok(())
    }

    fn context_create_ext(&self, args: &mut ContextCreateExtArgs) -> io::Result<()> {
        self.enter("CONTEXT_CREATE_EXT")?;
        args.ctx_id = self.id();
        Ok(())
    }

    fn context_destroy(&self, _ctx_id: u32) -> io::Result<()> {
        self.enter("CONTEXT_DESTROY")
    }

    fn context_set_param(&self, _args: &mut ContextParamArgs) -> io::Result<()> {
        self.enter("CONTEXT_SETPARAM")
    }

    fn vm_create(&self, args: &mut VmControlArgs) -> io::Result<()> {
        self.enter("VM_CREATE")?;
        args.vm_id = self.id();
        Ok(())
    }

    fn vm_destroy(&self, _vm_id: u32) -> io::Result<()> {
        self.enter("VM_DESTROY")
    }

    fn vm_bind(&self, args: &mut VmBindArgs) -> io::Result<()> {
        self.enter("VM_BIND")?;
        self.calls().binds.push(*args);
        Ok(())
    }

    fn vm_unbind(&self, args: &mut VmBindArgs) -> io::Result<()> {
        self.enter("VM_UNBIND")?;
        self.calls().unbinds.push(*args);
        Ok(())
    }

    fn reg_read(&self, args: &mut RegReadArgs) -> io::Result<()> {
        self.enter("REG_READ")?;
        args.val = 42;
        Ok(())
    }
}

// ============================================================================
// D3DKMT
// ============================================================================

#[derive(Debug, Default)]
pub struct GdiCalls {
    pub make_resident: Vec<(Vec<D3dkmtHandle>, bool)>,
    pub evict: Vec<Vec<D3dkmtHandle>>,
    pub destroyed: Vec<D3dkmtHandle>,
    pub submits: Vec<SubmitCommandArgs>,
    pub waits: Vec<(D3dkmtHandle, u64)>,
}

/// D3DKMT double. Submissions signal their monitored fence immediately, the way a
/// GPU that finishes instantly would.
#[derive(Debug, Default)]
pub struct MockGdi {
    next_handle: AtomicU32,
    // (sync object, gpu va, counter)
    fences: Mutex<Vec<(D3dkmtHandle, u64, Box<AtomicU64>)>>,
    make_resident_results: Mutex<VecDeque<(NtStatus, u64)>>,
    calls: Mutex<GdiCalls>,
}

impl MockGdi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queues results for the next `D3DKMTMakeResident` calls; later calls succeed.
    pub fn script_make_resident(&self, results: &[(NtStatus, u64)]) {
        self.make_resident_results.lock().unwrap().extend(results.iter().copied());
    }

    pub fn calls(&self) -> MutexGuard<'_, GdiCalls> {
        self.calls.lock().unwrap()
    }

    fn handle(&self) -> D3dkmtHandle {
        self.next_handle.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl Gdi for MockGdi {
    fn create_allocation(&self, args: &mut CreateAllocationArgs) -> NtStatus {
        args.allocation_handle = self.handle();
        args.resource_handle = self.handle();
        NtStatus::SUCCESS
    }

    fn destroy_allocation(&self, _device: D3dkmtHandle, handles: &[D3dkmtHandle]) -> NtStatus {
        self.calls().destroyed.extend_from_slice(handles);
        NtStatus::SUCCESS
    }

    fn map_gpu_virtual_address(&self, args: &mut MapGpuVirtualAddressArgs) -> NtStatus {
        args.virtual_address = args.preferred_address;
        NtStatus::SUCCESS
    }

    fn make_resident(&self, args: &mut MakeResidentArgs) -> NtStatus {
        self.calls()
            .make_resident
            .push((args.handles.clone(), args.cant_trim_further));
        match self.make_resident_results.lock().unwrap().pop_front() {
            Some((status, bytes)) => {
                args.num_bytes_to_trim = bytes;
                status
            }
            None => NtStatus::SUCCESS,
        }
    }

    fn evict(&self, args: &mut EvictArgs) -> NtStatus {
        self.calls().evict.push(args.handles.clone());
        NtStatus::SUCCESS
    }

    fn lock(&self, args: &mut LockArgs) -> NtStatus {
        args.data = 0x1000;
        NtStatus::SUCCESS
    }

    fn unlock(&self, _device: D3dkmtHandle, _handle: D3dkmtHandle) -> NtStatus {
        NtStatus::SUCCESS
    }

    fn create_context(&self, args: &mut CreateContextArgs) -> NtStatus {
        args.context = self.handle();
        NtStatus::SUCCESS
    }

    fn destroy_context(&self, _context: D3dkmtHandle) -> NtStatus {
        NtStatus::SUCCESS
    }

    fn create_monitored_fence(&self, args: &mut CreateMonitoredFenceArgs) -> NtStatus {
        let counter = Box::new(AtomicU64::new(args.initial_fence_value));
        let sync_object = self.handle();
        let gpu_va = 0xffff_0000 + u64::from(sync_object) * 8;
        args.sync_object = sync_object;
        args.fence_value_cpu_va = std::ptr::from_ref::<AtomicU64>(&counter) as u64;
        args.fence_value_gpu_va = gpu_va;
        self.fences.lock().unwrap().push((sync_object, gpu_va, counter));
        NtStatus::SUCCESS
    }

    fn destroy_synchronization_object(&self, _handle: D3dkmtHandle) -> NtStatus {
        NtStatus::SUCCESS
    }

    fn submit_command(&self, args: &SubmitCommandArgs) -> NtStatus {
        self.calls().submits.push(args.clone());
        let fences = self.fences.lock().unwrap();
        if let Some((_, _, counter)) = fences
            .iter()
            .find(|(_, va, _)| *va == args.header.monitor_fence_va)
        {
            counter.fetch_max(args.header.monitor_fence_value, Ordering::AcqRel);
        }
        NtStatus::SUCCESS
    }

    fn wait_for_synchronization_object_from_cpu(&self, args: &WaitFromCpuArgs) -> NtStatus {
        let fences = self.fences.lock().unwrap();
        for (handle, value) in args.objects.iter().zip(&args.fence_values) {
            self.calls().waits.push((*handle, *value));
            if let Some((_, _, counter)) = fences.iter().find(|(h, _, _)| h == handle) {
                counter.fetch_max(*value, Ordering::AcqRel);
            }
        }
        NtStatus::SUCCESS
    }
}

// ============================================================================
// Memory and submission
// ============================================================================

/// Host memory only; nothing is created in a kernel driver.
#[derive(Debug, Default)]
pub struct HostBackend;

impl MemoryBackend for HostBackend {
    fn create_os_handle(&self, _request: &BackendRequest<'_>) -> NeoResult<OsHandle> {
        Ok(OsHandle::None)
    }

    fn release(&self, _allocation: Arc<GraphicsAllocation>) {}
}

pub fn host_memory_manager() -> Arc<MemoryManager> {
    Arc::new(MemoryManager::new(vec![Box::new(HostBackend)]))
}

#[derive(Debug, Default)]
pub struct Recorded {
    pub resident: Vec<Vec<u64>>,
    pub evicted: Vec<Vec<u64>>,
    /// `(gpu start, task count)` of each kernel submission.
    pub execs: Vec<(u64, TaskCountType)>,
    pub waits: Vec<FlushStamp>,
}

/// Submission backend whose "GPU" retires a batch by writing its task count into
/// the tag, unless `hang` is set.
#[derive(Debug)]
pub struct RecordingBackend {
    pub os_context: Arc<OsContext>,
    pub tag: TagAddress,
    pub hang: bool,
    pub recorded: Arc<Mutex<Recorded>>,
}

impl SubmissionBackend for RecordingBackend {
    fn os_context(&self) -> &Arc<OsContext> {
        &self.os_context
    }

    fn process_residency(&mut self, allocations: &[Arc<GraphicsAllocation>]) -> NeoResult<()> {
        let ids = allocations.iter().map(|a| a.id()).collect();
        self.recorded.lock().unwrap().resident.push(ids);
        Ok(())
    }

    fn process_eviction(&mut self, evictions: &[Arc<GraphicsAllocation>]) -> NeoResult<()> {
        let ids = evictions.iter().map(|a| a.id()).collect();
        self.recorded.lock().unwrap().evicted.push(ids);
        Ok(())
    }

    fn exec(&mut self, batch: &BatchBuffer, _allocations: &[Arc<GraphicsAllocation>]) -> NeoResult<FlushStamp> {
        self.recorded
            .lock()
            .unwrap()
            .execs
            .push((batch.gpu_start(), batch.task_count));
        if !self.hang {
            self.tag.store(u64::from(batch.task_count));
        }
        Ok(FlushStamp::from(batch.task_count))
    }

    fn wait_for_flush_stamp(&self, stamp: FlushStamp) -> NeoResult<()> {
        self.recorded.lock().unwrap().waits.push(stamp);
        if self.hang { Err(NeoError::GpuHang) } else { Ok(()) }
    }

    fn create_direct_submission_os(
        &self,
        _memory_manager: &Arc<MemoryManager>,
    ) -> NeoResult<Box<dyn DirectSubmissionOs>> {
        Err(NeoError::Unsupported("recording backend".into()))
    }
}

/// A caller-side command stream and heap set, as a command queue would own them.
pub struct Workload {
    pub stream: LinearStream,
    pub dsh: IndirectHeap,
    pub ioh: IndirectHeap,
    pub ssh: IndirectHeap,
}

impl Workload {
    pub fn new(memory_manager: &MemoryManager) -> Self {
        let alloc = |ty| {
            memory_manager
                .allocate_graphics_memory_with_properties(&AllocationProperties::new(0, 4096, ty))
                .unwrap()
        };
        Self {
            stream: LinearStream::new(alloc(AllocationType::CommandBuffer)),
            dsh: IndirectHeap::new(IndirectHeapType::DynamicState, alloc(AllocationType::LinearStream)),
            ioh: IndirectHeap::new(IndirectHeapType::IndirectObject, alloc(AllocationType::LinearStream)),
            ssh: IndirectHeap::new(IndirectHeapType::SurfaceState, alloc(AllocationType::LinearStream)),
        }
    }

    /// Writes a small dummy kernel dispatch and flushes it.
    pub fn flush(&mut self, csr: &mut CommandStreamReceiver, flags: &DispatchFlags) -> NeoResult<CompletionStamp> {
        let start = self.stream.used();
        self.stream.write_dwords(&[0; 4]);
        let heaps = TaskHeaps {
            dynamic_state: &self.dsh,
            indirect_object: &self.ioh,
            surface_state: &self.ssh,
        };
        csr.flush_task(&mut self.stream, start, &heaps, 0, flags)
    }

    pub fn allocation_ids(&self) -> Vec<u64> {
        [
            self.stream.graphics_allocation(),
            self.dsh.graphics_allocation(),
            self.ioh.graphics_allocation(),
            self.ssh.graphics_allocation(),
        ]
        .iter()
        .map(|a| a.id())
        .collect()
    }
}
