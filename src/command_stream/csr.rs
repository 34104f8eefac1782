//! The command stream receiver: programs engine state, tracks residency and task
//! counts, and hands batches to the OS submission path.

#![allow(clippy::cast_possible_truncation)]

use crate::command_stream::aggregator::{CommandBuffer, SubmissionAggregator};
use crate::command_stream::dispatch_flags::{
    BatchBuffer, CompletionStamp, DispatchFlags, DispatchMode, EndLocation, FlushStamp,
};
use crate::command_stream::linear_stream::{IndirectHeap, LinearStream};
use crate::direct_submission::{DirectSubmission, DirectSubmissionOs};
use crate::error::{NeoError, NeoResult};
use crate::hw::{HardwareInfo, HardwareOps, HeapBases, PreemptionMode};
use crate::memory::manager::INTERNAL_HEAP_BASE;
use crate::memory::{
    AllocationProperties, AllocationType, AllocationUsage, GraphicsAllocation,
    InternalAllocationStorage, MemoryManager, PageTableManager, TaskCountType,
};
use crate::os_interface::OsContext;
use crate::os_interface::fence::TagAddress;
use crate::settings::DebugSettings;
use crate::utils::MEMORY_PAGE_SIZE;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Residency budget used when aggregating batched submissions.
pub const DEFAULT_RESIDENCY_BUDGET: usize = 1 << 31;

/// OS-specific half of the CSR.
pub trait SubmissionBackend: Send + fmt::Debug {
    fn os_context(&self) -> &Arc<OsContext>;

    /// Adds allocations the OS layer keeps resident on its own to `container`.
    fn merge_resident_allocations(&self, container: &mut Vec<Arc<GraphicsAllocation>>) {
        let _ = container;
    }

    /// # Errors
    /// The kernel could not make the set resident.
    fn process_residency(&mut self, allocations: &[Arc<GraphicsAllocation>]) -> NeoResult<()>;

    /// # Errors
    /// The kernel rejected an unbind or evict.
    fn process_eviction(&mut self, evictions: &[Arc<GraphicsAllocation>]) -> NeoResult<()>;

    /// Submits `batch`. `allocations` is the residency container already processed.
    ///
    /// # Errors
    /// Any submission failure is fatal for the batch.
    fn exec(&mut self, batch: &BatchBuffer, allocations: &[Arc<GraphicsAllocation>]) -> NeoResult<FlushStamp>;

    /// # Errors
    /// Device loss while waiting.
    fn wait_for_flush_stamp(&self, stamp: FlushStamp) -> NeoResult<()>;

    /// # Errors
    /// The OS half of direct submission cannot be created.
    fn create_direct_submission_os(
        &self,
        memory_manager: &Arc<MemoryManager>,
    ) -> NeoResult<Box<dyn DirectSubmissionOs>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    Ready,
    NotReady,
    GpuHang,
}

/// The heaps a task was built against.
#[derive(Debug, Clone, Copy)]
pub struct TaskHeaps<'a> {
    pub dynamic_state: &'a IndirectHeap,
    pub indirect_object: &'a IndirectHeap,
    pub surface_state: &'a IndirectHeap,
}

impl TaskHeaps<'_> {
    fn bases(&self) -> HeapBases {
        HeapBases {
            dynamic_state: self.dynamic_state.gpu_base(),
            indirect_object: self.indirect_object.gpu_base(),
            surface_state: self.surface_state.gpu_base(),
            instruction: INTERNAL_HEAP_BASE,
        }
    }

    fn allocations(&self) -> [&Arc<GraphicsAllocation>; 3] {
        [
            self.dynamic_state.graphics_allocation(),
            self.indirect_object.graphics_allocation(),
            self.surface_state.graphics_allocation(),
        ]
    }
}

/// What the CSR last programmed, so unchanged state is not re-emitted.
#[derive(Debug, Default)]
struct StreamState {
    preamble_sent: bool,
    preemption_mode: Option<PreemptionMode>,
    l3_config: Option<u32>,
    media_sampler_required: Option<bool>,
    heap_bases: Option<HeapBases>,
    aux_table_initialized: bool,
}

/// Construction parameters shared by both OS paths.
#[derive(Debug, Clone)]
pub struct CsrParams {
    pub os_context: Arc<OsContext>,
    pub memory_manager: Arc<MemoryManager>,
    pub hw_ops: Arc<dyn HardwareOps>,
    pub hw_info: HardwareInfo,
    pub dispatch_mode: DispatchMode,
    pub command_buffer_size: usize,
    pub spin_wait: Duration,
}

impl CsrParams {
    #[must_use]
    pub fn new(
        os_context: Arc<OsContext>,
        memory_manager: Arc<MemoryManager>,
        hw_ops: Arc<dyn HardwareOps>,
        hw_info: HardwareInfo,
        settings: &DebugSettings,
    ) -> Self {
        Self {
            os_context,
            memory_manager,
            hw_ops,
            hw_info,
            dispatch_mode: settings
                .csr_dispatch_mode
                .unwrap_or(DispatchMode::ImmediateDispatch),
            command_buffer_size: settings.command_buffer_size,
            spin_wait: Duration::from_micros(settings.spin_wait_micros),
        }
    }
}

pub struct CommandStreamReceiver {
    backend: Box<dyn SubmissionBackend>,
    os_context: Arc<OsContext>,
    memory_manager: Arc<MemoryManager>,
    hw_ops: Arc<dyn HardwareOps>,
    hw_info: HardwareInfo,
    dispatch_mode: DispatchMode,
    command_buffer_size: usize,
    spin_wait: Duration,

    tag_allocation: Arc<GraphicsAllocation>,
    tag: TagAddress,
    command_stream: LinearStream,
    internal_storage: InternalAllocationStorage,

    task_count: TaskCountType,
    task_level: u32,
    latest_flushed_task_count: TaskCountType,
    latest_flush_stamp: FlushStamp,
    stream_state: StreamState,

    residency: Vec<Arc<GraphicsAllocation>>,
    evictions: Vec<Arc<GraphicsAllocation>>,
    aggregator: SubmissionAggregator,
    direct_submission: Option<DirectSubmission>,
}

impl CommandStreamReceiver {
    /// Allocates the tag and the CSR's own command stream, registers the engine with
    /// the memory manager and builds the OS backend around the tag.
    ///
    /// # Errors
    /// Allocation or backend creation failures. Nothing stays registered on error.
    pub fn new<F>(params: CsrParams, make_backend: F) -> NeoResult<Self>
    where
        F: FnOnce(TagAddress, u64) -> NeoResult<Box<dyn SubmissionBackend>>,
    {
        let CsrParams {
            os_context,
            memory_manager,
            hw_ops,
            hw_info,
            dispatch_mode,
            command_buffer_size,
            spin_wait,
        } = params;
        let root = os_context.root_device_index();
        let context_id = os_context.context_id();

        let tag_allocation = memory_manager.allocate_graphics_memory_with_properties(
            &AllocationProperties::new(root, MEMORY_PAGE_SIZE, AllocationType::TagBuffer),
        )?;
        let tag = match TagAddress::from_allocation(&tag_allocation, 0) {
            Ok(tag) => tag,
            Err(e) => {
                memory_manager.free_graphics_memory(tag_allocation);
                return Err(e);
            }
        };
        tag.store(0);

        let command_buffer = match memory_manager.allocate_graphics_memory_with_properties(
            &AllocationProperties::new(root, command_buffer_size, AllocationType::CommandBuffer),
        ) {
            Ok(allocation) => allocation,
            Err(e) => {
                drop(tag);
                memory_manager.free_graphics_memory(tag_allocation);
                return Err(e);
            }
        };

        let backend = match make_backend(tag.clone(), tag_allocation.gpu_address()) {
            Ok(backend) => backend,
            Err(e) => {
                drop(tag);
                memory_manager.free_graphics_memory(command_buffer);
                memory_manager.free_graphics_memory(tag_allocation);
                return Err(e);
            }
        };

        memory_manager.register_engine(context_id, root, tag.clone());
        debug!(
            context_id,
            engine = ?os_context.engine_type(),
            ?dispatch_mode,
            tag_gpu_va = format_args!("{:#x}", tag_allocation.gpu_address()),
            "created command stream receiver"
        );

        Ok(Self {
            backend,
            internal_storage: InternalAllocationStorage::new(Arc::clone(&memory_manager), context_id),
            os_context,
            memory_manager,
            hw_ops,
            hw_info,
            dispatch_mode,
            command_buffer_size,
            spin_wait,
            tag_allocation,
            tag,
            command_stream: LinearStream::new(command_buffer),
            task_count: 0,
            task_level: 0,
            latest_flushed_task_count: 0,
            latest_flush_stamp: 0,
            stream_state: StreamState::default(),
            residency: Vec::new(),
            evictions: Vec::new(),
            aggregator: SubmissionAggregator::new(),
            direct_submission: None,
        })
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    #[must_use]
    pub const fn os_context(&self) -> &Arc<OsContext> {
        &self.os_context
    }

    #[must_use]
    pub fn context_id(&self) -> u32 {
        self.os_context.context_id()
    }

    #[must_use]
    pub const fn dispatch_mode(&self) -> DispatchMode {
        self.dispatch_mode
    }

    pub fn set_dispatch_mode(&mut self, mode: DispatchMode) {
        self.dispatch_mode = mode;
    }

    /// Task count of the last task handed to `flush_task`.
    #[must_use]
    pub const fn peek_task_count(&self) -> TaskCountType {
        self.task_count
    }

    #[must_use]
    pub const fn task_level(&self) -> u32 {
        self.task_level
    }

    #[must_use]
    pub const fn latest_flushed_task_count(&self) -> TaskCountType {
        self.latest_flushed_task_count
    }

    #[must_use]
    pub const fn latest_flush_stamp(&self) -> FlushStamp {
        self.latest_flush_stamp
    }

    /// The completion counter: the last task count the GPU finished.
    #[must_use]
    pub const fn tag_address(&self) -> &TagAddress {
        &self.tag
    }

    #[must_use]
    pub const fn tag_allocation(&self) -> &Arc<GraphicsAllocation> {
        &self.tag_allocation
    }

    #[must_use]
    pub const fn command_stream(&self) -> &LinearStream {
        &self.command_stream
    }

    #[must_use]
    pub const fn internal_storage(&self) -> &InternalAllocationStorage {
        &self.internal_storage
    }

    #[must_use]
    pub fn residency_allocations(&self) -> &[Arc<GraphicsAllocation>] {
        &self.residency
    }

    #[must_use]
    pub fn eviction_allocations(&self) -> &[Arc<GraphicsAllocation>] {
        &self.evictions
    }

    #[must_use]
    pub fn pending_batched_buffers(&self) -> usize {
        self.aggregator.len()
    }

    #[must_use]
    pub const fn direct_submission(&self) -> Option<&DirectSubmission> {
        self.direct_submission.as_ref()
    }

    #[must_use]
    pub fn backend(&self) -> &dyn SubmissionBackend {
        self.backend.as_ref()
    }

    // ========================================================================
    // Residency
    // ========================================================================

    /// Lists `allocation` for the next submission. Listing twice is a no-op.
    pub fn make_resident(&mut self, allocation: &Arc<GraphicsAllocation>) {
        crate::unrecoverable_if!(
            allocation.root_device_index() != self.os_context.root_device_index()
        );
        let context_id = self.context_id();
        let submission_task_count = self.task_count + 1;
        if !allocation.set_residency_listed(context_id, true) {
            self.residency.push(Arc::clone(allocation));
        }
        allocation.update_residency_task_count(submission_task_count, context_id);
        allocation.update_task_count(submission_task_count, context_id);
    }

    /// Drops `allocation` from the pending container and queues it for eviction.
    pub fn make_non_resident(&mut self, allocation: &Arc<GraphicsAllocation>) {
        let context_id = self.context_id();
        if allocation.set_residency_listed(context_id, false) {
            self.residency.retain(|a| a.id() != allocation.id());
        }
        if allocation.is_resident(context_id) {
            if !self.evictions.iter().any(|a| a.id() == allocation.id()) {
                self.evictions.push(Arc::clone(allocation));
            }
            allocation.release_residency(context_id);
        }
    }

    // ========================================================================
    // Submission
    // ========================================================================

    /// Terminates the caller's stream, programs any changed engine state into the
    /// CSR stream and submits (or queues, in batched mode) the combined batch.
    ///
    /// # Errors
    /// Stream space, residency or submission failures, and [`NeoError::GpuHang`] for
    /// a blocking task on a hung GPU.
    pub fn flush_task(
        &mut self,
        command_stream: &mut LinearStream,
        command_stream_start: usize,
        heaps: &TaskHeaps<'_>,
        task_level: u32,
        flags: &DispatchFlags,
    ) -> NeoResult<CompletionStamp> {
        let hw_ops = Arc::clone(&self.hw_ops);
        let task_count = self.task_count + 1;

        // Caller stream: tag write, then a batch end wide enough to become a chaining jump.
        let tail = hw_ops.pipe_control_size() + hw_ops.batch_buffer_start_size() + 8;
        if command_stream.available() < tail {
            return Err(NeoError::General("command stream has no room for the task tail".into()));
        }
        hw_ops.encode_pipe_control_with_post_sync(
            command_stream,
            self.tag_allocation.gpu_address(),
            u64::from(task_count),
            flags.dc_flush,
        );
        let end_location = self.encode_chainable_end(command_stream);

        // CSR stream: engine state, then a jump into the caller's stream.
        self.ensure_command_stream_space(self.max_csr_section_size())?;
        let csr_start = self.command_stream.used();
        let page_table = self.program_engine_state(heaps, flags);
        hw_ops.encode_batch_buffer_start(
            &mut self.command_stream,
            command_stream.gpu_base() + command_stream_start as u64,
        );
        self.command_stream.align_to(8);

        let tag_allocation = Arc::clone(&self.tag_allocation);
        let user_allocation = Arc::clone(command_stream.graphics_allocation());
        let csr_allocation = Arc::clone(self.command_stream.graphics_allocation());
        self.make_resident(&tag_allocation);
        self.make_resident(&user_allocation);
        for heap in heaps.allocations() {
            self.make_resident(heap);
        }
        if let Some(table) = page_table {
            self.make_resident(&table);
        }
        self.make_resident(&csr_allocation);

        let mut batch = BatchBuffer::new(csr_allocation, csr_start, self.command_stream.used());
        batch.end_location = Some(end_location);
        batch.task_count = task_count;
        batch.low_priority = flags.low_priority;
        batch.throttle = flags.throttle;
        batch.preemption_mode = flags.preemption_mode;
        batch.requires_coherency = flags.requires_coherency;

        self.task_count = task_count;
        self.task_level = self.task_level.max(task_level);

        match self.dispatch_mode {
            DispatchMode::ImmediateDispatch => {
                let mut container = std::mem::take(&mut self.residency);
                let result = self.flush(&batch, &mut container);
                self.residency = container;
                result?;
                self.latest_flushed_task_count = task_count;
            }
            DispatchMode::BatchedDispatch => {
                let context_id = self.context_id();
                let residency = std::mem::take(&mut self.residency);
                for allocation in &residency {
                    allocation.set_residency_listed(context_id, false);
                }
                trace!(task_count, residency = residency.len(), "queued batched command buffer");
                self.aggregator
                    .record_command_buffer(CommandBuffer { batch, residency });
            }
        }

        if flags.blocking {
            if self.dispatch_mode == DispatchMode::BatchedDispatch {
                self.flush_batched_submissions()?;
            }
            if self.wait_for_task_count(task_count)? == WaitStatus::GpuHang {
                return Err(NeoError::GpuHang);
            }
        }

        Ok(CompletionStamp {
            task_count,
            task_level: self.task_level,
            flush_stamp: self.latest_flush_stamp,
        })
    }

    fn encode_chainable_end(&self, stream: &mut LinearStream) -> EndLocation {
        let offset = stream.used();
        self.hw_ops.encode_batch_buffer_end(stream);
        let padding = self.hw_ops.batch_buffer_start_size() - self.hw_ops.batch_buffer_end_size();
        self.hw_ops.encode_noop(stream, padding);
        stream.align_to(8);
        EndLocation {
            allocation: Arc::clone(stream.graphics_allocation()),
            offset,
        }
    }

    fn max_csr_section_size(&self) -> usize {
        let ops = self.hw_ops.as_ref();
        ops.preamble_size()
            + ops.load_register_imm_size() * 2
            + ops.pipeline_select_size()
            + PageTableManager::table_base_size(ops)
            + ops.pipe_control_size()
            + ops.wa_size()
            + ops.state_base_address_size()
            + ops.batch_buffer_start_size()
            + 8
    }

    /// Moves to a fresh CSR stream when the current one cannot hold another section.
    /// The old buffer is parked for reuse until its last task retires.
    fn ensure_command_stream_space(&mut self, size: usize) -> NeoResult<()> {
        if self.command_stream.available() >= size {
            return Ok(());
        }
        let completed = self.tag.value() as TaskCountType;
        let wanted = size.max(self.command_buffer_size);
        let allocation = match self.internal_storage.obtain_reusable_allocation(
            wanted,
            AllocationType::CommandBuffer,
            completed,
        ) {
            Some(allocation) => allocation,
            None => self.memory_manager.allocate_graphics_memory_with_properties(
                &AllocationProperties::new(
                    self.os_context.root_device_index(),
                    wanted,
                    AllocationType::CommandBuffer,
                ),
            )?,
        };
        let old = Arc::clone(self.command_stream.graphics_allocation());
        self.command_stream.replace_buffer(allocation);
        self.internal_storage
            .store_allocation_with_task_count(old, AllocationUsage::Reusable, self.task_count);
        debug!(context_id = self.context_id(), "switched csr command buffer");
        Ok(())
    }

    /// Emits only the state that changed since the last task. Returns the aux table
    /// allocation when its registers were programmed.
    fn program_engine_state(
        &mut self,
        heaps: &TaskHeaps<'_>,
        flags: &DispatchFlags,
    ) -> Option<Arc<GraphicsAllocation>> {
        let hw_ops = Arc::clone(&self.hw_ops);
        let engine = self.os_context.engine_type();
        let stream = &mut self.command_stream;
        let state = &mut self.stream_state;

        if !state.preamble_sent {
            hw_ops.encode_preamble(stream, &self.hw_info, engine, flags.preemption_mode);
            state.preamble_sent = true;
            state.preemption_mode = Some(flags.preemption_mode);
            state.l3_config = Some(hw_ops.l3_config(&self.hw_info, false));
            if !engine.is_copy() {
                state.media_sampler_required = Some(false);
            }
        }
        if state.preemption_mode != Some(flags.preemption_mode) {
            hw_ops.encode_preemption(stream, flags.preemption_mode);
            state.preemption_mode = Some(flags.preemption_mode);
        }
        let l3_config = hw_ops.l3_config(&self.hw_info, flags.use_slm);
        if state.l3_config != Some(l3_config) {
            hw_ops.encode_load_register_imm(stream, hw_ops.l3_config_register(), l3_config);
            state.l3_config = Some(l3_config);
        }
        if !engine.is_copy() && state.media_sampler_required != Some(flags.media_sampler_required) {
            hw_ops.encode_pipeline_select(stream, flags.media_sampler_required);
            state.media_sampler_required = Some(flags.media_sampler_required);
        }

        let mut page_table = None;
        if let Some(ptm) = self
            .memory_manager
            .page_table_manager(self.os_context.root_device_index())
        {
            if !state.aux_table_initialized {
                ptm.encode_table_base(hw_ops.as_ref(), stream);
                state.aux_table_initialized = true;
            }
            page_table = Some(Arc::clone(ptm.table_allocation()));
        }

        let bases = heaps.bases();
        if state.heap_bases != Some(bases) {
            if hw_ops.requires_pipe_control_before_state_base_address() {
                hw_ops.encode_stalling_pipe_control(stream);
            }
            hw_ops.encode_state_base_address(stream, &bases);
            state.heap_bases = Some(bases);
        }
        page_table
    }

    /// Processes residency for `container`, submits `batch` and then applies queued
    /// evictions. Listed flags of the container are cleared whatever the outcome.
    ///
    /// # Errors
    /// Residency or submission failures; nothing is retried here.
    pub fn flush(
        &mut self,
        batch: &BatchBuffer,
        container: &mut Vec<Arc<GraphicsAllocation>>,
    ) -> NeoResult<FlushStamp> {
        let context_id = self.context_id();
        self.backend.merge_resident_allocations(container);

        let result = self.submit(batch, container);

        for allocation in container.iter() {
            allocation.set_residency_listed(context_id, false);
        }
        container.clear();

        let stamp = result?;
        self.latest_flush_stamp = stamp;
        Ok(stamp)
    }

    fn submit(
        &mut self,
        batch: &BatchBuffer,
        container: &[Arc<GraphicsAllocation>],
    ) -> NeoResult<FlushStamp> {
        let stamp = match self.direct_submission.as_mut() {
            Some(ds) => ds.dispatch_command_buffer(batch, container)?,
            None => {
                self.backend.process_residency(container)?;
                self.backend.exec(batch, container)?
            }
        };
        let evictions = std::mem::take(&mut self.evictions);
        if !evictions.is_empty() {
            trace!(count = evictions.len(), "processing evictions");
            self.backend.process_eviction(&evictions)?;
        }
        Ok(stamp)
    }

    /// Submits a prepared batch with the CSR's own residency container.
    ///
    /// # Errors
    /// See [`Self::flush`].
    pub fn submit_batch_buffer(&mut self, batch: &BatchBuffer) -> NeoResult<FlushStamp> {
        let mut container = std::mem::take(&mut self.residency);
        let result = self.flush(batch, &mut container);
        self.residency = container;
        result
    }

    /// Submits every queued command buffer, chaining compatible neighbours into one
    /// kernel submission.
    ///
    /// # Errors
    /// Stops at the first failed submission; later buffers stay queued.
    pub fn flush_batched_submissions(&mut self) -> NeoResult<()> {
        self.flush_batched_submissions_with_budget(DEFAULT_RESIDENCY_BUDGET)
    }

    /// # Errors
    /// See [`Self::flush_batched_submissions`].
    pub fn flush_batched_submissions_with_budget(&mut self, residency_budget: usize) -> NeoResult<()> {
        let context_id = self.context_id();
        while let Some(aggregated) = self.aggregator.aggregate(residency_budget) {
            let buffers = aggregated.buffers;
            for pair in buffers.windows(2) {
                if let Some(end) = &pair[0].batch.end_location {
                    let mut patch = LinearStream::at_offset(Arc::clone(&end.allocation), end.offset);
                    self.hw_ops
                        .encode_batch_buffer_start(&mut patch, pair[1].batch.gpu_start());
                }
            }
            let Some(first) = buffers.first() else { continue };
            let Some(last) = buffers.last() else { continue };
            let mut primary = first.batch.clone();
            primary.task_count = last.batch.task_count;
            primary.end_location.clone_from(&last.batch.end_location);

            let mut residency = aggregated.residency;
            for allocation in &residency {
                allocation.set_residency_listed(context_id, true);
            }
            debug!(
                chained = buffers.len(),
                residency = residency.len(),
                task_count = primary.task_count,
                "flushing batched submissions"
            );
            self.flush(&primary, &mut residency)?;
            self.latest_flushed_task_count = self.latest_flushed_task_count.max(primary.task_count);
        }
        Ok(())
    }

    // ========================================================================
    // Completion
    // ========================================================================

    /// # Errors
    /// Device loss while waiting.
    pub fn wait_for_flush_stamp(&self, stamp: FlushStamp) -> NeoResult<()> {
        match &self.direct_submission {
            Some(ds) => ds.wait_for_fence(stamp),
            None => self.backend.wait_for_flush_stamp(stamp),
        }
    }

    /// Spins on the tag, then falls back to the OS wait for the latest submission.
    ///
    /// # Errors
    /// OS wait failures other than a hang.
    pub fn wait_for_task_count(&mut self, task_count: TaskCountType) -> NeoResult<WaitStatus> {
        let target = u64::from(task_count);
        if self.tag.value() >= target {
            return Ok(WaitStatus::Ready);
        }
        if self.latest_flushed_task_count < task_count && !self.aggregator.is_empty() {
            self.flush_batched_submissions()?;
        }
        if self.tag.spin_until(target, self.spin_wait) {
            return Ok(WaitStatus::Ready);
        }
        match self.wait_for_flush_stamp(self.latest_flush_stamp) {
            Ok(()) => {}
            Err(NeoError::GpuHang) => {
                warn!(context_id = self.context_id(), task_count, "gpu hang while waiting");
                return Ok(WaitStatus::GpuHang);
            }
            Err(e) => return Err(e),
        }
        Ok(if self.tag.value() >= target {
            WaitStatus::Ready
        } else {
            WaitStatus::NotReady
        })
    }

    /// Waits, then releases stored allocations the GPU is done with.
    ///
    /// # Errors
    /// See [`Self::wait_for_task_count`].
    pub fn wait_for_task_count_and_clean_allocation_list(
        &mut self,
        task_count: TaskCountType,
        usage: AllocationUsage,
    ) -> NeoResult<WaitStatus> {
        let status = self.wait_for_task_count(task_count)?;
        self.internal_storage
            .clean_allocation_list(self.tag.value() as TaskCountType, usage);
        Ok(status)
    }

    // ========================================================================
    // Optional features
    // ========================================================================

    /// Creates (or returns) the root device's page table manager. The next task
    /// programs its base registers.
    ///
    /// # Errors
    /// The aux table allocation failed.
    pub fn create_page_table_manager(&mut self) -> NeoResult<Arc<PageTableManager>> {
        let ptm = self
            .memory_manager
            .create_page_table_manager(self.os_context.root_device_index())?;
        self.stream_state.aux_table_initialized = false;
        Ok(ptm)
    }

    /// Switches the engine to ring submission when supported. Returns whether it did.
    ///
    /// # Errors
    /// Ring creation failures.
    pub fn init_direct_submission(&mut self, settings: &DebugSettings) -> NeoResult<bool> {
        if self.direct_submission.is_some() {
            return Ok(true);
        }
        if !self
            .os_context
            .is_direct_submission_supported(self.hw_ops.as_ref(), settings)
        {
            return Ok(false);
        }
        let os = self.backend.create_direct_submission_os(&self.memory_manager)?;
        let mut ds = DirectSubmission::new(
            os,
            Arc::clone(&self.hw_ops),
            self.hw_info,
            Arc::clone(&self.memory_manager),
            self.os_context.root_device_index(),
            self.os_context.engine_type(),
            self.os_context.preemption_mode(),
            settings.direct_submission_ring_size,
        );
        ds.initialize(true)?;
        self.direct_submission = Some(ds);
        self.os_context.set_direct_submission_active(true);
        debug!(context_id = self.context_id(), "direct submission active");
        Ok(true)
    }
}

impl fmt::Debug for CommandStreamReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandStreamReceiver")
            .field("context_id", &self.context_id())
            .field("dispatch_mode", &self.dispatch_mode)
            .field("task_count", &self.task_count)
            .field("latest_flushed_task_count", &self.latest_flushed_task_count)
            .field("tag", &self.tag.value())
            .field("direct_submission", &self.direct_submission.is_some())
            .finish_non_exhaustive()
    }
}

impl Drop for CommandStreamReceiver {
    fn drop(&mut self) {
        if !self.aggregator.is_empty()
            && let Err(e) = self.flush_batched_submissions()
        {
            warn!(error = %e, "failed to flush batched submissions on teardown");
        }
        if self.latest_flushed_task_count > 0 {
            match self.wait_for_task_count(self.latest_flushed_task_count) {
                Ok(WaitStatus::Ready) => {}
                Ok(status) => warn!(?status, "engine not idle on teardown"),
                Err(e) => warn!(error = %e, "wait on teardown failed"),
            }
        }
        if self.direct_submission.take().is_some() {
            self.os_context.set_direct_submission_active(false);
        }
        let context_id = self.context_id();
        for allocation in self.residency.drain(..) {
            allocation.set_residency_listed(context_id, false);
        }
        self.evictions.clear();
        self.memory_manager.unregister_engine(context_id);
        self.memory_manager
            .free_graphics_memory(Arc::clone(self.command_stream.graphics_allocation()));
        self.memory_manager
            .free_graphics_memory(Arc::clone(&self.tag_allocation));
    }
}
