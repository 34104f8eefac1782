//! Ring-buffer submission.
//!
//! The GPU executes a persistent ring that parks on a semaphore wait after every
//! dispatched section. Dispatching writes the next section, then releases the previous
//! wait by bumping the semaphore from the CPU, so only the first dispatch after a
//! start needs a kernel call.

#![allow(clippy::cast_possible_truncation)]

use crate::command_stream::dispatch_flags::{BatchBuffer, FlushStamp};
use crate::command_stream::linear_stream::LinearStream;
use crate::error::{NeoError, NeoResult};
use crate::hw::{EngineType, HardwareInfo, HardwareOps, PreemptionMode};
use crate::memory::{AllocationProperties, AllocationType, GraphicsAllocation, MemoryManager};
use crate::os_interface::fence::{MonitoredFence, TagAddress};
use crate::utils::MEMORY_PAGE_SIZE;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Upper bound on rings; once reached, a busy next ring is waited on instead.
pub const MAX_RING_BUFFERS: usize = 4;

/// The OS half of direct submission: one kernel submission to start a ring, a
/// completion fence the ring signals, and residency for the allocations it reaches.
pub trait DirectSubmissionOs: Send + fmt::Debug {
    fn completion_fence(&self) -> &MonitoredFence;

    /// # Errors
    /// Residency failures are fatal for the dispatch.
    fn handle_residency(&mut self, allocations: &[Arc<GraphicsAllocation>]) -> NeoResult<()>;

    /// Starts the GPU on `ring` at `offset`.
    ///
    /// # Errors
    /// The kernel rejected the submission.
    fn submit(&mut self, ring: &Arc<GraphicsAllocation>, offset: usize, size: usize) -> NeoResult<()>;

    /// # Errors
    /// Device loss while waiting.
    fn wait_for_fence(&self, value: u64) -> NeoResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingState {
    Uninitialized,
    /// Allocated but not executing; the next dispatch starts the ring.
    Idle,
    Running,
}

#[derive(Debug)]
struct RingBuffer {
    stream: LinearStream,
    /// Fence value of the last section written into this ring.
    completion_fence_value: u64,
}

impl RingBuffer {
    fn allocation(&self) -> &Arc<GraphicsAllocation> {
        self.stream.graphics_allocation()
    }
}

pub struct DirectSubmission {
    os: Box<dyn DirectSubmissionOs>,
    hw_ops: Arc<dyn HardwareOps>,
    hw_info: HardwareInfo,
    memory_manager: Arc<MemoryManager>,
    root_device_index: u32,
    engine: EngineType,
    preemption_mode: PreemptionMode,
    ring_size: usize,

    state: RingState,
    rings: Vec<RingBuffer>,
    current_ring: usize,
    /// Ring offset the next kernel submission starts from.
    restart_offset: usize,
    semaphore: Option<Arc<GraphicsAllocation>>,
    semaphore_value: Option<TagAddress>,
    queue_work_count: u32,
}

impl DirectSubmission {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        os: Box<dyn DirectSubmissionOs>,
        hw_ops: Arc<dyn HardwareOps>,
        hw_info: HardwareInfo,
        memory_manager: Arc<MemoryManager>,
        root_device_index: u32,
        engine: EngineType,
        preemption_mode: PreemptionMode,
        ring_size: usize,
    ) -> Self {
        Self {
            os,
            hw_ops,
            hw_info,
            memory_manager,
            root_device_index,
            engine,
            preemption_mode,
            ring_size: ring_size.max(MEMORY_PAGE_SIZE),
            state: RingState::Uninitialized,
            rings: Vec::new(),
            current_ring: 0,
            restart_offset: 0,
            semaphore: None,
            semaphore_value: None,
            queue_work_count: 0,
        }
    }

    #[must_use]
    pub const fn state(&self) -> RingState {
        self.state
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state == RingState::Running
    }

    #[must_use]
    pub fn ring_count(&self) -> usize {
        self.rings.len()
    }

    #[must_use]
    pub const fn current_ring_index(&self) -> usize {
        self.current_ring
    }

    #[must_use]
    pub const fn queue_work_count(&self) -> u32 {
        self.queue_work_count
    }

    /// Current semaphore value as the GPU sees it.
    #[must_use]
    pub fn semaphore_value(&self) -> u32 {
        self.semaphore_value.as_ref().map_or(0, |s| s.value() as u32)
    }

    #[must_use]
    pub fn completion_fence(&self) -> &MonitoredFence {
        self.os.completion_fence()
    }

    fn allocate_ring(&self) -> NeoResult<Arc<GraphicsAllocation>> {
        self.memory_manager
            .allocate_graphics_memory_with_properties(&AllocationProperties::new(
                self.root_device_index,
                self.ring_size,
                AllocationType::RingBuffer,
            ))
    }

    fn ring(&mut self) -> &mut RingBuffer {
        &mut self.rings[self.current_ring]
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Allocates the first ring and the semaphore, writes the preamble and, with
    /// `submit_on_init`, starts the ring parked on its first semaphore wait.
    ///
    /// # Errors
    /// Allocation, residency or submission failures. Partially created state is
    /// released on drop.
    pub fn initialize(&mut self, submit_on_init: bool) -> NeoResult<()> {
        if self.state != RingState::Uninitialized {
            return Ok(());
        }
        let ring = self.allocate_ring()?;
        self.rings.push(RingBuffer {
            stream: LinearStream::new(Arc::clone(&ring)),
            completion_fence_value: 0,
        });
        self.current_ring = 0;

        let semaphore = self.memory_manager.allocate_graphics_memory_with_properties(
            &AllocationProperties::new(
                self.root_device_index,
                MEMORY_PAGE_SIZE,
                AllocationType::SemaphoreBuffer,
            ),
        )?;
        let value = TagAddress::from_allocation(&semaphore, 0)?;
        value.store(0);
        self.semaphore_value = Some(value);
        self.semaphore = Some(Arc::clone(&semaphore));

        self.os.handle_residency(&[ring, semaphore])?;

        let (hw_info, engine, preemption) = (self.hw_info, self.engine, self.preemption_mode);
        let hw_ops = Arc::clone(&self.hw_ops);
        hw_ops.encode_preamble(&mut self.ring().stream, &hw_info, engine, preemption);
        self.restart_offset = 0;
        self.state = RingState::Idle;

        if submit_on_init {
            let semaphore_gpu = self.semaphore_gpu_address();
            let wait_value = self.queue_work_count + 1;
            hw_ops.encode_semaphore_wait(&mut self.ring().stream, semaphore_gpu, wait_value);
            self.start_ring()?;
        }
        debug!(
            engine = ?self.engine,
            ring_size = self.ring_size,
            running = self.is_running(),
            "initialized direct submission"
        );
        Ok(())
    }

    fn semaphore_gpu_address(&self) -> u64 {
        self.semaphore.as_ref().map_or(0, |s| s.gpu_address())
    }

    fn start_ring(&mut self) -> NeoResult<()> {
        let offset = self.restart_offset;
        let ring = &self.rings[self.current_ring];
        let size = ring.stream.used() - offset;
        let allocation = Arc::clone(ring.allocation());
        self.os.submit(&allocation, offset, size)?;
        self.state = RingState::Running;
        trace!(ring = self.current_ring, offset, size, "started ring");
        Ok(())
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    fn section_size(&self) -> usize {
        let ops = self.hw_ops.as_ref();
        ops.batch_buffer_start_size() + ops.pipe_control_size() + ops.semaphore_wait_size()
    }

    /// Space kept free at the tail for either a jump to the next ring or the stop sequence.
    fn tail_reserve(&self) -> usize {
        let ops = self.hw_ops.as_ref();
        ops.batch_buffer_start_size()
            .max(ops.pipe_control_size() + ops.batch_buffer_end_size())
    }

    /// Appends `batch` to the ring and lets the GPU run it. Returns the completion
    /// fence value the section signals.
    ///
    /// The batch must reserve an end location; it is patched to jump back into the ring.
    ///
    /// # Errors
    /// Fails when not initialized, on a batch without an end location, or when the OS
    /// half fails residency or submission.
    pub fn dispatch_command_buffer(
        &mut self,
        batch: &BatchBuffer,
        allocations: &[Arc<GraphicsAllocation>],
    ) -> NeoResult<FlushStamp> {
        if self.state == RingState::Uninitialized {
            return Err(NeoError::General("direct submission not initialized".into()));
        }
        let end_location = batch.end_location.as_ref().ok_or_else(|| {
            NeoError::SubmissionFailed("batch has no room to return into the ring".into())
        })?;

        self.os.handle_residency(allocations)?;

        if self.ring().stream.available() < self.section_size() + self.tail_reserve() {
            self.switch_ring_buffers()?;
        }

        let hw_ops = Arc::clone(&self.hw_ops);
        let semaphore_gpu = self.semaphore_gpu_address();
        let work = self.queue_work_count + 1;
        let section_start = self.ring().stream.used();

        hw_ops.encode_batch_buffer_start(&mut self.ring().stream, batch.gpu_start());
        let return_address = self.ring().stream.current_gpu_address();
        let mut patch = LinearStream::at_offset(Arc::clone(&end_location.allocation), end_location.offset);
        hw_ops.encode_batch_buffer_start(&mut patch, return_address);

        let fence_value = {
            let fence = self.os.completion_fence();
            let fence_gpu = fence.gpu_address();
            let mut fence_state = fence.state();
            let value = MonitoredFence::advance(&mut fence_state);
            drop(fence_state);
            let ring = &mut self.rings[self.current_ring];
            hw_ops.encode_pipe_control_with_post_sync(&mut ring.stream, fence_gpu, value, true);
            ring.completion_fence_value = value;
            value
        };
        hw_ops.encode_semaphore_wait(&mut self.ring().stream, semaphore_gpu, work + 1);

        if !self.is_running() {
            debug_assert!(self.restart_offset <= section_start);
            self.start_ring()?;
        }
        self.release_semaphore(work);
        self.restart_offset = self.ring().stream.used();
        self.queue_work_count = work;
        trace!(
            work,
            fence = fence_value,
            batch_gpu_va = format_args!("{:#x}", batch.gpu_start()),
            "dispatched to ring"
        );
        Ok(fence_value)
    }

    fn release_semaphore(&self, value: u32) {
        if let Some(semaphore) = &self.semaphore_value {
            semaphore.store(u64::from(value));
        }
    }

    /// Moves to the next ring, allocating one while below [`MAX_RING_BUFFERS`] if the
    /// next ring is still executing, otherwise waiting for it.
    fn switch_ring_buffers(&mut self) -> NeoResult<()> {
        let completed = self.os.completion_fence().cpu_value();
        let next = (self.current_ring + 1) % self.rings.len().max(1);
        let next_busy = self.rings.len() == 1 || self.rings[next].completion_fence_value > completed;

        let next = if next_busy && self.rings.len() < MAX_RING_BUFFERS {
            let allocation = self.allocate_ring()?;
            self.os.handle_residency(std::slice::from_ref(&allocation))?;
            let index = self.current_ring + 1;
            self.rings.insert(
                index,
                RingBuffer {
                    stream: LinearStream::new(allocation),
                    completion_fence_value: 0,
                },
            );
            debug!(rings = self.rings.len(), "allocated additional ring buffer");
            index
        } else {
            if next_busy {
                let wait_value = self.rings[next].completion_fence_value;
                debug!(ring = next, wait_value, "waiting for ring buffer to retire");
                self.os.wait_for_fence(wait_value)?;
            }
            self.rings[next].stream.set_used(0);
            next
        };

        let next_gpu = self.rings[next].allocation().gpu_address();
        if self.is_running() {
            let hw_ops = Arc::clone(&self.hw_ops);
            hw_ops.encode_batch_buffer_start(&mut self.ring().stream, next_gpu);
        }
        trace!(from = self.current_ring, to = next, "switched ring buffer");
        self.current_ring = next;
        self.restart_offset = 0;
        Ok(())
    }

    /// Ends the ring and waits until the GPU has left it. The next dispatch restarts it.
    ///
    /// # Errors
    /// Propagates the fence wait failure.
    pub fn stop_ring_buffer(&mut self) -> NeoResult<()> {
        if !self.is_running() {
            return Ok(());
        }
        let hw_ops = Arc::clone(&self.hw_ops);
        let fence_value = {
            let fence = self.os.completion_fence();
            let fence_gpu = fence.gpu_address();
            let value = MonitoredFence::advance(&mut fence.state());
            let ring = &mut self.rings[self.current_ring];
            hw_ops.encode_pipe_control_with_post_sync(&mut ring.stream, fence_gpu, value, true);
            hw_ops.encode_batch_buffer_end(&mut ring.stream);
            ring.completion_fence_value = value;
            value
        };
        let work = self.queue_work_count + 1;
        self.release_semaphore(work);
        self.queue_work_count = work;
        self.state = RingState::Idle;
        self.restart_offset = self.ring().stream.used();
        debug!(fence = fence_value, "stopping ring buffer");
        self.os.wait_for_fence(fence_value)
    }

    /// # Errors
    /// Device loss while waiting.
    pub fn wait_for_fence(&self, value: u64) -> NeoResult<()> {
        self.os.wait_for_fence(value)
    }
}

impl fmt::Debug for DirectSubmission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectSubmission")
            .field("engine", &self.engine)
            .field("state", &self.state)
            .field("rings", &self.rings.len())
            .field("current_ring", &self.current_ring)
            .field("queue_work_count", &self.queue_work_count)
            .finish_non_exhaustive()
    }
}

impl Drop for DirectSubmission {
    fn drop(&mut self) {
        if let Err(e) = self.stop_ring_buffer() {
            warn!(error = %e, "failed to stop ring buffer");
        }
        self.semaphore_value = None;
        for ring in self.rings.drain(..) {
            let allocation = Arc::clone(ring.allocation());
            drop(ring);
            self.memory_manager.free_graphics_memory(allocation);
        }
        if let Some(semaphore) = self.semaphore.take() {
            self.memory_manager.free_graphics_memory(semaphore);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::encoder::{MI_BATCH_BUFFER_END, MI_BATCH_BUFFER_START, MI_SEMAPHORE_WAIT};
    use crate::hw::{GenericHwOps, GfxCoreFamily};
    use crate::command_stream::dispatch_flags::EndLocation;
    use crate::memory::manager::test_support::host_only_manager;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct Calls {
        submits: Vec<(u64, usize, usize)>,
        waits: Vec<u64>,
        resident: usize,
    }

    #[derive(Debug)]
    struct FakeOs {
        fence: MonitoredFence,
        _fence_allocation: Arc<GraphicsAllocation>,
        calls: Arc<Mutex<Calls>>,
    }

    impl FakeOs {
        fn new(calls: Arc<Mutex<Calls>>) -> Self {
            let allocation = Arc::new(
                GraphicsAllocation::new_host_backed(AllocationType::TagBuffer, 4096, 0xf000)
                    .unwrap(),
            );
            let tag = TagAddress::from_allocation(&allocation, 0).unwrap();
            Self {
                fence: MonitoredFence::new(7, tag, allocation.gpu_address()),
                _fence_allocation: allocation,
                calls,
            }
        }
    }

    impl DirectSubmissionOs for FakeOs {
        fn completion_fence(&self) -> &MonitoredFence {
            &self.fence
        }

        fn handle_residency(&mut self, allocations: &[Arc<GraphicsAllocation>]) -> NeoResult<()> {
            self.calls.lock().unwrap().resident += allocations.len();
            Ok(())
        }

        fn submit(&mut self, ring: &Arc<GraphicsAllocation>, offset: usize, size: usize) -> NeoResult<()> {
            self.calls
                .lock()
                .unwrap()
                .submits
                .push((ring.gpu_address(), offset, size));
            Ok(())
        }

        fn wait_for_fence(&self, value: u64) -> NeoResult<()> {
            self.calls.lock().unwrap().waits.push(value);
            // The GPU retires everything instantly.
            self.fence.cpu_address().store(value);
            Ok(())
        }
    }

    fn direct_submission(ring_size: usize) -> (DirectSubmission, Arc<Mutex<Calls>>) {
        let calls = Arc::new(Mutex::new(Calls::default()));
        let ds = DirectSubmission::new(
            Box::new(FakeOs::new(Arc::clone(&calls))),
            Arc::new(GenericHwOps::for_family(GfxCoreFamily::Gen12Lp)),
            HardwareInfo::gen12lp(),
            host_only_manager(),
            0,
            EngineType::Rcs,
            PreemptionMode::MidThread,
            ring_size,
        );
        (ds, calls)
    }

    fn user_batch() -> BatchBuffer {
        let allocation = Arc::new(
            GraphicsAllocation::new_host_backed(AllocationType::CommandBuffer, 4096, 0x20_0000)
                .unwrap(),
        );
        let mut stream = LinearStream::new(Arc::clone(&allocation));
        stream.write_dwords(&[0; 8]);
        let end = stream.used();
        stream.write_dwords(&[MI_BATCH_BUFFER_END, 0, 0]);
        let mut batch = BatchBuffer::new(allocation, 0, stream.used());
        batch.end_location = Some(EndLocation {
            allocation: Arc::clone(&batch.command_buffer),
            offset: end,
        });
        batch
    }

    fn dword_at(allocation: &GraphicsAllocation, offset: usize) -> u32 {
        let ptr = allocation.cpu_ptr().unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr().add(offset), 4) };
        u32::from_le_bytes(bytes.try_into().unwrap())
    }

    #[test]
    fn submit_on_init_parks_ring_on_semaphore() {
        let (mut ds, calls) = direct_submission(64 * 1024);
        ds.initialize(true).unwrap();
        assert!(ds.is_running());
        let calls = calls.lock().unwrap();
        assert_eq!(calls.submits.len(), 1);
        assert_eq!(calls.submits[0].1, 0);
        drop(calls);
        let ring = ds.rings[0].allocation();
        let used = ds.rings[0].stream.used();
        assert_eq!(dword_at(ring, used - 16), MI_SEMAPHORE_WAIT);
        assert_eq!(dword_at(ring, used - 12), 1);
    }

    #[test]
    fn dispatch_on_running_ring_only_bumps_semaphore() {
        let (mut ds, calls) = direct_submission(64 * 1024);
        ds.initialize(true).unwrap();
        let batch = user_batch();
        let first = ds.dispatch_command_buffer(&batch, &[]).unwrap();
        let second = ds.dispatch_command_buffer(&batch, &[]).unwrap();
        assert_eq!((first, second), (1, 2));
        assert_eq!(calls.lock().unwrap().submits.len(), 1);
        assert_eq!(ds.queue_work_count(), 2);
        assert_eq!(ds.semaphore_value(), 2);
        // batch end now jumps back into the ring
        let end = batch.end_location.as_ref().unwrap();
        assert_eq!(dword_at(&end.allocation, end.offset), MI_BATCH_BUFFER_START);
    }

    #[test]
    fn first_dispatch_without_submit_on_init_starts_ring() {
        let (mut ds, calls) = direct_submission(64 * 1024);
        ds.initialize(false).unwrap();
        assert_eq!(ds.state(), RingState::Idle);
        ds.dispatch_command_buffer(&user_batch(), &[]).unwrap();
        assert!(ds.is_running());
        let calls = calls.lock().unwrap();
        assert_eq!(calls.submits.len(), 1);
        assert_eq!(calls.submits[0].1, 0, "preamble is part of the first submission");
    }

    #[test]
    fn stop_then_dispatch_restarts_with_one_submission() {
        let (mut ds, calls) = direct_submission(64 * 1024);
        ds.initialize(true).unwrap();
        ds.dispatch_command_buffer(&user_batch(), &[]).unwrap();
        ds.stop_ring_buffer().unwrap();
        assert!(!ds.is_running());
        assert_eq!(calls.lock().unwrap().waits, vec![2]);

        let restart_offset = ds.restart_offset;
        ds.dispatch_command_buffer(&user_batch(), &[]).unwrap();
        let calls = calls.lock().unwrap();
        assert_eq!(calls.submits.len(), 2);
        assert_eq!(calls.submits[1].1, restart_offset);
    }

    #[test]
    fn full_ring_switches_and_allocates_up_to_limit() {
        let (mut ds, _calls) = direct_submission(MEMORY_PAGE_SIZE);
        ds.initialize(true).unwrap();
        let batch = user_batch();
        let per_ring = MEMORY_PAGE_SIZE / ds.section_size();
        for _ in 0..per_ring * 6 {
            ds.dispatch_command_buffer(&batch, &[]).unwrap();
        }
        assert!(ds.ring_count() >= 2);
        assert!(ds.ring_count() <= MAX_RING_BUFFERS);
    }

    #[test]
    fn dispatch_before_initialize_fails() {
        let (mut ds, _calls) = direct_submission(64 * 1024);
        assert!(ds.dispatch_command_buffer(&user_batch(), &[]).is_err());
    }
}
