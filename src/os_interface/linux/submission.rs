#![allow(clippy::cast_possible_truncation)]

use crate::command_stream::csr::SubmissionBackend;
use crate::command_stream::dispatch_flags::{BatchBuffer, FlushStamp};
use crate::direct_submission::DirectSubmissionOs;
use crate::drm::ioctl::{ExecObject, Execbuffer2Args, I915_EXEC_NO_RELOC};
use crate::error::{NeoError, NeoResult};
use crate::memory::{GraphicsAllocation, MemoryManager};
use crate::os_interface::fence::{MonitoredFence, TagAddress};
use crate::os_interface::linux::direct_submission::DrmDirectSubmission;
use crate::os_interface::linux::drm::Drm;
use crate::os_interface::linux::memory_operations::{DrmMemoryOperations, ResidencyMode};
use crate::os_interface::OsContext;
use crate::utils::align_up_usize;
use std::sync::Arc;
use tracing::{debug, trace};

/// Wait without timeout.
pub const GEM_WAIT_INFINITE: i64 = -1;

/// Submission through `DRM_IOCTL_I915_GEM_EXECBUFFER2` with soft-pinned objects.
///
/// Completion is tracked through the CSR tag: the flush stamp of a batch is the task
/// count it writes, and the fence handle is the last batch buffer's GEM handle.
#[derive(Debug)]
pub struct DrmSubmission {
    drm: Arc<Drm>,
    os_context: Arc<OsContext>,
    memory_operations: Arc<DrmMemoryOperations>,
    fence: MonitoredFence,
    residency: Vec<Arc<GraphicsAllocation>>,
    exec_objects: Vec<ExecObject>,
}

impl DrmSubmission {
    /// # Errors
    /// Fails if `os_context` is not a Linux context.
    pub fn new(
        os_context: Arc<OsContext>,
        memory_operations: Arc<DrmMemoryOperations>,
        tag: TagAddress,
        tag_gpu_address: u64,
    ) -> NeoResult<Self> {
        let drm = os_context
            .linux()
            .map(|ctx| Arc::clone(ctx.drm()))
            .ok_or_else(|| NeoError::General("drm submission on a non-drm context".into()))?;
        Ok(Self {
            drm,
            os_context,
            memory_operations,
            fence: MonitoredFence::new(0, tag, tag_gpu_address),
            residency: Vec::new(),
            exec_objects: Vec::new(),
        })
    }

    #[must_use]
    pub const fn fence(&self) -> &MonitoredFence {
        &self.fence
    }

    fn uses_vm_bind(&self) -> bool {
        self.memory_operations.mode() == ResidencyMode::VmBind
    }
}

impl SubmissionBackend for DrmSubmission {
    fn os_context(&self) -> &Arc<OsContext> {
        &self.os_context
    }

    fn merge_resident_allocations(&self, container: &mut Vec<Arc<GraphicsAllocation>>) {
        self.memory_operations
            .merge_with_residency_container(container, self.os_context.context_id());
    }

    fn process_residency(&mut self, allocations: &[Arc<GraphicsAllocation>]) -> NeoResult<()> {
        if self.uses_vm_bind() {
            return self
                .memory_operations
                .make_resident_within_os_context(&self.os_context, allocations);
        }
        for allocation in allocations {
            if allocation.buffer_object().is_some()
                && !self.residency.iter().any(|a| a.id() == allocation.id())
            {
                self.residency.push(Arc::clone(allocation));
            }
        }
        Ok(())
    }

    fn process_eviction(&mut self, evictions: &[Arc<GraphicsAllocation>]) -> NeoResult<()> {
        if self.uses_vm_bind() {
            for allocation in evictions {
                self.memory_operations
                    .evict_within_os_context(&self.os_context, allocation)?;
            }
        }
        Ok(())
    }

    fn exec(&mut self, batch: &BatchBuffer, _allocations: &[Arc<GraphicsAllocation>]) -> NeoResult<FlushStamp> {
        // Consumed by this exec whatever the outcome.
        let residency = std::mem::take(&mut self.residency);
        let batch_bo = batch.command_buffer.buffer_object().ok_or_else(|| {
            NeoError::SubmissionFailed("batch buffer has no buffer object".into())
        })?;
        let linux = self
            .os_context
            .linux()
            .ok_or_else(|| NeoError::General("drm submission on a non-drm context".into()))?;

        self.exec_objects.clear();
        if !self.uses_vm_bind() {
            for allocation in &residency {
                if allocation.id() == batch.command_buffer.id() {
                    continue;
                }
                if let Some(bo) = allocation.buffer_object() {
                    self.exec_objects.push(bo.exec_object(true));
                }
            }
        }
        self.exec_objects.push(batch_bo.exec_object(false));

        let mut args = Execbuffer2Args {
            batch_start_offset: batch.start_offset as u32,
            batch_len: align_up_usize(batch.length(), 8) as u32,
            flags: linux.engine_flag() | I915_EXEC_NO_RELOC,
            ..Default::default()
        };

        for &ctx_id in linux.drm_context_ids() {
            args.rsvd1 = u64::from(ctx_id);
            self.drm.exec(&mut args, &mut self.exec_objects)?;
        }

        let stamp = FlushStamp::from(batch.task_count);
        {
            let mut state = self.fence.state();
            state.fence_handle = u64::from(batch_bo.handle());
            state.last_submitted_fence = stamp;
            state.current_fence_value = stamp + 1;
        }
        trace!(
            objects = self.exec_objects.len(),
            contexts = linux.drm_context_ids().len(),
            task_count = batch.task_count,
            "submitted execbuffer"
        );
        Ok(stamp)
    }

    fn wait_for_flush_stamp(&self, stamp: FlushStamp) -> NeoResult<()> {
        self.fence.wait_from_cpu(stamp, |handle, _| {
            self.drm.wait_bo(handle as u32, GEM_WAIT_INFINITE)
        })
    }

    fn create_direct_submission_os(
        &self,
        memory_manager: &Arc<MemoryManager>,
    ) -> NeoResult<Box<dyn DirectSubmissionOs>> {
        debug!(context_id = self.os_context.context_id(), "creating drm direct submission");
        Ok(Box::new(DrmDirectSubmission::new(
            Arc::clone(&self.os_context),
            Arc::clone(&self.memory_operations),
            Arc::clone(memory_manager),
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drm::ioctl::I915_EXEC_RENDER;
    use crate::memory::AllocationType;
    use crate::os_interface::linux::test_support::DrmFixture;

    fn submission(f: &DrmFixture) -> (DrmSubmission, Arc<GraphicsAllocation>) {
        let tag = f.allocate(AllocationType::TagBuffer);
        let address = TagAddress::from_allocation(&tag, 0).unwrap();
        address.store(0);
        let submission = DrmSubmission::new(
            Arc::clone(&f.os_context),
            Arc::clone(&f.memory_operations),
            address,
            tag.gpu_address(),
        )
        .unwrap();
        (submission, tag)
    }

    fn batch(f: &DrmFixture, task_count: u32) -> BatchBuffer {
        let mut batch = BatchBuffer::new(f.allocate(AllocationType::CommandBuffer), 0, 60);
        batch.task_count = task_count;
        batch
    }

    #[test]
    fn exec_lists_residency_with_batch_last() {
        let f = DrmFixture::new(ResidencyMode::ExecObjects);
        let (mut submission, tag) = submission(&f);
        let batch = batch(&f, 3);
        let buffer = f.allocate(AllocationType::Buffer);
        let residency = vec![
            Arc::clone(&tag),
            Arc::clone(&buffer),
            Arc::clone(&batch.command_buffer),
            Arc::clone(&buffer),
        ];

        submission.process_residency(&residency).unwrap();
        let stamp = submission.exec(&batch, &residency).unwrap();
        assert_eq!(stamp, 3);

        let calls = f.device.calls();
        assert_eq!(calls.execs.len(), 1);
        let exec = &calls.execs[0];
        let handles: Vec<u32> = exec.objects.iter().map(|o| o.handle).collect();
        let batch_handle = batch.command_buffer.buffer_object().unwrap().handle();
        assert_eq!(
            handles,
            vec![
                tag.buffer_object().unwrap().handle(),
                buffer.buffer_object().unwrap().handle(),
                batch_handle,
            ]
        );
        assert_eq!(exec.batch_len, 64);
        assert_eq!(exec.flags, I915_EXEC_RENDER | I915_EXEC_NO_RELOC);
        assert_eq!(exec.ctx_id, f.os_context.linux().unwrap().drm_context_ids()[0]);
        drop(calls);

        let state = *submission.fence().state();
        assert_eq!(state.fence_handle, u64::from(batch_handle));
        assert_eq!(state.last_submitted_fence, 3);
    }

    #[test]
    fn residency_is_consumed_by_exec() {
        let f = DrmFixture::new(ResidencyMode::ExecObjects);
        let (mut submission, _tag) = submission(&f);
        let buffer = f.allocate(AllocationType::Buffer);
        submission.process_residency(&[buffer]).unwrap();
        submission.exec(&batch(&f, 1), &[]).unwrap();
        submission.exec(&batch(&f, 2), &[]).unwrap();

        let calls = f.device.calls();
        assert_eq!(calls.execs[0].objects.len(), 2);
        assert_eq!(calls.execs[1].objects.len(), 1);
    }

    #[test]
    fn rejected_batch_still_consumes_residency() {
        let f = DrmFixture::new(ResidencyMode::ExecObjects);
        let (mut submission, _tag) = submission(&f);
        let buffer = f.allocate(AllocationType::Buffer);
        submission.process_residency(&[buffer]).unwrap();

        let host_only = Arc::new(
            GraphicsAllocation::new_host_backed(AllocationType::CommandBuffer, 4096, 0x7000_0000)
                .unwrap(),
        );
        let err = submission
            .exec(&BatchBuffer::new(host_only, 0, 60), &[])
            .unwrap_err();
        assert!(matches!(err, NeoError::SubmissionFailed(_)));
        assert_eq!(f.device.count("EXECBUFFER2"), 0);

        submission.exec(&batch(&f, 1), &[]).unwrap();
        assert_eq!(f.device.calls().execs[0].objects.len(), 1);
    }

    #[test]
    fn bind_mode_submits_only_the_batch() {
        let f = DrmFixture::new(ResidencyMode::VmBind);
        let (mut submission, _tag) = submission(&f);
        let buffer = f.allocate(AllocationType::Buffer);
        submission.process_residency(&[Arc::clone(&buffer)]).unwrap();
        assert_eq!(f.device.count("VM_BIND"), 1);

        submission.exec(&batch(&f, 1), &[]).unwrap();
        assert_eq!(f.device.calls().execs[0].objects.len(), 1);

        submission.process_eviction(&[buffer]).unwrap();
        assert_eq!(f.device.count("VM_UNBIND"), 1);
    }

    #[test]
    fn failed_exec_is_reported() {
        let f = DrmFixture::new(ResidencyMode::ExecObjects);
        let (mut submission, _tag) = submission(&f);
        f.device.fail("EXECBUFFER2", &[libc::EINTR, libc::EIO]);
        let err = submission.exec(&batch(&f, 1), &[]).unwrap_err();
        assert!(matches!(err, NeoError::Ioctl { .. }));
        assert_eq!(f.device.count("EXECBUFFER2"), 2);
    }

    #[test]
    fn wait_skips_the_kernel_once_the_tag_passed() {
        let f = DrmFixture::new(ResidencyMode::ExecObjects);
        let (mut submission, _tag) = submission(&f);
        let batch = batch(&f, 2);
        submission.exec(&batch, &[]).unwrap();

        submission.wait_for_flush_stamp(2).unwrap();
        assert_eq!(
            f.device.calls().waits,
            vec![batch.command_buffer.buffer_object().unwrap().handle()]
        );

        submission.fence().cpu_address().store(2);
        submission.wait_for_flush_stamp(2).unwrap();
        assert_eq!(f.device.count("GEM_WAIT"), 1);
    }
}
