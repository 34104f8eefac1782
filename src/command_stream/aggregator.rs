use crate::command_stream::dispatch_flags::BatchBuffer;
use crate::memory::GraphicsAllocation;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

/// A flushed task waiting in batched dispatch mode.
#[derive(Debug)]
pub struct CommandBuffer {
    pub batch: BatchBuffer,
    pub residency: Vec<Arc<GraphicsAllocation>>,
}

/// Consecutive command buffers submitted together, with their combined residency.
#[derive(Debug)]
pub struct AggregatedBatch {
    pub buffers: Vec<CommandBuffer>,
    pub residency: Vec<Arc<GraphicsAllocation>>,
}

/// FIFO of batched command buffers.
#[derive(Debug, Default)]
pub struct SubmissionAggregator {
    buffers: VecDeque<CommandBuffer>,
}

impl SubmissionAggregator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_command_buffer(&mut self, command_buffer: CommandBuffer) {
        self.buffers.push_back(command_buffer);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Pops the oldest buffer plus every following buffer that is compatible, can be
    /// chained and keeps the deduplicated residency within `residency_budget` bytes.
    /// The first buffer is always taken.
    pub fn aggregate(&mut self, residency_budget: usize) -> Option<AggregatedBatch> {
        let first = self.buffers.pop_front()?;
        let mut seen = HashSet::new();
        let mut residency = Vec::new();
        let mut total = 0usize;

        let add = |buffer: &CommandBuffer,
                       seen: &mut HashSet<u64>,
                       residency: &mut Vec<Arc<GraphicsAllocation>>,
                       commit: bool|
         -> usize {
            let mut extra = 0;
            for allocation in &buffer.residency {
                if !seen.contains(&allocation.id()) {
                    extra += allocation.size();
                    if commit {
                        seen.insert(allocation.id());
                        residency.push(Arc::clone(allocation));
                    }
                }
            }
            extra
        };

        total += add(&first, &mut seen, &mut residency, true);
        let mut buffers = vec![first];

        while let Some(next) = self.buffers.front() {
            let Some(last) = buffers.last() else { break };
            if last.batch.end_location.is_none() || !last.batch.is_compatible_with(&next.batch) {
                break;
            }
            let extra = add(next, &mut seen, &mut residency, false);
            if total + extra > residency_budget {
                break;
            }
            total += add(next, &mut seen, &mut residency, true);
            if let Some(next) = self.buffers.pop_front() {
                buffers.push(next);
            }
        }

        Some(AggregatedBatch { buffers, residency })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_stream::dispatch_flags::EndLocation;
    use crate::hw::QueueThrottle;
    use crate::memory::AllocationType;

    fn alloc(size: usize) -> Arc<GraphicsAllocation> {
        Arc::new(GraphicsAllocation::new_host_backed(AllocationType::Buffer, size, 0x1000).unwrap())
    }

    fn buffer(residency: Vec<Arc<GraphicsAllocation>>) -> CommandBuffer {
        let cb = alloc(4096);
        let mut batch = BatchBuffer::new(Arc::clone(&cb), 0, 64);
        batch.end_location = Some(EndLocation {
            allocation: cb,
            offset: 60,
        });
        CommandBuffer { batch, residency }
    }

    #[test]
    fn combines_in_fifo_order_and_dedups_residency() {
        let shared = alloc(100);
        let mut agg = SubmissionAggregator::new();
        let a = buffer(vec![Arc::clone(&shared)]);
        let b = buffer(vec![Arc::clone(&shared), alloc(50)]);
        let a_id = a.batch.command_buffer.id();
        agg.record_command_buffer(a);
        agg.record_command_buffer(b);

        let batch = agg.aggregate(usize::MAX).unwrap();
        assert_eq!(batch.buffers.len(), 2);
        assert_eq!(batch.buffers[0].batch.command_buffer.id(), a_id);
        assert_eq!(batch.residency.len(), 2);
        assert!(agg.is_empty());
    }

    #[test]
    fn budget_splits_groups() {
        let mut agg = SubmissionAggregator::new();
        agg.record_command_buffer(buffer(vec![alloc(100)]));
        agg.record_command_buffer(buffer(vec![alloc(100)]));
        let first = agg.aggregate(150).unwrap();
        assert_eq!(first.buffers.len(), 1);
        assert_eq!(agg.len(), 1);
        // the oldest buffer is taken even when it alone exceeds the budget
        assert_eq!(agg.aggregate(10).unwrap().buffers.len(), 1);
        assert!(agg.aggregate(10).is_none());
    }

    #[test]
    fn incompatible_buffers_are_not_merged() {
        let mut agg = SubmissionAggregator::new();
        agg.record_command_buffer(buffer(vec![]));
        let mut low = buffer(vec![]);
        low.batch.throttle = QueueThrottle::Low;
        agg.record_command_buffer(low);
        assert_eq!(agg.aggregate(usize::MAX).unwrap().buffers.len(), 1);
        assert_eq!(agg.len(), 1);
    }
}
