//! Building and submitting command buffers.

pub mod aggregator;
pub mod csr;
pub mod dispatch_flags;
pub mod linear_stream;

pub use aggregator::{AggregatedBatch, CommandBuffer, SubmissionAggregator};
pub use csr::{CommandStreamReceiver, SubmissionBackend, WaitStatus};
pub use dispatch_flags::{
    BatchBuffer, CompletionStamp, DispatchFlags, DispatchMode, EndLocation, FlushStamp,
};
pub use linear_stream::{IndirectHeap, IndirectHeapType, LinearStream};
