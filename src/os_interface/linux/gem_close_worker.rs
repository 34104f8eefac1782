//! Background thread that performs `GEM_CLOSE` off the caller's path.

use crate::error::NeoResult;
use crate::memory::GraphicsAllocation;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::thread::{self, JoinHandle};
use tracing::{debug, trace, warn};

const DEFAULT_QUEUE_DEPTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GemCloseWorkerMode {
    /// Releases are queued to the worker thread.
    Active,
    /// Releases happen inline on the calling thread.
    Inactive,
}

enum Request {
    Release(Arc<GraphicsAllocation>),
    Flush(SyncSender<()>),
}

/// Single consumer of allocation release requests.
///
/// Dropping the last reference to an allocation closes its buffer object, so the
/// worker only has to drop what it receives.
pub struct GemCloseWorker {
    sender: Option<SyncSender<Request>>,
    thread: Option<JoinHandle<()>>,
    pending: Arc<AtomicUsize>,
}

impl fmt::Debug for GemCloseWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GemCloseWorker")
            .field("pending", &self.pending())
            .field("running", &self.thread.is_some())
            .finish()
    }
}

impl GemCloseWorker {
    /// # Errors
    /// Fails if the OS refuses to create the thread.
    pub fn spawn() -> NeoResult<Self> {
        Self::with_queue_depth(DEFAULT_QUEUE_DEPTH)
    }

    /// # Errors
    /// Fails if the OS refuses to create the thread.
    pub fn with_queue_depth(depth: usize) -> NeoResult<Self> {
        let (sender, receiver) = mpsc::sync_channel(depth.max(1));
        let pending = Arc::new(AtomicUsize::new(0));
        let worker_pending = Arc::clone(&pending);
        let thread = thread::Builder::new()
            .name("gem-close-worker".into())
            .spawn(move || Self::run(&receiver, &worker_pending))?;
        debug!(depth, "started gem close worker");
        Ok(Self {
            sender: Some(sender),
            thread: Some(thread),
            pending,
        })
    }

    fn run(receiver: &Receiver<Request>, pending: &AtomicUsize) {
        for request in receiver {
            match request {
                Request::Release(allocation) => {
                    trace!(id = allocation.id(), "worker releasing allocation");
                    drop(allocation);
                    pending.fetch_sub(1, Ordering::AcqRel);
                }
                Request::Flush(ack) => {
                    let _ = ack.send(());
                }
            }
        }
        trace!("gem close worker exiting");
    }

    /// Queues `allocation` for release. Blocks while the queue is full.
    pub fn push(&self, allocation: Arc<GraphicsAllocation>) {
        let Some(sender) = &self.sender else {
            drop(allocation);
            return;
        };
        self.pending.fetch_add(1, Ordering::AcqRel);
        if let Err(mpsc::SendError(request)) = sender.send(Request::Release(allocation)) {
            warn!("gem close worker gone, releasing inline");
            self.pending.fetch_sub(1, Ordering::AcqRel);
            drop(request);
        }
    }

    /// Returns once every request queued before this call has been processed.
    pub fn flush(&self) {
        let Some(sender) = &self.sender else {
            return;
        };
        let (ack_sender, ack) = mpsc::sync_channel(1);
        if sender.send(Request::Flush(ack_sender)).is_ok() {
            let _ = ack.recv();
        }
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending() == 0
    }
}

impl Drop for GemCloseWorker {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain the queue and exit.
        drop(self.sender.take());
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("gem close worker panicked");
        }
    }
}
