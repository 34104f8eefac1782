//! i915 submission path.

pub mod backend;
pub mod buffer_object;
pub mod direct_submission;
pub mod drm;
pub mod gem_close_worker;
pub mod memory_operations;
pub mod os_context;
pub mod submission;

pub use backend::DrmMemoryBackend;
pub use buffer_object::BufferObject;
pub use drm::Drm;
pub use gem_close_worker::{GemCloseWorker, GemCloseWorkerMode};
pub use memory_operations::{DrmMemoryOperations, ResidencyMode};
pub use os_context::OsContextLinux;
pub use submission::DrmSubmission;
