//! WDDM submission path.

pub mod allocation;
pub mod backend;
pub mod direct_submission;
pub mod os_context;
pub mod residency_controller;
pub mod submission;
pub mod temporary_resources;
pub mod wddm;

pub use allocation::WddmAllocation;
pub use backend::WddmMemoryBackend;
pub use os_context::OsContextWin;
pub use residency_controller::WddmResidencyController;
pub use submission::WddmSubmission;
pub use temporary_resources::WddmResidentTemporaryResources;
pub use wddm::Wddm;
