//! Command stream receiver core for Intel GPUs: residency tracking, allocation
//! lifetime, and submission through i915 (DRM) or WDDM.

pub mod command_stream;
pub mod direct_submission;
pub mod drm;
pub mod error;
pub mod execution_environment;
pub mod hw;
pub mod memory;
pub mod os_interface;
pub mod settings;
pub mod utils;
pub mod wddm;

pub use error::{NeoError, NeoResult};
