//! Raw i915 DRM interface: ioctl ABI and the render-node handle.

pub mod device;
pub mod ioctl;

pub use device::{DrmDevice, DrmFile};
