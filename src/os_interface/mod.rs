//! OS-specific submission shims and the objects they share.

pub mod fence;
pub mod linux;
pub mod os_context;
pub mod windows;

pub use fence::{MonitoredFence, TagAddress};
pub use os_context::{OsContext, OsContextKind};

use crate::os_interface::linux::drm::Drm;
use crate::os_interface::windows::wddm::Wddm;
use std::sync::Arc;

/// Kernel driver interface of one root device.
#[derive(Debug, Clone)]
pub enum OsInterface {
    Drm(Arc<Drm>),
    Wddm(Arc<Wddm>),
}

impl OsInterface {
    #[must_use]
    pub const fn drm(&self) -> Option<&Arc<Drm>> {
        match self {
            Self::Drm(drm) => Some(drm),
            Self::Wddm(_) => None,
        }
    }

    #[must_use]
    pub const fn wddm(&self) -> Option<&Arc<Wddm>> {
        match self {
            Self::Wddm(wddm) => Some(wddm),
            Self::Drm(_) => None,
        }
    }
}

/// Set of sub-devices (tiles) an object spans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceBitfield(u32);

impl DeviceBitfield {
    #[must_use]
    pub const fn new(bits: u32) -> Self {
        Self(bits)
    }

    /// Only sub-device 0.
    #[must_use]
    pub const fn single() -> Self {
        Self(1)
    }

    /// Sub-devices `0..count`.
    #[must_use]
    pub const fn all(count: u32) -> Self {
        if count >= 32 {
            Self(u32::MAX)
        } else if count == 0 {
            Self(1)
        } else {
            Self((1 << count) - 1)
        }
    }

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }

    #[must_use]
    pub const fn contains(self, index: u32) -> bool {
        index < 32 && self.0 & (1 << index) != 0
    }

    /// Indices of the set bits in ascending order.
    pub fn indices(self) -> impl Iterator<Item = u32> {
        (0..32).filter(move |&i| self.contains(i))
    }
}
