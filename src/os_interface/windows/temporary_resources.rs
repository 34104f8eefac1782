use crate::error::{NeoError, NeoResult};
use crate::os_interface::windows::wddm::{evict_handles, make_resident_handles};
use crate::wddm::gdi::{D3dkmtHandle, Gdi};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// Allocations made resident outside of any submission (CPU locks, internal copies).
///
/// They are not tracked per context, so the only way to release memory held by them
/// under pressure is to evict the whole set.
pub struct WddmResidentTemporaryResources {
    gdi: Arc<dyn Gdi>,
    device: D3dkmtHandle,
    default_attempts: u32,
    resources: Mutex<Vec<D3dkmtHandle>>,
}

impl WddmResidentTemporaryResources {
    #[must_use]
    pub fn new(gdi: Arc<dyn Gdi>, device: D3dkmtHandle, default_attempts: u32) -> Self {
        Self {
            gdi,
            device,
            default_attempts: default_attempts.max(1),
            resources: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<D3dkmtHandle>> {
        self.resources.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    #[must_use]
    pub fn contains(&self, handle: D3dkmtHandle) -> bool {
        self.lock().contains(&handle)
    }

    /// # Errors
    /// [`NeoError::OutOfMemory`] after the default number of attempts.
    pub fn make_resident_resource(&self, handle: D3dkmtHandle) -> NeoResult<()> {
        self.make_resident_resource_with_attempts(handle, self.default_attempts)
    }

    /// Tries `attempts` times, evicting every temporary resource between attempts.
    ///
    /// # Errors
    /// [`NeoError::OutOfMemory`] when the last attempt fails.
    pub fn make_resident_resource_with_attempts(
        &self,
        handle: D3dkmtHandle,
        attempts: u32,
    ) -> NeoResult<()> {
        let attempts = attempts.max(1);
        let mut resources = self.lock();
        for attempt in 1..=attempts {
            match make_resident_handles(self.gdi.as_ref(), self.device, &[handle], false) {
                Ok(_) => {
                    if !resources.contains(&handle) {
                        resources.push(handle);
                    }
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        handle,
                        attempt,
                        status = %e.status,
                        "temporary resource make resident failed"
                    );
                    if attempt < attempts {
                        self.evict_all_locked(&mut resources);
                    }
                }
            }
        }
        Err(NeoError::OutOfMemory)
    }

    /// # Errors
    /// Propagates the evict failure; the handle is forgotten either way.
    pub fn evict_resource(&self, handle: D3dkmtHandle) -> NeoResult<()> {
        let mut resources = self.lock();
        let Some(position) = resources.iter().position(|&h| h == handle) else {
            return Ok(());
        };
        resources.swap_remove(position);
        evict_handles(self.gdi.as_ref(), self.device, &[handle]).map(|_| ())
    }

    pub fn evict_all_resources(&self) {
        let mut resources = self.lock();
        self.evict_all_locked(&mut resources);
    }

    fn evict_all_locked(&self, resources: &mut Vec<D3dkmtHandle>) {
        if resources.is_empty() {
            return;
        }
        debug!(count = resources.len(), "evicting temporary resources");
        if let Err(e) = evict_handles(self.gdi.as_ref(), self.device, resources) {
            warn!(error = %e, "failed to evict temporary resources");
        }
        resources.clear();
    }
}

impl fmt::Debug for WddmResidentTemporaryResources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WddmResidentTemporaryResources")
            .field("device", &self.device)
            .field("resources", &*self.lock())
            .finish_non_exhaustive()
    }
}
