//! Per-context residency on WDDM: batched make-resident with a trim fallback and a
//! trim candidate list the kernel's trim callback evicts from.

use crate::error::{NeoError, NeoResult};
use crate::memory::GraphicsAllocation;
use crate::os_interface::fence::MonitoredFence;
use crate::os_interface::windows::allocation::{TRIM_LIST_UNUSED_POSITION, WddmAllocation};
use crate::os_interface::windows::wddm::Wddm;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, trace, warn};

/// Flags passed by the kernel trim notification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrimFlags {
    pub periodic_trim: bool,
    pub trim_to_budget: bool,
}

/// State guarded by the residency lock.
#[derive(Debug, Default)]
pub struct ResidencyState {
    trim_candidates: Vec<Option<Arc<GraphicsAllocation>>>,
    trim_candidates_count: usize,
    last_trim_fence_value: u64,
    memory_budget_exhausted: bool,
}

impl ResidencyState {
    #[must_use]
    pub const fn trim_candidates_count(&self) -> usize {
        self.trim_candidates_count
    }

    #[must_use]
    pub const fn memory_budget_exhausted(&self) -> bool {
        self.memory_budget_exhausted
    }
}

fn wddm_allocation(allocation: &GraphicsAllocation) -> Option<&WddmAllocation> {
    allocation.wddm_allocation()
}

#[derive(Debug)]
pub struct WddmResidencyController {
    wddm: Arc<Wddm>,
    context_id: u32,
    monitored_fence: MonitoredFence,
    state: Mutex<ResidencyState>,
}

impl WddmResidencyController {
    /// Creates the controller and registers it with `wddm`.
    #[must_use]
    pub fn new(wddm: Arc<Wddm>, context_id: u32, monitored_fence: MonitoredFence) -> Arc<Self> {
        let controller = Arc::new(Self {
            wddm: Arc::clone(&wddm),
            context_id,
            monitored_fence,
            state: Mutex::new(ResidencyState::default()),
        });
        wddm.register_residency_controller(&controller);
        controller
    }

    /// The residency lock. Submission holds it while it reads and advances the fence.
    pub fn lock(&self) -> MutexGuard<'_, ResidencyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub const fn monitored_fence(&self) -> &MonitoredFence {
        &self.monitored_fence
    }

    #[must_use]
    pub const fn context_id(&self) -> u32 {
        self.context_id
    }

    #[must_use]
    pub fn is_memory_budget_exhausted(&self) -> bool {
        self.lock().memory_budget_exhausted
    }

    #[must_use]
    pub fn is_in_trim_candidate_list(&self, allocation: &GraphicsAllocation) -> bool {
        wddm_allocation(allocation)
            .is_some_and(|w| w.trim_position(self.context_id) != TRIM_LIST_UNUSED_POSITION)
    }

    // ========================================================================
    // Submission path
    // ========================================================================

    /// Makes every allocation of a submission resident in one DDI call.
    ///
    /// On failure it trims to the kernel's budget, evicts the temporary resources once
    /// and retries with `cant_trim_further`. A second failure marks the budget exhausted.
    ///
    /// # Errors
    /// [`NeoError::OutOfMemory`] when the retry fails too.
    pub fn make_resident_residency_allocations(
        &self,
        allocations: &[Arc<GraphicsAllocation>],
    ) -> NeoResult<()> {
        let mut state = self.lock();
        let ctx = self.context_id;
        let fence_value = self.monitored_fence.current_fence_value();

        let mut handles = Vec::with_capacity(allocations.len());
        let mut total_size = 0u64;
        for allocation in allocations {
            let Some(w) = wddm_allocation(allocation) else {
                continue;
            };
            if w.trim_position(ctx) != TRIM_LIST_UNUSED_POSITION {
                Self::remove_from_trim_candidate_list(&mut state, ctx, w);
            }
            if !w.is_resident(ctx) && !handles.contains(&w.handle()) {
                handles.push(w.handle());
                total_size += w.size();
            }
        }
        Self::check_trim_candidate_list_compaction(&mut state, ctx);

        if !handles.is_empty() {
            if let Err(first) = self.wddm.make_resident(&handles, false) {
                let bytes_to_trim = first.bytes_to_trim.max(total_size);
                warn!(
                    context_id = ctx,
                    status = %first.status,
                    bytes_to_trim,
                    "make resident failed, trimming"
                );
                self.trim_residency_to_budget(&mut state, bytes_to_trim);
                self.wddm.temporary_resources().evict_all_resources();
                if let Err(second) = self.wddm.make_resident(&handles, true) {
                    state.memory_budget_exhausted = true;
                    error!(
                        context_id = ctx,
                        status = %second.status,
                        count = handles.len(),
                        "make resident failed after trimming"
                    );
                    return Err(NeoError::OutOfMemory);
                }
            }
            trace!(context_id = ctx, count = handles.len(), "made allocations resident");
        }

        for allocation in allocations {
            if let Some(w) = wddm_allocation(allocation) {
                w.set_resident(ctx, true);
                w.set_last_fence(ctx, fence_value);
            }
        }
        Ok(())
    }

    /// Allocations released by the CSR become trim candidates instead of being evicted.
    pub fn make_non_resident_eviction_allocations(&self, evictions: &[Arc<GraphicsAllocation>]) {
        let mut state = self.lock();
        for allocation in evictions {
            if let Some(w) = wddm_allocation(allocation)
                && w.trim_position(self.context_id) == TRIM_LIST_UNUSED_POSITION
            {
                Self::add_to_trim_candidate_list(&mut state, self.context_id, allocation);
            }
        }
    }

    // ========================================================================
    // Trimming
    // ========================================================================

    /// Kernel trim notification. Returns whether the requested amount was released.
    pub fn trim_residency(&self, flags: TrimFlags, bytes: u64) -> bool {
        let mut state = self.lock();
        let mut satisfied = true;
        if flags.periodic_trim {
            self.trim_completed(&mut state);
            state.last_trim_fence_value = self.monitored_fence.cpu_value();
        }
        if flags.trim_to_budget {
            satisfied = self.trim_residency_to_budget(&mut state, bytes);
        }
        Self::check_trim_candidate_list_compaction(&mut state, self.context_id);
        satisfied
    }

    fn trim_completed(&self, state: &mut ResidencyState) {
        let ctx = self.context_id;
        let mut handles = Vec::new();
        let mut index = 0;
        while index < state.trim_candidates.len() {
            let slot = state.trim_candidates[index].clone();
            index += 1;
            let Some(allocation) = slot else {
                continue;
            };
            let Some(w) = wddm_allocation(&allocation) else {
                continue;
            };
            if w.last_fence(ctx) <= state.last_trim_fence_value {
                handles.push(w.handle());
                w.set_resident(ctx, false);
                Self::remove_from_trim_candidate_list(state, ctx, w);
            }
        }
        if !handles.is_empty() {
            debug!(context_id = ctx, count = handles.len(), "periodic trim");
            if let Err(e) = self.wddm.evict(&handles) {
                warn!(error = %e, "periodic trim evict failed");
            }
        }
    }

    /// Evicts trim candidates oldest first until `bytes` are released, waiting for
    /// the GPU where a candidate is still in flight.
    fn trim_residency_to_budget(&self, state: &mut ResidencyState, bytes: u64) -> bool {
        let ctx = self.context_id;
        let last_submitted = self.monitored_fence.last_submitted_fence();
        let mut released = 0u64;
        let mut handles = Vec::new();

        let mut index = 0;
        while index < state.trim_candidates.len() && released < bytes {
            let slot = state.trim_candidates[index].clone();
            index += 1;
            let Some(allocation) = slot else {
                continue;
            };
            let Some(w) = wddm_allocation(&allocation) else {
                continue;
            };
            let last_fence = w.last_fence(ctx);
            if last_fence > last_submitted {
                continue;
            }
            if last_fence > self.monitored_fence.cpu_value()
                && let Err(e) = self.wddm.wait_from_cpu(last_fence, &self.monitored_fence)
            {
                warn!(error = %e, "wait before trim failed");
                break;
            }
            handles.push(w.handle());
            released += w.size();
            w.set_resident(ctx, false);
            Self::remove_from_trim_candidate_list(state, ctx, w);
        }

        if !handles.is_empty() {
            debug!(context_id = ctx, count = handles.len(), released, "trim to budget");
            if let Err(e) = self.wddm.evict(&handles) {
                warn!(error = %e, "trim to budget evict failed");
            }
        }
        released >= bytes
    }

    // ========================================================================
    // Trim candidate list
    // ========================================================================

    /// Drops `allocation` from the list if it is a candidate here. Called before the
    /// allocation is destroyed so the list does not keep its handle alive.
    pub fn remove_from_trim_candidate_list_if_used(&self, allocation: &GraphicsAllocation) {
        let Some(w) = wddm_allocation(allocation) else {
            return;
        };
        let mut state = self.lock();
        if w.trim_position(self.context_id) != TRIM_LIST_UNUSED_POSITION {
            Self::remove_from_trim_candidate_list(&mut state, self.context_id, w);
            Self::check_trim_candidate_list_compaction(&mut state, self.context_id);
        }
    }

    fn add_to_trim_candidate_list(
        state: &mut ResidencyState,
        ctx: u32,
        allocation: &Arc<GraphicsAllocation>,
    ) {
        let Some(w) = wddm_allocation(allocation) else {
            return;
        };
        w.set_trim_position(ctx, state.trim_candidates.len());
        state.trim_candidates.push(Some(Arc::clone(allocation)));
        state.trim_candidates_count += 1;
    }

    /// O(1): leaves a hole unless the entry is the tail.
    fn remove_from_trim_candidate_list(state: &mut ResidencyState, ctx: u32, w: &WddmAllocation) {
        let position = w.trim_position(ctx);
        crate::unrecoverable_if!(position >= state.trim_candidates.len());
        state.trim_candidates[position] = None;
        state.trim_candidates_count -= 1;
        w.set_trim_position(ctx, TRIM_LIST_UNUSED_POSITION);
        while matches!(state.trim_candidates.last(), Some(None)) {
            state.trim_candidates.pop();
        }
    }

    fn check_trim_candidate_list_compaction(state: &mut ResidencyState, ctx: u32) {
        if state.trim_candidates_count * 2 >= state.trim_candidates.len() {
            return;
        }
        state.trim_candidates.retain(Option::is_some);
        for (position, slot) in state.trim_candidates.iter().enumerate() {
            if let Some(w) = slot.as_deref().and_then(wddm_allocation) {
                w.set_trim_position(ctx, position);
            }
        }
    }
}

impl Drop for WddmResidencyController {
    fn drop(&mut self) {
        let ctx = self.context_id;
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for allocation in state.trim_candidates.drain(..).flatten() {
            if let Some(w) = wddm_allocation(&allocation) {
                w.set_trim_position(ctx, TRIM_LIST_UNUSED_POSITION);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::HardwareInfo;
    use crate::memory::{AllocationProperties, AllocationType, MemoryManager};
    use crate::os_interface::windows::WddmMemoryBackend;
    use crate::settings::DebugSettings;
    use crate::wddm::gdi::NtStatus;
    use crate::wddm::gdi::test_support::FakeGdi;

    struct Fixture {
        gdi: Arc<FakeGdi>,
        controller: Arc<WddmResidencyController>,
        memory_manager: Arc<MemoryManager>,
    }

    impl Fixture {
        fn new() -> Self {
            let gdi = Arc::new(FakeGdi::default());
            let wddm = Wddm::new(
                Arc::clone(&gdi) as Arc<dyn crate::wddm::gdi::Gdi>,
                1,
                HardwareInfo::gen12lp(),
                &DebugSettings::default(),
            );
            let fence = wddm.create_monitored_fence().unwrap();
            let memory_manager = Arc::new(MemoryManager::new(vec![Box::new(
                WddmMemoryBackend::new(Arc::clone(&wddm), 3),
            )]));
            Self {
                gdi,
                controller: WddmResidencyController::new(wddm, 0, fence),
                memory_manager,
            }
        }

        fn allocation(&self) -> Arc<GraphicsAllocation> {
            self.memory_manager
                .allocate_graphics_memory_with_properties(&AllocationProperties::new(
                    0,
                    4096,
                    AllocationType::Buffer,
                ))
                .unwrap()
        }

        fn handle(allocation: &GraphicsAllocation) -> u32 {
            allocation.wddm_allocation().unwrap().handle()
        }

        /// Makes `allocation` resident and submitted, then hands it to the trim list.
        fn make_trim_candidate(&self, allocation: &Arc<GraphicsAllocation>) {
            self.controller
                .make_resident_residency_allocations(std::slice::from_ref(allocation))
                .unwrap();
            MonitoredFence::advance(&mut self.controller.monitored_fence().state());
            self.controller
                .make_non_resident_eviction_allocations(std::slice::from_ref(allocation));
        }
    }

    #[test]
    fn resident_allocations_are_not_made_resident_again() {
        let f = Fixture::new();
        let a = f.allocation();
        f.controller
            .make_resident_residency_allocations(&[Arc::clone(&a), Arc::clone(&a)])
            .unwrap();
        f.controller
            .make_resident_residency_allocations(&[Arc::clone(&a)])
            .unwrap();
        let calls = f.gdi.calls();
        assert_eq!(calls.make_resident.len(), 1);
        assert_eq!(calls.make_resident[0].0, vec![Fixture::handle(&a)]);
        assert!(a.wddm_allocation().unwrap().is_resident(0));
    }

    #[test]
    fn failed_make_resident_trims_then_retries_once() {
        let f = Fixture::new();
        let old = f.allocation();
        f.make_trim_candidate(&old);
        assert!(f.controller.is_in_trim_candidate_list(&old));

        let new = f.allocation();
        f.gdi.fail_make_resident(&[(NtStatus::NO_MEMORY, 4096)]);
        f.controller
            .make_resident_residency_allocations(&[Arc::clone(&new)])
            .unwrap();

        let calls = f.gdi.calls();
        let attempts: Vec<_> = calls.make_resident.iter().skip(1).cloned().collect();
        assert_eq!(
            attempts,
            vec![
                (vec![Fixture::handle(&new)], false),
                (vec![Fixture::handle(&new)], true)
            ]
        );
        assert_eq!(calls.evict, vec![vec![Fixture::handle(&old)]]);
        // the candidate was still in flight, so trimming waited for it
        assert_eq!(calls.waits.len(), 1);
        drop(calls);
        assert!(!f.controller.is_in_trim_candidate_list(&old));
        assert!(!f.controller.is_memory_budget_exhausted());
    }

    #[test]
    fn second_failure_exhausts_budget() {
        let f = Fixture::new();
        let a = f.allocation();
        f.gdi.fail_make_resident(&[
            (NtStatus::NO_MEMORY, 0),
            (NtStatus::GRAPHICS_NO_VIDEO_MEMORY, 0),
        ]);
        let err = f
            .controller
            .make_resident_residency_allocations(&[Arc::clone(&a)])
            .unwrap_err();
        assert!(matches!(err, NeoError::OutOfMemory));
        assert!(f.controller.is_memory_budget_exhausted());
        assert_eq!(f.gdi.calls().make_resident.len(), 2);
        assert!(!a.wddm_allocation().unwrap().is_resident(0));
    }

    #[test]
    fn retry_evicts_temporary_resources_once() {
        let f = Fixture::new();
        let locked = f.allocation();
        f.controller
            .wddm
            .temporary_resources()
            .make_resident_resource(Fixture::handle(&locked))
            .unwrap();

        let a = f.allocation();
        f.gdi.fail_make_resident(&[(NtStatus::NO_MEMORY, 0)]);
        f.controller
            .make_resident_residency_allocations(&[Arc::clone(&a)])
            .unwrap();
        assert_eq!(f.gdi.calls().evict, vec![vec![Fixture::handle(&locked)]]);
    }

    #[test]
    fn persistent_failure_evicts_temporary_resources_and_gives_up() {
        let f = Fixture::new();
        let locked = f.allocation();
        f.controller
            .wddm
            .temporary_resources()
            .make_resident_resource(Fixture::handle(&locked))
            .unwrap();

        let a = f.allocation();
        f.gdi
            .fail_make_resident(&[(NtStatus::NO_MEMORY, 0), (NtStatus::NO_MEMORY, 0)]);
        let err = f
            .controller
            .make_resident_residency_allocations(&[Arc::clone(&a)])
            .unwrap_err();

        assert!(matches!(err, NeoError::OutOfMemory));
        let calls = f.gdi.calls();
        assert_eq!(calls.evict, vec![vec![Fixture::handle(&locked)]]);
        let attempts: Vec<_> = calls
            .make_resident
            .iter()
            .filter(|(handles, _)| *handles == [Fixture::handle(&a)])
            .map(|(_, cant_trim)| *cant_trim)
            .collect();
        assert_eq!(attempts, vec![false, true]);
    }

    #[test]
    fn freeing_a_trim_candidate_destroys_it() {
        let f = Fixture::new();
        let a = f.allocation();
        let handle = Fixture::handle(&a);
        f.make_trim_candidate(&a);

        f.memory_manager.free_graphics_memory(a);

        assert_eq!(f.controller.lock().trim_candidates_count(), 0);
        assert_eq!(f.gdi.calls().destroyed_allocations, vec![handle]);
    }

    #[test]
    fn periodic_trim_evicts_only_completed_candidates() {
        let f = Fixture::new();
        let a = f.allocation();
        f.make_trim_candidate(&a);

        // nothing has completed at the previous trim
        assert!(f.controller.trim_residency(
            TrimFlags {
                periodic_trim: true,
                ..TrimFlags::default()
            },
            0
        ));
        assert!(f.gdi.calls().evict.is_empty());

        f.controller.monitored_fence().cpu_address().store(1);
        f.controller.trim_residency(
            TrimFlags {
                periodic_trim: true,
                ..TrimFlags::default()
            },
            0,
        );
        f.controller.trim_residency(
            TrimFlags {
                periodic_trim: true,
                ..TrimFlags::default()
            },
            0,
        );
        assert_eq!(f.gdi.calls().evict, vec![vec![Fixture::handle(&a)]]);
        assert_eq!(f.controller.lock().trim_candidates_count(), 0);
    }

    #[test]
    fn trim_to_budget_reports_shortfall() {
        let f = Fixture::new();
        let a = f.allocation();
        f.make_trim_candidate(&a);
        let satisfied = f.controller.trim_residency(
            TrimFlags {
                trim_to_budget: true,
                ..TrimFlags::default()
            },
            1 << 20,
        );
        assert!(!satisfied);
        assert!(!a.wddm_allocation().unwrap().is_resident(0));
    }

    #[test]
    fn removing_most_candidates_compacts_the_list() {
        let f = Fixture::new();
        let allocations: Vec<_> = (0..4).map(|_| f.allocation()).collect();
        for a in &allocations {
            f.make_trim_candidate(a);
        }
        assert_eq!(f.controller.lock().trim_candidates_count(), 4);

        // reuse the first three; the tail stays
        f.controller
            .make_resident_residency_allocations(&allocations[..3])
            .unwrap();
        let state = f.controller.lock();
        assert_eq!(state.trim_candidates_count(), 1);
        assert_eq!(state.trim_candidates.len(), 1);
        drop(state);
        assert_eq!(allocations[3].wddm_allocation().unwrap().trim_position(0), 0);
    }
}
