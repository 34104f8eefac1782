mod common;

use common::{MockGdi, Workload};
use neo_rs::command_stream::DispatchFlags;
use neo_rs::execution_environment::{ExecutionEnvironment, RootDevice, RootDeviceEnvironment};
use neo_rs::hw::{EngineType, HardwareInfo};
use neo_rs::memory::{AllocationProperties, AllocationType, GraphicsAllocation};
use neo_rs::os_interface::windows::Wddm;
use neo_rs::os_interface::windows::residency_controller::TrimFlags;
use neo_rs::settings::DebugSettings;
use neo_rs::wddm::NtStatus;
use neo_rs::NeoError;
use pretty_assertions::assert_eq;
use std::sync::Arc;

struct Platform {
    device: RootDevice,
    wddm: Arc<Wddm>,
    _environment: ExecutionEnvironment,
}

fn platform(gdi: &Arc<MockGdi>, settings: DebugSettings) -> Platform {
    let wddm = Wddm::new(gdi.clone(), 1, HardwareInfo::gen12lp(), &settings);
    let mut environment = ExecutionEnvironment::new(settings);
    environment.add_root_device_environment(RootDeviceEnvironment::from_wddm(Arc::clone(&wddm)).unwrap());
    environment.initialize_memory_manager().unwrap();
    let device = environment.create_root_device(0).unwrap();
    Platform {
        device,
        wddm,
        _environment: environment,
    }
}

fn without_direct_submission() -> DebugSettings {
    DebugSettings {
        enable_direct_submission: Some(false),
        ..Default::default()
    }
}

fn buffer(p: &Platform) -> Arc<GraphicsAllocation> {
    p.device
        .memory_manager()
        .allocate_graphics_memory_with_properties(&AllocationProperties::new(
            0,
            4096,
            AllocationType::Buffer,
        ))
        .unwrap()
}

fn handle_of(allocation: &GraphicsAllocation) -> u32 {
    allocation.wddm_allocation().unwrap().handle()
}

#[test]
fn allocations_are_made_resident_once_per_context() {
    let gdi = MockGdi::new();
    let mut p = platform(&gdi, without_direct_submission());
    let mut work = Workload::new(p.device.memory_manager());
    let engine = p.device.engine_mut(EngineType::Rcs).unwrap();
    let fence_va = engine
        .os_context
        .windows()
        .unwrap()
        .residency_controller()
        .monitored_fence()
        .gpu_address();
    let csr = &mut engine.csr;

    work.flush(csr, &DispatchFlags::default()).unwrap();
    work.flush(csr, &DispatchFlags::default()).unwrap();

    let calls = gdi.calls();
    assert_eq!(calls.make_resident.len(), 1);
    let (handles, cant_trim_further) = &calls.make_resident[0];
    assert_eq!(handles.len(), 6);
    assert!(!cant_trim_further);

    let fences: Vec<(u64, u64)> = calls
        .submits
        .iter()
        .map(|s| (s.header.monitor_fence_va, s.header.monitor_fence_value))
        .collect();
    assert_eq!(fences, vec![(fence_va, 1), (fence_va, 2)]);
}

#[test]
fn flush_stamp_wait_skips_the_kernel_once_signalled() {
    let gdi = MockGdi::new();
    let mut p = platform(&gdi, without_direct_submission());
    let mut work = Workload::new(p.device.memory_manager());
    let csr = &mut p.device.engine_mut(EngineType::Rcs).unwrap().csr;

    let stamp = work.flush(csr, &DispatchFlags::default()).unwrap();
    csr.wait_for_flush_stamp(stamp.flush_stamp).unwrap();
    assert!(gdi.calls().waits.is_empty());

    csr.wait_for_flush_stamp(stamp.flush_stamp + 1).unwrap();
    let waits = gdi.calls().waits.clone();
    assert_eq!(waits.len(), 1);
    assert_eq!(waits[0].1, stamp.flush_stamp + 1);
}

#[test]
fn residency_failure_retries_once_then_reports_out_of_memory() {
    let gdi = MockGdi::new();
    let mut p = platform(&gdi, without_direct_submission());
    let mut work = Workload::new(p.device.memory_manager());
    gdi.script_make_resident(&[(NtStatus::NO_MEMORY, 0), (NtStatus::NO_MEMORY, 0)]);

    let engine = p.device.engine_mut(EngineType::Rcs).unwrap();
    let err = work.flush(&mut engine.csr, &DispatchFlags::default()).unwrap_err();
    assert!(matches!(err, NeoError::OutOfMemory));

    let calls = gdi.calls();
    let attempts: Vec<bool> = calls.make_resident.iter().map(|(_, cant)| *cant).collect();
    assert_eq!(attempts, vec![false, true]);
    assert!(calls.evict.is_empty());
    assert!(calls.submits.is_empty());
    drop(calls);

    assert!(
        engine
            .os_context
            .windows()
            .unwrap()
            .residency_controller()
            .is_memory_budget_exhausted()
    );
}

#[test]
fn residency_retry_evicts_temporary_resources() {
    let gdi = MockGdi::new();
    let mut p = platform(&gdi, without_direct_submission());
    let mut work = Workload::new(p.device.memory_manager());
    let temporary = buffer(&p);
    p.wddm
        .temporary_resources()
        .make_resident_resource(handle_of(&temporary))
        .unwrap();
    gdi.script_make_resident(&[(NtStatus::NO_MEMORY, 0)]);

    let csr = &mut p.device.engine_mut(EngineType::Rcs).unwrap().csr;
    work.flush(csr, &DispatchFlags::default()).unwrap();

    let calls = gdi.calls();
    // Temporary resource, failed attempt, retry.
    assert_eq!(calls.make_resident.len(), 3);
    assert_eq!(calls.evict, vec![vec![handle_of(&temporary)]]);
    assert_eq!(calls.submits.len(), 1);
    drop(calls);
    assert!(p.wddm.temporary_resources().is_empty());
}

#[test]
fn persistent_residency_failure_evicts_temporary_resources_once() {
    let gdi = MockGdi::new();
    let mut p = platform(&gdi, without_direct_submission());
    let mut work = Workload::new(p.device.memory_manager());
    let temporary = buffer(&p);
    p.wddm
        .temporary_resources()
        .make_resident_resource(handle_of(&temporary))
        .unwrap();
    gdi.script_make_resident(&[(NtStatus::NO_MEMORY, 0), (NtStatus::NO_MEMORY, 0)]);

    let csr = &mut p.device.engine_mut(EngineType::Rcs).unwrap().csr;
    let err = work.flush(csr, &DispatchFlags::default()).unwrap_err();
    assert!(matches!(err, NeoError::OutOfMemory));

    let calls = gdi.calls();
    let (first, task_attempts) = calls.make_resident.split_first().unwrap();
    assert_eq!(first.0, vec![handle_of(&temporary)]);
    let cant_trim: Vec<bool> = task_attempts.iter().map(|(_, cant)| *cant).collect();
    assert_eq!(cant_trim, vec![false, true]);
    assert_eq!(calls.evict, vec![vec![handle_of(&temporary)]]);
    assert!(calls.submits.is_empty());
}

#[test]
fn freeing_a_trim_candidate_destroys_its_allocation() {
    let gdi = MockGdi::new();
    let mut p = platform(&gdi, without_direct_submission());
    let mut work = Workload::new(p.device.memory_manager());
    let extra = buffer(&p);
    let handle = handle_of(&extra);
    let engine = p.device.engine_mut(EngineType::Rcs).unwrap();
    let os_context = Arc::clone(&engine.os_context);
    let csr = &mut engine.csr;

    csr.make_resident(&extra);
    work.flush(csr, &DispatchFlags::default()).unwrap();
    csr.make_non_resident(&extra);
    work.flush(csr, &DispatchFlags::default()).unwrap();
    let controller = os_context.windows().unwrap().residency_controller();
    assert!(controller.is_in_trim_candidate_list(&extra));

    p.device.memory_manager().free_graphics_memory(extra);

    assert_eq!(controller.lock().trim_candidates_count(), 0);
    assert!(gdi.calls().destroyed.contains(&handle));
    // A later trim has nothing left to evict.
    let periodic = TrimFlags {
        periodic_trim: true,
        trim_to_budget: false,
    };
    controller.trim_residency(periodic, 0);
    controller.trim_residency(periodic, 0);
    assert!(gdi.calls().evict.is_empty());
}

#[test]
fn released_allocation_is_trimmed_after_its_fence_completes() {
    let gdi = MockGdi::new();
    let mut p = platform(&gdi, without_direct_submission());
    let mut work = Workload::new(p.device.memory_manager());
    let extra = buffer(&p);
    let engine = p.device.engine_mut(EngineType::Rcs).unwrap();
    let os_context = Arc::clone(&engine.os_context);
    let csr = &mut engine.csr;

    csr.make_resident(&extra);
    work.flush(csr, &DispatchFlags::default()).unwrap();
    csr.make_non_resident(&extra);
    work.flush(csr, &DispatchFlags::default()).unwrap();

    let controller = os_context.windows().unwrap().residency_controller();
    assert!(controller.is_in_trim_candidate_list(&extra));

    let periodic = TrimFlags {
        periodic_trim: true,
        trim_to_budget: false,
    };
    // The first pass only records how far the GPU got.
    assert!(controller.trim_residency(periodic, 0));
    assert!(gdi.calls().evict.is_empty());

    assert!(controller.trim_residency(periodic, 0));
    assert_eq!(gdi.calls().evict, vec![vec![handle_of(&extra)]]);
    assert!(!controller.is_in_trim_candidate_list(&extra));
}

#[test]
fn direct_submission_keeps_the_ring_running() {
    let gdi = MockGdi::new();
    let mut p = platform(&gdi, DebugSettings::default());
    let mut work = Workload::new(p.device.memory_manager());
    // Each engine starts its ring once during creation.
    assert_eq!(gdi.calls().submits.len(), 2);

    let engine = p.device.engine_mut(EngineType::Rcs).unwrap();
    assert!(engine.os_context.is_direct_submission_active());
    let csr = &mut engine.csr;
    work.flush(csr, &DispatchFlags::default()).unwrap();
    let last = work.flush(csr, &DispatchFlags::default()).unwrap();
    assert_eq!(gdi.calls().submits.len(), 2);

    let ds = csr.direct_submission().unwrap();
    assert_eq!(ds.queue_work_count(), 2);
    let fence_handle = ds.completion_fence().fence_handle();

    csr.wait_for_flush_stamp(last.flush_stamp).unwrap();
    let waits = gdi.calls().waits.clone();
    assert_eq!(waits, vec![(fence_handle as u32, last.flush_stamp)]);
}
