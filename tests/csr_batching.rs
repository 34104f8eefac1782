mod common;

use common::{MockGdi, Recorded, RecordingBackend, Workload, host_memory_manager};
use neo_rs::NeoError;
use neo_rs::command_stream::csr::CsrParams;
use neo_rs::command_stream::{
    CommandStreamReceiver, DispatchFlags, DispatchMode, SubmissionBackend, WaitStatus,
};
use neo_rs::hw::encoder::{MI_BATCH_BUFFER_END, MI_BATCH_BUFFER_START};
use neo_rs::hw::{
    EngineDescriptor, EngineType, EngineUsage, GenericHwOps, GfxCoreFamily, HardwareInfo,
    HardwareOps, PreemptionMode,
};
use neo_rs::memory::{AllocationProperties, AllocationType, MemoryManager};
use neo_rs::os_interface::windows::Wddm;
use neo_rs::os_interface::{DeviceBitfield, OsContext, OsInterface};
use neo_rs::settings::DebugSettings;
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct Harness {
    csr: CommandStreamReceiver,
    work: Workload,
    recorded: Arc<Mutex<Recorded>>,
    memory_manager: Arc<MemoryManager>,
}

fn harness(mode: DispatchMode, hang: bool) -> Harness {
    let settings = DebugSettings::default();
    let wddm = Wddm::new(MockGdi::new(), 1, HardwareInfo::gen12lp(), &settings);
    let memory_manager = host_memory_manager();
    let os_context = OsContext::create(
        &OsInterface::Wddm(wddm),
        memory_manager.create_os_context_id(),
        0,
        DeviceBitfield::single(),
        EngineDescriptor::new(EngineType::Rcs, EngineUsage::Regular),
        PreemptionMode::MidThread,
    )
    .unwrap();

    let mut params = CsrParams::new(
        Arc::clone(&os_context),
        Arc::clone(&memory_manager),
        Arc::new(GenericHwOps::for_family(GfxCoreFamily::Gen12Lp)),
        HardwareInfo::gen12lp(),
        &settings,
    );
    params.dispatch_mode = mode;
    params.spin_wait = Duration::ZERO;

    let recorded = Arc::new(Mutex::new(Recorded::default()));
    let backend_record = Arc::clone(&recorded);
    let csr = CommandStreamReceiver::new(params, move |tag, _| {
        Ok(Box::new(RecordingBackend {
            os_context,
            tag,
            hang,
            recorded: backend_record,
        }) as Box<dyn SubmissionBackend>)
    })
    .unwrap();

    Harness {
        csr,
        work: Workload::new(&memory_manager),
        recorded,
        memory_manager,
    }
}

fn dword_at(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

#[test]
fn batched_tasks_go_out_as_one_chained_submission() {
    let mut h = harness(DispatchMode::BatchedDispatch, false);
    let flags = DispatchFlags::default();
    let hw = GenericHwOps::for_family(GfxCoreFamily::Gen12Lp);

    let first_start = h.work.stream.used();
    for expected in 1..=3 {
        let stamp = h.work.flush(&mut h.csr, &flags).unwrap();
        assert_eq!(stamp.task_count, expected);
    }
    // 4 dwords of payload, then the tag write, then the chainable end.
    let first_end = first_start + 16 + hw.pipe_control_size();
    assert_eq!(dword_at(h.work.stream.used_bytes(), first_end), MI_BATCH_BUFFER_END);
    assert!(h.recorded.lock().unwrap().execs.is_empty());
    assert_eq!(h.csr.pending_batched_buffers(), 3);
    assert_eq!(h.csr.latest_flushed_task_count(), 0);

    h.csr.flush_batched_submissions().unwrap();

    let csr_base = h.csr.command_stream().gpu_base();
    {
        let recorded = h.recorded.lock().unwrap();
        assert_eq!(recorded.execs, vec![(csr_base, 3)]);
        assert_eq!(recorded.resident.len(), 1);
        // tag, caller stream, three heaps and the CSR stream; shared by all three tasks.
        assert_eq!(recorded.resident[0].len(), 6);
    }
    assert_eq!(dword_at(h.work.stream.used_bytes(), first_end), MI_BATCH_BUFFER_START);
    assert_eq!(h.csr.pending_batched_buffers(), 0);
    assert_eq!(h.csr.latest_flushed_task_count(), 3);
    assert_eq!(h.csr.wait_for_task_count(3).unwrap(), WaitStatus::Ready);
}

#[test]
fn waiting_on_a_queued_task_flushes_the_batch() {
    let mut h = harness(DispatchMode::BatchedDispatch, false);
    let flags = DispatchFlags::default();
    h.work.flush(&mut h.csr, &flags).unwrap();
    h.work.flush(&mut h.csr, &flags).unwrap();

    assert_eq!(h.csr.wait_for_task_count(2).unwrap(), WaitStatus::Ready);
    assert_eq!(h.recorded.lock().unwrap().execs.len(), 1);
    assert_eq!(h.csr.tag_address().value(), 2);
}

#[test]
fn blocking_task_in_batched_mode_flushes_and_waits() {
    let mut h = harness(DispatchMode::BatchedDispatch, false);
    h.work.flush(&mut h.csr, &DispatchFlags::default()).unwrap();
    let blocking = DispatchFlags {
        blocking: true,
        ..Default::default()
    };
    let stamp = h.work.flush(&mut h.csr, &blocking).unwrap();

    assert_eq!(stamp.task_count, 2);
    let recorded = h.recorded.lock().unwrap();
    assert_eq!(recorded.execs.len(), 1);
    assert_eq!(recorded.execs[0].1, 2);
    // The tag was already written, so no OS wait was needed.
    assert!(recorded.waits.is_empty());
}

#[test]
fn residency_budget_limits_aggregation() {
    let mut h = harness(DispatchMode::BatchedDispatch, false);
    let flags = DispatchFlags::default();
    for _ in 0..3 {
        h.work.flush(&mut h.csr, &flags).unwrap();
    }

    h.csr.flush_batched_submissions_with_budget(0).unwrap();

    let counts: Vec<_> = h.recorded.lock().unwrap().execs.iter().map(|e| e.1).collect();
    assert_eq!(counts, vec![1, 2, 3]);
}

#[test]
fn incompatible_tasks_are_not_chained() {
    let mut h = harness(DispatchMode::BatchedDispatch, false);
    h.work.flush(&mut h.csr, &DispatchFlags::default()).unwrap();
    let low = DispatchFlags {
        low_priority: true,
        ..Default::default()
    };
    h.work.flush(&mut h.csr, &low).unwrap();
    h.work.flush(&mut h.csr, &low).unwrap();

    h.csr.flush_batched_submissions().unwrap();

    let counts: Vec<_> = h.recorded.lock().unwrap().execs.iter().map(|e| e.1).collect();
    assert_eq!(counts, vec![1, 3]);
}

#[test]
fn blocking_task_on_hung_gpu_reports_hang() {
    let mut h = harness(DispatchMode::ImmediateDispatch, true);
    let blocking = DispatchFlags {
        blocking: true,
        ..Default::default()
    };

    let err = h.work.flush(&mut h.csr, &blocking).unwrap_err();

    assert!(matches!(err, NeoError::GpuHang));
    assert_eq!(h.recorded.lock().unwrap().waits, vec![1]);
    assert_eq!(h.csr.wait_for_task_count(1).unwrap(), WaitStatus::GpuHang);
}

#[test]
fn evictions_are_applied_after_the_next_submission() {
    let mut h = harness(DispatchMode::ImmediateDispatch, false);
    let flags = DispatchFlags::default();
    let extra = h
        .memory_manager
        .allocate_graphics_memory_with_properties(&AllocationProperties::new(
            0,
            4096,
            AllocationType::Buffer,
        ))
        .unwrap();

    h.csr.make_resident(&extra);
    h.work.flush(&mut h.csr, &flags).unwrap();
    assert!(h.recorded.lock().unwrap().resident[0].contains(&extra.id()));

    h.csr.make_non_resident(&extra);
    assert_eq!(h.csr.eviction_allocations().len(), 1);
    assert!(h.recorded.lock().unwrap().evicted.is_empty());

    h.work.flush(&mut h.csr, &flags).unwrap();

    let recorded = h.recorded.lock().unwrap();
    assert_eq!(recorded.evicted, vec![vec![extra.id()]]);
    assert!(!recorded.resident[1].contains(&extra.id()));
    drop(recorded);
    assert!(h.csr.eviction_allocations().is_empty());
    h.memory_manager.free_graphics_memory(extra);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn task_counts_stay_monotonic(
        tasks in prop::collection::vec((any::<bool>(), any::<bool>()), 1..12),
    ) {
        let mut h = harness(DispatchMode::BatchedDispatch, false);

        for (i, (blocking, low_priority)) in tasks.iter().copied().enumerate() {
            let flags = DispatchFlags { blocking, low_priority, ..Default::default() };
            let stamp = h.work.flush(&mut h.csr, &flags).unwrap();

            prop_assert_eq!(stamp.task_count as usize, i + 1);
            prop_assert!(h.csr.latest_flushed_task_count() <= h.csr.peek_task_count());
            if blocking {
                prop_assert!(h.csr.tag_address().value() >= u64::from(stamp.task_count));
            }
        }

        let last = h.csr.peek_task_count();
        prop_assert_eq!(h.csr.wait_for_task_count(last).unwrap(), WaitStatus::Ready);
        h.csr.flush_batched_submissions().unwrap();
        prop_assert_eq!(h.csr.pending_batched_buffers(), 0);

        let counts: Vec<_> = h.recorded.lock().unwrap().execs.iter().map(|e| e.1).collect();
        prop_assert!(counts.windows(2).all(|w| w[0] < w[1]));
        prop_assert_eq!(counts.last().copied(), Some(last));
    }

    #[test]
    fn repeated_make_resident_lists_once(repeats in 1usize..6) {
        let mut h = harness(DispatchMode::ImmediateDispatch, false);
        let extra = h
            .memory_manager
            .allocate_graphics_memory_with_properties(&AllocationProperties::new(
                0,
                4096,
                AllocationType::Buffer,
            ))
            .unwrap();
        for _ in 0..repeats {
            h.csr.make_resident(&extra);
        }
        prop_assert_eq!(h.csr.residency_allocations().len(), 1);

        h.work.flush(&mut h.csr, &DispatchFlags::default()).unwrap();

        let listed = h.recorded.lock().unwrap().resident[0]
            .iter()
            .filter(|id| **id == extra.id())
            .count();
        prop_assert_eq!(listed, 1);
        h.memory_manager.free_graphics_memory(extra);
    }
}
