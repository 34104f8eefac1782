use neo_rs::drm::DrmFile;
use neo_rs::execution_environment::{ExecutionEnvironment, RootDeviceEnvironment};
use neo_rs::hw::{EngineType, HardwareInfo};
use neo_rs::os_interface::linux::Drm;
use neo_rs::settings::DebugSettings;
use neo_rs::NeoResult;
use std::sync::Arc;

fn main() -> NeoResult<()> {
    println!("--- i915 Render Node Probe ---");

    let device = match DrmFile::open_first_render_node() {
        Ok(device) => device,
        Err(e) => {
            eprintln!("No usable render node (is i915 loaded?): {e}");
            return Err(e.into());
        }
    };

    let settings = DebugSettings::from_env();
    let drm = Drm::new(Arc::new(device), HardwareInfo::gen12lp(), &settings)?;

    println!("Chipset ID:        {:#06x}", drm.chipset_id());
    println!("VM bind:           {}", drm.is_vm_bind_available());
    println!("Per-context VMs:   {}", drm.is_per_context_vm_required());
    match drm.read_gpu_timestamp() {
        Ok(ts) => println!("GPU timestamp:     {ts:#x}"),
        Err(e) => println!("GPU timestamp:     unavailable ({e})"),
    }

    let mut environment = ExecutionEnvironment::new(settings);
    let index = environment.add_root_device_environment(RootDeviceEnvironment::from_drm(drm)?);
    environment.initialize_memory_manager()?;
    let mut root_device = environment.create_root_device(index)?;

    println!("\n--- Engines ---");
    for engine in root_device.engines() {
        let csr = &engine.csr;
        println!(
            "  - {:<10?} context {:>2} | dispatch {:?} | direct submission {}",
            engine.engine_type(),
            csr.context_id(),
            csr.dispatch_mode(),
            csr.direct_submission().is_some()
        );
    }

    if let Some(engine) = root_device.engine_mut(EngineType::Rcs) {
        let csr = &mut engine.csr;
        let task_count = csr.peek_task_count();
        let status = csr.wait_for_task_count(task_count)?;
        println!("\nInitial wait on render engine: {status:?}");
    }

    drop(root_device);
    Ok(())
}
