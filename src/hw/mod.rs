//! Hardware description and per-generation command encoding policy.

pub mod encoder;
pub mod registry;

pub use encoder::{GenericHwOps, HardwareOps, HeapBases};
pub use registry::{HwOpsRegistry, hw_ops_for, hw_ops_registry};

/// GPU core generation. Selects the [`HardwareOps`] implementation at device creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GfxCoreFamily {
    Gen9,
    Gen11,
    Gen12Lp,
    XeHpCore,
}

/// Static description of one root device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardwareInfo {
    pub family: GfxCoreFamily,
    pub device_id: u16,
    pub revision: u16,
    pub slice_count: u32,
    pub subslice_count: u32,
    pub eu_count: u32,
    pub ccs_count: u32,
    pub blitter_supported: bool,
    pub compression_supported: bool,
    pub local_memory_supported: bool,
    /// Number of tiles; 1 means no sub-devices.
    pub sub_device_count: u32,
    pub default_preemption_mode: PreemptionMode,
}

impl HardwareInfo {
    #[must_use]
    pub const fn gen12lp() -> Self {
        Self {
            family: GfxCoreFamily::Gen12Lp,
            device_id: 0x9a49,
            revision: 1,
            slice_count: 1,
            subslice_count: 6,
            eu_count: 96,
            ccs_count: 0,
            blitter_supported: true,
            compression_supported: true,
            local_memory_supported: false,
            sub_device_count: 1,
            default_preemption_mode: PreemptionMode::MidThread,
        }
    }

    #[must_use]
    pub const fn xe_hp() -> Self {
        Self {
            family: GfxCoreFamily::XeHpCore,
            device_id: 0x0201,
            revision: 4,
            slice_count: 8,
            subslice_count: 32,
            eu_count: 512,
            ccs_count: 4,
            blitter_supported: true,
            compression_supported: true,
            local_memory_supported: true,
            sub_device_count: 2,
            default_preemption_mode: PreemptionMode::ThreadGroup,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineType {
    /// Render command streamer.
    Rcs,
    /// Blitter (copy) command streamer.
    Bcs,
    /// Compute command streamer with instance index.
    Ccs(u8),
    Vcs,
    Vecs,
}

impl EngineType {
    /// Bit used by engine masks in debug settings.
    #[must_use]
    pub const fn bit(self) -> u32 {
        match self {
            Self::Rcs => 1 << 0,
            Self::Bcs => 1 << 1,
            Self::Ccs(i) => 1 << (2 + (i as u32 & 0x3)),
            Self::Vcs => 1 << 6,
            Self::Vecs => 1 << 7,
        }
    }

    #[must_use]
    pub const fn is_copy(self) -> bool {
        matches!(self, Self::Bcs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineUsage {
    Regular,
    LowPriority,
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineDescriptor {
    pub engine_type: EngineType,
    pub usage: EngineUsage,
}

impl EngineDescriptor {
    #[must_use]
    pub const fn new(engine_type: EngineType, usage: EngineUsage) -> Self {
        Self { engine_type, usage }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PreemptionMode {
    Disabled,
    MidBatch,
    ThreadGroup,
    MidThread,
}

/// Hint from the queue about how much of the GPU it may occupy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum QueueThrottle {
    Low,
    #[default]
    Medium,
    High,
}
