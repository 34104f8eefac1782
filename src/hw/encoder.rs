//! MI command encoding shared by all supported generations.
//!
//! Only the commands the submission core emits are encoded here. Layouts follow the
//! Gen9+ MI instruction formats; per-generation differences are expressed through the
//! few hooks on [`HardwareOps`].

#![allow(clippy::cast_possible_truncation)]

use crate::command_stream::linear_stream::LinearStream;
use crate::hw::{EngineType, GfxCoreFamily, HardwareInfo, PreemptionMode};
use std::fmt;

// ============================================================================
// Opcodes
// ============================================================================

pub const MI_NOOP: u32 = 0;
pub const MI_BATCH_BUFFER_END: u32 = 0x0A << 23;
/// `MI_BATCH_BUFFER_START` with PPGTT address space, 3 dwords.
pub const MI_BATCH_BUFFER_START: u32 = (0x31 << 23) | (1 << 8) | 1;
/// `MI_SEMAPHORE_WAIT` polling mode, `SAD_GREATER_THAN_OR_EQUAL_SDD`, 4 dwords.
pub const MI_SEMAPHORE_WAIT: u32 = (0x1C << 23) | (1 << 15) | 2;
/// `MI_STORE_DATA_IMM` with a qword payload, 5 dwords.
pub const MI_STORE_DATA_IMM_QWORD: u32 = (0x20 << 23) | (1 << 21) | 3;
/// `MI_LOAD_REGISTER_IMM` of one register, 3 dwords.
pub const MI_LOAD_REGISTER_IMM: u32 = (0x22 << 23) | 1;
/// `PIPE_CONTROL`, 6 dwords.
pub const PIPE_CONTROL: u32 = (3 << 29) | (3 << 27) | (2 << 24) | 4;
/// `PIPELINE_SELECT` with the pipeline-selection mask bits set.
pub const PIPELINE_SELECT: u32 = (3 << 29) | (1 << 27) | (1 << 24) | (4 << 16) | (3 << 8);
/// `STATE_BASE_ADDRESS` header for the compact layout emitted by [`GenericHwOps`].
pub const STATE_BASE_ADDRESS: u32 = (3 << 29) | (1 << 24) | (1 << 16) | 6;

pub const PIPE_CONTROL_DC_FLUSH: u32 = 1 << 5;
pub const PIPE_CONTROL_POST_SYNC_WRITE_IMMEDIATE: u32 = 1 << 14;
pub const PIPE_CONTROL_CS_STALL: u32 = 1 << 20;

pub const PIPELINE_SELECT_GPGPU: u32 = 2;
pub const PIPELINE_SELECT_MEDIA_SAMPLER_DOP_CLOCK_GATE_DISABLE: u32 = 1 << 4;
pub const PIPELINE_SELECT_MEDIA_SAMPLER_MASK: u32 = 1 << 12;

pub const CS_CHICKEN1_REGISTER: u32 = 0x2580;
pub const GEN12_AUX_TABLE_BASE_LOW: u32 = 0x4200;
pub const GEN12_AUX_TABLE_BASE_HIGH: u32 = 0x4204;

const BASE_ADDRESS_MODIFY_ENABLE: u32 = 1;

/// GPU base addresses of the indirect heaps programmed by `STATE_BASE_ADDRESS`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapBases {
    pub dynamic_state: u64,
    pub indirect_object: u64,
    pub surface_state: u64,
    pub instruction: u64,
}

/// Per-generation encoding and policy capability consulted by the CSR.
///
/// One instance per [`GfxCoreFamily`] lives in the registry; the CSR holds it behind an
/// `Arc<dyn HardwareOps>` chosen once at device creation.
pub trait HardwareOps: Send + Sync + fmt::Debug {
    fn family(&self) -> GfxCoreFamily;

    /// Engines the device exposes for this hardware configuration.
    fn engine_types(&self, hw_info: &HardwareInfo) -> Vec<EngineType>;

    fn is_direct_submission_supported(&self) -> bool;

    fn l3_config(&self, hw_info: &HardwareInfo, use_slm: bool) -> u32;

    /// Whether `STATE_BASE_ADDRESS` must be preceded by a stalling `PIPE_CONTROL`.
    fn requires_pipe_control_before_state_base_address(&self) -> bool;

    fn l3_config_register(&self) -> u32;

    fn pipe_control_size(&self) -> usize {
        24
    }

    /// Extra bytes a workaround adds around a post-sync `PIPE_CONTROL`.
    fn wa_size(&self) -> usize {
        0
    }

    fn batch_buffer_start_size(&self) -> usize {
        12
    }

    fn batch_buffer_end_size(&self) -> usize {
        4
    }

    fn semaphore_wait_size(&self) -> usize {
        16
    }

    fn store_data_imm_size(&self) -> usize {
        20
    }

    fn load_register_imm_size(&self) -> usize {
        12
    }

    fn state_base_address_size(&self) -> usize {
        32
    }

    fn preamble_size(&self) -> usize {
        self.pipeline_select_size() + 2 * self.load_register_imm_size()
    }

    fn pipeline_select_size(&self) -> usize {
        4
    }

    fn encode_noop(&self, stream: &mut LinearStream, bytes: usize) {
        let dwords = bytes / 4;
        for _ in 0..dwords {
            stream.write_dword(MI_NOOP);
        }
    }

    fn encode_batch_buffer_start(&self, stream: &mut LinearStream, gpu_address: u64) {
        stream.write_dwords(&[
            MI_BATCH_BUFFER_START,
            gpu_address as u32,
            (gpu_address >> 32) as u32,
        ]);
    }

    fn encode_batch_buffer_end(&self, stream: &mut LinearStream) {
        stream.write_dword(MI_BATCH_BUFFER_END);
    }

    fn encode_semaphore_wait(&self, stream: &mut LinearStream, gpu_address: u64, value: u32) {
        stream.write_dwords(&[
            MI_SEMAPHORE_WAIT,
            value,
            gpu_address as u32,
            (gpu_address >> 32) as u32,
        ]);
    }

    fn encode_store_data_imm(&self, stream: &mut LinearStream, gpu_address: u64, value: u64) {
        stream.write_dwords(&[
            MI_STORE_DATA_IMM_QWORD,
            gpu_address as u32,
            (gpu_address >> 32) as u32,
            value as u32,
            (value >> 32) as u32,
        ]);
    }

    fn encode_load_register_imm(&self, stream: &mut LinearStream, register: u32, value: u32) {
        stream.write_dwords(&[MI_LOAD_REGISTER_IMM, register, value]);
    }

    /// Stalling `PIPE_CONTROL` that writes `value` to `gpu_address` once prior work retires.
    fn encode_pipe_control_with_post_sync(
        &self,
        stream: &mut LinearStream,
        gpu_address: u64,
        value: u64,
        dc_flush: bool,
    ) {
        let mut flags = PIPE_CONTROL_CS_STALL | PIPE_CONTROL_POST_SYNC_WRITE_IMMEDIATE;
        if dc_flush {
            flags |= PIPE_CONTROL_DC_FLUSH;
        }
        stream.write_dwords(&[
            PIPE_CONTROL,
            flags,
            gpu_address as u32,
            (gpu_address >> 32) as u32,
            value as u32,
            (value >> 32) as u32,
        ]);
    }

    fn encode_stalling_pipe_control(&self, stream: &mut LinearStream) {
        stream.write_dwords(&[PIPE_CONTROL, PIPE_CONTROL_CS_STALL, 0, 0, 0, 0]);
    }

    fn encode_pipeline_select(&self, stream: &mut LinearStream, media_sampler_required: bool) {
        let mut dword = PIPELINE_SELECT | PIPELINE_SELECT_GPGPU;
        dword |= PIPELINE_SELECT_MEDIA_SAMPLER_MASK;
        if !media_sampler_required {
            dword |= PIPELINE_SELECT_MEDIA_SAMPLER_DOP_CLOCK_GATE_DISABLE;
        }
        stream.write_dword(dword);
    }

    fn encode_preemption(&self, stream: &mut LinearStream, mode: PreemptionMode) {
        let bits = match mode {
            PreemptionMode::MidThread => 0,
            PreemptionMode::ThreadGroup => 1 << 1,
            PreemptionMode::MidBatch | PreemptionMode::Disabled => 1 << 2,
        };
        self.encode_load_register_imm(stream, CS_CHICKEN1_REGISTER, (0x0006 << 16) | bits);
    }

    /// Pipeline selection, L3 configuration and preemption setup sent once per context.
    fn encode_preamble(
        &self,
        stream: &mut LinearStream,
        hw_info: &HardwareInfo,
        engine: EngineType,
        preemption: PreemptionMode,
    ) {
        if !engine.is_copy() {
            self.encode_pipeline_select(stream, false);
        }
        self.encode_load_register_imm(
            stream,
            self.l3_config_register(),
            self.l3_config(hw_info, false),
        );
        self.encode_preemption(stream, preemption);
    }

    fn encode_state_base_address(&self, stream: &mut LinearStream, bases: &HeapBases) {
        let mut dwords = [0u32; 8];
        dwords[0] = STATE_BASE_ADDRESS;
        for (i, base) in [
            bases.dynamic_state,
            bases.indirect_object,
            bases.surface_state,
        ]
        .into_iter()
        .enumerate()
        {
            let value = base | u64::from(BASE_ADDRESS_MODIFY_ENABLE);
            dwords[1 + 2 * i] = value as u32;
            dwords[2 + 2 * i] = (value >> 32) as u32;
        }
        dwords[7] = (bases.instruction as u32) | BASE_ADDRESS_MODIFY_ENABLE;
        stream.write_dwords(&dwords);
    }
}

/// Table-driven [`HardwareOps`] covering the generations the core supports.
#[derive(Debug, Clone)]
pub struct GenericHwOps {
    family: GfxCoreFamily,
    l3_config_register: u32,
    l3_config_default: u32,
    l3_config_slm: u32,
    direct_submission: bool,
    sba_pipe_control_wa: bool,
}

impl GenericHwOps {
    #[must_use]
    pub const fn for_family(family: GfxCoreFamily) -> Self {
        match family {
            GfxCoreFamily::Gen9 => Self {
                family,
                l3_config_register: 0x7034,
                l3_config_default: 0x8000_0340,
                l3_config_slm: 0x6000_0321,
                direct_submission: false,
                sba_pipe_control_wa: true,
            },
            GfxCoreFamily::Gen11 => Self {
                family,
                l3_config_register: 0x7034,
                l3_config_default: 0x8000_0340,
                l3_config_slm: 0x6000_0321,
                direct_submission: false,
                sba_pipe_control_wa: false,
            },
            GfxCoreFamily::Gen12Lp => Self {
                family,
                l3_config_register: 0xB134,
                l3_config_default: 0xD000_0020,
                l3_config_slm: 0xD000_0020,
                direct_submission: true,
                sba_pipe_control_wa: false,
            },
            GfxCoreFamily::XeHpCore => Self {
                family,
                l3_config_register: 0xB134,
                l3_config_default: 0x0000_0000,
                l3_config_slm: 0x0000_0000,
                direct_submission: true,
                sba_pipe_control_wa: false,
            },
        }
    }
}

impl HardwareOps for GenericHwOps {
    fn family(&self) -> GfxCoreFamily {
        self.family
    }

    fn engine_types(&self, hw_info: &HardwareInfo) -> Vec<EngineType> {
        let mut engines = vec![EngineType::Rcs];
        if hw_info.blitter_supported {
            engines.push(EngineType::Bcs);
        }
        for i in 0..hw_info.ccs_count.min(4) {
            engines.push(EngineType::Ccs(i as u8));
        }
        engines
    }

    fn is_direct_submission_supported(&self) -> bool {
        self.direct_submission
    }

    fn l3_config(&self, _hw_info: &HardwareInfo, use_slm: bool) -> u32 {
        if use_slm {
            self.l3_config_slm
        } else {
            self.l3_config_default
        }
    }

    fn requires_pipe_control_before_state_base_address(&self) -> bool {
        self.sba_pipe_control_wa
    }

    fn l3_config_register(&self) -> u32 {
        self.l3_config_register
    }

    fn wa_size(&self) -> usize {
        if self.sba_pipe_control_wa {
            self.pipe_control_size()
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{AllocationType, GraphicsAllocation};

    fn stream() -> LinearStream {
        let allocation = GraphicsAllocation::new_host_backed(AllocationType::CommandBuffer, 4096, 0x1_0000)
            .expect("host allocation");
        LinearStream::new(allocation.into())
    }

    fn dwords(stream: &LinearStream) -> Vec<u32> {
        stream
            .used_bytes()
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn batch_buffer_start_splits_address() {
        let ops = GenericHwOps::for_family(GfxCoreFamily::Gen12Lp);
        let mut s = stream();
        ops.encode_batch_buffer_start(&mut s, 0x1_2345_6780);
        assert_eq!(dwords(&s), vec![0x1880_0101, 0x2345_6780, 0x1]);
        assert_eq!(s.used(), ops.batch_buffer_start_size());
    }

    #[test]
    fn encoded_sizes_match_reported_sizes() {
        let ops = GenericHwOps::for_family(GfxCoreFamily::Gen9);
        let mut s = stream();
        ops.encode_pipe_control_with_post_sync(&mut s, 0x1000, 7, true);
        assert_eq!(s.used(), ops.pipe_control_size());

        let before = s.used();
        ops.encode_semaphore_wait(&mut s, 0x2000, 3);
        assert_eq!(s.used() - before, ops.semaphore_wait_size());

        let before = s.used();
        ops.encode_store_data_imm(&mut s, 0x2000, 3);
        assert_eq!(s.used() - before, ops.store_data_imm_size());

        let before = s.used();
        ops.encode_state_base_address(&mut s, &HeapBases::default());
        assert_eq!(s.used() - before, ops.state_base_address_size());

        let before = s.used();
        let hw_info = HardwareInfo::gen12lp();
        ops.encode_preamble(&mut s, &hw_info, EngineType::Rcs, PreemptionMode::MidThread);
        assert_eq!(s.used() - before, ops.preamble_size());
    }

    #[test]
    fn post_sync_pipe_control_carries_value() {
        let ops = GenericHwOps::for_family(GfxCoreFamily::XeHpCore);
        let mut s = stream();
        ops.encode_pipe_control_with_post_sync(&mut s, 0xAABB_0000, 0x1_0000_0002, false);
        let d = dwords(&s);
        assert_eq!(d[0], PIPE_CONTROL);
        assert_eq!(d[1] & PIPE_CONTROL_DC_FLUSH, 0);
        assert_ne!(d[1] & PIPE_CONTROL_POST_SYNC_WRITE_IMMEDIATE, 0);
        assert_eq!((d[2], d[3]), (0xAABB_0000, 0));
        assert_eq!((d[4], d[5]), (2, 1));
    }

    #[test]
    fn engine_list_follows_topology() {
        let ops = GenericHwOps::for_family(GfxCoreFamily::XeHpCore);
        let engines = ops.engine_types(&HardwareInfo::xe_hp());
        assert_eq!(engines.len(), 6);
        assert_eq!(engines[0], EngineType::Rcs);
        assert!(engines.contains(&EngineType::Ccs(3)));
    }

    #[test]
    fn only_gen9_needs_state_base_address_workaround() {
        assert!(GenericHwOps::for_family(GfxCoreFamily::Gen9).requires_pipe_control_before_state_base_address());
        assert_eq!(GenericHwOps::for_family(GfxCoreFamily::Gen12Lp).wa_size(), 0);
    }
}
