#![allow(clippy::cast_possible_truncation)]

//! Aux translation table for compressed allocations.
//!
//! The table contents are produced by the resource-layout service; this type tracks
//! which GPU ranges are mapped and programs the table base into the engine.

use crate::command_stream::linear_stream::LinearStream;
use crate::error::{NeoError, NeoResult};
use crate::hw::HardwareOps;
use crate::hw::encoder::{GEN12_AUX_TABLE_BASE_HIGH, GEN12_AUX_TABLE_BASE_LOW};
use crate::memory::GraphicsAllocation;
use crate::utils::{MEMORY_PAGE_SIZE_64K, align_up};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::trace;

const AUX_GRANULARITY: u64 = MEMORY_PAGE_SIZE_64K as u64;

#[derive(Debug)]
pub struct PageTableManager {
    table: Arc<GraphicsAllocation>,
    // start -> end (exclusive), granularity aligned
    mappings: Mutex<BTreeMap<u64, u64>>,
}

impl PageTableManager {
    #[must_use]
    pub fn new(table: Arc<GraphicsAllocation>) -> Self {
        Self {
            table,
            mappings: Mutex::new(BTreeMap::new()),
        }
    }

    #[must_use]
    pub fn table_gpu_address(&self) -> u64 {
        self.table.gpu_address()
    }

    #[must_use]
    pub fn table_allocation(&self) -> &Arc<GraphicsAllocation> {
        &self.table
    }

    pub(crate) fn into_table(self) -> Arc<GraphicsAllocation> {
        self.table
    }

    /// Maps or unmaps `[gpu_address, gpu_address + size)` in the aux table.
    ///
    /// # Errors
    /// Mapping a range that overlaps an existing mapping, or unmapping a range that
    /// was never mapped, is rejected.
    pub fn update_aux_table(&self, gpu_address: u64, size: usize, map: bool) -> NeoResult<()> {
        let start = gpu_address & !(AUX_GRANULARITY - 1);
        let end = align_up(gpu_address + size as u64, AUX_GRANULARITY);
        let mut mappings = self.mappings.lock().unwrap_or_else(PoisonError::into_inner);

        if map {
            let overlaps = mappings
                .range(..end)
                .next_back()
                .is_some_and(|(_, &e)| e > start);
            if overlaps {
                return Err(NeoError::General(format!(
                    "aux range {start:#x}..{end:#x} already mapped"
                )));
            }
            mappings.insert(start, end);
        } else if mappings.remove(&start).is_none() {
            return Err(NeoError::General(format!("aux range {start:#x} not mapped")));
        }
        trace!(map, start = format_args!("{start:#x}"), end = format_args!("{end:#x}"), "aux table update");
        Ok(())
    }

    #[must_use]
    pub fn is_mapped(&self, gpu_address: u64) -> bool {
        self.mappings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .range(..=gpu_address)
            .next_back()
            .is_some_and(|(_, &end)| gpu_address < end)
    }

    /// Points the engine's aux table registers at this table.
    pub fn encode_table_base(&self, hw_ops: &dyn HardwareOps, stream: &mut LinearStream) {
        let base = self.table_gpu_address();
        hw_ops.encode_load_register_imm(stream, GEN12_AUX_TABLE_BASE_LOW, base as u32);
        hw_ops.encode_load_register_imm(stream, GEN12_AUX_TABLE_BASE_HIGH, (base >> 32) as u32);
    }

    #[must_use]
    pub fn table_base_size(hw_ops: &dyn HardwareOps) -> usize {
        2 * hw_ops.load_register_imm_size()
    }
}
