use crate::instruction::Instruction;
use crate::mem::AddressSpace;
use crate::wavefront::Wavefront;
use crate::work_group::WorkGroup;
use crate::WAVEFRONT_SIZE;
use std::collections::VecDeque;
use std::sync::Arc;

/// A compiled kernel as the timing simulator sees it: an annotated
/// instruction stream plus an optional second entry point used by the
/// initial-PC mix policy.
#[derive(Debug)]
pub struct Kernel {
    pub name: String,
    pub instructions: Vec<Instruction>,
    pub second_entry: Option<usize>,
}

impl Kernel {
    #[must_use]
    pub fn new(name: impl Into<String>, instructions: Vec<Instruction>) -> Self {
        Self {
            name: name.into(),
            instructions,
            second_entry: None,
        }
    }

    #[must_use]
    pub fn with_second_entry(mut self, pc: usize) -> Self {
        assert!(pc < self.instructions.len());
        self.second_entry = Some(pc);
        self
    }
}

/// Resource requirements of one work-group of a dispatch.
#[derive(Clone, Copy, Debug)]
pub struct ResourceDemand {
    /// Work items per work-group (the flattened local size).
    pub work_items_per_work_group: usize,
    pub vector_registers_per_work_item: usize,
    pub scalar_registers_per_wavefront: usize,
    pub local_memory_per_work_group: usize,
}

/// A dispatched kernel launch.
///
/// Owns the not-yet-mapped work groups; they move into compute-unit slots
/// as resources free up and the ND-range is finished when the last one
/// completes.
#[derive(Debug)]
pub struct NDRange {
    pub id: usize,
    pub kernel: Arc<Kernel>,
    pub demand: ResourceDemand,
    pub address_space: AddressSpace,

    pub pending_work_groups: VecDeque<WorkGroup>,
    /// Work groups mapped to a compute unit and not yet unmapped.
    pub work_groups_in_flight: usize,
    pub total_wavefronts: u64,
}

impl NDRange {
    /// Build an ND-range of `num_work_groups` work groups.
    ///
    /// Wavefront identifiers are assigned contiguously across the whole
    /// dispatch; the issue arbiter relies on them being comparable.
    #[must_use]
    pub fn new(
        id: usize,
        kernel: Arc<Kernel>,
        num_work_groups: usize,
        demand: ResourceDemand,
        address_space: AddressSpace,
    ) -> Self {
        let wavefronts_per_work_group = demand.work_items_per_work_group.div_ceil(WAVEFRONT_SIZE);
        let mut pending_work_groups = VecDeque::with_capacity(num_work_groups);
        let mut next_wavefront_id = 0;
        for wg_id in 0..num_work_groups {
            let mut wavefronts = Vec::with_capacity(wavefronts_per_work_group);
            let mut remaining = demand.work_items_per_work_group;
            for _ in 0..wavefronts_per_work_group {
                let work_items = remaining.min(WAVEFRONT_SIZE);
                wavefronts.push(Wavefront::new(next_wavefront_id, Arc::clone(&kernel), work_items));
                next_wavefront_id += 1;
                remaining -= work_items;
            }
            pending_work_groups.push_back(WorkGroup::new(wg_id, id, wavefronts));
        }
        Self {
            id,
            kernel,
            demand,
            address_space,
            pending_work_groups,
            work_groups_in_flight: 0,
            total_wavefronts: next_wavefront_id as u64,
        }
    }

    #[must_use]
    pub fn wavefronts_per_work_group(&self) -> usize {
        self.demand.work_items_per_work_group.div_ceil(WAVEFRONT_SIZE)
    }

    /// All work groups mapped and completed.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.pending_work_groups.is_empty() && self.work_groups_in_flight == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::Instruction;
    use crate::mem::Mmu;

    fn demand(work_items: usize) -> ResourceDemand {
        ResourceDemand {
            work_items_per_work_group: work_items,
            vector_registers_per_work_item: 16,
            scalar_registers_per_wavefront: 32,
            local_memory_per_work_group: 0,
        }
    }

    #[test]
    fn wavefront_ids_are_contiguous() {
        let kernel = Arc::new(Kernel::new("k", vec![Instruction::s_endpgm()]));
        let mut mmu = Mmu::new();
        let ndrange = NDRange::new(0, kernel, 3, demand(128), mmu.new_address_space());
        assert_eq!(ndrange.wavefronts_per_work_group(), 2);
        assert_eq!(ndrange.total_wavefronts, 6);
        let ids: Vec<_> = ndrange
            .pending_work_groups
            .iter()
            .flat_map(|wg| wg.wavefronts.iter().map(|wf| wf.id))
            .collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn trailing_wavefront_is_partial() {
        let kernel = Arc::new(Kernel::new("k", vec![Instruction::s_endpgm()]));
        let mut mmu = Mmu::new();
        let ndrange = NDRange::new(0, kernel, 1, demand(100), mmu.new_address_space());
        let wg = &ndrange.pending_work_groups[0];
        assert_eq!(wg.wavefronts.len(), 2);
        assert_eq!(wg.wavefronts[0].active_mask.count_ones(), 64);
        assert_eq!(wg.wavefronts[1].active_mask.count_ones(), 36);
    }
}
