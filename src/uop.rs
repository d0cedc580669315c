use crate::instruction::{Instruction, LdsAccessKind};
use crate::mem::Witness;
use crate::{address, Cycle, WAVEFRONT_SIZE};
use bitvec::BitArr;
use smallvec::SmallVec;

/// Work-item active mask.
///
/// Bit `i` set means work item `i` participates in the current instruction.
pub type ActiveMask = BitArr!(for WAVEFRONT_SIZE, in u64);

/// Pipeline stages a uop passes through.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    Fetch = 0,
    Issue = 1,
    Decode = 2,
    Read = 3,
    Execute = 4,
    Write = 5,
}

pub const NUM_STAGES: usize = 6;

/// Cycle bookkeeping of one pipeline stage of one uop.
///
/// `begin` is when the uop became eligible for the stage, `stall` counts
/// cycles it was held back, `active` is when the stage accepted it and
/// `ready` is when the stage latency has elapsed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StageCycles {
    pub begin: Cycle,
    pub stall: Cycle,
    pub active: Cycle,
    pub ready: Cycle,
}

/// One recorded LDS transaction of a work item.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LdsAccess {
    pub kind: LdsAccessKind,
    pub addr: address,
    pub size: u32,
}

/// Memory-access descriptors of one work item, snapshotted at fetch time.
#[derive(Clone, Debug, Default)]
pub struct WorkItemInfo {
    pub global_memory_access_address: address,
    pub global_memory_access_size: u32,
    pub lds_accesses: SmallVec<[LdsAccess; 2]>,
    /// Whether this work item's vector cache access was already accepted.
    pub accessed_cache: bool,
}

/// One in-flight instruction.
///
/// Created at fetch, owned by exactly one pipeline buffer at any time,
/// destroyed when the owning unit completes it.
#[derive(Clone, Debug)]
pub struct Uop {
    /// Monotonic global identifier.
    pub id: u64,
    pub id_in_wavefront: u64,
    pub id_in_compute_unit: u64,

    pub compute_unit_index: usize,
    pub wavefront_pool_id: usize,
    pub pool_entry_index: usize,
    pub work_group_slot: usize,
    /// Global wavefront id; the issue arbiter prefers the smallest.
    pub wavefront_id: usize,
    pub wavefront_id_in_compute_unit: usize,
    pub work_group_id: usize,
    pub work_group_id_in_compute_unit: usize,
    pub ndrange_id: usize,

    pub instruction: Instruction,

    // Side-effect summary copied from the wavefront after emulation.
    pub vector_memory_read: bool,
    pub vector_memory_write: bool,
    pub vector_memory_atomic: bool,
    pub vector_memory_global_coherency: bool,
    pub scalar_memory_read: bool,
    pub lds_read: bool,
    pub lds_write: bool,
    pub wavefront_last_instruction: bool,
    pub memory_wait: bool,
    pub at_barrier: bool,

    pub cycle_start: Cycle,
    pub cycle_finish: Cycle,
    pub cycle_length: Cycle,
    pub stages: [StageCycles; NUM_STAGES],
    /// Extra stall cycles observed while fully ready in the write buffer.
    pub cycle_complete_stall: Cycle,

    pub global_memory_witness: Witness,
    pub lds_witness: Witness,
    /// Address of the scalar (SMEM) access, one per wavefront.
    pub global_memory_access_address: address,

    pub active_mask: ActiveMask,
    pub work_item_info: Vec<WorkItemInfo>,
}

impl Uop {
    #[must_use]
    pub fn stage(&self, stage: Stage) -> &StageCycles {
        &self.stages[stage as usize]
    }

    #[must_use]
    pub fn stage_mut(&mut self, stage: Stage) -> &mut StageCycles {
        &mut self.stages[stage as usize]
    }

    /// Cycle at which the named stage's latency has elapsed.
    #[must_use]
    pub fn ready(&self, stage: Stage) -> Cycle {
        self.stages[stage as usize].ready
    }

    pub fn set_ready(&mut self, stage: Stage, cycle: Cycle) {
        self.stages[stage as usize].ready = cycle;
    }

    pub fn bump_stall(&mut self, stage: Stage) {
        self.stages[stage as usize].stall += 1;
    }

    /// Record a stage acceptance: the uop became eligible at `begin` and the
    /// stage took it at `active`, finishing `latency` cycles later.
    pub fn enter_stage(&mut self, stage: Stage, begin: Cycle, active: Cycle, latency: Cycle) {
        let cycles = &mut self.stages[stage as usize];
        cycles.begin = begin;
        cycles.active = active;
        cycles.ready = active + latency;
    }

    /// Life-cycle record of a completed uop, one `|`-separated line per uop.
    ///
    /// The field order is frozen; external tooling diffs these records.
    #[must_use]
    pub fn life_cycle_record(&self, execution_unit: &str) -> String {
        use std::fmt::Write as _;
        let mut out = String::with_capacity(256);
        let _ = write!(out, "{}|{}|{}|", self.cycle_start, self.cycle_finish, self.cycle_length);
        for stage in [
            Stage::Fetch,
            Stage::Issue,
            Stage::Decode,
            Stage::Read,
            Stage::Execute,
            Stage::Write,
        ] {
            let cycles = self.stage(stage);
            let end = match stage {
                Stage::Write => self.cycle_finish,
                _ => self.stages[stage as usize + 1].begin,
            };
            let _ = write!(out, "{}|{}|{}|{}|", cycles.begin, cycles.stall, cycles.active, end);
        }
        let _ = write!(
            out,
            "{}|{}|{}|{}|{}|{}|{}|\"{}\"|\"{}\"|\"{}\"",
            self.id,
            self.id_in_compute_unit,
            self.compute_unit_index,
            self.wavefront_pool_id,
            self.wavefront_id,
            self.work_group_id,
            self.id_in_wavefront,
            execution_unit,
            self.instruction.format,
            self.instruction,
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::Instruction;
    use bitvec::array::BitArray;

    fn test_uop() -> Uop {
        Uop {
            id: 1,
            id_in_wavefront: 1,
            id_in_compute_unit: 1,
            compute_unit_index: 0,
            wavefront_pool_id: 0,
            pool_entry_index: 0,
            work_group_slot: 0,
            wavefront_id: 0,
            wavefront_id_in_compute_unit: 0,
            work_group_id: 0,
            work_group_id_in_compute_unit: 0,
            ndrange_id: 0,
            instruction: Instruction::vector_alu("v_add_f32"),
            vector_memory_read: false,
            vector_memory_write: false,
            vector_memory_atomic: false,
            vector_memory_global_coherency: false,
            scalar_memory_read: false,
            lds_read: false,
            lds_write: false,
            wavefront_last_instruction: false,
            memory_wait: false,
            at_barrier: false,
            cycle_start: 0,
            cycle_finish: 0,
            cycle_length: 0,
            stages: Default::default(),
            cycle_complete_stall: 0,
            global_memory_witness: Witness::new(),
            lds_witness: Witness::new(),
            global_memory_access_address: 0,
            active_mask: BitArray::ZERO,
            work_item_info: Vec::new(),
        }
    }

    #[test]
    fn stage_bookkeeping() {
        let mut uop = test_uop();
        uop.enter_stage(Stage::Decode, 3, 5, 2);
        assert_eq!(uop.stage(Stage::Decode).begin, 3);
        assert_eq!(uop.ready(Stage::Decode), 7);
        uop.bump_stall(Stage::Decode);
        assert_eq!(uop.stage(Stage::Decode).stall, 1);
    }

    #[test]
    fn life_cycle_record_is_stable() {
        let mut uop = test_uop();
        uop.cycle_start = 1;
        uop.cycle_finish = 12;
        uop.cycle_length = 11;
        let record = uop.life_cycle_record("simd");
        assert!(record.starts_with("1|12|11|"));
        assert!(record.ends_with("\"simd\"|\"Vop2\"|\"v_add_f32\""));
    }
}
