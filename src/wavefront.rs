use crate::instruction::Instruction;
use crate::kernel::Kernel;
use crate::uop::{ActiveMask, LdsAccess};
use crate::{address, WAVEFRONT_SIZE};
use bitvec::array::BitArray;
use smallvec::SmallVec;
use std::sync::Arc;

/// One work item of a wavefront.
///
/// Holds the memory-access descriptors produced by the last executed
/// instruction; the fetch stage snapshots them into the uop.
#[derive(Clone, Debug, Default)]
pub struct WorkItem {
    pub id_in_wavefront: usize,
    pub global_memory_access_address: address,
    pub global_memory_access_size: u32,
    pub lds_accesses: SmallVec<[LdsAccess; 2]>,
}

/// A wavefront: a fixed-size batch of work items advancing in lock-step.
///
/// The functional emulator is driven through [`Wavefront::execute`], which
/// consumes the next instruction of the kernel stream and publishes its
/// side-effect summary on the wavefront. Everything else in this struct is
/// observable state for the timing core.
#[derive(Clone, Debug)]
pub struct Wavefront {
    /// Global wavefront identifier within the ND-range.
    pub id: usize,
    /// Identifier within the compute unit, assigned at work-group map time.
    pub id_in_compute_unit: usize,
    pub pc: usize,
    pub finished: bool,

    kernel: Arc<Kernel>,
    /// Instruction produced by the last `execute()` call.
    pub instruction: Option<Instruction>,

    // Side-effect summary of the last executed instruction.
    pub vector_memory_read: bool,
    pub vector_memory_write: bool,
    pub vector_memory_atomic: bool,
    pub vector_memory_global_coherency: bool,
    pub scalar_memory_read: bool,
    pub lds_read: bool,
    pub lds_write: bool,
    pub memory_wait: bool,
    pub barrier_instruction: bool,

    /// Address of the scalar memory access, one per wavefront.
    pub scalar_memory_access_address: address,

    pub active_mask: ActiveMask,
    pub work_items: Vec<WorkItem>,

    uop_id_counter: u64,
    /// Location of the pool entry this wavefront occupies while mapped:
    /// `(wavefront_pool_id, entry_index)`.
    pub pool_entry: Option<(usize, usize)>,
}

impl Wavefront {
    #[must_use]
    pub fn new(id: usize, kernel: Arc<Kernel>, num_work_items: usize) -> Self {
        assert!(
            num_work_items > 0 && num_work_items <= WAVEFRONT_SIZE,
            "wavefront holds 1..={WAVEFRONT_SIZE} work items"
        );
        let mut active_mask: ActiveMask = BitArray::ZERO;
        for lane in 0..num_work_items {
            active_mask.set(lane, true);
        }
        let work_items = (0..num_work_items)
            .map(|i| WorkItem {
                id_in_wavefront: i,
                ..WorkItem::default()
            })
            .collect();
        Self {
            id,
            id_in_compute_unit: usize::MAX,
            pc: 0,
            finished: false,
            kernel,
            instruction: None,
            vector_memory_read: false,
            vector_memory_write: false,
            vector_memory_atomic: false,
            vector_memory_global_coherency: false,
            scalar_memory_read: false,
            lds_read: false,
            lds_write: false,
            memory_wait: false,
            barrier_instruction: false,
            scalar_memory_access_address: 0,
            active_mask,
            work_items,
            uop_id_counter: 0,
            pool_entry: None,
        }
    }

    /// Sequential identifier for the next uop fetched from this wavefront.
    pub fn next_uop_id(&mut self) -> u64 {
        self.uop_id_counter += 1;
        self.uop_id_counter
    }

    #[must_use]
    pub fn is_work_item_active(&self, lane: usize) -> bool {
        self.active_mask[lane]
    }

    fn clear_side_effects(&mut self) {
        self.vector_memory_read = false;
        self.vector_memory_write = false;
        self.vector_memory_atomic = false;
        self.vector_memory_global_coherency = false;
        self.scalar_memory_read = false;
        self.lds_read = false;
        self.lds_write = false;
        self.memory_wait = false;
        self.barrier_instruction = false;
        for work_item in &mut self.work_items {
            work_item.lds_accesses.clear();
        }
    }

    /// Advance the wavefront by one instruction.
    ///
    /// Updates `pc`, `finished`, the current instruction and the
    /// side-effect summary, and refreshes every active work item's memory
    /// access descriptors.
    pub fn execute(&mut self) {
        assert!(!self.finished, "execute called on a finished wavefront");
        let instr = self.kernel.instructions[self.pc].clone();
        self.pc += 1;
        self.clear_side_effects();

        match instr.format {
            crate::instruction::Format::Smrd => {
                self.scalar_memory_read = true;
                let access = instr
                    .glbl_access
                    .expect("scalar memory instruction carries an access pattern");
                self.scalar_memory_access_address = access.base;
            }
            format if format.is_vector_memory() => {
                self.vector_memory_read = !instr.is_store && !instr.is_atomic;
                self.vector_memory_write = instr.is_store;
                self.vector_memory_atomic = instr.is_atomic;
                self.vector_memory_global_coherency = instr.global_coherency;
                let access = instr
                    .glbl_access
                    .expect("vector memory instruction carries an access pattern");
                for work_item in &mut self.work_items {
                    work_item.global_memory_access_address =
                        access.address_for_lane(work_item.id_in_wavefront);
                    work_item.global_memory_access_size = access.size;
                }
            }
            crate::instruction::Format::Ds => {
                let (kind, access) = instr
                    .lds_access
                    .expect("data-share instruction carries an access pattern");
                match kind {
                    crate::instruction::LdsAccessKind::Read => self.lds_read = true,
                    crate::instruction::LdsAccessKind::Write => self.lds_write = true,
                }
                for work_item in &mut self.work_items {
                    work_item.lds_accesses.push(LdsAccess {
                        kind,
                        addr: access.address_for_lane(work_item.id_in_wavefront),
                        size: access.size,
                    });
                }
            }
            _ => {
                if instr.is_endpgm() {
                    self.finished = true;
                } else if instr.is_barrier() {
                    self.barrier_instruction = true;
                } else if instr.is_memory_wait() {
                    self.memory_wait = true;
                }
            }
        }

        // A stream that runs off its end behaves like an end-of-program.
        if self.pc >= self.kernel.instructions.len() {
            self.finished = true;
        }
        self.instruction = Some(instr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::Instruction;
    use crate::kernel::Kernel;

    fn kernel(instructions: Vec<Instruction>) -> Arc<Kernel> {
        Arc::new(Kernel::new("test", instructions))
    }

    #[test]
    fn executes_to_end_of_program() {
        let kernel = kernel(vec![
            Instruction::vector_alu("v_add_f32"),
            Instruction::s_endpgm(),
        ]);
        let mut wavefront = Wavefront::new(0, kernel, 64);
        wavefront.execute();
        assert!(!wavefront.finished);
        assert_eq!(wavefront.pc, 1);
        wavefront.execute();
        assert!(wavefront.finished);
    }

    #[test]
    fn vector_memory_descriptors() {
        let kernel = kernel(vec![
            Instruction::buffer_load(0x4000, 4, 4),
            Instruction::s_endpgm(),
        ]);
        let mut wavefront = Wavefront::new(0, kernel, 64);
        wavefront.execute();
        assert!(wavefront.vector_memory_read);
        assert!(!wavefront.vector_memory_write);
        assert_eq!(wavefront.work_items[0].global_memory_access_address, 0x4000);
        assert_eq!(wavefront.work_items[63].global_memory_access_address, 0x40fc);
    }

    #[test]
    fn lds_descriptors() {
        let kernel = kernel(vec![Instruction::ds_write(0x100, 4), Instruction::s_endpgm()]);
        let mut wavefront = Wavefront::new(0, kernel, 16);
        wavefront.execute();
        assert!(wavefront.lds_write);
        assert!(!wavefront.lds_read);
        assert_eq!(wavefront.work_items.len(), 16);
        assert_eq!(wavefront.work_items[3].lds_accesses.len(), 1);
        assert_eq!(wavefront.work_items[3].lds_accesses[0].addr, 0x10c);
    }

    #[test]
    fn waitcnt_and_barrier_flags() {
        let kernel = kernel(vec![
            Instruction::s_waitcnt(),
            Instruction::s_barrier(),
            Instruction::s_endpgm(),
        ]);
        let mut wavefront = Wavefront::new(0, kernel, 64);
        wavefront.execute();
        assert!(wavefront.memory_wait);
        wavefront.execute();
        assert!(wavefront.barrier_instruction);
        assert!(!wavefront.memory_wait);
    }

    #[test]
    fn partial_wavefront_mask() {
        let kernel = kernel(vec![Instruction::s_endpgm()]);
        let wavefront = Wavefront::new(0, kernel, 10);
        assert_eq!(wavefront.active_mask.count_ones(), 10);
        assert!(wavefront.is_work_item_active(9));
        assert!(!wavefront.is_work_item_active(10));
    }
}
