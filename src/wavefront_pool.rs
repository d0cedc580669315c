use crate::work_group::WorkGroup;

/// Location of a resident wavefront: work-group slot in the compute unit
/// plus index of the wavefront inside the work group.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WavefrontRef {
    pub work_group_slot: usize,
    pub wavefront_index: usize,
}

/// One slot of a wavefront pool.
///
/// A wavefront is fetch-eligible iff `ready` is set and none of
/// `wavefront_finished`, `wait_for_barrier` or an unsatisfied `mem_wait`
/// holds it back.
#[derive(Debug, Default)]
pub struct WavefrontPoolEntry {
    pub wavefront: Option<WavefrontRef>,

    pub ready: bool,
    /// Promoted to `ready` at the start of the next fetch, without
    /// consuming fetch width.
    pub ready_next_cycle: bool,
    pub wavefront_finished: bool,
    pub wait_for_barrier: bool,
    /// Raised by a wait instruction; cleared once all memory counters
    /// drain to zero.
    pub mem_wait: bool,

    /// Outstanding LDS, scalar-memory and non-vector memory accesses.
    pub lgkm_cnt: u32,
    /// Outstanding vector-memory accesses.
    pub vm_cnt: u32,
    /// Outstanding export accesses.
    pub exp_cnt: u32,
}

impl WavefrontPoolEntry {
    #[must_use]
    pub fn memory_counters_drained(&self) -> bool {
        self.lgkm_cnt == 0 && self.vm_cnt == 0 && self.exp_cnt == 0
    }

    fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Reservation station of resident wavefronts feeding one SIMD lane plus
/// the shared scalar, branch, LDS and vector-memory units.
#[derive(Debug)]
pub struct WavefrontPool {
    pub id: usize,
    pub entries: Vec<WavefrontPoolEntry>,
    num_wavefronts: usize,
}

impl WavefrontPool {
    #[must_use]
    pub fn new(id: usize, max_wavefronts: usize) -> Self {
        let entries = (0..max_wavefronts).map(|_| WavefrontPoolEntry::default()).collect();
        Self {
            id,
            entries,
            num_wavefronts: 0,
        }
    }

    #[must_use]
    pub fn num_wavefronts(&self) -> usize {
        self.num_wavefronts
    }

    /// Place every wavefront of `work_group` into a free entry.
    ///
    /// The caller guarantees the pool has room; running out of entries here
    /// means the resource calculation admitted too many work groups.
    pub fn map_wavefronts(&mut self, work_group_slot: usize, work_group: &mut WorkGroup) {
        for (wavefront_index, wavefront) in work_group.wavefronts.iter_mut().enumerate() {
            let (entry_index, entry) = self
                .entries
                .iter_mut()
                .enumerate()
                .find(|(_, entry)| entry.wavefront.is_none())
                .expect("wavefront pool has a free entry for every mapped wavefront");
            entry.clear();
            entry.wavefront = Some(WavefrontRef {
                work_group_slot,
                wavefront_index,
            });
            entry.ready = true;
            wavefront.pool_entry = Some((self.id, entry_index));
            self.num_wavefronts += 1;
        }
    }

    /// Release the entries of every wavefront of `work_group`.
    pub fn unmap_wavefronts(&mut self, work_group: &mut WorkGroup) {
        for wavefront in &mut work_group.wavefronts {
            let (pool_id, entry_index) = wavefront
                .pool_entry
                .take()
                .expect("unmapping a wavefront that is not resident");
            assert_eq!(pool_id, self.id, "wavefront resident in a different pool");
            let entry = &mut self.entries[entry_index];
            assert!(
                entry.memory_counters_drained(),
                "unmapping wavefront {} with outstanding memory accesses",
                wavefront.id
            );
            entry.clear();
            self.num_wavefronts -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::Instruction;
    use crate::kernel::Kernel;
    use crate::wavefront::Wavefront;
    use std::sync::Arc;

    fn work_group(num_wavefronts: usize) -> WorkGroup {
        let kernel = Arc::new(Kernel::new("k", vec![Instruction::s_endpgm()]));
        let wavefronts = (0..num_wavefronts)
            .map(|i| Wavefront::new(i, Arc::clone(&kernel), 64))
            .collect();
        WorkGroup::new(0, 0, wavefronts)
    }

    #[test]
    fn map_then_unmap_round_trip() {
        let mut pool = WavefrontPool::new(0, 4);
        let mut wg = work_group(3);
        pool.map_wavefronts(5, &mut wg);
        assert_eq!(pool.num_wavefronts(), 3);
        assert_eq!(wg.wavefronts[2].pool_entry, Some((0, 2)));
        assert!(pool.entries[0].ready);
        assert_eq!(
            pool.entries[1].wavefront,
            Some(WavefrontRef {
                work_group_slot: 5,
                wavefront_index: 1
            })
        );

        pool.unmap_wavefronts(&mut wg);
        assert_eq!(pool.num_wavefronts(), 0);
        assert!(pool.entries.iter().all(|e| e.wavefront.is_none()));
        assert!(wg.wavefronts.iter().all(|wf| wf.pool_entry.is_none()));
    }

    #[test]
    fn mapping_reuses_freed_entries() {
        let mut pool = WavefrontPool::new(0, 2);
        let mut first = work_group(2);
        pool.map_wavefronts(0, &mut first);
        pool.unmap_wavefronts(&mut first);
        let mut second = work_group(2);
        pool.map_wavefronts(1, &mut second);
        assert_eq!(pool.num_wavefronts(), 2);
    }

    #[test]
    fn eligibility_counters() {
        let mut entry = WavefrontPoolEntry::default();
        assert!(entry.memory_counters_drained());
        entry.lgkm_cnt += 1;
        assert!(!entry.memory_counters_drained());
        entry.lgkm_cnt -= 1;
        entry.vm_cnt += 1;
        assert!(!entry.memory_counters_drained());
    }
}
