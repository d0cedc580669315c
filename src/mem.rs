use crate::{address, Cycle};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Completion witness of in-flight memory accesses.
///
/// A unit arms the witness once per submitted access; the owning memory
/// module disarms it when the access completes. The pipeline write stage
/// holds a uop until its witness has fully drained.
#[derive(Clone, Debug, Default)]
pub struct Witness(Arc<AtomicU32>);

impl Witness {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn disarm(&self) {
        let prev = self.0.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "memory witness disarmed below zero");
    }

    #[must_use]
    pub fn outstanding(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn pending(&self) -> bool {
        self.outstanding() > 0
    }
}

/// Kind of module access.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AccessKind {
    Load,
    Store,
    /// Non-coherent store (bypasses global coherency traffic).
    NCStore,
}

/// Memory module consumed by the timing core.
///
/// The core treats every access as fire-and-forget: the module arms the
/// witness at submission and disarms it asynchronously on completion.
pub trait MemoryModule {
    /// Whether the module can accept an access to `addr` this cycle.
    fn can_access(&self, addr: address) -> bool;

    /// Submit an access. Must only be called when [`can_access`] holds.
    ///
    /// [`can_access`]: MemoryModule::can_access
    fn access(&mut self, kind: AccessKind, addr: address, witness: &Witness);
}

/// Fixed-latency memory module with a bounded number of concurrent accesses.
///
/// Stands in for the scalar cache, the vector cache and the LDS module. A
/// real cache hierarchy would give variable completion times; the interface
/// is identical either way.
#[derive(Debug)]
pub struct LatencyModule {
    pub name: String,
    latency: Cycle,
    max_inflight: usize,
    cycle: Cycle,
    in_flight: Vec<(Cycle, Witness)>,
}

impl LatencyModule {
    #[must_use]
    pub fn new(name: impl Into<String>, latency: Cycle, max_inflight: usize) -> Self {
        Self {
            name: name.into(),
            latency,
            max_inflight,
            cycle: 0,
            in_flight: Vec::new(),
        }
    }

    /// Complete all accesses due at `cycle`, disarming their witnesses.
    pub fn tick(&mut self, cycle: Cycle) {
        self.cycle = cycle;
        self.in_flight.retain(|(ready, witness)| {
            if *ready <= cycle {
                witness.disarm();
                false
            } else {
                true
            }
        });
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

impl MemoryModule for LatencyModule {
    fn can_access(&self, _addr: address) -> bool {
        self.in_flight.len() < self.max_inflight
    }

    fn access(&mut self, kind: AccessKind, addr: address, witness: &Witness) {
        log::trace!(
            "{}: submit {:?} addr={:#x} ready at {}",
            self.name,
            kind,
            addr,
            self.cycle + self.latency
        );
        witness.arm();
        self.in_flight.push((self.cycle + self.latency, witness.clone()));
    }
}

/// Opaque handle of one virtual address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AddressSpace(pub usize);

/// Memory-management unit.
///
/// Translation is a pure function of the address space and the virtual
/// address; each address space maps onto a disjoint physical window.
#[derive(Debug, Default)]
pub struct Mmu {
    num_address_spaces: usize,
}

impl Mmu {
    // 4 GiB physical window per address space
    const SPACE_SHIFT: u32 = 32;

    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_address_space(&mut self) -> AddressSpace {
        let space = AddressSpace(self.num_address_spaces);
        self.num_address_spaces += 1;
        space
    }

    #[must_use]
    pub fn translate(&self, space: AddressSpace, vaddr: address) -> address {
        ((space.0 as address) << Self::SPACE_SHIFT) | (vaddr & ((1 << Self::SPACE_SHIFT) - 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn witness_arm_disarm() {
        let witness = Witness::new();
        assert!(!witness.pending());
        witness.arm();
        witness.arm();
        assert_eq!(witness.outstanding(), 2);
        witness.disarm();
        witness.disarm();
        assert!(!witness.pending());
    }

    #[test]
    #[should_panic(expected = "below zero")]
    fn witness_underflow_panics() {
        Witness::new().disarm();
    }

    #[test]
    fn module_completes_after_latency() {
        let mut module = LatencyModule::new("L1V", 4, 2);
        let witness = Witness::new();
        module.tick(10);
        module.access(AccessKind::Load, 0x100, &witness);
        assert!(witness.pending());
        module.tick(13);
        assert!(witness.pending());
        module.tick(14);
        assert!(!witness.pending());
        assert_eq!(module.in_flight(), 0);
    }

    #[test]
    fn module_admission_bound() {
        let mut module = LatencyModule::new("L1V", 10, 2);
        let witness = Witness::new();
        module.tick(0);
        module.access(AccessKind::Load, 0, &witness);
        module.access(AccessKind::Store, 4, &witness);
        assert!(!module.can_access(8));
        module.tick(10);
        assert!(module.can_access(8));
    }

    #[test]
    fn mmu_translation_is_disjoint() {
        let mut mmu = Mmu::new();
        let a = mmu.new_address_space();
        let b = mmu.new_address_space();
        assert_ne!(mmu.translate(a, 0x1000), mmu.translate(b, 0x1000));
        assert_eq!(mmu.translate(a, 0x1000), mmu.translate(a, 0x1000));
    }
}
