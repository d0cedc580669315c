use crate::compute_unit::ComputeUnit;
use crate::config::{Config, RegisterAllocationGranularity};
use crate::kernel::{NDRange, ResourceDemand};
use crate::mem::{LatencyModule, Mmu};
use crate::stats::{CycleEvent, CycleStats, StatsFile};
use crate::{Cycle, WAVEFRONT_SIZE};
use console::style;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

/// Errors surfaced by [`Gpu::map_ndrange`].
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum DispatchError {
    /// A compute unit limits the number of wavefronts, the number of
    /// registers and the amount of local memory; the work-group size
    /// exceeds at least one of these limits.
    #[error("work-group resources cannot be allocated to a compute unit")]
    InsufficientResources,
    #[error("work-group limit {requested} exceeds the hardware limit of {hardware} per compute unit")]
    WorkGroupLimitExceeded { requested: usize, hardware: usize },
    #[error("an ND-range is already mapped to the device")]
    DeviceBusy,
}

/// Ordered list of compute units with a free work-group slot.
#[derive(Debug)]
pub struct AvailableUnits {
    order: VecDeque<usize>,
    member: Vec<bool>,
}

impl AvailableUnits {
    fn new(num_units: usize) -> Self {
        Self {
            order: (0..num_units).collect(),
            member: vec![true; num_units],
        }
    }

    pub fn insert(&mut self, unit: usize) {
        if !self.member[unit] {
            self.member[unit] = true;
            self.order.push_back(unit);
        }
    }

    pub fn remove(&mut self, unit: usize) {
        if self.member[unit] {
            self.member[unit] = false;
            self.order.retain(|&i| i != unit);
        }
    }

    #[must_use]
    pub fn front(&self) -> Option<usize> {
        self.order.front().copied()
    }

    #[must_use]
    pub fn contains(&self, unit: usize) -> bool {
        self.member[unit]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Per-compute-unit cache models, shared-side.
#[derive(Debug)]
pub struct MemorySystem {
    pub scalar: Vec<LatencyModule>,
    pub vector: Vec<LatencyModule>,
}

impl MemorySystem {
    fn tick(&mut self, cycle: Cycle) {
        for module in self.scalar.iter_mut().chain(self.vector.iter_mut()) {
            module.tick(cycle);
        }
    }
}

/// Device-level scheduling state mutated by the compute units while they
/// run: the available list, the mapped ND-range and the global completion
/// counters.
#[derive(Debug)]
pub struct SchedulerState {
    pub available: AvailableUnits,
    pub ndrange: Option<NDRange>,
    pub work_groups_per_compute_unit: usize,
    pub wavefronts_per_compute_unit: usize,
    pub completed_wavefronts: u64,
    pub last_complete_cycle: Cycle,
    pub rng: SmallRng,

    statistics_level: u8,
    ndrange_stats: HashMap<usize, CycleStats>,
    ndrange_file: Option<StatsFile>,
}

impl SchedulerState {
    #[must_use]
    pub fn second_entry(&self) -> Option<usize> {
        self.ndrange.as_ref().and_then(|ndrange| ndrange.kernel.second_entry)
    }

    pub fn ndrange_event(&mut self, ndrange_id: usize, cycle: Cycle, event: CycleEvent) {
        if let Some(stats) = self.ndrange_stats.get_mut(&ndrange_id) {
            stats.set_cycle(cycle, event);
        }
    }

    pub fn work_group_unmapped(&mut self) {
        let ndrange = self
            .ndrange
            .as_mut()
            .expect("work group unmapped without a mapped ND-range");
        assert!(ndrange.work_groups_in_flight > 0);
        ndrange.work_groups_in_flight -= 1;
    }
}

/// All state the compute units share while running a cycle.
#[derive(Debug)]
pub struct GpuShared {
    pub mmu: Mmu,
    pub mem: MemorySystem,
    pub sched: SchedulerState,
}

/// A Southern Islands GPU device: a fleet of compute units advanced in
/// lock-step, one cycle at a time.
#[derive(Debug)]
pub struct Gpu {
    config: Arc<Config>,
    pub compute_units: Vec<ComputeUnit>,
    pub shared: GpuShared,
}

impl Gpu {
    pub fn new(config: Arc<Config>) -> std::io::Result<Self> {
        let uop_uid = Arc::new(AtomicU64::new(0));
        let compute_units = (0..config.num_compute_units)
            .map(|i| ComputeUnit::new(i, Arc::clone(&config), Arc::clone(&uop_uid)))
            .collect::<std::io::Result<Vec<_>>>()?;

        let mem = MemorySystem {
            scalar: (0..config.num_compute_units)
                .map(|i| {
                    LatencyModule::new(
                        format!("ScalarL1[{i}]"),
                        config.scalar_cache_latency,
                        usize::MAX,
                    )
                })
                .collect(),
            vector: (0..config.num_compute_units)
                .map(|i| {
                    LatencyModule::new(
                        format!("VectorL1[{i}]"),
                        config.vector_cache_latency,
                        config.vector_cache_max_inflight,
                    )
                })
                .collect(),
        };

        let ndrange_file = if config.statistics_level >= 1 {
            Some(StatsFile::create(
                &config.stats_dir,
                "cu_all.ndrange",
                "ndrange_id,len_map,clk_map,clk_unmap,len_uop,clk_uop_begin,clk_uop_end",
            )?)
        } else {
            None
        };

        let sched = SchedulerState {
            available: AvailableUnits::new(config.num_compute_units),
            ndrange: None,
            work_groups_per_compute_unit: 0,
            wavefronts_per_compute_unit: 0,
            completed_wavefronts: 0,
            last_complete_cycle: 0,
            rng: SmallRng::seed_from_u64(config.rng_seed),
            statistics_level: config.statistics_level,
            ndrange_stats: HashMap::new(),
            ndrange_file,
        };

        Ok(Self {
            config,
            compute_units,
            shared: GpuShared {
                mmu: Mmu::new(),
                mem,
                sched,
            },
        })
    }

    #[must_use]
    pub fn mmu_mut(&mut self) -> &mut Mmu {
        &mut self.shared.mmu
    }

    /// Map an ND-range onto the device, computing the per-work-group
    /// resource limits first.
    pub fn map_ndrange(&mut self, ndrange: NDRange, cycle: Cycle) -> Result<(), DispatchError> {
        if self.shared.sched.ndrange.is_some() {
            return Err(DispatchError::DeviceBusy);
        }

        let work_groups_per_pool = work_groups_per_wavefront_pool(&self.config, &ndrange.demand);
        if work_groups_per_pool == 0 {
            return Err(DispatchError::InsufficientResources);
        }

        let mut work_groups_per_compute_unit =
            work_groups_per_pool * self.config.num_wavefront_pools;
        log::debug!(
            "hardware limit: {work_groups_per_pool} work groups per pool, {work_groups_per_compute_unit} per compute unit"
        );
        if let Some(limit) = self.config.work_group_limit {
            if limit > work_groups_per_compute_unit {
                return Err(DispatchError::WorkGroupLimitExceeded {
                    requested: limit,
                    hardware: work_groups_per_compute_unit,
                });
            }
            work_groups_per_compute_unit = limit;
            log::debug!("manual limit: {work_groups_per_compute_unit} work groups per compute unit");
        }

        let sched = &mut self.shared.sched;
        sched.work_groups_per_compute_unit = work_groups_per_compute_unit;
        sched.wavefronts_per_compute_unit =
            work_groups_per_compute_unit * ndrange.wavefronts_per_work_group();

        if sched.statistics_level >= 1 {
            let mut stats = CycleStats::default();
            stats.set_cycle(cycle, CycleEvent::Mapped);
            sched.ndrange_stats.insert(ndrange.id, stats);
        }

        log::debug!(
            "{}",
            style(format!(
                "cycle {:02} mapped ND-range {} ({} work groups, {} wavefronts)",
                cycle,
                ndrange.id,
                ndrange.pending_work_groups.len(),
                ndrange.total_wavefronts
            ))
            .magenta()
        );
        sched.ndrange = Some(ndrange);
        Ok(())
    }

    /// Drop the mapped ND-range and dump its cycle statistics.
    pub fn unmap_ndrange(&mut self, cycle: Cycle) {
        let sched = &mut self.shared.sched;
        let Some(ndrange) = sched.ndrange.take() else {
            return;
        };
        if let Some(mut stats) = sched.ndrange_stats.remove(&ndrange.id) {
            stats.set_cycle(cycle, CycleEvent::Unmapped);
            if let Some(file) = &mut sched.ndrange_file {
                file.write_row(&format!("{}_{},{}", ndrange.kernel.name, ndrange.id, stats.row()));
                file.flush();
            }
        }
        log::debug!(
            "{}",
            style(format!("cycle {cycle:02} unmapped ND-range {}", ndrange.id)).magenta()
        );
    }

    /// Whether the mapped ND-range (if any) has fully completed.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.shared
            .sched
            .ndrange
            .as_ref()
            .map_or(true, |ndrange| ndrange.is_finished())
    }

    /// Advance the whole device by one cycle: complete due memory
    /// accesses, map pending work groups onto available compute units,
    /// then run every compute unit.
    pub fn run(&mut self, cycle: Cycle) {
        self.shared.mem.tick(cycle);
        for compute_unit in &mut self.compute_units {
            compute_unit.lds_module.tick(cycle);
        }

        self.map_pending_work_groups(cycle);

        let num_units = self.compute_units.len();
        if self.config.rotate_compute_units {
            let start = (cycle as usize) % num_units;
            for i in 0..num_units {
                let index = (i + start) % num_units;
                self.compute_units[index].run(&mut self.shared, cycle);
            }
        } else {
            for index in 0..num_units {
                self.compute_units[index].run(&mut self.shared, cycle);
            }
        }
    }

    fn map_pending_work_groups(&mut self, cycle: Cycle) {
        loop {
            let sched = &mut self.shared.sched;
            let Some(ndrange) = sched.ndrange.as_mut() else {
                break;
            };
            if ndrange.pending_work_groups.is_empty() {
                break;
            }
            let Some(cu_index) = sched.available.front() else {
                break;
            };

            let work_group = ndrange
                .pending_work_groups
                .pop_front()
                .expect("checked non-empty");
            ndrange.work_groups_in_flight += 1;

            self.compute_units[cu_index].map_work_group(work_group, sched, cycle);

            if self.compute_units[cu_index].num_mapped_work_groups()
                >= sched.work_groups_per_compute_unit
            {
                sched.available.remove(cu_index);
            }
        }
    }

    /// Dump all remaining statistics at the end of a run.
    pub fn flush_stats(&mut self, cycle: Cycle) {
        for compute_unit in &mut self.compute_units {
            compute_unit.flush_stats(cycle);
        }
    }
}

fn round_up(value: usize, multiple: usize) -> usize {
    if multiple == 0 {
        value
    } else {
        value.div_ceil(multiple) * multiple
    }
}

/// Work groups that fit in one wavefront pool, limited by resident
/// wavefronts, register files and local memory.
fn work_groups_per_wavefront_pool(config: &Config, demand: &ResourceDemand) -> usize {
    let wavefronts_per_work_group = demand.work_items_per_work_group.div_ceil(WAVEFRONT_SIZE);
    let limited_by_max_wavefronts = config.max_wavefronts_per_pool / wavefronts_per_work_group;

    let (vector_registers_per_work_group, scalar_registers_per_work_group) =
        match config.register_allocation_granularity {
            RegisterAllocationGranularity::Wavefront => (
                round_up(
                    demand.vector_registers_per_work_item * WAVEFRONT_SIZE,
                    config.register_allocation_size,
                ) * wavefronts_per_work_group,
                demand.scalar_registers_per_wavefront * wavefronts_per_work_group,
            ),
            RegisterAllocationGranularity::WorkGroup => (
                round_up(
                    demand.vector_registers_per_work_item * demand.work_items_per_work_group,
                    config.register_allocation_size,
                ),
                demand.scalar_registers_per_wavefront * wavefronts_per_work_group,
            ),
        };

    let limited_by_vector_registers = if vector_registers_per_work_group == 0 {
        config.max_work_groups_per_pool
    } else {
        config.num_vector_registers / vector_registers_per_work_group
    };
    let limited_by_scalar_registers = if scalar_registers_per_work_group == 0 {
        config.max_work_groups_per_pool
    } else {
        config.num_scalar_registers / scalar_registers_per_work_group
    };
    let limited_by_registers = limited_by_vector_registers.min(limited_by_scalar_registers);

    let local_memory_per_work_group =
        round_up(demand.local_memory_per_work_group, config.lds_alloc_size);
    let limited_by_local_memory = if local_memory_per_work_group == 0 {
        config.max_work_groups_per_pool
    } else {
        config.lds_size / local_memory_per_work_group
    };

    log::debug!(
        "work group fit: wavefronts={limited_by_max_wavefronts} registers={limited_by_registers} lds={limited_by_local_memory}"
    );

    config
        .max_work_groups_per_pool
        .min(limited_by_max_wavefronts)
        .min(limited_by_registers)
        .min(limited_by_local_memory)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demand(
        work_items: usize,
        vgpr: usize,
        sgpr: usize,
        local_memory: usize,
    ) -> ResourceDemand {
        ResourceDemand {
            work_items_per_work_group: work_items,
            vector_registers_per_work_item: vgpr,
            scalar_registers_per_wavefront: sgpr,
            local_memory_per_work_group: local_memory,
        }
    }

    #[test]
    fn available_units_cycle() {
        let mut available = AvailableUnits::new(3);
        assert_eq!(available.front(), Some(0));
        available.remove(0);
        assert_eq!(available.front(), Some(1));
        assert!(!available.contains(0));
        available.insert(0);
        available.insert(0);
        assert_eq!(available.len(), 3);
        assert_eq!(available.front(), Some(1));
    }

    #[test]
    fn fit_unconstrained_hits_pool_limit() {
        let config = Config::default();
        // One wavefront per work group, no registers, no local memory.
        let fit = work_groups_per_wavefront_pool(&config, &demand(64, 0, 0, 0));
        assert_eq!(fit, config.max_work_groups_per_pool);
    }

    #[test]
    fn fit_limited_by_wavefronts() {
        let config = Config::default();
        // Four wavefronts per work group, ten entries per pool.
        let fit = work_groups_per_wavefront_pool(&config, &demand(256, 0, 0, 0));
        assert_eq!(fit, 2);
    }

    #[test]
    fn fit_limited_by_vector_registers() {
        let config = Config::default();
        // 64 work items * 256 vgprs = 16384 registers per work group,
        // against a 65536-register file: 4 work groups.
        let fit = work_groups_per_wavefront_pool(&config, &demand(64, 256, 0, 0));
        assert_eq!(fit, 4);
    }

    #[test]
    fn fit_limited_by_local_memory() {
        let config = Config::default();
        // 20000 bytes round up to 20032; 65536 / 20032 = 3.
        let fit = work_groups_per_wavefront_pool(&config, &demand(64, 0, 0, 20000));
        assert_eq!(fit, 3);
    }

    #[test]
    fn fit_zero_when_over_provisioned() {
        let config = Config::default();
        // More vector registers than the whole file.
        let fit = work_groups_per_wavefront_pool(&config, &demand(64, 2048, 0, 0));
        assert_eq!(fit, 0);
    }

    #[test]
    fn granularities_differ() {
        let mut config = Config::default();
        let demand = demand(96, 10, 16, 0);
        config.register_allocation_granularity = RegisterAllocationGranularity::Wavefront;
        let per_wavefront = work_groups_per_wavefront_pool(&config, &demand);
        config.register_allocation_granularity = RegisterAllocationGranularity::WorkGroup;
        let per_work_group = work_groups_per_wavefront_pool(&config, &demand);
        // Wavefront granularity rounds each wavefront's registers up
        // separately and thus never fits more.
        assert!(per_wavefront <= per_work_group);
    }
}
