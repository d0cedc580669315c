use crate::branch_unit::BranchUnit;
use crate::config::{Config, MixPattern};
use crate::exec_unit::ExecutionUnit;
use crate::fetch_buffer::FetchBuffer;
use crate::gpu::{GpuShared, SchedulerState};
use crate::instruction::{Format, Instruction};
use crate::lds_unit::LdsUnit;
use crate::mem::{AddressSpace, LatencyModule, Mmu, Witness};
use crate::scalar_unit::ScalarUnit;
use crate::simd_unit::SimdUnit;
use crate::stats::{
    ComputeUnitStats, CycleEvent, CycleStats, StatsFile, UnitKind, STALL_COLUMNS,
};
use crate::uop::{Stage, Uop, WorkItemInfo};
use crate::vector_memory_unit::VectorMemoryUnit;
use crate::wavefront_pool::{WavefrontPool, WavefrontPoolEntry};
use crate::work_group::WorkGroup;
use crate::{Cycle, WAVEFRONT_SIZE};
use console::style;
use itertools::Itertools;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Per-wavefront and per-work-group cycle statistics of one compute unit.
#[derive(Debug, Default)]
pub struct StatTables {
    pub level: u8,
    pub workgroup: HashMap<usize, CycleStats>,
    pub wavefront: HashMap<usize, CycleStats>,
    pub workgroup_file: Option<StatsFile>,
    pub wavefront_file: Option<StatsFile>,
}

impl StatTables {
    fn new(level: u8) -> Self {
        Self {
            level,
            ..Self::default()
        }
    }

    fn open_files(&mut self, dir: &std::path::Path, cu_index: usize) -> std::io::Result<()> {
        let workgroup_header = format!(
            "ndrange_id,wg_id,len_map,clk_map,clk_unmap,len_uop,clk_uop_begin,clk_uop_end,{STALL_COLUMNS}"
        );
        let wavefront_header = format!(
            "ndrange_id,wg_id,wf_id,len_map,clk_map,clk_unmap,len_uop,clk_uop_begin,clk_uop_end,{STALL_COLUMNS}"
        );
        self.workgroup_file = Some(StatsFile::create(
            dir,
            &format!("cu_{cu_index}.workgp"),
            &workgroup_header,
        )?);
        self.wavefront_file = Some(StatsFile::create(
            dir,
            &format!("cu_{cu_index}.waveft"),
            &wavefront_header,
        )?);
        Ok(())
    }

    fn event(&mut self, wavefront_id: usize, work_group_slot: usize, cycle: Cycle, event: CycleEvent) {
        if let Some(stats) = self.wavefront.get_mut(&wavefront_id) {
            stats.set_cycle(cycle, event);
        }
        if let Some(stats) = self.workgroup.get_mut(&work_group_slot) {
            stats.set_cycle(cycle, event);
        }
    }

    /// Dump rows for entities still live at teardown, in id order so
    /// identical runs produce identical files.
    fn flush(&mut self, cycle: Cycle) {
        if let Some(file) = &mut self.workgroup_file {
            for (slot, stats) in self.workgroup.iter_mut().sorted_by_key(|(slot, _)| **slot) {
                stats.set_cycle(cycle, CycleEvent::Unmapped);
                file.write_row(&format!("-1,{},{}", slot, stats.row()));
            }
            file.flush();
        }
        self.workgroup.clear();
        if let Some(file) = &mut self.wavefront_file {
            for (id, stats) in self.wavefront.iter_mut().sorted_by_key(|(id, _)| **id) {
                stats.set_cycle(cycle, CycleEvent::Unmapped);
                file.write_row(&format!("-1,-1,{},{}", id, stats.row()));
            }
            file.flush();
        }
        self.wavefront.clear();
    }
}

/// Mutable view of everything an execution unit touches during one cycle.
///
/// Units never hold references into the compute unit; the per-cycle step
/// hands them this bundle instead, so uops can carry plain indices rather
/// than back-pointers.
pub struct UnitCtx<'a> {
    pub cycle: Cycle,
    pub config: &'a Config,
    pub cu_index: usize,
    pub pools: &'a mut [WavefrontPool],
    pub work_groups: &'a mut [Option<WorkGroup>],
    pub cu_stats: &'a mut ComputeUnitStats,
    pub tables: &'a mut StatTables,
    pub lds: &'a mut LatencyModule,
    pub scalar_cache: &'a mut LatencyModule,
    pub vector_cache: &'a mut LatencyModule,
    pub mmu: &'a Mmu,
    pub address_space: AddressSpace,
    pub sched: &'a mut SchedulerState,
}

impl UnitCtx<'_> {
    #[must_use]
    pub fn entry_mut(&mut self, uop: &Uop) -> &mut WavefrontPoolEntry {
        &mut self.pools[uop.wavefront_pool_id].entries[uop.pool_entry_index]
    }

    #[must_use]
    pub fn work_group_mut(&mut self, slot: usize) -> &mut WorkGroup {
        self.work_groups[slot]
            .as_mut()
            .expect("uop references an unmapped work-group slot")
    }

    /// Record a stage stall observed by `uop` in the per-wavefront and
    /// per-work-group tables and emit the trace record.
    pub fn record_stall(&mut self, uop: &Uop, kind: UnitKind, stage: Stage) {
        log::trace!(
            "si.inst id={} cu={} wf={} uop_id={} stg=\"s\"",
            uop.id_in_compute_unit,
            self.cu_index,
            uop.wavefront_id,
            uop.id_in_wavefront
        );
        if self.tables.level == 0 {
            return;
        }
        if let Some(stats) = self.tables.wavefront.get_mut(&uop.wavefront_id_in_compute_unit) {
            stats.stalls.bump(stage);
            stats.stalls_mut(kind).bump(stage);
        }
        if let Some(stats) = self.tables.workgroup.get_mut(&uop.work_group_id_in_compute_unit) {
            stats.stalls.bump(stage);
            stats.stalls_mut(kind).bump(stage);
        }
    }

    /// Final bookkeeping of a completed uop: the work group sheds one
    /// in-flight instruction and is unmapped once it is both finished and
    /// fully drained.
    pub fn retire_uop(&mut self, uop: &Uop, unit_name: &str) {
        log::trace!(
            "si.end_inst id={} cu={}",
            uop.id_in_compute_unit,
            self.cu_index
        );
        if self.tables.level >= 2 {
            log::trace!(target: "m2svis", "{}", uop.life_cycle_record(unit_name));
            self.sched.ndrange_event(uop.ndrange_id, self.cycle, CycleEvent::Finish);
            self.tables.event(
                uop.wavefront_id_in_compute_unit,
                uop.work_group_id_in_compute_unit,
                self.cycle,
                CycleEvent::Finish,
            );
        }

        let cycle = self.cycle;
        let work_group = self.work_group_mut(uop.work_group_slot);
        assert!(
            work_group.inflight_instructions > 0,
            "work group {} retired more uops than it fetched",
            work_group.id
        );
        work_group.inflight_instructions -= 1;
        let drained = work_group.finished_timing && work_group.inflight_instructions == 0;

        self.sched.last_complete_cycle = cycle;
        if drained {
            unmap_work_group(self, uop.work_group_slot);
        }
    }
}

/// Which execution unit executes the given instruction.
#[must_use]
pub fn unit_kind_for(instruction: &Instruction) -> Option<UnitKind> {
    if instruction.is_branch() {
        Some(UnitKind::Branch)
    } else if instruction.format.is_scalar() || instruction.format == Format::Smrd {
        Some(UnitKind::Scalar)
    } else if instruction.format.is_vector_memory() {
        Some(UnitKind::VectorMemory)
    } else if instruction.format == Format::Ds {
        Some(UnitKind::Lds)
    } else if instruction.format.is_vector_alu() {
        Some(UnitKind::Simd)
    } else {
        None
    }
}

/// Remove a drained work group from its slot, release its pool entries and
/// hand the compute unit back to the available list.
pub(crate) fn unmap_work_group(ctx: &mut UnitCtx, slot: usize) {
    let mut work_group = ctx.work_groups[slot]
        .take()
        .expect("unmapping an empty work-group slot");
    assert!(
        work_group.finished_timing && work_group.inflight_instructions == 0,
        "unmapping work group {} before it drained",
        work_group.id
    );

    let (pool_id, _) = work_group
        .wavefronts
        .first()
        .and_then(|wf| wf.pool_entry)
        .expect("mapped work group has resident wavefronts");
    ctx.pools[pool_id].unmap_wavefronts(&mut work_group);

    if ctx.tables.level >= 1 {
        for wavefront in &work_group.wavefronts {
            if let Some(mut stats) = ctx.tables.wavefront.remove(&wavefront.id_in_compute_unit) {
                stats.set_cycle(ctx.cycle, CycleEvent::Unmapped);
                if let Some(file) = &mut ctx.tables.wavefront_file {
                    file.write_row(&format!(
                        "{},{},{},{}",
                        work_group.ndrange_id,
                        work_group.id,
                        wavefront.id,
                        stats.row()
                    ));
                }
            }
        }
        if let Some(mut stats) = ctx.tables.workgroup.remove(&slot) {
            stats.set_cycle(ctx.cycle, CycleEvent::Unmapped);
            if let Some(file) = &mut ctx.tables.workgroup_file {
                file.write_row(&format!(
                    "{},{},{}",
                    work_group.ndrange_id,
                    work_group.id,
                    stats.row()
                ));
            }
        }
    }

    log::debug!(
        "{}",
        style(format!(
            "cycle {:02} cu {} unmapped work group {} from slot {}",
            ctx.cycle, ctx.cu_index, work_group.id, slot
        ))
        .yellow()
    );
    log::trace!("si.unmap_wg cu={} wg={}", ctx.cu_index, work_group.id);

    ctx.sched.available.insert(ctx.cu_index);
    ctx.sched.work_group_unmapped();
}

/// One compute unit: wavefront pools and fetch buffers feeding the five
/// execution-unit variants, plus the work-group slots resident on it.
#[derive(Debug)]
pub struct ComputeUnit {
    pub index: usize,
    config: Arc<Config>,
    uop_uid: Arc<AtomicU64>,
    uop_id_counter: u64,

    pub wavefront_pools: Vec<WavefrontPool>,
    pub fetch_buffers: Vec<FetchBuffer>,
    pub simd_units: Vec<SimdUnit>,
    pub scalar_unit: ScalarUnit,
    pub branch_unit: BranchUnit,
    pub lds_unit: LdsUnit,
    pub vector_memory_unit: VectorMemoryUnit,

    pub work_groups: Vec<Option<WorkGroup>>,
    pub lds_module: LatencyModule,

    pub stats: ComputeUnitStats,
    pub tables: StatTables,
    pub cycle_map_first_work_group: Option<Cycle>,
}

impl ComputeUnit {
    pub fn new(
        index: usize,
        config: Arc<Config>,
        uop_uid: Arc<AtomicU64>,
    ) -> std::io::Result<Self> {
        let wavefront_pools = (0..config.num_wavefront_pools)
            .map(|i| WavefrontPool::new(i, config.max_wavefronts_per_pool))
            .collect();
        let fetch_buffers = (0..config.num_wavefront_pools)
            .map(|i| FetchBuffer::new(i, config.fetch_buffer_size))
            .collect();
        let mut simd_units: Vec<_> = (0..config.num_wavefront_pools)
            .map(|i| SimdUnit::new(&config, i))
            .collect();
        let mut scalar_unit = ScalarUnit::new(&config);
        let mut branch_unit = BranchUnit::new(&config);
        let mut lds_unit = LdsUnit::new(&config);
        let mut vector_memory_unit = VectorMemoryUnit::new(&config);
        let lds_module = LatencyModule::new(
            format!("LDS[{index}]"),
            config.lds_latency,
            usize::MAX,
        );

        let mut tables = StatTables::new(config.statistics_level);
        if config.statistics_level >= 1 {
            tables.open_files(&config.stats_dir, index)?;
            scalar_unit.state_mut().enable_stats_files(&config.stats_dir, index)?;
            branch_unit.state_mut().enable_stats_files(&config.stats_dir, index)?;
            lds_unit.state_mut().enable_stats_files(&config.stats_dir, index)?;
            vector_memory_unit
                .state_mut()
                .enable_stats_files(&config.stats_dir, index)?;
            for simd in &mut simd_units {
                simd.state_mut().enable_stats_files(&config.stats_dir, index)?;
            }
        }

        Ok(Self {
            index,
            config,
            uop_uid,
            uop_id_counter: 0,
            wavefront_pools,
            fetch_buffers,
            simd_units,
            scalar_unit,
            branch_unit,
            lds_unit,
            vector_memory_unit,
            work_groups: Vec::new(),
            lds_module,
            stats: ComputeUnitStats::default(),
            tables,
            cycle_map_first_work_group: None,
        })
    }

    #[must_use]
    pub fn num_mapped_work_groups(&self) -> usize {
        self.work_groups.iter().flatten().count()
    }

    /// Uops currently owned by any buffer of this compute unit.
    #[must_use]
    pub fn in_flight_uops(&self) -> usize {
        self.fetch_buffers.iter().map(FetchBuffer::len).sum::<usize>()
            + self.simd_units.iter().map(|u| u.state().in_flight()).sum::<usize>()
            + self.scalar_unit.state().in_flight()
            + self.branch_unit.state().in_flight()
            + self.lds_unit.state().in_flight()
            + self.vector_memory_unit.state().in_flight()
    }

    /// Map a work group into the lowest free slot.
    pub fn map_work_group(
        &mut self,
        mut work_group: WorkGroup,
        sched: &mut SchedulerState,
        cycle: Cycle,
    ) {
        let capacity = sched.work_groups_per_compute_unit;
        if self.work_groups.len() < capacity {
            self.work_groups.resize_with(capacity, || None);
        }
        let slot = self.work_groups[..capacity]
            .iter()
            .position(Option::is_none)
            .expect("mapping a work group onto a full compute unit");
        work_group.id_in_compute_unit = slot;

        log::debug!(
            "{}",
            style(format!(
                "cycle {:02} cu {} mapped work group {} to slot {}",
                cycle, self.index, work_group.id, slot
            ))
            .yellow()
        );

        let wavefronts_per_work_group = work_group.wavefronts_in_work_group();
        assert!(wavefronts_per_work_group <= self.config.max_wavefronts_per_pool);
        for (i, wavefront) in work_group.wavefronts.iter_mut().enumerate() {
            wavefront.id_in_compute_unit = slot * wavefronts_per_work_group + i;
            if self.tables.level >= 1 {
                let mut stats = CycleStats::default();
                stats.set_cycle(cycle, CycleEvent::Mapped);
                self.tables.wavefront.insert(wavefront.id_in_compute_unit, stats);
            }
        }
        if self.tables.level >= 1 {
            let mut stats = CycleStats::default();
            stats.set_cycle(cycle, CycleEvent::Mapped);
            self.tables.workgroup.insert(slot, stats);
        }

        let pool_id = slot % self.config.num_wavefront_pools;
        self.wavefront_pools[pool_id].map_wavefronts(slot, &mut work_group);

        self.set_initial_pc(&mut work_group, sched);

        if self.cycle_map_first_work_group.is_none() {
            self.cycle_map_first_work_group = Some(cycle);
        }
        self.stats.num_mapped_work_groups += 1;

        log::trace!(
            "si.map_wg cu={} wg={} wf_count={}",
            self.index,
            work_group.id,
            work_group.wavefronts_in_work_group()
        );
        self.work_groups[slot] = Some(work_group);
    }

    /// Assign initial program counters per the configured mix policy when
    /// the kernel carries a second entry point.
    fn set_initial_pc(&self, work_group: &mut WorkGroup, sched: &mut SchedulerState) {
        let Some(second_pc) = sched.second_entry() else {
            return;
        };
        let active_wavefronts_per_cu = sched.wavefronts_per_compute_unit.max(1);
        let ratio = self.config.mix_ratio;
        let threshold = (active_wavefronts_per_cu as f64 * ratio) as usize;

        for wavefront in &mut work_group.wavefronts {
            wavefront.pc = 0;
            let wavefront_slot = wavefront.id_in_compute_unit % active_wavefronts_per_cu;
            let take_second = match self.config.mix_pattern {
                MixPattern::GreaterThan => wavefront_slot > threshold,
                MixPattern::LessThan => wavefront_slot < threshold,
                MixPattern::Random => {
                    let r: f64 = sched.rng.gen_range(0.0..=1.0);
                    r <= ratio
                }
                MixPattern::RoundRobin => {
                    let stride = ((active_wavefronts_per_cu as f64 * ratio / 2.0) as usize).max(1);
                    (wavefront.id_in_compute_unit / stride) % 2 == 1
                }
            };
            if take_second {
                wavefront.pc = second_pc;
            }
            log::debug!(
                "cu {}: wavefront {} starts at pc {} (pattern {:?}, ratio {})",
                self.index,
                wavefront.id_in_compute_unit,
                wavefront.pc,
                self.config.mix_pattern,
                ratio
            );
        }
    }

    /// Advance this compute unit by one cycle.
    ///
    /// Order within the cycle: every unit runs its stages in reverse
    /// pipeline order, then issue drains the active fetch buffer, then
    /// fetch refills all fetch buffers.
    pub fn run(&mut self, shared: &mut GpuShared, cycle: Cycle) {
        if self.num_mapped_work_groups() == 0 {
            return;
        }

        let config = Arc::clone(&self.config);
        let num_pools = config.num_wavefront_pools;

        let mut active = (cycle as usize) % num_pools;
        if config.fetch_pressure_scheduling {
            let mut pressure = 0;
            for (i, fetch_buffer) in self.fetch_buffers.iter().enumerate() {
                if fetch_buffer.len() > pressure {
                    active = i;
                    pressure = fetch_buffer.len();
                }
            }
        }

        let Self {
            index,
            wavefront_pools,
            fetch_buffers,
            simd_units,
            scalar_unit,
            branch_unit,
            lds_unit,
            vector_memory_unit,
            work_groups,
            lds_module,
            stats,
            tables,
            uop_id_counter,
            uop_uid,
            ..
        } = self;

        let GpuShared { mmu, mem, sched } = shared;
        let address_space = sched
            .ndrange
            .as_ref()
            .map_or(AddressSpace(0), |ndrange| ndrange.address_space);

        let mut ctx = UnitCtx {
            cycle,
            config: &config,
            cu_index: *index,
            pools: wavefront_pools,
            work_groups,
            cu_stats: stats,
            tables,
            lds: lds_module,
            scalar_cache: &mut mem.scalar[*index],
            vector_cache: &mut mem.vector[*index],
            mmu,
            address_space,
            sched,
        };

        // Stages, reverse pipeline order inside each unit.
        for simd in simd_units.iter_mut() {
            simd.run(&mut ctx);
        }
        vector_memory_unit.run(&mut ctx);
        lds_unit.run(&mut ctx);
        scalar_unit.run(&mut ctx);
        branch_unit.run(&mut ctx);

        // Issue from the active fetch buffer, one unit class at a time.
        issue_to_execution_unit(&mut fetch_buffers[active], &mut *branch_unit, &mut ctx);
        issue_to_execution_unit(&mut fetch_buffers[active], &mut *scalar_unit, &mut ctx);
        for i in 0..num_pools {
            let unit_index = (i + active) % num_pools;
            issue_to_execution_unit(&mut fetch_buffers[active], &mut simd_units[unit_index], &mut ctx);
        }
        issue_to_execution_unit(&mut fetch_buffers[active], &mut *vector_memory_unit, &mut ctx);
        issue_to_execution_unit(&mut fetch_buffers[active], &mut *lds_unit, &mut ctx);

        // Everything fetch-ready but still in the active buffer observed an
        // issue stall this cycle.
        for uop in fetch_buffers[active].iter_mut() {
            if cycle < uop.ready(Stage::Fetch) {
                continue;
            }
            uop.bump_stall(Stage::Issue);
            if let Some(kind) = unit_kind_for(&uop.instruction) {
                match kind {
                    UnitKind::Branch => branch_unit.state_mut().bump_issue_stall(),
                    UnitKind::Scalar => scalar_unit.state_mut().bump_issue_stall(),
                    UnitKind::VectorMemory => vector_memory_unit.state_mut().bump_issue_stall(),
                    UnitKind::Lds => lds_unit.state_mut().bump_issue_stall(),
                    UnitKind::Simd => {
                        for simd in simd_units.iter_mut() {
                            simd.state_mut().bump_issue_stall();
                        }
                    }
                }
                ctx.record_stall(uop, kind, Stage::Issue);
            }
        }

        // Non-active buffers only age their fetched uops.
        for (i, fetch_buffer) in fetch_buffers.iter_mut().enumerate() {
            if i == active {
                continue;
            }
            for uop in fetch_buffer.iter_mut() {
                if cycle < uop.ready(Stage::Fetch) {
                    break;
                }
                uop.bump_stall(Stage::Issue);
                log::trace!(
                    "si.inst id={} cu={} wf={} uop_id={} stg=\"s\"",
                    uop.id_in_compute_unit,
                    ctx.cu_index,
                    uop.wavefront_id,
                    uop.id_in_wavefront
                );
            }
        }

        // Fetch into every pool's buffer.
        if config.rotate_fetch {
            for i in 0..num_pools {
                let pool_id = (i + active) % num_pools;
                fetch(pool_id, &mut fetch_buffers[pool_id], &mut ctx, uop_uid, uop_id_counter);
            }
        } else {
            for pool_id in 0..num_pools {
                fetch(pool_id, &mut fetch_buffers[pool_id], &mut ctx, uop_uid, uop_id_counter);
            }
        }
    }

    /// Dump the remaining statistics at the end of a run.
    pub fn flush_stats(&mut self, cycle: Cycle) {
        let interval = self.config.statistics_sampling_cycle;
        self.tables.flush(cycle);
        self.scalar_unit.state_mut().flush_stats(cycle, interval);
        self.branch_unit.state_mut().flush_stats(cycle, interval);
        self.lds_unit.state_mut().flush_stats(cycle, interval);
        self.vector_memory_unit.state_mut().flush_stats(cycle, interval);
        for simd in &mut self.simd_units {
            simd.state_mut().flush_stats(cycle, interval);
        }
    }
}

/// Issue up to `max_instructions_issued_per_type` eligible uops from the
/// fetch buffer into one execution unit. Arbitration picks the uop with the
/// smallest wavefront id among those that completed fetch.
fn issue_to_execution_unit(
    fetch_buffer: &mut FetchBuffer,
    unit: &mut dyn ExecutionUnit,
    ctx: &mut UnitCtx,
) {
    for _ in 0..ctx.config.max_instructions_issued_per_type {
        if !unit.can_issue() {
            break;
        }

        let mut oldest: Option<(usize, usize)> = None;
        for (index, uop) in fetch_buffer.iter().enumerate() {
            if !unit.is_valid_uop(uop) {
                continue;
            }
            if ctx.cycle < uop.ready(Stage::Fetch) {
                continue;
            }
            match oldest {
                Some((_, wavefront_id)) if uop.wavefront_id >= wavefront_id => {}
                _ => oldest = Some((index, uop.wavefront_id)),
            }
        }
        let Some((index, _)) = oldest else { break };

        let mut uop = fetch_buffer.remove(index).expect("arbitration picked a live index");
        let fetch_ready = uop.ready(Stage::Fetch);
        let issue = uop.stage_mut(Stage::Issue);
        issue.begin = fetch_ready;
        issue.active = ctx.cycle;
        unit.issue(uop, ctx);
    }
}

/// Fetch instructions from one wavefront pool into its fetch buffer,
/// invoking the emulator for each admitted wavefront.
fn fetch(
    pool_id: usize,
    fetch_buffer: &mut FetchBuffer,
    ctx: &mut UnitCtx,
    uop_uid: &Arc<AtomicU64>,
    uop_id_counter: &mut u64,
) {
    debug_assert_eq!(fetch_buffer.id, pool_id);
    let cycle = ctx.cycle;
    let mut instructions_processed = 0;

    for entry_index in 0..ctx.pools[pool_id].entries.len() {
        {
            let entry = &mut ctx.pools[pool_id].entries[entry_index];
            if entry.wavefront.is_none() {
                continue;
            }

            // Promotion never counts against the fetch width.
            if entry.ready_next_cycle {
                entry.ready = true;
                entry.ready_next_cycle = false;
                continue;
            }

            if instructions_processed >= ctx.config.fetch_width {
                continue;
            }

            // Previous instruction still holds the wavefront.
            if !entry.ready {
                continue;
            }

            // Outstanding memory operations may remain, but nothing more is
            // fetched for a finished wavefront.
            if entry.wavefront_finished {
                continue;
            }
        }

        let wavefront_ref = ctx.pools[pool_id].entries[entry_index]
            .wavefront
            .expect("checked above");
        let work_group = ctx.work_groups[wavefront_ref.work_group_slot]
            .as_mut()
            .expect("pool entry references an unmapped work group");
        let wavefront = &mut work_group.wavefronts[wavefront_ref.wavefront_index];
        if wavefront.finished {
            continue;
        }

        {
            let entry = &mut ctx.pools[pool_id].entries[entry_index];
            if entry.mem_wait {
                if entry.memory_counters_drained() {
                    entry.mem_wait = false;
                    log::debug!(
                        "wg={}/wf={} memory wait done",
                        work_group.id,
                        wavefront.id
                    );
                } else {
                    log::debug!(
                        "wg={}/wf={} waiting on memory (lgkm={} vm={} exp={})",
                        work_group.id,
                        wavefront.id,
                        entry.lgkm_cnt,
                        entry.vm_cnt,
                        entry.exp_cnt
                    );
                    continue;
                }
            }

            if entry.wait_for_barrier {
                continue;
            }
        }

        if fetch_buffer.full() {
            continue;
        }

        // Emulate one instruction.
        wavefront.execute();
        ctx.pools[pool_id].entries[entry_index].ready = false;

        let instruction = wavefront
            .instruction
            .clone()
            .expect("execute produced an instruction");

        let mut work_item_info: Vec<WorkItemInfo> =
            (0..WAVEFRONT_SIZE).map(|_| WorkItemInfo::default()).collect();
        for work_item in &wavefront.work_items {
            let info = &mut work_item_info[work_item.id_in_wavefront];
            info.global_memory_access_address = work_item.global_memory_access_address;
            info.global_memory_access_size = work_item.global_memory_access_size;
            info.lds_accesses = work_item.lds_accesses.clone();
        }

        *uop_id_counter += 1;
        let mut uop = Uop {
            id: uop_uid.fetch_add(1, Ordering::SeqCst) + 1,
            id_in_wavefront: wavefront.next_uop_id(),
            id_in_compute_unit: *uop_id_counter,
            compute_unit_index: ctx.cu_index,
            wavefront_pool_id: pool_id,
            pool_entry_index: entry_index,
            work_group_slot: wavefront_ref.work_group_slot,
            wavefront_id: wavefront.id,
            wavefront_id_in_compute_unit: wavefront.id_in_compute_unit,
            work_group_id: work_group.id,
            work_group_id_in_compute_unit: work_group.id_in_compute_unit,
            ndrange_id: work_group.ndrange_id,
            instruction,
            vector_memory_read: wavefront.vector_memory_read,
            vector_memory_write: wavefront.vector_memory_write,
            vector_memory_atomic: wavefront.vector_memory_atomic,
            vector_memory_global_coherency: wavefront.vector_memory_global_coherency,
            scalar_memory_read: wavefront.scalar_memory_read,
            lds_read: wavefront.lds_read,
            lds_write: wavefront.lds_write,
            wavefront_last_instruction: wavefront.finished,
            memory_wait: wavefront.memory_wait,
            at_barrier: wavefront.barrier_instruction,
            cycle_start: cycle,
            cycle_finish: 0,
            cycle_length: 0,
            stages: Default::default(),
            cycle_complete_stall: 0,
            global_memory_witness: Witness::new(),
            lds_witness: Witness::new(),
            global_memory_access_address: wavefront.scalar_memory_access_address,
            active_mask: wavefront.active_mask,
            work_item_info,
        };
        uop.enter_stage(Stage::Fetch, cycle, cycle, ctx.config.fetch_latency);

        log::trace!(
            "si.new_inst id={} cu={} ib={} wf={} uop_id={} stg=\"f\" asm=\"{}\"",
            uop.id_in_compute_unit,
            ctx.cu_index,
            pool_id,
            uop.wavefront_id,
            uop.id_in_wavefront,
            uop.instruction
        );

        if ctx.tables.level >= 2 {
            ctx.sched
                .ndrange_event(uop.ndrange_id, cycle, CycleEvent::Start);
            ctx.tables.event(
                uop.wavefront_id_in_compute_unit,
                uop.work_group_id_in_compute_unit,
                cycle,
                CycleEvent::Start,
            );
        }

        let work_group = ctx.work_groups[wavefront_ref.work_group_slot]
            .as_mut()
            .expect("checked above");
        work_group.inflight_instructions += 1;
        fetch_buffer.push(uop);

        instructions_processed += 1;
        ctx.cu_stats.num_total_insts += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_kind_classification() {
        assert_eq!(
            unit_kind_for(&Instruction::s_branch()),
            Some(UnitKind::Branch)
        );
        assert_eq!(
            unit_kind_for(&Instruction::s_endpgm()),
            Some(UnitKind::Scalar)
        );
        assert_eq!(
            unit_kind_for(&Instruction::smem_load(0, 4)),
            Some(UnitKind::Scalar)
        );
        assert_eq!(
            unit_kind_for(&Instruction::buffer_load(0, 4, 4)),
            Some(UnitKind::VectorMemory)
        );
        assert_eq!(unit_kind_for(&Instruction::ds_read(0, 4)), Some(UnitKind::Lds));
        assert_eq!(
            unit_kind_for(&Instruction::vector_alu("v_mul_f32")),
            Some(UnitKind::Simd)
        );
    }
}
