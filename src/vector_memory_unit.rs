use crate::compute_unit::UnitCtx;
use crate::config::{Config, MemUnitConfig};
use crate::exec_unit::{advance_stage, ExecUnitState, ExecutionUnit, StageSpec, StageStatus};
use crate::mem::{AccessKind, MemoryModule};
use crate::stats::UnitKind;
use crate::uop::{Stage, Uop};

/// Vector memory unit for typed and untyped buffer instructions.
///
/// The memory stage submits one cache access per active work item. When
/// the cache rejects part of a wavefront the uop stays put and retries
/// next cycle with only the rejected lanes; every such cycle counts as a
/// divergence.
#[derive(Debug)]
pub struct VectorMemoryUnit {
    cfg: MemUnitConfig,
    state: ExecUnitState,
}

impl VectorMemoryUnit {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        let cfg = config.vector_memory_unit.clone();
        let state = ExecUnitState::new(
            UnitKind::VectorMemory,
            "vmem",
            cfg.issue_buffer_size,
            cfg.decode_buffer_size,
            cfg.read_buffer_size,
            cfg.max_inflight_mem_accesses,
            cfg.write_buffer_size,
        );
        Self { cfg, state }
    }

    fn complete(&mut self, ctx: &mut UnitCtx) {
        let state = &mut self.state;
        while let Some(uop) = state.write_buffer.first() {
            if ctx.cycle < uop.ready(Stage::Write) {
                state.status.write = StageStatus::Active;
                break;
            }
            let mut uop = state.write_buffer.dequeue().expect("head checked above");

            {
                let entry = ctx.entry_mut(&uop);
                assert!(entry.lgkm_cnt > 0, "lgkm counter underflow");
                entry.lgkm_cnt -= 1;
            }

            uop.cycle_finish = ctx.cycle;
            uop.cycle_length = uop.cycle_finish - uop.cycle_start;
            state.status.write = StageStatus::Active;
            state.overview.completed(uop.cycle_length, uop.wavefront_id, uop.work_group_id);
            state.interval.completed(uop.cycle_length, uop.wavefront_id, uop.work_group_id);
            state.num_instructions += 1;
            ctx.retire_uop(&uop, "vmem");
        }
    }

    fn write(&mut self, ctx: &mut UnitCtx) {
        let state = &mut self.state;
        let width = self.cfg.width;
        let mut processed = 0;
        while let Some(uop) = state.exec_buffer.get_mut(0) {
            processed += 1;

            if uop.global_memory_witness.pending() {
                state.status.execute = StageStatus::Active;
                break;
            }

            if processed > width || state.write_buffer.full() {
                uop.bump_stall(Stage::Write);
                state.status.write = StageStatus::Stall;
                state.overview.stalls.write += 1;
                state.interval.stalls.write += 1;
                ctx.record_stall(uop, state.kind, Stage::Write);
                break;
            }

            let mut uop = state.exec_buffer.dequeue().expect("head checked above");
            let begin = ctx.cycle.saturating_sub(uop.stage(Stage::Write).stall);
            uop.enter_stage(Stage::Write, begin, ctx.cycle, self.cfg.write_latency);
            state.status.write = StageStatus::Active;
            log::trace!(
                "si.inst id={} cu={} wf={} uop_id={} stg=\"mem-w\"",
                uop.id_in_compute_unit,
                ctx.cu_index,
                uop.wavefront_id,
                uop.id_in_wavefront
            );
            state.write_buffer.enqueue(uop);
        }
    }

    /// Memory stage: translate and submit every active work item's access.
    /// A uop advances only once all of its lanes were accepted.
    fn memory(&mut self, ctx: &mut UnitCtx) {
        let state = &mut self.state;
        let width = self.cfg.width;
        let mut processed = 0;
        let mut index = 0;
        while index < state.read_buffer.len() {
            let uop = state.read_buffer.get_mut(index).expect("index within bounds");
            processed += 1;

            if ctx.cycle < uop.ready(Stage::Read) {
                state.status.read = StageStatus::Active;
                break;
            }

            if processed > width || state.exec_buffer.full() {
                uop.bump_stall(Stage::Execute);
                state.status.execute = StageStatus::Stall;
                state.overview.stalls.execution += 1;
                state.interval.stalls.execution += 1;
                ctx.record_stall(uop, state.kind, Stage::Execute);
                break;
            }

            let kind = if uop.vector_memory_write && !uop.vector_memory_global_coherency {
                AccessKind::NCStore
            } else if uop.vector_memory_write {
                AccessKind::Store
            } else if uop.vector_memory_read {
                AccessKind::Load
            } else if uop.vector_memory_atomic {
                AccessKind::Store
            } else {
                panic!("invalid vector memory access kind for uop {}", uop.id);
            };

            let mut all_work_items_accessed = true;
            for lane in uop.active_mask.iter_ones() {
                let info = &mut uop.work_item_info[lane];
                if info.accessed_cache {
                    continue;
                }
                let physical_address = ctx
                    .mmu
                    .translate(ctx.address_space, info.global_memory_access_address);
                if ctx.vector_cache.can_access(physical_address) {
                    ctx.vector_cache
                        .access(kind, physical_address, &uop.global_memory_witness);
                    info.accessed_cache = true;
                } else {
                    all_work_items_accessed = false;
                }
            }

            state.status.execute = StageStatus::Active;

            if !all_work_items_accessed {
                state.overview.num_vmem_divergence += 1;
                state.interval.num_vmem_divergence += 1;
                index += 1;
                continue;
            }

            let mut uop = state
                .read_buffer
                .remove(index)
                .expect("index within bounds");
            let begin = uop.ready(Stage::Read);
            uop.enter_stage(Stage::Execute, begin, ctx.cycle, 0);
            log::trace!(
                "si.inst id={} cu={} wf={} uop_id={} stg=\"mem-m\"",
                uop.id_in_compute_unit,
                ctx.cu_index,
                uop.wavefront_id,
                uop.id_in_wavefront
            );
            state.exec_buffer.enqueue(uop);
        }
    }

    fn read(&mut self, ctx: &mut UnitCtx) {
        let ExecUnitState {
            decode_buffer,
            read_buffer,
            status,
            overview,
            interval,
            kind,
            ..
        } = &mut self.state;
        advance_stage(
            decode_buffer,
            read_buffer,
            StageSpec {
                stage: Stage::Read,
                prev: Stage::Decode,
                latency: self.cfg.read_latency,
                width: self.cfg.width,
                tag: "mem-r",
            },
            status,
            overview,
            interval,
            *kind,
            ctx,
        );
    }

    fn decode(&mut self, ctx: &mut UnitCtx) {
        let ExecUnitState {
            issue_buffer,
            decode_buffer,
            status,
            overview,
            interval,
            kind,
            ..
        } = &mut self.state;
        advance_stage(
            issue_buffer,
            decode_buffer,
            StageSpec {
                stage: Stage::Decode,
                prev: Stage::Issue,
                latency: self.cfg.decode_latency,
                width: self.cfg.width,
                tag: "mem-d",
            },
            status,
            overview,
            interval,
            *kind,
            ctx,
        );
    }
}

impl ExecutionUnit for VectorMemoryUnit {
    fn state(&self) -> &ExecUnitState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ExecUnitState {
        &mut self.state
    }

    fn is_valid_uop(&self, uop: &Uop) -> bool {
        uop.instruction.format.is_vector_memory()
    }

    fn issue(&mut self, uop: Uop, ctx: &mut UnitCtx) {
        // The wavefront may fetch again next cycle while the accesses are
        // outstanding.
        let entry = ctx.entry_mut(&uop);
        entry.ready_next_cycle = true;
        entry.lgkm_cnt += 1;
        ctx.cu_stats.num_vector_memory_insts += 1;
        self.state.push_issued(uop, ctx.cycle, ctx.config.issue_latency);
    }

    fn run(&mut self, ctx: &mut UnitCtx) {
        self.state.pre_run();
        self.complete(ctx);
        self.write(ctx);
        self.memory(ctx);
        self.read(ctx);
        self.decode(ctx);
        self.state.post_run(ctx.cycle, ctx.config.statistics_sampling_cycle);
    }
}
