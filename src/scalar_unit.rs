use crate::compute_unit::UnitCtx;
use crate::config::{Config, ExecUnitConfig};
use crate::exec_unit::{advance_stage, ExecUnitState, ExecutionUnit, StageSpec, StageStatus};
use crate::instruction::Format;
use crate::mem::{AccessKind, MemoryModule};
use crate::stats::UnitKind;
use crate::uop::{Stage, Uop};
use console::style;

/// Scalar execution unit.
///
/// Runs scalar-ALU instructions and scalar-memory (SMEM) reads, and owns
/// the wavefront-level completion semantics: barrier release, memory-wait
/// flags and end-of-wavefront retirement all happen in its Complete stage
/// because `s_barrier`, `s_waitcnt` and `s_endpgm` are scalar instructions.
#[derive(Debug)]
pub struct ScalarUnit {
    cfg: ExecUnitConfig,
    state: ExecUnitState,
}

impl ScalarUnit {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        let cfg = config.scalar_unit.clone();
        let state = ExecUnitState::new(
            UnitKind::Scalar,
            "scalar",
            cfg.issue_buffer_size,
            cfg.decode_buffer_size,
            cfg.read_buffer_size,
            cfg.exec_buffer_size,
            cfg.write_buffer_size,
        );
        Self { cfg, state }
    }

    fn complete(&mut self, ctx: &mut UnitCtx) {
        let state = &mut self.state;
        while let Some(uop) = state.write_buffer.get_mut(0) {
            if ctx.cycle < uop.ready(Stage::Write) {
                state.status.write = StageStatus::Active;
                break;
            }

            // The last instruction of a wavefront may not retire while the
            // wavefront still has outstanding memory operations.
            let memory_pending = !ctx.entry_mut(uop).memory_counters_drained();
            if uop.wavefront_last_instruction && memory_pending {
                uop.cycle_complete_stall += 1;
                state.status.write = StageStatus::Stall;
                state.overview.stalls.write += 1;
                state.interval.stalls.write += 1;
                ctx.record_stall(uop, state.kind, Stage::Write);
                break;
            }

            let mut uop = state.write_buffer.dequeue().expect("head checked above");

            {
                let entry = ctx.entry_mut(&uop);
                if uop.scalar_memory_read {
                    assert!(entry.lgkm_cnt > 0, "lgkm counter underflow");
                    entry.lgkm_cnt -= 1;
                } else {
                    // ALU instructions hold the wavefront until they retire.
                    entry.ready = true;
                }
                if uop.memory_wait {
                    entry.mem_wait = true;
                }
            }

            if uop.at_barrier {
                complete_barrier(ctx, &uop);
            }

            if uop.wavefront_last_instruction {
                complete_wavefront(ctx, &uop);
            }

            uop.cycle_finish = ctx.cycle;
            uop.cycle_length = uop.cycle_finish - uop.cycle_start;
            state.status.write = StageStatus::Active;
            state.overview.completed(uop.cycle_length, uop.wavefront_id, uop.work_group_id);
            state.interval.completed(uop.cycle_length, uop.wavefront_id, uop.work_group_id);
            state.num_instructions += 1;
            ctx.retire_uop(&uop, "scalar");
        }
    }

    fn write(&mut self, ctx: &mut UnitCtx) {
        let state = &mut self.state;
        let width = self.cfg.width;
        let mut processed = 0;
        while let Some(uop) = state.exec_buffer.get_mut(0) {
            processed += 1;

            if uop.scalar_memory_read {
                // Wait for the cache reply.
                if uop.global_memory_witness.pending() {
                    state.status.execute = StageStatus::Active;
                    break;
                }
            } else if ctx.cycle < uop.ready(Stage::Execute) {
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
            let begin = if uop.scalar_memory_read {
                ctx.cycle.saturating_sub(uop.stage(Stage::Write).stall)
            } else {
                uop.ready(Stage::Execute)
            };
            uop.enter_stage(Stage::Write, begin, ctx.cycle, self.cfg.write_latency);
            state.status.write = StageStatus::Active;
            log::trace!(
                "si.inst id={} cu={} wf={} uop_id={} stg=\"su-w\"",
                uop.id_in_compute_unit,
                ctx.cu_index,
                uop.wavefront_id,
                uop.id_in_wavefront
            );
            state.write_buffer.enqueue(uop);
        }
    }

    fn execute(&mut self, ctx: &mut UnitCtx) {
        let state = &mut self.state;
        let width = self.cfg.width;
        let mut processed = 0;
        while let Some(uop) = state.read_buffer.get_mut(0) {
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

            let mut uop = state.read_buffer.dequeue().expect("head checked above");
            let begin = uop.ready(Stage::Read);
            if uop.scalar_memory_read {
                // Issue a single load to the scalar cache; the witness is
                // disarmed by the cache reply.
                let physical_address = ctx
                    .mmu
                    .translate(ctx.address_space, uop.global_memory_access_address);
                ctx.scalar_cache
                    .access(AccessKind::Load, physical_address, &uop.global_memory_witness);
                uop.enter_stage(Stage::Execute, begin, ctx.cycle, 0);
                log::trace!(
                    "si.inst id={} cu={} wf={} uop_id={} stg=\"su-m\"",
                    uop.id_in_compute_unit,
                    ctx.cu_index,
                    uop.wavefront_id,
                    uop.id_in_wavefront
                );
            } else {
                uop.enter_stage(Stage::Execute, begin, ctx.cycle, self.cfg.exec_latency);
                log::trace!(
                    "si.inst id={} cu={} wf={} uop_id={} stg=\"su-e\"",
                    uop.id_in_compute_unit,
                    ctx.cu_index,
                    uop.wavefront_id,
                    uop.id_in_wavefront
                );
            }
            state.status.execute = StageStatus::Active;
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
                tag: "su-r",
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
                tag: "su-d",
            },
            status,
            overview,
            interval,
            *kind,
            ctx,
        );
    }
}

/// Barrier bookkeeping at scalar Complete: flag this wavefront, and once
/// every wavefront of the work group has flagged, release them all in the
/// same cycle.
fn complete_barrier(ctx: &mut UnitCtx, uop: &Uop) {
    {
        let entry = ctx.entry_mut(uop);
        assert!(
            !entry.wait_for_barrier,
            "wavefront reached a barrier while already waiting at one"
        );
        entry.wait_for_barrier = true;
    }

    let entries: Vec<(usize, usize)> = ctx.work_groups[uop.work_group_slot]
        .as_ref()
        .expect("barrier uop references an unmapped work group")
        .wavefronts
        .iter()
        .map(|wavefront| wavefront.pool_entry.expect("resident wavefront has a pool entry"))
        .collect();

    let barrier_complete = entries
        .iter()
        .all(|&(pool, entry)| ctx.pools[pool].entries[entry].wait_for_barrier);
    if barrier_complete {
        for &(pool, entry) in &entries {
            let entry = &mut ctx.pools[pool].entries[entry];
            assert!(entry.wait_for_barrier);
            entry.wait_for_barrier = false;
        }
        log::debug!(
            "{}",
            style(format!(
                "cycle {:02} wg={} barrier released (last wf={})",
                ctx.cycle, uop.work_group_id, uop.wavefront_id
            ))
            .cyan()
        );
    }
}

/// End-of-wavefront bookkeeping at scalar Complete.
fn complete_wavefront(ctx: &mut UnitCtx, uop: &Uop) {
    // No more fetches for this wavefront, though outstanding memory
    // operations may still drain.
    ctx.entry_mut(uop).wavefront_finished = true;

    let cycle = ctx.cycle;
    let work_group = ctx.work_group_mut(uop.work_group_slot);
    work_group.wavefronts_completed_timing += 1;
    assert!(
        work_group.wavefronts_completed_timing <= work_group.wavefronts_in_work_group(),
        "work group {} completed more wavefronts than it has",
        work_group.id
    );
    if work_group.wavefronts_completed_timing == work_group.wavefronts_in_work_group() {
        work_group.finished_timing = true;
    }

    ctx.sched.completed_wavefronts += 1;
    log::debug!(
        "{}",
        style(format!(
            "cycle {:02} cu {} completed wavefront {} ({} completed globally)",
            cycle, ctx.cu_index, uop.wavefront_id, ctx.sched.completed_wavefronts
        ))
        .green()
    );
}

impl ExecutionUnit for ScalarUnit {
    fn state(&self) -> &ExecUnitState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ExecUnitState {
        &mut self.state
    }

    fn is_valid_uop(&self, uop: &Uop) -> bool {
        let format = uop.instruction.format;
        if !format.is_scalar() && format != Format::Smrd {
            return false;
        }
        // Branches go to the branch unit.
        !uop.instruction.is_branch()
    }

    fn issue(&mut self, uop: Uop, ctx: &mut UnitCtx) {
        if uop.instruction.format == Format::Smrd {
            // The wavefront may fetch again next cycle while the load is
            // outstanding; the lgkm counter tracks it.
            let entry = ctx.entry_mut(&uop);
            entry.ready_next_cycle = true;
            entry.lgkm_cnt += 1;
            ctx.cu_stats.num_scalar_memory_insts += 1;
        } else {
            ctx.cu_stats.num_scalar_alu_insts += 1;
        }
        self.state.push_issued(uop, ctx.cycle, ctx.config.issue_latency);
    }

    fn run(&mut self, ctx: &mut UnitCtx) {
        self.state.pre_run();
        self.complete(ctx);
        self.write(ctx);
        self.execute(ctx);
        self.read(ctx);
        self.decode(ctx);
        self.state.post_run(ctx.cycle, ctx.config.statistics_sampling_cycle);
    }
}
