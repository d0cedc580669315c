use crate::compute_unit::UnitCtx;
use crate::config::{Config, MemUnitConfig};
use crate::exec_unit::{advance_stage, ExecUnitState, ExecutionUnit, StageSpec, StageStatus};
use crate::instruction::{Format, LdsAccessKind};
use crate::mem::{AccessKind, MemoryModule};
use crate::stats::UnitKind;
use crate::uop::{Stage, Uop};

/// Local-data-share unit.
///
/// The execute stage fans one module access out per recorded work-item
/// transaction; the write stage waits for the LDS witness to drain.
#[derive(Debug)]
pub struct LdsUnit {
    cfg: MemUnitConfig,
    state: ExecUnitState,
}

impl LdsUnit {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        let cfg = config.lds_unit.clone();
        let state = ExecUnitState::new(
            UnitKind::Lds,
            "lds",
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
                entry.ready_next_cycle = true;
            }

            uop.cycle_finish = ctx.cycle;
            uop.cycle_length = uop.cycle_finish - uop.cycle_start;
            state.status.write = StageStatus::Active;
            state.overview.completed(uop.cycle_length, uop.wavefront_id, uop.work_group_id);
            state.interval.completed(uop.cycle_length, uop.wavefront_id, uop.work_group_id);
            state.num_instructions += 1;
            ctx.retire_uop(&uop, "lds");
        }
    }

    fn write(&mut self, ctx: &mut UnitCtx) {
        let state = &mut self.state;
        let width = self.cfg.width;
        let mut processed = 0;
        while let Some(uop) = state.exec_buffer.get_mut(0) {
            processed += 1;

            if uop.lds_witness.pending() {
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
            let begin = uop.ready(Stage::Execute);
            uop.enter_stage(Stage::Write, begin, ctx.cycle, self.cfg.write_latency);
            state.status.write = StageStatus::Active;
            log::trace!(
                "si.inst id={} cu={} wf={} uop_id={} stg=\"lds-w\"",
                uop.id_in_compute_unit,
                ctx.cu_index,
                uop.wavefront_id,
                uop.id_in_wavefront
            );
            state.write_buffer.enqueue(uop);
        }
    }

    /// Memory stage: launch every recorded work-item access into the LDS
    /// module and park the uop in the in-flight buffer.
    fn mem(&mut self, ctx: &mut UnitCtx) {
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
            assert!(
                uop.lds_read || uop.lds_write,
                "data-share uop without a recorded access"
            );

            for info in &uop.work_item_info {
                for access in &info.lds_accesses {
                    let kind = match access.kind {
                        LdsAccessKind::Read => AccessKind::Load,
                        LdsAccessKind::Write => AccessKind::Store,
                    };
                    ctx.lds.access(kind, access.addr, &uop.lds_witness);
                }
            }

            let begin = uop.ready(Stage::Read);
            uop.enter_stage(Stage::Execute, begin, ctx.cycle, 0);
            state.status.execute = StageStatus::Active;
            log::trace!(
                "si.inst id={} cu={} wf={} uop_id={} stg=\"lds-m\"",
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
                tag: "lds-r",
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
                tag: "lds-d",
            },
            status,
            overview,
            interval,
            *kind,
            ctx,
        );
    }
}

impl ExecutionUnit for LdsUnit {
    fn state(&self) -> &ExecUnitState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ExecUnitState {
        &mut self.state
    }

    fn is_valid_uop(&self, uop: &Uop) -> bool {
        uop.instruction.format == Format::Ds
    }

    fn issue(&mut self, uop: Uop, ctx: &mut UnitCtx) {
        ctx.cu_stats.num_lds_insts += 1;
        ctx.entry_mut(&uop).lgkm_cnt += 1;
        self.state.push_issued(uop, ctx.cycle, ctx.config.issue_latency);
    }

    fn run(&mut self, ctx: &mut UnitCtx) {
        self.state.pre_run();
        self.complete(ctx);
        self.write(ctx);
        self.mem(ctx);
        self.read(ctx);
        self.decode(ctx);
        self.state.post_run(ctx.cycle, ctx.config.statistics_sampling_cycle);
    }
}
