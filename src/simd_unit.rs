use crate::compute_unit::UnitCtx;
use crate::config::{Config, SimdUnitConfig};
use crate::exec_unit::{advance_stage, ExecUnitState, ExecutionUnit, StageSpec, StageStatus};
use crate::stats::UnitKind;
use crate::uop::{Stage, Uop};

/// SIMD vector-ALU unit, one per wavefront pool.
///
/// The pipeline is compressed to decode, execute and complete: read,
/// execute and write of all sub-wavefronts are charged as one pipelined
/// `read_exec_write_latency`. Execute re-readies the wavefront for the
/// next cycle, which is what lets independent ALU instructions stream.
#[derive(Debug)]
pub struct SimdUnit {
    pub id: usize,
    cfg: SimdUnitConfig,
    state: ExecUnitState,
}

impl SimdUnit {
    #[must_use]
    pub fn new(config: &Config, id: usize) -> Self {
        let cfg = config.simd_unit.clone();
        // No separate read or write buffers in the compressed pipeline.
        let state = ExecUnitState::new(
            UnitKind::Simd,
            format!("simd{id}"),
            cfg.issue_buffer_size,
            cfg.decode_buffer_size,
            0,
            cfg.exec_buffer_size,
            0,
        );
        Self { id, cfg, state }
    }

    fn complete(&mut self, ctx: &mut UnitCtx) {
        let state = &mut self.state;
        while let Some(uop) = state.exec_buffer.first() {
            if ctx.cycle < uop.ready(Stage::Execute) {
                state.status.read = StageStatus::Active;
                state.status.execute = StageStatus::Active;
                break;
            }
            let mut uop = state.exec_buffer.dequeue().expect("head checked above");
            uop.cycle_finish = ctx.cycle;
            uop.cycle_length = uop.cycle_finish - uop.cycle_start;
            state.status.write = StageStatus::Active;
            state.overview.completed(uop.cycle_length, uop.wavefront_id, uop.work_group_id);
            state.interval.completed(uop.cycle_length, uop.wavefront_id, uop.work_group_id);
            state.num_instructions += 1;
            ctx.retire_uop(&uop, &state.name);
        }
    }

    fn execute(&mut self, ctx: &mut UnitCtx) {
        let state = &mut self.state;
        let width = self.cfg.width;
        let mut processed = 0;
        while let Some(uop) = state.decode_buffer.get_mut(0) {
            processed += 1;

            if ctx.cycle < uop.ready(Stage::Decode) {
                state.status.decode = StageStatus::Active;
                break;
            }

            if processed > width || state.exec_buffer.full() {
                uop.bump_stall(Stage::Execute);
                state.status.read = StageStatus::Stall;
                state.status.execute = StageStatus::Stall;
                state.status.write = StageStatus::Stall;
                state.overview.stalls.read += 1;
                state.overview.stalls.execution += 1;
                state.overview.stalls.write += 1;
                state.interval.stalls.read += 1;
                state.interval.stalls.execution += 1;
                state.interval.stalls.write += 1;
                ctx.record_stall(uop, state.kind, Stage::Execute);
                break;
            }

            let mut uop = state.decode_buffer.dequeue().expect("head checked above");

            // The compressed stage spans the whole read-execute-write
            // window; the inner read and write timestamps are synthesized
            // for the life-cycle record.
            let decode_ready = uop.ready(Stage::Decode);
            let inner_read_latency = 1;
            let inner_write_latency = 1;
            uop.enter_stage(Stage::Read, decode_ready, decode_ready, inner_read_latency);
            let read_ready = uop.ready(Stage::Read);
            {
                let execute = uop.stage_mut(Stage::Execute);
                execute.begin = read_ready;
                execute.active = read_ready + execute.stall;
                execute.ready = ctx.cycle + self.cfg.read_exec_write_latency;
            }
            let execute_ready = uop.ready(Stage::Execute);
            {
                let write = uop.stage_mut(Stage::Write);
                write.begin = execute_ready - inner_write_latency;
                write.active = execute_ready - inner_write_latency;
                write.ready = execute_ready;
            }

            state.status.read = StageStatus::Active;
            state.status.execute = StageStatus::Active;
            state.status.write = StageStatus::Active;

            // The wavefront may fetch its next instruction while this one
            // drains through the ALU pipeline.
            ctx.entry_mut(&uop).ready_next_cycle = true;

            log::trace!(
                "si.inst id={} cu={} wf={} uop_id={} stg=\"simd-e\"",
                uop.id_in_compute_unit,
                ctx.cu_index,
                uop.wavefront_id,
                uop.id_in_wavefront
            );
            state.exec_buffer.enqueue(uop);
        }
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
                tag: "simd-d",
            },
            status,
            overview,
            interval,
            *kind,
            ctx,
        );
    }
}

impl ExecutionUnit for SimdUnit {
    fn state(&self) -> &ExecUnitState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ExecUnitState {
        &mut self.state
    }

    fn is_valid_uop(&self, uop: &Uop) -> bool {
        uop.instruction.format.is_vector_alu()
    }

    fn issue(&mut self, uop: Uop, ctx: &mut UnitCtx) {
        ctx.cu_stats.num_simd_insts += 1;
        self.state.push_issued(uop, ctx.cycle, ctx.config.issue_latency);
    }

    fn run(&mut self, ctx: &mut UnitCtx) {
        self.state.pre_run();
        self.complete(ctx);
        self.execute(ctx);
        self.decode(ctx);
        self.state.post_run(ctx.cycle, ctx.config.statistics_sampling_cycle);
    }
}
