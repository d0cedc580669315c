use crate::compute_unit::UnitCtx;
use crate::config::{Config, ExecUnitConfig};
use crate::exec_unit::{advance_stage, ExecUnitState, ExecutionUnit, StageSpec, StageStatus};
use crate::stats::UnitKind;
use crate::uop::{Stage, Uop};

/// Branch execution unit.
///
/// Handles the SOPP branch opcode range. Branches hold their wavefront
/// until completion; Complete re-readies the pool entry so the next
/// instruction can be fetched.
#[derive(Debug)]
pub struct BranchUnit {
    cfg: ExecUnitConfig,
    state: ExecUnitState,
}

impl BranchUnit {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        let cfg = config.branch_unit.clone();
        let state = ExecUnitState::new(
            UnitKind::Branch,
            "branch",
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
        while let Some(uop) = state.write_buffer.first() {
            if ctx.cycle < uop.ready(Stage::Write) {
                state.status.write = StageStatus::Active;
                break;
            }
            let mut uop = state.write_buffer.dequeue().expect("head checked above");
            uop.cycle_finish = ctx.cycle;
            uop.cycle_length = uop.cycle_finish - uop.cycle_start;
            state.status.write = StageStatus::Active;

            // Allow the next instruction to be fetched.
            ctx.entry_mut(&uop).ready = true;

            state.overview.completed(uop.cycle_length, uop.wavefront_id, uop.work_group_id);
            state.interval.completed(uop.cycle_length, uop.wavefront_id, uop.work_group_id);
            state.num_instructions += 1;
            ctx.retire_uop(&uop, "branch");
        }
    }

    fn write(&mut self, ctx: &mut UnitCtx) {
        let ExecUnitState {
            exec_buffer,
            write_buffer,
            status,
            overview,
            interval,
            kind,
            ..
        } = &mut self.state;
        advance_stage(
            exec_buffer,
            write_buffer,
            StageSpec {
                stage: Stage::Write,
                prev: Stage::Execute,
                latency: self.cfg.write_latency,
                width: self.cfg.width,
                tag: "bu-w",
            },
            status,
            overview,
            interval,
            *kind,
            ctx,
        );
    }

    fn execute(&mut self, ctx: &mut UnitCtx) {
        let ExecUnitState {
            read_buffer,
            exec_buffer,
            status,
            overview,
            interval,
            kind,
            ..
        } = &mut self.state;
        advance_stage(
            read_buffer,
            exec_buffer,
            StageSpec {
                stage: Stage::Execute,
                prev: Stage::Read,
                latency: self.cfg.exec_latency,
                width: self.cfg.width,
                tag: "bu-e",
            },
            status,
            overview,
            interval,
            *kind,
            ctx,
        );
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
                tag: "bu-r",
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
                tag: "bu-d",
            },
            status,
            overview,
            interval,
            *kind,
            ctx,
        );
    }
}

impl ExecutionUnit for BranchUnit {
    fn state(&self) -> &ExecUnitState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ExecUnitState {
        &mut self.state
    }

    fn is_valid_uop(&self, uop: &Uop) -> bool {
        uop.instruction.is_branch()
    }

    fn issue(&mut self, uop: Uop, ctx: &mut UnitCtx) {
        ctx.cu_stats.num_branch_insts += 1;
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
