use crate::compute_unit::UnitCtx;
use crate::fifo::Fifo;
use crate::stats::{StatsFile, UnitKind, UnitStats};
use crate::uop::{Stage, Uop};
use crate::Cycle;
use std::path::Path;

/// Status of one pipeline stage during the current cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StageStatus {
    #[default]
    Idle,
    Active,
    Stall,
}

/// Per-cycle status of the five pipeline stages of one execution unit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipelineStatus {
    pub issue: StageStatus,
    pub decode: StageStatus,
    pub read: StageStatus,
    pub execute: StageStatus,
    pub write: StageStatus,
}

impl PipelineStatus {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn set(&mut self, stage: Stage, status: StageStatus) {
        match stage {
            Stage::Issue => self.issue = status,
            Stage::Decode => self.decode = status,
            Stage::Read => self.read = status,
            Stage::Execute => self.execute = status,
            Stage::Write => self.write = status,
            Stage::Fetch => unreachable!("fetch is not a unit pipeline stage"),
        }
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.all(StageStatus::Idle)
    }

    #[must_use]
    pub fn any_active(&self) -> bool {
        self.any(StageStatus::Active)
    }

    #[must_use]
    pub fn any_stall(&self) -> bool {
        self.any(StageStatus::Stall)
    }

    fn all(&self, status: StageStatus) -> bool {
        [self.issue, self.decode, self.read, self.execute, self.write]
            .iter()
            .all(|s| *s == status)
    }

    fn any(&self, status: StageStatus) -> bool {
        [self.issue, self.decode, self.read, self.execute, self.write]
            .iter()
            .any(|s| *s == status)
    }
}

/// Pipeline skeleton shared by every execution unit: the inter-stage
/// buffers, the per-cycle stage statuses and the statistics taps.
#[derive(Debug)]
pub struct ExecUnitState {
    pub kind: UnitKind,
    /// Unit name used in traces and statistics file names.
    pub name: String,

    pub issue_buffer: Fifo<Uop>,
    pub decode_buffer: Fifo<Uop>,
    pub read_buffer: Fifo<Uop>,
    /// Execution buffer; the memory units use it as their in-flight
    /// memory buffer.
    pub exec_buffer: Fifo<Uop>,
    pub write_buffer: Fifo<Uop>,

    pub status: PipelineStatus,
    /// Uops completed by this unit.
    pub num_instructions: u64,

    pub overview: UnitStats,
    pub interval: UnitStats,
    overview_file: Option<StatsFile>,
    interval_file: Option<StatsFile>,
    last_dumped_interval: Option<u64>,
}

impl ExecUnitState {
    #[must_use]
    pub fn new(
        kind: UnitKind,
        name: impl Into<String>,
        issue_buffer_size: usize,
        decode_buffer_size: usize,
        read_buffer_size: usize,
        exec_buffer_size: usize,
        write_buffer_size: usize,
    ) -> Self {
        let mut overview = UnitStats::default();
        let mut interval = UnitStats::default();
        overview.reset();
        interval.reset();
        Self {
            kind,
            name: name.into(),
            issue_buffer: Fifo::bounded(issue_buffer_size),
            decode_buffer: Fifo::bounded(decode_buffer_size),
            read_buffer: Fifo::bounded(read_buffer_size),
            exec_buffer: Fifo::bounded(exec_buffer_size),
            write_buffer: Fifo::bounded(write_buffer_size),
            status: PipelineStatus::default(),
            num_instructions: 0,
            overview,
            interval,
            overview_file: None,
            interval_file: None,
            last_dumped_interval: None,
        }
    }

    /// Open the `cu_<i>_<unit>.overvw` and `.intrvl` statistics files.
    pub fn enable_stats_files(&mut self, dir: &Path, cu_index: usize) -> std::io::Result<()> {
        let header = UnitStats::counter_header();
        self.overview_file = Some(StatsFile::create(
            dir,
            &format!("cu_{}_{}.overvw", cu_index, self.name),
            header,
        )?);
        self.interval_file = Some(StatsFile::create(
            dir,
            &format!("cu_{}_{}.intrvl", cu_index, self.name),
            header,
        )?);
        Ok(())
    }

    #[must_use]
    pub fn can_issue(&self) -> bool {
        !self.issue_buffer.full()
    }

    /// Number of uops currently owned by any buffer of this unit.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.issue_buffer.len()
            + self.decode_buffer.len()
            + self.read_buffer.len()
            + self.exec_buffer.len()
            + self.write_buffer.len()
    }

    /// Base issue: spend the issue latency and park the uop in the issue
    /// buffer. Unit-specific issue bookkeeping happens in the caller.
    pub fn push_issued(&mut self, mut uop: Uop, cycle: Cycle, issue_latency: Cycle) {
        debug_assert_eq!(uop.ready(Stage::Issue), 0);
        assert!(self.can_issue(), "{}: issue into a full buffer", self.name);
        uop.set_ready(Stage::Issue, cycle + issue_latency);
        log::trace!(
            "si.inst id={} cu={} wf={} uop_id={} stg=\"i\"",
            uop.id_in_compute_unit,
            uop.compute_unit_index,
            uop.wavefront_id,
            uop.id_in_wavefront
        );
        self.issue_buffer.enqueue(uop);
        self.overview.issued();
        self.interval.issued();
        self.status.issue = StageStatus::Active;
    }

    /// Charge an issue stall observed while a uop waited in the fetch
    /// buffer for this unit.
    pub fn bump_issue_stall(&mut self) {
        self.overview.stalls.issue += 1;
        self.interval.stalls.issue += 1;
    }

    /// Reset the stage statuses at the top of the cycle.
    pub fn pre_run(&mut self) {
        self.status.reset();
    }

    /// Dump the finished sampling interval and fold the cycle's stage
    /// statuses into the aggregate counters.
    pub fn post_run(&mut self, cycle: Cycle, sampling_interval: u64) {
        if self.interval_file.is_some() && sampling_interval > 0 {
            let interval_index = cycle / sampling_interval;
            let on_boundary = cycle % sampling_interval == 0;
            let already_dumped = self.last_dumped_interval == Some(interval_index);
            if on_boundary && !already_dumped {
                let row = self.interval.row(interval_index * sampling_interval);
                if let Some(file) = &mut self.interval_file {
                    file.write_row(&row);
                }
                self.interval.reset();
                self.last_dumped_interval = Some(interval_index);
            }
        }

        let idle = self.status.is_idle();
        let any_active = self.status.any_active();
        let any_stall = self.status.any_stall();
        self.overview.classify_cycle(idle, any_active, any_stall);
        self.interval.classify_cycle(idle, any_active, any_stall);
    }

    /// Write the final overview row and the trailing interval slice.
    pub fn flush_stats(&mut self, cycle: Cycle, sampling_interval: u64) {
        if let Some(file) = &mut self.overview_file {
            file.write_row(&self.overview.row(cycle));
            file.flush();
        }
        if let Some(file) = &mut self.interval_file {
            let interval = if sampling_interval == 0 {
                cycle
            } else {
                (cycle / sampling_interval) * sampling_interval
            };
            file.write_row(&self.interval.row(interval));
            file.flush();
        }
    }
}

/// Parameters of one generic pipeline stage transition.
#[derive(Clone, Copy, Debug)]
pub(crate) struct StageSpec {
    /// Stage performing the work this cycle.
    pub stage: Stage,
    /// Stage whose `ready` cycle gates entry.
    pub prev: Stage,
    pub latency: Cycle,
    pub width: usize,
    /// Trace tag, e.g. `"su-r"`.
    pub tag: &'static str,
}

/// Advance uops from `src` to `dst` following the shared per-stage
/// protocol: oldest first, stop on a not-yet-ready uop (previous stage
/// still active), stall on exceeded width or a full destination, otherwise
/// spend the stage latency and hand the uop over.
pub(crate) fn advance_stage(
    src: &mut Fifo<Uop>,
    dst: &mut Fifo<Uop>,
    spec: StageSpec,
    status: &mut PipelineStatus,
    overview: &mut UnitStats,
    interval: &mut UnitStats,
    kind: UnitKind,
    ctx: &mut UnitCtx,
) {
    let mut processed = 0;
    while let Some(uop) = src.get_mut(0) {
        processed += 1;

        if ctx.cycle < uop.ready(spec.prev) {
            status.set(spec.prev, StageStatus::Active);
            break;
        }

        if processed > spec.width || dst.full() {
            uop.bump_stall(spec.stage);
            status.set(spec.stage, StageStatus::Stall);
            overview.stalls.bump(spec.stage);
            interval.stalls.bump(spec.stage);
            ctx.record_stall(uop, kind, spec.stage);
            break;
        }

        let mut uop = src.dequeue().expect("head checked above");
        let begin = uop.ready(spec.prev);
        uop.enter_stage(spec.stage, begin, ctx.cycle, spec.latency);
        status.set(spec.stage, StageStatus::Active);
        log::trace!(
            "si.inst id={} cu={} wf={} uop_id={} stg=\"{}\"",
            uop.id_in_compute_unit,
            uop.compute_unit_index,
            uop.wavefront_id,
            uop.id_in_wavefront,
            spec.tag
        );
        dst.enqueue(uop);
    }
}

/// Common surface of the five execution-unit variants.
pub trait ExecutionUnit {
    fn state(&self) -> &ExecUnitState;
    fn state_mut(&mut self) -> &mut ExecUnitState;

    /// Whether this unit executes the given uop's instruction class.
    fn is_valid_uop(&self, uop: &Uop) -> bool;

    /// Accept a uop from the fetch buffer.
    fn issue(&mut self, uop: Uop, ctx: &mut UnitCtx);

    /// Advance all pipeline stages by one cycle, in reverse order.
    fn run(&mut self, ctx: &mut UnitCtx);

    fn can_issue(&self) -> bool {
        self.state().can_issue()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_status_classification() {
        let mut status = PipelineStatus::default();
        assert!(status.is_idle());
        status.set(Stage::Decode, StageStatus::Active);
        assert!(!status.is_idle());
        assert!(status.any_active());
        assert!(!status.any_stall());
        status.set(Stage::Write, StageStatus::Stall);
        assert!(status.any_stall());
        status.reset();
        assert!(status.is_idle());
    }

    #[test]
    fn state_tracks_in_flight() {
        let state = ExecUnitState::new(UnitKind::Scalar, "scalar", 4, 1, 1, 32, 1);
        assert!(state.can_issue());
        assert_eq!(state.in_flight(), 0);
        assert_eq!(state.issue_buffer.capacity(), Some(4));
    }
}
