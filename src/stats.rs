use crate::Cycle;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use strum::{Display, EnumIter};

/// Execution-unit kinds, in the order the per-entity stall columns are
/// dumped.
#[derive(Clone, Copy, Debug, Display, EnumIter, PartialEq, Eq, Hash)]
pub enum UnitKind {
    #[strum(serialize = "brch")]
    Branch = 0,
    #[strum(serialize = "lds")]
    Lds = 1,
    #[strum(serialize = "sclr")]
    Scalar = 2,
    #[strum(serialize = "vmem")]
    VectorMemory = 3,
    #[strum(serialize = "simd")]
    Simd = 4,
}

pub const NUM_UNIT_KINDS: usize = 5;

/// Per-stage stall counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StallCounters {
    pub issue: u64,
    pub decode: u64,
    pub read: u64,
    pub execution: u64,
    pub write: u64,
}

impl StallCounters {
    pub fn bump(&mut self, stage: crate::uop::Stage) {
        use crate::uop::Stage;
        match stage {
            Stage::Issue => self.issue += 1,
            Stage::Decode => self.decode += 1,
            Stage::Read => self.read += 1,
            Stage::Execute => self.execution += 1,
            Stage::Write => self.write += 1,
            Stage::Fetch => unreachable!("fetch does not stall on a buffer"),
        }
    }
}

/// Life-cycle events of a simulated entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CycleEvent {
    Mapped,
    Unmapped,
    /// First uop of the entity entered the pipeline.
    Start,
    /// A uop of the entity completed.
    Finish,
}

/// Cycle statistics of one wavefront, work-group or ND-range.
#[derive(Clone, Debug, Default)]
pub struct CycleStats {
    cycle_mapped: Cycle,
    cycle_unmapped: Cycle,
    cycle_start: Cycle,
    cycle_finish: Cycle,

    pub stalls: StallCounters,
    pub per_unit: [StallCounters; NUM_UNIT_KINDS],
}

impl CycleStats {
    pub fn set_cycle(&mut self, cycle: Cycle, event: CycleEvent) {
        match event {
            CycleEvent::Mapped => {
                if self.cycle_mapped == 0 {
                    self.cycle_mapped = cycle;
                }
            }
            CycleEvent::Unmapped => {
                if self.cycle_unmapped == 0 {
                    self.cycle_unmapped = cycle;
                }
            }
            CycleEvent::Start => {
                if self.cycle_start == 0 {
                    self.cycle_start = cycle;
                } else {
                    self.cycle_start = self.cycle_start.min(cycle);
                }
            }
            CycleEvent::Finish => {
                self.cycle_finish = self.cycle_finish.max(cycle);
            }
        }
    }

    pub fn stalls_mut(&mut self, kind: UnitKind) -> &mut StallCounters {
        &mut self.per_unit[kind as usize]
    }

    /// One CSV row, column order frozen: map window, uop window, then the
    /// five stall counters overall and per unit kind.
    #[must_use]
    pub fn row(&self) -> String {
        let mut fields: Vec<String> = vec![
            (self.cycle_unmapped as i64 - self.cycle_mapped as i64).to_string(),
            self.cycle_mapped.to_string(),
            self.cycle_unmapped.to_string(),
            (self.cycle_finish as i64 - self.cycle_start as i64).to_string(),
            self.cycle_start.to_string(),
            self.cycle_finish.to_string(),
        ];
        let mut push = |s: &StallCounters| {
            fields.extend([
                s.issue.to_string(),
                s.decode.to_string(),
                s.read.to_string(),
                s.execution.to_string(),
                s.write.to_string(),
            ]);
        };
        push(&self.stalls);
        for counters in &self.per_unit {
            push(counters);
        }
        fields.join(",")
    }
}

/// Stall-column header fragment shared by the work-group and wavefront
/// files. The trailing underscore on the last column is part of the frozen
/// schema.
pub const STALL_COLUMNS: &str = "num_stall_issue,num_stall_decode,num_stall_read,\
num_stall_execution,num_stall_write,\
brch_num_stall_issue,brch_num_stall_decode,brch_num_stall_read,\
brch_num_stall_execution,brch_num_stall_write,\
lds_num_stall_issue,lds_num_stall_decode,lds_num_stall_read,\
lds_num_stall_execution,lds_num_stall_write,\
sclr_num_stall_issue,sclr_num_stall_decode,sclr_num_stall_read,\
sclr_num_stall_execution,sclr_num_stall_write,\
vmem_num_stall_issue,vmem_num_stall_decode,vmem_num_stall_read,\
vmem_num_stall_execution,vmem_num_stall_write,\
simd_num_stall_issue,simd_num_stall_decode,simd_num_stall_read,\
simd_num_stall_execution,simd_num_stall_write_";

/// Aggregate counters of one execution unit, kept twice per unit: an
/// overview accumulated over the whole run and an interval slice reset at
/// every sampling boundary.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UnitStats {
    pub num_total_cycles: u64,
    pub num_idle_cycles: u64,
    pub num_active_or_stall_cycles: u64,
    pub num_active_only_cycles: u64,
    pub num_active_and_stall_cycles: u64,
    pub num_stall_only_cycles: u64,

    pub stalls: StallCounters,
    pub num_vmem_divergence: u64,

    pub num_inst_issued: u64,
    pub num_inst_in_progress: u64,
    pub num_inst_completed: u64,

    pub len_inst_min: u64,
    pub len_inst_max: u64,
    pub len_inst_sum: u64,
    pub wf_id_inst_min: i64,
    pub wf_id_inst_max: i64,
    pub wg_id_inst_min: i64,
    pub wg_id_inst_max: i64,
}

impl UnitStats {
    pub fn reset(&mut self) {
        *self = Self {
            wf_id_inst_min: -1,
            wf_id_inst_max: -1,
            wg_id_inst_min: -1,
            wg_id_inst_max: -1,
            ..Self::default()
        };
    }

    pub fn issued(&mut self) {
        self.num_inst_issued += 1;
        self.num_inst_in_progress += 1;
    }

    /// Fold a finished uop into the length histogram.
    pub fn completed(&mut self, cycle_length: Cycle, wavefront_id: usize, work_group_id: usize) {
        self.len_inst_sum += cycle_length;
        if cycle_length > self.len_inst_max {
            self.len_inst_max = cycle_length;
            self.wf_id_inst_max = wavefront_id as i64;
            self.wg_id_inst_max = work_group_id as i64;
        } else if cycle_length < self.len_inst_min || self.len_inst_min == 0 {
            self.len_inst_min = cycle_length;
            self.wf_id_inst_min = wavefront_id as i64;
            self.wg_id_inst_min = work_group_id as i64;
        }
        self.num_inst_completed += 1;
        self.num_inst_in_progress = self.num_inst_in_progress.saturating_sub(1);
    }

    /// Classify the cycle from the per-stage statuses.
    pub fn classify_cycle(&mut self, idle: bool, any_active: bool, any_stall: bool) {
        self.num_total_cycles += 1;
        if idle {
            self.num_idle_cycles += 1;
            return;
        }
        self.num_active_or_stall_cycles += 1;
        if any_stall {
            if any_active {
                self.num_active_and_stall_cycles += 1;
            } else {
                self.num_stall_only_cycles += 1;
            }
        } else {
            self.num_active_only_cycles += 1;
        }
    }

    #[must_use]
    pub fn counter_header() -> &'static str {
        "interval,c_total,c_actv|c_stll,c_idle,c_actv,c_actv&c_stll,c_stll,\
n_stll_iss,n_stll_dec,n_stll_rea,n_stll_exe,n_stll_wrt,n_vmem_dvg,\
n_inst_iss,n_inst_wip,n_inst_cpl,\
l_inst_min,i_inst_min_wf_id,i_inst_min_wg_id,\
l_inst_max,i_inst_max_wf_id,i_inst_max_wg_id,\
l_inst_avg,l_inst_sum,\
u_actv|stll,u_idle,u_actv,u_actv&stll,u_stll"
    }

    #[must_use]
    pub fn row(&self, interval: u64) -> String {
        let ratio = |count: u64| {
            if self.num_total_cycles == 0 {
                0.0
            } else {
                count as f64 / self.num_total_cycles as f64
            }
        };
        format!(
            "{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{:.2},{:.2},{:.2},{:.2},{:.2}",
            interval,
            self.num_total_cycles,
            self.num_active_or_stall_cycles,
            self.num_idle_cycles,
            self.num_active_only_cycles,
            self.num_active_and_stall_cycles,
            self.num_stall_only_cycles,
            self.stalls.issue,
            self.stalls.decode,
            self.stalls.read,
            self.stalls.execution,
            self.stalls.write,
            self.num_vmem_divergence,
            self.num_inst_issued,
            self.num_inst_in_progress,
            self.num_inst_completed,
            self.len_inst_min,
            self.wf_id_inst_min,
            self.wg_id_inst_min,
            self.len_inst_max,
            self.wf_id_inst_max,
            self.wg_id_inst_max,
            if self.num_inst_completed == 0 {
                0
            } else {
                self.len_inst_sum / self.num_inst_completed
            },
            self.len_inst_sum,
            ratio(self.num_active_or_stall_cycles),
            ratio(self.num_idle_cycles),
            ratio(self.num_active_only_cycles),
            ratio(self.num_active_and_stall_cycles),
            ratio(self.num_stall_only_cycles),
        )
    }
}

/// Instruction-mix counters of one compute unit.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ComputeUnitStats {
    pub num_total_insts: u64,
    pub num_branch_insts: u64,
    pub num_scalar_alu_insts: u64,
    pub num_scalar_memory_insts: u64,
    pub num_simd_insts: u64,
    pub num_vector_memory_insts: u64,
    pub num_lds_insts: u64,
    pub num_mapped_work_groups: u64,
}

/// Line-oriented CSV sink.
#[derive(Debug)]
pub struct StatsFile {
    writer: BufWriter<File>,
}

impl StatsFile {
    /// Create `<dir>/<name>` and write the header line.
    pub fn create(dir: &Path, name: &str, header: &str) -> std::io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let file = File::create(dir.join(name))?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "{header}")?;
        Ok(Self { writer })
    }

    pub fn write_row(&mut self, row: &str) {
        // A failed statistics write must not kill the simulation.
        if let Err(err) = writeln!(self.writer, "{row}") {
            log::error!("statistics write failed: {err}");
        }
    }

    pub fn flush(&mut self) {
        if let Err(err) = self.writer.flush() {
            log::error!("statistics flush failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_stats_first_event_wins() {
        let mut stats = CycleStats::default();
        stats.set_cycle(10, CycleEvent::Mapped);
        stats.set_cycle(20, CycleEvent::Mapped);
        stats.set_cycle(15, CycleEvent::Start);
        stats.set_cycle(12, CycleEvent::Start);
        stats.set_cycle(30, CycleEvent::Finish);
        stats.set_cycle(25, CycleEvent::Finish);
        stats.set_cycle(40, CycleEvent::Unmapped);
        let row = stats.row();
        assert!(row.starts_with("30,10,40,18,12,30,"));
    }

    #[test]
    fn cycle_stats_row_has_36_columns() {
        let stats = CycleStats::default();
        assert_eq!(stats.row().split(',').count(), 36);
        assert_eq!(STALL_COLUMNS.split(',').count(), 30);
    }

    #[test]
    fn unit_stats_classification() {
        let mut stats = UnitStats::default();
        stats.classify_cycle(true, false, false);
        stats.classify_cycle(false, true, false);
        stats.classify_cycle(false, true, true);
        stats.classify_cycle(false, false, true);
        assert_eq!(stats.num_total_cycles, 4);
        assert_eq!(stats.num_idle_cycles, 1);
        assert_eq!(stats.num_active_only_cycles, 1);
        assert_eq!(stats.num_active_and_stall_cycles, 1);
        assert_eq!(stats.num_stall_only_cycles, 1);
    }

    #[test]
    fn unit_stats_length_extremes() {
        let mut stats = UnitStats::default();
        stats.reset();
        stats.issued();
        stats.issued();
        stats.completed(10, 1, 0);
        stats.completed(4, 2, 0);
        assert_eq!(stats.len_inst_max, 10);
        assert_eq!(stats.wf_id_inst_max, 1);
        assert_eq!(stats.len_inst_min, 4);
        assert_eq!(stats.wf_id_inst_min, 2);
        assert_eq!(stats.num_inst_in_progress, 0);
        assert_eq!(stats.row(0).split(',').count(), 29);
        assert_eq!(UnitStats::counter_header().split(',').count(), 29);
    }
}
