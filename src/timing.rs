use crate::config::Config;
use crate::gpu::{DispatchError, Gpu};
use crate::kernel::NDRange;
use crate::mem::Mmu;
use crate::Cycle;
use serde::Serialize;
use std::sync::Arc;

/// Why a run stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum HaltReason {
    /// The dispatched ND-range completed.
    Finished,
    /// The cycle limit was reached.
    MaxCycles,
    /// Enough wavefronts completed.
    WavefrontLimit,
}

/// Outcome of one timing run.
#[derive(Clone, Debug, Serialize)]
pub struct RunSummary {
    pub cycles: Cycle,
    pub last_complete_cycle: Cycle,
    pub completed_wavefronts: u64,
    pub halt: HaltReason,
}

/// Timing driver: owns the GPU and the cycle counter and runs the
/// cooperative cycle loop until the dispatch completes or a halt
/// condition fires.
#[derive(Debug)]
pub struct Timing {
    pub gpu: Gpu,
    config: Arc<Config>,
    cycle: Cycle,
    /// Wavefronts of the current dispatch, for the ratio halt condition.
    dispatched_wavefronts: u64,
}

impl Timing {
    pub fn new(config: Config) -> std::io::Result<Self> {
        let config = Arc::new(config);
        let gpu = Gpu::new(Arc::clone(&config))?;
        Ok(Self {
            gpu,
            config,
            cycle: 0,
            dispatched_wavefronts: 0,
        })
    }

    #[must_use]
    pub fn cycle(&self) -> Cycle {
        self.cycle
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn mmu_mut(&mut self) -> &mut Mmu {
        self.gpu.mmu_mut()
    }

    /// Dispatch an ND-range. Fails when its work groups cannot fit a
    /// compute unit or when another dispatch is still running.
    pub fn dispatch(&mut self, ndrange: NDRange) -> Result<(), DispatchError> {
        self.dispatched_wavefronts = ndrange.total_wavefronts;
        self.gpu.map_ndrange(ndrange, self.cycle)
    }

    /// Advance the device by one cycle.
    pub fn run_cycle(&mut self) {
        self.cycle += 1;
        self.gpu.run(self.cycle);
    }

    fn wavefront_limit_reached(&self) -> bool {
        let completed = self.gpu.shared.sched.completed_wavefronts;
        if self.config.max_wavefront_count > 0 && completed >= self.config.max_wavefront_count {
            return true;
        }
        if self.config.max_wavefront_ratio > 0.0 && self.dispatched_wavefronts > 0 {
            let ratio = completed as f64 / self.dispatched_wavefronts as f64;
            if ratio >= self.config.max_wavefront_ratio {
                return true;
            }
        }
        false
    }

    /// Run until the dispatch completes or a halt condition fires, then
    /// flush statistics.
    pub fn run_to_completion(&mut self) -> RunSummary {
        let halt = loop {
            if self.gpu.is_idle() {
                break HaltReason::Finished;
            }
            if self.config.max_cycles > 0 && self.cycle >= self.config.max_cycles {
                break HaltReason::MaxCycles;
            }
            if self.wavefront_limit_reached() {
                break HaltReason::WavefrontLimit;
            }
            self.run_cycle();
        };

        log::info!(
            "halted at cycle {} ({:?}), {} wavefronts completed",
            self.cycle,
            halt,
            self.gpu.shared.sched.completed_wavefronts
        );

        self.gpu.unmap_ndrange(self.cycle);
        self.gpu.flush_stats(self.cycle);

        RunSummary {
            cycles: self.cycle,
            last_complete_cycle: self.gpu.shared.sched.last_complete_cycle,
            completed_wavefronts: self.gpu.shared.sched.completed_wavefronts,
            halt,
        }
    }
}
