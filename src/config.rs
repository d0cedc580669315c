use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Granularity at which vector registers are reserved for a work-group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegisterAllocationGranularity {
    Wavefront,
    WorkGroup,
}

/// Initial-PC mix pattern used when a kernel carries a second entry point.
///
/// Selects which wavefronts of a work-group start at the second entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MixPattern {
    /// Wavefronts with id above the ratio threshold take the second entry.
    #[default]
    GreaterThan,
    /// Wavefronts with id below the ratio threshold take the second entry.
    LessThan,
    /// Random selection weighted by the mix ratio.
    Random,
    /// Alternating strides of wavefronts.
    RoundRobin,
}

impl MixPattern {
    fn from_env_value(value: i32) -> Self {
        match value {
            1 => Self::LessThan,
            2 => Self::Random,
            3 => Self::RoundRobin,
            _ => Self::GreaterThan,
        }
    }
}

/// Timing parameters of one scalar-style execution unit pipeline.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecUnitConfig {
    /// Max uops that may advance from one stage per cycle.
    pub width: usize,
    pub issue_buffer_size: usize,
    pub decode_latency: u64,
    pub decode_buffer_size: usize,
    pub read_latency: u64,
    pub read_buffer_size: usize,
    pub exec_latency: u64,
    pub exec_buffer_size: usize,
    pub write_latency: u64,
    pub write_buffer_size: usize,
}

/// Timing parameters of the SIMD vector-ALU pipeline.
///
/// Read, execute and write of all sub-wavefronts are modeled as a single
/// pipelined latency.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimdUnitConfig {
    pub width: usize,
    pub num_simd_lanes: usize,
    pub issue_buffer_size: usize,
    pub decode_latency: u64,
    pub decode_buffer_size: usize,
    pub read_exec_write_latency: u64,
    pub exec_buffer_size: usize,
}

/// Timing parameters of a memory-style execution unit pipeline (LDS and
/// vector memory). The execute stage is replaced by an in-flight memory
/// buffer bounded by `max_inflight_mem_accesses`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemUnitConfig {
    pub width: usize,
    pub issue_buffer_size: usize,
    pub decode_latency: u64,
    pub decode_buffer_size: usize,
    pub read_latency: u64,
    pub read_buffer_size: usize,
    pub max_inflight_mem_accesses: usize,
    pub write_latency: u64,
    pub write_buffer_size: usize,
}

/// Full device configuration.
///
/// All knobs are plain numbers so a configuration can be serialized and
/// diffed between runs. Environment overrides are folded in once by
/// [`Config::from_env`]; the hot loops never consult the process environment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub num_compute_units: usize,
    pub num_wavefront_pools: usize,
    pub max_wavefronts_per_pool: usize,
    pub max_work_groups_per_pool: usize,

    pub fetch_latency: u64,
    pub fetch_width: usize,
    pub fetch_buffer_size: usize,
    pub issue_latency: u64,
    pub issue_width: usize,
    pub max_instructions_issued_per_type: usize,

    pub branch_unit: ExecUnitConfig,
    pub scalar_unit: ExecUnitConfig,
    pub simd_unit: SimdUnitConfig,
    pub lds_unit: MemUnitConfig,
    pub vector_memory_unit: MemUnitConfig,

    pub lds_size: usize,
    pub lds_alloc_size: usize,
    pub lds_latency: u64,
    pub lds_block_size: usize,
    pub lds_num_ports: usize,

    pub register_allocation_size: usize,
    pub register_allocation_granularity: RegisterAllocationGranularity,
    pub num_scalar_registers: usize,
    pub num_vector_registers: usize,

    /// Completion latency of the per-unit scalar cache model.
    pub scalar_cache_latency: u64,
    /// Completion latency of the per-unit vector cache model.
    pub vector_cache_latency: u64,
    /// Admission bound of the vector cache model; accesses beyond this are
    /// rejected and retried by the vector memory unit.
    pub vector_cache_max_inflight: usize,

    /// Hard cycle limit; 0 disables the limit.
    pub max_cycles: u64,
    /// Halt once this many wavefronts completed; 0 disables.
    pub max_wavefront_count: u64,
    /// Halt once this fraction of the dispatched wavefronts completed;
    /// 0.0 disables.
    pub max_wavefront_ratio: f64,

    /// 0 = no statistics files, 1 = per-WF/WG/unit files, 2 = adds per-uop
    /// life-cycle records and ND-range attribution.
    pub statistics_level: u8,
    pub statistics_sampling_cycle: u64,
    /// Directory receiving the statistics CSV files.
    pub stats_dir: PathBuf,

    /// Rotate compute-unit order by cycle instead of fixed index order.
    pub rotate_compute_units: bool,
    /// Rotate the fetch order over wavefront pools by cycle.
    pub rotate_fetch: bool,
    /// Issue from the fullest fetch buffer instead of round-robin.
    pub fetch_pressure_scheduling: bool,
    /// Cap on work-groups per compute unit; checked against the hardware
    /// limit at dispatch.
    pub work_group_limit: Option<usize>,

    pub mix_ratio: f64,
    pub mix_pattern: MixPattern,
    /// Seed for the `Random` mix pattern. Runs with the same seed are
    /// reproducible.
    pub rng_seed: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_compute_units: 32,
            num_wavefront_pools: 4,
            max_wavefronts_per_pool: 10,
            max_work_groups_per_pool: 10,

            fetch_latency: 1,
            fetch_width: 1,
            fetch_buffer_size: 10,
            issue_latency: 1,
            issue_width: 5,
            max_instructions_issued_per_type: 1,

            branch_unit: ExecUnitConfig {
                width: 1,
                issue_buffer_size: 1,
                decode_latency: 1,
                decode_buffer_size: 1,
                read_latency: 1,
                read_buffer_size: 1,
                exec_latency: 16,
                exec_buffer_size: 16,
                write_latency: 1,
                write_buffer_size: 1,
            },
            scalar_unit: ExecUnitConfig {
                width: 1,
                issue_buffer_size: 4,
                decode_latency: 1,
                decode_buffer_size: 1,
                read_latency: 1,
                read_buffer_size: 1,
                exec_latency: 4,
                exec_buffer_size: 32,
                write_latency: 1,
                write_buffer_size: 1,
            },
            simd_unit: SimdUnitConfig {
                width: 1,
                num_simd_lanes: 16,
                issue_buffer_size: 1,
                decode_latency: 1,
                decode_buffer_size: 1,
                read_exec_write_latency: 8,
                exec_buffer_size: 2,
            },
            lds_unit: MemUnitConfig {
                width: 1,
                issue_buffer_size: 4,
                decode_latency: 1,
                decode_buffer_size: 1,
                read_latency: 1,
                read_buffer_size: 1,
                max_inflight_mem_accesses: 32,
                write_latency: 1,
                write_buffer_size: 1,
            },
            vector_memory_unit: MemUnitConfig {
                width: 1,
                issue_buffer_size: 1,
                decode_latency: 1,
                decode_buffer_size: 1,
                read_latency: 1,
                read_buffer_size: 1,
                max_inflight_mem_accesses: 32,
                write_latency: 1,
                write_buffer_size: 1,
            },

            lds_size: 65536,
            lds_alloc_size: 64,
            lds_latency: 2,
            lds_block_size: 64,
            lds_num_ports: 2,

            register_allocation_size: 32,
            register_allocation_granularity: RegisterAllocationGranularity::Wavefront,
            num_scalar_registers: 2048,
            num_vector_registers: 65536,

            scalar_cache_latency: 20,
            vector_cache_latency: 20,
            vector_cache_max_inflight: 256,

            max_cycles: 0,
            max_wavefront_count: 0,
            max_wavefront_ratio: 0.0,

            statistics_level: 0,
            statistics_sampling_cycle: 1000,
            stats_dir: PathBuf::from("."),

            rotate_compute_units: false,
            rotate_fetch: false,
            fetch_pressure_scheduling: false,
            work_group_limit: None,

            mix_ratio: 0.5,
            mix_pattern: MixPattern::default(),
            rng_seed: 0,
        }
    }
}

/// Scheduling-related environment overrides, captured once at startup.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EnvOverrides {
    pub rotate_compute_units: bool,
    pub rotate_fetch: bool,
    pub fetch_pressure_scheduling: bool,
    pub work_group_limit: Option<usize>,
    pub mix_ratio: Option<f64>,
    pub mix_pattern: Option<MixPattern>,
}

impl EnvOverrides {
    /// Read all `M2S_*` environment variables.
    #[must_use]
    pub fn capture() -> Self {
        let get = |name: &str| std::env::var(name).ok();
        Self {
            rotate_compute_units: get("M2S_RANDOM_CU").is_some(),
            rotate_fetch: get("M2S_RANDOM_FETCH").is_some(),
            fetch_pressure_scheduling: get("M2S_FP_SCHED").is_some(),
            work_group_limit: get("M2S_WG_LIMIT").and_then(|v| v.parse().ok()),
            mix_ratio: get("M2S_MIX_RATIO").and_then(|v| v.parse().ok()),
            mix_pattern: get("M2S_MIX_PATTERN")
                .and_then(|v| v.parse().ok())
                .map(MixPattern::from_env_value),
        }
    }
}

static ENV_OVERRIDES: Lazy<EnvOverrides> = Lazy::new(EnvOverrides::capture);

impl Config {
    /// Default configuration with the process environment folded in.
    ///
    /// The environment is read exactly once per process; repeated calls reuse
    /// the captured snapshot.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().with_overrides(&ENV_OVERRIDES)
    }

    #[must_use]
    pub fn with_overrides(mut self, env: &EnvOverrides) -> Self {
        self.rotate_compute_units |= env.rotate_compute_units;
        self.rotate_fetch |= env.rotate_fetch;
        self.fetch_pressure_scheduling |= env.fetch_pressure_scheduling;
        if env.work_group_limit.is_some() {
            self.work_group_limit = env.work_group_limit;
        }
        if let Some(ratio) = env.mix_ratio {
            self.mix_ratio = ratio;
        }
        if let Some(pattern) = env.mix_pattern {
            self.mix_pattern = pattern;
        }
        self
    }

    /// Hardware limit of resident wavefronts, used by the initial-PC mix.
    #[must_use]
    pub fn max_wavefronts_per_compute_unit(&self) -> usize {
        self.num_wavefront_pools * self.max_wavefronts_per_pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_consistent() {
        let config = Config::default();
        assert!(config.num_wavefront_pools > 0);
        assert_eq!(config.max_wavefronts_per_compute_unit(), 40);
        assert_eq!(
            config.register_allocation_granularity,
            RegisterAllocationGranularity::Wavefront
        );
    }

    #[test]
    fn overrides_fold_in() {
        let env = EnvOverrides {
            fetch_pressure_scheduling: true,
            work_group_limit: Some(4),
            mix_ratio: Some(0.25),
            mix_pattern: Some(MixPattern::RoundRobin),
            ..EnvOverrides::default()
        };
        let config = Config::default().with_overrides(&env);
        assert!(config.fetch_pressure_scheduling);
        assert!(!config.rotate_compute_units);
        assert_eq!(config.work_group_limit, Some(4));
        assert_eq!(config.mix_pattern, MixPattern::RoundRobin);
    }

    #[test]
    fn mix_pattern_mapping() {
        assert_eq!(MixPattern::from_env_value(0), MixPattern::GreaterThan);
        assert_eq!(MixPattern::from_env_value(2), MixPattern::Random);
        assert_eq!(MixPattern::from_env_value(7), MixPattern::GreaterThan);
    }
}
