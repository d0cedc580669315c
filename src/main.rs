use clap::{Parser, ValueEnum};
use color_eyre::eyre::{self, WrapErr};
use gcnsim::instruction::Instruction;
use gcnsim::kernel::{Kernel, NDRange, ResourceDemand};
use gcnsim::{Config, Timing};
use std::path::PathBuf;
use std::sync::Arc;

/// Synthetic workloads exercising the different execution units.
#[derive(Clone, Copy, Debug, ValueEnum)]
enum Workload {
    /// Straight-line vector-ALU stream.
    Alu,
    /// Constant load, global load, ALU work, global store.
    Vecadd,
    /// Data-share traffic with a work-group barrier.
    Lds,
    /// A bit of everything, branches included.
    Mixed,
}

#[derive(Debug, Parser)]
#[command(author, version, about = "Cycle-accurate Southern Islands compute-unit timing simulator")]
struct Options {
    /// Synthetic workload to dispatch.
    #[arg(long, value_enum, default_value = "vecadd")]
    workload: Workload,

    /// Number of compute units.
    #[arg(long, default_value_t = 8)]
    compute_units: usize,

    /// Work groups in the dispatch.
    #[arg(long, default_value_t = 64)]
    work_groups: usize,

    /// Work items per work group.
    #[arg(long, default_value_t = 256)]
    work_items: usize,

    /// Vector ALU instructions per wavefront in the `alu` workload.
    #[arg(long, default_value_t = 32)]
    instructions: usize,

    /// Vector registers per work item.
    #[arg(long, default_value_t = 24)]
    vgprs: usize,

    /// Scalar registers per wavefront.
    #[arg(long, default_value_t = 48)]
    sgprs: usize,

    /// Local memory bytes per work group.
    #[arg(long, default_value_t = 0)]
    local_memory: usize,

    /// Statistics level (0 = off, 1 = files, 2 = per-uop records).
    #[arg(long, default_value_t = 0)]
    stats_level: u8,

    /// Directory receiving the statistics CSV files.
    #[arg(long, default_value = ".")]
    stats_dir: PathBuf,

    /// Hard cycle limit (0 = none).
    #[arg(long, default_value_t = 0)]
    max_cycles: u64,

    /// Seed for the randomized mix pattern.
    #[arg(long)]
    seed: Option<u64>,

    /// Print the run summary as JSON.
    #[arg(long)]
    json: bool,
}

fn build_kernel(options: &Options) -> Kernel {
    match options.workload {
        Workload::Alu => {
            let mut instructions = Vec::with_capacity(options.instructions + 1);
            for _ in 0..options.instructions {
                instructions.push(Instruction::vector_alu("v_mac_f32"));
            }
            instructions.push(Instruction::s_endpgm());
            Kernel::new("alu", instructions)
        }
        Workload::Vecadd => Kernel::new(
            "vecadd",
            vec![
                Instruction::smem_load(0x100, 16),
                Instruction::s_waitcnt(),
                Instruction::buffer_load(0x10000, 4, 4),
                Instruction::buffer_load(0x20000, 4, 4),
                Instruction::s_waitcnt(),
                Instruction::vector_alu("v_add_f32"),
                Instruction::buffer_store(0x30000, 4, 4, true),
                Instruction::s_waitcnt(),
                Instruction::s_endpgm(),
            ],
        ),
        Workload::Lds => Kernel::new(
            "lds",
            vec![
                Instruction::buffer_load(0x10000, 4, 4),
                Instruction::s_waitcnt(),
                Instruction::ds_write(0x0, 4),
                Instruction::s_waitcnt(),
                Instruction::s_barrier(),
                Instruction::ds_read(0x0, 4),
                Instruction::s_waitcnt(),
                Instruction::vector_alu("v_mul_f32"),
                Instruction::buffer_store(0x20000, 4, 4, false),
                Instruction::s_waitcnt(),
                Instruction::s_endpgm(),
            ],
        ),
        Workload::Mixed => Kernel::new(
            "mixed",
            vec![
                Instruction::smem_load(0x100, 16),
                Instruction::s_waitcnt(),
                Instruction::scalar_alu("s_mul_i32"),
                Instruction::s_cbranch(4),
                Instruction::buffer_load(0x10000, 4, 4),
                Instruction::vector_alu("v_add_f32"),
                Instruction::vector_alu_vop3("v_fma_f32"),
                Instruction::ds_write(0x0, 4),
                Instruction::s_waitcnt(),
                Instruction::s_barrier(),
                Instruction::buffer_store(0x20000, 4, 4, true),
                Instruction::s_waitcnt(),
                Instruction::s_endpgm(),
            ],
        ),
    }
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let options = Options::parse();

    let mut config = Config::from_env();
    config.num_compute_units = options.compute_units;
    config.statistics_level = options.stats_level;
    config.stats_dir = options.stats_dir.clone();
    config.max_cycles = options.max_cycles;
    if let Some(seed) = options.seed {
        config.rng_seed = seed;
    }

    let mut timing = Timing::new(config).wrap_err("failed to set up the timing simulator")?;

    let kernel = Arc::new(build_kernel(&options));
    let address_space = timing.mmu_mut().new_address_space();
    let ndrange = NDRange::new(
        0,
        kernel,
        options.work_groups,
        ResourceDemand {
            work_items_per_work_group: options.work_items,
            vector_registers_per_work_item: options.vgprs,
            scalar_registers_per_wavefront: options.sgprs,
            local_memory_per_work_group: options.local_memory,
        },
        address_space,
    );

    timing
        .dispatch(ndrange)
        .wrap_err("failed to dispatch the ND-range")?;
    let summary = timing.run_to_completion();

    if options.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!(
            "completed {} wavefronts in {} cycles (last completion at cycle {}, halt: {:?})",
            summary.completed_wavefronts, summary.cycles, summary.last_complete_cycle, summary.halt
        );
        for compute_unit in &timing.gpu.compute_units {
            let stats = &compute_unit.stats;
            if stats.num_total_insts == 0 {
                continue;
            }
            println!(
                "cu {:2}: {} insts (branch {}, scalar alu {}, smem {}, simd {}, vmem {}, lds {}), {} work groups",
                compute_unit.index,
                stats.num_total_insts,
                stats.num_branch_insts,
                stats.num_scalar_alu_insts,
                stats.num_scalar_memory_insts,
                stats.num_simd_insts,
                stats.num_vector_memory_insts,
                stats.num_lds_insts,
                stats.num_mapped_work_groups,
            );
        }
    }

    Ok(())
}
