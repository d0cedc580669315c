//! End-to-end pipeline scenarios on small synthetic kernels.

use gcnsim::config::Config;
use gcnsim::exec_unit::ExecutionUnit;
use gcnsim::gpu::DispatchError;
use gcnsim::instruction::Instruction;
use gcnsim::kernel::{Kernel, NDRange, ResourceDemand};
use gcnsim::timing::{HaltReason, Timing};
use std::sync::Arc;

fn small_config() -> Config {
    Config {
        num_compute_units: 1,
        num_wavefront_pools: 1,
        max_cycles: 100_000,
        ..Config::default()
    }
}

fn demand(work_items: usize) -> ResourceDemand {
    ResourceDemand {
        work_items_per_work_group: work_items,
        vector_registers_per_work_item: 16,
        scalar_registers_per_wavefront: 32,
        local_memory_per_work_group: 0,
    }
}

fn setup(
    config: Config,
    instructions: Vec<Instruction>,
    num_work_groups: usize,
    work_items: usize,
) -> Timing {
    let mut timing = Timing::new(config).expect("simulator setup");
    let kernel = Arc::new(Kernel::new("test", instructions));
    let address_space = timing.mmu_mut().new_address_space();
    let ndrange = NDRange::new(0, kernel, num_work_groups, demand(work_items), address_space);
    timing.dispatch(ndrange).expect("dispatch");
    timing
}

fn total_completed_by_units(timing: &Timing) -> u64 {
    timing
        .gpu
        .compute_units
        .iter()
        .map(|cu| {
            cu.scalar_unit.state().num_instructions
                + cu.branch_unit.state().num_instructions
                + cu.lds_unit.state().num_instructions
                + cu.vector_memory_unit.state().num_instructions
                + cu.simd_units
                    .iter()
                    .map(|simd| simd.state().num_instructions)
                    .sum::<u64>()
        })
        .sum()
}

fn alu_kernel(alu_instructions: usize) -> Vec<Instruction> {
    let mut instructions: Vec<_> = (0..alu_instructions)
        .map(|_| Instruction::vector_alu("v_add_f32"))
        .collect();
    instructions.push(Instruction::s_endpgm());
    instructions
}

#[test]
fn single_wavefront_alu_stream() {
    let mut timing = setup(small_config(), alu_kernel(10), 1, 64);
    let summary = timing.run_to_completion();

    assert_eq!(summary.halt, HaltReason::Finished);
    assert_eq!(summary.completed_wavefronts, 1);

    let cu = &timing.gpu.compute_units[0];
    assert_eq!(cu.stats.num_total_insts, 11);
    assert_eq!(cu.stats.num_simd_insts, 10);
    assert_eq!(cu.stats.num_scalar_alu_insts, 1);

    // No uop lost: every fetched instruction completed in some unit.
    assert_eq!(total_completed_by_units(&timing), 11);
    assert_eq!(cu.in_flight_uops(), 0);
    assert!(summary.last_complete_cycle > 10);
    assert_eq!(summary.last_complete_cycle, summary.cycles);
}

#[test]
fn fetch_width_is_respected() {
    // Two resident wavefronts compete for a fetch width of one.
    let mut timing = setup(small_config(), alu_kernel(8), 1, 128);
    let mut previous = 0;
    for _ in 0..100_000 {
        timing.run_cycle();
        let fetched = timing.gpu.compute_units[0].stats.num_total_insts;
        assert!(fetched - previous <= 1, "fetch exceeded its width");
        previous = fetched;
        if timing.gpu.is_idle() {
            break;
        }
    }
    assert!(timing.gpu.is_idle());
    assert_eq!(previous, 2 * 9);
}

#[test]
fn barrier_synchronizes_wavefronts() {
    let instructions = vec![
        Instruction::vector_alu("v_add_f32"),
        Instruction::s_barrier(),
        Instruction::vector_alu("v_mul_f32"),
        Instruction::s_endpgm(),
    ];
    let mut timing = setup(small_config(), instructions, 1, 128);

    // The first wavefront to complete its barrier must wait for the other.
    let mut observed_single_waiter = false;
    for _ in 0..100_000 {
        timing.run_cycle();
        let pool = &timing.gpu.compute_units[0].wavefront_pools[0];
        let waiting = pool
            .entries
            .iter()
            .filter(|entry| entry.wait_for_barrier)
            .count();
        assert!(waiting <= 2);
        if waiting == 1 {
            observed_single_waiter = true;
        }
        if timing.gpu.is_idle() {
            break;
        }
    }
    assert!(timing.gpu.is_idle());
    assert!(observed_single_waiter, "barrier never held a wavefront");

    let cu = &timing.gpu.compute_units[0];
    assert_eq!(timing.gpu.shared.sched.completed_wavefronts, 2);
    assert_eq!(cu.stats.num_total_insts, 2 * 4);
    assert!(cu
        .wavefront_pools[0]
        .entries
        .iter()
        .all(|entry| !entry.wait_for_barrier));
}

#[test]
fn vector_memory_divergence_retries() {
    let mut config = small_config();
    // The cache admits only a quarter of a full wavefront per round.
    config.vector_cache_max_inflight = 16;
    let instructions = vec![
        Instruction::buffer_load(0x10000, 4, 4),
        Instruction::s_waitcnt(),
        Instruction::s_endpgm(),
    ];
    let mut timing = setup(config, instructions, 1, 64);
    let summary = timing.run_to_completion();

    assert_eq!(summary.halt, HaltReason::Finished);
    let cu = &timing.gpu.compute_units[0];
    assert_eq!(cu.stats.num_vector_memory_insts, 1);
    assert!(
        cu.vector_memory_unit.state().overview.num_vmem_divergence > 0,
        "a rejected wavefront must count as divergence"
    );
    assert_eq!(total_completed_by_units(&timing), 3);
}

#[test]
fn memory_wait_blocks_fetch_until_drained() {
    let instructions = vec![
        Instruction::buffer_load(0x10000, 4, 4),
        Instruction::s_waitcnt(),
        Instruction::vector_alu("v_add_f32"),
        Instruction::s_endpgm(),
    ];
    let mut timing = setup(small_config(), instructions, 1, 64);

    // The wait instruction completes in the scalar unit while the vector
    // load is still outstanding; fetch must hold the wavefront until the
    // memory counters drain.
    let mut observed_mem_wait = false;
    for _ in 0..100_000 {
        timing.run_cycle();
        let cu = &timing.gpu.compute_units[0];
        let entry = &cu.wavefront_pools[0].entries[0];
        if entry.mem_wait && entry.lgkm_cnt > 0 {
            observed_mem_wait = true;
            // The instruction after the wait has not been fetched yet.
            assert_eq!(cu.stats.num_simd_insts, 0);
        }
        if timing.gpu.is_idle() {
            break;
        }
    }
    assert!(timing.gpu.is_idle());
    assert!(observed_mem_wait, "the wait instruction never held fetch");

    let cu = &timing.gpu.compute_units[0];
    assert_eq!(cu.stats.num_vector_memory_insts, 1);
    assert_eq!(cu.stats.num_simd_insts, 1);
    assert_eq!(total_completed_by_units(&timing), 4);
}

#[test]
fn work_group_unmaps_after_last_completion() {
    let mut timing = setup(small_config(), alu_kernel(4), 1, 64);
    let summary = timing.run_to_completion();

    assert_eq!(summary.halt, HaltReason::Finished);
    let cu = &timing.gpu.compute_units[0];
    assert!(cu.work_groups.iter().all(Option::is_none));
    assert_eq!(cu.wavefront_pools[0].num_wavefronts(), 0);
    assert!(timing.gpu.shared.sched.available.contains(0));
    assert!(timing.gpu.shared.sched.ndrange.is_none());
}

#[test]
fn resource_over_provision_fails_dispatch() {
    let mut timing = Timing::new(small_config()).expect("simulator setup");
    let kernel = Arc::new(Kernel::new("fat", alu_kernel(1)));
    let address_space = timing.mmu_mut().new_address_space();
    let ndrange = NDRange::new(
        0,
        kernel,
        1,
        ResourceDemand {
            work_items_per_work_group: 64,
            // More vector registers than a compute unit owns.
            vector_registers_per_work_item: 2048,
            scalar_registers_per_wavefront: 32,
            local_memory_per_work_group: 0,
        },
        address_space,
    );
    assert_eq!(
        timing.dispatch(ndrange),
        Err(DispatchError::InsufficientResources)
    );
}

#[test]
fn work_group_limit_above_hardware_fails_dispatch() {
    let mut config = small_config();
    config.work_group_limit = Some(1000);
    let mut timing = Timing::new(config).expect("simulator setup");
    let kernel = Arc::new(Kernel::new("k", alu_kernel(1)));
    let address_space = timing.mmu_mut().new_address_space();
    let ndrange = NDRange::new(0, kernel, 1, demand(64), address_space);
    assert!(matches!(
        timing.dispatch(ndrange),
        Err(DispatchError::WorkGroupLimitExceeded { .. })
    ));
}

#[test]
fn lds_round_trip_completes() {
    let instructions = vec![
        Instruction::ds_write(0x0, 4),
        Instruction::s_waitcnt(),
        Instruction::ds_read(0x0, 4),
        Instruction::s_waitcnt(),
        Instruction::s_endpgm(),
    ];
    let mut timing = setup(small_config(), instructions, 1, 64);
    let summary = timing.run_to_completion();

    assert_eq!(summary.halt, HaltReason::Finished);
    let cu = &timing.gpu.compute_units[0];
    assert_eq!(cu.stats.num_lds_insts, 2);
    assert_eq!(total_completed_by_units(&timing), 5);
    assert!(cu.wavefront_pools[0]
        .entries
        .iter()
        .all(|entry| entry.lgkm_cnt == 0));
}

#[test]
fn mixed_kernel_on_many_units() {
    let mut config = Config {
        num_compute_units: 4,
        max_cycles: 200_000,
        ..Config::default()
    };
    config.num_wavefront_pools = 2;
    let instructions = vec![
        Instruction::smem_load(0x100, 16),
        Instruction::s_waitcnt(),
        Instruction::scalar_alu("s_mul_i32"),
        Instruction::s_cbranch(4),
        Instruction::buffer_load(0x10000, 4, 4),
        Instruction::vector_alu("v_add_f32"),
        Instruction::ds_write(0x0, 4),
        Instruction::s_waitcnt(),
        Instruction::s_barrier(),
        Instruction::buffer_store(0x20000, 4, 4, true),
        Instruction::s_waitcnt(),
        Instruction::s_endpgm(),
    ];
    let num_work_groups = 12;
    let mut timing = setup(config, instructions, num_work_groups, 128);
    let summary = timing.run_to_completion();

    assert_eq!(summary.halt, HaltReason::Finished);
    assert_eq!(summary.completed_wavefronts, 2 * num_work_groups as u64);

    let total_fetched: u64 = timing
        .gpu
        .compute_units
        .iter()
        .map(|cu| cu.stats.num_total_insts)
        .sum();
    assert_eq!(total_fetched, 12 * 2 * num_work_groups as u64);
    assert_eq!(total_completed_by_units(&timing), total_fetched);

    let branch_total: u64 = timing
        .gpu
        .compute_units
        .iter()
        .map(|cu| cu.stats.num_branch_insts)
        .sum();
    assert_eq!(branch_total, 2 * num_work_groups as u64);

    // More than one compute unit took part.
    let busy_units = timing
        .gpu
        .compute_units
        .iter()
        .filter(|cu| cu.stats.num_total_insts > 0)
        .count();
    assert!(busy_units > 1);
}

#[test]
fn identical_runs_are_reproducible() {
    let run = || {
        let instructions = vec![
            Instruction::buffer_load(0x10000, 4, 4),
            Instruction::vector_alu("v_add_f32"),
            Instruction::s_waitcnt(),
            Instruction::buffer_store(0x20000, 4, 4, false),
            Instruction::s_waitcnt(),
            Instruction::s_endpgm(),
        ];
        let mut config = small_config();
        config.num_compute_units = 2;
        let mut timing = setup(config, instructions, 6, 96);
        let summary = timing.run_to_completion();
        let per_unit: Vec<u64> = timing
            .gpu
            .compute_units
            .iter()
            .map(|cu| cu.stats.num_total_insts)
            .collect();
        (summary.cycles, summary.last_complete_cycle, summary.completed_wavefronts, per_unit)
    };
    assert_eq!(run(), run());
}

#[test]
fn idle_device_cycle_is_a_no_op() {
    let mut timing = setup(small_config(), alu_kernel(2), 1, 64);
    let summary = timing.run_to_completion();
    assert_eq!(summary.halt, HaltReason::Finished);

    let before = timing.gpu.compute_units[0].stats.num_total_insts;
    timing.run_cycle();
    timing.run_cycle();
    assert_eq!(timing.gpu.compute_units[0].stats.num_total_insts, before);
    assert_eq!(timing.gpu.compute_units[0].in_flight_uops(), 0);
}

#[test]
fn max_cycles_halts_a_run() {
    let mut config = small_config();
    config.max_cycles = 5;
    // A kernel that cannot finish in five cycles.
    let mut timing = setup(config, alu_kernel(64), 1, 64);
    let summary = timing.run_to_completion();
    assert_eq!(summary.halt, HaltReason::MaxCycles);
    assert_eq!(summary.cycles, 5);
}

#[test]
fn wavefront_count_limit_halts_a_run() {
    let mut config = small_config();
    config.max_wavefront_count = 1;
    let mut timing = setup(config, alu_kernel(2), 4, 64);
    let summary = timing.run_to_completion();
    assert_eq!(summary.halt, HaltReason::WavefrontLimit);
    assert!(summary.completed_wavefronts >= 1);
}

#[test]
fn statistics_files_are_written() {
    let dir = std::env::temp_dir().join(format!("gcnsim-test-{}", std::process::id()));
    let mut config = small_config();
    config.statistics_level = 2;
    config.stats_dir = dir.clone();
    let mut timing = setup(config, alu_kernel(4), 2, 64);
    let summary = timing.run_to_completion();
    assert_eq!(summary.halt, HaltReason::Finished);
    drop(timing);

    let workgroup_csv = std::fs::read_to_string(dir.join("cu_0.workgp")).expect("workgp file");
    let mut lines = workgroup_csv.lines();
    let header = lines.next().expect("header row");
    assert!(header.starts_with("ndrange_id,wg_id,len_map,clk_map,clk_unmap"));
    assert!(header.ends_with("simd_num_stall_write_"));
    // One row per unmapped work group, matching the header width.
    let rows: Vec<_> = lines.collect();
    assert_eq!(rows.len(), 2);
    for row in rows {
        assert_eq!(row.split(',').count(), header.split(',').count());
    }

    let ndrange_csv = std::fs::read_to_string(dir.join("cu_all.ndrange")).expect("ndrange file");
    assert_eq!(ndrange_csv.lines().count(), 2);

    for unit in ["branch", "scalar", "simd0", "lds", "vmem"] {
        assert!(dir.join(format!("cu_0_{unit}.overvw")).exists());
        assert!(dir.join(format!("cu_0_{unit}.intrvl")).exists());
    }

    std::fs::remove_dir_all(&dir).ok();
}
