pub mod branch_unit;
pub mod compute_unit;
pub mod config;
pub mod exec_unit;
pub mod fetch_buffer;
pub mod fifo;
pub mod gpu;
pub mod instruction;
pub mod kernel;
pub mod lds_unit;
pub mod mem;
pub mod scalar_unit;
pub mod simd_unit;
pub mod stats;
pub mod timing;
pub mod uop;
pub mod vector_memory_unit;
pub mod wavefront;
pub mod wavefront_pool;
pub mod work_group;

/// Virtual or physical memory address.
#[allow(non_camel_case_types)]
pub type address = u64;

/// Simulation cycle counter.
pub type Cycle = u64;

/// Wavefront size.
///
/// Number of work items per wavefront, executing in lock-step on a SIMD unit.
pub const WAVEFRONT_SIZE: usize = 64;

pub use config::Config;
pub use gpu::{DispatchError, Gpu};
pub use kernel::{Kernel, NDRange};
pub use timing::{RunSummary, Timing};
