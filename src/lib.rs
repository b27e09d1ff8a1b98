#[cfg(not(target_pointer_width = "64"))]
compile_error!("cachalot supports only 64-bit targets.");

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod malloc;

// front end
pub use malloc::allocator::{
    Allocator, AllocatorConfig, GlobalAllocator, MallocStats, OomHandler, set_oom_handler,
};
pub use malloc::cpu_cache::{CpuCacheStats, set_thread_cpu};
pub use malloc::transfer_cache::TransferCacheStats;

// tunables
pub use malloc::params::Parameters;

// errors
pub use malloc::error::MemError;
