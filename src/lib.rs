#[cfg(not(target_pointer_width = "64"))]
compile_error!("pmem-alloc supports only 64-bit targets.");

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
pub mod pmem;

// allocator
pub use pmem::allocator::{PmemAllocator, PmemAllocatorConfig};
pub use pmem::space::SpaceEntry;

// errors
pub use pmem::region::RegionError;

// diagnostics
pub use pmem::allocator::AllocatorStats;
