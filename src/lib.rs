#[cfg(not(target_pointer_width = "64"))]
compile_error!("scopemem supports only 64-bit targets.");

pub mod memory;

// pools and configuration
pub use memory::chunk::CHUNK_SIZE;
pub use memory::pool::{MemError, PoolConfig, ScopePool, MAX_ALLOC_SIZE};
pub use memory::scopes::ScopeSet;

// string/buffer helpers
pub use memory::strings::{StrBuf, NULL_PLACEHOLDER};

// usage accounting
pub use memory::stats::{CHUNKS_LIVE, TOTAL_MAPPED};
pub use memory::usage::{UsageRegistry, UsageReport};

// errors
pub use memory::vm::VmError;
