// slabbuf - Slab-backed buffer pool
// Large pre-allocated arenas carved into buffers for vectored network I/O

#![warn(rust_2018_idioms)]

//! # slabbuf
//!
//! Hands out logically contiguous byte buffers backed by a handful of large
//! slabs instead of a heap allocation per I/O call.
//!
//! ```text
//! BufferPool
//!   ├─→ MemorySlab #0 (1 MiB)  → Free: [0..4096) [65536..1048576)
//!   ├─→ MemorySlab #1 (1 MiB)  → Free: [0..1048576)
//!   └─→ MemorySlab #2 (1 MiB)  → Free: []
//!
//! ManagedBuffer (150000 bytes)
//!   ├─→ Block(slab=0, start=4096, len=61440)
//!   └─→ Block(slab=2, start=0,    len=88560)
//! ```
//!
//! ```rust
//! use slabbuf::BufferPool;
//!
//! # fn main() -> slabbuf::error::Result<()> {
//! let pool = BufferPool::new(128 * 1024, 1, 1)?;
//! let mut buffer = pool.get_buffer_filled(5, b"hello")?;
//!
//! let mut out = [0u8; 5];
//! buffer.copy_to(&mut out)?;
//! assert_eq!(&out, b"hello");
//!
//! // Blocks go back to their slabs here (or when the buffer is dropped)
//! buffer.dispose();
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod memory;
pub mod pool;

// Re-exports for convenience
pub use buffer::{ManagedBuffer, Segment};
pub use memory::{MemoryBlock, MemorySlab, SlabId};
pub use pool::{BufferPool, PoolConfig, PoolStats, MAX_SEGMENTS_PER_BUFFER, MAX_SLAB_SIZE, MIN_SLAB_SIZE};

/// slabbuf error types
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Invalid argument: {0}")]
        InvalidArgument(String),

        #[error("Buffer has been disposed")]
        Disposed,

        #[error("Allocation failed: {0}")]
        AllocationFailed(String),

        #[error("Slab limit reached: pool may not exceed {limit} slabs")]
        SlabLimitReached { limit: usize },

        #[error("Configuration error: {0}")]
        Config(String),
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
