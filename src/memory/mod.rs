//! Slab memory
//!
//! A slab is one large zeroed array. Variable-length blocks are carved out of
//! it with best-fit placement and coalesced again when they come back.
//!
//! # Architecture
//!
//! ```text
//! MemorySlab (size = 1024)
//!   ├─→ backing: [u8; 1024]
//!   ├─→ free index (by length) → 128: {0}  384: {640}
//!   ├─→ free index (by start)  → 0 → 128, 640 → 384
//!   ├─→ free index (by end)    → 127 → 0, 1023 → 640
//!   └─→ largest free (atomic)  → 384
//!
//! On loan: Block(start=128, len=512)
//! ```

pub mod block;
pub mod free_index;
pub mod slab;

pub use block::{MemoryBlock, SlabId};
pub use free_index::FreeBlockIndex;
pub use slab::{MemorySlab, SlabObserver};
