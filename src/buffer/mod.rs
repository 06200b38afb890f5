//! Buffers handed out by the pool
//!
//! A [`ManagedBuffer`] is a logical byte range stitched together from blocks
//! in one or more slabs. [`Segment`]s expose the physical pieces for
//! vectored reads and writes.
//!
//! ```text
//! logical:  [0 ............ 100 ............ 250 .... 300)
//! blocks:   slab#0 @4096     slab#0 @9000     slab#3 @0
//!           len 100          len 150          len 50
//! ```

pub mod managed;
pub mod segment;

pub use managed::ManagedBuffer;
pub(crate) use managed::Lease;
pub use segment::Segment;
