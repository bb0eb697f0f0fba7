#![no_std]

//! A slab-based memory allocator.
//!
//! Memory is managed in slabs: power-of-two-sized, same-aligned regions
//! whose first bytes hold the bookkeeping for the rest. Free slabs are
//! filed into power-of-two size classes, so allocation is a bucket lookup
//! plus a couple of word operations; freeing masks the pointer down to
//! slab alignment to find the bookkeeping again, and empty slabs merge
//! with their physical neighbours to undo fragmentation.
//!
//! The pieces, from the bottom up:
//!
//! - [`slab`]: the in-band slab header and the operations on one slab.
//! - [`manager`]: the free-memory manager: size-class buckets, the
//!   allocate/deallocate state machine, splitting and merging.
//! - [`allocators`]: everything facing the outside world: the
//!   [`HeapGrower`] upstream capability, the growing [`SlabAlloc`]
//!   façade, and the spin-locked [`UnixAllocator`] usable as the global
//!   allocator:
//!
//! ```rust,ignore
//! use slaballoc::UnixAllocator;
//!
//! #[global_allocator]
//! static ALLOCATOR: UnixAllocator = UnixAllocator::new();
//! ```
//!
//! The core is strictly single-threaded and never blocks, performs I/O,
//! or frees backing memory; thread safety comes only from the spin-locked
//! wrapper, and the upstream supplier owns the bytes for the whole
//! lifetime of the allocator.

#[cfg(test)]
extern crate std;

pub mod allocators;
pub mod manager;
pub mod slab;
#[cfg(not(feature = "use_libc"))]
mod unix;

#[cfg(feature = "use_libc")]
pub use allocators::LibcHeapGrower;
#[cfg(not(feature = "use_libc"))]
pub use allocators::SyscallHeapGrower;
pub use allocators::{GenericAllocator, HeapGrower, SlabAlloc, ToyHeap, UnixAllocator};
pub use manager::{FreeMemoryManager, Stats, Validity};
pub use slab::{Slab, HEADER_SIZE};
