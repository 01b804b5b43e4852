//! Fence-aware sub-allocation of transfer buffers.
//!
//! # Architecture
//!
//! - [`FencedAllocator`]: offsets within one buffer, first-fit, with frees
//!   that can wait for a fence token
//! - [`MemoryChunk`]: one transfer buffer plus its allocator, in pointers
//! - [`MappedMemoryManager`]: many chunks, growth and reclamation policy
//! - [`ScopedMappedMemory`]: RAII allocation freed pending a token on drop
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use mapped_memory::allocator::{MappedMemoryManager, MemoryLimit};
//! use mapped_memory::command::{FenceSync, InProcessCommandBuffer};
//!
//! let helper = Arc::new(InProcessCommandBuffer::new());
//! let mut manager = MappedMemoryManager::new(helper.clone(), MemoryLimit::Unbounded);
//!
//! let upload = manager.alloc(1024).expect("no limit configured");
//! // ... write the upload, issue commands reading (shm_id, offset) ...
//! manager.free_pending_token(upload.ptr(), helper.insert_token());
//! ```

mod chunk;
mod fenced;
mod manager;
mod scoped;

pub use chunk::MemoryChunk;
pub use fenced::{Block, BlockState, FencedAllocator};
pub use manager::{
    ChunkDump, ManagerConfig, MappedAllocation, MappedMemoryDump, MappedMemoryManager,
    MemoryLimit,
};
pub use scoped::ScopedMappedMemory;

/// Every allocation is rounded up to a multiple of this many bytes.
pub const ALLOC_ALIGNMENT: u32 = 16;

/// Default rounding multiple for new chunk sizes.
pub const DEFAULT_CHUNK_SIZE_MULTIPLE: u32 = ALLOC_ALIGNMENT;

/// Round `value` up to a multiple of `multiple`. `None` on overflow.
pub(crate) fn round_up(value: u32, multiple: u32) -> Option<u32> {
    value.div_ceil(multiple).checked_mul(multiple)
}
