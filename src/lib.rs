//! # mapped-memory
//!
//! Client-side sub-allocation of GPU command-buffer shared memory.
//!
//! A command-buffer client uploads data through transfer buffers: shared
//! memory regions that the consumer (the GPU service) can read by
//! `(shm_id, offset)`. Creating a transfer buffer is expensive, so this
//! crate carves many small allocations out of a few large chunks and only
//! reuses a range once the consumer has provably finished reading it.
//!
//! ## Features
//!
//! - **Fence-aware frees**: free now, or free once a token has passed
//! - **Growth policy**: chunk size multiple, hard cap, reclaim-before-grow
//! - **Deterministic placement**: oldest chunk first, lowest address first
//! - **Real shared memory**: memfd-backed transfer buffers on Linux
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use mapped_memory::prelude::*;
//!
//! let helper = Arc::new(InProcessCommandBuffer::new());
//! let mut manager = MappedMemoryManager::new(helper.clone(), MemoryLimit::Bytes(1 << 20));
//!
//! let upload = manager.alloc(256).expect("within limits");
//! // Write through upload.as_ptr(), then reference upload.shm_id() and
//! // upload.offset() in a command.
//! let token = helper.insert_token();
//! manager.free_pending_token(upload.ptr(), token);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod allocator;
pub mod command;
pub mod error;
pub mod memory;
pub mod observability;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::allocator::{
        ManagerConfig, MappedAllocation, MappedMemoryManager, MemoryLimit, ScopedMappedMemory,
    };
    pub use crate::command::{
        CommandBufferHelper, FenceSync, InProcessCommandBuffer, ShmId, Token, TransferBuffer,
        TransferBufferFactory,
    };
    pub use crate::error::{Error, Result};
    pub use crate::memory::{MemorySegment, MemoryType};
}

pub use allocator::{MappedMemoryManager, MemoryChunk, ScopedMappedMemory};
pub use error::{Error, Result};
