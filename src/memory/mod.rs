//! Memory segments backing transfer buffers.
//!
//! A transfer buffer is one contiguous [`MemorySegment`] shared between the
//! command-buffer client and its consumer:
//!
//! - [`HeapSegment`]: heap memory for an in-process consumer
//! - [`SharedMemorySegment`]: memfd memory whose fd can be sent to another process
//!
//! The allocator never creates segments directly; it asks a
//! [`TransferBufferFactory`](crate::command::TransferBufferFactory) for them.

mod heap;
mod segment;
mod shared;

pub use heap::HeapSegment;
pub use segment::{IpcHandle, MemorySegment, MemoryType};
pub use shared::SharedMemorySegment;
