//! Heap-backed memory segment.

use super::{IpcHandle, MemorySegment, MemoryType};
use crate::error::{Error, Result};
use std::cell::UnsafeCell;

/// A memory segment backed by heap allocation.
///
/// The cheapest transfer-buffer backend, for consumers that live in the
/// same process. It does not support cross-process sharing.
///
/// # Example
///
/// ```rust
/// use mapped_memory::memory::{HeapSegment, MemorySegment};
///
/// let segment = HeapSegment::new(1024).unwrap();
/// assert_eq!(segment.len(), 1024);
/// ```
pub struct HeapSegment {
    /// Boxed so the memory is contiguous and never reallocated.
    data: Box<[UnsafeCell<u8>]>,
}

impl HeapSegment {
    /// Create a new zero-initialized heap segment.
    ///
    /// # Errors
    ///
    /// Returns an error if size is 0.
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::AllocationFailed(
                "size must be greater than 0".into(),
            ));
        }

        let data = (0..size).map(|_| UnsafeCell::new(0u8)).collect();

        Ok(Self { data })
    }
}

impl MemorySegment for HeapSegment {
    fn as_ptr(&self) -> *const u8 {
        UnsafeCell::raw_get(self.data.as_ptr()) as *const u8
    }

    fn as_mut_ptr(&self) -> Option<*mut u8> {
        // Writes through this pointer go through UnsafeCell, so handing it
        // out from &self is allowed.
        Some(UnsafeCell::raw_get(self.data.as_ptr()))
    }

    fn len(&self) -> usize {
        self.data.len()
    }

    fn memory_type(&self) -> MemoryType {
        MemoryType::Heap
    }

    fn ipc_handle(&self) -> Option<IpcHandle> {
        None
    }
}

// SAFETY: the bytes are plain data; synchronizing access to them is the
// job of the allocator and the fence protocol, not of the segment.
unsafe impl Sync for HeapSegment {}
