//! Memory segment trait and types.

/// Type of memory backing a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MemoryType {
    /// Regular heap memory (single-process only).
    ///
    /// Useful when the consumer lives in the same process, e.g. an
    /// in-process command executor or tests.
    Heap,
    /// Anonymous shared memory (memfd_create + mmap).
    ///
    /// The fd can be passed to the consumer process with `SCM_RIGHTS`.
    SharedMemory,
}

impl MemoryType {
    /// Can this memory type be shared across processes on the same machine?
    #[inline]
    pub fn supports_ipc(&self) -> bool {
        match self {
            MemoryType::Heap => false,
            MemoryType::SharedMemory => true,
        }
    }
}

/// Handle for sharing memory across processes.
///
/// The receiving process maps the same region from the handle.
#[derive(Debug, Clone)]
pub enum IpcHandle {
    /// File descriptor of a memfd.
    /// The fd should be sent via SCM_RIGHTS over a Unix socket.
    Fd {
        /// The raw file descriptor.
        fd: std::os::unix::io::RawFd,
        /// Size of the memory region.
        size: usize,
    },
}

/// Trait for memory segment backends.
///
/// A memory segment is one contiguous buffer handed out by a transfer-buffer
/// factory. Chunks sub-allocate inside it; the segment itself never moves.
///
/// # Safety
///
/// Implementations must ensure that:
/// - Pointers remain valid for the lifetime of the segment
/// - Thread-safety requirements are met (Send + Sync)
pub trait MemorySegment: Send + Sync {
    /// Get a raw pointer to the start of this segment.
    fn as_ptr(&self) -> *const u8;

    /// Get a mutable pointer to the start of this segment.
    ///
    /// Returns `None` if the segment is read-only.
    fn as_mut_ptr(&self) -> Option<*mut u8>;

    /// Total size of the segment in bytes.
    fn len(&self) -> usize;

    /// Returns true if the segment has zero length.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The type of memory backing this segment.
    fn memory_type(&self) -> MemoryType;

    /// Get an IPC handle for sharing this segment with other processes.
    ///
    /// Returns `None` if this segment type doesn't support cross-process sharing.
    fn ipc_handle(&self) -> Option<IpcHandle>;

    /// Get the segment as a byte slice.
    ///
    /// # Safety
    ///
    /// The caller must ensure no mutable references exist to this memory.
    unsafe fn as_slice(&self) -> &[u8] {
        // SAFETY: Caller guarantees no mutable references exist.
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.len()) }
    }

    /// Check whether `ptr` points inside this segment.
    fn contains(&self, ptr: *const u8) -> bool {
        let start = self.as_ptr() as usize;
        let addr = ptr as usize;
        addr >= start && addr < start + self.len()
    }
}

impl dyn MemorySegment {
    /// Check if this segment can be shared with other processes.
    pub fn is_shareable(&self) -> bool {
        self.ipc_handle().is_some()
    }
}
