//! memfd-backed transfer buffers.
//!
//! The client creates the memfd, sizes it and maps it. The consumer receives
//! the fd (see [`IpcHandle`]) and maps the same pages with
//! [`SharedMemorySegment::from_fd`], so uploads are read in place.

use super::{IpcHandle, MemorySegment, MemoryType};
use crate::error::{Error, Result};
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::fs::MemfdFlags;
use rustix::mm::{MapFlags, ProtFlags};
use std::ffi::CString;
use std::os::unix::io::{AsRawFd, RawFd};
use std::ptr::NonNull;

/// A transfer buffer whose pages live in a memfd.
///
/// ```rust,ignore
/// use mapped_memory::memory::{IpcHandle, MemorySegment, SharedMemorySegment};
///
/// let buffer = SharedMemorySegment::new("uploads-3", 64 * 1024)?;
/// let Some(IpcHandle::Fd { fd, size }) = buffer.ipc_handle() else { unreachable!() };
/// // send `fd` and `size` to the GPU process
/// ```
pub struct SharedMemorySegment {
    fd: OwnedFd,
    base: NonNull<u8>,
    len: usize,
    /// Label passed to `memfd_create`; `None` on the consumer side.
    label: Option<String>,
}

impl SharedMemorySegment {
    /// Create and map a transfer buffer of `size` bytes.
    ///
    /// `label` names the memfd, which makes transfer buffers easy to spot
    /// when listing a process's open files.
    ///
    /// # Errors
    ///
    /// [`Error::AllocationFailed`] for an empty buffer or a label with an
    /// interior NUL; [`Error::System`] if the memfd cannot be created,
    /// sized, or mapped.
    pub fn new(label: &str, size: usize) -> Result<Self> {
        check_size(size)?;
        let c_label = CString::new(label)
            .map_err(|e| Error::AllocationFailed(format!("bad memfd label {label:?}: {e}")))?;

        let fd = rustix::fs::memfd_create(&c_label, MemfdFlags::CLOEXEC)?;
        rustix::fs::ftruncate(&fd, size as u64)?;
        // SAFETY: the memfd was just sized to `size` bytes.
        let base = unsafe { map_shared(&fd, size)? };

        tracing::trace!(label, size, "mapped memfd transfer buffer");
        Ok(Self {
            fd,
            base,
            len: size,
            label: Some(label.to_string()),
        })
    }

    /// Map a transfer buffer received from the client.
    ///
    /// # Safety
    ///
    /// `fd` must be a memfd at least `size` bytes long.
    pub unsafe fn from_fd(fd: OwnedFd, size: usize) -> Result<Self> {
        check_size(size)?;
        // SAFETY: the caller guarantees the file covers `size` bytes.
        let base = unsafe { map_shared(&fd, size)? };
        Ok(Self {
            fd,
            base,
            len: size,
            label: None,
        })
    }

    /// The memfd, for passing to another process.
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// The memfd label, if this side created the buffer.
    pub fn name(&self) -> Option<&str> {
        self.label.as_deref()
    }
}

fn check_size(size: usize) -> Result<()> {
    if size == 0 {
        return Err(Error::AllocationFailed(
            "transfer buffer size must be greater than 0".into(),
        ));
    }
    Ok(())
}

/// Map `size` bytes of `fd` read/write, shared with every other mapping.
///
/// # Safety
///
/// `fd` must refer to a file at least `size` bytes long.
unsafe fn map_shared(fd: &OwnedFd, size: usize) -> Result<NonNull<u8>> {
    let ptr = unsafe {
        rustix::mm::mmap(
            std::ptr::null_mut(),
            size,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd,
            0,
        )?
    };

    NonNull::new(ptr.cast::<u8>())
        .ok_or_else(|| Error::AllocationFailed("mmap returned null".into()))
}

impl MemorySegment for SharedMemorySegment {
    fn as_ptr(&self) -> *const u8 {
        self.base.as_ptr()
    }

    fn as_mut_ptr(&self) -> Option<*mut u8> {
        Some(self.base.as_ptr())
    }

    fn len(&self) -> usize {
        self.len
    }

    fn memory_type(&self) -> MemoryType {
        MemoryType::SharedMemory
    }

    fn ipc_handle(&self) -> Option<IpcHandle> {
        Some(IpcHandle::Fd {
            fd: self.fd.as_raw_fd(),
            size: self.len,
        })
    }
}

impl Drop for SharedMemorySegment {
    fn drop(&mut self) {
        // SAFETY: `base..base + len` is the mapping created in `map_shared`,
        // and no chunk outlives the segment it points into.
        if let Err(e) = unsafe { rustix::mm::munmap(self.base.as_ptr().cast(), self.len) } {
            tracing::warn!(label = ?self.label, error = %e, "munmap of transfer buffer failed");
        }
    }
}

// SAFETY: the mapping is process-wide and stays valid until drop; the
// allocator hands out disjoint ranges of it.
unsafe impl Send for SharedMemorySegment {}
unsafe impl Sync for SharedMemorySegment {}

impl AsFd for SharedMemorySegment {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_buffer_creation() {
        let buffer = SharedMemorySegment::new("uploads-1", 4096).unwrap();
        assert_eq!(buffer.len(), 4096);
        assert_eq!(buffer.memory_type(), MemoryType::SharedMemory);
        assert_eq!(buffer.name(), Some("uploads-1"));
        match buffer.ipc_handle() {
            Some(IpcHandle::Fd { fd, size }) => {
                assert_eq!(fd, buffer.as_raw_fd());
                assert_eq!(size, 4096);
            }
            other => panic!("unexpected handle {other:?}"),
        }
    }

    #[test]
    fn test_empty_transfer_buffer_rejected() {
        assert!(matches!(
            SharedMemorySegment::new("empty", 0),
            Err(Error::AllocationFailed(_))
        ));
    }

    #[test]
    fn test_label_with_nul_rejected() {
        assert!(matches!(
            SharedMemorySegment::new("bad\0label", 64),
            Err(Error::AllocationFailed(_))
        ));
    }

    #[test]
    fn test_consumer_mapping_sees_uploads() {
        let client = SharedMemorySegment::new("uploads-2", 4096).unwrap();

        // A duplicated fd stands in for one received over a socket.
        let received = rustix::io::fcntl_dupfd_cloexec(client.as_fd(), 0).unwrap();
        let consumer = unsafe { SharedMemorySegment::from_fd(received, 4096).unwrap() };
        assert_eq!(consumer.name(), None);

        unsafe { client.as_mut_ptr().unwrap().add(100).write(77) };
        unsafe { assert_eq!(consumer.as_slice()[100], 77) };
    }
}
