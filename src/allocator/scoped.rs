//! RAII wrapper around a single manager allocation.

use super::{MappedAllocation, MappedMemoryManager};
use crate::command::{CommandBufferHelper, FenceSync, ShmId};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

/// An allocation that is freed, pending a fresh token, when dropped.
///
/// The manager is shared through `Rc<RefCell<_>>` because it is owned by the
/// thread issuing commands and several scoped allocations may be alive at
/// once.
///
/// ```rust
/// use std::cell::RefCell;
/// use std::rc::Rc;
/// use std::sync::Arc;
/// use mapped_memory::allocator::{MappedMemoryManager, MemoryLimit, ScopedMappedMemory};
/// use mapped_memory::command::InProcessCommandBuffer;
///
/// let helper = Arc::new(InProcessCommandBuffer::new());
/// let manager = Rc::new(RefCell::new(MappedMemoryManager::new(helper, MemoryLimit::Unbounded)));
///
/// let mut upload = ScopedMappedMemory::new(64, &manager);
/// upload.as_mut_slice().unwrap().fill(7);
/// // ... issue commands referencing upload.shm_id() and upload.offset() ...
/// drop(upload);
/// ```
pub struct ScopedMappedMemory {
    manager: Rc<RefCell<MappedMemoryManager>>,
    helper: Arc<dyn CommandBufferHelper>,
    allocation: Option<MappedAllocation>,
    flush_after_release: bool,
}

impl ScopedMappedMemory {
    /// Allocate `size` bytes from `manager`. Check [`valid`](Self::valid)
    /// before use: the allocation may have failed.
    pub fn new(size: u32, manager: &Rc<RefCell<MappedMemoryManager>>) -> Self {
        let helper = Arc::clone(manager.borrow().helper());
        let mut scoped = Self {
            manager: Rc::clone(manager),
            helper,
            allocation: None,
            flush_after_release: false,
        };
        scoped.reset(size);
        scoped
    }

    /// Does this hold an allocation?
    pub fn valid(&self) -> bool {
        self.allocation.is_some()
    }

    /// Allocated size, zero if invalid.
    pub fn size(&self) -> u32 {
        self.allocation.map_or(0, |allocation| allocation.size())
    }

    /// Transfer buffer id, if valid.
    pub fn shm_id(&self) -> Option<ShmId> {
        self.allocation.map(|allocation| allocation.shm_id())
    }

    /// Offset inside the transfer buffer, zero if invalid.
    pub fn offset(&self) -> u32 {
        self.allocation.map_or(0, |allocation| allocation.offset())
    }

    /// Client-side address, null if invalid.
    pub fn address(&self) -> *mut u8 {
        self.allocation
            .map_or(std::ptr::null_mut(), |allocation| allocation.as_ptr())
    }

    /// The underlying allocation.
    pub fn allocation(&self) -> Option<&MappedAllocation> {
        self.allocation.as_ref()
    }

    /// The allocated bytes.
    pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        let allocation = self.allocation?;
        // SAFETY: the range is owned by this allocation until release, and
        // the exclusive borrow of `self` prevents aliasing through it.
        Some(unsafe {
            std::slice::from_raw_parts_mut(allocation.as_ptr(), allocation.size() as usize)
        })
    }

    /// Flush the command buffer after every release.
    pub fn set_flush_after_release(&mut self, flush: bool) {
        self.flush_after_release = flush;
    }

    /// Free the allocation once the consumer passes a freshly inserted
    /// token. No-op when invalid.
    pub fn release(&mut self) {
        let Some(allocation) = self.allocation.take() else {
            return;
        };
        let token = self.helper.insert_token();
        self.manager
            .borrow_mut()
            .free_pending_token(allocation.ptr(), token);
        tracing::trace!(
            shm_id = %allocation.shm_id(),
            offset = allocation.offset(),
            %token,
            "released scoped allocation"
        );
        if self.flush_after_release {
            self.helper.flush();
        }
    }

    /// Release the current allocation and allocate `new_size` bytes
    /// (nothing for zero).
    pub fn reset(&mut self, new_size: u32) {
        self.release();
        if new_size > 0 {
            self.allocation = self.manager.borrow_mut().alloc(new_size);
        }
    }
}

impl Drop for ScopedMappedMemory {
    fn drop(&mut self) {
        self.release();
    }
}
