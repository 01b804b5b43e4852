//! A single transfer buffer and its sub-allocations.

use super::{ALLOC_ALIGNMENT, FencedAllocator};
use crate::command::{FenceSync, ShmId, Token, TransferBuffer};
use crate::error::{Error, Result};
use crate::memory::MemorySegment;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

/// One shared-memory buffer, sub-allocated with a [`FencedAllocator`].
///
/// Operations that have to observe fence tokens take the fence source as a
/// parameter; the chunk never stores a reference to it.
///
/// # Memory Layout
///
/// ```text
/// base                                                    base + size
/// ├────────────┬───────────────┬──────────────────────────────────┤
/// │ alloc @ 0  │ alloc @ 128   │            free                  │
/// └────────────┴───────────────┴──────────────────────────────────┘
/// ```
pub struct MemoryChunk {
    shm_id: ShmId,
    segment: Arc<dyn MemorySegment>,
    /// Writable start of `segment`.
    base: NonNull<u8>,
    allocator: FencedAllocator,
}

impl MemoryChunk {
    /// Wrap a transfer buffer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSegment`] if the segment is empty, shorter
    /// than [`ALLOC_ALIGNMENT`], read-only, or larger than 4 GiB (offsets are
    /// 32-bit on the command stream). A trailing partial block is unused.
    pub fn new(buffer: TransferBuffer) -> Result<Self> {
        let segment = Arc::clone(buffer.segment());
        if segment.is_empty() {
            return Err(Error::InvalidSegment("transfer buffer is empty".into()));
        }
        if segment.len() < ALLOC_ALIGNMENT as usize {
            return Err(Error::InvalidSegment(format!(
                "transfer buffer of {} bytes is smaller than one {ALLOC_ALIGNMENT}-byte block",
                segment.len()
            )));
        }
        let size = u32::try_from(segment.len()).map_err(|_| {
            Error::InvalidSegment(format!(
                "transfer buffer of {} bytes exceeds 32-bit offsets",
                segment.len()
            ))
        })?;
        let base = segment
            .as_mut_ptr()
            .and_then(NonNull::new)
            .ok_or_else(|| Error::InvalidSegment("transfer buffer is not writable".into()))?;

        Ok(Self {
            shm_id: buffer.id(),
            segment,
            base,
            allocator: FencedAllocator::new(size),
        })
    }

    /// Id of the underlying transfer buffer.
    pub fn shm_id(&self) -> ShmId {
        self.shm_id
    }

    /// Allocatable bytes: the segment length rounded down to
    /// [`ALLOC_ALIGNMENT`].
    pub fn size(&self) -> u32 {
        self.allocator.size()
    }

    /// The backing segment.
    pub fn segment(&self) -> &Arc<dyn MemorySegment> {
        &self.segment
    }

    /// Allocate from already free space. Never waits.
    pub fn alloc(&mut self, size: u32) -> Option<NonNull<u8>> {
        let offset = self.allocator.alloc(size)?;
        Some(self.pointer_at(offset))
    }

    /// Allocate, waiting on pending frees if needed.
    pub fn alloc_waiting<F>(&mut self, size: u32, fence: &F) -> Option<NonNull<u8>>
    where
        F: FenceSync + ?Sized,
    {
        let offset = self.allocator.alloc_waiting(size, fence)?;
        Some(self.pointer_at(offset))
    }

    /// Free an allocation immediately.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` is not the start of an allocation in this chunk.
    pub fn free(&mut self, ptr: NonNull<u8>) {
        let offset = self.offset_of(ptr);
        self.allocator.free(offset);
    }

    /// Free an allocation once `token` has passed.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` is not the start of an allocation in this chunk.
    pub fn free_pending_token(&mut self, ptr: NonNull<u8>, token: Token) {
        let offset = self.offset_of(ptr);
        self.allocator.free_pending_token(offset, token);
    }

    /// Reclaim pending frees whose tokens have passed.
    pub fn free_unused<F>(&mut self, fence: &F)
    where
        F: FenceSync + ?Sized,
    {
        self.allocator.free_unused(fence);
    }

    /// Wait for every pending free and reclaim it.
    pub fn release_pending<F>(&mut self, fence: &F)
    where
        F: FenceSync + ?Sized,
    {
        self.allocator.release_pending(fence);
    }

    /// Largest allocation possible right now.
    pub fn largest_free_size_without_waiting<F>(&mut self, fence: &F) -> u32
    where
        F: FenceSync + ?Sized,
    {
        self.allocator.largest_free_size(fence)
    }

    /// Largest allocation possible once every pending token has passed.
    pub fn largest_free_size_with_waiting<F>(&mut self, fence: &F) -> u32
    where
        F: FenceSync + ?Sized,
    {
        self.allocator.largest_free_or_pending_size(fence)
    }

    /// Does the chunk hold any allocation or unreached pending free?
    pub fn in_use<F>(&mut self, fence: &F) -> bool
    where
        F: FenceSync + ?Sized,
    {
        self.allocator.in_use(fence)
    }

    /// Bytes currently allocated (pending frees excluded).
    pub fn bytes_in_use(&self) -> u32 {
        self.allocator.bytes_in_use()
    }

    /// Is `ptr` inside this chunk's buffer?
    pub fn contains(&self, ptr: *const u8) -> bool {
        self.segment.contains(ptr)
    }

    /// Offset of `ptr` from the start of the buffer.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` is outside the buffer.
    pub fn offset_of(&self, ptr: NonNull<u8>) -> u32 {
        assert!(
            self.contains(ptr.as_ptr()),
            "{:p} is outside {}",
            ptr,
            self.shm_id
        );
        (ptr.as_ptr() as usize - self.base.as_ptr() as usize) as u32
    }

    /// Pointer to `offset` bytes into the buffer.
    ///
    /// # Panics
    ///
    /// Panics if `offset` is past the end of the buffer.
    pub fn pointer_at(&self, offset: u32) -> NonNull<u8> {
        assert!(offset <= self.size(), "offset {offset} past end of {}", self.shm_id);
        // SAFETY: offset is within (or one past) the mapped segment.
        unsafe { self.base.add(offset as usize) }
    }

    /// The underlying allocator, for inspection.
    pub fn allocator(&self) -> &FencedAllocator {
        &self.allocator
    }
}

impl fmt::Debug for MemoryChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryChunk")
            .field("shm_id", &self.shm_id)
            .field("size", &self.size())
            .field("bytes_in_use", &self.bytes_in_use())
            .finish()
    }
}

// SAFETY: `base` points into `segment`, which is Send + Sync and kept
// alive by the Arc for as long as the chunk exists.
unsafe impl Send for MemoryChunk {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{InProcessCommandBuffer, TransferBufferFactory};
    use crate::memory::{HeapSegment, IpcHandle, MemoryType};

    const BUFFER_SIZE: u32 = 1024;
    const SHM_ID: ShmId = ShmId::new(123);

    fn chunk() -> MemoryChunk {
        let segment = Arc::new(HeapSegment::new(BUFFER_SIZE as usize).unwrap());
        MemoryChunk::new(TransferBuffer::new(SHM_ID, segment)).unwrap()
    }

    #[test]
    fn test_chunk_basic() {
        const SIZE: u32 = 16;
        let helper = InProcessCommandBuffer::new();
        let mut chunk = chunk();
        let base = chunk.segment().as_ptr();

        assert_eq!(chunk.shm_id(), SHM_ID);
        assert_eq!(chunk.largest_free_size_without_waiting(&helper), BUFFER_SIZE);
        assert_eq!(chunk.largest_free_size_with_waiting(&helper), BUFFER_SIZE);
        assert_eq!(chunk.size(), BUFFER_SIZE);

        let pointer = chunk.alloc(SIZE).unwrap();
        assert!(base <= pointer.as_ptr() as *const u8);
        assert!(chunk.offset_of(pointer) + SIZE <= BUFFER_SIZE);
        assert_eq!(chunk.largest_free_size_without_waiting(&helper), BUFFER_SIZE - SIZE);
        assert_eq!(chunk.largest_free_size_with_waiting(&helper), BUFFER_SIZE - SIZE);
        assert_eq!(chunk.size(), BUFFER_SIZE);

        chunk.free(pointer);
        assert_eq!(chunk.largest_free_size_without_waiting(&helper), BUFFER_SIZE);
        assert_eq!(chunk.largest_free_size_with_waiting(&helper), BUFFER_SIZE);

        let pointer = chunk.alloc(SIZE).unwrap();
        assert!(chunk.contains(pointer.as_ptr()));
        assert_eq!(chunk.largest_free_size_without_waiting(&helper), BUFFER_SIZE - SIZE);
        chunk.free(pointer);
        assert_eq!(chunk.largest_free_size_without_waiting(&helper), BUFFER_SIZE);
    }

    #[test]
    fn test_chunk_pending_free_sizes() {
        let helper = InProcessCommandBuffer::new();
        let mut chunk = chunk();
        let a = chunk.alloc(512).unwrap();
        let _b = chunk.alloc(512).unwrap();

        chunk.free_pending_token(a, helper.insert_token());
        assert_eq!(chunk.largest_free_size_without_waiting(&helper), 0);
        assert_eq!(chunk.largest_free_size_with_waiting(&helper), 512);
        assert_eq!(chunk.bytes_in_use(), 512);

        assert_eq!(chunk.alloc_waiting(512, &helper), Some(a));
        assert_eq!(chunk.bytes_in_use(), 1024);
    }

    #[test]
    fn test_chunk_offsets_round_trip() {
        let chunk = chunk();
        let ptr = chunk.pointer_at(256);
        assert_eq!(chunk.offset_of(ptr), 256);
        assert!(!chunk.contains(chunk.pointer_at(BUFFER_SIZE).as_ptr()));
    }

    #[test]
    fn test_chunk_in_use_tracks_pending() {
        let helper = InProcessCommandBuffer::new();
        let mut chunk = chunk();
        assert!(!chunk.in_use(&helper));
        let a = chunk.alloc(64).unwrap();
        assert!(chunk.in_use(&helper));
        chunk.free_pending_token(a, helper.insert_token());
        assert!(chunk.in_use(&helper));
        helper.finish();
        assert!(!chunk.in_use(&helper));
    }

    #[test]
    fn test_chunk_writes_land_in_segment() {
        let helper = InProcessCommandBuffer::new();
        let buffer = helper.create_transfer_buffer(256).unwrap();
        let mut chunk = MemoryChunk::new(buffer.clone()).unwrap();
        let _first = chunk.alloc(32).unwrap();
        let second = chunk.alloc(32).unwrap();
        unsafe { second.as_ptr().write(0xAB) };

        let seen_by_consumer = helper.transfer_buffer(buffer.id()).unwrap();
        unsafe { assert_eq!(seen_by_consumer.as_slice()[32], 0xAB) };
    }

    #[test]
    fn test_unaligned_segment_size_rounds_down() {
        let helper = InProcessCommandBuffer::new();
        let segment = Arc::new(HeapSegment::new(1000).unwrap());
        let mut chunk = MemoryChunk::new(TransferBuffer::new(SHM_ID, segment)).unwrap();

        assert_eq!(chunk.size(), 992);
        assert_eq!(chunk.largest_free_size_without_waiting(&helper), 992);
        assert!(chunk.alloc(993).is_none());
        let all = chunk.alloc(992).unwrap();
        assert_eq!(chunk.offset_of(all), 0);
        chunk.allocator().check_consistency().unwrap();
    }

    #[test]
    fn test_segment_smaller_than_alignment_rejected() {
        let segment = Arc::new(HeapSegment::new(8).unwrap());
        let result = MemoryChunk::new(TransferBuffer::new(SHM_ID, segment));
        assert!(matches!(result, Err(Error::InvalidSegment(_))));
    }

    struct ReadOnlySegment(Box<[u8]>);

    impl MemorySegment for ReadOnlySegment {
        fn as_ptr(&self) -> *const u8 {
            self.0.as_ptr()
        }
        fn as_mut_ptr(&self) -> Option<*mut u8> {
            None
        }
        fn len(&self) -> usize {
            self.0.len()
        }
        fn memory_type(&self) -> MemoryType {
            MemoryType::Heap
        }
        fn ipc_handle(&self) -> Option<IpcHandle> {
            None
        }
    }

    #[test]
    fn test_read_only_segment_rejected() {
        let segment = Arc::new(ReadOnlySegment(vec![0u8; 64].into_boxed_slice()));
        let result = MemoryChunk::new(TransferBuffer::new(SHM_ID, segment));
        assert!(matches!(result, Err(Error::InvalidSegment(_))));
    }

    #[test]
    #[should_panic(expected = "is outside")]
    fn test_foreign_pointer_panics() {
        let mut chunk = chunk();
        let other = HeapSegment::new(64).unwrap();
        let foreign = NonNull::new(other.as_mut_ptr().unwrap()).unwrap();
        chunk.free(foreign);
    }
}
