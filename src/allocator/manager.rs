//! Multi-chunk mapped memory manager.
//!
//! The manager hands out ranges of GPU-visible shared memory. It keeps an
//! ordered list of [`MemoryChunk`]s and, per request, walks this state
//! machine:
//!
//! ```text
//! SEARCH_NO_WAIT ──found──────────────────────────────────────────► DONE
//!       │ not found
//!       ▼
//! SEARCH_WITH_WAIT (if idle memory ≥ reclaim limit) ──found──────► DONE
//!       │ not found or skipped
//!       ▼
//! CAN_GROW? ──yes──► NEW_CHUNK ──────────────────────────────────► DONE
//!       │ no (hard cap)
//!       ▼
//! SEARCH_WITH_WAIT (if not tried above) ──found──────────────────► DONE
//!       │ not found
//!       ▼
//!     FAIL (None)
//! ```
//!
//! Chunks are searched oldest first and blocks within a chunk lowest
//! address first, so placement is deterministic.

use super::{ALLOC_ALIGNMENT, DEFAULT_CHUNK_SIZE_MULTIPLE, MemoryChunk, round_up};
use crate::command::{CommandBufferHelper, ShmId, Token, TransferBufferFactory};
use crate::observability::AllocatorMetrics;
use std::ptr::NonNull;
use std::sync::Arc;

/// A byte limit that may be switched off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryLimit {
    /// No limit.
    #[default]
    Unbounded,
    /// At most this many bytes.
    Bytes(usize),
}

impl MemoryLimit {
    /// Is a limit in effect?
    pub fn is_bounded(&self) -> bool {
        matches!(self, MemoryLimit::Bytes(_))
    }

    /// The limit in bytes, if any.
    pub fn bytes(&self) -> Option<usize> {
        match self {
            MemoryLimit::Unbounded => None,
            MemoryLimit::Bytes(bytes) => Some(*bytes),
        }
    }

    /// Does `total` stay within the limit?
    pub fn allows(&self, total: usize) -> bool {
        match self {
            MemoryLimit::Unbounded => true,
            MemoryLimit::Bytes(limit) => total <= *limit,
        }
    }
}

/// Configuration for a [`MappedMemoryManager`].
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Once this much allocated memory is idle (free or pending), the
    /// manager waits on fences before growing.
    pub unused_memory_reclaim_limit: MemoryLimit,
    /// New chunks are sized to a multiple of this.
    pub chunk_size_multiple: u32,
    /// Hard cap on the sum of chunk sizes.
    pub max_allocated_bytes: MemoryLimit,
    /// Idle chunks `free_unused` keeps, oldest first.
    pub min_retained_chunks: usize,
    /// Label for logs and metrics.
    pub name: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            unused_memory_reclaim_limit: MemoryLimit::Unbounded,
            chunk_size_multiple: DEFAULT_CHUNK_SIZE_MULTIPLE,
            max_allocated_bytes: MemoryLimit::Unbounded,
            min_retained_chunks: 0,
            name: "mapped-memory".to_string(),
        }
    }
}

impl ManagerConfig {
    /// Set the unused memory reclaim limit.
    pub fn with_unused_memory_reclaim_limit(mut self, limit: MemoryLimit) -> Self {
        self.unused_memory_reclaim_limit = limit;
        self
    }

    /// Set the chunk size multiple.
    pub fn with_chunk_size_multiple(mut self, multiple: u32) -> Self {
        self.chunk_size_multiple = multiple;
        self
    }

    /// Set the hard cap on allocated bytes.
    pub fn with_max_allocated_bytes(mut self, limit: MemoryLimit) -> Self {
        self.max_allocated_bytes = limit;
        self
    }

    /// Keep up to `count` idle chunks across `free_unused`.
    pub fn with_min_retained_chunks(mut self, count: usize) -> Self {
        self.min_retained_chunks = count;
        self
    }

    /// Set the name used in logs and metrics.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// A successful allocation: where it is for the client, and how the
/// consumer finds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedAllocation {
    ptr: NonNull<u8>,
    shm_id: ShmId,
    offset: u32,
    size: u32,
}

impl MappedAllocation {
    /// Client-side address.
    pub fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Client-side address as a raw pointer.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Transfer buffer holding the allocation.
    pub fn shm_id(&self) -> ShmId {
        self.shm_id
    }

    /// Offset of the allocation inside the transfer buffer.
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Requested size in bytes.
    pub fn size(&self) -> u32 {
        self.size
    }
}

/// Per-chunk entry of a [`MappedMemoryDump`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDump {
    /// Transfer buffer id.
    pub shm_id: ShmId,
    /// Chunk capacity.
    pub size: u32,
    /// Allocated bytes.
    pub bytes_in_use: u32,
    /// Largest allocation possible without waiting.
    pub largest_free_size: u32,
}

/// Snapshot of a manager's memory, for memory-infra style reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedMemoryDump {
    /// Manager name.
    pub name: String,
    /// Sum of chunk capacities.
    pub allocated_memory: usize,
    /// Sum of allocated bytes.
    pub bytes_in_use: usize,
    /// One entry per chunk, in creation order.
    pub chunks: Vec<ChunkDump>,
}

/// Sub-allocates command-buffer shared memory across growing chunks.
///
/// Not internally synchronized: it belongs to the thread that issues
/// commands on `helper`.
pub struct MappedMemoryManager {
    helper: Arc<dyn CommandBufferHelper>,
    chunks: Vec<MemoryChunk>,
    chunk_size_multiple: u32,
    /// Sum of chunk sizes.
    allocated_memory: usize,
    unused_memory_reclaim_limit: MemoryLimit,
    max_allocated_bytes: MemoryLimit,
    min_retained_chunks: usize,
    name: String,
    metrics: AllocatorMetrics,
}

impl MappedMemoryManager {
    /// Create a manager with default settings and the given reclaim limit.
    pub fn new(
        helper: Arc<dyn CommandBufferHelper>,
        unused_memory_reclaim_limit: MemoryLimit,
    ) -> Self {
        Self::with_config(
            helper,
            ManagerConfig::default().with_unused_memory_reclaim_limit(unused_memory_reclaim_limit),
        )
    }

    /// Create a manager from a full configuration.
    pub fn with_config(helper: Arc<dyn CommandBufferHelper>, config: ManagerConfig) -> Self {
        let metrics = AllocatorMetrics::new(&config.name);
        let mut manager = Self {
            helper,
            chunks: Vec::new(),
            chunk_size_multiple: DEFAULT_CHUNK_SIZE_MULTIPLE,
            allocated_memory: 0,
            unused_memory_reclaim_limit: config.unused_memory_reclaim_limit,
            max_allocated_bytes: config.max_allocated_bytes,
            min_retained_chunks: config.min_retained_chunks,
            name: config.name,
            metrics,
        };
        manager.set_chunk_size_multiple(config.chunk_size_multiple);
        manager
    }

    /// Allocate `size` bytes.
    ///
    /// When the hard cap forbids growing, pending frees are waited on even if
    /// the reclaim limit has not been reached.
    ///
    /// Returns `None` for zero-sized requests, when the hard cap forbids
    /// growing and no existing chunk has room even after waiting, or when
    /// the transfer buffer factory fails. Callers are expected to back off
    /// and retry.
    pub fn alloc(&mut self, size: u32) -> Option<MappedAllocation> {
        if size == 0 {
            tracing::trace!(name = %self.name, "rejecting zero-sized allocation");
            return None;
        }

        let allocation = self.alloc_in_order(size);

        match &allocation {
            Some(allocation) => tracing::trace!(
                name = %self.name,
                size,
                shm_id = %allocation.shm_id,
                offset = allocation.offset,
                "allocated"
            ),
            None => {
                tracing::warn!(
                    name = %self.name,
                    size,
                    allocated_memory = self.allocated_memory,
                    "allocation failed"
                );
                self.metrics.record_alloc_failure();
            }
        }
        self.record_usage();
        allocation
    }

    /// Free an allocation immediately.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` does not belong to any chunk of this manager.
    pub fn free(&mut self, ptr: NonNull<u8>) {
        self.chunk_containing(ptr).free(ptr);
        self.record_usage();
    }

    /// Free an allocation once the consumer has reached `token`.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` does not belong to any chunk of this manager.
    pub fn free_pending_token(&mut self, ptr: NonNull<u8>, token: Token) {
        self.chunk_containing(ptr).free_pending_token(ptr, token);
        self.record_usage();
    }

    /// Release idle chunks back to the transfer buffer factory.
    ///
    /// A chunk is idle when it holds no allocation and no pending free whose
    /// token is still unreached. The first `min_retained_chunks` idle chunks
    /// (oldest first) are kept. Returns the number of chunks released.
    pub fn free_unused(&mut self) -> usize {
        let helper = &*self.helper;
        let name = &self.name;
        let min_retained = self.min_retained_chunks;
        let mut retained = 0;
        let mut freed = 0;
        let mut freed_bytes = 0;

        self.chunks.retain_mut(|chunk| {
            if chunk.in_use(helper) {
                return true;
            }
            if retained < min_retained {
                retained += 1;
                return true;
            }
            tracing::debug!(name = %name, shm_id = %chunk.shm_id(), size = chunk.size(), "releasing idle chunk");
            helper.destroy_transfer_buffer(chunk.shm_id());
            freed += 1;
            freed_bytes += chunk.size() as usize;
            false
        });

        self.allocated_memory -= freed_bytes;
        if freed > 0 {
            self.metrics.record_chunks_freed(freed);
        }
        self.record_usage();
        freed
    }

    /// Number of chunks.
    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Sum of chunk capacities (reserved shared memory, not bytes in use).
    pub fn allocated_memory(&self) -> usize {
        self.allocated_memory
    }

    /// Sum of bytes handed out and not yet freed.
    pub fn bytes_in_use(&self) -> usize {
        self.chunks
            .iter()
            .map(|chunk| chunk.bytes_in_use() as usize)
            .sum()
    }

    /// Rounding multiple for new chunks.
    pub fn chunk_size_multiple(&self) -> u32 {
        self.chunk_size_multiple
    }

    /// Set the rounding multiple for new chunks.
    ///
    /// The value is rounded up to [`ALLOC_ALIGNMENT`]; zero becomes
    /// [`ALLOC_ALIGNMENT`]. Existing chunks are not affected.
    pub fn set_chunk_size_multiple(&mut self, multiple: u32) {
        let aligned = round_up(multiple.max(1), ALLOC_ALIGNMENT)
            .unwrap_or(u32::MAX - u32::MAX % ALLOC_ALIGNMENT);
        if aligned != multiple {
            tracing::debug!(name = %self.name, requested = multiple, used = aligned, "aligned chunk size multiple");
        }
        self.chunk_size_multiple = aligned;
    }

    /// Hard cap on allocated bytes.
    pub fn max_allocated_bytes(&self) -> MemoryLimit {
        self.max_allocated_bytes
    }

    /// Set the hard cap on allocated bytes.
    ///
    /// Existing chunks are kept even if they exceed the new cap; it only
    /// stops further growth.
    pub fn set_max_allocated_bytes(&mut self, limit: MemoryLimit) {
        self.max_allocated_bytes = limit;
    }

    /// Idle memory above which the manager waits rather than grows.
    pub fn unused_memory_reclaim_limit(&self) -> MemoryLimit {
        self.unused_memory_reclaim_limit
    }

    /// Idle chunks kept by `free_unused`.
    pub fn min_retained_chunks(&self) -> usize {
        self.min_retained_chunks
    }

    /// Set the number of idle chunks kept by `free_unused`.
    pub fn set_min_retained_chunks(&mut self, count: usize) {
        self.min_retained_chunks = count;
    }

    /// The command buffer this manager allocates for.
    pub fn helper(&self) -> &Arc<dyn CommandBufferHelper> {
        &self.helper
    }

    /// The chunks, in creation order.
    pub fn chunks(&self) -> &[MemoryChunk] {
        &self.chunks
    }

    /// Manager name used in logs and metrics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Snapshot every chunk. Reclaims pending frees whose tokens have passed.
    pub fn memory_dump(&mut self) -> MappedMemoryDump {
        let helper = &*self.helper;
        let chunks = self
            .chunks
            .iter_mut()
            .map(|chunk| ChunkDump {
                shm_id: chunk.shm_id(),
                size: chunk.size(),
                bytes_in_use: chunk.bytes_in_use(),
                largest_free_size: chunk.largest_free_size_without_waiting(helper),
            })
            .collect();

        MappedMemoryDump {
            name: self.name.clone(),
            allocated_memory: self.allocated_memory,
            bytes_in_use: self.bytes_in_use(),
            chunks,
        }
    }

    fn alloc_in_order(&mut self, size: u32) -> Option<MappedAllocation> {
        if let Some(allocation) = self.alloc_without_waiting(size) {
            return Some(allocation);
        }

        let reclaim = self.reclaim_limit_reached();
        if reclaim {
            if let Some(allocation) = self.alloc_with_waiting(size) {
                return Some(allocation);
            }
        }

        match self.new_chunk_size(size) {
            Some(chunk_size) => self.alloc_from_new_chunk(size, chunk_size),
            // The cap blocks growth: pending frees are all that is left.
            None if !reclaim => self.alloc_with_waiting(size),
            None => None,
        }
    }

    /// Poll every chunk's fences and allocate from already free space.
    fn alloc_without_waiting(&mut self, size: u32) -> Option<MappedAllocation> {
        if size as usize > self.allocated_memory {
            return None;
        }
        let helper = &*self.helper;
        self.chunks.iter_mut().find_map(|chunk| {
            chunk.free_unused(helper);
            let ptr = chunk.alloc(size)?;
            Some(allocation_in(chunk, ptr, size))
        })
    }

    /// Is enough allocated memory idle (free or pending) to prefer waiting
    /// over growing?
    fn reclaim_limit_reached(&self) -> bool {
        let Some(limit) = self.unused_memory_reclaim_limit.bytes() else {
            return false;
        };
        self.allocated_memory - self.bytes_in_use() >= limit
    }

    /// Allocate from the first chunk that fits once its pending frees pass.
    fn alloc_with_waiting(&mut self, size: u32) -> Option<MappedAllocation> {
        let helper = &*self.helper;
        let index = self
            .chunks
            .iter_mut()
            .position(|chunk| chunk.largest_free_size_with_waiting(helper) >= size)?;

        tracing::debug!(name = %self.name, size, shm_id = %self.chunks[index].shm_id(), "waiting on fences");
        let _timer = self.metrics.start_wait_timer();
        let chunk = &mut self.chunks[index];
        let ptr = chunk.alloc_waiting(size, helper)?;
        self.metrics.record_fence_wait();
        Some(allocation_in(chunk, ptr, size))
    }

    fn alloc_from_new_chunk(&mut self, size: u32, chunk_size: u32) -> Option<MappedAllocation> {
        let buffer = match self.helper.create_transfer_buffer(chunk_size as usize) {
            Ok(buffer) => buffer,
            Err(e) => {
                tracing::warn!(name = %self.name, chunk_size, error = %e, "failed to create transfer buffer");
                return None;
            }
        };
        let shm_id = buffer.id();
        let mut chunk = match MemoryChunk::new(buffer) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::warn!(name = %self.name, %shm_id, error = %e, "unusable transfer buffer");
                self.helper.destroy_transfer_buffer(shm_id);
                return None;
            }
        };

        self.allocated_memory += chunk.size() as usize;
        self.metrics.record_chunk_created();
        tracing::debug!(
            name = %self.name,
            %shm_id,
            chunk_size,
            allocated_memory = self.allocated_memory,
            "created chunk"
        );

        let allocation = chunk.alloc(size).map(|ptr| allocation_in(&chunk, ptr, size));
        self.chunks.push(chunk);
        allocation
    }

    /// Size of the chunk to create for `size`, or `None` if the hard cap
    /// forbids growing.
    fn new_chunk_size(&self, size: u32) -> Option<u32> {
        let preferred = round_up(size, self.chunk_size_multiple)?;
        if self
            .max_allocated_bytes
            .allows(self.allocated_memory + preferred as usize)
        {
            return Some(preferred);
        }

        // A cap below the multiple still admits a chunk sized to the request.
        let minimal = round_up(size, ALLOC_ALIGNMENT)?;
        if minimal < preferred
            && self
                .max_allocated_bytes
                .allows(self.allocated_memory + minimal as usize)
        {
            tracing::debug!(name = %self.name, preferred, minimal, "shrinking chunk to fit the cap");
            return Some(minimal);
        }

        tracing::debug!(
            name = %self.name,
            size,
            allocated_memory = self.allocated_memory,
            max_allocated_bytes = ?self.max_allocated_bytes.bytes(),
            "max allocated bytes blocks growth"
        );
        None
    }

    fn chunk_containing(&mut self, ptr: NonNull<u8>) -> &mut MemoryChunk {
        match self
            .chunks
            .iter_mut()
            .find(|chunk| chunk.contains(ptr.as_ptr()))
        {
            Some(chunk) => chunk,
            None => panic!("{ptr:p} is not owned by mapped memory manager {}", self.name),
        }
    }

    fn record_usage(&self) {
        self.metrics
            .record_usage(self.allocated_memory, self.bytes_in_use(), self.chunks.len());
    }
}

fn allocation_in(chunk: &MemoryChunk, ptr: NonNull<u8>, size: u32) -> MappedAllocation {
    MappedAllocation {
        ptr,
        shm_id: chunk.shm_id(),
        offset: chunk.offset_of(ptr),
        size,
    }
}

impl Drop for MappedMemoryManager {
    fn drop(&mut self) {
        let helper = &*self.helper;
        for chunk in self.chunks.iter_mut() {
            chunk.release_pending(helper);
            if chunk.bytes_in_use() > 0 {
                tracing::warn!(
                    name = %self.name,
                    shm_id = %chunk.shm_id(),
                    bytes_in_use = chunk.bytes_in_use(),
                    "dropping chunk with live allocations"
                );
            }
            helper.destroy_transfer_buffer(chunk.shm_id());
        }
        self.chunks.clear();
        self.allocated_memory = 0;
        self.record_usage();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{FenceSync, InProcessCommandBuffer};

    fn setup(limit: MemoryLimit) -> (Arc<InProcessCommandBuffer>, MappedMemoryManager) {
        let helper = Arc::new(InProcessCommandBuffer::new());
        let manager = MappedMemoryManager::new(helper.clone(), limit);
        (helper, manager)
    }

    #[test]
    fn test_zero_sized_alloc_returns_none() {
        let (_helper, mut manager) = setup(MemoryLimit::Unbounded);
        assert!(manager.alloc(0).is_none());
        assert_eq!(manager.num_chunks(), 0);
    }

    #[test]
    fn test_chunk_size_multiple_is_aligned() {
        let (_helper, mut manager) = setup(MemoryLimit::Unbounded);
        assert_eq!(manager.chunk_size_multiple(), ALLOC_ALIGNMENT);
        manager.set_chunk_size_multiple(0);
        assert_eq!(manager.chunk_size_multiple(), ALLOC_ALIGNMENT);
        manager.set_chunk_size_multiple(1000);
        assert_eq!(manager.chunk_size_multiple(), 1008);
        manager.set_chunk_size_multiple(4096);
        assert_eq!(manager.chunk_size_multiple(), 4096);
    }

    #[test]
    fn test_chunk_size_multiple_only_affects_new_chunks() {
        let (_helper, mut manager) = setup(MemoryLimit::Unbounded);
        let a = manager.alloc(100).unwrap();
        assert_eq!(manager.allocated_memory(), 112);
        manager.set_chunk_size_multiple(4096);
        assert_eq!(manager.chunks()[0].size(), 112);
        let b = manager.alloc(100).unwrap();
        assert_ne!(a.shm_id(), b.shm_id());
        assert_eq!(manager.allocated_memory(), 112 + 4096);
    }

    #[test]
    fn test_hard_cap_below_multiple_shrinks_chunk() {
        let helper = Arc::new(InProcessCommandBuffer::new());
        let mut manager = MappedMemoryManager::with_config(
            helper.clone(),
            ManagerConfig::default()
                .with_chunk_size_multiple(4096)
                .with_max_allocated_bytes(MemoryLimit::Bytes(1024)),
        );

        let a = manager.alloc(600).unwrap();
        assert_eq!(manager.allocated_memory(), 608);
        // 608 + 416 = 1024 still fits.
        let b = manager.alloc(416).unwrap();
        assert_ne!(a.shm_id(), b.shm_id());
        assert_eq!(manager.allocated_memory(), 1024);
        assert!(manager.alloc(16).is_none());
    }

    #[test]
    fn test_hard_cap_waits_on_pending_free() {
        let (helper, mut manager) = setup(MemoryLimit::Unbounded);
        manager.set_max_allocated_bytes(MemoryLimit::Bytes(1024));

        let a = manager.alloc(1024).unwrap();
        let token = helper.insert_token();
        manager.free_pending_token(a.ptr(), token);

        // Growing is refused, so the pending range is waited on.
        let b = manager.alloc(1024).unwrap();
        assert!(helper.has_token_passed(token));
        assert_eq!(b.shm_id(), a.shm_id());
        assert_eq!(b.offset(), 0);
        assert_eq!(manager.num_chunks(), 1);
    }

    #[test]
    fn test_hard_cap_skips_wait_when_pending_is_too_small() {
        let (helper, mut manager) = setup(MemoryLimit::Unbounded);
        manager.set_max_allocated_bytes(MemoryLimit::Bytes(1024));
        manager.set_chunk_size_multiple(1024);

        let a = manager.alloc(512).unwrap();
        let _b = manager.alloc(512).unwrap();
        let token = helper.insert_token();
        manager.free_pending_token(a.ptr(), token);

        assert!(manager.alloc(1024).is_none());
        assert!(!helper.has_token_passed(token));
        assert_eq!(helper.pending_commands(), 1);
    }

    #[test]
    fn test_factory_failure_is_reported_as_none() {
        let helper = Arc::new(InProcessCommandBuffer::with_config(
            crate::command::CommandBufferConfig::default()
                .with_max_transfer_memory(MemoryLimit::Bytes(1024)),
        ));
        let mut manager = MappedMemoryManager::new(helper.clone(), MemoryLimit::Unbounded);
        assert!(manager.alloc(1024).is_some());
        assert!(manager.alloc(1024).is_none());
        assert_eq!(manager.num_chunks(), 1);
        assert_eq!(helper.num_transfer_buffers(), 1);
    }

    #[test]
    fn test_memory_dump() {
        let (_helper, mut manager) = setup(MemoryLimit::Unbounded);
        manager.set_chunk_size_multiple(1024);
        let _a = manager.alloc(256).unwrap();
        let _b = manager.alloc(2048).unwrap();

        let dump = manager.memory_dump();
        assert_eq!(dump.name, "mapped-memory");
        assert_eq!(dump.allocated_memory, 1024 + 2048);
        assert_eq!(dump.bytes_in_use, 256 + 2048);
        assert_eq!(dump.chunks.len(), 2);
        assert_eq!(dump.chunks[0].size, 1024);
        assert_eq!(dump.chunks[0].largest_free_size, 768);
        assert_eq!(dump.chunks[1].bytes_in_use, 2048);
        assert_eq!(dump.chunks[1].largest_free_size, 0);
    }

    #[test]
    fn test_min_retained_chunks_keeps_oldest_idle() {
        let helper = Arc::new(InProcessCommandBuffer::new());
        let mut manager = MappedMemoryManager::with_config(
            helper.clone(),
            ManagerConfig::default().with_min_retained_chunks(1),
        );
        let a = manager.alloc(1024).unwrap();
        let b = manager.alloc(1024).unwrap();
        let c = manager.alloc(1024).unwrap();
        manager.free(a.ptr());
        manager.free(c.ptr());

        assert_eq!(manager.free_unused(), 1);
        let ids: Vec<_> = manager.chunks().iter().map(|chunk| chunk.shm_id()).collect();
        assert_eq!(ids, vec![a.shm_id(), b.shm_id()]);
        assert_eq!(manager.allocated_memory(), 2048);

        manager.free(b.ptr());
        assert_eq!(manager.free_unused(), 1);
        assert_eq!(manager.num_chunks(), 1);
        assert_eq!(manager.chunks()[0].shm_id(), a.shm_id());
    }

    #[test]
    fn test_free_unused_keeps_unreached_pending_chunks() {
        let (helper, mut manager) = setup(MemoryLimit::Unbounded);
        let a = manager.alloc(512).unwrap();
        manager.free_pending_token(a.ptr(), helper.insert_token());
        assert_eq!(manager.free_unused(), 0);
        assert_eq!(manager.num_chunks(), 1);

        helper.finish();
        assert_eq!(manager.free_unused(), 1);
        assert_eq!(manager.num_chunks(), 0);
        assert_eq!(manager.allocated_memory(), 0);
        assert_eq!(helper.num_transfer_buffers(), 0);
    }

    #[test]
    fn test_drop_waits_and_destroys_buffers() {
        let (helper, mut manager) = setup(MemoryLimit::Unbounded);
        let a = manager.alloc(512).unwrap();
        let _b = manager.alloc(512).unwrap();
        let token = helper.insert_token();
        manager.free_pending_token(a.ptr(), token);
        assert_eq!(helper.num_transfer_buffers(), 2);

        drop(manager);
        assert!(helper.has_token_passed(token));
        assert_eq!(helper.num_transfer_buffers(), 0);
    }

    #[test]
    #[should_panic(expected = "is not owned by mapped memory manager")]
    fn test_free_of_foreign_pointer_panics() {
        let (_helper, mut manager) = setup(MemoryLimit::Unbounded);
        let _a = manager.alloc(64).unwrap();
        let mut outside = [0u8; 16];
        manager.free(NonNull::new(outside.as_mut_ptr()).unwrap());
    }
}
