//! The command-stream side of the allocator.
//!
//! The allocator only needs two things from the command buffer it serves:
//!
//! - [`FenceSync`]: issue fence tokens and observe which token the consumer
//!   has reached
//! - [`TransferBufferFactory`]: create and destroy the shared buffers chunks
//!   live in
//!
//! [`CommandBufferHelper`] bundles both and is what
//! [`MappedMemoryManager`](crate::MappedMemoryManager) holds on to.
//! [`InProcessCommandBuffer`] implements it without any IPC.

mod in_process;

pub use in_process::{CommandBufferConfig, ExecutionMode, InProcessCommandBuffer, SegmentBackend};

use crate::error::Result;
use crate::memory::MemorySegment;
use std::fmt;
use std::sync::Arc;

/// A fence token issued into the command stream.
///
/// Tokens from one helper are strictly increasing. Reaching token `t` in the
/// consumer means every command issued before `t` has completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Token(u64);

impl Token {
    /// The token every stream has reached before anything is issued.
    pub const NONE: Token = Token(0);

    /// Wrap a raw token value.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The raw token value.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Opaque identifier of a transfer buffer, meaningful to the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShmId(i32);

impl ShmId {
    /// Wrap a raw id.
    pub const fn new(id: i32) -> Self {
        Self(id)
    }

    /// The raw id sent over IPC.
    pub const fn get(self) -> i32 {
        self.0
    }
}

impl fmt::Display for ShmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shm:{}", self.0)
    }
}

/// A shared buffer created by a [`TransferBufferFactory`].
#[derive(Clone)]
pub struct TransferBuffer {
    id: ShmId,
    segment: Arc<dyn MemorySegment>,
}

impl TransferBuffer {
    /// Pair a segment with the id the consumer knows it by.
    pub fn new(id: ShmId, segment: Arc<dyn MemorySegment>) -> Self {
        Self { id, segment }
    }

    /// The buffer's id.
    pub fn id(&self) -> ShmId {
        self.id
    }

    /// The backing segment.
    pub fn segment(&self) -> &Arc<dyn MemorySegment> {
        &self.segment
    }

    /// Size of the buffer in bytes.
    pub fn len(&self) -> usize {
        self.segment.len()
    }

    /// Returns true if the buffer has zero length.
    pub fn is_empty(&self) -> bool {
        self.segment.is_empty()
    }
}

impl fmt::Debug for TransferBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferBuffer")
            .field("id", &self.id)
            .field("len", &self.segment.len())
            .field("memory_type", &self.segment.memory_type())
            .finish()
    }
}

/// Fence operations of a command stream.
///
/// "Waiting" is logical: an implementation may have to pump the consumer's
/// pending work to make progress, but it never sleeps on a lock held by the
/// caller.
pub trait FenceSync {
    /// Queue a `SetToken` command and return the token it will set.
    fn insert_token(&self) -> Token;

    /// The latest token the consumer has processed.
    fn last_token_read(&self) -> Token;

    /// Has the consumer processed `token`?
    fn has_token_passed(&self, token: Token) -> bool {
        token <= self.last_token_read()
    }

    /// Block until the consumer has processed `token`.
    fn wait_for_token(&self, token: Token);

    /// Make queued commands visible to the consumer.
    fn flush(&self);

    /// Flush and wait until the consumer has processed everything issued.
    fn finish(&self);
}

/// Creates and destroys shared buffers on behalf of the allocator.
pub trait TransferBufferFactory {
    /// Create a buffer of exactly `size` bytes.
    fn create_transfer_buffer(&self, size: usize) -> Result<TransferBuffer>;

    /// Release a buffer previously returned by `create_transfer_buffer`.
    fn destroy_transfer_buffer(&self, id: ShmId);
}

/// Everything the manager needs from its command buffer.
pub trait CommandBufferHelper: FenceSync + TransferBufferFactory + Send + Sync {}

impl<T> CommandBufferHelper for T where T: FenceSync + TransferBufferFactory + Send + Sync {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_ordering() {
        assert!(Token::NONE < Token::new(1));
        assert_eq!(Token::new(7).get(), 7);
        assert_eq!(Token::new(3).to_string(), "#3");
        assert_eq!(Token::default(), Token::NONE);
    }

    #[test]
    fn test_shm_id_display() {
        assert_eq!(ShmId::new(123).to_string(), "shm:123");
        assert_eq!(ShmId::new(-1).get(), -1);
    }
}
