//! In-process command buffer.
//!
//! `InProcessCommandBuffer` plays both roles of a command-buffer connection:
//! the client side issues tokens and asks for transfer buffers, the service
//! side executes queued commands and owns the buffer registry. No IPC is
//! involved, which makes it suitable for tests, benchmarks and embedders
//! whose consumer lives in the same process.
//!
//! In [`ExecutionMode::Deferred`] the service only runs when the client has
//! to wait for something, so a freshly inserted token is guaranteed not to
//! have passed until `wait_for_token` or `finish` is called. This makes
//! fence behaviour deterministic.

use super::{FenceSync, ShmId, Token, TransferBuffer, TransferBufferFactory};
use crate::allocator::MemoryLimit;
use crate::error::{Error, Result};
use crate::memory::{HeapSegment, MemorySegment, SharedMemorySegment};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// When queued commands get executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// Execute only when the client waits or finishes.
    #[default]
    Deferred,
    /// Also execute everything queued on every flush.
    Immediate,
}

/// Which kind of segment backs new transfer buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SegmentBackend {
    /// Heap memory, in-process consumers only.
    #[default]
    Heap,
    /// memfd shared memory, shareable with another process.
    SharedMemory,
}

/// Configuration for an [`InProcessCommandBuffer`].
#[derive(Debug, Clone)]
pub struct CommandBufferConfig {
    /// When queued commands run.
    pub execution: ExecutionMode,
    /// Backend for transfer buffers.
    pub backend: SegmentBackend,
    /// Upper bound on the sum of live transfer buffer sizes.
    pub max_transfer_memory: MemoryLimit,
    /// Debug name, used for memfd names and log fields.
    pub name: String,
}

impl Default for CommandBufferConfig {
    fn default() -> Self {
        Self {
            execution: ExecutionMode::Deferred,
            backend: SegmentBackend::Heap,
            max_transfer_memory: MemoryLimit::Unbounded,
            name: "in-process".to_string(),
        }
    }
}

impl CommandBufferConfig {
    /// Set the execution mode.
    pub fn with_execution(mut self, execution: ExecutionMode) -> Self {
        self.execution = execution;
        self
    }

    /// Set the transfer buffer backend.
    pub fn with_backend(mut self, backend: SegmentBackend) -> Self {
        self.backend = backend;
        self
    }

    /// Cap the total size of live transfer buffers.
    pub fn with_max_transfer_memory(mut self, limit: MemoryLimit) -> Self {
        self.max_transfer_memory = limit;
        self
    }

    /// Set the debug name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Service-side state.
#[derive(Default)]
struct ServiceState {
    /// `SetToken` commands not yet executed, in issue order.
    queued_tokens: VecDeque<Token>,
    /// Live transfer buffers by id.
    buffers: HashMap<ShmId, Arc<dyn MemorySegment>>,
    /// Sum of live transfer buffer sizes.
    transfer_memory: usize,
}

/// A command buffer whose consumer runs in the calling process.
///
/// # Example
///
/// ```rust
/// use mapped_memory::command::{FenceSync, InProcessCommandBuffer};
///
/// let helper = InProcessCommandBuffer::new();
/// let token = helper.insert_token();
/// assert!(!helper.has_token_passed(token));
/// helper.finish();
/// assert!(helper.has_token_passed(token));
/// ```
pub struct InProcessCommandBuffer {
    config: CommandBufferConfig,
    state: Mutex<ServiceState>,
    /// Last token handed out by `insert_token`.
    last_token_issued: AtomicU64,
    /// Last token executed by the service.
    last_token_read: AtomicU64,
    next_shm_id: AtomicI32,
}

impl InProcessCommandBuffer {
    /// Create a command buffer with the default configuration.
    pub fn new() -> Self {
        Self::with_config(CommandBufferConfig::default())
    }

    /// Create a command buffer with the given configuration.
    pub fn with_config(config: CommandBufferConfig) -> Self {
        Self {
            config,
            state: Mutex::new(ServiceState::default()),
            last_token_issued: AtomicU64::new(Token::NONE.get()),
            last_token_read: AtomicU64::new(Token::NONE.get()),
            next_shm_id: AtomicI32::new(1),
        }
    }

    /// The configuration this command buffer was created with.
    pub fn config(&self) -> &CommandBufferConfig {
        &self.config
    }

    /// Execute up to `max` queued commands. Returns how many ran.
    pub fn process_commands(&self, max: usize) -> usize {
        let mut state = self.state.lock().unwrap();
        let mut processed = 0;
        while processed < max {
            let Some(token) = state.queued_tokens.pop_front() else {
                break;
            };
            self.last_token_read.store(token.get(), Ordering::Release);
            processed += 1;
        }
        processed
    }

    /// Number of commands waiting for the service.
    pub fn pending_commands(&self) -> usize {
        self.state.lock().unwrap().queued_tokens.len()
    }

    /// The last token issued to the stream.
    pub fn last_token_issued(&self) -> Token {
        Token::new(self.last_token_issued.load(Ordering::Acquire))
    }

    /// Look up a live transfer buffer, as the consumer would.
    pub fn transfer_buffer(&self, id: ShmId) -> Option<Arc<dyn MemorySegment>> {
        self.state.lock().unwrap().buffers.get(&id).cloned()
    }

    /// Number of live transfer buffers.
    pub fn num_transfer_buffers(&self) -> usize {
        self.state.lock().unwrap().buffers.len()
    }

    /// Sum of live transfer buffer sizes in bytes.
    pub fn transfer_memory(&self) -> usize {
        self.state.lock().unwrap().transfer_memory
    }

    fn create_segment(&self, id: ShmId, size: usize) -> Result<Arc<dyn MemorySegment>> {
        let segment: Arc<dyn MemorySegment> = match self.config.backend {
            SegmentBackend::Heap => Arc::new(HeapSegment::new(size)?),
            SegmentBackend::SharedMemory => {
                let name = format!("{}-{}", self.config.name, id.get());
                Arc::new(SharedMemorySegment::new(&name, size)?)
            }
        };
        Ok(segment)
    }
}

impl Default for InProcessCommandBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl FenceSync for InProcessCommandBuffer {
    fn insert_token(&self) -> Token {
        let mut state = self.state.lock().unwrap();
        let token = Token::new(self.last_token_issued.fetch_add(1, Ordering::AcqRel) + 1);
        state.queued_tokens.push_back(token);
        tracing::trace!(name = %self.config.name, %token, "inserted token");
        token
    }

    fn last_token_read(&self) -> Token {
        Token::new(self.last_token_read.load(Ordering::Acquire))
    }

    fn wait_for_token(&self, token: Token) {
        if self.has_token_passed(token) {
            return;
        }
        if token > self.last_token_issued() {
            tracing::error!(
                name = %self.config.name,
                %token,
                last_issued = %self.last_token_issued(),
                "waiting on a token that was never issued"
            );
            return;
        }

        tracing::debug!(name = %self.config.name, %token, "waiting for token");
        while !self.has_token_passed(token) {
            if self.process_commands(1) == 0 {
                break;
            }
        }
    }

    fn flush(&self) {
        if self.config.execution == ExecutionMode::Immediate {
            self.process_commands(usize::MAX);
        }
    }

    fn finish(&self) {
        let processed = self.process_commands(usize::MAX);
        tracing::trace!(name = %self.config.name, processed, "finished");
    }
}

impl TransferBufferFactory for InProcessCommandBuffer {
    fn create_transfer_buffer(&self, size: usize) -> Result<TransferBuffer> {
        if size == 0 {
            return Err(Error::AllocationFailed(
                "transfer buffer size must be greater than 0".into(),
            ));
        }
        let mut state = self.state.lock().unwrap();
        if let MemoryLimit::Bytes(limit) = self.config.max_transfer_memory {
            if state.transfer_memory.saturating_add(size) > limit {
                return Err(Error::TransferBufferLimit {
                    requested: size,
                    limit,
                });
            }
        }

        let id = ShmId::new(self.next_shm_id.fetch_add(1, Ordering::Relaxed));
        let segment = self.create_segment(id, size)?;

        state.buffers.insert(id, Arc::clone(&segment));
        state.transfer_memory += size;
        tracing::debug!(name = %self.config.name, %id, size, "created transfer buffer");

        Ok(TransferBuffer::new(id, segment))
    }

    fn destroy_transfer_buffer(&self, id: ShmId) {
        let mut state = self.state.lock().unwrap();
        match state.buffers.remove(&id) {
            Some(segment) => {
                state.transfer_memory -= segment.len();
                tracing::debug!(name = %self.config.name, %id, "destroyed transfer buffer");
            }
            None => {
                tracing::warn!(name = %self.config.name, %id, "destroying unknown transfer buffer");
            }
        }
    }
}
