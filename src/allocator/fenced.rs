//! Offset allocator with fence-deferred frees.
//!
//! `FencedAllocator` manages the offsets of a single buffer. It knows nothing
//! about pointers; [`MemoryChunk`](super::MemoryChunk) layers those on top.
//!
//! # Block list
//!
//! The buffer is tiled by a vector of blocks sorted by offset:
//!
//! ```text
//! ┌──────────┬────────────────────┬──────────┬──────────────────────┐
//! │  InUse   │ FreePendingToken#7 │  InUse   │         Free         │
//! └──────────┴────────────────────┴──────────┴──────────────────────┘
//! 0                                                               size
//! ```
//!
//! - blocks are disjoint, ordered, and cover `[0, size)` exactly
//! - two `Free` blocks are never adjacent (frees coalesce)
//! - a `FreePendingToken` block becomes `Free` once its token has passed
//!
//! Allocation is first-fit in address order.

use super::{ALLOC_ALIGNMENT, round_up};
use crate::command::{FenceSync, Token};

/// State of one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// Available for allocation.
    Free,
    /// Handed out to a caller.
    InUse,
    /// Freed by the caller, but the consumer may still read it until the
    /// block's token passes.
    FreePendingToken,
}

/// A contiguous range of the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    /// Current state.
    pub state: BlockState,
    /// Start of the range.
    pub offset: u32,
    /// Length of the range.
    pub size: u32,
    /// Token guarding a pending free, `Token::NONE` otherwise.
    pub token: Token,
}

/// First-fit offset allocator whose frees can wait for a fence token.
#[derive(Debug)]
pub struct FencedAllocator {
    blocks: Vec<Block>,
    size: u32,
    bytes_in_use: u32,
}

impl FencedAllocator {
    /// Create an allocator over `size` bytes.
    ///
    /// The managed size is rounded down to [`ALLOC_ALIGNMENT`].
    pub fn new(size: u32) -> Self {
        let size = size - size % ALLOC_ALIGNMENT;
        Self {
            blocks: vec![Block {
                state: BlockState::Free,
                offset: 0,
                size,
                token: Token::NONE,
            }],
            size,
            bytes_in_use: 0,
        }
    }

    /// Allocate `size` bytes from a block that is already free.
    ///
    /// Never waits. Returns `None` for zero-sized requests and when no free
    /// block is large enough.
    pub fn alloc(&mut self, size: u32) -> Option<u32> {
        if size == 0 {
            return None;
        }
        let size = round_up(size, ALLOC_ALIGNMENT)?;

        let index = self
            .blocks
            .iter()
            .position(|block| block.state == BlockState::Free && block.size >= size)?;
        Some(self.alloc_in_block(index, size))
    }

    /// Allocate `size` bytes, waiting on pending tokens if nothing is free.
    ///
    /// Pending blocks are waited on in address order until a coalesced block
    /// is large enough.
    pub fn alloc_waiting<F>(&mut self, size: u32, fence: &F) -> Option<u32>
    where
        F: FenceSync + ?Sized,
    {
        if let Some(offset) = self.alloc(size) {
            return Some(offset);
        }
        if size == 0 {
            return None;
        }
        let size = round_up(size, ALLOC_ALIGNMENT)?;

        let mut index = 0;
        while index < self.blocks.len() {
            if self.blocks[index].state == BlockState::FreePendingToken {
                index = self.wait_for_token_and_free_block(index, fence);
                if self.blocks[index].size >= size {
                    return Some(self.alloc_in_block(index, size));
                }
            }
            index += 1;
        }
        None
    }

    /// Free the allocation starting at `offset` immediately.
    ///
    /// # Panics
    ///
    /// Panics if no allocation or pending free starts at `offset`.
    pub fn free(&mut self, offset: u32) {
        let index = self.block_index(offset);
        let block = &mut self.blocks[index];
        assert_ne!(
            block.state,
            BlockState::Free,
            "double free of offset {offset}"
        );

        if block.state == BlockState::InUse {
            self.bytes_in_use -= block.size;
        }
        block.state = BlockState::Free;
        block.token = Token::NONE;
        self.collapse_free_block(index);
    }

    /// Free the allocation starting at `offset` once `token` has passed.
    ///
    /// # Panics
    ///
    /// Panics if no allocation starts at `offset`.
    pub fn free_pending_token(&mut self, offset: u32, token: Token) {
        let index = self.block_index(offset);
        let block = &mut self.blocks[index];
        assert_eq!(
            block.state,
            BlockState::InUse,
            "pending free of offset {offset} which is not allocated"
        );

        self.bytes_in_use -= block.size;
        block.state = BlockState::FreePendingToken;
        block.token = token;
    }

    /// Turn every pending block whose token has passed into a free block.
    pub fn free_unused<F>(&mut self, fence: &F)
    where
        F: FenceSync + ?Sized,
    {
        let mut index = 0;
        while index < self.blocks.len() {
            let block = &mut self.blocks[index];
            if block.state == BlockState::FreePendingToken && fence.has_token_passed(block.token) {
                block.state = BlockState::Free;
                block.token = Token::NONE;
                index = self.collapse_free_block(index);
            }
            index += 1;
        }
    }

    /// Wait on every pending token and free the blocks.
    pub fn release_pending<F>(&mut self, fence: &F)
    where
        F: FenceSync + ?Sized,
    {
        let mut index = 0;
        while index < self.blocks.len() {
            if self.blocks[index].state == BlockState::FreePendingToken {
                index = self.wait_for_token_and_free_block(index, fence);
            }
            index += 1;
        }
    }

    /// Largest block available without waiting.
    pub fn largest_free_size<F>(&mut self, fence: &F) -> u32
    where
        F: FenceSync + ?Sized,
    {
        self.free_unused(fence);
        self.blocks
            .iter()
            .filter(|block| block.state == BlockState::Free)
            .map(|block| block.size)
            .max()
            .unwrap_or(0)
    }

    /// Largest run of free and pending blocks, i.e. the largest block
    /// available after waiting on every token.
    pub fn largest_free_or_pending_size<F>(&mut self, fence: &F) -> u32
    where
        F: FenceSync + ?Sized,
    {
        self.free_unused(fence);
        let mut max_size = 0;
        let mut current_size = 0;
        for block in &self.blocks {
            if block.state == BlockState::InUse {
                max_size = max_size.max(current_size);
                current_size = 0;
            } else {
                current_size += block.size;
            }
        }
        max_size.max(current_size)
    }

    /// Does the buffer hold any allocation or pending free?
    pub fn in_use<F>(&mut self, fence: &F) -> bool
    where
        F: FenceSync + ?Sized,
    {
        self.free_unused(fence);
        self.blocks.len() != 1 || self.blocks[0].state != BlockState::Free
    }

    /// Bytes in `InUse` blocks. Pending frees do not count.
    pub fn bytes_in_use(&self) -> u32 {
        self.bytes_in_use
    }

    /// Managed size in bytes.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// The block list, in address order.
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Verify the block list invariants.
    ///
    /// Returns a description of the first violation.
    pub fn check_consistency(&self) -> Result<(), String> {
        let mut expected_offset = 0u32;
        let mut in_use = 0u32;
        let mut previous: Option<BlockState> = None;
        for block in &self.blocks {
            if block.offset != expected_offset {
                return Err(format!(
                    "block at {} does not start where the previous one ended ({})",
                    block.offset, expected_offset
                ));
            }
            if block.size == 0 {
                return Err(format!("zero-sized block at {}", block.offset));
            }
            if block.state == BlockState::Free && previous == Some(BlockState::Free) {
                return Err(format!("adjacent free blocks at {}", block.offset));
            }
            if block.state == BlockState::InUse {
                in_use += block.size;
            }
            expected_offset += block.size;
            previous = Some(block.state);
        }
        if expected_offset != self.size {
            return Err(format!(
                "blocks cover {} bytes of {}",
                expected_offset, self.size
            ));
        }
        if in_use != self.bytes_in_use {
            return Err(format!(
                "bytes in use is {} but blocks hold {}",
                self.bytes_in_use, in_use
            ));
        }
        Ok(())
    }

    fn alloc_in_block(&mut self, index: usize, size: u32) -> u32 {
        let block = &mut self.blocks[index];
        debug_assert_eq!(block.state, BlockState::Free);
        debug_assert!(block.size >= size);

        let offset = block.offset;
        self.bytes_in_use += size;
        block.state = BlockState::InUse;
        if block.size == size {
            return offset;
        }

        let remainder = Block {
            state: BlockState::Free,
            offset: offset + size,
            size: block.size - size,
            token: Token::NONE,
        };
        block.size = size;
        self.blocks.insert(index + 1, remainder);
        offset
    }

    /// Merge the free block at `index` with free neighbours.
    /// Returns the index of the merged block.
    fn collapse_free_block(&mut self, mut index: usize) -> usize {
        if index + 1 < self.blocks.len() && self.blocks[index + 1].state == BlockState::Free {
            let next = self.blocks.remove(index + 1);
            self.blocks[index].size += next.size;
        }
        if index > 0 && self.blocks[index - 1].state == BlockState::Free {
            let current = self.blocks.remove(index);
            index -= 1;
            self.blocks[index].size += current.size;
        }
        index
    }

    fn wait_for_token_and_free_block<F>(&mut self, index: usize, fence: &F) -> usize
    where
        F: FenceSync + ?Sized,
    {
        let block = &mut self.blocks[index];
        debug_assert_eq!(block.state, BlockState::FreePendingToken);
        fence.wait_for_token(block.token);
        block.state = BlockState::Free;
        block.token = Token::NONE;
        self.collapse_free_block(index)
    }

    fn block_index(&self, offset: u32) -> usize {
        match self
            .blocks
            .binary_search_by_key(&offset, |block| block.offset)
        {
            Ok(index) => index,
            Err(_) => panic!("no allocation starts at offset {offset}"),
        }
    }
}
