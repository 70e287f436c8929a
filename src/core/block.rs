//! Block abstractions for the paged KV cache.
//!
//! The cache is divided into fixed-size blocks, similar to how operating
//! systems manage virtual memory with pages. Blocks are the unit of
//! allocation in the [`BlockStore`](super::block_store::BlockStore) and
//! are reference counted so identical prefixes can be shared across
//! sequences (copy-on-write).

use crate::core::sequence::SequenceId;

/// Default block size (tokens per block).
pub const DEFAULT_BLOCK_SIZE: usize = 16;

/// Identifier of a physical block in the global pool.
pub type BlockId = usize;

/// A fixed-size page of KV cache memory.
///
/// The full pool of blocks is created once at startup, sized by the
/// capacity profiler; blocks are never resized. A reference count of 1
/// means the owning sequence has exclusive write access; counts above 1
/// mean the block is shared read-only and must be copied before a write.
#[derive(Debug, Clone)]
pub struct Block {
    /// Index of this block in the pool.
    block_id: BlockId,
    /// Sequence currently holding the primary claim, if any.
    owner: Option<SequenceId>,
    /// Number of sequences reading this block.
    ref_count: usize,
}

impl Block {
    /// Create an unowned block with a zero reference count.
    pub fn new(block_id: BlockId) -> Self {
        Self {
            block_id,
            owner: None,
            ref_count: 0,
        }
    }

    /// Get the block ID.
    pub fn block_id(&self) -> BlockId {
        self.block_id
    }

    /// Get the owning sequence, if any.
    pub fn owner(&self) -> Option<SequenceId> {
        self.owner
    }

    /// Get the current reference count.
    pub fn ref_count(&self) -> usize {
        self.ref_count
    }

    /// Whether more than one sequence is reading this block.
    pub fn is_shared(&self) -> bool {
        self.ref_count > 1
    }

    /// Whether the block is free (no readers).
    pub fn is_free(&self) -> bool {
        self.ref_count == 0
    }

    pub(crate) fn assign(&mut self, owner: SequenceId) {
        debug_assert!(self.is_free(), "assigning a non-free block");
        self.owner = Some(owner);
        self.ref_count = 1;
    }

    pub(crate) fn set_owner(&mut self, owner: Option<SequenceId>) {
        self.owner = owner;
    }

    /// Increment the reference count (sharing with another sequence).
    pub(crate) fn increment_ref(&mut self) {
        self.ref_count += 1;
    }

    /// Decrement the reference count and return the new value.
    ///
    /// # Panics
    ///
    /// Panics on refcount underflow; a double free is a programming bug
    /// and must abort loudly rather than attempt recovery.
    pub(crate) fn decrement_ref(&mut self) -> usize {
        assert!(
            self.ref_count > 0,
            "refcount underflow on block {}",
            self.block_id
        );
        self.ref_count -= 1;
        if self.ref_count == 0 {
            self.owner = None;
        }
        self.ref_count
    }
}

/// Maps a sequence's logical token positions to physical block IDs.
///
/// Token at position `p` lives in logical block `p / block_size`, slot
/// `p % block_size`, physical block `block_ids[p / block_size]`. The
/// table is append-only while the sequence runs; it is cleared only when
/// the sequence finishes, aborts, or is preempted.
///
/// # Example
///
/// ```
/// use vellum::core::block::BlockTable;
///
/// let mut table = BlockTable::new(16);
/// table.append_block(5); // tokens 0-15
/// table.append_block(12); // tokens 16-31
///
/// assert_eq!(table.get(1), Some(12));
/// assert_eq!(table.slot_for(20), Some(12 * 16 + 4));
/// ```
#[derive(Debug, Clone, Default)]
pub struct BlockTable {
    /// Physical block IDs in logical order.
    block_ids: Vec<BlockId>,
    /// Number of tokens per block.
    block_size: usize,
}

impl BlockTable {
    /// Create a new empty block table.
    pub fn new(block_size: usize) -> Self {
        Self {
            block_ids: Vec::new(),
            block_size,
        }
    }

    /// Get the block size.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Get the physical block ID for a logical block index.
    pub fn get(&self, logical_block_idx: usize) -> Option<BlockId> {
        self.block_ids.get(logical_block_idx).copied()
    }

    /// Get the last (trailing) physical block ID.
    pub fn last(&self) -> Option<BlockId> {
        self.block_ids.last().copied()
    }

    /// Add a new physical block to the table.
    pub fn append_block(&mut self, block_id: BlockId) {
        self.block_ids.push(block_id);
    }

    /// Replace the trailing block ID after a copy-on-write.
    pub(crate) fn replace_last(&mut self, block_id: BlockId) {
        let last = self
            .block_ids
            .last_mut()
            .expect("copy-on-write on an empty block table");
        *last = block_id;
    }

    /// Number of blocks allocated to this sequence.
    pub fn num_blocks(&self) -> usize {
        self.block_ids.len()
    }

    /// Check if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.block_ids.is_empty()
    }

    /// All physical block IDs in logical order.
    pub fn block_ids(&self) -> &[BlockId] {
        &self.block_ids
    }

    /// Global slot index for a token position, if the backing block is
    /// allocated.
    ///
    /// Global slot = `block_id * block_size + slot_within_block`.
    pub fn slot_for(&self, position: usize) -> Option<usize> {
        let logical = position / self.block_size;
        self.block_ids
            .get(logical)
            .map(|&physical| physical * self.block_size + position % self.block_size)
    }

    /// Global slot indices for positions `start..end`.
    ///
    /// Used by the execution layer to write KV entries into the cache.
    pub fn slot_mapping(&self, start: usize, end: usize) -> Vec<usize> {
        (start..end).filter_map(|pos| self.slot_for(pos)).collect()
    }

    /// Clear all blocks from the table.
    pub(crate) fn clear(&mut self) {
        self.block_ids.clear();
    }
}

/// Number of blocks needed to hold a sequence of `seq_len` tokens.
///
/// # Example
///
/// ```
/// use vellum::core::block::blocks_needed;
///
/// assert_eq!(blocks_needed(35, 16), 3);
/// assert_eq!(blocks_needed(32, 16), 2);
/// assert_eq!(blocks_needed(0, 16), 0);
/// ```
pub fn blocks_needed(seq_len: usize, block_size: usize) -> usize {
    seq_len.div_ceil(block_size)
}
