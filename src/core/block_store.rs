//! Block store: the fixed pool of KV cache pages.
//!
//! The store is an arena of blocks addressed by integer IDs with an
//! explicit free list, so shared ownership (prefix sharing, copy-on-write)
//! is expressed through reference counts instead of pointer graphs.
//!
//! It is a single-writer structure: only the scheduler mutates allocation
//! state between steps. Worker ranks read block assignments and write
//! cache contents into already-allocated blocks; they never allocate,
//! resize, or free a block themselves.
//!
//! The one-shot capacity profiler that sizes the pool before serving
//! lives here as well ([`profile_cache_config`]).

use std::collections::VecDeque;

use tracing::debug;

use crate::config::{CacheConfig, EngineConfig};
use crate::core::block::{Block, BlockId, BlockTable};
use crate::core::sequence::SequenceId;
use crate::error::{Error, Result};
use crate::executor::MemoryProfile;

/// Manages the fixed pool of KV cache blocks.
///
/// Invariants enforced here:
/// - the sum of blocks held by sequences never exceeds the pool size;
/// - an exclusive-write block has reference count exactly 1;
/// - a refcount underflow or a corrupt free list panics.
#[derive(Debug)]
pub struct BlockStore {
    /// Arena of all blocks, indexed by block ID.
    blocks: Vec<Block>,
    /// Free block IDs (LIFO for cache locality).
    free_list: VecDeque<BlockId>,
    /// Blocks kept free to absorb fragmentation. Admission respects the
    /// watermark; decode growth of already-running sequences may dip
    /// into it.
    watermark_blocks: usize,
    /// Number of tokens per block.
    block_size: usize,
}

impl BlockStore {
    /// Create a store managing `num_blocks` blocks.
    pub fn new(num_blocks: usize, block_size: usize, watermark: f32) -> Self {
        let blocks = (0..num_blocks).map(Block::new).collect();
        let free_list: VecDeque<BlockId> = (0..num_blocks).collect();
        let watermark_blocks =
            (((num_blocks as f32) * watermark).ceil() as usize).min(num_blocks);

        Self {
            blocks,
            free_list,
            watermark_blocks,
            block_size,
        }
    }

    /// Create a store sized by a profiled [`CacheConfig`].
    pub fn from_cache_config(cache_config: &CacheConfig, watermark: f32) -> Self {
        Self::new(
            cache_config.num_gpu_blocks(),
            cache_config.block_size(),
            watermark,
        )
    }

    /// Get the block size.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Total number of blocks in the pool.
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Number of free blocks.
    pub fn num_free_blocks(&self) -> usize {
        self.free_list.len()
    }

    /// Number of blocks currently held by sequences.
    pub fn num_used_blocks(&self) -> usize {
        self.blocks.len() - self.free_list.len()
    }

    /// Number of blocks reserved as the fragmentation watermark.
    pub fn watermark_blocks(&self) -> usize {
        self.watermark_blocks
    }

    /// Whether `count` blocks can be granted without dipping below the
    /// watermark. Used for admitting new sequences.
    pub fn can_admit(&self, count: usize) -> bool {
        self.free_list.len() >= count + self.watermark_blocks
    }

    /// Whether `count` blocks can be granted at all (watermark ignored).
    /// Used for growing sequences that are already running.
    pub fn can_allocate(&self, count: usize) -> bool {
        self.free_list.len() >= count
    }

    /// Allocate `count` fresh blocks for a sequence.
    ///
    /// All-or-nothing: either every requested block is granted or the
    /// call fails and the caller must preempt or queue. Allocation never
    /// silently truncates.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] when the free pool cannot satisfy
    /// the request.
    pub fn allocate(&mut self, seq_id: SequenceId, count: usize) -> Result<Vec<BlockId>> {
        if !self.can_allocate(count) {
            return Err(Error::OutOfMemory {
                requested: count,
                free: self.free_list.len(),
            });
        }

        let mut granted = Vec::with_capacity(count);
        for _ in 0..count {
            let block_id = self
                .free_list
                .pop_front()
                .expect("free list drained despite capacity check");
            let block = &mut self.blocks[block_id];
            assert!(
                block.is_free(),
                "corrupt free list: block {block_id} has ref_count {}",
                block.ref_count()
            );
            block.assign(seq_id);
            granted.push(block_id);
        }
        Ok(granted)
    }

    /// Release every block referenced by a sequence's table.
    ///
    /// Shared reference counts are decremented; blocks whose count
    /// reaches zero return to the free pool. The table is cleared.
    pub fn free_sequence(&mut self, table: &mut BlockTable) {
        for &block_id in table.block_ids() {
            self.release_block(block_id);
        }
        table.clear();
    }

    /// Increment reference counts on every block of a sequence's table,
    /// sharing its prefix with a forked sequence without copying data.
    pub fn fork(&mut self, table: &BlockTable) {
        for &block_id in table.block_ids() {
            self.blocks[block_id].increment_ref();
        }
    }

    /// Prepare the trailing block of `table` for a write by `seq_id`.
    ///
    /// If the block is shared, a fresh block is allocated, the shared
    /// one is released, the table is patched, and `Some((src, dst))` is
    /// returned so the execution layer can copy the cached contents
    /// before the write. An exclusively held block is only re-owned.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if no free block is available for
    /// the copy.
    pub fn copy_on_write(
        &mut self,
        seq_id: SequenceId,
        table: &mut BlockTable,
    ) -> Result<Option<(BlockId, BlockId)>> {
        let src = table
            .last()
            .expect("copy-on-write on a sequence with no blocks");

        if !self.blocks[src].is_shared() {
            self.blocks[src].set_owner(Some(seq_id));
            return Ok(None);
        }

        let dst = self.allocate(seq_id, 1)?[0];
        self.blocks[src].decrement_ref();
        table.replace_last(dst);
        debug!(src, dst, seq_id, "copy-on-write on shared block");
        Ok(Some((src, dst)))
    }

    /// Reset the store to its initial state.
    pub fn reset(&mut self) {
        let num_blocks = self.blocks.len();
        self.blocks = (0..num_blocks).map(Block::new).collect();
        self.free_list.clear();
        self.free_list.extend(0..num_blocks);
    }

    /// Look up a block.
    pub fn get_block(&self, block_id: BlockId) -> Option<&Block> {
        self.blocks.get(block_id)
    }

    fn release_block(&mut self, block_id: BlockId) {
        let block = &mut self.blocks[block_id];
        if block.decrement_ref() == 0 {
            self.free_list.push_back(block_id);
        }
    }
}

/// One-shot capacity profiler.
///
/// Derives the immutable [`CacheConfig`] from the memory measurements of
/// a maximum-size warmup forward pass. When LoRA is enabled, memory for
/// `max_loras` resident adapters is reserved before the pool is sized,
/// so the resulting block count is strictly smaller than without LoRA
/// for the same measurements.
///
/// # Errors
///
/// Returns [`Error::Config`] if the measurements leave no room for even
/// a single block.
pub fn profile_cache_config(
    profile: &MemoryProfile,
    config: &EngineConfig,
) -> Result<CacheConfig> {
    if profile.kv_block_bytes == 0 {
        return Err(Error::Config("profiled kv_block_bytes is zero".into()));
    }

    let usable = (profile.free_gpu_bytes as f64 * config.gpu_memory_utilization as f64) as u64;
    let adapter_reservation = if config.enable_lora {
        config.max_loras as u64 * profile.per_adapter_bytes
    } else {
        0
    };

    let pool_bytes = usable.saturating_sub(adapter_reservation);
    let num_gpu_blocks = (pool_bytes / profile.kv_block_bytes) as usize;

    if num_gpu_blocks == 0 {
        return Err(Error::Config(format!(
            "model leaves no GPU memory for the KV cache \
             (usable {usable} bytes, adapter reservation {adapter_reservation} bytes)"
        )));
    }

    debug!(
        num_gpu_blocks,
        adapter_reservation,
        block_size = config.block_size,
        "capacity profile complete"
    );
    Ok(CacheConfig::new(num_gpu_blocks, config.block_size))
}
