//! Bounded pool of resident LoRA adapters.
//!
//! At most `max_loras` adapters are resident on the GPU at once. Slots
//! are loaded lazily on first use and evicted least-recently-used under
//! capacity pressure; release only drops a usage count so frequently
//! reused adapters stay warm. The base-model weights are a distinct,
//! always-pinned slot outside this accounting.
//!
//! LRU decisions use a deterministic logical clock, never wall time, so
//! eviction order is reproducible.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::executor::{WeightLoader, WeightsHandle};
use crate::lora::request::{AdapterId, LoraRequest};

/// One resident adapter.
#[derive(Debug, Clone)]
struct AdapterSlot {
    path: PathBuf,
    weights: WeightsHandle,
    /// Logical-clock stamp of the most recent acquire or touch.
    last_used: u64,
    /// Sequences currently bound to this adapter and running/admitted.
    active_refs: usize,
}

/// Manages the bounded pool of resident adapter slots.
#[derive(Debug)]
pub struct AdapterSlotManager {
    /// Resident adapters, at most `max_loras`.
    slots: Vec<AdapterSlot>,
    /// Pinned base-model weights, outside the slot budget.
    base: Option<WeightsHandle>,
    /// Caller-facing ID -> path aliases seen so far.
    aliases: HashMap<AdapterId, PathBuf>,
    /// Maximum resident adapters.
    max_loras: usize,
    /// Deterministic LRU clock.
    clock: u64,
}

impl AdapterSlotManager {
    /// Create a manager allowing up to `max_loras` resident adapters.
    pub fn new(max_loras: usize) -> Self {
        Self {
            slots: Vec::with_capacity(max_loras),
            base: None,
            aliases: HashMap::new(),
            max_loras,
            clock: 0,
        }
    }

    /// Pin the base-model weights. Never evicted.
    pub fn pin_base(&mut self, weights: WeightsHandle) {
        self.base = Some(weights);
    }

    /// Get the pinned base-model weights.
    pub fn base(&self) -> Option<WeightsHandle> {
        self.base
    }

    /// Number of resident adapters (base excluded).
    pub fn num_resident(&self) -> usize {
        self.slots.len()
    }

    /// Maximum resident adapters.
    pub fn max_loras(&self) -> usize {
        self.max_loras
    }

    /// Whether an adapter at `path` is resident.
    pub fn is_resident(&self, path: &Path) -> bool {
        self.slots.iter().any(|s| s.path == path)
    }

    /// Get the weights handle of a resident adapter without touching
    /// its usage count or LRU stamp.
    pub fn resident_handle(&self, path: &Path) -> Option<WeightsHandle> {
        self.slots
            .iter()
            .find(|s| s.path == path)
            .map(|s| s.weights)
    }

    /// Resolve a caller-facing ID alias to the path it was bound to.
    pub fn path_for_id(&self, id: AdapterId) -> Option<&Path> {
        self.aliases.get(&id).map(PathBuf::as_path)
    }

    /// Reject requests whose weights do not exist, before scheduling.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AdapterNotFound`] if the probe fails.
    pub fn validate(&self, request: &LoraRequest, loader: &dyn WeightLoader) -> Result<()> {
        if !loader.adapter_exists(&request.path) {
            return Err(Error::AdapterNotFound(
                request.path.display().to_string(),
            ));
        }
        Ok(())
    }

    /// Whether an acquire for `path` could succeed right now: the
    /// adapter is resident, a slot is free, or an idle slot can be
    /// evicted.
    pub fn can_acquire(&self, path: &Path) -> bool {
        self.is_resident(path)
            || self.slots.len() < self.max_loras
            || self.slots.iter().any(|s| s.active_refs == 0)
    }

    /// Acquire a resident slot for the requested adapter.
    ///
    /// Returns `Ok(None)` when every slot is occupied by an in-use
    /// adapter; the caller defers admission rather than failing the
    /// request. Eviction targets the least-recently-used idle slot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AdapterNotFound`] if loading fails.
    pub fn try_acquire(
        &mut self,
        request: &LoraRequest,
        loader: &dyn WeightLoader,
    ) -> Result<Option<WeightsHandle>> {
        self.clock += 1;
        self.aliases.insert(request.id, request.path.clone());

        if let Some(slot) = self.slots.iter_mut().find(|s| s.path == request.path) {
            slot.last_used = self.clock;
            slot.active_refs += 1;
            return Ok(Some(slot.weights));
        }

        if self.slots.len() == self.max_loras && !self.evict_lru() {
            debug!(path = %request.path.display(), "all adapter slots busy, deferring");
            return Ok(None);
        }

        let weights = loader.load_adapter(&request.path)?;
        info!(
            path = %request.path.display(),
            bytes = weights.bytes,
            resident = self.slots.len() + 1,
            "loaded LoRA adapter"
        );
        self.slots.push(AdapterSlot {
            path: request.path.clone(),
            weights,
            last_used: self.clock,
            active_refs: 1,
        });
        Ok(Some(weights))
    }

    /// Drop one usage reference on the adapter at `path`.
    ///
    /// The slot stays resident; eviction is driven by capacity
    /// pressure, not by release, so reused adapters skip the reload.
    ///
    /// # Panics
    ///
    /// Panics if the adapter is not resident or its usage count is
    /// already zero; an unbalanced release is a programming bug.
    pub fn release(&mut self, path: &Path) {
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.path == path)
            .unwrap_or_else(|| panic!("release of non-resident adapter {}", path.display()));
        assert!(
            slot.active_refs > 0,
            "usage count underflow for adapter {}",
            path.display()
        );
        slot.active_refs -= 1;
    }

    /// Evict the globally least-recently-used idle slot.
    ///
    /// Returns `false` when every slot is in active use.
    fn evict_lru(&mut self) -> bool {
        let victim = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.active_refs == 0)
            .min_by_key(|(_, s)| s.last_used)
            .map(|(idx, _)| idx);

        match victim {
            Some(idx) => {
                let slot = self.slots.remove(idx);
                info!(path = %slot.path.display(), "evicted LoRA adapter");
                true
            }
            None => false,
        }
    }
}
