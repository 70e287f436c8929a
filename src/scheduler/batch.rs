//! Continuous-batching scheduler.
//!
//! Invoked once per generation step, the scheduler forms an immutable
//! [`BatchPlan`] from the pool of in-flight sequences under three
//! budgets: the block budget (pool size minus a reserved watermark),
//! `max_num_seqs` concurrent sequences, and the resident adapter-slot
//! budget. Waiting sequences are admitted in strict first-come
//! first-served order; under block pressure the scheduler preempts the
//! least-recently-scheduled running sequence that is younger than the
//! starved waiting head, so a sequence is only ever displaced by its
//! elders and starvation stays bounded.
//!
//! ```text
//!   add_sequence()                              schedule()
//!        |                                          |
//!        v                                          v
//!   +---------+        admission (FCFS)       +-----------+
//!   | Waiting | ----------------------------> |  Running  |
//!   |  queue  | <---------------------------- |    set    |
//!   +---------+      preemption (blocks       +-----------+
//!                     freed, history kept)
//! ```

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};

use tracing::{debug, warn};

use crate::config::{SamplingParams, SchedulerConfig};
use crate::core::block::{blocks_needed, BlockId};
use crate::core::block_store::BlockStore;
use crate::core::sequence::{FinishReason, Sequence, SequenceId, SequenceStatus};
use crate::error::{Error, Result};
use crate::executor::WeightLoader;
use crate::lora::AdapterSlotManager;

/// One sequence's slice of a batch plan.
///
/// Carries everything a tensor-parallel rank needs to execute the step
/// for this sequence: the exact input token IDs, the block layout, and
/// the sampling parameters. Every rank observes an identical copy.
#[derive(Debug, Clone)]
pub struct ScheduledSequence {
    /// The sequence to run.
    pub seq_id: SequenceId,
    /// Token IDs to feed this step (full history for prefill, the last
    /// generated token for decode).
    pub input_token_ids: Vec<u32>,
    /// Position of the first input token.
    pub position_offset: usize,
    /// Physical block IDs backing the sequence, in logical order.
    pub block_ids: Vec<BlockId>,
    /// Global cache slots the step's KV entries are written to.
    pub slot_mapping: Vec<usize>,
    /// Caller-facing adapter alias, if an adapter is bound.
    pub adapter_id: Option<u32>,
    /// Weights handle of the resident adapter, if bound.
    pub adapter_handle: Option<u64>,
    /// Sampling parameters for this sequence.
    pub sampling: SamplingParams,
}

impl ScheduledSequence {
    fn hash_into(&self, hasher: &mut DefaultHasher) {
        self.seq_id.hash(hasher);
        self.input_token_ids.hash(hasher);
        self.position_offset.hash(hasher);
        self.block_ids.hash(hasher);
        self.slot_mapping.hash(hasher);
        self.adapter_id.hash(hasher);
        self.adapter_handle.hash(hasher);
        self.sampling.temperature.to_bits().hash(hasher);
        self.sampling.top_k.hash(hasher);
        self.sampling.top_p.to_bits().hash(hasher);
        self.sampling.max_tokens.hash(hasher);
        self.sampling.stop.hash(hasher);
        self.sampling.n.hash(hasher);
        self.sampling.seed.hash(hasher);
    }
}

/// The set of sequences selected to execute one generation step.
///
/// Immutable once returned by [`Scheduler::schedule`]; the coordinator
/// broadcasts it verbatim to every rank.
#[derive(Debug, Clone, Default)]
pub struct BatchPlan {
    /// Monotonic step counter.
    pub step_id: u64,
    /// Sequences running their prompt (first-token) pass.
    pub prefill: Vec<ScheduledSequence>,
    /// Sequences generating their next token.
    pub decode: Vec<ScheduledSequence>,
    /// Copy-on-write block copies the execution layer must perform
    /// before writing: `(src, dst)` pairs.
    pub blocks_to_copy: Vec<(BlockId, BlockId)>,
    /// Sequences preempted while forming this plan.
    pub preempted: Vec<SequenceId>,
    /// Total prefill tokens this step.
    pub num_prefill_tokens: usize,
    /// Total decode tokens this step.
    pub num_decode_tokens: usize,
}

impl BatchPlan {
    /// Check whether the plan schedules any work.
    pub fn is_empty(&self) -> bool {
        self.prefill.is_empty() && self.decode.is_empty()
    }

    /// Number of sequences scheduled.
    pub fn num_sequences(&self) -> usize {
        self.prefill.len() + self.decode.len()
    }

    /// All scheduled entries, prefill group first.
    pub fn scheduled(&self) -> impl Iterator<Item = &ScheduledSequence> {
        self.prefill.iter().chain(self.decode.iter())
    }

    /// Deterministic digest over every field a rank acts on. Ranks
    /// echo this back so the coordinator can detect divergence.
    pub fn digest(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.step_id.hash(&mut hasher);
        for entry in self.scheduled() {
            entry.hash_into(&mut hasher);
        }
        self.blocks_to_copy.hash(&mut hasher);
        self.preempted.hash(&mut hasher);
        hasher.finish()
    }
}

/// Continuous-batching scheduler and sequence registry.
///
/// Owns the [`BlockStore`]; all allocation state is mutated here and
/// nowhere else between steps.
pub struct Scheduler {
    /// Configuration.
    config: SchedulerConfig,
    /// The block pool.
    block_store: BlockStore,
    /// All known sequences, including terminal ones awaiting collection.
    sequences: HashMap<SequenceId, Sequence>,
    /// Waiting queue ordered by arrival (preempted sequences re-enter
    /// at their original position).
    waiting: VecDeque<SequenceId>,
    /// Running sequence IDs.
    running: Vec<SequenceId>,
    /// Stamp source for arrival ordering.
    arrival_counter: u64,
    /// Monotonic step counter.
    step_counter: u64,
    /// Consecutive steps with an empty plan while requests waited.
    idle_steps: u32,
}

impl Scheduler {
    /// Create a new scheduler over a block pool.
    pub fn new(config: SchedulerConfig, block_store: BlockStore) -> Self {
        Self {
            config,
            block_store,
            sequences: HashMap::new(),
            waiting: VecDeque::new(),
            running: Vec::new(),
            arrival_counter: 0,
            step_counter: 0,
            idle_steps: 0,
        }
    }

    /// Add a new sequence to the waiting queue.
    pub fn add_sequence(&mut self, mut seq: Sequence) {
        seq.set_arrival(self.arrival_counter);
        self.arrival_counter += 1;

        let seq_id = seq.seq_id();
        self.waiting.push_back(seq_id);
        self.sequences.insert(seq_id, seq);
    }

    /// Fork a running sequence for parallel sampling.
    ///
    /// The child shares the parent's blocks (reference counts bumped,
    /// no data copied) and enters the running set directly.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SequenceNotFound`] for an unknown parent and
    /// [`Error::InvalidStateTransition`] if the parent is not running.
    pub fn fork_sequence(
        &mut self,
        parent_id: SequenceId,
        child_id: SequenceId,
        adapters: &mut AdapterSlotManager,
        loader: &dyn WeightLoader,
    ) -> Result<()> {
        let parent = self
            .sequences
            .get(&parent_id)
            .ok_or(Error::SequenceNotFound(parent_id))?;
        if parent.status() != SequenceStatus::Running {
            return Err(Error::InvalidStateTransition {
                from: parent.status().as_str(),
                to: "Running",
            });
        }

        let mut child = parent.fork(child_id);
        child.set_arrival(self.arrival_counter);
        self.arrival_counter += 1;

        self.block_store.fork(child.block_table());
        if let Some(lora) = child.lora().cloned() {
            // The parent holds a reference, so the slot is resident and
            // the acquire cannot be deferred.
            let acquired = adapters.try_acquire(&lora, loader)?;
            debug_assert!(acquired.is_some(), "fork of a non-resident adapter");
            child.holds_adapter_ref = true;
        }

        self.running.push(child_id);
        self.sequences.insert(child_id, child);
        Ok(())
    }

    /// Form the batch plan for the next generation step.
    ///
    /// Never fails due to memory pressure: an empty plan means the step
    /// is skipped. Sequences that can never fit, or that starve past
    /// the idle-step budget, are failed with [`FinishReason::OutOfCapacity`]
    /// and surfaced through their terminal status.
    pub fn schedule(
        &mut self,
        adapters: &mut AdapterSlotManager,
        loader: &dyn WeightLoader,
    ) -> BatchPlan {
        self.step_counter += 1;
        let mut plan = BatchPlan {
            step_id: self.step_counter,
            ..Default::default()
        };

        self.admit_waiting(&mut plan, adapters, loader);
        self.schedule_decode(&mut plan, adapters);

        if plan.is_empty() && !self.waiting.is_empty() {
            self.idle_steps += 1;
            if self.idle_steps >= self.config.max_idle_steps {
                self.fail_starved_head();
                self.idle_steps = 0;
            }
        } else {
            self.idle_steps = 0;
        }

        plan
    }

    /// Admit waiting sequences in FCFS order, preempting younger
    /// running sequences when block pressure demands it.
    fn admit_waiting(
        &mut self,
        plan: &mut BatchPlan,
        adapters: &mut AdapterSlotManager,
        loader: &dyn WeightLoader,
    ) {
        let block_size = self.block_store.block_size();

        'admission: while self.running.len() < self.config.max_num_seqs {
            let candidate_id = match self.waiting.front().copied() {
                Some(id) => id,
                None => break,
            };

            // Drop entries that were aborted while queued.
            let candidate = match self.sequences.get(&candidate_id) {
                Some(seq) if seq.status() == SequenceStatus::Waiting
                    || seq.status() == SequenceStatus::Preempted =>
                {
                    seq
                }
                _ => {
                    self.waiting.pop_front();
                    continue;
                }
            };

            let prefill_len = candidate.total_len();
            if plan.num_prefill_tokens + prefill_len > self.config.max_prefill_tokens
                && !plan.prefill.is_empty()
            {
                break;
            }

            let needed = blocks_needed(prefill_len, block_size);
            let hard_capacity = self
                .block_store
                .num_blocks()
                .saturating_sub(self.block_store.watermark_blocks());
            if needed > hard_capacity {
                // No amount of preemption will ever make room.
                self.waiting.pop_front();
                let total = self.block_store.num_blocks();
                warn!(
                    seq_id = candidate_id,
                    needed, total, "request can never fit in the cache"
                );
                if let Some(seq) = self.sequences.get_mut(&candidate_id) {
                    seq.set_aborted(FinishReason::OutOfCapacity);
                }
                continue;
            }

            let candidate_arrival = candidate.arrival();
            while !self.block_store.can_admit(needed) {
                match self.pick_victim(Some(candidate_arrival), plan.step_id) {
                    Some(victim) => self.preempt(victim, plan, adapters),
                    None => break 'admission,
                }
            }

            // Adapter slot: resident, free, or evictable - otherwise the
            // head defers and admission stops (strict FCFS).
            let lora = self
                .sequences
                .get(&candidate_id)
                .and_then(|s| s.lora().cloned());
            let mut adapter_handle = None;
            let mut acquired_ref = false;
            if let Some(lora) = &lora {
                match adapters.try_acquire(lora, loader) {
                    Ok(Some(weights)) => {
                        adapter_handle = Some(weights.id);
                        acquired_ref = true;
                    }
                    Ok(None) => break 'admission,
                    Err(err) => {
                        // Submission-time validation makes this a bug or
                        // a racing filesystem; fail just this request.
                        warn!(seq_id = candidate_id, %err, "adapter load failed at admission");
                        self.waiting.pop_front();
                        if let Some(seq) = self.sequences.get_mut(&candidate_id) {
                            seq.set_aborted(FinishReason::Aborted);
                        }
                        continue;
                    }
                }
            }

            let granted = self
                .block_store
                .allocate(candidate_id, needed)
                .expect("admission capacity was checked");

            let seq = self
                .sequences
                .get_mut(&candidate_id)
                .expect("candidate vanished during admission");
            for block_id in granted {
                seq.block_table_mut().append_block(block_id);
            }
            seq.set_running().expect("waiting sequence must admit");
            seq.holds_adapter_ref = acquired_ref;
            seq.set_last_scheduled_step(plan.step_id);
            seq.advance_computed(prefill_len);

            plan.prefill.push(ScheduledSequence {
                seq_id: candidate_id,
                input_token_ids: seq.all_token_ids(),
                position_offset: 0,
                block_ids: seq.block_table().block_ids().to_vec(),
                slot_mapping: seq.block_table().slot_mapping(0, prefill_len),
                adapter_id: seq.adapter_id(),
                adapter_handle,
                sampling: seq.sampling().clone(),
            });
            plan.num_prefill_tokens += prefill_len;

            self.waiting.pop_front();
            self.running.push(candidate_id);
            debug!(seq_id = candidate_id, blocks = needed, "admitted sequence");
        }
    }

    /// Schedule a decode token for every running sequence not admitted
    /// this step, growing block tables as sequences cross block
    /// boundaries and copying shared tails before writes.
    fn schedule_decode(&mut self, plan: &mut BatchPlan, adapters: &mut AdapterSlotManager) {
        let block_size = self.block_store.block_size();

        // Oldest first, so preemption victims come from the unprocessed
        // (younger) tail and never from sequences already in the plan.
        let mut order: Vec<SequenceId> = self.running.clone();
        order.sort_by_key(|id| self.sequences[id].arrival());

        'decode: for seq_id in order {
            let seq = match self.sequences.get(&seq_id) {
                Some(seq) => seq,
                None => continue,
            };
            if seq.status() != SequenceStatus::Running
                || seq.last_scheduled_step() == plan.step_id
            {
                continue;
            }

            let position = seq.num_computed_tokens();
            let required = blocks_needed(position + 1, block_size);

            // Grow the table across a block boundary. Growth may dip
            // into the watermark; only genuine exhaustion preempts.
            while self.sequences[&seq_id].block_table().num_blocks() < required {
                match self.block_store.allocate(seq_id, 1) {
                    Ok(granted) => {
                        let seq = self.sequences.get_mut(&seq_id).expect("running sequence");
                        seq.block_table_mut().append_block(granted[0]);
                    }
                    Err(Error::OutOfMemory { .. }) => {
                        match self.pick_victim(None, plan.step_id) {
                            Some(victim) if victim != seq_id => {
                                self.preempt(victim, plan, adapters);
                            }
                            _ => {
                                // Nothing younger to displace: requeue
                                // this sequence itself.
                                self.preempt(seq_id, plan, adapters);
                                continue 'decode;
                            }
                        }
                    }
                    Err(err) => unreachable!("allocate returned {err}"),
                }
            }

            // Writing into a partially filled shared tail copies first.
            if position % block_size != 0 {
                loop {
                    let (store, sequences) = (&mut self.block_store, &mut self.sequences);
                    let table = sequences
                        .get_mut(&seq_id)
                        .expect("running sequence")
                        .block_table_mut();
                    match store.copy_on_write(seq_id, table) {
                        Ok(Some(copy)) => {
                            plan.blocks_to_copy.push(copy);
                            break;
                        }
                        Ok(None) => break,
                        Err(Error::OutOfMemory { .. }) => {
                            match self.pick_victim(None, plan.step_id) {
                                Some(victim) if victim != seq_id => {
                                    self.preempt(victim, plan, adapters);
                                }
                                _ => {
                                    self.preempt(seq_id, plan, adapters);
                                    continue 'decode;
                                }
                            }
                        }
                        Err(err) => unreachable!("copy_on_write returned {err}"),
                    }
                }
            }

            let seq = self.sequences.get_mut(&seq_id).expect("running sequence");
            let input = seq
                .last_token_id()
                .expect("running sequence has at least a prompt token");
            seq.set_last_scheduled_step(plan.step_id);
            seq.advance_computed(1);

            let adapter_handle = seq
                .lora()
                .and_then(|l| adapters.resident_handle(&l.path))
                .map(|w| w.id);
            plan.decode.push(ScheduledSequence {
                seq_id,
                input_token_ids: vec![input],
                position_offset: position,
                block_ids: seq.block_table().block_ids().to_vec(),
                slot_mapping: seq.block_table().slot_mapping(position, position + 1),
                adapter_id: seq.adapter_id(),
                adapter_handle,
                sampling: seq.sampling().clone(),
            });
            plan.num_decode_tokens += 1;
        }
    }

    /// Pick the preemption victim: the least-recently-scheduled running
    /// sequence, youngest arrival on ties, excluding sequences already
    /// in this step's plan. With `younger_than` set, only sequences
    /// that arrived after the given stamp qualify, so a waiting
    /// sequence is never displaced by a younger one.
    fn pick_victim(&self, younger_than: Option<u64>, step_id: u64) -> Option<SequenceId> {
        self.running
            .iter()
            .copied()
            .filter_map(|id| self.sequences.get(&id).map(|seq| (id, seq)))
            .filter(|(_, seq)| seq.status() == SequenceStatus::Running)
            .filter(|(_, seq)| seq.last_scheduled_step() != step_id)
            .filter(|(_, seq)| younger_than.map_or(true, |stamp| seq.arrival() > stamp))
            .min_by_key(|(_, seq)| (seq.last_scheduled_step(), u64::MAX - seq.arrival()))
            .map(|(id, _)| id)
    }

    /// Preempt a running sequence: free its blocks, drop its adapter
    /// reference, and requeue it at its arrival position with its
    /// generated history intact.
    fn preempt(
        &mut self,
        victim_id: SequenceId,
        plan: &mut BatchPlan,
        adapters: &mut AdapterSlotManager,
    ) {
        let (store, sequences) = (&mut self.block_store, &mut self.sequences);
        let victim = sequences.get_mut(&victim_id).expect("victim must exist");

        store.free_sequence(victim.block_table_mut());
        if victim.holds_adapter_ref {
            let path = victim
                .lora()
                .map(|l| l.path.clone())
                .expect("adapter ref without a bound adapter");
            adapters.release(&path);
            victim.holds_adapter_ref = false;
        }
        victim
            .set_preempted()
            .expect("only running sequences are preempted");
        let arrival = victim.arrival();

        self.running.retain(|&id| id != victim_id);
        let insert_at = self
            .waiting
            .iter()
            .position(|id| {
                self.sequences
                    .get(id)
                    .map(|seq| seq.arrival() > arrival)
                    .unwrap_or(false)
            })
            .unwrap_or(self.waiting.len());
        self.waiting.insert(insert_at, victim_id);

        plan.preempted.push(victim_id);
        debug!(seq_id = victim_id, "preempted sequence");
    }

    /// Fail the waiting head after sustained lack of progress.
    fn fail_starved_head(&mut self) {
        if let Some(seq_id) = self.waiting.pop_front() {
            let total = self.block_store.num_blocks();
            if let Some(seq) = self.sequences.get_mut(&seq_id) {
                let needed = blocks_needed(seq.total_len(), self.block_store.block_size());
                warn!(
                    seq_id,
                    needed_blocks = needed,
                    total_blocks = total,
                    "no scheduling progress, failing request with capacity error"
                );
                seq.set_aborted(FinishReason::OutOfCapacity);
            }
        }
    }

    /// Mark a sequence finished and synchronously release its resources.
    pub fn finish_sequence(
        &mut self,
        seq_id: SequenceId,
        reason: FinishReason,
        adapters: &mut AdapterSlotManager,
    ) {
        self.release_terminal(seq_id, adapters, |seq| seq.set_finished(reason));
    }

    /// Abort a sequence; its blocks and adapter reference are released
    /// immediately, visible to the very next scheduling step.
    pub fn abort_sequence(&mut self, seq_id: SequenceId, adapters: &mut AdapterSlotManager) {
        self.release_terminal(seq_id, adapters, |seq| {
            seq.set_aborted(FinishReason::Aborted)
        });
    }

    fn release_terminal<F>(
        &mut self,
        seq_id: SequenceId,
        adapters: &mut AdapterSlotManager,
        mark: F,
    ) where
        F: FnOnce(&mut Sequence),
    {
        let (store, sequences) = (&mut self.block_store, &mut self.sequences);
        let seq = match sequences.get_mut(&seq_id) {
            Some(seq) if !seq.status().is_terminal() => seq,
            _ => return,
        };

        store.free_sequence(seq.block_table_mut());
        if seq.holds_adapter_ref {
            let path = seq
                .lora()
                .map(|l| l.path.clone())
                .expect("adapter ref without a bound adapter");
            adapters.release(&path);
            seq.holds_adapter_ref = false;
        }
        mark(seq);

        self.running.retain(|&id| id != seq_id);
        self.waiting.retain(|&id| id != seq_id);
    }

    /// Append a generated token to a sequence.
    pub fn append_token(&mut self, seq_id: SequenceId, token_id: u32) -> Result<()> {
        let seq = self
            .sequences
            .get_mut(&seq_id)
            .ok_or(Error::SequenceNotFound(seq_id))?;
        seq.append_token(token_id);
        Ok(())
    }

    /// Get a reference to a sequence.
    pub fn get_sequence(&self, seq_id: SequenceId) -> Option<&Sequence> {
        self.sequences.get(&seq_id)
    }

    /// Remove a terminal sequence from the registry, returning it.
    pub fn remove_sequence(&mut self, seq_id: SequenceId) -> Option<Sequence> {
        let seq = self.sequences.remove(&seq_id)?;
        debug_assert!(seq.block_table().is_empty(), "removing a sequence with blocks");
        self.running.retain(|&id| id != seq_id);
        self.waiting.retain(|&id| id != seq_id);
        Some(seq)
    }

    /// Number of waiting sequences.
    pub fn num_waiting(&self) -> usize {
        self.waiting.len()
    }

    /// Number of running sequences.
    pub fn num_running(&self) -> usize {
        self.running.len()
    }

    /// Whether any sequence is still waiting or running.
    pub fn has_unfinished_sequences(&self) -> bool {
        !self.waiting.is_empty() || !self.running.is_empty()
    }

    /// The block pool, for capacity verification.
    pub fn block_store(&self) -> &BlockStore {
        &self.block_store
    }

    /// Current step counter.
    pub fn step_counter(&self) -> u64 {
        self.step_counter
    }
}
