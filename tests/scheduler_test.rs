//! Integration tests for the scheduler over the public API.

use std::path::Path;

use vellum::{
    AdapterSlotManager, BlockStore, Error, Result, SamplingParams, Scheduler, SchedulerConfig,
    Sequence, SequenceStatus, WeightLoader, WeightsHandle,
};

struct NullLoader;

impl WeightLoader for NullLoader {
    fn load_base_model(&self) -> Result<WeightsHandle> {
        Ok(WeightsHandle { id: 0, bytes: 0 })
    }

    fn load_adapter(&self, path: &Path) -> Result<WeightsHandle> {
        Err(Error::AdapterNotFound(path.display().to_string()))
    }

    fn adapter_exists(&self, _path: &Path) -> bool {
        false
    }
}

fn test_scheduler(num_blocks: usize) -> Scheduler {
    let config = SchedulerConfig {
        max_num_seqs: 4,
        max_prefill_tokens: 128,
        max_idle_steps: 32,
    };
    Scheduler::new(config, BlockStore::new(num_blocks, 16, 0.0))
}

fn sequence(seq_id: u64, prompt_len: usize) -> Sequence {
    Sequence::new(
        seq_id,
        (0..prompt_len as u32).collect(),
        SamplingParams::greedy(),
        16,
    )
}

#[test]
fn test_scheduler_creation() {
    let scheduler = test_scheduler(64);
    assert_eq!(scheduler.num_waiting(), 0);
    assert_eq!(scheduler.num_running(), 0);
    assert!(!scheduler.has_unfinished_sequences());
    assert_eq!(scheduler.block_store().num_blocks(), 64);
}

#[test]
fn test_add_and_schedule() {
    let mut scheduler = test_scheduler(64);
    let mut adapters = AdapterSlotManager::new(0);

    scheduler.add_sequence(sequence(1, 20));
    assert_eq!(scheduler.num_waiting(), 1);
    assert!(scheduler.has_unfinished_sequences());

    let plan = scheduler.schedule(&mut adapters, &NullLoader);
    assert_eq!(plan.step_id, 1);
    assert_eq!(plan.prefill.len(), 1);
    assert_eq!(plan.num_prefill_tokens, 20);
    assert_eq!(scheduler.num_running(), 1);
    assert_eq!(scheduler.num_waiting(), 0);

    // A 20-token prompt spans two 16-token blocks.
    assert_eq!(scheduler.block_store().num_used_blocks(), 2);
}

#[test]
fn test_multi_step_generation() {
    let mut scheduler = test_scheduler(64);
    let mut adapters = AdapterSlotManager::new(0);
    scheduler.add_sequence(sequence(1, 14));

    scheduler.schedule(&mut adapters, &NullLoader);
    for step in 0..4 {
        scheduler.append_token(1, 500 + step).unwrap();
        let plan = scheduler.schedule(&mut adapters, &NullLoader);
        assert_eq!(plan.decode.len(), 1);
        assert_eq!(plan.decode[0].input_token_ids, vec![500 + step]);
        assert_eq!(plan.decode[0].position_offset, 14 + step as usize);
    }

    // Positions 14..18 crossed into a second block.
    let seq = scheduler.get_sequence(1).unwrap();
    assert_eq!(seq.block_table().num_blocks(), 2);
    assert_eq!(seq.num_computed_tokens(), 18);
}

#[test]
fn test_finish_releases_blocks() {
    let mut scheduler = test_scheduler(64);
    let mut adapters = AdapterSlotManager::new(0);
    scheduler.add_sequence(sequence(1, 20));
    scheduler.schedule(&mut adapters, &NullLoader);

    scheduler.finish_sequence(
        1,
        vellum::FinishReason::EndOfSequence,
        &mut adapters,
    );
    assert_eq!(scheduler.block_store().num_used_blocks(), 0);
    assert_eq!(
        scheduler.get_sequence(1).unwrap().status(),
        SequenceStatus::Finished
    );
    assert!(!scheduler.has_unfinished_sequences());

    let removed = scheduler.remove_sequence(1).unwrap();
    assert_eq!(removed.seq_id(), 1);
    assert!(scheduler.get_sequence(1).is_none());
}

#[test]
fn test_preemption_and_recovery_cycle() {
    // Two sequences squeezed through a four-block pool.
    let mut scheduler = test_scheduler(4);
    let mut adapters = AdapterSlotManager::new(0);
    scheduler.add_sequence(sequence(1, 32));
    scheduler.add_sequence(sequence(2, 32));
    scheduler.schedule(&mut adapters, &NullLoader);
    assert_eq!(scheduler.num_running(), 2);

    // Both want a third block; the younger one gets recycled.
    scheduler.append_token(1, 900).unwrap();
    scheduler.append_token(2, 901).unwrap();
    let plan = scheduler.schedule(&mut adapters, &NullLoader);
    assert_eq!(plan.preempted, vec![2]);
    assert_eq!(plan.decode.len(), 1);

    // Drain the survivor and re-admit the victim with its history.
    scheduler.finish_sequence(1, vellum::FinishReason::MaxTokens, &mut adapters);
    let plan = scheduler.schedule(&mut adapters, &NullLoader);
    assert_eq!(plan.prefill.len(), 1);
    assert_eq!(plan.prefill[0].seq_id, 2);
    assert_eq!(plan.prefill[0].input_token_ids.len(), 33);

    let seq = scheduler.get_sequence(2).unwrap();
    assert_eq!(seq.preemptions(), 1);
    assert_eq!(seq.status(), SequenceStatus::Running);
}
