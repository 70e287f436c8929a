//! Shared test doubles: a byte-level tokenizer, a slot-accurate mock
//! executor, and an in-memory weight loader.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use vellum::{
    BatchPlan, EngineConfig, Error, LlmEngine, MemoryProfile, ModelExecutor, Result,
    SequenceLogits, Tokenizer, WeightLoader, WeightsHandle,
};

/// Vocabulary: one token per byte, plus EOS.
pub const VOCAB_SIZE: usize = 257;
pub const EOS: u32 = 256;

/// Tokenizer where every byte is its own token.
pub struct ByteTokenizer;

impl Tokenizer for ByteTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text.bytes().map(u32::from).collect())
    }

    fn decode(&self, token_ids: &[u32]) -> Result<String> {
        let bytes: Vec<u8> = token_ids
            .iter()
            .filter(|&&t| t < 256)
            .map(|&t| t as u8)
            .collect();
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn eos_token_id(&self) -> u32 {
        EOS
    }
}

/// Loader with a fixed set of known adapter paths. Handles are assigned
/// by registration order, so equal paths always get equal handles.
pub struct MockLoader {
    paths: Vec<PathBuf>,
}

impl MockLoader {
    pub fn new(paths: &[&str]) -> Self {
        Self {
            paths: paths.iter().map(PathBuf::from).collect(),
        }
    }
}

impl WeightLoader for MockLoader {
    fn load_base_model(&self) -> Result<WeightsHandle> {
        Ok(WeightsHandle {
            id: 1000,
            bytes: 1 << 30,
        })
    }

    fn load_adapter(&self, path: &Path) -> Result<WeightsHandle> {
        match self.paths.iter().position(|p| p == path) {
            Some(idx) => Ok(WeightsHandle {
                id: idx as u64 + 1,
                bytes: 2 << 20,
            }),
            None => Err(Error::AdapterNotFound(path.display().to_string())),
        }
    }

    fn adapter_exists(&self, path: &Path) -> bool {
        self.paths.iter().any(|p| p == path)
    }
}

/// Deterministic model stand-in that maintains a real slot-level view
/// of the paged cache: KV writes land at the plan's slot mapping,
/// copy-on-write pairs are applied before writes, and each sequence's
/// context is reconstructed from its block table. Identical replicas
/// therefore produce bit-identical logits, and preemption with
/// recomputation reproduces the original context exactly.
pub struct MockExecutor {
    profile: MemoryProfile,
    block_size: usize,
    /// Global cache slot -> token written there.
    slots: HashMap<usize, u32>,
}

impl MockExecutor {
    pub fn new(profile: MemoryProfile, block_size: usize) -> Self {
        Self {
            profile,
            block_size,
            slots: HashMap::new(),
        }
    }

    fn context(&self, block_ids: &[usize], len: usize) -> Vec<u32> {
        (0..len)
            .map(|pos| {
                let slot = block_ids[pos / self.block_size] * self.block_size
                    + pos % self.block_size;
                *self.slots.get(&slot).expect("read of unwritten cache slot")
            })
            .collect()
    }
}

/// The completion an adapter produces for a SQL-style prompt: parses
/// the table name out of the schema context and keys the projected
/// column on the adapter handle, so different adapters give different
/// answers and equal adapters give equal ones.
fn adapter_completion(prompt: &str, handle: u64) -> String {
    let table = prompt
        .split("CREATE TABLE ")
        .nth(1)
        .and_then(|rest| rest.split([' ', '(']).next())
        .filter(|s| !s.is_empty())
        .unwrap_or("data");
    format!(" SELECT col_{handle} FROM {table} [/assistant]")
}

const PROMPT_MARKER: &str = "[assistant]";

fn next_token(context: &[u32], adapter_handle: Option<u64>) -> u32 {
    let bytes: Vec<u8> = context
        .iter()
        .filter(|&&t| t < 256)
        .map(|&t| t as u8)
        .collect();
    let text = String::from_utf8_lossy(&bytes);

    match adapter_handle {
        Some(handle) => {
            let Some(idx) = text.rfind(PROMPT_MARKER) else {
                return EOS;
            };
            let produced = &text[idx + PROMPT_MARKER.len()..];
            let target = adapter_completion(&text[..idx], handle);
            match target.as_bytes().get(produced.len()) {
                Some(&b) => u32::from(b),
                None => EOS,
            }
        }
        // Base model: position-dependent babble, never EOS.
        None => u32::from(b'a' + (context.len() % 26) as u8),
    }
}

impl ModelExecutor for MockExecutor {
    fn profile_memory(&mut self, _max_num_seqs: usize) -> Result<MemoryProfile> {
        Ok(self.profile)
    }

    fn forward(&mut self, plan: &BatchPlan) -> Result<Vec<SequenceLogits>> {
        // Copies precede every write in the step.
        for &(src, dst) in &plan.blocks_to_copy {
            for offset in 0..self.block_size {
                if let Some(&token) = self.slots.get(&(src * self.block_size + offset)) {
                    self.slots.insert(dst * self.block_size + offset, token);
                }
            }
        }
        for entry in plan.scheduled() {
            assert_eq!(
                entry.input_token_ids.len(),
                entry.slot_mapping.len(),
                "slot mapping must cover the step's inputs"
            );
            for (&token, &slot) in entry.input_token_ids.iter().zip(&entry.slot_mapping) {
                self.slots.insert(slot, token);
            }
        }

        let mut outputs = Vec::new();
        for entry in plan.scheduled() {
            let len = entry.position_offset + entry.input_token_ids.len();
            let context = self.context(&entry.block_ids, len);
            let token = next_token(&context, entry.adapter_handle);

            let mut logits = vec![0.0f32; VOCAB_SIZE];
            logits[token as usize] = 1.0;
            outputs.push(SequenceLogits {
                seq_id: entry.seq_id,
                logits,
            });
        }
        Ok(outputs)
    }
}

/// Memory measurements that size the pool to roughly `num_blocks`
/// blocks at full utilization (before any LoRA reservation).
pub fn profile_for_blocks(num_blocks: u64) -> MemoryProfile {
    MemoryProfile {
        total_gpu_bytes: 16 << 30,
        free_gpu_bytes: num_blocks << 20,
        kv_block_bytes: 1 << 20,
        per_adapter_bytes: 2 << 20,
    }
}

pub fn executors(world_size: usize, profile: MemoryProfile, block_size: usize) -> Vec<Box<dyn ModelExecutor>> {
    (0..world_size)
        .map(|_| Box::new(MockExecutor::new(profile, block_size)) as Box<dyn ModelExecutor>)
        .collect()
}

/// Engine over mock collaborators.
pub fn engine(config: EngineConfig, num_blocks: u64, adapter_paths: &[&str]) -> LlmEngine {
    let profile = profile_for_blocks(num_blocks);
    LlmEngine::new(
        executors(config.tensor_parallel_size, profile, config.block_size),
        Box::new(ByteTokenizer),
        Box::new(MockLoader::new(adapter_paths)),
        config,
    )
    .expect("engine construction")
}
