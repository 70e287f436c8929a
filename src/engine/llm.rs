//! The serving engine.
//!
//! [`LlmEngine`] ties the pieces together: requests are tokenized and
//! queued, the scheduler forms one [`BatchPlan`] per step, the
//! tensor-parallel group executes it, and sampled tokens feed back into
//! the sequences until they finish. Completed requests are returned
//! from [`LlmEngine::step`] as [`GenerationOutput`]s.
//!
//! Capacity failures are not errors at this level: a request that can
//! never fit, or that starves past the idle budget, comes back as a
//! normal output whose finish reason is
//! [`FinishReason::OutOfCapacity`]. Only fatal conditions (rank
//! divergence, executor failure) surface as `Err`, after which the
//! engine is poisoned and refuses further work.

use std::collections::HashMap;

use tracing::{info, warn};

use crate::config::{CacheConfig, EngineConfig, SamplingParams, SchedulerConfig};
use crate::core::block_store::{profile_cache_config, BlockStore};
use crate::core::sequence::{FinishReason, Sequence, SequenceId, SequenceStatus};
use crate::engine::sampler::Sampler;
use crate::error::{Error, Result};
use crate::executor::{ModelExecutor, Tokenizer, WeightLoader};
use crate::lora::{AdapterSlotManager, LoraRequest};
use crate::parallel::TensorParallelGroup;
use crate::scheduler::{BatchPlan, Scheduler};

/// One generation request handed to [`LlmEngine::generate`].
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Prompt text.
    pub prompt: String,
    /// Sampling parameters.
    pub sampling: SamplingParams,
    /// LoRA adapter to apply, if any.
    pub lora: Option<LoraRequest>,
}

impl GenerationRequest {
    /// Create a base-model request.
    pub fn new(prompt: impl Into<String>, sampling: SamplingParams) -> Self {
        Self {
            prompt: prompt.into(),
            sampling,
            lora: None,
        }
    }

    /// Attach a LoRA adapter.
    pub fn with_lora(mut self, lora: LoraRequest) -> Self {
        self.lora = Some(lora);
        self
    }
}

/// One completion of a request (requests with `n > 1` have several).
#[derive(Debug, Clone)]
pub struct CompletionOutput {
    /// Decoded completion text, truncated at the first stop match.
    pub text: String,
    /// Generated token IDs.
    pub token_ids: Vec<u32>,
    /// Why generation ended.
    pub finish_reason: FinishReason,
    /// Times the backing sequence was preempted.
    pub preemptions: u32,
}

/// Final output for one request.
#[derive(Debug, Clone)]
pub struct GenerationOutput {
    /// Engine-assigned request identifier.
    pub request_id: u64,
    /// The original prompt.
    pub prompt: String,
    /// One completion per requested sample.
    pub completions: Vec<CompletionOutput>,
}

/// Bookkeeping for an in-flight request.
struct RequestState {
    prompt: String,
    seq_ids: Vec<SequenceId>,
    /// Parallel samples still to fork off after prefill.
    forks_pending: usize,
}

/// The continuous-batching serving engine.
pub struct LlmEngine {
    config: EngineConfig,
    cache_config: CacheConfig,
    scheduler: Scheduler,
    adapters: AdapterSlotManager,
    group: TensorParallelGroup,
    tokenizer: Box<dyn Tokenizer>,
    loader: Box<dyn WeightLoader>,
    samplers: HashMap<SequenceId, Sampler>,
    requests: HashMap<u64, RequestState>,
    seq_to_request: HashMap<SequenceId, u64>,
    next_request_id: u64,
    next_seq_id: SequenceId,
    eos_token_id: u32,
    fatal: bool,
}

impl LlmEngine {
    /// Build the engine: spawn the tensor-parallel group, run the
    /// one-shot capacity profile, size the block pool, and pin the
    /// base-model weights.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an invalid configuration or an
    /// executor count that does not match `tensor_parallel_size`, and
    /// propagates profiling failures.
    pub fn new(
        executors: Vec<Box<dyn ModelExecutor>>,
        tokenizer: Box<dyn Tokenizer>,
        loader: Box<dyn WeightLoader>,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        if executors.len() != config.tensor_parallel_size {
            return Err(Error::Config(format!(
                "got {} executors for tensor_parallel_size {}",
                executors.len(),
                config.tensor_parallel_size
            )));
        }

        let mut group = TensorParallelGroup::spawn(executors)?;
        let profile = group.profile(config.max_num_seqs)?;
        let cache_config = profile_cache_config(&profile, &config)?;
        let block_store = BlockStore::from_cache_config(&cache_config, config.watermark);
        let scheduler = Scheduler::new(SchedulerConfig::from(&config), block_store);

        let max_loras = if config.enable_lora { config.max_loras } else { 0 };
        let mut adapters = AdapterSlotManager::new(max_loras);
        adapters.pin_base(loader.load_base_model()?);

        let eos_token_id = tokenizer.eos_token_id();
        info!(
            num_gpu_blocks = cache_config.num_gpu_blocks(),
            block_size = cache_config.block_size(),
            world_size = group.world_size(),
            max_loras,
            "engine ready"
        );

        Ok(Self {
            config,
            cache_config,
            scheduler,
            adapters,
            group,
            tokenizer,
            loader,
            samplers: HashMap::new(),
            requests: HashMap::new(),
            seq_to_request: HashMap::new(),
            next_request_id: 0,
            next_seq_id: 0,
            eos_token_id,
            fatal: false,
        })
    }

    /// Queue a request; it will be admitted by a later [`step`](Self::step).
    ///
    /// # Errors
    ///
    /// Rejects requests before they reach the scheduler: a LoRA request
    /// while LoRA is disabled or whose weights do not exist
    /// ([`Error::AdapterNotFound`]), an empty prompt, or `n == 0`.
    pub fn add_request(
        &mut self,
        prompt: &str,
        sampling: SamplingParams,
        lora: Option<LoraRequest>,
    ) -> Result<u64> {
        if self.fatal {
            return Err(Error::EnginePoisoned);
        }
        if sampling.n == 0 {
            return Err(Error::Config("sampling n must be >= 1".into()));
        }
        if sampling.max_tokens == 0 {
            return Err(Error::Config("max_tokens must be >= 1".into()));
        }
        if let Some(lora) = &lora {
            if !self.config.enable_lora {
                return Err(Error::Config(
                    "request carries a LoRA adapter but enable_lora is off".into(),
                ));
            }
            self.adapters.validate(lora, self.loader.as_ref())?;
        }

        let prompt_token_ids = self.tokenizer.encode(prompt)?;
        if prompt_token_ids.is_empty() {
            return Err(Error::Config("prompt produced no tokens".into()));
        }

        let request_id = self.next_request_id;
        self.next_request_id += 1;
        let seq_id = self.next_seq_id;
        self.next_seq_id += 1;

        let mut seq = Sequence::new(
            seq_id,
            prompt_token_ids,
            sampling.clone(),
            self.cache_config.block_size(),
        );
        if let Some(lora) = lora {
            seq = seq.with_lora(lora);
        }

        self.samplers.insert(seq_id, Sampler::new(sampling.seed));
        self.seq_to_request.insert(seq_id, request_id);
        self.requests.insert(
            request_id,
            RequestState {
                prompt: prompt.to_string(),
                seq_ids: vec![seq_id],
                forks_pending: sampling.n - 1,
            },
        );
        self.scheduler.add_sequence(seq);

        info!(request_id, seq_id, "queued request");
        Ok(request_id)
    }

    /// Abort a request; its sequences release their resources
    /// immediately and the output (finish reason `Aborted`) is returned
    /// by the next step.
    pub fn abort_request(&mut self, request_id: u64) {
        let Some(state) = self.requests.get(&request_id) else {
            warn!(request_id, "abort of unknown request");
            return;
        };
        for seq_id in state.seq_ids.clone() {
            self.scheduler.abort_sequence(seq_id, &mut self.adapters);
        }
    }

    /// Run one engine step: schedule, execute, sample, and collect
    /// every request that reached a terminal state.
    ///
    /// # Errors
    ///
    /// Fatal conditions only. After an `Err` the engine is poisoned.
    pub fn step(&mut self) -> Result<Vec<GenerationOutput>> {
        if self.fatal {
            return Err(Error::EnginePoisoned);
        }

        let plan = self
            .scheduler
            .schedule(&mut self.adapters, self.loader.as_ref());
        let forked = self.fork_pending(&plan)?;

        if !plan.is_empty() {
            let outputs = match self.group.execute(&plan) {
                Ok(outputs) => outputs,
                Err(err) => {
                    self.fatal = true;
                    return Err(err);
                }
            };
            for output in outputs {
                self.apply_logits(output.seq_id, &output.logits)?;
                if let Some(children) = forked.get(&output.seq_id) {
                    // Forked samples draw their first token from the
                    // parent's prefill logits, each with its own RNG.
                    for &child in children {
                        self.apply_logits(child, &output.logits)?;
                    }
                }
            }
        }

        self.collect_finished()
    }

    /// Drive a batch of requests to completion.
    ///
    /// Returns one output per request, in submission order. Capacity
    /// failures appear as outputs, not errors.
    pub fn generate(&mut self, requests: Vec<GenerationRequest>) -> Result<Vec<GenerationOutput>> {
        let mut pending = Vec::with_capacity(requests.len());
        for request in requests {
            pending.push(self.add_request(&request.prompt, request.sampling, request.lora)?);
        }

        let mut outputs = Vec::with_capacity(pending.len());
        while outputs.len() < pending.len() {
            let finished = self.step()?;
            outputs.extend(
                finished
                    .into_iter()
                    .filter(|o| pending.contains(&o.request_id)),
            );
            if !self.scheduler.has_unfinished_sequences() && outputs.len() < pending.len() {
                break;
            }
        }
        outputs.sort_by_key(|o| o.request_id);
        Ok(outputs)
    }

    /// Whether any request is still queued or running.
    pub fn has_unfinished_requests(&self) -> bool {
        !self.requests.is_empty()
    }

    /// The profiled cache sizing.
    pub fn cache_config(&self) -> CacheConfig {
        self.cache_config
    }

    /// The engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The scheduler, for capacity inspection.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Whether a fatal error has shut the engine down.
    pub fn is_poisoned(&self) -> bool {
        self.fatal
    }

    /// Fork parallel samples for every request whose prefill landed in
    /// this plan. Children share the parent's blocks.
    fn fork_pending(&mut self, plan: &BatchPlan) -> Result<HashMap<SequenceId, Vec<SequenceId>>> {
        let mut forked: HashMap<SequenceId, Vec<SequenceId>> = HashMap::new();
        for entry in &plan.prefill {
            let parent_id = entry.seq_id;
            let Some(&request_id) = self.seq_to_request.get(&parent_id) else {
                continue;
            };
            let state = self
                .requests
                .get_mut(&request_id)
                .expect("request state for live sequence");

            while state.forks_pending > 0 {
                let child_id = self.next_seq_id;
                self.next_seq_id += 1;
                self.scheduler.fork_sequence(
                    parent_id,
                    child_id,
                    &mut self.adapters,
                    self.loader.as_ref(),
                )?;

                let child_index = state.seq_ids.len() as u64;
                self.samplers.insert(
                    child_id,
                    Sampler::new(entry.sampling.seed.wrapping_add(child_index)),
                );
                state.seq_ids.push(child_id);
                state.forks_pending -= 1;
                self.seq_to_request.insert(child_id, request_id);
                forked.entry(parent_id).or_default().push(child_id);
            }
        }
        Ok(forked)
    }

    /// Sample one token for a sequence and apply finish rules.
    fn apply_logits(&mut self, seq_id: SequenceId, logits: &[f32]) -> Result<()> {
        let Some(seq) = self.scheduler.get_sequence(seq_id) else {
            return Ok(());
        };
        if seq.status() != SequenceStatus::Running {
            // Preempted after its forward ran; the token is recomputed
            // when the sequence re-prefills.
            return Ok(());
        }
        let params = seq.sampling().clone();

        let sampler = self
            .samplers
            .get_mut(&seq_id)
            .ok_or(Error::SequenceNotFound(seq_id))?;
        let token = sampler.sample(logits, &params)?;

        if token == self.eos_token_id {
            self.scheduler
                .finish_sequence(seq_id, FinishReason::EndOfSequence, &mut self.adapters);
            return Ok(());
        }

        self.scheduler.append_token(seq_id, token)?;
        let seq = self
            .scheduler
            .get_sequence(seq_id)
            .ok_or(Error::SequenceNotFound(seq_id))?;

        if seq.output_len() >= params.max_tokens {
            self.scheduler
                .finish_sequence(seq_id, FinishReason::MaxTokens, &mut self.adapters);
            return Ok(());
        }

        if !params.stop.is_empty() {
            let text = self.tokenizer.decode(seq.output_token_ids())?;
            if params.stop.iter().any(|stop| text.contains(stop)) {
                self.scheduler
                    .finish_sequence(seq_id, FinishReason::StopSequence, &mut self.adapters);
            }
        }
        Ok(())
    }

    /// Collect every request whose sequences all reached a terminal
    /// state, removing them from the registry.
    fn collect_finished(&mut self) -> Result<Vec<GenerationOutput>> {
        let done: Vec<u64> = self
            .requests
            .iter()
            .filter(|(_, state)| {
                state.seq_ids.iter().all(|id| {
                    self.scheduler
                        .get_sequence(*id)
                        .map(|s| s.status().is_terminal())
                        .unwrap_or(true)
                })
            })
            .map(|(&request_id, _)| request_id)
            .collect();

        let mut outputs = Vec::with_capacity(done.len());
        for request_id in done {
            let state = self
                .requests
                .remove(&request_id)
                .expect("collected request exists");

            let mut completions = Vec::with_capacity(state.seq_ids.len());
            for seq_id in state.seq_ids {
                self.samplers.remove(&seq_id);
                self.seq_to_request.remove(&seq_id);
                let Some(seq) = self.scheduler.remove_sequence(seq_id) else {
                    continue;
                };

                let finish_reason = seq.finish_reason().unwrap_or(FinishReason::Aborted);
                let mut text = self.tokenizer.decode(seq.output_token_ids())?;
                if finish_reason == FinishReason::StopSequence {
                    if let Some(idx) = seq
                        .sampling()
                        .stop
                        .iter()
                        .filter_map(|stop| text.find(stop.as_str()))
                        .min()
                    {
                        text.truncate(idx);
                    }
                }

                completions.push(CompletionOutput {
                    text,
                    token_ids: seq.output_token_ids().to_vec(),
                    finish_reason,
                    preemptions: seq.preemptions(),
                });
            }

            info!(request_id, completions = completions.len(), "request finished");
            outputs.push(GenerationOutput {
                request_id,
                prompt: state.prompt,
                completions,
            });
        }
        outputs.sort_by_key(|o| o.request_id);
        Ok(outputs)
    }
}
