//! Token sampling from next-token logits.
//!
//! Each sequence owns one sampler seeded from its request, so a given
//! (seed, logits) history always reproduces the same tokens. Greedy
//! decoding (temperature zero) never touches the RNG.

use std::cmp::Ordering;

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::SamplingParams;
use crate::error::{Error, Result};

/// Per-sequence token sampler.
pub struct Sampler {
    rng: StdRng,
}

impl Sampler {
    /// Create a sampler with the given seed.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Sample the next token ID from raw logits.
    ///
    /// Temperature zero is exact argmax with lowest-index tie-breaking,
    /// so greedy runs are bit-reproducible across processes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Executor`] for empty logits or degenerate
    /// probabilities.
    pub fn sample(&mut self, logits: &[f32], params: &SamplingParams) -> Result<u32> {
        if logits.is_empty() {
            return Err(Error::Executor("sampler received empty logits".into()));
        }

        if params.temperature == 0.0 {
            return Ok(argmax(logits));
        }

        let scaled: Vec<f32> = logits.iter().map(|&l| l / params.temperature).collect();

        // Candidate token indices, most probable first; index order
        // breaks ties deterministically.
        let mut candidates: Vec<usize> = (0..scaled.len()).collect();
        candidates.sort_by(|&a, &b| {
            scaled[b]
                .partial_cmp(&scaled[a])
                .unwrap_or(Ordering::Equal)
                .then(a.cmp(&b))
        });
        if params.top_k > 0 && params.top_k < candidates.len() {
            candidates.truncate(params.top_k);
        }

        // Softmax over the surviving candidates, shifted for stability.
        let max_logit = scaled[candidates[0]];
        let mut probs: Vec<f32> = candidates
            .iter()
            .map(|&idx| (scaled[idx] - max_logit).exp())
            .collect();
        let sum: f32 = probs.iter().sum();
        for p in probs.iter_mut() {
            *p /= sum;
        }

        // Nucleus cutoff: keep the smallest prefix covering top_p.
        if params.top_p < 1.0 {
            let mut cumulative = 0.0;
            let mut keep = probs.len();
            for (i, &p) in probs.iter().enumerate() {
                cumulative += p;
                if cumulative >= params.top_p {
                    keep = i + 1;
                    break;
                }
            }
            candidates.truncate(keep);
            probs.truncate(keep);
        }

        let dist = WeightedIndex::new(&probs)
            .map_err(|e| Error::Executor(format!("degenerate sampling weights: {e}")))?;
        Ok(candidates[dist.sample(&mut self.rng)] as u32)
    }
}

/// Exact argmax; the lowest index wins ties.
fn argmax(logits: &[f32]) -> u32 {
    let mut best = 0;
    for (idx, &logit) in logits.iter().enumerate() {
        if logit > logits[best] {
            best = idx;
        }
    }
    best as u32
}
