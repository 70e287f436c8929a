//! Lock-step tensor-parallel execution.
//!
//! Every rank owns a full replica of the scheduler-visible state and
//! executes the same [`BatchPlan`] each step. The driver broadcasts the
//! plan over rank-indexed channels, then blocks until every rank
//! acknowledges with a digest of what it ran and what it produced.
//! Digest disagreement means replicated state has diverged; the group
//! poisons itself and refuses further work, since a desynchronized
//! cache silently corrupts every subsequent token.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::executor::{MemoryProfile, ModelExecutor, SequenceLogits};
use crate::scheduler::BatchPlan;

enum WorkerRequest {
    Profile { max_num_seqs: usize },
    Execute(Box<BatchPlan>),
    Shutdown,
}

enum ReplyPayload {
    Profile(MemoryProfile),
    Logits(Vec<SequenceLogits>),
    Failed(String),
}

/// Per-step acknowledgement from one rank.
struct WorkerReply {
    rank: usize,
    step_id: u64,
    plan_digest: u64,
    output_digest: u64,
    payload: ReplyPayload,
}

/// Digest over sampler-visible output, bitwise on the logits.
fn logits_digest(outputs: &[SequenceLogits]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for output in outputs {
        output.seq_id.hash(&mut hasher);
        for &logit in &output.logits {
            logit.to_bits().hash(&mut hasher);
        }
    }
    hasher.finish()
}

fn run_worker(
    rank: usize,
    mut executor: Box<dyn ModelExecutor>,
    requests: Receiver<WorkerRequest>,
    replies: Sender<WorkerReply>,
) {
    debug!(rank, "worker rank started");
    while let Ok(request) = requests.recv() {
        let reply = match request {
            WorkerRequest::Profile { max_num_seqs } => {
                match executor.profile_memory(max_num_seqs) {
                    Ok(profile) => WorkerReply {
                        rank,
                        step_id: 0,
                        plan_digest: 0,
                        output_digest: 0,
                        payload: ReplyPayload::Profile(profile),
                    },
                    Err(err) => WorkerReply {
                        rank,
                        step_id: 0,
                        plan_digest: 0,
                        output_digest: 0,
                        payload: ReplyPayload::Failed(err.to_string()),
                    },
                }
            }
            WorkerRequest::Execute(plan) => {
                let plan_digest = plan.digest();
                match executor.forward(&plan) {
                    Ok(outputs) => WorkerReply {
                        rank,
                        step_id: plan.step_id,
                        plan_digest,
                        output_digest: logits_digest(&outputs),
                        payload: ReplyPayload::Logits(outputs),
                    },
                    Err(err) => WorkerReply {
                        rank,
                        step_id: plan.step_id,
                        plan_digest,
                        output_digest: 0,
                        payload: ReplyPayload::Failed(err.to_string()),
                    },
                }
            }
            WorkerRequest::Shutdown => break,
        };
        if replies.send(reply).is_err() {
            break;
        }
    }
    debug!(rank, "worker rank stopped");
}

/// Driver-side handle over the worker ranks.
///
/// One worker thread per rank, each owning its [`ModelExecutor`]
/// replica. All communication is lock-step: a broadcast followed by a
/// full barrier on acknowledgements, so replies never interleave
/// across steps.
pub struct TensorParallelGroup {
    senders: Vec<Sender<WorkerRequest>>,
    replies: Receiver<WorkerReply>,
    handles: Vec<JoinHandle<()>>,
    world_size: usize,
    poisoned: bool,
}

impl TensorParallelGroup {
    /// Spawn one worker thread per executor replica.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an empty executor list.
    pub fn spawn(executors: Vec<Box<dyn ModelExecutor>>) -> Result<Self> {
        if executors.is_empty() {
            return Err(Error::Config(
                "tensor-parallel group needs at least one executor".into(),
            ));
        }

        let world_size = executors.len();
        let (reply_tx, reply_rx) = channel();
        let mut senders = Vec::with_capacity(world_size);
        let mut handles = Vec::with_capacity(world_size);

        for (rank, executor) in executors.into_iter().enumerate() {
            let (request_tx, request_rx) = channel();
            let replies = reply_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("vellum-rank-{rank}"))
                .spawn(move || run_worker(rank, executor, request_rx, replies))?;
            senders.push(request_tx);
            handles.push(handle);
        }

        info!(world_size, "tensor-parallel group online");
        Ok(Self {
            senders,
            replies: reply_rx,
            handles,
            world_size,
            poisoned: false,
        })
    }

    /// Number of ranks.
    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Whether a fatal divergence has shut the group down.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Run the warmup memory profile on every rank and merge the
    /// results, taking the tightest free-memory figure so the block
    /// pool fits on every device.
    pub fn profile(&mut self, max_num_seqs: usize) -> Result<MemoryProfile> {
        self.ensure_live()?;
        self.broadcast(|| WorkerRequest::Profile { max_num_seqs })?;

        let mut merged: Option<MemoryProfile> = None;
        for _ in 0..self.world_size {
            let reply = self.collect_reply()?;
            match reply.payload {
                ReplyPayload::Profile(profile) => {
                    merged = Some(match merged {
                        None => profile,
                        Some(acc) => MemoryProfile {
                            total_gpu_bytes: acc.total_gpu_bytes.min(profile.total_gpu_bytes),
                            free_gpu_bytes: acc.free_gpu_bytes.min(profile.free_gpu_bytes),
                            kv_block_bytes: acc.kv_block_bytes.max(profile.kv_block_bytes),
                            per_adapter_bytes: acc
                                .per_adapter_bytes
                                .max(profile.per_adapter_bytes),
                        },
                    });
                }
                ReplyPayload::Failed(detail) => {
                    self.poisoned = true;
                    return Err(Error::Executor(format!(
                        "rank {} failed memory profiling: {detail}",
                        reply.rank
                    )));
                }
                ReplyPayload::Logits(_) => {
                    self.poisoned = true;
                    return Err(Error::Executor(format!(
                        "rank {} sent logits during profiling",
                        reply.rank
                    )));
                }
            }
        }
        merged.ok_or_else(|| Error::Executor("no profile replies received".into()))
    }

    /// Broadcast one plan to every rank and barrier on the result.
    ///
    /// Returns rank 0's logits once every rank has acknowledged with
    /// matching digests.
    ///
    /// # Errors
    ///
    /// [`Error::RankDesynchronization`] if any rank reports a different
    /// plan or output digest; the group is poisoned and every later
    /// call returns [`Error::EnginePoisoned`].
    pub fn execute(&mut self, plan: &BatchPlan) -> Result<Vec<SequenceLogits>> {
        self.ensure_live()?;
        let expected_plan = plan.digest();
        self.broadcast(|| WorkerRequest::Execute(Box::new(plan.clone())))?;

        let mut driver_logits = None;
        let mut expected_output: Option<(usize, u64)> = None;
        let mut failure: Option<Error> = None;

        // Drain the full barrier even after a failure, so worker
        // threads are never left blocked on a send.
        for _ in 0..self.world_size {
            let reply = self.collect_reply()?;
            let rank = reply.rank;

            if let ReplyPayload::Failed(detail) = &reply.payload {
                failure.get_or_insert_with(|| {
                    Error::Executor(format!("rank {rank} failed step {}: {detail}", plan.step_id))
                });
                continue;
            }
            if reply.step_id != plan.step_id {
                failure.get_or_insert_with(|| {
                    self.desync(rank, plan.step_id, format!("acked step {}", reply.step_id))
                });
                continue;
            }
            if reply.plan_digest != expected_plan {
                failure.get_or_insert_with(|| {
                    self.desync(rank, plan.step_id, "executed a different plan".into())
                });
                continue;
            }
            match expected_output {
                None => expected_output = Some((rank, reply.output_digest)),
                Some((first_rank, digest)) if digest != reply.output_digest => {
                    failure.get_or_insert_with(|| {
                        self.desync(
                            rank,
                            plan.step_id,
                            format!("output digest differs from rank {first_rank}"),
                        )
                    });
                    continue;
                }
                Some(_) => {}
            }
            if rank == 0 {
                if let ReplyPayload::Logits(outputs) = reply.payload {
                    driver_logits = Some(outputs);
                }
            }
        }

        if let Some(err) = failure {
            self.poisoned = true;
            error!(step_id = plan.step_id, %err, "tensor-parallel step failed, poisoning group");
            return Err(err);
        }

        driver_logits.ok_or_else(|| {
            self.poisoned = true;
            Error::Executor("rank 0 sent no logits".into())
        })
    }

    fn desync(&self, rank: usize, step: u64, detail: String) -> Error {
        Error::RankDesynchronization { rank, step, detail }
    }

    fn ensure_live(&self) -> Result<()> {
        if self.poisoned {
            return Err(Error::EnginePoisoned);
        }
        Ok(())
    }

    fn broadcast<F>(&mut self, mut make: F) -> Result<()>
    where
        F: FnMut() -> WorkerRequest,
    {
        for (rank, sender) in self.senders.iter().enumerate() {
            if sender.send(make()).is_err() {
                self.poisoned = true;
                return Err(Error::Executor(format!("rank {rank} is gone")));
            }
        }
        Ok(())
    }

    fn collect_reply(&mut self) -> Result<WorkerReply> {
        self.replies.recv().map_err(|_| {
            self.poisoned = true;
            Error::Executor("worker ranks hung up mid-step".into())
        })
    }
}

impl Drop for TensorParallelGroup {
    fn drop(&mut self) {
        for sender in &self.senders {
            let _ = sender.send(WorkerRequest::Shutdown);
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}
