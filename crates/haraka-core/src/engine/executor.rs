//! Worker fan-out.
//!
//! Every worker holds a full replica of the model and runs each step in
//! lock-step. The executor broadcasts capability calls to the ordered
//! worker list and joins the results; whether a worker computes in-process
//! or behind an RPC boundary is invisible here. Replicas must produce
//! bit-identical sampler outputs; divergence means a broken replica and is
//! fatal by design, not a recoverable condition.

use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, info};
use uuid::Uuid;

use super::metrics::MetricsSnapshot;
use super::sequence::{SamplerOutput, SequenceGroupMetadata};
use super::types::BlockId;
use crate::config::CacheConfig;
use crate::error::{Error, Result};

/// Everything a worker needs to execute one step.
#[derive(Debug, Clone, Default)]
pub struct ExecutionBatch {
    pub seq_group_metadata: Vec<SequenceGroupMetadata>,
    pub blocks_to_swap_in: HashMap<BlockId, BlockId>,
    pub blocks_to_swap_out: HashMap<BlockId, BlockId>,
    pub blocks_to_copy: HashMap<BlockId, Vec<BlockId>>,
}

/// One worker's result for one step.
#[derive(Debug, Clone)]
pub struct WorkerStepOutput {
    pub sampler_output: SamplerOutput,
    pub execution_time: Duration,
}

/// Capability set of a GPU worker.
///
/// Implementations may run in-process or proxy a remote process; the
/// executor treats them identically.
pub trait Worker: Send {
    /// Bootstrap the collective communication group. Every replica
    /// receives the same rendezvous id.
    fn init_model(&mut self, rendezvous_id: u32) -> Result<()>;

    /// Measure how many KV blocks fit on this worker's devices.
    fn profile_num_available_blocks(
        &mut self,
        block_size: usize,
        gpu_memory_utilization: f32,
        cpu_swap_space_bytes: u64,
    ) -> Result<(usize, usize)>;

    fn init_cache_engine(&mut self, cache_config: &CacheConfig) -> Result<()>;

    fn execute_model(&mut self, batch: &ExecutionBatch) -> Result<WorkerStepOutput>;

    fn get_gpu_id(&self) -> Result<usize>;

    fn mark_initial_memory_profiling_done(&mut self) -> Result<()>;
    fn get_metrics_snapshot(&mut self) -> Result<MetricsSnapshot>;
    fn reset_metrics(&mut self) -> Result<()>;
    fn start_profiling(&mut self) -> Result<()>;
    fn stop_profiling(&mut self) -> Result<()>;
}

/// Drives the replicated workers in lock-step.
pub struct ModelExecutor {
    workers: Vec<Box<dyn Worker>>,
    replica_id: u32,
}

impl ModelExecutor {
    pub fn new(workers: Vec<Box<dyn Worker>>, replica_id: u32) -> Result<Self> {
        if workers.is_empty() {
            return Err(Error::Config("at least one worker is required".to_string()));
        }
        Ok(Self {
            workers,
            replica_id,
        })
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// One-time startup: collective init, memory profiling, cache engine
    /// bring-up. Fills `num_gpu_blocks` / `num_cpu_blocks` into the cache
    /// config.
    pub fn init(&mut self, cache_config: &mut CacheConfig) -> Result<()> {
        self.check_consecutive_gpu_allocation()?;

        let rendezvous_id = generate_rendezvous_id(self.replica_id);
        debug!(rendezvous_id, "initializing model replicas");
        self.run_collect(|worker| worker.init_model(rendezvous_id))?;

        // A single centralized controller issues block operations to every
        // worker, so the global budget is the element-wise minimum.
        let profiles = self.run_collect(|worker| {
            worker.profile_num_available_blocks(
                cache_config.block_size,
                cache_config.gpu_memory_utilization,
                cache_config.swap_space_bytes,
            )
        })?;
        let num_gpu_blocks = profiles.iter().map(|p| p.0).min().unwrap_or(0);
        let num_cpu_blocks = profiles.iter().map(|p| p.1).min().unwrap_or(0);
        info!(num_gpu_blocks, num_cpu_blocks, "profiled KV cache capacity");

        if num_gpu_blocks == 0 {
            return Err(Error::Config(
                "no available memory for the cache blocks; \
                 try increasing gpu_memory_utilization"
                    .to_string(),
            ));
        }
        cache_config.num_gpu_blocks = Some(num_gpu_blocks);
        cache_config.num_cpu_blocks = Some(num_cpu_blocks);

        let final_config = cache_config.clone();
        self.run_collect(|worker| worker.init_cache_engine(&final_config))?;
        Ok(())
    }

    /// Broadcast one step and reconcile the replicas' outputs.
    ///
    /// Returns the first replica's sampler output and the minimum execution
    /// time across workers (the least CPU-noise-affected observation).
    pub fn execute_model(&mut self, batch: &ExecutionBatch) -> Result<(SamplerOutput, Duration)> {
        let outputs = self.run_collect(|worker| worker.execute_model(batch))?;

        let min_time = outputs
            .iter()
            .map(|o| o.execution_time)
            .min()
            .expect("at least one worker");

        let mut outputs = outputs.into_iter();
        let first = outputs.next().expect("at least one worker");
        for (idx, other) in outputs.enumerate() {
            if other.sampler_output != first.sampler_output {
                return Err(Error::WorkerDivergence(format!(
                    "worker {} sampler output differs from worker 0",
                    idx + 1
                )));
            }
        }
        Ok((first.sampler_output, min_time))
    }

    pub fn mark_initial_memory_profiling_done(&mut self) -> Result<()> {
        self.run_collect(|worker| worker.mark_initial_memory_profiling_done())?;
        Ok(())
    }

    pub fn collect_metrics_snapshots(&mut self) -> Result<Vec<MetricsSnapshot>> {
        self.run_collect(|worker| worker.get_metrics_snapshot())
    }

    pub fn reset_metrics(&mut self) -> Result<()> {
        self.run_collect(|worker| worker.reset_metrics())?;
        Ok(())
    }

    pub fn start_profiling(&mut self) -> Result<()> {
        self.run_collect(|worker| worker.start_profiling())?;
        Ok(())
    }

    pub fn stop_profiling(&mut self) -> Result<()> {
        self.run_collect(|worker| worker.stop_profiling())?;
        Ok(())
    }

    /// Run a call on every worker, in order, and join the results.
    fn run_collect<R>(
        &mut self,
        mut call: impl FnMut(&mut dyn Worker) -> Result<R>,
    ) -> Result<Vec<R>> {
        self.workers
            .iter_mut()
            .map(|worker| call(worker.as_mut()))
            .collect()
    }

    /// The workers must occupy a consecutive GPU range; holes mean the
    /// placement went wrong.
    fn check_consecutive_gpu_allocation(&mut self) -> Result<()> {
        let mut gpu_ids = self.run_collect(|worker| worker.get_gpu_id())?;
        gpu_ids.sort_unstable();
        let min = *gpu_ids.first().expect("at least one worker");
        let expected: Vec<usize> = (min..min + gpu_ids.len()).collect();
        if gpu_ids != expected {
            return Err(Error::Config(format!(
                "GPU ids are not consecutive: {gpu_ids:?}"
            )));
        }
        Ok(())
    }
}

/// 32-bit rendezvous nonce, offset per replica so concurrent replicas
/// bootstrap distinct collectives.
fn generate_rendezvous_id(replica_id: u32) -> u32 {
    (Uuid::new_v4().as_u128() as u32).wrapping_add(replica_id)
}
