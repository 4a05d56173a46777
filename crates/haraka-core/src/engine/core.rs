//! The engine: request intake, the per-iteration step loop, and
//! introspection.
//!
//! One `step()` call performs one decoding iteration: ask the scheduler
//! for a plan, broadcast it to the workers, reconcile their outputs, and
//! post-process the sampled tokens. The engine is single-threaded
//! cooperative; the only suspension point is the worker broadcast-and-join
//! inside the executor. Callers wanting concurrent submission serialize
//! `add_request`, `abort_request` and `step` on one engine, or wrap it in
//! an external queueing layer.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use tracing::{info, warn};

use super::executor::{ExecutionBatch, ModelExecutor, Worker};
use super::metrics::{BatchEndRecord, MetricsStore};
use super::output_processor::OutputProcessor;
use super::sampling::SamplingParams;
use super::scheduler::{Scheduler, SchedulerRegistry};
use super::sequence::{RequestOutput, Sequence, SequenceGroup, SequenceStatus};
use super::types::{Counter, RequestId, Token};
use crate::config::{EngineConfig, ModelConfig};
use crate::error::{Error, Result};
use crate::tokenizer::Tokenizer;

pub struct Engine {
    config: EngineConfig,
    tokenizer: Tokenizer,
    seq_counter: Counter,
    metrics: Arc<MetricsStore>,
    executor: ModelExecutor,
    scheduler: Box<dyn Scheduler>,

    // Sliding windows for the periodic system-stats log.
    last_stats_log: Instant,
    prompt_token_window: Vec<(Instant, usize)>,
    generation_token_window: Vec<(Instant, usize)>,
}

impl Engine {
    /// Build an engine with the built-in scheduler policies.
    pub fn new(
        config: EngineConfig,
        tokenizer: Tokenizer,
        workers: Vec<Box<dyn Worker>>,
        replica_id: u32,
    ) -> Result<Self> {
        Self::with_registry(
            config,
            tokenizer,
            workers,
            replica_id,
            &SchedulerRegistry::default(),
        )
    }

    /// Build an engine resolving the scheduler policy through a custom
    /// registry.
    pub fn with_registry(
        mut config: EngineConfig,
        tokenizer: Tokenizer,
        workers: Vec<Box<dyn Worker>>,
        replica_id: u32,
        registry: &SchedulerRegistry,
    ) -> Result<Self> {
        config.verify()?;
        info!(
            model = %config.model.model,
            tokenizer = ?config.model.tokenizer,
            tokenizer_mode = %config.model.tokenizer_mode,
            revision = ?config.model.revision,
            trust_remote_code = config.model.trust_remote_code,
            dtype = %config.model.dtype,
            download_dir = ?config.model.download_dir,
            load_format = %config.model.load_format,
            tensor_parallel_size = config.parallel.tensor_parallel_size,
            quantization = ?config.model.quantization,
            seed = config.model.seed,
            "initializing engine"
        );

        if workers.len() != config.parallel.world_size() {
            return Err(Error::Config(format!(
                "{} workers provided for world_size {}",
                workers.len(),
                config.parallel.world_size()
            )));
        }

        // The metrics store exists before the workers touch anything so
        // their instrumentation has a handle to report into.
        let metrics = Arc::new(MetricsStore::new(config.metrics.clone()));

        let mut executor = ModelExecutor::new(workers, replica_id)?;
        executor.init(&mut config.cache)?;
        metrics.mark_initial_memory_profiling_done();
        executor.mark_initial_memory_profiling_done()?;

        let scheduler = registry.create(
            &config.scheduler.type_name,
            config.scheduler.clone(),
            &config.cache,
        )?;

        Ok(Self {
            config,
            tokenizer,
            seq_counter: Counter::new(),
            metrics,
            executor,
            scheduler,
            last_stats_log: Instant::now(),
            prompt_token_window: Vec::new(),
            generation_token_window: Vec::new(),
        })
    }

    /// Queue a request for generation.
    ///
    /// At least one of `prompt` and `prompt_token_ids` is required; when
    /// both are given the token ids win and the prompt is kept only for
    /// echoing. Invalid sampling parameters do not fail the call: the
    /// request is admitted pre-finished as FINISHED_IGNORED and surfaces
    /// through the next step's outputs.
    pub fn add_request(
        &mut self,
        request_id: impl Into<RequestId>,
        prompt: Option<&str>,
        sampling_params: SamplingParams,
        prompt_token_ids: Option<Vec<Token>>,
        arrival_time: Option<SystemTime>,
    ) -> Result<()> {
        let request_id = request_id.into();
        let arrived_at = Instant::now();
        let arrival_time = arrival_time.unwrap_or_else(SystemTime::now);

        let prompt_token_ids = match prompt_token_ids {
            Some(ids) => ids,
            None => {
                let prompt = prompt.ok_or_else(|| {
                    Error::Config(
                        "add_request needs a prompt or prompt_token_ids".to_string(),
                    )
                })?;
                self.tokenizer.encode(prompt)?
            }
        };

        let mut seq = Sequence::new(
            self.seq_counter.next(),
            prompt.map(str::to_owned),
            prompt_token_ids,
            self.config.cache.block_size,
            arrived_at,
        );
        if let Err(err) = sampling_params.verify() {
            warn!(%request_id, %err, "rejecting request with invalid sampling params");
            seq.set_status(SequenceStatus::FinishedIgnored);
        }

        let group = SequenceGroup::new(
            request_id,
            vec![seq],
            sampling_params,
            arrival_time,
            arrived_at,
        );
        self.metrics.on_request_arrival(&group);
        self.scheduler.add_seq_group(group);
        Ok(())
    }

    /// Abort a request. Effective from the next step; idempotent.
    pub fn abort_request(&mut self, request_id: &str) -> Result<()> {
        self.scheduler.abort_seq_group(request_id)
    }

    pub fn abort_requests<I, S>(&mut self, request_ids: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for request_id in request_ids {
            self.scheduler.abort_seq_group(request_id.as_ref())?;
        }
        Ok(())
    }

    /// Perform one decoding iteration.
    ///
    /// Returns a `RequestOutput` for every group touched this step:
    /// incremental state for unfinished groups, final state for finished
    /// and ignored ones.
    pub fn step(&mut self) -> Result<Vec<RequestOutput>> {
        let (metadata, mut sched_out) = self.scheduler.schedule()?;
        let eos = self.tokenizer.eos_token_id();

        let mut ignored: Vec<RequestOutput> = sched_out
            .ignored_seq_groups
            .iter()
            .map(|group| RequestOutput::from_seq_group(group, eos))
            .collect();
        if sched_out.is_empty() {
            return Ok(ignored);
        }

        let batch = ExecutionBatch {
            seq_group_metadata: metadata,
            blocks_to_swap_in: sched_out.blocks_to_swap_in.clone(),
            blocks_to_swap_out: sched_out.blocks_to_swap_out.clone(),
            blocks_to_copy: sched_out.blocks_to_copy.clone(),
        };
        let (sampler_output, model_execution_time) = self.executor.execute_model(&batch)?;

        let mut processor = OutputProcessor::new(
            self.scheduler.as_mut(),
            &self.tokenizer,
            &self.seq_counter,
            self.config.scheduler.max_model_len,
        );
        processor.process_outputs(
            &mut sched_out.scheduled_seq_groups,
            &sched_out.prompt_chunk_lens,
            &sampler_output,
        )?;

        let mut outputs: Vec<RequestOutput> = sched_out
            .scheduled_seq_groups
            .iter()
            .map(|group| RequestOutput::from_seq_group(group, eos))
            .collect();
        outputs.append(&mut ignored);

        self.metrics.on_batch_end(BatchEndRecord {
            num_prompt_tokens: sched_out.num_batched_prompt_tokens,
            num_generation_tokens: sched_out.num_batched_output_tokens,
            model_execution_time,
        });
        if self.metrics.config().enabled {
            self.log_system_stats(
                sched_out.num_batched_prompt_tokens,
                sched_out.num_batched_output_tokens,
            );
        }

        self.scheduler
            .step_finished(std::mem::take(&mut sched_out.scheduled_seq_groups));
        Ok(outputs)
    }

    pub fn has_unfinished_requests(&self) -> bool {
        self.scheduler.has_unfinished_seqs()
    }

    pub fn get_num_unfinished_requests(&self) -> usize {
        self.scheduler.get_num_unfinished_seq_groups()
    }

    pub fn get_model_config(&self) -> &ModelConfig {
        &self.config.model
    }

    pub fn get_metric_store(&self) -> Arc<MetricsStore> {
        Arc::clone(&self.metrics)
    }

    pub fn start_profiling(&mut self) -> Result<()> {
        self.executor.start_profiling()
    }

    pub fn stop_profiling(&mut self) -> Result<()> {
        self.executor.stop_profiling()
    }

    pub fn reset_metrics(&mut self) -> Result<()> {
        self.metrics.reset();
        self.executor.reset_metrics()
    }

    /// Fold the workers' metric counters into the engine store. A no-op
    /// for single-worker deployments, where the worker shares the store.
    pub fn pull_worker_metrics(&mut self) -> Result<()> {
        if self.config.parallel.world_size() == 1 {
            return Ok(());
        }
        for snapshot in self.executor.collect_metrics_snapshots()? {
            self.metrics.merge(&snapshot);
        }
        Ok(())
    }

    pub fn mark_initial_memory_profiling_done(&mut self) -> Result<()> {
        self.metrics.mark_initial_memory_profiling_done();
        self.executor.mark_initial_memory_profiling_done()
    }

    /// Throughput and queue-depth summary, logged at most once per
    /// configured interval.
    fn log_system_stats(&mut self, num_prompt_tokens: usize, num_generation_tokens: usize) {
        let now = Instant::now();
        self.prompt_token_window.push((now, num_prompt_tokens));
        self.generation_token_window
            .push((now, num_generation_tokens));

        let interval = Duration::from_secs(self.config.metrics.log_interval_secs);
        if now.duration_since(self.last_stats_log) < interval {
            return;
        }
        self.prompt_token_window
            .retain(|(t, _)| now.duration_since(*t) < interval);
        self.generation_token_window
            .retain(|(t, _)| now.duration_since(*t) < interval);

        let avg_prompt_throughput = window_throughput(&self.prompt_token_window, now);
        let avg_generation_throughput = window_throughput(&self.generation_token_window, now);

        let total_gpu_blocks = self.config.cache.num_gpu_blocks.unwrap_or(0);
        let gpu_cache_usage = if total_gpu_blocks > 0 {
            let used = total_gpu_blocks - self.scheduler.get_num_free_gpu_blocks();
            used as f32 / total_gpu_blocks as f32
        } else {
            0.0
        };
        let total_cpu_blocks = self.config.cache.num_cpu_blocks.unwrap_or(0);
        let cpu_cache_usage = if total_cpu_blocks > 0 {
            let used = total_cpu_blocks - self.scheduler.get_num_free_cpu_blocks();
            used as f32 / total_cpu_blocks as f32
        } else {
            0.0
        };

        info!(
            "Avg prompt throughput: {avg_prompt_throughput:.1} tokens/s, \
             Avg generation throughput: {avg_generation_throughput:.1} tokens/s, \
             Running: {} reqs, Swapped: {} reqs, Pending: {} reqs, \
             GPU KV cache usage: {:.1}%, CPU KV cache usage: {:.1}%",
            self.scheduler.num_running(),
            self.scheduler.num_swapped(),
            self.scheduler.num_waiting(),
            gpu_cache_usage * 100.0,
            cpu_cache_usage * 100.0,
        );
        self.last_stats_log = now;
    }
}

fn window_throughput(window: &[(Instant, usize)], now: Instant) -> f32 {
    if window.len() < 2 {
        return 0.0;
    }
    let total: usize = window[..window.len() - 1].iter().map(|(_, n)| n).sum();
    let span = now.duration_since(window[0].0).as_secs_f32();
    if span > 0.0 {
        total as f32 / span
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap as StdHashMap, VecDeque};

    use super::*;
    use crate::config::{CacheConfig, MetricsConfig, ParallelConfig, SchedulerConfig};
    use crate::engine::metrics::MetricsSnapshot;
    use crate::engine::sequence::SequenceOutputs;
    use crate::engine::types::FinishReason;
    use crate::engine::executor::WorkerStepOutput;
    use crate::tokenizer::test_support::word_tokenizer;

    fn init_test_logging() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .with_test_writer()
            .try_init();
    }

    /// Deterministic scripted worker: pops one token per sample. On a
    /// prompt step it emits `best_of` samples from the single parent, as
    /// the real sampler does; on decode steps one sample per sequence.
    struct MockWorker {
        script: VecDeque<Token>,
        gpu_blocks: usize,
    }

    impl MockWorker {
        fn boxed(script: &[Token]) -> Box<dyn Worker> {
            Box::new(Self {
                script: script.iter().copied().collect(),
                gpu_blocks: 64,
            })
        }

        fn next_token(&mut self) -> Token {
            self.script.pop_front().expect("script exhausted")
        }
    }

    impl Worker for MockWorker {
        fn init_model(&mut self, _rendezvous_id: u32) -> Result<()> {
            Ok(())
        }

        fn profile_num_available_blocks(
            &mut self,
            _block_size: usize,
            _gpu_memory_utilization: f32,
            _cpu_swap_space_bytes: u64,
        ) -> Result<(usize, usize)> {
            Ok((self.gpu_blocks, 64))
        }

        fn init_cache_engine(&mut self, _cache_config: &CacheConfig) -> Result<()> {
            Ok(())
        }

        fn execute_model(&mut self, batch: &ExecutionBatch) -> Result<WorkerStepOutput> {
            let mut sampler_output = Vec::new();
            for metadata in &batch.seq_group_metadata {
                let mut seq_ids: Vec<_> = metadata.seq_data.keys().copied().collect();
                seq_ids.sort_unstable();
                let mut samples = Vec::new();
                if metadata.prompt_chunk_len > 0 {
                    let parent = seq_ids[0];
                    for _ in 0..metadata.sampling_params.best_of {
                        let token = self.next_token();
                        samples.push(SequenceOutputs {
                            parent_seq_id: parent,
                            output_token: token,
                            logprobs: StdHashMap::from([(token, -0.1)]),
                            probs: None,
                        });
                    }
                } else {
                    for parent in seq_ids {
                        let token = self.next_token();
                        samples.push(SequenceOutputs {
                            parent_seq_id: parent,
                            output_token: token,
                            logprobs: StdHashMap::from([(token, -0.1)]),
                            probs: None,
                        });
                    }
                }
                sampler_output.push(samples);
            }
            Ok(WorkerStepOutput {
                sampler_output,
                execution_time: Duration::from_micros(100),
            })
        }

        fn get_gpu_id(&self) -> Result<usize> {
            Ok(0)
        }

        fn mark_initial_memory_profiling_done(&mut self) -> Result<()> {
            Ok(())
        }

        fn get_metrics_snapshot(&mut self) -> Result<MetricsSnapshot> {
            Ok(MetricsSnapshot::default())
        }

        fn reset_metrics(&mut self) -> Result<()> {
            Ok(())
        }

        fn start_profiling(&mut self) -> Result<()> {
            Ok(())
        }

        fn stop_profiling(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            cache: CacheConfig {
                block_size: 4,
                ..Default::default()
            },
            parallel: ParallelConfig::default(),
            scheduler: SchedulerConfig {
                max_model_len: 64,
                ..Default::default()
            },
            metrics: MetricsConfig::default(),
            ..Default::default()
        }
    }

    fn engine_with(script: &[Token], tokenizer: Tokenizer) -> Engine {
        init_test_logging();
        Engine::new(test_config(), tokenizer, vec![MockWorker::boxed(script)], 0).unwrap()
    }

    #[test]
    fn single_prompt_greedy_runs_to_length_cap() {
        let tokenizer =
            word_tokenizer(&[("The", 10), ("a", 20), ("b", 30), ("c", 40), ("d", 50)], None);
        let mut engine = engine_with(&[40, 50], tokenizer);
        engine
            .add_request("r1", None, SamplingParams::greedy(2), Some(vec![10, 20, 30]), None)
            .unwrap();
        assert!(engine.has_unfinished_requests());

        let outputs = engine.step().unwrap();
        assert_eq!(outputs.len(), 1);
        assert!(!outputs[0].finished);
        assert_eq!(outputs[0].outputs[0].token_ids, vec![40]);

        let outputs = engine.step().unwrap();
        assert_eq!(outputs.len(), 1);
        assert!(outputs[0].finished);
        let completion = &outputs[0].outputs[0];
        assert_eq!(completion.token_ids, vec![40, 50]);
        assert_eq!(completion.finish_reason, Some(FinishReason::LengthCapped));
        assert_eq!(completion.finish_reason.unwrap().as_str(), "length");
        assert!(!engine.has_unfinished_requests());
    }

    #[test]
    fn eos_stops_and_is_trimmed() {
        let eos = 99;
        let tokenizer =
            word_tokenizer(&[("The", 10), ("a", 20), ("b", 30), ("c", 40)], Some(eos));
        let mut engine = engine_with(&[40, eos], tokenizer);
        engine
            .add_request("r1", None, SamplingParams::greedy(10), Some(vec![10, 20, 30]), None)
            .unwrap();

        let outputs = engine.step().unwrap();
        assert!(!outputs[0].finished);

        let outputs = engine.step().unwrap();
        assert!(outputs[0].finished);
        let completion = &outputs[0].outputs[0];
        assert_eq!(completion.token_ids, vec![40]);
        assert_eq!(completion.finish_reason, Some(FinishReason::Stopped));
        // The EOS contributed no text either.
        assert_eq!(completion.text, " c");
    }

    #[test]
    fn stop_string_truncates_output_text() {
        let tokenizer = word_tokenizer(
            &[("The", 1), ("quick", 2), ("fox", 3), ("##END", 4)],
            None,
        );
        let mut engine = engine_with(&[2, 3, 4], tokenizer);
        let params = SamplingParams {
            temperature: 0.0,
            max_tokens: 16,
            stop: vec!["END".to_string()],
            ..Default::default()
        };
        engine
            .add_request("r1", Some("The"), params, None, None)
            .unwrap();

        let mut last = Vec::new();
        while engine.has_unfinished_requests() {
            last = engine.step().unwrap();
        }
        assert_eq!(last.len(), 1);
        assert!(last[0].finished);
        let completion = &last[0].outputs[0];
        assert_eq!(completion.text, " quick fox");
        assert_eq!(completion.finish_reason, Some(FinishReason::Stopped));
    }

    #[test]
    fn abort_takes_effect_next_step() {
        let tokenizer = word_tokenizer(&[("a", 5)], None);
        let mut engine = engine_with(&[5; 12], tokenizer);
        engine
            .add_request("r1", None, SamplingParams::greedy(8), Some(vec![1, 2, 3, 4]), None)
            .unwrap();
        engine
            .add_request("r2", None, SamplingParams::greedy(8), Some(vec![1, 2, 3, 4]), None)
            .unwrap();

        let outputs = engine.step().unwrap();
        assert_eq!(outputs.len(), 2);

        engine.abort_request("r1").unwrap();
        assert_eq!(engine.get_num_unfinished_requests(), 1);

        let outputs = engine.step().unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].request_id, "r2");
        assert!(engine.has_unfinished_requests());

        // Idempotent, including for ids that never existed.
        engine.abort_request("r1").unwrap();
        engine.abort_requests(["r2", "r9"]).unwrap();
        assert!(!engine.has_unfinished_requests());
    }

    #[test]
    fn invalid_sampling_params_surface_as_ignored() {
        let tokenizer = word_tokenizer(&[("a", 5)], None);
        let mut engine = engine_with(&[], tokenizer);
        let params = SamplingParams {
            n: 3,
            best_of: 2,
            ..Default::default()
        };
        engine
            .add_request("bad", None, params, Some(vec![1, 2]), None)
            .unwrap();

        let outputs = engine.step().unwrap();
        assert_eq!(outputs.len(), 1);
        assert!(outputs[0].finished);
        assert_eq!(
            outputs[0].outputs[0].finish_reason,
            Some(FinishReason::Ignored)
        );
        assert!(!engine.has_unfinished_requests());
    }

    #[test]
    fn n_two_returns_two_completions() {
        let tokenizer = word_tokenizer(&[("a", 5), ("b", 6)], None);
        // Prompt step emits best_of samples, then one per running seq.
        let mut engine = engine_with(&[5, 6, 5, 6], tokenizer);
        let params = SamplingParams {
            n: 2,
            best_of: 2,
            max_tokens: 2,
            ..Default::default()
        };
        engine
            .add_request("r1", None, params, Some(vec![1, 2, 3]), None)
            .unwrap();

        let outputs = engine.step().unwrap();
        assert_eq!(outputs[0].outputs.len(), 2);
        assert!(!outputs[0].finished);

        let outputs = engine.step().unwrap();
        assert!(outputs[0].finished);
        assert_eq!(outputs[0].outputs.len(), 2);
        for completion in &outputs[0].outputs {
            assert_eq!(completion.token_ids.len(), 2);
            assert_eq!(completion.finish_reason, Some(FinishReason::LengthCapped));
        }
    }

    #[test]
    fn greedy_runs_are_deterministic() {
        let run = || {
            let tokenizer = word_tokenizer(&[("c", 40), ("d", 50)], None);
            let mut engine = engine_with(&[40, 50, 40], tokenizer);
            engine
                .add_request("r1", None, SamplingParams::greedy(3), Some(vec![10, 20]), None)
                .unwrap();
            let mut tokens = Vec::new();
            while engine.has_unfinished_requests() {
                let outputs = engine.step().unwrap();
                if outputs[0].finished {
                    tokens = outputs[0].outputs[0].token_ids.clone();
                }
            }
            tokens
        };
        assert_eq!(run(), run());
    }
}
