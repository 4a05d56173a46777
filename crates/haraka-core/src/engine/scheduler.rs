//! Iteration-level request scheduling.
//!
//! The engine consumes a scheduler through the narrow `Scheduler` trait and
//! never inspects policy internals. Policies are picked by name from a
//! registry at engine construction. Each policy owns the KV cache manager:
//! block movement decisions are part of scheduling, and the per-step plan
//! it emits carries both the groups to run and the swap/copy directives the
//! workers must apply first.

use std::collections::{HashMap, VecDeque};

use tracing::{debug, warn};

use super::kv_cache::{AllocStatus, KVCacheManager};
use super::sequence::{
    SequenceData, SequenceGroup, SequenceGroupMetadata, SequenceStatus,
};
use super::types::{BlockId, SeqId};
use crate::config::{CacheConfig, SchedulerConfig};
use crate::error::{Error, Result};

/// The per-step plan: scheduled groups plus block movement directives.
#[derive(Default)]
pub struct SchedulerOutputs {
    /// Groups to execute this step, moved out of the scheduler's queues.
    /// They are handed back through `Scheduler::step_finished`.
    pub scheduled_seq_groups: Vec<SequenceGroup>,
    /// Prompt tokens prefilled per scheduled group; 0 for pure decode.
    pub prompt_chunk_lens: Vec<usize>,
    pub blocks_to_swap_in: HashMap<BlockId, BlockId>,
    pub blocks_to_swap_out: HashMap<BlockId, BlockId>,
    pub blocks_to_copy: HashMap<BlockId, Vec<BlockId>>,
    /// Groups rejected this step (prompt too long, invalid params).
    pub ignored_seq_groups: Vec<SequenceGroup>,
    pub num_batched_prompt_tokens: usize,
    pub num_batched_output_tokens: usize,
}

impl SchedulerOutputs {
    pub fn is_empty(&self) -> bool {
        self.scheduled_seq_groups.is_empty()
            && self.blocks_to_swap_in.is_empty()
            && self.blocks_to_swap_out.is_empty()
            && self.blocks_to_copy.is_empty()
    }
}

/// Contract between the engine core and a scheduling policy.
pub trait Scheduler {
    /// Admit a group into the waiting set.
    fn add_seq_group(&mut self, group: SequenceGroup);

    /// Abort a request wherever it is queued. Member sequences become
    /// FINISHED_ABORTED and their blocks are freed. Idempotent.
    fn abort_seq_group(&mut self, request_id: &str) -> Result<()>;

    /// Compute the next step's plan.
    fn schedule(&mut self) -> Result<(Vec<SequenceGroupMetadata>, SchedulerOutputs)>;

    /// Hand back the groups of a completed step. Unfinished groups rejoin
    /// the running set; finished ones are released.
    fn step_finished(&mut self, groups: Vec<SequenceGroup>);

    /// Register a fork with the block manager. All forks of a step must
    /// precede any frees.
    fn fork_seq(&mut self, parent: SeqId, child: SeqId) -> Result<()>;

    /// Release a sequence's blocks.
    fn free_seq(&mut self, seq_id: SeqId) -> Result<()>;

    /// Drop any fully finished groups still held in the queues.
    fn free_finished_seq_groups(&mut self);

    fn get_num_unfinished_seq_groups(&self) -> usize;
    fn has_unfinished_seqs(&self) -> bool;
    fn num_waiting(&self) -> usize;
    fn num_running(&self) -> usize;
    fn num_swapped(&self) -> usize;
    fn get_num_free_gpu_blocks(&self) -> usize;
    fn get_num_free_cpu_blocks(&self) -> usize;
}

type SchedulerFactory = fn(SchedulerConfig, &CacheConfig) -> Result<Box<dyn Scheduler>>;

/// Name-keyed construction of scheduling policies.
pub struct SchedulerRegistry {
    factories: HashMap<String, SchedulerFactory>,
}

impl Default for SchedulerRegistry {
    fn default() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register("fcfs", |config, cache| {
            let scheduler: Box<dyn Scheduler> = Box::new(FcfsScheduler::new(config, cache)?);
            Ok(scheduler)
        });
        registry
    }
}

impl SchedulerRegistry {
    pub fn register(&mut self, name: &str, factory: SchedulerFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn create(
        &self,
        name: &str,
        config: SchedulerConfig,
        cache_config: &CacheConfig,
    ) -> Result<Box<dyn Scheduler>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::UnknownScheduler(name.to_string()))?;
        factory(config, cache_config)
    }
}

/// How a running group is evicted when the GPU pool runs dry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PreemptionMode {
    /// Drop the generated tokens and prefill the prompt again later.
    Recompute,
    /// Move the KV blocks to the CPU pool.
    Swap,
}

/// First-come first-served policy with preemption and optional chunked
/// prefill.
pub struct FcfsScheduler {
    config: SchedulerConfig,
    block_manager: KVCacheManager,
    waiting: VecDeque<SequenceGroup>,
    running: VecDeque<SequenceGroup>,
    swapped: VecDeque<SequenceGroup>,
}

impl FcfsScheduler {
    pub fn new(config: SchedulerConfig, cache_config: &CacheConfig) -> Result<Self> {
        let num_gpu_blocks = cache_config
            .num_gpu_blocks
            .ok_or_else(|| Error::Config("num_gpu_blocks not profiled yet".to_string()))?;
        let num_cpu_blocks = cache_config
            .num_cpu_blocks
            .ok_or_else(|| Error::Config("num_cpu_blocks not profiled yet".to_string()))?;
        Ok(Self {
            config,
            block_manager: KVCacheManager::new(
                cache_config.block_size,
                num_gpu_blocks,
                num_cpu_blocks,
            ),
            waiting: VecDeque::new(),
            running: VecDeque::new(),
            swapped: VecDeque::new(),
        })
    }

    fn prompt_finished(group: &SequenceGroup) -> bool {
        group
            .get_seqs(Some(SequenceStatus::Running))
            .iter()
            .all(|seq| seq.is_prompt_processing_finished())
    }

    fn remaining_prompt(group: &SequenceGroup) -> usize {
        group
            .get_seqs(Some(SequenceStatus::Running))
            .first()
            .map(|seq| seq.remaining_prompt_tokens())
            .unwrap_or(0)
    }

    /// Evict a running group. Single-sequence groups are recomputed (their
    /// generated tokens are aborted); multi-sequence groups are swapped so
    /// shared fork state survives.
    fn preempt(
        &mut self,
        mut group: SequenceGroup,
        blocks_to_swap_out: &mut HashMap<BlockId, BlockId>,
    ) -> Result<()> {
        let mode = if group.get_max_num_running_seqs() == 1 {
            PreemptionMode::Recompute
        } else {
            PreemptionMode::Swap
        };
        debug!(request_id = %group.request_id, ?mode, "preempting group");

        match mode {
            PreemptionMode::Recompute => {
                for seq in group.seqs_mut() {
                    if seq.status() != SequenceStatus::Running {
                        continue;
                    }
                    seq.set_status(SequenceStatus::Waiting);
                }
                for seq in group.get_seqs(Some(SequenceStatus::Waiting)) {
                    self.block_manager.free(seq.seq_id)?;
                }
                for seq in group.seqs_mut() {
                    if seq.status() == SequenceStatus::Waiting {
                        seq.reset_for_recompute();
                    }
                }
                // Preempted groups keep their arrival priority.
                self.waiting.push_front(group);
            }
            PreemptionMode::Swap => {
                if !self.block_manager.can_swap_out(&group) {
                    return Err(Error::SwapSpaceExhausted(format!(
                        "cannot swap out request {}; increase swap_space_bytes",
                        group.request_id
                    )));
                }
                let mapping = self.block_manager.swap_out(&group)?;
                blocks_to_swap_out.extend(mapping);
                for seq in group.seqs_mut() {
                    if seq.status() == SequenceStatus::Running {
                        seq.set_status(SequenceStatus::Swapped);
                    }
                }
                self.swapped.push_back(group);
            }
        }
        Ok(())
    }

    /// Block accounting check, for debug builds and tests.
    pub fn check_block_manager_integrity(&self) -> Result<()> {
        self.block_manager.check_integrity()
    }

    fn build_metadata(
        &self,
        group: &SequenceGroup,
        prompt_chunk_len: usize,
    ) -> SequenceGroupMetadata {
        let mut seq_data = HashMap::new();
        let mut block_tables = HashMap::new();
        for seq in group.get_seqs(Some(SequenceStatus::Running)) {
            seq_data.insert(
                seq.seq_id,
                SequenceData {
                    len: seq.get_len(),
                    prompt_len: seq.get_prompt_len(),
                    last_token_id: seq.get_last_token_id(),
                },
            );
            block_tables.insert(
                seq.seq_id,
                self.block_manager
                    .get_block_table(seq.seq_id)
                    .unwrap_or_default()
                    .to_vec(),
            );
        }
        SequenceGroupMetadata {
            request_id: group.request_id.clone(),
            prompt_chunk_len,
            sampling_params: group.sampling_params.clone(),
            seq_data,
            block_tables,
        }
    }
}

impl Scheduler for FcfsScheduler {
    fn add_seq_group(&mut self, group: SequenceGroup) {
        debug!(
            request_id = %group.request_id,
            prompt_tokens = group.get_seqs(None).first().map(|s| s.get_prompt_len()).unwrap_or(0),
            "request queued"
        );
        self.waiting.push_back(group);
    }

    fn abort_seq_group(&mut self, request_id: &str) -> Result<()> {
        for queue in [&mut self.waiting, &mut self.running, &mut self.swapped] {
            let Some(idx) = queue.iter().position(|g| g.request_id == request_id) else {
                continue;
            };
            let mut group = queue.remove(idx).expect("index from position");
            for seq in group.seqs_mut() {
                if !seq.is_finished() {
                    seq.set_status(SequenceStatus::FinishedAborted);
                }
            }
            for seq in group.get_seqs(None) {
                self.block_manager.free(seq.seq_id)?;
            }
            debug!(request_id, "request aborted");
            return Ok(());
        }
        // Unknown or already finished: aborting is idempotent.
        Ok(())
    }

    fn schedule(&mut self) -> Result<(Vec<SequenceGroupMetadata>, SchedulerOutputs)> {
        let mut outputs = SchedulerOutputs::default();
        let mut chunk_lens: Vec<usize> = Vec::new();
        let mut scheduled: Vec<SequenceGroup> = Vec::new();
        let mut unscheduled: Vec<SequenceGroup> = Vec::new();
        let mut preempted_this_step = false;

        // FCFS priority: earliest arrival first.
        self.running
            .make_contiguous()
            .sort_by_key(|group| group.arrived_at);

        // Phase 1: keep the running set running. Decode groups claim one
        // slot per sequence, preempting the newest arrivals when the GPU
        // pool is exhausted; groups mid-prefill get their next prompt
        // chunk, subject to the token budget.
        'groups: while let Some(group) = self.running.pop_front() {
            if !Self::prompt_finished(&group) {
                let remaining = Self::remaining_prompt(&group);
                let chunk_cap = if self.config.enable_chunked_prefill {
                    self.config.chunk_size
                } else {
                    remaining
                };
                let budget_left = self
                    .config
                    .max_num_batched_tokens
                    .saturating_sub(outputs.num_batched_prompt_tokens);
                let chunk = remaining.min(chunk_cap).min(budget_left);
                if chunk == 0 {
                    unscheduled.push(group);
                    continue;
                }
                outputs.num_batched_prompt_tokens += chunk;
                chunk_lens.push(chunk);
                scheduled.push(group);
                continue;
            }

            loop {
                if self.block_manager.can_append_slot(&group) {
                    for seq in group.get_seqs(Some(SequenceStatus::Running)) {
                        if let Some((src, dst)) = self.block_manager.append_slot(seq)? {
                            outputs.blocks_to_copy.entry(src).or_default().push(dst);
                        }
                    }
                    outputs.num_batched_output_tokens +=
                        group.num_seqs(Some(SequenceStatus::Running));
                    chunk_lens.push(0);
                    scheduled.push(group);
                    continue 'groups;
                }
                // Out of GPU blocks: evict the lowest-priority group.
                preempted_this_step = true;
                match self.running.pop_back() {
                    Some(victim) => self.preempt(victim, &mut outputs.blocks_to_swap_out)?,
                    None => {
                        self.preempt(group, &mut outputs.blocks_to_swap_out)?;
                        continue 'groups;
                    }
                }
            }
        }

        let mut num_curr_seqs: usize = scheduled
            .iter()
            .chain(unscheduled.iter())
            .map(|g| g.get_max_num_running_seqs())
            .sum();

        // Phase 2: bring swapped groups back before admitting new work, but
        // never in a step that just preempted.
        if !preempted_this_step {
            while let Some(group) = self.swapped.front() {
                if !self.block_manager.can_swap_in(group) {
                    break;
                }
                if num_curr_seqs + group.get_max_num_running_seqs() > self.config.max_num_seqs {
                    break;
                }
                let mut group = self.swapped.pop_front().expect("front checked");
                let mapping = self.block_manager.swap_in(&group)?;
                outputs.blocks_to_swap_in.extend(mapping);
                for seq in group.seqs_mut() {
                    if seq.status() == SequenceStatus::Swapped {
                        seq.set_status(SequenceStatus::Running);
                    }
                }
                for seq in group.get_seqs(Some(SequenceStatus::Running)) {
                    if let Some((src, dst)) = self.block_manager.append_slot(seq)? {
                        outputs.blocks_to_copy.entry(src).or_default().push(dst);
                    }
                }
                num_curr_seqs += group.get_max_num_running_seqs();
                outputs.num_batched_output_tokens +=
                    group.num_seqs(Some(SequenceStatus::Running));
                chunk_lens.push(0);
                scheduled.push(group);
            }
        }

        // Phase 3: admit waiting groups while every budget holds. Resuming
        // swapped work takes priority over new prompts.
        if self.swapped.is_empty() && !preempted_this_step {
            while let Some(group) = self.waiting.front() {
                // Requests invalidated at submission pass straight through.
                if group.is_finished() {
                    let group = self.waiting.pop_front().expect("front checked");
                    outputs.ignored_seq_groups.push(group);
                    continue;
                }

                let prompt_len = group
                    .get_seqs(None)
                    .first()
                    .map(|s| s.get_prompt_len())
                    .unwrap_or(0);
                if prompt_len > self.config.max_model_len {
                    warn!(
                        request_id = %group.request_id,
                        prompt_len,
                        max_model_len = self.config.max_model_len,
                        "prompt exceeds model length, ignoring request"
                    );
                    let mut group = self.waiting.pop_front().expect("front checked");
                    for seq in group.seqs_mut() {
                        seq.set_status(SequenceStatus::FinishedIgnored);
                    }
                    outputs.ignored_seq_groups.push(group);
                    continue;
                }

                match self.block_manager.can_allocate(group) {
                    AllocStatus::Ok => {}
                    AllocStatus::Later => break,
                    AllocStatus::Never => {
                        warn!(
                            request_id = %group.request_id,
                            "prompt can never fit in the KV cache, ignoring request"
                        );
                        let mut group = self.waiting.pop_front().expect("front checked");
                        for seq in group.seqs_mut() {
                            seq.set_status(SequenceStatus::FinishedIgnored);
                        }
                        outputs.ignored_seq_groups.push(group);
                        continue;
                    }
                }

                let chunk = if self.config.enable_chunked_prefill {
                    prompt_len.min(self.config.chunk_size)
                } else {
                    prompt_len
                };
                if outputs.num_batched_prompt_tokens + chunk > self.config.max_num_batched_tokens
                {
                    break;
                }
                if num_curr_seqs + group.get_max_num_running_seqs() > self.config.max_num_seqs {
                    break;
                }

                let mut group = self.waiting.pop_front().expect("front checked");
                self.block_manager.allocate(&group)?;
                for seq in group.seqs_mut() {
                    seq.set_status(SequenceStatus::Running);
                }
                num_curr_seqs += group.get_max_num_running_seqs();
                outputs.num_batched_prompt_tokens += chunk;
                chunk_lens.push(chunk);
                scheduled.push(group);
            }
        }

        self.running = unscheduled.into();

        let metadata = scheduled
            .iter()
            .zip(&chunk_lens)
            .map(|(group, chunk)| self.build_metadata(group, *chunk))
            .collect();
        outputs.prompt_chunk_lens = chunk_lens;
        outputs.scheduled_seq_groups = scheduled;
        Ok((metadata, outputs))
    }

    fn step_finished(&mut self, groups: Vec<SequenceGroup>) {
        for group in groups {
            if group.is_finished() {
                debug!(request_id = %group.request_id, "request finished");
            } else {
                self.running.push_back(group);
            }
        }
        self.free_finished_seq_groups();
    }

    fn fork_seq(&mut self, parent: SeqId, child: SeqId) -> Result<()> {
        self.block_manager.fork(parent, child)
    }

    fn free_seq(&mut self, seq_id: SeqId) -> Result<()> {
        self.block_manager.free(seq_id)
    }

    fn free_finished_seq_groups(&mut self) {
        self.running.retain(|group| !group.is_finished());
    }

    fn get_num_unfinished_seq_groups(&self) -> usize {
        self.waiting.len() + self.running.len() + self.swapped.len()
    }

    fn has_unfinished_seqs(&self) -> bool {
        self.get_num_unfinished_seq_groups() > 0
    }

    fn num_waiting(&self) -> usize {
        self.waiting.len()
    }

    fn num_running(&self) -> usize {
        self.running.len()
    }

    fn num_swapped(&self) -> usize {
        self.swapped.len()
    }

    fn get_num_free_gpu_blocks(&self) -> usize {
        self.block_manager.get_num_free_gpu_blocks()
    }

    fn get_num_free_cpu_blocks(&self) -> usize {
        self.block_manager.get_num_free_cpu_blocks()
    }
}
