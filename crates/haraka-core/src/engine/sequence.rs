//! Sequences, sequence groups, and the value objects exchanged with
//! workers.
//!
//! A `Sequence` is a single token stream (prompt plus generated tokens)
//! together with its scheduling status, detokenizer state, and KV-block
//! bookkeeping inputs. A `SequenceGroup` is every sequence spawned by one
//! client request; beam search and `n > 1` sampling fork new member
//! sequences at runtime.

use std::collections::HashMap;
use std::time::{Instant, SystemTime};

use serde::{Deserialize, Serialize};

use super::sampling::SamplingParams;
use super::types::{BlockId, FinishReason, RequestId, SeqId, Token};

/// Scheduling status of a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceStatus {
    Waiting,
    Running,
    Swapped,
    FinishedStopped,
    FinishedLengthCapped,
    FinishedAborted,
    FinishedIgnored,
}

impl SequenceStatus {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            SequenceStatus::FinishedStopped
                | SequenceStatus::FinishedLengthCapped
                | SequenceStatus::FinishedAborted
                | SequenceStatus::FinishedIgnored
        )
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        match self {
            SequenceStatus::FinishedStopped => Some(FinishReason::Stopped),
            SequenceStatus::FinishedLengthCapped => Some(FinishReason::LengthCapped),
            SequenceStatus::FinishedAborted => Some(FinishReason::Aborted),
            SequenceStatus::FinishedIgnored => Some(FinishReason::Ignored),
            _ => None,
        }
    }
}

/// A single token stream.
#[derive(Debug, Clone)]
pub struct Sequence {
    pub seq_id: SeqId,
    /// Prompt text, kept only for echoing in outputs.
    pub prompt: Option<String>,
    /// Prompt tokens followed by generated tokens.
    token_ids: Vec<Token>,
    prompt_len: usize,
    block_size: usize,
    status: SequenceStatus,
    pub cumulative_logprob: f32,
    /// Logprob map per generated token, in generation order.
    pub output_logprobs: Vec<HashMap<Token, f32>>,
    /// Full sampler probability vector per generated token, when the
    /// worker was asked to return one.
    pub output_probs: Vec<Option<Vec<f32>>>,

    /// Prompt tokens consumed so far under chunked prefill.
    prompt_tokens_processed: usize,
    prompt_processing_finished: bool,

    // Incremental detokenizer state.
    pub tokens: Option<Vec<String>>,
    pub prefix_offset: usize,
    pub read_offset: usize,
    pub output_text: String,

    /// Monotonic arrival stamp used by scheduling policies.
    pub arrived_at: Instant,
}

impl Sequence {
    pub fn new(
        seq_id: SeqId,
        prompt: Option<String>,
        prompt_token_ids: Vec<Token>,
        block_size: usize,
        arrived_at: Instant,
    ) -> Self {
        let prompt_len = prompt_token_ids.len();
        Self {
            seq_id,
            prompt,
            token_ids: prompt_token_ids,
            prompt_len,
            block_size,
            status: SequenceStatus::Waiting,
            cumulative_logprob: 0.0,
            output_logprobs: Vec::new(),
            output_probs: Vec::new(),
            prompt_tokens_processed: 0,
            prompt_processing_finished: false,
            tokens: None,
            prefix_offset: 0,
            read_offset: 0,
            output_text: String::new(),
            arrived_at,
        }
    }

    pub fn get_len(&self) -> usize {
        self.token_ids.len()
    }

    pub fn get_prompt_len(&self) -> usize {
        self.prompt_len
    }

    pub fn get_output_len(&self) -> usize {
        self.token_ids.len() - self.prompt_len
    }

    pub fn get_token_ids(&self) -> &[Token] {
        &self.token_ids
    }

    pub fn output_token_ids(&self) -> &[Token] {
        &self.token_ids[self.prompt_len..]
    }

    pub fn get_last_token_id(&self) -> Option<Token> {
        self.token_ids.last().copied()
    }

    pub fn status(&self) -> SequenceStatus {
        self.status
    }

    pub fn set_status(&mut self, status: SequenceStatus) {
        self.status = status;
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_finished()
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.status.finish_reason()
    }

    pub fn is_prompt_processing_finished(&self) -> bool {
        self.prompt_processing_finished
    }

    pub fn remaining_prompt_tokens(&self) -> usize {
        self.prompt_len - self.prompt_tokens_processed
    }

    /// Apply one step's sample to this sequence.
    ///
    /// While the prompt is still being prefilled, only the chunk progress
    /// advances; the sampled token is meaningless and is discarded. On the
    /// step that consumes the last prompt token the flag flips and the
    /// sample becomes real.
    pub fn append_token_id(
        &mut self,
        token_id: Token,
        logprobs: HashMap<Token, f32>,
        probs: Option<Vec<f32>>,
        prompt_chunk_len: usize,
    ) {
        if !self.prompt_processing_finished {
            self.prompt_tokens_processed += prompt_chunk_len;
            debug_assert!(self.prompt_tokens_processed <= self.prompt_len);
            if self.prompt_tokens_processed < self.prompt_len {
                return;
            }
            self.prompt_processing_finished = true;
        }
        self.cumulative_logprob += logprobs.get(&token_id).copied().unwrap_or(0.0);
        self.token_ids.push(token_id);
        self.output_logprobs.push(logprobs);
        self.output_probs.push(probs);
    }

    /// Roll the sequence back to its un-prefilled prompt.
    ///
    /// Used by recompute-preemption: generated tokens are aborted and the
    /// prompt will be prefilled again from scratch on re-admission.
    pub fn reset_for_recompute(&mut self) {
        self.token_ids.truncate(self.prompt_len);
        self.cumulative_logprob = 0.0;
        self.output_logprobs.clear();
        self.output_probs.clear();
        self.prompt_tokens_processed = 0;
        self.prompt_processing_finished = false;
        self.tokens = None;
        self.prefix_offset = 0;
        self.read_offset = 0;
        self.output_text.clear();
    }

    /// Number of logical KV blocks this sequence occupies.
    pub fn num_logical_blocks(&self) -> usize {
        (self.token_ids.len() + self.block_size - 1) / self.block_size
    }

    /// Tokens stored in the last, possibly partial, logical block.
    pub fn last_block_num_tokens(&self) -> usize {
        let num_blocks = self.num_logical_blocks();
        if num_blocks == 0 {
            0
        } else {
            self.token_ids.len() - (num_blocks - 1) * self.block_size
        }
    }

    /// Create a new sequence sharing this one's entire history.
    ///
    /// The physical KV blocks are shared by reference; the caller must
    /// register the fork with the block manager so refcounts are bumped.
    pub fn fork(&self, new_seq_id: SeqId) -> Sequence {
        let mut child = self.clone();
        child.seq_id = new_seq_id;
        child
    }

    /// Beam-search score: `cumulative_logprob / len^length_penalty`.
    ///
    /// A trailing EOS is excluded from the length; `seq_len` overrides the
    /// length for highest-attainable-score estimation.
    pub fn get_beam_search_score(
        &self,
        length_penalty: f32,
        eos_token_id: Option<Token>,
        seq_len: Option<usize>,
    ) -> f32 {
        let len = match seq_len {
            Some(len) => len,
            None => {
                let mut len = self.get_len();
                if eos_token_id.is_some() && self.get_last_token_id() == eos_token_id {
                    len -= 1;
                }
                len
            }
        };
        self.cumulative_logprob / (len as f32).powf(length_penalty)
    }
}

/// Every sequence spawned by a single client request.
#[derive(Debug)]
pub struct SequenceGroup {
    pub request_id: RequestId,
    seqs: Vec<Sequence>,
    pub sampling_params: SamplingParams,
    /// Wall-clock arrival, echoed to clients.
    pub arrival_time: SystemTime,
    /// Monotonic arrival, used for scheduling order.
    pub arrived_at: Instant,
}

impl SequenceGroup {
    pub fn new(
        request_id: RequestId,
        seqs: Vec<Sequence>,
        sampling_params: SamplingParams,
        arrival_time: SystemTime,
        arrived_at: Instant,
    ) -> Self {
        Self {
            request_id,
            seqs,
            sampling_params,
            arrival_time,
            arrived_at,
        }
    }

    pub fn get_seqs(&self, status: Option<SequenceStatus>) -> Vec<&Sequence> {
        match status {
            Some(filter) => self.seqs.iter().filter(|s| s.status() == filter).collect(),
            None => self.seqs.iter().collect(),
        }
    }

    pub fn seqs_mut(&mut self) -> &mut [Sequence] {
        &mut self.seqs
    }

    pub fn num_seqs(&self, status: Option<SequenceStatus>) -> usize {
        self.get_seqs(status).len()
    }

    pub fn get(&self, seq_id: SeqId) -> Option<&Sequence> {
        self.seqs.iter().find(|s| s.seq_id == seq_id)
    }

    pub fn get_mut(&mut self, seq_id: SeqId) -> Option<&mut Sequence> {
        self.seqs.iter_mut().find(|s| s.seq_id == seq_id)
    }

    pub fn add(&mut self, seq: Sequence) {
        debug_assert!(self.get(seq.seq_id).is_none());
        self.seqs.push(seq);
    }

    pub fn remove(&mut self, seq_id: SeqId) -> Option<Sequence> {
        let idx = self.seqs.iter().position(|s| s.seq_id == seq_id)?;
        Some(self.seqs.remove(idx))
    }

    pub fn get_finished_seqs(&self) -> Vec<&Sequence> {
        self.seqs.iter().filter(|s| s.is_finished()).collect()
    }

    /// Upper bound on sequences this group can have running at once for the
    /// rest of its lifetime.
    pub fn get_max_num_running_seqs(&self) -> usize {
        if self.sampling_params.use_beam_search {
            // Beam search keeps at most `best_of` candidates alive.
            self.sampling_params.best_of
        } else if self.sampling_params.best_of > self.num_seqs(None) {
            // At the prompt stage only one sequence exists, but sampling
            // will fork up to `best_of` of them.
            self.sampling_params.best_of
        } else {
            self.num_seqs(Some(SequenceStatus::Running))
        }
    }

    pub fn is_finished(&self) -> bool {
        self.seqs.iter().all(|s| s.is_finished())
    }
}

/// Per-sequence data shipped to workers inside the step plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceData {
    pub len: usize,
    pub prompt_len: usize,
    pub last_token_id: Option<Token>,
}

/// What a worker needs to know about one scheduled group for one step.
#[derive(Debug, Clone)]
pub struct SequenceGroupMetadata {
    pub request_id: RequestId,
    /// Prompt tokens being prefilled this step; 0 for pure decode.
    pub prompt_chunk_len: usize,
    pub sampling_params: SamplingParams,
    pub seq_data: HashMap<SeqId, SequenceData>,
    pub block_tables: HashMap<SeqId, Vec<BlockId>>,
}

/// One sampled token as produced by the worker's sampler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceOutputs {
    /// The running sequence this sample continues.
    pub parent_seq_id: SeqId,
    pub output_token: Token,
    pub logprobs: HashMap<Token, f32>,
    #[serde(default)]
    pub probs: Option<Vec<f32>>,
}

/// Sampler output for one step: per scheduled group, its samples.
pub type SamplerOutput = Vec<Vec<SequenceOutputs>>;

/// One member sequence's view in a `RequestOutput`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionOutput {
    pub seq_id: SeqId,
    pub text: String,
    pub token_ids: Vec<Token>,
    pub cumulative_logprob: f32,
    pub finish_reason: Option<FinishReason>,
}

/// Everything the engine reports for one request after a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestOutput {
    pub request_id: RequestId,
    pub prompt: Option<String>,
    pub outputs: Vec<CompletionOutput>,
    pub finished: bool,
}

impl RequestOutput {
    /// Snapshot a group into a client-facing output.
    ///
    /// Every member is reported, finished or not. A trailing EOS token is
    /// trimmed from the emitted token ids; skip-special detokenization has
    /// already kept it out of the text.
    pub fn from_seq_group(group: &SequenceGroup, eos_token_id: Option<Token>) -> Self {
        let outputs = group
            .get_seqs(None)
            .into_iter()
            .map(|seq| {
                let mut token_ids = seq.output_token_ids().to_vec();
                if let Some(eos) = eos_token_id {
                    if !group.sampling_params.ignore_eos && token_ids.last() == Some(&eos) {
                        token_ids.pop();
                    }
                }
                CompletionOutput {
                    seq_id: seq.seq_id,
                    text: seq.output_text.clone(),
                    token_ids,
                    cumulative_logprob: seq.cumulative_logprob,
                    finish_reason: seq.finish_reason(),
                }
            })
            .collect();
        Self {
            request_id: group.request_id.clone(),
            prompt: group.get_seqs(None).first().and_then(|s| s.prompt.clone()),
            outputs,
            finished: group.is_finished(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq(prompt_ids: Vec<Token>, block_size: usize) -> Sequence {
        Sequence::new(0, None, prompt_ids, block_size, Instant::now())
    }

    #[test]
    fn chunked_prompt_progress() {
        let mut s = seq(vec![1, 2, 3, 4, 5], 16);
        assert!(!s.is_prompt_processing_finished());

        // First chunk consumes 3 of 5 prompt tokens; the sample is dropped.
        s.append_token_id(99, HashMap::new(), None, 3);
        assert!(!s.is_prompt_processing_finished());
        assert_eq!(s.get_len(), 5);
        assert_eq!(s.remaining_prompt_tokens(), 2);

        // Final chunk: prompt done, the sample is real.
        s.append_token_id(42, HashMap::new(), Some(vec![0.25, 0.75]), 2);
        assert!(s.is_prompt_processing_finished());
        assert_eq!(s.get_output_len(), 1);
        assert_eq!(s.get_last_token_id(), Some(42));
        // The sampler's probability vector rides along with the token.
        assert_eq!(s.output_probs, vec![Some(vec![0.25, 0.75])]);
    }

    #[test]
    fn logical_block_arithmetic() {
        let mut s = seq(vec![0; 17], 16);
        assert_eq!(s.num_logical_blocks(), 2);
        assert_eq!(s.last_block_num_tokens(), 1);

        s.append_token_id(1, HashMap::new(), None, 17);
        assert_eq!(s.num_logical_blocks(), 2);
        assert_eq!(s.last_block_num_tokens(), 2);
    }

    #[test]
    fn fork_shares_history_but_diverges() {
        let mut parent = seq(vec![1, 2], 16);
        parent.append_token_id(3, HashMap::from([(3, -0.5)]), None, 2);

        let mut child = parent.fork(7);
        assert_eq!(child.seq_id, 7);
        assert_eq!(child.get_token_ids(), parent.get_token_ids());

        child.append_token_id(4, HashMap::new(), None, 0);
        assert_eq!(child.get_len(), parent.get_len() + 1);
        assert_eq!(parent.get_last_token_id(), Some(3));
    }

    #[test]
    fn beam_score_excludes_trailing_eos() {
        let eos = 2u32;
        let mut s = seq(vec![1, 1], 16);
        s.append_token_id(5, HashMap::from([(5, -1.0)]), None, 2);
        s.append_token_id(eos, HashMap::from([(eos, -1.0)]), None, 0);
        assert_eq!(s.get_len(), 4);

        // len counts 3 (eos excluded): -2.0 / 3
        let score = s.get_beam_search_score(1.0, Some(eos), None);
        assert!((score - (-2.0 / 3.0)).abs() < 1e-6);

        // Override wins over the actual length.
        let score = s.get_beam_search_score(1.0, Some(eos), Some(8));
        assert!((score - (-0.25)).abs() < 1e-6);

        // Zero length penalty makes the score length-independent.
        let score = s.get_beam_search_score(0.0, Some(eos), None);
        assert!((score - (-2.0)).abs() < 1e-6);
    }

    #[test]
    fn max_running_seqs_estimate() {
        let mut group = SequenceGroup::new(
            "r0".to_string(),
            vec![seq(vec![1], 16)],
            SamplingParams {
                n: 2,
                best_of: 4,
                ..Default::default()
            },
            SystemTime::now(),
            Instant::now(),
        );
        // Prompt stage: only one member exists, but best_of will fork.
        assert_eq!(group.get_max_num_running_seqs(), 4);

        group.seqs_mut()[0].set_status(SequenceStatus::Running);
        for id in 1..4 {
            let mut child = group.get(0).unwrap().fork(id);
            child.set_status(SequenceStatus::Running);
            group.add(child);
        }
        assert_eq!(group.get_max_num_running_seqs(), 4);
    }

    #[test]
    fn request_output_trims_trailing_eos() {
        let eos = 9u32;
        let mut s = seq(vec![1], 16);
        s.append_token_id(5, HashMap::new(), None, 1);
        s.append_token_id(eos, HashMap::new(), None, 0);
        s.set_status(SequenceStatus::FinishedStopped);

        let group = SequenceGroup::new(
            "r1".to_string(),
            vec![s],
            SamplingParams::greedy(4),
            SystemTime::now(),
            Instant::now(),
        );
        let out = RequestOutput::from_seq_group(&group, Some(eos));
        assert!(out.finished);
        assert_eq!(out.outputs[0].token_ids, vec![5]);
        assert_eq!(out.outputs[0].finish_reason, Some(FinishReason::Stopped));
    }
}
