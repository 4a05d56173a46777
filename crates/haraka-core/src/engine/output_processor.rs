//! Post-processing of sampler outputs.
//!
//! For every scheduled group this applies the sampled tokens to the member
//! sequences, forking where the sampler produced several children per
//! parent, then detokenizes, runs the stop checks, and prunes beams. One
//! ordering rule is load-bearing throughout: every fork registered with the
//! block manager must precede any free, otherwise a shared physical block
//! could be released while a new child still points at it.

use std::collections::HashMap;

use tracing::debug;

use super::detokenizer::decode_sequence;
use super::sampling::{EarlyStopping, SamplingParams};
use super::scheduler::Scheduler;
use super::sequence::{
    SamplerOutput, Sequence, SequenceGroup, SequenceOutputs, SequenceStatus,
};
use super::types::{Counter, SeqId};
use crate::error::{Error, Result};
use crate::tokenizer::Tokenizer;

/// Applies one step's sampler output to the scheduled groups.
pub struct OutputProcessor<'a> {
    scheduler: &'a mut dyn Scheduler,
    tokenizer: &'a Tokenizer,
    seq_counter: &'a Counter,
    max_model_len: usize,
}

impl<'a> OutputProcessor<'a> {
    pub fn new(
        scheduler: &'a mut dyn Scheduler,
        tokenizer: &'a Tokenizer,
        seq_counter: &'a Counter,
        max_model_len: usize,
    ) -> Self {
        Self {
            scheduler,
            tokenizer,
            seq_counter,
            max_model_len,
        }
    }

    /// Consume the sampler output for every scheduled group, then release
    /// any group whose members have all finished.
    pub fn process_outputs(
        &mut self,
        scheduled: &mut [SequenceGroup],
        prompt_chunk_lens: &[usize],
        sampler_output: &SamplerOutput,
    ) -> Result<()> {
        debug_assert_eq!(scheduled.len(), prompt_chunk_lens.len());
        debug_assert_eq!(scheduled.len(), sampler_output.len());
        for ((group, chunk), samples) in scheduled
            .iter_mut()
            .zip(prompt_chunk_lens)
            .zip(sampler_output)
        {
            self.process_sequence_group_samples(group, *chunk, samples)?;
        }
        self.scheduler.free_finished_seq_groups();
        Ok(())
    }

    fn process_sequence_group_samples(
        &mut self,
        group: &mut SequenceGroup,
        prompt_chunk_len: usize,
        samples: &[SequenceOutputs],
    ) -> Result<()> {
        let params = group.sampling_params.clone();
        let parent_ids: Vec<SeqId> = group
            .get_seqs(Some(SequenceStatus::Running))
            .iter()
            .map(|s| s.seq_id)
            .collect();
        // Snapshot before mutation: beams finished in earlier steps.
        let existing_finished_ids: Vec<SeqId> =
            group.get_finished_seqs().iter().map(|s| s.seq_id).collect();

        let mut children_by_parent: HashMap<SeqId, Vec<SequenceOutputs>> =
            parent_ids.iter().map(|id| (*id, Vec::new())).collect();
        for sample in samples {
            children_by_parent
                .get_mut(&sample.parent_seq_id)
                .ok_or_else(|| {
                    Error::Scheduler(format!(
                        "sample for unknown parent seq {}",
                        sample.parent_seq_id
                    ))
                })?
                .push(sample.clone());
        }

        // Phase 1: apply samples. Freshly forked children are staged until
        // beam selection decides their fate; `pairs` records (child,
        // parent), where child == parent marks the in-place continuation.
        let mut staged: Vec<Sequence> = Vec::new();
        let mut pairs: Vec<(SeqId, SeqId)> = Vec::new();

        for parent_id in parent_ids {
            let child_samples = children_by_parent
                .remove(&parent_id)
                .expect("initialized above");
            if child_samples.is_empty() {
                // The sampler elected not to continue this parent; it will
                // never run again, so drop it from the group.
                let mut parent = group.remove(parent_id).expect("parent is a member");
                parent.set_status(SequenceStatus::FinishedAborted);
                self.scheduler.free_seq(parent_id)?;
                debug!(seq_id = parent_id, "parent received no samples, aborted");
                continue;
            }

            let (last_sample, fork_samples) = child_samples.split_last().expect("non-empty");
            for sample in fork_samples {
                let new_seq_id = self.seq_counter.next();
                let parent = group.get(parent_id).expect("parent is a member");
                let mut child = parent.fork(new_seq_id);
                child.append_token_id(
                    sample.output_token,
                    sample.logprobs.clone(),
                    sample.probs.clone(),
                    prompt_chunk_len,
                );
                staged.push(child);
                pairs.push((new_seq_id, parent_id));
            }
            // The last sample continues the parent in place, saving a copy.
            let parent = group.get_mut(parent_id).expect("parent is a member");
            parent.append_token_id(
                last_sample.output_token,
                last_sample.logprobs.clone(),
                last_sample.probs.clone(),
                prompt_chunk_len,
            );
            pairs.push((parent_id, parent_id));
        }

        // Phase 2: detokenize and stop-check. Skipped while the prompt is
        // still being prefilled: no real token was sampled yet.
        for (child_id, _) in &pairs {
            let seq = match staged.iter_mut().find(|s| s.seq_id == *child_id) {
                Some(seq) => seq,
                None => group.get_mut(*child_id).expect("child is a member"),
            };
            if !seq.is_prompt_processing_finished() {
                continue;
            }
            decode_sequence(self.tokenizer, seq)?;
            self.check_stop(seq, &params);
        }

        if !params.use_beam_search {
            self.finish_non_beam(group, staged, &pairs)
        } else {
            self.finish_beam(group, staged, &pairs, &existing_finished_ids, &params)
        }
    }

    fn finish_non_beam(
        &mut self,
        group: &mut SequenceGroup,
        mut staged: Vec<Sequence>,
        pairs: &[(SeqId, SeqId)],
    ) -> Result<()> {
        // Add the new children and register their forks first.
        for (child_id, parent_id) in pairs {
            if child_id == parent_id {
                continue;
            }
            let idx = staged
                .iter()
                .position(|s| s.seq_id == *child_id)
                .expect("staged child");
            let child = staged.remove(idx);
            let finished = child.is_finished();
            group.add(child);
            if !finished {
                self.scheduler.fork_seq(*parent_id, *child_id)?;
            }
        }

        // Only then free the finished continuations. They stay in the
        // group as candidate output.
        for (child_id, parent_id) in pairs {
            if child_id == parent_id
                && group.get(*child_id).is_some_and(|s| s.is_finished())
            {
                self.scheduler.free_seq(*child_id)?;
            }
        }
        Ok(())
    }

    fn finish_beam(
        &mut self,
        group: &mut SequenceGroup,
        mut staged: Vec<Sequence>,
        pairs: &[(SeqId, SeqId)],
        existing_finished_ids: &[SeqId],
        params: &SamplingParams,
    ) -> Result<()> {
        let beam_width = params.best_of;
        let length_penalty = params.length_penalty;
        let eos = self.tokenizer.eos_token_id();
        let score = |staged: &[Sequence], group: &SequenceGroup, id: SeqId| -> f32 {
            find_seq(staged, group, id)
                .expect("scored seq exists")
                .get_beam_search_score(length_penalty, eos, None)
        };

        // Pool every finished candidate: survivors of earlier steps plus
        // this step's newly finished children, best score first.
        let mut all_finished: Vec<(SeqId, Option<SeqId>, bool)> = existing_finished_ids
            .iter()
            .map(|id| (*id, None, false))
            .collect();
        for (child_id, parent_id) in pairs {
            let finished = find_seq(&staged, group, *child_id)
                .is_some_and(|s| s.is_finished());
            if finished {
                all_finished.push((*child_id, Some(*parent_id), true));
            }
        }
        all_finished.sort_by(|a, b| {
            score(&staged, group, b.0)
                .partial_cmp(&score(&staged, group, a.0))
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut selected: Vec<(SeqId, SeqId)> = Vec::new();
        let mut unselected: Vec<(SeqId, SeqId)> = Vec::new();
        for (idx, (seq_id, parent_id, is_new)) in all_finished.iter().copied().enumerate() {
            if idx < beam_width {
                if is_new {
                    selected.push((seq_id, parent_id.expect("new entries carry a parent")));
                }
            } else if is_new {
                unselected.push((seq_id, parent_id.expect("new entries carry a parent")));
            } else {
                // A previously finished beam was displaced by a better one.
                group.remove(seq_id);
            }
        }

        let mut running_children: Vec<(SeqId, SeqId)> = pairs
            .iter()
            .filter(|(child_id, _)| {
                find_seq(&staged, group, *child_id).is_some_and(|s| !s.is_finished())
            })
            .copied()
            .collect();
        running_children.sort_by(|a, b| {
            score(&staged, group, b.0)
                .partial_cmp(&score(&staged, group, a.0))
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let stop_beam_search = if running_children.is_empty() {
            true
        } else if all_finished.len() < beam_width {
            false
        } else {
            let best_running = find_seq(&staged, group, running_children[0].0)
                .expect("running child exists");
            let current_worst = find_seq(&staged, group, all_finished[beam_width - 1].0)
                .expect("finished seq exists");
            self.check_beam_search_early_stopping(params, best_running, current_worst)
        };

        if stop_beam_search {
            // Whatever is still running will not improve on the finished
            // beams; drop it all.
            unselected.extend(running_children);
        } else {
            selected.extend(running_children.iter().take(beam_width));
            unselected.extend(running_children.iter().skip(beam_width));
        }

        // Forks before frees, as in the non-beam branch.
        for (child_id, parent_id) in &selected {
            if child_id == parent_id {
                continue;
            }
            let idx = staged
                .iter()
                .position(|s| s.seq_id == *child_id)
                .expect("staged child");
            let child = staged.remove(idx);
            let finished = child.is_finished();
            group.add(child);
            if !finished {
                self.scheduler.fork_seq(*parent_id, *child_id)?;
            }
        }
        for (child_id, parent_id) in &selected {
            if child_id == parent_id
                && group.get(*child_id).is_some_and(|s| s.is_finished())
            {
                self.scheduler.free_seq(*child_id)?;
            }
        }

        for (child_id, parent_id) in &unselected {
            if child_id == parent_id {
                // A continuation that fell out of the beam takes its parent
                // with it.
                group.remove(*child_id);
                self.scheduler.free_seq(*child_id)?;
            } else {
                // A fresh fork that was never registered anywhere; the
                // staging copy just evaporates.
                staged.retain(|s| s.seq_id != *child_id);
            }
        }
        Ok(())
    }

    /// Decide whether beam search can stop given the best still-running
    /// candidate and the worst finished one.
    pub(crate) fn check_beam_search_early_stopping(
        &self,
        params: &SamplingParams,
        best_running_seq: &Sequence,
        current_worst_seq: &Sequence,
    ) -> bool {
        debug_assert!(params.use_beam_search);
        let length_penalty = params.length_penalty;
        let eos = self.tokenizer.eos_token_id();

        if params.early_stopping == EarlyStopping::Enabled {
            return true;
        }
        let current_worst_score =
            current_worst_seq.get_beam_search_score(length_penalty, eos, None);
        let highest_attainable_score = match params.early_stopping {
            EarlyStopping::Enabled => unreachable!(),
            EarlyStopping::Disabled => {
                best_running_seq.get_beam_search_score(length_penalty, eos, None)
            }
            EarlyStopping::Never => {
                if length_penalty > 0.0 {
                    // A positive length penalty favors longer sequences, so
                    // the bound uses the longest length still reachable.
                    let max_possible_length = (best_running_seq.get_prompt_len()
                        + params.max_tokens)
                        .max(self.max_model_len);
                    best_running_seq.get_beam_search_score(
                        length_penalty,
                        eos,
                        Some(max_possible_length),
                    )
                } else {
                    best_running_seq.get_beam_search_score(length_penalty, eos, None)
                }
            }
        };
        current_worst_score >= highest_attainable_score
    }

    /// Stop checks, in order: stop strings, model length cap, max_tokens,
    /// EOS.
    fn check_stop(&self, seq: &mut Sequence, params: &SamplingParams) {
        for stop_str in &params.stop {
            if seq.output_text.ends_with(stop_str.as_str()) {
                // The matched suffix is not part of the output.
                let truncated = seq.output_text.len() - stop_str.len();
                seq.output_text.truncate(truncated);
                seq.set_status(SequenceStatus::FinishedStopped);
                return;
            }
        }
        if seq.get_len() > self.max_model_len {
            seq.set_status(SequenceStatus::FinishedLengthCapped);
            return;
        }
        if seq.get_output_len() == params.max_tokens {
            seq.set_status(SequenceStatus::FinishedLengthCapped);
            return;
        }
        if !params.ignore_eos {
            if let Some(eos) = self.tokenizer.eos_token_id() {
                if seq.get_last_token_id() == Some(eos) {
                    seq.set_status(SequenceStatus::FinishedStopped);
                }
            }
        }
    }
}

fn find_seq<'s>(
    staged: &'s [Sequence],
    group: &'s SequenceGroup,
    seq_id: SeqId,
) -> Option<&'s Sequence> {
    staged
        .iter()
        .find(|s| s.seq_id == seq_id)
        .or_else(|| group.get(seq_id))
}
