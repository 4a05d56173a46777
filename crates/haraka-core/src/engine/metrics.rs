//! Engine metrics.
//!
//! The store is an explicit handle injected at engine construction (before
//! the workers, so their instrumentation can resolve it) rather than an
//! ambient global. Sinks are external; the engine only exposes serialisable
//! snapshots.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::sequence::SequenceGroup;
use crate::config::MetricsConfig;

/// Counters recorded for one completed step.
#[derive(Debug, Clone, Copy)]
pub struct BatchEndRecord {
    pub num_prompt_tokens: usize,
    pub num_generation_tokens: usize,
    /// Minimum across workers; least affected by CPU overhead.
    pub model_execution_time: Duration,
}

/// Serialisable counter snapshot, also the merge unit for worker metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub requests_arrived: u64,
    pub steps: u64,
    pub prompt_tokens: u64,
    pub generation_tokens: u64,
    pub model_execution_micros: u64,
}

/// Process-wide metrics accumulator.
#[derive(Debug)]
pub struct MetricsStore {
    config: MetricsConfig,
    requests_arrived: AtomicU64,
    steps: AtomicU64,
    prompt_tokens: AtomicU64,
    generation_tokens: AtomicU64,
    model_execution_micros: AtomicU64,
    initial_memory_profiling_done: AtomicBool,
}

impl MetricsStore {
    pub fn new(config: MetricsConfig) -> Self {
        Self {
            config,
            requests_arrived: AtomicU64::new(0),
            steps: AtomicU64::new(0),
            prompt_tokens: AtomicU64::new(0),
            generation_tokens: AtomicU64::new(0),
            model_execution_micros: AtomicU64::new(0),
            initial_memory_profiling_done: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    pub fn on_request_arrival(&self, group: &SequenceGroup) {
        if !self.config.enabled {
            return;
        }
        self.requests_arrived.fetch_add(1, Ordering::Relaxed);
        debug!(request_id = %group.request_id, "request arrived");
    }

    pub fn on_batch_end(&self, record: BatchEndRecord) {
        if !self.config.enabled {
            return;
        }
        self.steps.fetch_add(1, Ordering::Relaxed);
        self.prompt_tokens
            .fetch_add(record.num_prompt_tokens as u64, Ordering::Relaxed);
        self.generation_tokens
            .fetch_add(record.num_generation_tokens as u64, Ordering::Relaxed);
        self.model_execution_micros
            .fetch_add(record.model_execution_time.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn mark_initial_memory_profiling_done(&self) {
        self.initial_memory_profiling_done
            .store(true, Ordering::Relaxed);
    }

    pub fn is_initial_memory_profiling_done(&self) -> bool {
        self.initial_memory_profiling_done.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_arrived: self.requests_arrived.load(Ordering::Relaxed),
            steps: self.steps.load(Ordering::Relaxed),
            prompt_tokens: self.prompt_tokens.load(Ordering::Relaxed),
            generation_tokens: self.generation_tokens.load(Ordering::Relaxed),
            model_execution_micros: self.model_execution_micros.load(Ordering::Relaxed),
        }
    }

    /// Fold a worker's counters into this store.
    pub fn merge(&self, other: &MetricsSnapshot) {
        self.requests_arrived
            .fetch_add(other.requests_arrived, Ordering::Relaxed);
        self.steps.fetch_add(other.steps, Ordering::Relaxed);
        self.prompt_tokens
            .fetch_add(other.prompt_tokens, Ordering::Relaxed);
        self.generation_tokens
            .fetch_add(other.generation_tokens, Ordering::Relaxed);
        self.model_execution_micros
            .fetch_add(other.model_execution_micros, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.requests_arrived.store(0, Ordering::Relaxed);
        self.steps.store(0, Ordering::Relaxed);
        self.prompt_tokens.store(0, Ordering::Relaxed);
        self.generation_tokens.store(0, Ordering::Relaxed);
        self.model_execution_micros.store(0, Ordering::Relaxed);
    }
}
