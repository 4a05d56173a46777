//! Haraka Core - Iteration-Level LLM Inference Engine
//!
//! This crate provides the serving core that drives a large-language-model
//! inference system: requests are batched one decoding step at a time,
//! executed in lock-step on replicated GPU workers, and post-processed
//! for beam search, streaming detokenization, and stop conditions.
//!
//! # Architecture
//!
//! - Iteration-level scheduling with pluggable policies (FCFS provided)
//! - Paged KV-cache block management with copy-on-fork and CPU swap
//! - Worker fan-out with a replica-equality gate
//! - Incremental detokenization and stop-string handling
//!
//! # Example
//!
//! ```ignore
//! use haraka_core::{Engine, EngineConfig, SamplingParams, Tokenizer};
//!
//! let config = EngineConfig::from_path("engine.toml".as_ref())?;
//! let tokenizer = Tokenizer::from_path(model_dir)?;
//! let mut engine = Engine::new(config, tokenizer, workers, 0)?;
//!
//! engine.add_request("r1", Some("Hello"), SamplingParams::greedy(16), None, None)?;
//! while engine.has_unfinished_requests() {
//!     for output in engine.step()? {
//!         println!("{output:?}");
//!     }
//! }
//! ```
//!
//! The GPU worker itself (model weights, attention kernels) lives behind
//! the [`Worker`] trait; this crate never touches device memory directly.

pub mod config;
pub mod engine;
pub mod error;
pub mod tokenizer;

pub use config::{
    CacheConfig, EngineConfig, MetricsConfig, ModelConfig, ParallelConfig, SchedulerConfig,
};
pub use engine::{
    AllocStatus, CompletionOutput, Engine, ExecutionBatch, FinishReason, KVCacheManager,
    MetricsSnapshot, MetricsStore, ModelExecutor, OutputProcessor, RequestOutput, SamplerOutput,
    SamplingParams, Scheduler, SchedulerOutputs, SchedulerRegistry, Sequence, SequenceGroup,
    SequenceGroupMetadata, SequenceOutputs, SequenceStatus, Worker, WorkerStepOutput,
};
pub use error::{Error, Result};
pub use tokenizer::{SpecialTokens, Tokenizer};
