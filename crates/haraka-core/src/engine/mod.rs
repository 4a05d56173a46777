//! The inference engine core.
//!
//! One decoding iteration flows through these modules in order: the
//! scheduler picks the step's groups and block movements, the executor
//! broadcasts the plan to the lock-step workers, and the output processor
//! applies the sampled tokens back onto the sequences.

pub mod core;
pub mod detokenizer;
pub mod executor;
pub mod kv_cache;
pub mod metrics;
pub mod output_processor;
pub mod sampling;
pub mod scheduler;
pub mod sequence;
pub mod types;

pub use self::core::Engine;
pub use detokenizer::{detokenize_incrementally, IncrementalDecode};
pub use executor::{ExecutionBatch, ModelExecutor, Worker, WorkerStepOutput};
pub use kv_cache::{AllocStatus, Device, KVCacheManager};
pub use metrics::{BatchEndRecord, MetricsSnapshot, MetricsStore};
pub use output_processor::OutputProcessor;
pub use sampling::{EarlyStopping, SamplingParams, SamplingType};
pub use scheduler::{FcfsScheduler, Scheduler, SchedulerOutputs, SchedulerRegistry};
pub use sequence::{
    CompletionOutput, RequestOutput, SamplerOutput, Sequence, SequenceData, SequenceGroup,
    SequenceGroupMetadata, SequenceOutputs, SequenceStatus,
};
pub use types::{BlockId, Counter, FinishReason, RequestId, SeqId, Token};
