//! Configuration types for the Haraka inference engine

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Configuration of the model served by the workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model name or local path
    pub model: String,

    /// Tokenizer name or path; defaults to the model
    #[serde(default)]
    pub tokenizer: Option<String>,

    /// Tokenizer mode ("auto" or "slow")
    #[serde(default = "default_tokenizer_mode")]
    pub tokenizer_mode: String,

    /// Model revision to load
    #[serde(default)]
    pub revision: Option<String>,

    /// Allow custom model code from the hub
    #[serde(default)]
    pub trust_remote_code: bool,

    /// Weight dtype ("auto", "float16", "bfloat16", "float32")
    #[serde(default = "default_dtype")]
    pub dtype: String,

    /// Directory for downloaded weights
    #[serde(default)]
    pub download_dir: Option<PathBuf>,

    /// Weight file format ("auto", "safetensors", "pt")
    #[serde(default = "default_load_format")]
    pub load_format: String,

    /// Quantization scheme, if any
    #[serde(default)]
    pub quantization: Option<String>,

    /// RNG seed handed to the workers
    #[serde(default)]
    pub seed: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            tokenizer: None,
            tokenizer_mode: default_tokenizer_mode(),
            revision: None,
            trust_remote_code: false,
            dtype: default_dtype(),
            download_dir: None,
            load_format: default_load_format(),
            quantization: None,
            seed: 0,
        }
    }
}

fn default_tokenizer_mode() -> String {
    "auto".to_string()
}

fn default_dtype() -> String {
    "auto".to_string()
}

fn default_load_format() -> String {
    "auto".to_string()
}

/// Configuration of the paged KV cache.
///
/// `num_gpu_blocks` / `num_cpu_blocks` are filled in at startup from worker
/// memory profiling; they are `None` until then.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Tokens per KV block
    #[serde(default = "default_block_size")]
    pub block_size: usize,

    /// Fraction of GPU memory the cache may claim
    #[serde(default = "default_gpu_memory_utilization")]
    pub gpu_memory_utilization: f32,

    /// CPU swap pool size in bytes
    #[serde(default = "default_swap_space_bytes")]
    pub swap_space_bytes: u64,

    /// GPU pool size in blocks, filled by profiling
    #[serde(default)]
    pub num_gpu_blocks: Option<usize>,

    /// CPU pool size in blocks, filled by profiling
    #[serde(default)]
    pub num_cpu_blocks: Option<usize>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
            gpu_memory_utilization: default_gpu_memory_utilization(),
            swap_space_bytes: default_swap_space_bytes(),
            num_gpu_blocks: None,
            num_cpu_blocks: None,
        }
    }
}

impl CacheConfig {
    pub fn verify(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(Error::Config("block_size must be positive".to_string()));
        }
        if !(self.gpu_memory_utilization > 0.0 && self.gpu_memory_utilization <= 1.0) {
            return Err(Error::Config(format!(
                "gpu_memory_utilization must be in (0, 1], got {}",
                self.gpu_memory_utilization
            )));
        }
        Ok(())
    }
}

fn default_block_size() -> usize {
    16
}

fn default_gpu_memory_utilization() -> f32 {
    0.90
}

fn default_swap_space_bytes() -> u64 {
    4 << 30
}

/// Configuration of distributed execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelConfig {
    /// Number of tensor-parallel replicas
    #[serde(default = "default_tensor_parallel_size")]
    pub tensor_parallel_size: usize,

    /// Whether workers live behind a remote RPC backend
    #[serde(default)]
    pub worker_use_remote: bool,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            tensor_parallel_size: default_tensor_parallel_size(),
            worker_use_remote: false,
        }
    }
}

impl ParallelConfig {
    /// Total number of workers driven in lock-step.
    pub fn world_size(&self) -> usize {
        self.tensor_parallel_size
    }

    pub fn verify(&self) -> Result<()> {
        if self.tensor_parallel_size == 0 {
            return Err(Error::Config(
                "tensor_parallel_size must be positive".to_string(),
            ));
        }
        if self.world_size() > 1 && !self.worker_use_remote {
            return Err(Error::Config(
                "a remote worker backend is required when world_size > 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_tensor_parallel_size() -> usize {
    1
}

/// Configuration of the request scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Scheduling policy, resolved through the scheduler registry
    #[serde(default = "default_policy")]
    pub type_name: String,

    /// Maximum tokens processed per step (prompt chunks + decodes)
    #[serde(default = "default_max_num_batched_tokens")]
    pub max_num_batched_tokens: usize,

    /// Maximum sequences running per step
    #[serde(default = "default_max_num_seqs")]
    pub max_num_seqs: usize,

    /// Maximum model context length
    #[serde(default = "default_max_model_len")]
    pub max_model_len: usize,

    /// Split long prompt prefills across steps
    #[serde(default = "default_enable_chunked_prefill")]
    pub enable_chunked_prefill: bool,

    /// Prompt tokens per prefill chunk
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            type_name: default_policy(),
            max_num_batched_tokens: default_max_num_batched_tokens(),
            max_num_seqs: default_max_num_seqs(),
            max_model_len: default_max_model_len(),
            enable_chunked_prefill: default_enable_chunked_prefill(),
            chunk_size: default_chunk_size(),
        }
    }
}

impl SchedulerConfig {
    pub fn verify(&self) -> Result<()> {
        if self.max_num_batched_tokens == 0 || self.max_num_seqs == 0 {
            return Err(Error::Config(
                "scheduler budgets must be positive".to_string(),
            ));
        }
        if self.enable_chunked_prefill && self.chunk_size == 0 {
            return Err(Error::Config(
                "chunk_size must be positive when chunked prefill is enabled".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_policy() -> String {
    "fcfs".to_string()
}

fn default_max_num_batched_tokens() -> usize {
    2560
}

fn default_max_num_seqs() -> usize {
    256
}

fn default_max_model_len() -> usize {
    4096
}

fn default_enable_chunked_prefill() -> bool {
    false
}

fn default_chunk_size() -> usize {
    512
}

/// Configuration of the metrics store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Record and log engine statistics
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,

    /// Named sinks snapshots are pushed to (consumed by external wrappers)
    #[serde(default)]
    pub sinks: Vec<String>,

    /// Seconds between periodic system-stats log lines
    #[serde(default = "default_log_interval_secs")]
    pub log_interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            sinks: Vec::new(),
            log_interval_secs: default_log_interval_secs(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_log_interval_secs() -> u64 {
    5
}

/// Bundle of every config consumed at engine construction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub parallel: ParallelConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl EngineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(raw)?;
        config.verify()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }

    pub fn verify(&self) -> Result<()> {
        self.cache.verify()?;
        self.parallel.verify()?;
        self.scheduler.verify()?;
        Ok(())
    }
}
