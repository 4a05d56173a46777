//! Error types for the Haraka inference engine

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Tokenization error: {0}")]
    Tokenization(String),

    #[error("Invalid sampling parameters: {0}")]
    InvalidSamplingParams(String),

    #[error("Unknown scheduler policy: {0}")]
    UnknownScheduler(String),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Worker output divergence: {0}")]
    WorkerDivergence(String),

    #[error("KV cache block manager error: {0}")]
    BlockManager(String),

    #[error("Out of CPU swap space: {0}")]
    SwapSpaceExhausted(String),

    #[error("Scheduling error: {0}")]
    Scheduler(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
