//! Sampling parameters attached to a generation request.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const SAMPLING_EPS: f32 = 1e-5;

/// When beam search may stop before every beam has finished.
///
/// Serialized as `true`, `false`, or the string `"never"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "EarlyStoppingRepr", into = "EarlyStoppingRepr")]
pub enum EarlyStopping {
    /// Stop as soon as `best_of` candidates have finished.
    Enabled,
    /// Stop when no running beam can beat the worst finished one at its
    /// current length.
    Disabled,
    /// Canonical beam search: compare against the best score attainable at
    /// the maximum possible length.
    Never,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum EarlyStoppingRepr {
    Flag(bool),
    Text(String),
}

impl TryFrom<EarlyStoppingRepr> for EarlyStopping {
    type Error = String;

    fn try_from(repr: EarlyStoppingRepr) -> std::result::Result<Self, String> {
        match repr {
            EarlyStoppingRepr::Flag(true) => Ok(EarlyStopping::Enabled),
            EarlyStoppingRepr::Flag(false) => Ok(EarlyStopping::Disabled),
            EarlyStoppingRepr::Text(s) if s == "never" => Ok(EarlyStopping::Never),
            EarlyStoppingRepr::Text(s) => {
                Err(format!("early_stopping must be true, false or \"never\", got {s:?}"))
            }
        }
    }
}

impl From<EarlyStopping> for EarlyStoppingRepr {
    fn from(value: EarlyStopping) -> Self {
        match value {
            EarlyStopping::Enabled => EarlyStoppingRepr::Flag(true),
            EarlyStopping::Disabled => EarlyStoppingRepr::Flag(false),
            EarlyStopping::Never => EarlyStoppingRepr::Text("never".to_string()),
        }
    }
}

impl Default for EarlyStopping {
    fn default() -> Self {
        EarlyStopping::Disabled
    }
}

/// Sampling parameters for one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Number of output sequences returned
    #[serde(default = "default_n")]
    pub n: usize,

    /// Number of candidate sequences generated; the top `n` are returned.
    /// Under beam search this is the beam width.
    #[serde(default = "default_n")]
    pub best_of: usize,

    #[serde(default)]
    pub presence_penalty: f32,

    #[serde(default)]
    pub frequency_penalty: f32,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_top_p")]
    pub top_p: f32,

    /// -1 disables top-k
    #[serde(default = "default_top_k")]
    pub top_k: i32,

    #[serde(default)]
    pub use_beam_search: bool,

    /// Exponent applied to sequence length in the beam-search score
    #[serde(default = "default_length_penalty")]
    pub length_penalty: f32,

    #[serde(default)]
    pub early_stopping: EarlyStopping,

    /// Strings that terminate generation when they appear as a suffix of
    /// the output text. The matched suffix is not included in the output.
    #[serde(default)]
    pub stop: Vec<String>,

    #[serde(default)]
    pub ignore_eos: bool,

    /// Maximum generated tokens per sequence
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    /// Number of logprobs returned per generated token
    #[serde(default)]
    pub logprobs: Option<usize>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            n: default_n(),
            best_of: default_n(),
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
            temperature: default_temperature(),
            top_p: default_top_p(),
            top_k: default_top_k(),
            use_beam_search: false,
            length_penalty: default_length_penalty(),
            early_stopping: EarlyStopping::default(),
            stop: Vec::new(),
            ignore_eos: false,
            max_tokens: default_max_tokens(),
            logprobs: None,
        }
    }
}

fn default_n() -> usize {
    1
}

fn default_temperature() -> f32 {
    1.0
}

fn default_top_p() -> f32 {
    1.0
}

fn default_top_k() -> i32 {
    -1
}

fn default_length_penalty() -> f32 {
    1.0
}

fn default_max_tokens() -> usize {
    16
}

impl SamplingParams {
    /// Greedy single-sequence params, the common case in tests and smoke
    /// runs.
    pub fn greedy(max_tokens: usize) -> Self {
        Self {
            temperature: 0.0,
            max_tokens,
            ..Default::default()
        }
    }

    pub fn sampling_type(&self) -> SamplingType {
        if self.use_beam_search {
            SamplingType::Beam
        } else if self.temperature < SAMPLING_EPS {
            SamplingType::Greedy
        } else {
            SamplingType::Random
        }
    }

    pub fn verify(&self) -> Result<()> {
        if self.n == 0 {
            return Err(invalid("n must be at least 1"));
        }
        if self.best_of < self.n {
            return Err(invalid(&format!(
                "best_of must be >= n, got n={} best_of={}",
                self.n, self.best_of
            )));
        }
        if !(-2.0..=2.0).contains(&self.presence_penalty) {
            return Err(invalid("presence_penalty must be in [-2, 2]"));
        }
        if !(-2.0..=2.0).contains(&self.frequency_penalty) {
            return Err(invalid("frequency_penalty must be in [-2, 2]"));
        }
        if self.temperature < 0.0 {
            return Err(invalid("temperature must be non-negative"));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(invalid("top_p must be in (0, 1]"));
        }
        if self.top_k < -1 || self.top_k == 0 {
            return Err(invalid("top_k must be -1 (disabled) or at least 1"));
        }
        if self.max_tokens == 0 {
            return Err(invalid("max_tokens must be at least 1"));
        }
        match self.sampling_type() {
            SamplingType::Beam => self.verify_beam_search(),
            SamplingType::Greedy => self.verify_greedy(),
            SamplingType::Random => Ok(()),
        }
    }

    fn verify_beam_search(&self) -> Result<()> {
        if self.best_of == 1 {
            return Err(invalid("best_of must be > 1 when using beam search"));
        }
        if self.temperature > SAMPLING_EPS {
            return Err(invalid("temperature must be 0 when using beam search"));
        }
        if self.top_p < 1.0 - SAMPLING_EPS {
            return Err(invalid("top_p must be 1 when using beam search"));
        }
        if self.top_k != -1 {
            return Err(invalid("top_k must be disabled when using beam search"));
        }
        Ok(())
    }

    fn verify_greedy(&self) -> Result<()> {
        if self.best_of > 1 {
            return Err(invalid("best_of must be 1 when using greedy sampling"));
        }
        Ok(())
    }
}

/// Kind of sampling a request uses, derived from its parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingType {
    Greedy,
    Random,
    Beam,
}

fn invalid(msg: &str) -> Error {
    Error::InvalidSamplingParams(msg.to_string())
}
