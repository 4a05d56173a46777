//! Core identifier types shared across the engine.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// A vocabulary token id.
pub type Token = u32;

/// Unique id of a single sequence (token stream).
pub type SeqId = u64;

/// Physical or logical KV-cache block index.
pub type BlockId = usize;

/// Client-supplied request id. Unique across the engine's lifetime.
pub type RequestId = String;

/// Why a sequence stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// A stop string or the EOS token was generated.
    Stopped,
    /// The sequence hit `max_tokens` or the model length limit.
    LengthCapped,
    /// Explicit abort request on the engine.
    Aborted,
    /// The request was rejected before execution (e.g. prompt too long).
    Ignored,
}

impl FinishReason {
    /// Short wire name, matching the conventions of OpenAI-style APIs.
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Stopped => "stop",
            // Ignored requests surface as length-capped: they were cut off
            // before producing anything.
            FinishReason::LengthCapped | FinishReason::Ignored => "length",
            FinishReason::Aborted => "abort",
        }
    }
}

/// Monotonic id generator for sequences.
///
/// Atomic so that a future concurrent submission wrapper does not have to
/// serialize on id allocation.
#[derive(Debug, Default)]
pub struct Counter {
    next: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_is_monotonic() {
        let c = Counter::new();
        assert_eq!(c.next(), 0);
        assert_eq!(c.next(), 1);
        assert_eq!(c.next(), 2);
    }

    #[test]
    fn finish_reason_wire_names() {
        assert_eq!(FinishReason::Stopped.as_str(), "stop");
        assert_eq!(FinishReason::LengthCapped.as_str(), "length");
        assert_eq!(FinishReason::Ignored.as_str(), "length");
        assert_eq!(FinishReason::Aborted.as_str(), "abort");
    }
}
