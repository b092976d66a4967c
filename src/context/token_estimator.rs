//! Token estimation and the token-count cache boundary
//!
//! Exact model tokenization is not required: the heuristic estimator is the
//! default, tiktoken is available when a closer count is wanted. Counts
//! cached on node records belong to storage; this module only reads them
//! and asks for a recount when they are missing or were produced by a
//! different tokenizer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tiktoken_rs::{cl100k_base, CoreBPE};
use tracing::debug;

use crate::error::{ContextError, Result};

/// Characters per token assumed by the heuristic estimator
pub const CHARS_PER_TOKEN: f64 = 4.0;

/// Token estimator trait for different tokenization strategies
pub trait TokenEstimator: Send + Sync {
    /// Estimate the number of tokens in the given text
    fn estimate(&self, text: &str) -> usize;

    /// Estimate tokens for multiple texts
    fn estimate_batch(&self, texts: &[&str]) -> Vec<usize> {
        texts.iter().map(|t| self.estimate(t)).collect()
    }

    /// Name recorded next to cached counts
    fn name(&self) -> &str;
}

/// Estimate tokens with the default heuristic (~4 characters per token)
pub fn estimate_tokens(text: &str) -> usize {
    HeuristicEstimator::default().estimate(text)
}

/// Character-ratio estimator, the fallback when exact counts are unavailable
#[derive(Debug, Clone)]
pub struct HeuristicEstimator {
    chars_per_token: f64,
}

impl HeuristicEstimator {
    pub fn new(chars_per_token: f64) -> Self {
        Self { chars_per_token }
    }
}

impl Default for HeuristicEstimator {
    fn default() -> Self {
        Self::new(CHARS_PER_TOKEN)
    }
}

impl TokenEstimator for HeuristicEstimator {
    fn estimate(&self, text: &str) -> usize {
        let chars = text.chars().count();
        (chars as f64 / self.chars_per_token).ceil() as usize
    }

    fn name(&self) -> &str {
        "heuristic"
    }
}

/// Tiktoken-based token estimator using cl100k_base
pub struct TiktokenEstimator {
    bpe: Arc<CoreBPE>,
}

impl TiktokenEstimator {
    /// Create a new tiktoken estimator with cl100k_base encoding
    pub fn new() -> Result<Self> {
        let bpe = cl100k_base().map_err(|e| ContextError::Tokenizer(e.to_string()))?;
        Ok(Self { bpe: Arc::new(bpe) })
    }
}

impl TokenEstimator for TiktokenEstimator {
    fn estimate(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }

    fn name(&self) -> &str {
        "cl100k_base"
    }
}

/// Word-based token estimator (~1.3 tokens per word)
#[derive(Debug, Clone)]
pub struct WordBasedEstimator {
    tokens_per_word: f64,
}

impl WordBasedEstimator {
    pub fn new(tokens_per_word: f64) -> Self {
        Self { tokens_per_word }
    }
}

impl Default for WordBasedEstimator {
    fn default() -> Self {
        Self::new(1.3)
    }
}

impl TokenEstimator for WordBasedEstimator {
    fn estimate(&self, text: &str) -> usize {
        let word_count = text.split_whitespace().count();
        (word_count as f64 * self.tokens_per_word).ceil() as usize
    }

    fn name(&self) -> &str {
        "word"
    }
}

/// Token counts cached on a node record by storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenCountCache {
    pub body: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<usize>,
    pub total: usize,
    pub counted_with: String,
    pub counted_at: DateTime<Utc>,
}

/// Read access to cached counts plus a recount request channel.
///
/// Implemented by storage. Requests are fire-and-forget.
pub trait TokenCountSource: Send + Sync {
    fn cached_counts(&self, node_id: &str) -> Option<TokenCountCache>;

    fn request_recount(&self, node_id: &str, tokenizer: &str);
}

/// Where a token count came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountOrigin {
    Cache,
    Estimated,
}

/// Token count resolved for one node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedCount {
    pub tokens: usize,
    pub origin: CountOrigin,
    pub recount_requested: bool,
}

/// Resolve the body token count for a node.
///
/// A cached count is used only when it was produced by the active tokenizer.
/// Otherwise the text is estimated and storage is asked to recount.
pub fn resolve_tokens(
    source: &dyn TokenCountSource,
    estimator: &dyn TokenEstimator,
    node_id: &str,
    text: &str,
) -> ResolvedCount {
    match source.cached_counts(node_id) {
        Some(cache) if cache.counted_with == estimator.name() => ResolvedCount {
            tokens: cache.body,
            origin: CountOrigin::Cache,
            recount_requested: false,
        },
        cached => {
            debug!(
                node_id,
                cached_with = cached.as_ref().map(|c| c.counted_with.as_str()),
                tokenizer = estimator.name(),
                "Token cache miss or mismatch, requesting recount"
            );
            source.request_recount(node_id, estimator.name());
            ResolvedCount {
                tokens: estimator.estimate(text),
                origin: CountOrigin::Estimated,
                recount_requested: true,
            }
        }
    }
}
