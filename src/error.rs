//! Error types for the context allocation pipeline
//!
//! Overflow is never an error here: the allocator, packer and truncation
//! engine report it as an action or a tier. Errors are reserved for
//! malformed input rejected at the boundary.

use thiserror::Error;

use crate::chunking::ChunkError;
use crate::context::summarizer::DispatchError;
use crate::context::token_budget::BudgetError;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, ContextError>;

/// Typed rejection of malformed input
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Negative token count for {field}: {value}")]
    NegativeTokenCount { field: &'static str, value: i64 },

    #[error("Unknown model '{0}' and no fallback configured")]
    UnknownModel(String),

    #[error("Score {field} for node {node_id} must be within [0, 1], got {value}")]
    ScoreOutOfRange {
        node_id: String,
        field: &'static str,
        value: f32,
    },

    #[error("Node {0} has neither a token count nor content")]
    MissingTokenCount(String),

    #[error("{messages} messages but {counts} token counts")]
    TokenCountMismatch { messages: usize, counts: usize },

    #[error("Priority weights must sum to 1.0, got {0}")]
    InvalidWeights(f32),

    #[error("Retrieval ratio must be within (0, 1), got {0}")]
    InvalidRatio(f64),

    #[error("Fixed reservations ({reserved}) leave no flexible pool in a {total}-token window")]
    NoFlexiblePool { reserved: usize, total: usize },

    #[error("Broken chunk sequence: {0}")]
    BrokenChunkSequence(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Crate-level error
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Budget error: {0}")]
    Budget(#[from] BudgetError),

    #[error("Chunking error: {0}")]
    Chunking(#[from] ChunkError),

    #[error("Summarization dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] ::config::ConfigError),

    #[error("Tokenizer initialization failed: {0}")]
    Tokenizer(String),
}
