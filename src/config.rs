//! Layered configuration
//!
//! Defaults are compiled in; an optional TOML file and `CONTEXT_*`
//! environment variables (nested with `__`) override them. Every section is
//! immutable once loaded: a change produces a new `Config` and the budget
//! templates derived from it are recomputed.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::context::model_budget::Provider;
use crate::error::{Result, ValidationError};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub budget: TokenBudgetConfig,

    /// Static model registry seed
    #[serde(default)]
    pub models: Vec<ModelEntry>,

    #[serde(default)]
    pub priority: PriorityConfig,

    #[serde(default)]
    pub packer: PackerConfig,

    #[serde(default)]
    pub truncation: TruncationConfig,

    #[serde(default)]
    pub history: HistoryConfig,

    #[serde(default)]
    pub chunking: ChunkingConfig,

    #[serde(default)]
    pub summary_cache: SummaryCacheConfig,
}

impl Config {
    /// Load configuration from defaults, an optional file and the environment
    pub fn load(path: Option<&str>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::with_name(path).required(false));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix("CONTEXT")
                .separator("__")
                .try_parsing(true),
        );

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Config = ::config::Config::builder()
            .add_source(::config::File::from_str(source, ::config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field consistency
    pub fn validate(&self) -> std::result::Result<(), ValidationError> {
        self.budget.validate()?;
        self.priority.validate()?;
        self.truncation.validate()?;
        self.chunking.validate()?;
        if self.history.max_turns == 0 {
            return Err(ValidationError::InvalidConfig(
                "history.max_turns must be positive".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.history.target_reduction) {
            return Err(ValidationError::InvalidConfig(format!(
                "history.target_reduction must be within [0, 1), got {}",
                self.history.target_reduction
            )));
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// `pretty` or `json`
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Fixed reservations, sparse-retrieval credit and provider split ratios
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBudgetConfig {
    #[serde(default = "default_system_prompt")]
    pub system_prompt: usize,

    #[serde(default = "default_min_user_message")]
    pub min_user_message: usize,

    #[serde(default = "default_response_buffer")]
    pub response_buffer: usize,

    /// Retrieval below this size counts as sparse
    #[serde(default = "default_sparse_threshold")]
    pub sparse_retrieval_threshold: usize,

    /// Tokens moved into the response buffer on sparse retrieval
    #[serde(default = "default_sparse_credit")]
    pub sparse_response_credit: usize,

    /// Context window assumed for models the registry does not know
    #[serde(default = "default_fallback_window")]
    pub fallback_context_window: usize,

    #[serde(default = "default_allow_fallback")]
    pub allow_fallback: bool,

    /// Upper bound for Σfixed as a fraction of the context window
    #[serde(default = "default_max_reserved_fraction")]
    pub max_reserved_fraction: f64,

    #[serde(default)]
    pub provider_ratios: ProviderRatios,
}

fn default_system_prompt() -> usize {
    3000
}

fn default_min_user_message() -> usize {
    2000
}

fn default_response_buffer() -> usize {
    16000
}

fn default_sparse_threshold() -> usize {
    1000
}

fn default_sparse_credit() -> usize {
    4000
}

fn default_fallback_window() -> usize {
    32000
}

fn default_allow_fallback() -> bool {
    true
}

fn default_max_reserved_fraction() -> f64 {
    0.5
}

impl Default for TokenBudgetConfig {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            min_user_message: default_min_user_message(),
            response_buffer: default_response_buffer(),
            sparse_retrieval_threshold: default_sparse_threshold(),
            sparse_response_credit: default_sparse_credit(),
            fallback_context_window: default_fallback_window(),
            allow_fallback: default_allow_fallback(),
            max_reserved_fraction: default_max_reserved_fraction(),
            provider_ratios: ProviderRatios::default(),
        }
    }
}

impl TokenBudgetConfig {
    /// Sum of the fixed reservations before any scaling
    pub fn reserved(&self) -> usize {
        self.system_prompt + self.min_user_message + self.response_buffer
    }

    pub fn validate(&self) -> std::result::Result<(), ValidationError> {
        if !(self.max_reserved_fraction > 0.0 && self.max_reserved_fraction < 1.0) {
            return Err(ValidationError::InvalidConfig(format!(
                "budget.max_reserved_fraction must be within (0, 1), got {}",
                self.max_reserved_fraction
            )));
        }
        if self.fallback_context_window == 0 {
            return Err(ValidationError::InvalidConfig(
                "budget.fallback_context_window must be positive".to_string(),
            ));
        }
        self.provider_ratios.validate()
    }
}

/// Retrieval share of the flexible pool, per provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRatios {
    #[serde(default = "default_ratio_high")]
    pub anthropic: f64,
    #[serde(default = "default_ratio_low")]
    pub openai: f64,
    #[serde(default = "default_ratio_high")]
    pub google: f64,
    #[serde(default = "default_ratio_low")]
    pub local: f64,
    #[serde(default = "default_ratio_low")]
    pub other: f64,
}

fn default_ratio_high() -> f64 {
    0.70
}

fn default_ratio_low() -> f64 {
    0.65
}

impl Default for ProviderRatios {
    fn default() -> Self {
        Self {
            anthropic: default_ratio_high(),
            openai: default_ratio_low(),
            google: default_ratio_high(),
            local: default_ratio_low(),
            other: default_ratio_low(),
        }
    }
}

impl ProviderRatios {
    pub fn for_provider(&self, provider: Provider) -> f64 {
        match provider {
            Provider::Anthropic => self.anthropic,
            Provider::OpenAi => self.openai,
            Provider::Google => self.google,
            Provider::Local => self.local,
            Provider::Other => self.other,
        }
    }

    fn validate(&self) -> std::result::Result<(), ValidationError> {
        for ratio in [self.anthropic, self.openai, self.google, self.local, self.other] {
            if !(ratio > 0.0 && ratio < 1.0) {
                return Err(ValidationError::InvalidRatio(ratio));
            }
        }
        Ok(())
    }
}

/// Registry entry for a known model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    pub id: String,
    pub context_window: usize,
    #[serde(default)]
    pub provider: Provider,
}

/// Weights and decay parameters for node prioritization
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityConfig {
    #[serde(default = "default_w_retrieval")]
    pub retrieval_score: f32,
    #[serde(default = "default_w_mentioned")]
    pub query_mentioned: f32,
    #[serde(default = "default_w_recency")]
    pub recency: f32,
    #[serde(default = "default_w_minor")]
    pub connectivity: f32,
    #[serde(default = "default_w_minor")]
    pub importance: f32,
    #[serde(default = "default_half_life")]
    pub recency_half_life_days: f64,
    #[serde(default = "default_connectivity_step")]
    pub connectivity_step: f32,
}

fn default_w_retrieval() -> f32 {
    0.40
}

fn default_w_mentioned() -> f32 {
    0.25
}

fn default_w_recency() -> f32 {
    0.15
}

fn default_w_minor() -> f32 {
    0.10
}

fn default_half_life() -> f64 {
    20.0
}

fn default_connectivity_step() -> f32 {
    0.3
}

impl Default for PriorityConfig {
    fn default() -> Self {
        Self {
            retrieval_score: default_w_retrieval(),
            query_mentioned: default_w_mentioned(),
            recency: default_w_recency(),
            connectivity: default_w_minor(),
            importance: default_w_minor(),
            recency_half_life_days: default_half_life(),
            connectivity_step: default_connectivity_step(),
        }
    }
}

impl PriorityConfig {
    pub fn weight_sum(&self) -> f32 {
        self.retrieval_score + self.query_mentioned + self.recency + self.connectivity + self.importance
    }

    pub fn validate(&self) -> std::result::Result<(), ValidationError> {
        let sum = self.weight_sum();
        if (sum - 1.0).abs() > 1e-3 {
            return Err(ValidationError::InvalidWeights(sum));
        }
        if self.recency_half_life_days <= 0.0 {
            return Err(ValidationError::InvalidConfig(
                "priority.recency_half_life_days must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Packer limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackerConfig {
    /// How many of the highest-priority misfits get a truncation attempt
    #[serde(default = "default_truncation_attempts")]
    pub max_truncation_attempts: usize,

    /// Remaining budget below which truncation is not attempted
    #[serde(default = "default_min_truncation_target")]
    pub min_truncation_target: usize,
}

fn default_truncation_attempts() -> usize {
    3
}

fn default_min_truncation_target() -> usize {
    64
}

impl Default for PackerConfig {
    fn default() -> Self {
        Self {
            max_truncation_attempts: default_truncation_attempts(),
            min_truncation_target: default_min_truncation_target(),
        }
    }
}

/// Truncation engine parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TruncationConfig {
    #[serde(default = "default_latency_ceiling")]
    pub latency_ceiling_ms: u64,

    /// Share of the target kept from the start in semantic truncation
    #[serde(default = "default_semantic_head")]
    pub semantic_head: f64,

    /// Share of the target kept from the end in semantic truncation
    #[serde(default = "default_semantic_tail")]
    pub semantic_tail: f64,

    #[serde(default = "default_separator")]
    pub separator: String,

    #[serde(default = "default_marker")]
    pub marker: String,
}

fn default_latency_ceiling() -> u64 {
    100
}

fn default_semantic_head() -> f64 {
    0.6
}

fn default_semantic_tail() -> f64 {
    0.2
}

fn default_separator() -> String {
    "\n\n[...]\n\n".to_string()
}

fn default_marker() -> String {
    " [truncated]".to_string()
}

impl Default for TruncationConfig {
    fn default() -> Self {
        Self {
            latency_ceiling_ms: default_latency_ceiling(),
            semantic_head: default_semantic_head(),
            semantic_tail: default_semantic_tail(),
            separator: default_separator(),
            marker: default_marker(),
        }
    }
}

impl TruncationConfig {
    pub fn validate(&self) -> std::result::Result<(), ValidationError> {
        if self.semantic_head <= 0.0 || self.semantic_tail < 0.0 {
            return Err(ValidationError::InvalidConfig(
                "truncation head/tail shares must be positive".to_string(),
            ));
        }
        if self.semantic_head + self.semantic_tail >= 1.0 {
            return Err(ValidationError::InvalidConfig(format!(
                "truncation head + tail must stay below 1.0, got {}",
                self.semantic_head + self.semantic_tail
            )));
        }
        Ok(())
    }
}

/// Conversation history window and summarization trigger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,

    #[serde(default = "default_history_max_tokens")]
    pub max_tokens: usize,

    /// Unsummarized turns that trigger background summarization
    #[serde(default = "default_summarize_turns")]
    pub summarize_turns: usize,

    /// Unsummarized tokens that trigger background summarization
    #[serde(default = "default_summarize_tokens")]
    pub summarize_tokens: usize,

    #[serde(default = "default_summary_input")]
    pub summary_input_tokens: usize,

    #[serde(default = "default_summary_output")]
    pub summary_output_tokens: usize,

    #[serde(default = "default_target_reduction")]
    pub target_reduction: f64,

    /// Verbatim window multiplier used while no summary exists
    #[serde(default = "default_fallback_multiplier")]
    pub fallback_turn_multiplier: usize,
}

fn default_max_turns() -> usize {
    6
}

fn default_history_max_tokens() -> usize {
    8000
}

fn default_summarize_turns() -> usize {
    10
}

fn default_summarize_tokens() -> usize {
    20000
}

fn default_summary_input() -> usize {
    10000
}

fn default_summary_output() -> usize {
    2000
}

fn default_target_reduction() -> f64 {
    0.75
}

fn default_fallback_multiplier() -> usize {
    2
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            max_tokens: default_history_max_tokens(),
            summarize_turns: default_summarize_turns(),
            summarize_tokens: default_summarize_tokens(),
            summary_input_tokens: default_summary_input(),
            summary_output_tokens: default_summary_output(),
            target_reduction: default_target_reduction(),
            fallback_turn_multiplier: default_fallback_multiplier(),
        }
    }
}

/// Chunk sizing and retrieval-time aggregation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Documents above this size are chunked
    #[serde(default = "default_chunk_threshold")]
    pub chunk_threshold: usize,
    #[serde(default = "default_chunk_target")]
    pub target: usize,
    #[serde(default = "default_min_chunk")]
    pub min_chunk: usize,
    #[serde(default = "default_max_chunk")]
    pub max_chunk: usize,
    #[serde(default = "default_hard_split")]
    pub hard_split: usize,
    #[serde(default = "default_emergency_split")]
    pub emergency_split: usize,
    /// Chunks below this size are merged into a neighbour
    #[serde(default = "default_min_tokens")]
    pub min_tokens: usize,
    #[serde(default = "default_min_sentences")]
    pub min_sentences: usize,
    #[serde(default = "default_overlap")]
    pub overlap_tokens: usize,
    #[serde(default = "default_true")]
    pub expansion_enabled: bool,
    /// Extra tokens an expansion may add around a single match
    #[serde(default = "default_expansion_cap")]
    pub expansion_cap: usize,
    #[serde(default = "default_true")]
    pub include_parent_summary: bool,
    #[serde(default = "default_merge_threshold")]
    pub merge_threshold: usize,
    #[serde(default = "default_summary_threshold")]
    pub summary_threshold: usize,
    #[serde(default = "default_max_highlights")]
    pub max_highlights: usize,
}

fn default_chunk_threshold() -> usize {
    2000
}

fn default_chunk_target() -> usize {
    1000
}

fn default_min_chunk() -> usize {
    500
}

fn default_max_chunk() -> usize {
    1500
}

fn default_hard_split() -> usize {
    3000
}

fn default_emergency_split() -> usize {
    5000
}

fn default_min_tokens() -> usize {
    100
}

fn default_min_sentences() -> usize {
    3
}

fn default_overlap() -> usize {
    100
}

fn default_true() -> bool {
    true
}

fn default_expansion_cap() -> usize {
    1500
}

fn default_merge_threshold() -> usize {
    2
}

fn default_summary_threshold() -> usize {
    4
}

fn default_max_highlights() -> usize {
    3
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_threshold: default_chunk_threshold(),
            target: default_chunk_target(),
            min_chunk: default_min_chunk(),
            max_chunk: default_max_chunk(),
            hard_split: default_hard_split(),
            emergency_split: default_emergency_split(),
            min_tokens: default_min_tokens(),
            min_sentences: default_min_sentences(),
            overlap_tokens: default_overlap(),
            expansion_enabled: default_true(),
            expansion_cap: default_expansion_cap(),
            include_parent_summary: default_true(),
            merge_threshold: default_merge_threshold(),
            summary_threshold: default_summary_threshold(),
            max_highlights: default_max_highlights(),
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> std::result::Result<(), ValidationError> {
        let ordered = self.min_tokens <= self.min_chunk
            && self.min_chunk <= self.target
            && self.target <= self.max_chunk
            && self.max_chunk <= self.hard_split
            && self.hard_split <= self.emergency_split;
        if !ordered || self.target == 0 {
            return Err(ValidationError::InvalidConfig(
                "chunking sizes must satisfy min_tokens <= min_chunk <= target <= max_chunk <= hard_split <= emergency_split".to_string(),
            ));
        }
        if self.overlap_tokens >= self.min_chunk {
            return Err(ValidationError::InvalidConfig(
                "chunking.overlap_tokens must be smaller than min_chunk".to_string(),
            ));
        }
        if self.merge_threshold < 2 || self.summary_threshold <= self.merge_threshold {
            return Err(ValidationError::InvalidConfig(
                "chunking aggregation thresholds must satisfy 2 <= merge < summary".to_string(),
            ));
        }
        Ok(())
    }
}

/// Read-side cache for background conversation summaries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryCacheConfig {
    #[serde(default = "default_cache_capacity")]
    pub max_capacity: u64,
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
}

fn default_cache_capacity() -> u64 {
    10_000
}

fn default_cache_ttl() -> u64 {
    86_400
}

impl Default for SummaryCacheConfig {
    fn default() -> Self {
        Self {
            max_capacity: default_cache_capacity(),
            ttl_secs: default_cache_ttl(),
        }
    }
}

/// Build a lookup of model entries keyed by id
pub fn model_table(entries: &[ModelEntry]) -> HashMap<String, ModelEntry> {
    entries
        .iter()
        .map(|entry| (entry.id.clone(), entry.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.budget.reserved(), 21000);
        assert_eq!(config.history.max_turns, 6);
        assert_eq!(config.chunking.target, 1000);
    }

    #[test]
    fn test_config_from_toml() {
        let config = Config::from_toml_str(
            r#"
            [logging]
            level = "debug"
            format = "json"

            [budget]
            response_buffer = 12000

            [[models]]
            id = "claude-sonnet"
            context_window = 200000
            provider = "anthropic"

            [history]
            max_turns = 4
            "#,
        )
        .unwrap();

        assert_eq!(config.logging.format, "json");
        assert_eq!(config.budget.response_buffer, 12000);
        assert_eq!(config.budget.system_prompt, 3000);
        assert_eq!(config.models.len(), 1);
        assert_eq!(config.models[0].provider, Provider::Anthropic);
        assert_eq!(config.history.max_turns, 4);
        assert_eq!(config.history.max_tokens, 8000);
    }

    #[test]
    fn test_invalid_weights_rejected() {
        let priority = PriorityConfig {
            retrieval_score: 0.9,
            ..PriorityConfig::default()
        };
        assert!(matches!(
            priority.validate(),
            Err(ValidationError::InvalidWeights(_))
        ));
    }

    #[test]
    fn test_invalid_chunk_sizes_rejected() {
        let chunking = ChunkingConfig {
            max_chunk: 400,
            ..ChunkingConfig::default()
        };
        assert!(chunking.validate().is_err());
    }

    #[test]
    fn test_model_table() {
        let table = model_table(&[ModelEntry {
            id: "gpt-4o".to_string(),
            context_window: 128000,
            provider: Provider::OpenAi,
        }]);
        assert_eq!(table["gpt-4o"].context_window, 128000);
    }
}
