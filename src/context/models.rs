//! Data models for retrieved candidates and packed context

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Candidate handed over by the retrieval collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalCandidate {
    pub node_id: String,
    /// Relevance from the ranking algorithm (0.0-1.0)
    pub retrieval_score: f32,
    /// Cached token count; estimated from `content` when absent
    #[serde(default)]
    pub tokens: Option<usize>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    /// Precomputed summary, enables the cheapest truncation tier
    #[serde(default)]
    pub summary: Option<String>,
    pub last_accessed: DateTime<Utc>,
    #[serde(default)]
    pub connectivity_count: usize,
    /// Graph neighbours, counted only when they are candidates too
    #[serde(default)]
    pub connected_ids: Vec<String>,
    /// Decay-model importance (0.0-1.0)
    #[serde(default)]
    pub importance: f32,
    #[serde(default)]
    pub query_mentioned: bool,
    #[serde(default)]
    pub is_critical: bool,
}

impl RetrievalCandidate {
    pub fn new(node_id: impl Into<String>, retrieval_score: f32, last_accessed: DateTime<Utc>) -> Self {
        Self {
            node_id: node_id.into(),
            retrieval_score,
            tokens: None,
            content: None,
            title: None,
            summary: None,
            last_accessed,
            connectivity_count: 0,
            connected_ids: Vec::new(),
            importance: 0.0,
            query_mentioned: false,
            is_critical: false,
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_tokens(mut self, tokens: usize) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_importance(mut self, importance: f32) -> Self {
        self.importance = importance;
        self
    }

    pub fn with_connections(mut self, ids: Vec<String>) -> Self {
        self.connectivity_count = ids.len();
        self.connected_ids = ids;
        self
    }

    pub fn critical(mut self) -> Self {
        self.is_critical = true;
        self
    }

    pub fn has_summary(&self) -> bool {
        self.summary.is_some()
    }
}

/// The five normalized prioritization factors (each 0.0-1.0)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriorityFactors {
    pub retrieval_score: f32,
    pub query_mentioned: f32,
    pub recency: f32,
    pub connectivity: f32,
    pub importance: f32,
}

/// Truncation strategy, cheapest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TruncationTier {
    UseSummary,
    SemanticTruncation,
    ExtractRelevant,
    HardTruncation,
}

impl TruncationTier {
    /// Expected cost of the tier in milliseconds
    pub fn expected_latency_ms(self) -> u64 {
        match self {
            TruncationTier::UseSummary => 0,
            TruncationTier::SemanticTruncation => 10,
            TruncationTier::ExtractRelevant => 80,
            TruncationTier::HardTruncation => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TruncationTier::UseSummary => "use_summary",
            TruncationTier::SemanticTruncation => "semantic_truncation",
            TruncationTier::ExtractRelevant => "extract_relevant",
            TruncationTier::HardTruncation => "hard_truncation",
        }
    }
}

/// Candidate scored for the current request; never persisted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrioritizedNode {
    pub node_id: String,
    pub factors: PriorityFactors,
    pub priority_score: f32,
    pub tokens: usize,
    /// Text that goes into the prompt (replaced when truncated)
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub is_critical: bool,
    pub was_truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncation_tier: Option<TruncationTier>,
}

impl PrioritizedNode {
    pub fn has_summary(&self) -> bool {
        self.summary.is_some()
    }
}

/// Result of packing prioritized nodes into the retrieved budget
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackedContext {
    /// Included nodes in inclusion order (critical first, then by priority)
    pub nodes: Vec<PrioritizedNode>,
    pub used_tokens: usize,
    pub budget_tokens: usize,
    pub truncated_count: usize,
    pub excluded_count: usize,
    pub excluded_ids: Vec<String>,
}

impl PackedContext {
    /// Included nodes sorted by priority, highest first
    pub fn by_priority(&self) -> Vec<PrioritizedNode> {
        let mut nodes = self.nodes.clone();
        sort_by_priority(&mut nodes);
        nodes
    }
}

/// Sort descending by priority score; ties keep their input order
pub fn sort_by_priority(nodes: &mut [PrioritizedNode]) {
    nodes.sort_by(|a, b| b.priority_score.total_cmp(&a.priority_score));
}

/// Output of the truncation engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TruncatedContent {
    pub text: String,
    pub original_tokens: usize,
    pub truncated_tokens: usize,
    pub tier_used: TruncationTier,
    pub latency_ms: u64,
}
