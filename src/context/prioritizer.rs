//! Node prioritization
//!
//! `priority_score = Σ(factor · weight)` over five factors in [0, 1]:
//! retrieval score, query mention, recency (exponential decay with a 20-day
//! half-life), connectivity to other included candidates, and importance.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use super::models::{sort_by_priority, PrioritizedNode, PriorityFactors, RetrievalCandidate};
use super::token_estimator::{resolve_tokens, TokenCountSource, TokenEstimator};
use crate::config::PriorityConfig;
use crate::error::ValidationError;

/// Recency factor: `exp(-days / (half_life / ln 2))`
pub fn recency_factor(days_since: f64, half_life_days: f64) -> f32 {
    let days = days_since.max(0.0);
    let tau = half_life_days / std::f64::consts::LN_2;
    (-days / tau).exp() as f32
}

/// Connectivity factor: `min(1, n · step)`
pub fn connectivity_factor(connected_included: usize, step: f32) -> f32 {
    (connected_included as f32 * step).min(1.0)
}

/// Scores retrieval candidates for one request
pub struct NodePrioritizer {
    config: PriorityConfig,
    estimator: Arc<dyn TokenEstimator>,
    token_counts: Option<Arc<dyn TokenCountSource>>,
}

impl NodePrioritizer {
    pub fn new(config: PriorityConfig, estimator: Arc<dyn TokenEstimator>) -> Result<Self, ValidationError> {
        config.validate()?;
        Ok(Self {
            config,
            estimator,
            token_counts: None,
        })
    }

    /// Read cached counts from storage before estimating
    pub fn with_token_counts(mut self, source: Arc<dyn TokenCountSource>) -> Self {
        self.token_counts = Some(source);
        self
    }

    pub fn config(&self) -> &PriorityConfig {
        &self.config
    }

    /// Weighted sum of the factors
    pub fn score(&self, factors: &PriorityFactors) -> f32 {
        factors.retrieval_score * self.config.retrieval_score
            + factors.query_mentioned * self.config.query_mentioned
            + factors.recency * self.config.recency
            + factors.connectivity * self.config.connectivity
            + factors.importance * self.config.importance
    }

    /// Score every candidate and return them sorted by priority, highest first
    pub fn prioritize(
        &self,
        candidates: &[RetrievalCandidate],
        query: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<PrioritizedNode>, ValidationError> {
        let candidate_ids: HashSet<&str> = candidates.iter().map(|c| c.node_id.as_str()).collect();
        let query_lower = query.to_lowercase();

        let mut nodes = candidates
            .iter()
            .map(|candidate| self.prioritize_one(candidate, &candidate_ids, &query_lower, now))
            .collect::<Result<Vec<_>, _>>()?;

        sort_by_priority(&mut nodes);

        debug!(
            count = nodes.len(),
            top = nodes.first().map(|n| n.priority_score),
            "Prioritized candidates"
        );
        Ok(nodes)
    }

    fn prioritize_one(
        &self,
        candidate: &RetrievalCandidate,
        candidate_ids: &HashSet<&str>,
        query_lower: &str,
        now: DateTime<Utc>,
    ) -> Result<PrioritizedNode, ValidationError> {
        check_unit(&candidate.node_id, "retrieval_score", candidate.retrieval_score)?;
        check_unit(&candidate.node_id, "importance", candidate.importance)?;

        let content = candidate.content.clone().unwrap_or_default();
        let tokens = match (candidate.tokens, candidate.content.as_deref()) {
            (Some(tokens), _) => tokens,
            (None, Some(text)) => match &self.token_counts {
                Some(source) => resolve_tokens(source.as_ref(), self.estimator.as_ref(), &candidate.node_id, text).tokens,
                None => self.estimator.estimate(text),
            },
            (None, None) => return Err(ValidationError::MissingTokenCount(candidate.node_id.clone())),
        };

        let mentioned = candidate.query_mentioned
            || candidate
                .title
                .as_deref()
                .map(|title| !title.trim().is_empty() && query_lower.contains(&title.trim().to_lowercase()))
                .unwrap_or(false);

        let connected_included = if candidate.connected_ids.is_empty() {
            candidate.connectivity_count
        } else {
            candidate
                .connected_ids
                .iter()
                .filter(|id| candidate_ids.contains(id.as_str()))
                .count()
        };

        let days_since = (now - candidate.last_accessed).num_seconds() as f64 / 86_400.0;

        let factors = PriorityFactors {
            retrieval_score: candidate.retrieval_score,
            query_mentioned: if mentioned { 1.0 } else { 0.0 },
            recency: recency_factor(days_since, self.config.recency_half_life_days),
            connectivity: connectivity_factor(connected_included, self.config.connectivity_step),
            importance: candidate.importance,
        };

        Ok(PrioritizedNode {
            node_id: candidate.node_id.clone(),
            priority_score: self.score(&factors),
            factors,
            tokens,
            content,
            summary: candidate.summary.clone(),
            is_critical: candidate.is_critical,
            was_truncated: false,
            truncation_tier: None,
        })
    }
}

fn check_unit(node_id: &str, field: &'static str, value: f32) -> Result<(), ValidationError> {
    if value.is_nan() || !(0.0..=1.0).contains(&value) {
        return Err(ValidationError::ScoreOutOfRange {
            node_id: node_id.to_string(),
            field,
            value,
        });
    }
    Ok(())
}
