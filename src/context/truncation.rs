//! Multi-tier truncation engine
//!
//! Tiers, picked once per oversized node:
//! - `use_summary`: a precomputed summary exists (~0 ms)
//! - `semantic_truncation`: content ≤ 2× target, keep head 60% + tail 20% (~10 ms)
//! - `extract_relevant`: content > 2× target, query-aware extraction (~80 ms)
//! - `hard_truncation`: cut at a sentence boundary, append a marker (~1 ms)
//!
//! The 100 ms ceiling is enforced by tier selection: a tier whose expected
//! cost would breach it is skipped. `hard_truncation` is the terminal
//! fallback and always returns something within the target.

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use super::models::{PrioritizedNode, TruncatedContent, TruncationTier};
use super::token_estimator::TokenEstimator;
use crate::config::TruncationConfig;
use crate::text::{cut_at_sentence_boundary, prefix_chars, query_terms, split_sentences, suffix_chars};

/// Query-aware extraction strategy behind the `extract_relevant` tier
pub trait RelevanceExtractor: Send + Sync {
    /// Condense `content` to at most `target_tokens`, favouring `query`.
    /// An empty result means nothing could be extracted.
    fn extract(
        &self,
        content: &str,
        query: &str,
        target_tokens: usize,
        estimator: &dyn TokenEstimator,
    ) -> String;

    fn expected_latency_ms(&self) -> u64 {
        TruncationTier::ExtractRelevant.expected_latency_ms()
    }

    fn name(&self) -> &str;
}

/// Ranks sentences by query-term overlap and keeps the best ones in
/// document order
#[derive(Debug, Clone, Default)]
pub struct LexicalOverlapExtractor;

impl RelevanceExtractor for LexicalOverlapExtractor {
    fn extract(
        &self,
        content: &str,
        query: &str,
        target_tokens: usize,
        estimator: &dyn TokenEstimator,
    ) -> String {
        let sentences = split_sentences(content);
        let terms = query_terms(query);

        let mut ranked: Vec<(usize, usize)> = sentences
            .iter()
            .enumerate()
            .map(|(idx, sentence)| {
                let lower = sentence.to_lowercase();
                let overlap = terms.iter().filter(|t| lower.contains(t.as_str())).count();
                (idx, overlap)
            })
            .collect();
        // Stable sort keeps document order among equal scores
        ranked.sort_by(|a, b| b.1.cmp(&a.1));

        let mut selected = Vec::new();
        let mut used = 0;
        for (idx, _) in ranked {
            // +1 for the joining space
            let cost = estimator.estimate(&sentences[idx]) + 1;
            if used + cost <= target_tokens {
                used += cost;
                selected.push(idx);
            }
        }
        selected.sort_unstable();

        selected
            .into_iter()
            .map(|idx| sentences[idx].as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn name(&self) -> &str {
        "lexical_overlap"
    }
}

/// Truncation engine
pub struct TruncationEngine {
    config: TruncationConfig,
    estimator: Arc<dyn TokenEstimator>,
    extractor: Arc<dyn RelevanceExtractor>,
}

impl TruncationEngine {
    pub fn new(config: TruncationConfig, estimator: Arc<dyn TokenEstimator>) -> Self {
        Self::with_extractor(config, estimator, Arc::new(LexicalOverlapExtractor))
    }

    pub fn with_extractor(
        config: TruncationConfig,
        estimator: Arc<dyn TokenEstimator>,
        extractor: Arc<dyn RelevanceExtractor>,
    ) -> Self {
        Self {
            config,
            estimator,
            extractor,
        }
    }

    pub fn config(&self) -> &TruncationConfig {
        &self.config
    }

    /// Pick the cheapest applicable tier for an oversized node
    pub fn select_truncation_tier(&self, tokens: usize, has_summary: bool, target: usize) -> TruncationTier {
        if has_summary {
            return TruncationTier::UseSummary;
        }
        if tokens <= target.saturating_mul(2) {
            return TruncationTier::SemanticTruncation;
        }
        let hard = TruncationTier::HardTruncation.expected_latency_ms();
        if self.extractor.expected_latency_ms() + hard <= self.config.latency_ceiling_ms {
            TruncationTier::ExtractRelevant
        } else {
            TruncationTier::HardTruncation
        }
    }

    /// Shrink a prioritized node's content to `target` tokens
    pub fn truncate(&self, node: &PrioritizedNode, target: usize, query: &str) -> TruncatedContent {
        self.truncate_text(&node.content, node.tokens, node.summary.as_deref(), target, query)
    }

    /// Shrink `text` (already counted at `original_tokens`) to `target` tokens.
    ///
    /// Text already within target comes back unmodified under
    /// `hard_truncation`, the tier that leaves fitting text alone.
    pub fn truncate_text(
        &self,
        text: &str,
        original_tokens: usize,
        summary: Option<&str>,
        target: usize,
        query: &str,
    ) -> TruncatedContent {
        let started = Instant::now();

        if original_tokens <= target {
            return TruncatedContent {
                text: text.to_string(),
                original_tokens,
                truncated_tokens: original_tokens,
                tier_used: TruncationTier::HardTruncation,
                latency_ms: 0,
            };
        }

        let tier = self.select_truncation_tier(original_tokens, summary.is_some(), target);
        let candidate = match (tier, summary) {
            (TruncationTier::UseSummary, Some(summary)) => summary.to_string(),
            (TruncationTier::SemanticTruncation, _) => self.semantic_truncate(text, target),
            (TruncationTier::ExtractRelevant, _) => {
                self.extractor
                    .extract(text, query, target, self.estimator.as_ref())
            }
            _ => self.hard_truncate(text, target),
        };

        let mut output = candidate;
        let mut tokens = self.estimator.estimate(&output);
        if output.trim().is_empty() || tokens > target {
            // Fall through once to the terminal tier, working from the
            // summary when that is what was selected
            let source = match (tier, summary) {
                (TruncationTier::UseSummary, Some(summary)) if !summary.trim().is_empty() => summary,
                _ => text,
            };
            debug!(tier = tier.as_str(), tokens, target, "Tier output over target, hard truncating");
            output = self.hard_truncate(source, target);
            tokens = self.estimator.estimate(&output);
        }

        let latency_ms = started.elapsed().as_millis() as u64;
        if latency_ms > self.config.latency_ceiling_ms {
            warn!(
                tier = tier.as_str(),
                latency_ms,
                ceiling = self.config.latency_ceiling_ms,
                "Truncation exceeded latency ceiling"
            );
        }

        debug!(
            tier = tier.as_str(),
            original_tokens,
            truncated_tokens = tokens,
            target,
            latency_ms,
            "Truncated content"
        );

        TruncatedContent {
            text: output,
            original_tokens,
            truncated_tokens: tokens.min(original_tokens),
            tier_used: tier,
            latency_ms,
        }
    }

    /// Keep the first 60% and the last 20% of the target, joined by a separator
    pub fn semantic_truncate(&self, text: &str, target: usize) -> String {
        let total_tokens = self.estimator.estimate(text);
        if total_tokens <= target {
            return text.to_string();
        }

        let chars_per_token = text.chars().count() as f64 / total_tokens.max(1) as f64;
        let head_chars = (target as f64 * self.config.semantic_head * chars_per_token).floor() as usize;
        let tail_chars = (target as f64 * self.config.semantic_tail * chars_per_token).floor() as usize;

        let head = snap_head(prefix_chars(text, head_chars));
        let tail = snap_tail(suffix_chars(text, tail_chars));

        format!("{}{}{}", head.trim_end(), self.config.separator, tail.trim_start())
    }

    /// Cut at the nearest sentence boundary before the target and append the
    /// truncation marker. Text within target is returned unchanged.
    pub fn hard_truncate(&self, text: &str, target: usize) -> String {
        let total_tokens = self.estimator.estimate(text);
        if total_tokens <= target {
            return text.to_string();
        }

        let marker = self.config.marker.as_str();
        let marker_tokens = self.estimator.estimate(marker);
        let (room, marker) = if target > marker_tokens {
            (target - marker_tokens, marker)
        } else {
            (target, "")
        };

        let chars_per_token = text.chars().count() as f64 / total_tokens as f64;
        let mut char_budget = (room as f64 * chars_per_token).floor() as usize;

        while char_budget > 0 {
            let cut = cut_at_sentence_boundary(prefix_chars(text, char_budget)).trim_end();
            let candidate = format!("{}{}", cut, marker);
            if self.estimator.estimate(&candidate) <= target {
                return candidate;
            }
            char_budget = char_budget * 9 / 10;
        }

        String::new()
    }
}

/// Drop a partial trailing word
fn snap_head(head: &str) -> &str {
    match head.rfind(char::is_whitespace) {
        Some(idx) if idx >= head.len() / 2 => &head[..idx],
        _ => head,
    }
}

/// Drop a partial leading word
fn snap_tail(tail: &str) -> &str {
    match tail.find(char::is_whitespace) {
        Some(idx) if idx <= tail.len() / 2 => &tail[idx..],
        _ => tail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::token_estimator::{estimate_tokens, HeuristicEstimator};

    fn engine() -> TruncationEngine {
        TruncationEngine::new(TruncationConfig::default(), Arc::new(HeuristicEstimator::default()))
    }

    fn sentences(count: usize) -> String {
        (0..count)
            .map(|i| format!("Sentence number {i} talks about general matters."))
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn test_summary_tier_regardless_of_target() {
        let engine = engine();
        assert_eq!(engine.select_truncation_tier(2200, true, 2000), TruncationTier::UseSummary);
        assert_eq!(engine.select_truncation_tier(2200, true, 100), TruncationTier::UseSummary);
    }

    #[test]
    fn test_tier_selection_by_ratio() {
        let engine = engine();
        assert_eq!(engine.select_truncation_tier(1800, false, 1000), TruncationTier::SemanticTruncation);
        assert_eq!(engine.select_truncation_tier(2000, false, 1000), TruncationTier::SemanticTruncation);
        assert_eq!(engine.select_truncation_tier(2001, false, 1000), TruncationTier::ExtractRelevant);
    }

    #[test]
    fn test_slow_extractor_is_skipped() {
        struct Slow;
        impl RelevanceExtractor for Slow {
            fn extract(&self, _: &str, _: &str, _: usize, _: &dyn TokenEstimator) -> String {
                String::new()
            }
            fn expected_latency_ms(&self) -> u64 {
                250
            }
            fn name(&self) -> &str {
                "slow"
            }
        }

        let engine = TruncationEngine::with_extractor(
            TruncationConfig::default(),
            Arc::new(HeuristicEstimator::default()),
            Arc::new(Slow),
        );
        assert_eq!(engine.select_truncation_tier(5000, false, 1000), TruncationTier::HardTruncation);
    }

    #[test]
    fn test_hard_truncate_leaves_fitting_text_alone() {
        let engine = engine();
        let text = "Short text that fits.";
        assert_eq!(engine.hard_truncate(text, 100), text);
        assert!(!engine.hard_truncate(text, 100).contains("[truncated]"));
    }

    #[test]
    fn test_hard_truncate_cuts_at_sentence() {
        let engine = engine();
        let text = sentences(40);
        let out = engine.hard_truncate(&text, 50);
        assert!(estimate_tokens(&out) <= 50);
        assert!(out.ends_with(". [truncated]"));
    }

    #[test]
    fn test_hard_truncate_tiny_target() {
        let engine = engine();
        let out = engine.hard_truncate(&sentences(10), 2);
        assert!(estimate_tokens(&out) <= 2);
        assert!(!out.contains("[truncated]"));
    }

    #[test]
    fn test_semantic_truncate_keeps_head_and_tail() {
        let engine = engine();
        let text = sentences(30);
        let tokens = estimate_tokens(&text);
        let target = tokens * 2 / 3;
        let out = engine.semantic_truncate(&text, target);

        assert!(out.starts_with("Sentence number 0"));
        assert!(out.contains("[...]"));
        assert!(out.trim_end().ends_with("general matters."));
        assert!(estimate_tokens(&out) <= target);
    }

    #[test]
    fn test_extract_relevant_prefers_query_terms() {
        let engine = engine();
        let mut text = sentences(60);
        text.push_str(" The quarterly revenue forecast was revised upward in March.");
        let result = engine.truncate_text(&text, estimate_tokens(&text), None, 40, "revenue forecast");

        assert_eq!(result.tier_used, TruncationTier::ExtractRelevant);
        assert!(result.text.contains("quarterly revenue forecast"));
        assert!(result.truncated_tokens <= 40);
        assert!(result.latency_ms <= 100);
    }

    #[test]
    fn test_truncate_uses_summary() {
        let engine = engine();
        let text = sentences(100);
        let result = engine.truncate_text(&text, 2200, Some("Short summary."), 500, "");
        assert_eq!(result.tier_used, TruncationTier::UseSummary);
        assert_eq!(result.text, "Short summary.");
        assert_eq!(result.original_tokens, 2200);
    }

    #[test]
    fn test_oversized_summary_is_hard_truncated() {
        let engine = engine();
        let summary = sentences(20);
        let result = engine.truncate_text(&sentences(100), 2200, Some(&summary), 30, "");
        assert_eq!(result.tier_used, TruncationTier::UseSummary);
        assert!(result.truncated_tokens <= 30);
        assert!(result.text.starts_with("Sentence number 0"));
    }

    #[test]
    fn test_within_target_is_unmodified() {
        let engine = engine();
        let result = engine.truncate_text("fits", 1, None, 10, "");
        assert_eq!(result.text, "fits");
        assert_eq!(result.truncated_tokens, 1);
    }
}
