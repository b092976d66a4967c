//! Greedy packing of prioritized nodes into the retrieved budget
//!
//! Critical nodes go first when they fit together. The rest are added by
//! descending priority; the top few misfits get a truncation attempt before
//! being excluded. `used_tokens` never exceeds `budget_tokens`.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

use super::models::{sort_by_priority, PackedContext, PrioritizedNode};
use super::truncation::TruncationEngine;
use crate::config::PackerConfig;

/// Packs prioritized nodes into a token budget
pub struct NodePacker {
    config: PackerConfig,
    truncation: Arc<TruncationEngine>,
}

impl NodePacker {
    pub fn new(config: PackerConfig, truncation: Arc<TruncationEngine>) -> Self {
        Self { config, truncation }
    }

    pub fn truncation(&self) -> &TruncationEngine {
        &self.truncation
    }

    /// Fit `candidates` into `budget_tokens`.
    ///
    /// A node is critical when it is flagged as such or its id is listed in
    /// `critical_ids`.
    pub fn pack(
        &self,
        candidates: Vec<PrioritizedNode>,
        budget_tokens: usize,
        critical_ids: &[String],
        query: &str,
    ) -> PackedContext {
        let critical_set: HashSet<&str> = critical_ids.iter().map(String::as_str).collect();
        let (critical, mut remainder): (Vec<_>, Vec<_>) = candidates
            .into_iter()
            .partition(|node| node.is_critical || critical_set.contains(node.node_id.as_str()));

        let mut packed = PackedContext {
            budget_tokens,
            ..PackedContext::default()
        };

        let critical_tokens: usize = critical.iter().map(|n| n.tokens).sum();
        if critical_tokens <= budget_tokens {
            packed.used_tokens = critical_tokens;
            packed.nodes.extend(critical.into_iter().map(|mut node| {
                node.is_critical = true;
                node
            }));
        } else {
            warn!(
                critical_tokens,
                budget_tokens,
                "Critical nodes do not fit together, packing them by priority"
            );
            remainder.extend(critical);
        }

        sort_by_priority(&mut remainder);

        let mut truncation_attempts = 0;
        for node in remainder {
            let available = budget_tokens - packed.used_tokens;

            if node.tokens <= available {
                packed.used_tokens += node.tokens;
                packed.nodes.push(node);
                continue;
            }

            if truncation_attempts < self.config.max_truncation_attempts {
                truncation_attempts += 1;
                if available >= self.config.min_truncation_target {
                    if let Some(truncated) = self.try_truncate(&node, available, query) {
                        packed.used_tokens += truncated.tokens;
                        packed.truncated_count += 1;
                        packed.nodes.push(truncated);
                        continue;
                    }
                }
            }

            debug!(node_id = %node.node_id, tokens = node.tokens, available, "Excluding node");
            packed.excluded_count += 1;
            packed.excluded_ids.push(node.node_id);
        }

        debug!(
            included = packed.nodes.len(),
            excluded = packed.excluded_count,
            truncated = packed.truncated_count,
            used = packed.used_tokens,
            budget = budget_tokens,
            "Packed retrieved context"
        );
        packed
    }

    fn try_truncate(&self, node: &PrioritizedNode, available: usize, query: &str) -> Option<PrioritizedNode> {
        let truncated = self.truncation.truncate(node, available, query);
        if truncated.truncated_tokens > available || truncated.text.trim().is_empty() {
            warn!(
                node_id = %node.node_id,
                tier = truncated.tier_used.as_str(),
                truncated_tokens = truncated.truncated_tokens,
                available,
                "Truncation could not bring node under budget"
            );
            return None;
        }

        Some(PrioritizedNode {
            content: truncated.text,
            tokens: truncated.truncated_tokens,
            was_truncated: true,
            truncation_tier: Some(truncated.tier_used),
            ..node.clone()
        })
    }
}
