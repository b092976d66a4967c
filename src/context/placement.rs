//! Attention-aware placement
//!
//! Models attend most to the start and end of their input. The most relevant
//! node goes last, the second most relevant first, everything else in the
//! middle.

use serde::{Deserialize, Serialize};

use super::history::{ConversationMessage, ConversationSummary};
use super::models::PrioritizedNode;

/// Reorder items sorted by descending priority for attention placement.
///
/// `[1st, 2nd, 3rd, ..., last]` becomes `[2nd, 3rd, ..., last, 1st]`.
/// The input is left untouched.
pub fn reorder<T: Clone>(sorted_desc: &[T]) -> Vec<T> {
    match sorted_desc.split_first() {
        Some((first, rest)) if !rest.is_empty() => {
            let mut reordered = Vec::with_capacity(sorted_desc.len());
            reordered.extend_from_slice(rest);
            reordered.push(first.clone());
            reordered
        }
        _ => sorted_desc.to_vec(),
    }
}

/// One section of the final prompt, in emission order
#[derive(Debug, Clone, Copy)]
pub enum PlacementSection<'a> {
    SystemPrompt(&'a str),
    RetrievedNode(&'a PrioritizedNode),
    ConversationSummary(&'a ConversationSummary),
    RecentMessage(&'a ConversationMessage),
    UserQuery(&'a str),
}

/// Ordered context handed to prompt assembly:
/// system → primacy node → buried nodes → recency node → history → query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextPlacement {
    pub system_prompt: String,
    /// Already reordered for attention
    pub retrieved_nodes: Vec<PrioritizedNode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_summary: Option<ConversationSummary>,
    pub recent_messages: Vec<ConversationMessage>,
    pub user_query: String,
}

impl ContextPlacement {
    /// Build a placement from nodes sorted by descending priority
    pub fn new(
        system_prompt: String,
        nodes_by_priority: &[PrioritizedNode],
        conversation_summary: Option<ConversationSummary>,
        recent_messages: Vec<ConversationMessage>,
        user_query: String,
    ) -> Self {
        Self {
            system_prompt,
            retrieved_nodes: reorder(nodes_by_priority),
            conversation_summary,
            recent_messages,
            user_query,
        }
    }

    /// Sections in the exact order they go into the prompt
    pub fn sections(&self) -> Vec<PlacementSection<'_>> {
        let mut sections = Vec::with_capacity(self.retrieved_nodes.len() + self.recent_messages.len() + 3);
        sections.push(PlacementSection::SystemPrompt(&self.system_prompt));
        sections.extend(self.retrieved_nodes.iter().map(PlacementSection::RetrievedNode));
        if let Some(summary) = &self.conversation_summary {
            sections.push(PlacementSection::ConversationSummary(summary));
        }
        sections.extend(self.recent_messages.iter().map(PlacementSection::RecentMessage));
        sections.push(PlacementSection::UserQuery(&self.user_query));
        sections
    }
}
