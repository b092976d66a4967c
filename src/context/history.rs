//! Conversation history management
//!
//! Keeps the most recent turns verbatim under a token cap, reads back a
//! summary written by the background job, and raises a flag when enough
//! unsummarized conversation has piled up. It never summarizes inline.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::HistoryConfig;
use crate::error::ValidationError;

/// Message author
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One entry of the conversation log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<usize>,
}

impl ConversationMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tokens: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn with_tokens(mut self, tokens: usize) -> Self {
        self.tokens = Some(tokens);
        self
    }
}

/// Summary produced out of band for a conversation prefix
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub text: String,
    pub tokens: usize,
    /// Number of leading messages the summary covers
    pub covers_through: usize,
}

impl ConversationSummary {
    pub fn new(text: impl Into<String>, tokens: usize, covers_through: usize) -> Self {
        Self {
            text: text.into(),
            tokens,
            covers_through,
        }
    }
}

/// History prepared for one request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedHistory {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<ConversationSummary>,
    pub recent_messages: Vec<ConversationMessage>,
    pub total_tokens: usize,
    pub needs_summarization: bool,
    pub turn_count: usize,
    /// Index of the first message kept verbatim
    pub verbatim_start: usize,
    /// First message not yet covered by a summary
    pub pending_start: usize,
    /// End (exclusive) of the range the next summary should cover
    pub pending_end: usize,
}

impl ManagedHistory {
    pub fn empty() -> Self {
        Self {
            summary: None,
            recent_messages: Vec::new(),
            total_tokens: 0,
            needs_summarization: false,
            turn_count: 0,
            verbatim_start: 0,
            pending_start: 0,
            pending_end: 0,
        }
    }
}

/// Turn number (1-based) of every message.
///
/// A turn begins at each user message; anything before the first user
/// message belongs to turn 1.
pub fn turn_numbers(messages: &[ConversationMessage]) -> Vec<usize> {
    let mut turn = 0;
    let mut seen_user = false;
    messages
        .iter()
        .map(|message| {
            if message.role == Role::User {
                if seen_user || turn == 0 {
                    turn += 1;
                }
                seen_user = true;
            } else if turn == 0 {
                turn = 1;
            }
            turn
        })
        .collect()
}

/// Conversation history manager
pub struct ConversationHistoryManager {
    config: HistoryConfig,
}

impl ConversationHistoryManager {
    pub fn new(config: HistoryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &HistoryConfig {
        &self.config
    }

    /// Build the history window with the configured token cap
    pub fn manage(
        &self,
        messages: &[ConversationMessage],
        per_message_tokens: &[usize],
        summary: Option<&ConversationSummary>,
    ) -> Result<ManagedHistory, ValidationError> {
        self.manage_within(messages, per_message_tokens, summary, self.config.max_tokens)
    }

    /// Build the history window, capped at `max_tokens` (summary included)
    pub fn manage_within(
        &self,
        messages: &[ConversationMessage],
        per_message_tokens: &[usize],
        summary: Option<&ConversationSummary>,
        max_tokens: usize,
    ) -> Result<ManagedHistory, ValidationError> {
        if messages.len() != per_message_tokens.len() {
            return Err(ValidationError::TokenCountMismatch {
                messages: messages.len(),
                counts: per_message_tokens.len(),
            });
        }
        if messages.is_empty() {
            return Ok(ManagedHistory::empty());
        }

        let turns = turn_numbers(messages);
        let turn_count = turns.last().copied().unwrap_or(0);

        // A summary is only usable for the prefix it covers and when it fits
        let summary = summary
            .filter(|s| s.covers_through > 0)
            .filter(|s| s.tokens <= max_tokens)
            .map(|s| ConversationSummary {
                covers_through: s.covers_through.min(messages.len()),
                ..s.clone()
            });
        let pending_start = summary.as_ref().map_or(0, |s| s.covers_through);
        let summary_tokens = summary.as_ref().map_or(0, |s| s.tokens);

        // Without a summary, fall back to a wider verbatim window
        let window_turns = if summary.is_some() {
            self.config.max_turns
        } else {
            self.config.max_turns * self.config.fallback_turn_multiplier.max(1)
        };
        let oldest_turn = turn_count.saturating_sub(window_turns) + 1;
        let verbatim_cap = max_tokens - summary_tokens;

        let mut verbatim_start = messages.len();
        let mut verbatim_tokens = 0;
        for idx in (pending_start..messages.len()).rev() {
            if turns[idx] < oldest_turn || verbatim_tokens + per_message_tokens[idx] > verbatim_cap {
                break;
            }
            verbatim_tokens += per_message_tokens[idx];
            verbatim_start = idx;
        }

        let pending_turns = {
            let mut distinct: Vec<usize> = turns[pending_start..].to_vec();
            distinct.dedup();
            distinct.len()
        };
        let pending_tokens: usize = per_message_tokens[pending_start..].iter().sum();
        let needs_summarization = pending_turns >= self.config.summarize_turns
            || pending_tokens >= self.config.summarize_tokens;

        // The next summary ends where the regular window begins, or later
        // when the token cap already dropped messages inside it
        let regular_oldest = turn_count.saturating_sub(self.config.max_turns) + 1;
        let regular_start = turns
            .iter()
            .position(|&turn| turn >= regular_oldest)
            .unwrap_or(messages.len());
        let pending_end = regular_start.max(verbatim_start).max(pending_start);

        debug!(
            turn_count,
            verbatim = messages.len() - verbatim_start,
            verbatim_tokens,
            summary_tokens,
            pending_turns,
            pending_tokens,
            needs_summarization,
            "Managed conversation history"
        );

        Ok(ManagedHistory {
            summary,
            recent_messages: messages[verbatim_start..].to_vec(),
            total_tokens: summary_tokens + verbatim_tokens,
            needs_summarization,
            turn_count,
            verbatim_start,
            pending_start,
            pending_end,
        })
    }
}
