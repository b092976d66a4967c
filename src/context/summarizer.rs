//! Background summarization hand-off
//!
//! This crate never calls a model. When the history manager raises
//! `needs_summarization`, a [`SummarizationRequest`] is built and handed to
//! a dispatcher after the response has gone out. The finished summary comes
//! back through [`SummaryStore`] and is read on the next request.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::history::{ConversationMessage, ConversationSummary, ManagedHistory};
use crate::config::{HistoryConfig, SummaryCacheConfig};

/// Job description for the cheap-model summarization worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummarizationRequest {
    pub conversation_id: String,
    /// Existing summary to fold into the new one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_summary: Option<String>,
    pub messages: Vec<ConversationMessage>,
    /// Message index range `[start, end)` the new summary will cover
    pub start: usize,
    pub end: usize,
    pub input_tokens: usize,
    pub max_output_tokens: usize,
    pub target_reduction: f64,
    pub requested_at: DateTime<Utc>,
}

impl SummarizationRequest {
    /// Plan a job from a managed history.
    ///
    /// Takes the oldest pending messages up to the input budget, so the
    /// summary always covers a contiguous prefix. Returns `None` when
    /// nothing needs or can be summarized.
    pub fn plan(
        conversation_id: &str,
        messages: &[ConversationMessage],
        per_message_tokens: &[usize],
        history: &ManagedHistory,
        config: &HistoryConfig,
    ) -> Option<Self> {
        if !history.needs_summarization || history.pending_end <= history.pending_start {
            return None;
        }
        let end_limit = history.pending_end.min(messages.len()).min(per_message_tokens.len());
        let start = history.pending_start;

        let previous_tokens = history.summary.as_ref().map_or(0, |s| s.tokens);
        let mut input_tokens = previous_tokens;
        let mut end = start;
        while end < end_limit && input_tokens + per_message_tokens[end] <= config.summary_input_tokens {
            input_tokens += per_message_tokens[end];
            end += 1;
        }
        if end == start {
            debug!(conversation_id, "Oldest pending message exceeds summary input budget");
            return None;
        }

        let reduced = (input_tokens as f64 * (1.0 - config.target_reduction)).ceil() as usize;
        Some(Self {
            conversation_id: conversation_id.to_string(),
            previous_summary: history.summary.as_ref().map(|s| s.text.clone()),
            messages: messages[start..end].to_vec(),
            start,
            end,
            input_tokens,
            max_output_tokens: reduced.clamp(1, config.summary_output_tokens),
            target_reduction: config.target_reduction,
            requested_at: Utc::now(),
        })
    }
}

/// Dispatch errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("Summarization queue is closed")]
    ChannelClosed,

    #[error("Summarization queue is full")]
    QueueFull,

    #[error("Dispatcher rejected job: {0}")]
    Rejected(String),
}

/// Async job dispatcher collaborator
#[async_trait]
pub trait SummarizationDispatcher: Send + Sync {
    /// Enqueue a job; must not wait for the job to run
    async fn dispatch(&self, request: SummarizationRequest) -> Result<(), DispatchError>;
}

/// Dispatcher backed by a bounded tokio channel
#[derive(Clone)]
pub struct ChannelDispatcher {
    sender: mpsc::Sender<SummarizationRequest>,
}

impl ChannelDispatcher {
    /// Create a dispatcher and the receiving end for the worker
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<SummarizationRequest>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl SummarizationDispatcher for ChannelDispatcher {
    async fn dispatch(&self, request: SummarizationRequest) -> Result<(), DispatchError> {
        let conversation_id = request.conversation_id.clone();
        self.sender.try_send(request).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DispatchError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => DispatchError::ChannelClosed,
        })?;
        info!(conversation_id = %conversation_id, "Dispatched background summarization");
        Ok(())
    }
}

/// Read side for summaries written back by the background job
#[derive(Clone)]
pub struct SummaryStore {
    cache: Cache<String, ConversationSummary>,
}

impl SummaryStore {
    pub fn new(config: &SummaryCacheConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.max_capacity)
            .time_to_live(Duration::from_secs(config.ttl_secs))
            .build();
        Self { cache }
    }

    pub async fn get(&self, conversation_id: &str) -> Option<ConversationSummary> {
        self.cache.get(conversation_id).await
    }

    /// Store a finished summary, replacing any older one
    pub async fn put(&self, conversation_id: &str, summary: ConversationSummary) {
        self.cache.insert(conversation_id.to_string(), summary).await;
    }

    pub async fn remove(&self, conversation_id: &str) {
        self.cache.invalidate(conversation_id).await;
    }
}

impl Default for SummaryStore {
    fn default() -> Self {
        Self::new(&SummaryCacheConfig::default())
    }
}
