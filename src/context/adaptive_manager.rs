//! Adaptive context manager
//!
//! Runs one request through the whole pipeline:
//! - Token estimation for the query, candidates and messages
//! - Budget allocation for the model
//! - Prioritization and packing of retrieved nodes, with truncation
//! - Attention-aware placement
//! - History windowing and the background summarization trigger
//!
//! Assembly is synchronous and request-scoped. Summarization is only
//! dispatched once the caller has sent its response.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::history::{ConversationHistoryManager, ConversationMessage, ConversationSummary, ManagedHistory};
use super::model_budget::{ModelBudgetResolver, StaticModelRegistry};
use super::models::{PackedContext, RetrievalCandidate};
use super::packer::NodePacker;
use super::placement::ContextPlacement;
use super::prioritizer::NodePrioritizer;
use super::summarizer::{DispatchError, SummarizationDispatcher, SummarizationRequest, SummaryStore};
use super::token_budget::{ContextAllocationResult, ContextBudgetAllocator, Thoroughness};
use super::token_estimator::{HeuristicEstimator, TokenCountSource, TokenEstimator};
use super::truncation::TruncationEngine;
use crate::config::Config;
use crate::error::Result;
use crate::metrics::{ContextAssemblyMetrics, MetricsSink, TracingSink};

/// Everything needed to assemble the context for one inference call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssemblyRequest {
    pub conversation_id: String,
    pub model_id: String,
    pub system_prompt: String,
    pub user_query: String,
    #[serde(default)]
    pub candidates: Vec<RetrievalCandidate>,
    #[serde(default)]
    pub critical_ids: Vec<String>,
    /// Full message log, oldest first
    #[serde(default)]
    pub messages: Vec<ConversationMessage>,
    #[serde(default)]
    pub summary: Option<ConversationSummary>,
    #[serde(default)]
    pub thoroughness: Option<Thoroughness>,
    /// Chunk expansions performed while building `candidates`
    #[serde(default)]
    pub expansion_count: usize,
    pub now: DateTime<Utc>,
}

impl AssemblyRequest {
    pub fn new(
        conversation_id: impl Into<String>,
        model_id: impl Into<String>,
        user_query: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            model_id: model_id.into(),
            system_prompt: String::new(),
            user_query: user_query.into(),
            candidates: Vec::new(),
            critical_ids: Vec::new(),
            messages: Vec::new(),
            summary: None,
            thoroughness: None,
            expansion_count: 0,
            now: Utc::now(),
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = system_prompt.into();
        self
    }

    pub fn with_candidates(mut self, candidates: Vec<RetrievalCandidate>) -> Self {
        self.candidates = candidates;
        self
    }

    pub fn with_critical_ids(mut self, critical_ids: Vec<String>) -> Self {
        self.critical_ids = critical_ids;
        self
    }

    pub fn with_messages(mut self, messages: Vec<ConversationMessage>) -> Self {
        self.messages = messages;
        self
    }

    pub fn with_summary(mut self, summary: ConversationSummary) -> Self {
        self.summary = Some(summary);
        self
    }

    pub fn with_thoroughness(mut self, thoroughness: Thoroughness) -> Self {
        self.thoroughness = Some(thoroughness);
        self
    }

    pub fn with_expansions(mut self, expansion_count: usize) -> Self {
        self.expansion_count = expansion_count;
        self
    }

    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }
}

/// Assembled context plus the decisions behind it
#[derive(Debug, Clone)]
pub struct AssembledContext {
    pub conversation_id: String,
    pub placement: ContextPlacement,
    pub allocation: ContextAllocationResult,
    pub packed: PackedContext,
    pub history: ManagedHistory,
    pub metrics: ContextAssemblyMetrics,
    /// Job to dispatch once the response is out
    pub summarization: Option<SummarizationRequest>,
}

impl AssembledContext {
    pub fn needs_summarization(&self) -> bool {
        self.history.needs_summarization
    }
}

/// Adaptive context manager
pub struct AdaptiveContextManager {
    estimator: Arc<dyn TokenEstimator>,
    allocator: ContextBudgetAllocator,
    prioritizer: NodePrioritizer,
    packer: NodePacker,
    history: ConversationHistoryManager,
    metrics: Arc<dyn MetricsSink>,
    dispatcher: Option<Arc<dyn SummarizationDispatcher>>,
}

impl AdaptiveContextManager {
    pub fn new(
        estimator: Arc<dyn TokenEstimator>,
        allocator: ContextBudgetAllocator,
        prioritizer: NodePrioritizer,
        packer: NodePacker,
        history: ConversationHistoryManager,
    ) -> Self {
        Self {
            estimator,
            allocator,
            prioritizer,
            packer,
            history,
            metrics: Arc::new(TracingSink),
            dispatcher: None,
        }
    }

    /// Build the full pipeline from configuration with the heuristic estimator
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::from_config_with_estimator(config, Arc::new(HeuristicEstimator::default()))
    }

    pub fn from_config_with_estimator(config: &Config, estimator: Arc<dyn TokenEstimator>) -> Result<Self> {
        config.validate()?;

        let registry = StaticModelRegistry::new(&config.models);
        let resolver = ModelBudgetResolver::new(Arc::new(registry), config.budget.clone());
        let prioritizer = NodePrioritizer::new(config.priority.clone(), Arc::clone(&estimator))?;
        let truncation = TruncationEngine::new(config.truncation.clone(), Arc::clone(&estimator));
        let packer = NodePacker::new(config.packer.clone(), Arc::new(truncation));
        let history = ConversationHistoryManager::new(config.history.clone());

        info!(
            models = config.models.len(),
            estimator = estimator.name(),
            "Initialized adaptive context manager"
        );

        Ok(Self::new(
            estimator,
            ContextBudgetAllocator::new(resolver),
            prioritizer,
            packer,
            history,
        ))
    }

    pub fn with_metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = sink;
        self
    }

    pub fn with_token_counts(mut self, source: Arc<dyn TokenCountSource>) -> Self {
        self.prioritizer = self.prioritizer.with_token_counts(source);
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn SummarizationDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn allocator(&self) -> &ContextBudgetAllocator {
        &self.allocator
    }

    /// Swap in a new budget configuration; cached templates are recomputed
    pub fn reload_budget(&mut self, config: &Config) -> Result<()> {
        config.budget.validate()?;
        self.allocator.resolver_mut().reload(config.budget.clone());
        Ok(())
    }

    /// Assemble the context for one request
    pub fn assemble(&self, request: &AssemblyRequest) -> Result<AssembledContext> {
        let started = Instant::now();

        let user_tokens = self.estimator.estimate(&request.user_query);
        let message_tokens: Vec<usize> = request
            .messages
            .iter()
            .map(|message| message.tokens.unwrap_or_else(|| self.estimator.estimate(&message.content)))
            .collect();

        let nodes = self
            .prioritizer
            .prioritize(&request.candidates, &request.user_query, request.now)?;
        let retrieved_tokens: usize = nodes.iter().map(|node| node.tokens).sum();
        let history_tokens = self.history_demand(request, &message_tokens);

        let allocation = self.allocator.allocate(
            &request.model_id,
            signed(user_tokens),
            signed(retrieved_tokens),
            signed(history_tokens),
            request.thoroughness,
        )?;

        let system_tokens = self.estimator.estimate(&request.system_prompt);
        if system_tokens > allocation.allocations.system_prompt {
            warn!(
                system_tokens,
                reserved = allocation.allocations.system_prompt,
                "System prompt exceeds its reservation"
            );
        }

        let considered = nodes.len();
        let packed = self.packer.pack(
            nodes,
            allocation.retrieved_budget,
            &request.critical_ids,
            &request.user_query,
        );

        let history_cap = self.history.config().max_tokens.min(allocation.history_budget);
        let history = self.history.manage_within(
            &request.messages,
            &message_tokens,
            request.summary.as_ref(),
            history_cap,
        )?;

        let summarization = SummarizationRequest::plan(
            &request.conversation_id,
            &request.messages,
            &message_tokens,
            &history,
            self.history.config(),
        );

        let placement = ContextPlacement::new(
            request.system_prompt.clone(),
            &packed.by_priority(),
            history.summary.clone(),
            history.recent_messages.clone(),
            request.user_query.clone(),
        );

        let mut metrics = ContextAssemblyMetrics::new(&request.model_id, allocation.action);
        metrics.tokens_used = system_tokens + allocation.allocations.user_message + packed.used_tokens + history.total_tokens;
        metrics.retrieved_tokens = packed.used_tokens;
        metrics.history_tokens = history.total_tokens;
        metrics.truncation_count = packed.truncated_count;
        metrics.expansion_count = request.expansion_count;
        metrics.nodes_considered = considered;
        metrics.nodes_included = packed.nodes.len();
        metrics.latency_ms = started.elapsed().as_millis() as u64;
        self.metrics.record(&metrics);

        debug!(
            conversation_id = %request.conversation_id,
            action = allocation.action.as_str(),
            included = packed.nodes.len(),
            considered,
            history_tokens = history.total_tokens,
            needs_summarization = history.needs_summarization,
            "Assembled context"
        );

        Ok(AssembledContext {
            conversation_id: request.conversation_id.clone(),
            placement,
            allocation,
            packed,
            history,
            metrics,
            summarization,
        })
    }

    /// Assemble after reading the latest background summary, if the request
    /// does not already carry one
    pub async fn assemble_with_summary_store(
        &self,
        mut request: AssemblyRequest,
        store: &SummaryStore,
    ) -> Result<AssembledContext> {
        if request.summary.is_none() {
            request.summary = store.get(&request.conversation_id).await;
        }
        self.assemble(&request)
    }

    /// Hand the pending summarization job to the dispatcher on its own task.
    ///
    /// Call after the response has been sent. Returns `None` when there is
    /// nothing to dispatch, no dispatcher is configured, or no Tokio runtime
    /// is running.
    pub fn dispatch_after_response(
        &self,
        assembled: &AssembledContext,
    ) -> Option<JoinHandle<std::result::Result<(), DispatchError>>> {
        let request = assembled.summarization.clone()?;
        let Some(dispatcher) = self.dispatcher.clone() else {
            debug!(
                conversation_id = %assembled.conversation_id,
                "Summarization needed but no dispatcher configured"
            );
            return None;
        };

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                conversation_id = %assembled.conversation_id,
                "No Tokio runtime, summarization not dispatched"
            );
            return None;
        };

        let metrics = Arc::clone(&self.metrics);
        Some(runtime.spawn(async move {
            let conversation_id = request.conversation_id.clone();
            let result = dispatcher.dispatch(request).await;
            match &result {
                Ok(()) => metrics.record_summarization(&conversation_id),
                Err(e) => warn!(conversation_id = %conversation_id, error = %e, "Summarization dispatch failed"),
            }
            result
        }))
    }

    /// Tokens the history would take if kept whole: the summary plus every
    /// message it does not cover
    fn history_demand(&self, request: &AssemblyRequest, message_tokens: &[usize]) -> usize {
        match &request.summary {
            Some(summary) => {
                let covered = summary.covers_through.min(message_tokens.len());
                summary.tokens + message_tokens[covered..].iter().sum::<usize>()
            }
            None => message_tokens.iter().sum(),
        }
    }
}

fn signed(tokens: usize) -> i64 {
    i64::try_from(tokens).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelEntry;
    use crate::context::model_budget::Provider;
    use crate::context::summarizer::ChannelDispatcher;
    use crate::context::token_budget::AllocationAction;

    fn config() -> Config {
        Config {
            models: vec![ModelEntry {
                id: "claude".to_string(),
                context_window: 200_000,
                provider: Provider::Anthropic,
            }],
            ..Config::default()
        }
    }

    fn manager() -> AdaptiveContextManager {
        AdaptiveContextManager::from_config(&config()).unwrap()
    }

    fn conversation(turns: usize) -> Vec<ConversationMessage> {
        (0..turns)
            .flat_map(|i| {
                [
                    ConversationMessage::user(format!("question {i}")).with_tokens(20),
                    ConversationMessage::assistant(format!("answer {i}")).with_tokens(30),
                ]
            })
            .collect()
    }

    fn candidates(now: DateTime<Utc>) -> Vec<RetrievalCandidate> {
        [0.92, 0.85, 0.78, 0.71, 0.65]
            .iter()
            .enumerate()
            .map(|(i, score)| {
                RetrievalCandidate::new(format!("n{}", i + 1), *score, now)
                    .with_content(format!("Note {} about the garden.", i + 1))
            })
            .collect()
    }

    #[test]
    fn test_assemble_small_request() {
        let now = Utc::now();
        let request = AssemblyRequest::new("conv-1", "claude", "What did I plant?")
            .with_system_prompt("You are a helpful assistant.")
            .with_candidates(candidates(now))
            .with_messages(conversation(2))
            .at(now);

        let assembled = manager().assemble(&request).unwrap();
        assert_eq!(assembled.allocation.action, AllocationAction::Proceed);

        let ids: Vec<_> = assembled
            .placement
            .retrieved_nodes
            .iter()
            .map(|n| n.node_id.as_str())
            .collect();
        assert_eq!(ids, vec!["n2", "n3", "n4", "n5", "n1"]);
        assert_eq!(assembled.placement.recent_messages.len(), 4);
        assert_eq!(assembled.metrics.nodes_considered, 5);
        assert_eq!(assembled.metrics.nodes_included, 5);
        assert!(!assembled.metrics.overflow);
        assert!(assembled.summarization.is_none());
    }

    #[test]
    fn test_unknown_model_uses_fallback() {
        let request = AssemblyRequest::new("conv-1", "mystery-model", "hello");
        let assembled = manager().assemble(&request).unwrap();
        assert!(assembled.allocation.allocations.is_within_budget(assembled.allocation.budget.total_context));
    }

    #[test]
    fn test_long_conversation_plans_summary() {
        let request = AssemblyRequest::new("conv-2", "claude", "and now?").with_messages(conversation(12));
        let assembled = manager().assemble(&request).unwrap();
        assert!(assembled.needs_summarization());
        let job = assembled.summarization.as_ref().unwrap();
        assert_eq!(job.conversation_id, "conv-2");
        assert_eq!(job.start, 0);
    }

    #[derive(Default)]
    struct DispatchCounter {
        dispatched: std::sync::Mutex<Vec<String>>,
    }

    impl MetricsSink for DispatchCounter {
        fn record(&self, _metrics: &ContextAssemblyMetrics) {}

        fn record_summarization(&self, conversation_id: &str) {
            self.dispatched.lock().unwrap().push(conversation_id.to_string());
        }
    }

    #[tokio::test]
    async fn test_dispatch_after_response() {
        let (dispatcher, mut receiver) = ChannelDispatcher::new(4);
        let counter = Arc::new(DispatchCounter::default());
        let manager = manager()
            .with_dispatcher(Arc::new(dispatcher))
            .with_metrics_sink(counter.clone());
        let request = AssemblyRequest::new("conv-3", "claude", "continue").with_messages(conversation(12));
        let assembled = manager.assemble(&request).unwrap();

        let handle = manager.dispatch_after_response(&assembled).unwrap();
        handle.await.unwrap().unwrap();
        let job = receiver.recv().await.unwrap();
        assert_eq!(job.conversation_id, "conv-3");
        assert_eq!(*counter.dispatched.lock().unwrap(), vec!["conv-3".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_dispatch_not_counted() {
        let (dispatcher, receiver) = ChannelDispatcher::new(4);
        drop(receiver);
        let counter = Arc::new(DispatchCounter::default());
        let manager = manager()
            .with_dispatcher(Arc::new(dispatcher))
            .with_metrics_sink(counter.clone());
        let request = AssemblyRequest::new("conv-5", "claude", "continue").with_messages(conversation(12));
        let assembled = manager.assemble(&request).unwrap();

        let result = manager.dispatch_after_response(&assembled).unwrap().await.unwrap();
        assert_eq!(result, Err(DispatchError::ChannelClosed));
        assert!(counter.dispatched.lock().unwrap().is_empty());
    }

    #[test]
    fn test_dispatch_without_runtime_returns_none() {
        let (dispatcher, _receiver) = ChannelDispatcher::new(4);
        let manager = manager().with_dispatcher(Arc::new(dispatcher));
        let request = AssemblyRequest::new("conv-6", "claude", "continue").with_messages(conversation(12));
        let assembled = manager.assemble(&request).unwrap();

        assert!(assembled.needs_summarization());
        assert!(manager.dispatch_after_response(&assembled).is_none());
    }

    #[tokio::test]
    async fn test_summary_store_is_read() {
        let store = SummaryStore::default();
        store
            .put("conv-4", ConversationSummary::new("Earlier we planned the garden.", 12, 16))
            .await;

        let request = AssemblyRequest::new("conv-4", "claude", "what next?").with_messages(conversation(12));
        let assembled = manager().assemble_with_summary_store(request, &store).await.unwrap();

        assert!(assembled.placement.conversation_summary.is_some());
        // 4 turns remain unsummarized
        assert!(!assembled.needs_summarization());
        assert_eq!(assembled.placement.recent_messages.len(), 8);
    }

    #[test]
    fn test_signed_saturates() {
        assert_eq!(signed(usize::MAX), i64::MAX);
        assert_eq!(signed(42), 42);
    }
}
