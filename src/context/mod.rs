//! Context window management
//!
//! Decides what goes into a model's input window, in which order and how
//! truncated: budget allocation per model, node prioritization and packing,
//! tiered truncation, attention-aware placement and conversation history.

pub mod adaptive_manager;
pub mod history;
pub mod model_budget;
pub mod models;
pub mod packer;
pub mod placement;
pub mod prioritizer;
pub mod summarizer;
pub mod token_budget;
pub mod token_estimator;
pub mod truncation;

pub use adaptive_manager::{AdaptiveContextManager, AssembledContext, AssemblyRequest};
pub use history::{ConversationHistoryManager, ConversationMessage, ConversationSummary, ManagedHistory, Role};
pub use model_budget::{
    FixedReservations, ModelBudgetResolver, ModelConfig, ModelConfigSource, ModelContextBudget, Provider,
    StaticModelRegistry,
};
pub use models::{PackedContext, PrioritizedNode, PriorityFactors, RetrievalCandidate, TruncatedContent, TruncationTier};
pub use packer::NodePacker;
pub use placement::{reorder, ContextPlacement, PlacementSection};
pub use prioritizer::NodePrioritizer;
pub use summarizer::{ChannelDispatcher, DispatchError, SummarizationDispatcher, SummarizationRequest, SummaryStore};
pub use token_budget::{
    AllocationAction, BudgetAllocation, BudgetError, ContextAllocationResult, ContextBudgetAllocator, Thoroughness,
};
pub use token_estimator::{
    estimate_tokens, resolve_tokens, CountOrigin, HeuristicEstimator, ResolvedCount, TiktokenEstimator,
    TokenCountCache, TokenCountSource, TokenEstimator, WordBasedEstimator,
};
pub use truncation::{LexicalOverlapExtractor, RelevanceExtractor, TruncationEngine};
