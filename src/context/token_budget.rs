//! Context budget allocation
//!
//! Combines a model's budget template with the sizes of the current request:
//! - User message: at least `min_user_message`, excess taken from the pool
//! - Retrieved context / history: the remaining pool split by ratio
//! - Sparse retrieval: response buffer grows by a fixed credit
//! - Unused retrieval (under half its share) is donated to history
//!
//! Overflow never fails: it is reported as an [`AllocationAction`].

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use super::model_budget::{split_pool, ModelBudgetResolver, ModelContextBudget};
use crate::error::ValidationError;

/// What the caller has to do for the request to fit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationAction {
    Proceed,
    PrioritizeNodes,
    SummarizeHistory,
}

impl AllocationAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AllocationAction::Proceed => "proceed",
            AllocationAction::PrioritizeNodes => "prioritize_nodes",
            AllocationAction::SummarizeHistory => "summarize_history",
        }
    }
}

/// How much evidence the caller wants relative to history
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Thoroughness {
    Quick,
    #[default]
    Balanced,
    Thorough,
}

impl Thoroughness {
    /// Adjust a provider ratio for this thoroughness level
    pub fn adjust_ratio(self, ratio: f64) -> f64 {
        let shifted = match self {
            Thoroughness::Quick => ratio - 0.10,
            Thoroughness::Balanced => ratio,
            Thoroughness::Thorough => ratio + 0.10,
        };
        shifted.clamp(0.50, 0.85)
    }
}

/// Concrete token allocations per section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetAllocation {
    pub system_prompt: usize,
    pub user_message: usize,
    pub retrieved: usize,
    pub history: usize,
    pub response: usize,
}

impl BudgetAllocation {
    pub fn total(&self) -> usize {
        self.system_prompt + self.user_message + self.retrieved + self.history + self.response
    }

    /// Check if this allocation fits within the budget
    pub fn is_within_budget(&self, max_total: usize) -> bool {
        self.total() <= max_total
    }
}

/// Allocation decision for one request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextAllocationResult {
    pub action: AllocationAction,
    pub allocations: BudgetAllocation,
    pub unused_tokens: usize,
    /// Ceiling for packed retrieved content
    pub retrieved_budget: usize,
    /// Ceiling for verbatim history, donation included
    pub history_budget: usize,
    pub donated_to_history: usize,
    pub user_message_capped: bool,
    pub sparse_retrieval: bool,
    /// Budget actually used, adjusted for sparse retrieval when applicable
    pub budget: Arc<ModelContextBudget>,
}

impl ContextAllocationResult {
    pub fn is_overflow(&self) -> bool {
        self.action != AllocationAction::Proceed
    }
}

/// Token budget errors
#[derive(Debug, Error)]
pub enum BudgetError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error("Allocation invariant violated: {allocated} tokens allocated, {max} tokens max")]
    ConfigurationInvalid { allocated: usize, max: usize },
}

/// Context budget allocator
pub struct ContextBudgetAllocator {
    resolver: ModelBudgetResolver,
}

impl ContextBudgetAllocator {
    pub fn new(resolver: ModelBudgetResolver) -> Self {
        Self { resolver }
    }

    pub fn resolver(&self) -> &ModelBudgetResolver {
        &self.resolver
    }

    pub fn resolver_mut(&mut self) -> &mut ModelBudgetResolver {
        &mut self.resolver
    }

    /// Allocate the context window for one request.
    ///
    /// Token counts arrive signed from the boundary and are rejected when
    /// negative.
    pub fn allocate(
        &self,
        model_id: &str,
        user_tokens: i64,
        retrieved_tokens: i64,
        history_tokens: i64,
        thoroughness: Option<Thoroughness>,
    ) -> Result<ContextAllocationResult, BudgetError> {
        let user_tokens = non_negative("user_tokens", user_tokens)?;
        let retrieved_tokens = non_negative("retrieved_tokens", retrieved_tokens)?;
        let history_tokens = non_negative("history_tokens", history_tokens)?;

        let template = self.resolver.resolve(model_id)?;
        let config = self.resolver.config();

        let sparse_retrieval = retrieved_tokens < config.sparse_retrieval_threshold;
        let budget = if sparse_retrieval {
            Arc::new(template.with_sparse_retrieval_credit(config.sparse_response_credit))
        } else {
            template
        };

        // User message excess comes out of the pool before the split
        let fixed = budget.fixed;
        let mut user_allocation = user_tokens.max(fixed.min_user_message);
        let max_user = fixed.min_user_message + budget.flexible_pool;
        let user_message_capped = user_allocation > max_user;
        if user_message_capped {
            warn!(
                model_id,
                user_tokens,
                max_user,
                "User message exceeds the whole flexible pool, capping allocation"
            );
            user_allocation = max_user;
        }
        let pool = budget.flexible_pool - (user_allocation - fixed.min_user_message);

        let ratio = thoroughness
            .map(|t| t.adjust_ratio(budget.retrieval_ratio))
            .unwrap_or(budget.retrieval_ratio);
        let (retrieved_budget, base_history_budget) = split_pool(pool, ratio);

        // Donation only flows retrieval -> history
        let donated_to_history = if retrieved_tokens * 2 < retrieved_budget {
            retrieved_budget - retrieved_tokens
        } else {
            0
        };
        let history_budget = base_history_budget + donated_to_history;

        let action = if retrieved_tokens > retrieved_budget {
            AllocationAction::PrioritizeNodes
        } else if history_tokens > history_budget {
            AllocationAction::SummarizeHistory
        } else {
            AllocationAction::Proceed
        };

        let allocations = BudgetAllocation {
            system_prompt: fixed.system_prompt,
            user_message: user_allocation,
            retrieved: retrieved_tokens.min(retrieved_budget),
            history: history_tokens.min(history_budget),
            response: fixed.response_buffer,
        };

        let allocated = allocations.total();
        if allocated > budget.total_context {
            return Err(BudgetError::ConfigurationInvalid {
                allocated,
                max: budget.total_context,
            });
        }

        debug!(
            model_id,
            ?action,
            user = allocations.user_message,
            retrieved = allocations.retrieved,
            retrieved_budget,
            history = allocations.history,
            history_budget,
            donated_to_history,
            response = allocations.response,
            sparse_retrieval,
            "Context allocation"
        );

        Ok(ContextAllocationResult {
            action,
            allocations,
            unused_tokens: budget.total_context - allocated,
            retrieved_budget,
            history_budget,
            donated_to_history,
            user_message_capped,
            sparse_retrieval,
            budget,
        })
    }
}

fn non_negative(field: &'static str, value: i64) -> Result<usize, ValidationError> {
    usize::try_from(value).map_err(|_| ValidationError::NegativeTokenCount { field, value })
}
