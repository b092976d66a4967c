//! Model budget resolution
//!
//! Turns a model id into an immutable [`ModelContextBudget`]: fixed
//! reservations, the flexible pool left after them and its default split
//! between retrieval and history. Templates are computed once per model and
//! shared read-only; a configuration change replaces them wholesale.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::{model_table, ModelEntry, TokenBudgetConfig};
use crate::error::ValidationError;

/// LLM provider family, drives the retrieval ratio
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Anthropic,
    #[serde(alias = "open_ai")]
    OpenAi,
    Google,
    Local,
    #[default]
    Other,
}

/// What the routing collaborator knows about a model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub context_window: usize,
    pub provider: Provider,
}

/// Source of per-model window sizes (LLM routing collaborator)
pub trait ModelConfigSource: Send + Sync {
    fn get_model_config(&self, model_id: &str) -> Option<ModelConfig>;
}

/// Model registry seeded from configuration
#[derive(Debug, Clone, Default)]
pub struct StaticModelRegistry {
    models: HashMap<String, ModelEntry>,
}

impl StaticModelRegistry {
    pub fn new(entries: &[ModelEntry]) -> Self {
        Self {
            models: model_table(entries),
        }
    }

    pub fn with_model(mut self, id: &str, context_window: usize, provider: Provider) -> Self {
        self.models.insert(
            id.to_string(),
            ModelEntry {
                id: id.to_string(),
                context_window,
                provider,
            },
        );
        self
    }
}

impl ModelConfigSource for StaticModelRegistry {
    fn get_model_config(&self, model_id: &str) -> Option<ModelConfig> {
        self.models.get(model_id).map(|entry| ModelConfig {
            context_window: entry.context_window,
            provider: entry.provider,
        })
    }
}

/// Tokens reserved regardless of request content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedReservations {
    pub system_prompt: usize,
    pub min_user_message: usize,
    pub response_buffer: usize,
}

impl FixedReservations {
    pub fn total(&self) -> usize {
        self.system_prompt + self.min_user_message + self.response_buffer
    }
}

/// Per-model budget template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelContextBudget {
    pub model_id: String,
    pub provider: Provider,
    pub total_context: usize,
    pub fixed: FixedReservations,
    pub flexible_pool: usize,
    pub retrieval_ratio: f64,
    pub default_retrieved: usize,
    pub default_history: usize,
}

impl ModelContextBudget {
    /// Compute a budget from a window, reservations and a retrieval ratio
    pub fn compute(
        model_id: &str,
        provider: Provider,
        total_context: usize,
        fixed: FixedReservations,
        retrieval_ratio: f64,
    ) -> Result<Self, ValidationError> {
        if !(retrieval_ratio > 0.0 && retrieval_ratio < 1.0) {
            return Err(ValidationError::InvalidRatio(retrieval_ratio));
        }
        if fixed.total() >= total_context {
            return Err(ValidationError::NoFlexiblePool {
                reserved: fixed.total(),
                total: total_context,
            });
        }

        let flexible_pool = total_context - fixed.total();
        let (default_retrieved, default_history) = split_pool(flexible_pool, retrieval_ratio);

        Ok(Self {
            model_id: model_id.to_string(),
            provider,
            total_context,
            fixed,
            flexible_pool,
            retrieval_ratio,
            default_retrieved,
            default_history,
        })
    }

    /// Copy of this budget with `credit` tokens moved from the flexible pool
    /// into the response buffer. The template itself is left untouched.
    pub fn with_sparse_retrieval_credit(&self, credit: usize) -> Self {
        let credit = credit.min(self.flexible_pool);
        let flexible_pool = self.flexible_pool - credit;
        let (default_retrieved, default_history) = split_pool(flexible_pool, self.retrieval_ratio);

        Self {
            fixed: FixedReservations {
                response_buffer: self.fixed.response_buffer + credit,
                ..self.fixed
            },
            flexible_pool,
            default_retrieved,
            default_history,
            ..self.clone()
        }
    }
}

/// Split a pool into (retrieved, history) by ratio
pub fn split_pool(pool: usize, ratio: f64) -> (usize, usize) {
    let retrieved = ((pool as f64) * ratio).round() as usize;
    let retrieved = retrieved.min(pool);
    (retrieved, pool - retrieved)
}

/// Resolves and caches budget templates per model
pub struct ModelBudgetResolver {
    source: Arc<dyn ModelConfigSource>,
    config: TokenBudgetConfig,
    templates: DashMap<String, Arc<ModelContextBudget>>,
}

impl ModelBudgetResolver {
    pub fn new(source: Arc<dyn ModelConfigSource>, config: TokenBudgetConfig) -> Self {
        Self {
            source,
            config,
            templates: DashMap::new(),
        }
    }

    /// Budget template for a model, computed on first use
    pub fn resolve(&self, model_id: &str) -> Result<Arc<ModelContextBudget>, ValidationError> {
        if let Some(template) = self.templates.get(model_id) {
            return Ok(Arc::clone(template.value()));
        }

        let model = match self.source.get_model_config(model_id) {
            Some(model) => model,
            None if self.config.allow_fallback => {
                warn!(
                    model_id,
                    fallback_window = self.config.fallback_context_window,
                    "Unknown model, using conservative fallback budget"
                );
                ModelConfig {
                    context_window: self.config.fallback_context_window,
                    provider: Provider::Other,
                }
            }
            None => return Err(ValidationError::UnknownModel(model_id.to_string())),
        };

        let fixed = self.reservations_for(model.context_window);
        let ratio = self.config.provider_ratios.for_provider(model.provider);
        let budget = Arc::new(ModelContextBudget::compute(
            model_id,
            model.provider,
            model.context_window,
            fixed,
            ratio,
        )?);

        debug!(
            model_id,
            total = budget.total_context,
            flexible = budget.flexible_pool,
            retrieved = budget.default_retrieved,
            history = budget.default_history,
            "Computed model budget template"
        );

        self.templates
            .insert(model_id.to_string(), Arc::clone(&budget));
        Ok(budget)
    }

    /// Replace the configuration; every template is recomputed on next use
    pub fn reload(&mut self, config: TokenBudgetConfig) {
        self.config = config;
        self.templates.clear();
    }

    pub fn config(&self) -> &TokenBudgetConfig {
        &self.config
    }

    /// Configured reservations, scaled down for windows too small to hold them
    fn reservations_for(&self, context_window: usize) -> FixedReservations {
        let configured = FixedReservations {
            system_prompt: self.config.system_prompt,
            min_user_message: self.config.min_user_message,
            response_buffer: self.config.response_buffer,
        };
        let cap = (context_window as f64 * self.config.max_reserved_fraction).floor() as usize;
        if configured.total() <= cap {
            return configured;
        }

        let scale = cap as f64 / configured.total() as f64;
        let scaled = |tokens: usize| (tokens as f64 * scale).floor() as usize;
        FixedReservations {
            system_prompt: scaled(configured.system_prompt),
            min_user_message: scaled(configured.min_user_message),
            response_buffer: scaled(configured.response_buffer),
        }
    }
}
