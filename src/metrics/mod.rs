//! Metrics collection for observability
//!
//! Every assembled context produces one [`ContextAssemblyMetrics`] record.
//! Records go to a [`MetricsSink`]: Prometheus collectors, a structured log
//! line, or both.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec_with_registry, register_counter_with_registry,
    register_histogram_with_registry, Counter, CounterVec, Histogram, Opts, Registry,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::context::token_budget::AllocationAction;

/// Current layout version of [`ContextAssemblyMetrics`]
pub const METRICS_SCHEMA_VERSION: u32 = 1;

/// Per-request record for the observability collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextAssemblyMetrics {
    pub schema_version: u32,
    pub request_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub model_id: String,
    pub tokens_used: usize,
    pub retrieved_tokens: usize,
    pub history_tokens: usize,
    pub truncation_count: usize,
    pub expansion_count: usize,
    pub latency_ms: u64,
    pub nodes_considered: usize,
    pub nodes_included: usize,
    pub overflow: bool,
    pub action: AllocationAction,
}

impl ContextAssemblyMetrics {
    /// Start a record for `model_id` with a fresh request id
    pub fn new(model_id: impl Into<String>, action: AllocationAction) -> Self {
        Self {
            schema_version: METRICS_SCHEMA_VERSION,
            request_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            model_id: model_id.into(),
            tokens_used: 0,
            retrieved_tokens: 0,
            history_tokens: 0,
            truncation_count: 0,
            expansion_count: 0,
            latency_ms: 0,
            nodes_considered: 0,
            nodes_included: 0,
            overflow: action != AllocationAction::Proceed,
            action,
        }
    }

    pub fn nodes_excluded(&self) -> usize {
        self.nodes_considered.saturating_sub(self.nodes_included)
    }
}

/// Destination for assembly metrics
pub trait MetricsSink: Send + Sync {
    fn record(&self, metrics: &ContextAssemblyMetrics);

    /// A background summarization was handed to the dispatcher
    fn record_summarization(&self, _conversation_id: &str) {}
}

/// Emits each record as a structured log line
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn record(&self, metrics: &ContextAssemblyMetrics) {
        info!(
            request_id = %metrics.request_id,
            model_id = %metrics.model_id,
            action = metrics.action.as_str(),
            tokens_used = metrics.tokens_used,
            retrieved_tokens = metrics.retrieved_tokens,
            history_tokens = metrics.history_tokens,
            truncations = metrics.truncation_count,
            expansions = metrics.expansion_count,
            latency_ms = metrics.latency_ms,
            nodes_considered = metrics.nodes_considered,
            nodes_included = metrics.nodes_included,
            overflow = metrics.overflow,
            "Context assembled"
        );
    }

    fn record_summarization(&self, conversation_id: &str) {
        info!(conversation_id = %conversation_id, "Summarization dispatched");
    }
}

/// Forwards every record to several sinks
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn MetricsSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn MetricsSink>>) -> Self {
        Self { sinks }
    }
}

impl MetricsSink for FanoutSink {
    fn record(&self, metrics: &ContextAssemblyMetrics) {
        for sink in &self.sinks {
            sink.record(metrics);
        }
    }

    fn record_summarization(&self, conversation_id: &str) {
        for sink in &self.sinks {
            sink.record_summarization(conversation_id);
        }
    }
}

/// Global metrics collectors, absent when registration failed
pub static METRICS: Lazy<Option<Arc<Metrics>>> = Lazy::new(|| match Metrics::new() {
    Ok(metrics) => Some(Arc::new(metrics)),
    Err(e) => {
        warn!(error = %e, "Failed to initialize context metrics");
        None
    }
});

/// Prometheus collectors for context assembly
pub struct Metrics {
    registry: Registry,

    pub assemblies: CounterVec,
    pub assembly_latency: Histogram,
    pub tokens_used: Histogram,
    pub retrieved_tokens: Histogram,
    pub history_tokens: Histogram,
    pub truncations: Counter,
    pub expansions: Counter,
    pub excluded_nodes: Counter,
    pub overflows: Counter,
    pub summarizations_dispatched: Counter,
}

impl Metrics {
    /// Create collectors in a fresh registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let assemblies = register_counter_vec_with_registry!(
            Opts::new("context_assemblies_total", "Total context assemblies"),
            &["action"],
            registry
        )?;

        let assembly_latency = register_histogram_with_registry!(
            "context_assembly_latency_seconds",
            "Context assembly latency in seconds",
            vec![0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25],
            registry
        )?;

        let tokens_used = register_histogram_with_registry!(
            "context_tokens_used",
            "Tokens allocated per request",
            prometheus::exponential_buckets(1000.0, 2.0, 10)?,
            registry
        )?;

        let retrieved_tokens = register_histogram_with_registry!(
            "context_retrieved_tokens",
            "Retrieved-node tokens packed per request",
            prometheus::exponential_buckets(250.0, 2.0, 12)?,
            registry
        )?;

        let history_tokens = register_histogram_with_registry!(
            "context_history_tokens",
            "Conversation history tokens per request",
            prometheus::exponential_buckets(250.0, 2.0, 8)?,
            registry
        )?;

        let truncations = register_counter_with_registry!(
            Opts::new("context_truncations_total", "Total truncated nodes"),
            registry
        )?;

        let expansions = register_counter_with_registry!(
            Opts::new("context_expansions_total", "Total chunk expansions"),
            registry
        )?;

        let excluded_nodes = register_counter_with_registry!(
            Opts::new("context_excluded_nodes_total", "Total candidates left out of the window"),
            registry
        )?;

        let overflows = register_counter_with_registry!(
            Opts::new("context_overflows_total", "Total requests that did not fit as-is"),
            registry
        )?;

        let summarizations_dispatched = register_counter_with_registry!(
            Opts::new(
                "context_summarizations_dispatched_total",
                "Total background summarizations dispatched"
            ),
            registry
        )?;

        Ok(Self {
            registry,
            assemblies,
            assembly_latency,
            tokens_used,
            retrieved_tokens,
            history_tokens,
            truncations,
            expansions,
            excluded_nodes,
            overflows,
            summarizations_dispatched,
        })
    }

    /// Get the metrics registry for exporting
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record one assembled context
    pub fn record_assembly(&self, metrics: &ContextAssemblyMetrics) {
        self.assemblies
            .with_label_values(&[metrics.action.as_str()])
            .inc();
        self.assembly_latency
            .observe(metrics.latency_ms as f64 / 1000.0);
        self.tokens_used.observe(metrics.tokens_used as f64);
        self.retrieved_tokens.observe(metrics.retrieved_tokens as f64);
        self.history_tokens.observe(metrics.history_tokens as f64);
        self.truncations.inc_by(metrics.truncation_count as f64);
        self.expansions.inc_by(metrics.expansion_count as f64);
        self.excluded_nodes.inc_by(metrics.nodes_excluded() as f64);
        if metrics.overflow {
            self.overflows.inc();
        }
    }

    /// Record a background summarization hand-off
    pub fn record_summarization(&self) {
        self.summarizations_dispatched.inc();
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        use prometheus::Encoder;

        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap_or_default();

        String::from_utf8(buffer).unwrap_or_default()
    }
}

/// Sink writing into Prometheus collectors
#[derive(Clone)]
pub struct PrometheusSink {
    metrics: Arc<Metrics>,
}

impl PrometheusSink {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self { metrics }
    }

    /// Sink over the process-wide collectors
    pub fn global() -> Option<Self> {
        METRICS.as_ref().map(|metrics| Self::new(Arc::clone(metrics)))
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}

impl MetricsSink for PrometheusSink {
    fn record(&self, metrics: &ContextAssemblyMetrics) {
        self.metrics.record_assembly(metrics);
    }

    fn record_summarization(&self, _conversation_id: &str) {
        self.metrics.record_summarization();
    }
}
