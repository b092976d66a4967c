//! Integration tests for the context allocation pipeline
//!
//! These tests drive the public API end to end: budget templates, the
//! allocator, packing with truncation, placement, history and chunking.

use std::sync::Arc;

use chrono::{Duration, Utc};
use context_allocator::{
    chunking::{chunk_count, validate_chunk_graph, ChunkAggregator, ChunkMatch, DocumentType, InMemoryChunkGraph, SemanticChunker},
    config::{ChunkingConfig, Config, ModelEntry, PackerConfig, TokenBudgetConfig, TruncationConfig},
    context::{
        reorder, AdaptiveContextManager, AllocationAction, AssemblyRequest, ContextBudgetAllocator,
        ConversationMessage, HeuristicEstimator, ModelBudgetResolver, ModelContextBudget, NodePacker,
        PrioritizedNode, PriorityFactors, Provider, RetrievalCandidate, StaticModelRegistry, TruncationEngine,
        TruncationTier,
    },
    context::model_budget::FixedReservations,
    metrics::{ContextAssemblyMetrics, MetricsSink},
    ValidationError,
};

fn registry() -> StaticModelRegistry {
    StaticModelRegistry::default()
        .with_model("claude-sonnet", 200_000, Provider::Anthropic)
        .with_model("gpt-4o", 128_000, Provider::OpenAi)
        .with_model("small-local", 8_192, Provider::Local)
}

fn allocator() -> ContextBudgetAllocator {
    ContextBudgetAllocator::new(ModelBudgetResolver::new(
        Arc::new(registry()),
        TokenBudgetConfig::default(),
    ))
}

fn engine() -> TruncationEngine {
    TruncationEngine::new(TruncationConfig::default(), Arc::new(HeuristicEstimator::default()))
}

fn node(id: &str, score: f32, tokens: usize) -> PrioritizedNode {
    let mut content = String::new();
    while content.len() < tokens * 4 {
        content.push_str("A sentence with some remembered detail. ");
    }
    content.truncate(tokens * 4);
    PrioritizedNode {
        node_id: id.to_string(),
        factors: PriorityFactors {
            retrieval_score: score,
            query_mentioned: 0.0,
            recency: 0.0,
            connectivity: 0.0,
            importance: 0.0,
        },
        priority_score: score,
        tokens,
        content,
        summary: None,
        is_critical: false,
        was_truncated: false,
        truncation_tier: None,
    }
}

#[test]
fn test_scenario_a_budget_template() {
    let fixed = FixedReservations {
        system_prompt: 3000,
        min_user_message: 2000,
        response_buffer: 16000,
    };
    let budget = ModelContextBudget::compute("claude-sonnet", Provider::Anthropic, 200_000, fixed, 0.70).unwrap();
    assert_eq!(budget.flexible_pool, 179_000);
    assert_eq!(budget.default_retrieved, 125_300);
    assert_eq!(budget.default_history, 53_700);
}

#[test]
fn test_scenario_b_sparse_retrieval_returns_new_budget() {
    let allocator = allocator();
    let template = allocator.resolver().resolve("claude-sonnet").unwrap();
    let before = template.fixed.response_buffer;

    let result = allocator.allocate("claude-sonnet", 100, 500, 0, None).unwrap();
    assert_eq!(result.budget.fixed.response_buffer, before + 4000);
    assert_eq!(template.fixed.response_buffer, before);
    assert_eq!(
        allocator.resolver().resolve("claude-sonnet").unwrap().fixed.response_buffer,
        before
    );
}

#[test]
fn test_scenario_c_attention_placement() {
    let nodes: Vec<PrioritizedNode> = [0.92, 0.85, 0.78, 0.71, 0.65]
        .iter()
        .enumerate()
        .map(|(i, score)| node(&format!("n{}", i + 1), *score, 10))
        .collect();
    let ids: Vec<String> = reorder(&nodes).into_iter().map(|n| n.node_id).collect();
    assert_eq!(ids, vec!["n2", "n3", "n4", "n5", "n1"]);
    assert_eq!(nodes[0].node_id, "n1");
}

#[test]
fn test_scenario_d_summary_tier_for_any_target() {
    let engine = engine();
    for target in [10, 500, 1000, 2199] {
        assert_eq!(
            engine.select_truncation_tier(2200, true, target),
            TruncationTier::UseSummary
        );
    }
}

#[test]
fn test_scenario_e_chunk_graph() {
    assert_eq!(chunk_count(4800, 1000), 5);

    let text: String = (0..120)
        .map(|i| {
            let mut sentence = format!("Paragraph {i:04} covers one step of the migration plan");
            while sentence.len() < 159 {
                sentence.push_str(" z");
            }
            sentence.truncate(159);
            sentence.push('.');
            sentence
        })
        .collect::<Vec<_>>()
        .join(" ");

    let chunker = SemanticChunker::new(ChunkingConfig::default(), Arc::new(HeuristicEstimator::default())).unwrap();
    let document = chunker.chunk_document(&text, DocumentType::Article).unwrap();

    assert_eq!(document.chunks.len(), 5);
    assert!(document.chunks.first().unwrap().fields.previous_chunk_id.is_none());
    assert!(document.chunks.last().unwrap().fields.next_chunk_id.is_none());
    for chunk in &document.chunks {
        assert_eq!(chunk.fields.total_chunks, document.parent.fields.child_ids.len());
    }
    assert!(validate_chunk_graph(&document.parent, &document.chunks).is_ok());
}

#[test]
fn test_allocations_never_exceed_window() {
    let allocator = allocator();
    let sizes = [0i64, 500, 999, 1000, 5_000, 60_000, 150_000, 400_000];
    for model in ["claude-sonnet", "gpt-4o", "small-local", "unknown-model"] {
        for &user in &[0i64, 1_500, 30_000, 500_000] {
            for &retrieved in &sizes {
                for &history in &sizes {
                    let result = allocator.allocate(model, user, retrieved, history, None).unwrap();
                    assert!(
                        result.allocations.total() <= result.budget.total_context,
                        "{model} user={user} retrieved={retrieved} history={history}"
                    );
                }
            }
        }
    }
}

#[test]
fn test_empty_request_proceeds() {
    let result = allocator().allocate("gpt-4o", 0, 0, 0, None).unwrap();
    assert_eq!(result.action, AllocationAction::Proceed);
    assert_eq!(result.allocations.retrieved, 0);
    assert_eq!(result.allocations.history, 0);
    assert!(result.unused_tokens > 0);
}

#[test]
fn test_negative_tokens_rejected() {
    let err = allocator().allocate("gpt-4o", 0, -5, 0, None).unwrap_err();
    assert!(err.to_string().contains("retrieved_tokens"));
}

#[test]
fn test_packer_never_exceeds_budget() {
    let engine = Arc::new(engine());
    let packer = NodePacker::new(PackerConfig::default(), engine);

    let sizes = [0usize, 10, 64, 300, 999, 1000, 4000, 25_000];
    for budget in [0usize, 50, 1000, 5000] {
        let candidates: Vec<PrioritizedNode> = sizes
            .iter()
            .enumerate()
            .map(|(i, &tokens)| node(&format!("n{i}"), 1.0 - i as f32 * 0.1, tokens))
            .collect();
        let packed = packer.pack(candidates, budget, &["n7".to_string()], "remembered detail");
        assert!(packed.used_tokens <= budget, "budget {budget} used {}", packed.used_tokens);
        assert_eq!(packed.nodes.len() + packed.excluded_count, sizes.len());
    }

    let empty = packer.pack(Vec::new(), 1000, &[], "");
    assert_eq!(empty.used_tokens, 0);
}

#[test]
fn test_hard_truncate_leaves_short_text_alone() {
    let engine = engine();
    let text = "Short note. Nothing to cut.";
    assert_eq!(engine.hard_truncate(text, 100), text);
    assert!(!engine.hard_truncate(text, 100).contains("[truncated]"));
}

struct CollectingSink(std::sync::Mutex<Vec<ContextAssemblyMetrics>>);

impl MetricsSink for CollectingSink {
    fn record(&self, metrics: &ContextAssemblyMetrics) {
        self.0.lock().unwrap().push(metrics.clone());
    }
}

#[test]
fn test_end_to_end_assembly_with_chunks() {
    let config = Config {
        models: vec![ModelEntry {
            id: "small-local".to_string(),
            context_window: 16_384,
            provider: Provider::Local,
        }],
        ..Config::default()
    };
    let sink = Arc::new(CollectingSink(std::sync::Mutex::new(Vec::new())));
    let manager = AdaptiveContextManager::from_config(&config)
        .unwrap()
        .with_metrics_sink(sink.clone());

    let estimator = Arc::new(HeuristicEstimator::default());
    let chunker = SemanticChunker::new(config.chunking.clone(), estimator.clone()).unwrap();
    let text: String = (0..120)
        .map(|i| format!("Log entry {i:04} describes how the greenhouse heater behaved overnight and what we changed."))
        .collect::<Vec<_>>()
        .join(" ");
    let document = chunker.chunk_document(&text, DocumentType::Transcript).unwrap();
    let graph = InMemoryChunkGraph::new();
    graph.insert_document(document.clone());

    let aggregator = ChunkAggregator::new(config.chunking.clone(), estimator);
    let aggregation = aggregator.aggregate_matches(&graph, &[ChunkMatch::new(&document.chunks[1].id, 0.9)]);

    let now = Utc::now();
    let mut candidates: Vec<RetrievalCandidate> = aggregation
        .results
        .iter()
        .map(|result| result.to_candidate(now - Duration::days(3)))
        .collect();
    for i in 0..20 {
        candidates.push(
            RetrievalCandidate::new(format!("note-{i}"), 0.3, now - Duration::days(i))
                .with_content("A related memory about the greenhouse. ".repeat(60)),
        );
    }

    let messages: Vec<ConversationMessage> = (0..4)
        .flat_map(|i| {
            [
                ConversationMessage::user(format!("How is the heater doing on day {i}?")),
                ConversationMessage::assistant("It kept the temperature stable."),
            ]
        })
        .collect();

    let request = AssemblyRequest::new("conv-e2e", "small-local", "Why did the heater fail?")
        .with_system_prompt("You answer from the user's notes.")
        .with_candidates(candidates)
        .with_messages(messages)
        .with_expansions(aggregation.expansion_count)
        .at(now);

    let assembled = manager.assemble(&request).unwrap();

    assert!(assembled.packed.used_tokens <= assembled.allocation.retrieved_budget);
    assert!(assembled.allocation.allocations.total() <= 16_384);
    assert_eq!(assembled.metrics.expansion_count, 1);
    assert_eq!(assembled.metrics.nodes_considered, 21);
    assert!(assembled.metrics.nodes_included < 21);
    assert_eq!(
        assembled.placement.retrieved_nodes.last().map(|n| n.node_id.as_str()),
        Some(document.chunks[1].id.as_str())
    );

    let recorded = sink.0.lock().unwrap();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].schema_version, 1);
}

#[test]
fn test_unknown_model_without_fallback_rejected() {
    let config = TokenBudgetConfig {
        allow_fallback: false,
        ..TokenBudgetConfig::default()
    };
    let resolver = ModelBudgetResolver::new(Arc::new(registry()), config);
    assert_eq!(
        resolver.resolve("nope").unwrap_err(),
        ValidationError::UnknownModel("nope".to_string())
    );
}
