//! Retrieval-time aggregation of matched chunks
//!
//! Matches are grouped per parent in first-seen order. One match is
//! expanded with its neighbours, two or more are merged in document order,
//! and from the summary threshold on the parent summary plus a few
//! highlights stands in for the raw chunks.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use super::models::{ChunkRecord, ChunkedDocument, ParentRecord};
use crate::config::ChunkingConfig;
use crate::context::models::RetrievalCandidate;
use crate::context::token_estimator::TokenEstimator;
use crate::text::split_sentences;

/// Read access to stored chunk graphs
pub trait ChunkGraph: Send + Sync {
    fn chunk(&self, chunk_id: &str) -> Option<ChunkRecord>;
    fn parent(&self, parent_id: &str) -> Option<ParentRecord>;
}

/// Chunk graph held in memory
#[derive(Default)]
pub struct InMemoryChunkGraph {
    chunks: DashMap<String, ChunkRecord>,
    parents: DashMap<String, ParentRecord>,
}

impl InMemoryChunkGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_document(&self, document: ChunkedDocument) {
        for chunk in document.chunks {
            self.chunks.insert(chunk.id.clone(), chunk);
        }
        self.parents.insert(document.parent.id.clone(), document.parent);
    }

    pub fn set_summary(&self, parent_id: &str, summary: impl Into<String>) -> bool {
        match self.parents.get_mut(parent_id) {
            Some(mut parent) => {
                parent.fields.summary = Some(summary.into());
                true
            }
            None => false,
        }
    }
}

impl ChunkGraph for InMemoryChunkGraph {
    fn chunk(&self, chunk_id: &str) -> Option<ChunkRecord> {
        self.chunks.get(chunk_id).map(|entry| entry.value().clone())
    }

    fn parent(&self, parent_id: &str) -> Option<ParentRecord> {
        self.parents.get(parent_id).map(|entry| entry.value().clone())
    }
}

/// A chunk returned by the retrieval collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMatch {
    pub chunk_id: String,
    pub score: f32,
}

impl ChunkMatch {
    pub fn new(chunk_id: impl Into<String>, score: f32) -> Self {
        Self {
            chunk_id: chunk_id.into(),
            score,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationKind {
    Single,
    Expanded,
    Merged,
    ParentSummary,
}

/// Retrieval unit produced from one parent's matches
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedResult {
    pub kind: AggregationKind,
    pub parent_id: String,
    /// Chunks matched by retrieval, in document order
    pub matched_ids: Vec<String>,
    /// Chunks whose text made it into `text`
    pub included_ids: Vec<String>,
    pub text: String,
    pub tokens: usize,
    /// Best score among the matches
    pub score: f32,
}

impl AggregatedResult {
    /// Id to use for the packed node
    pub fn node_id(&self) -> &str {
        match self.kind {
            AggregationKind::Single | AggregationKind::Expanded => {
                self.matched_ids.first().map_or(self.parent_id.as_str(), String::as_str)
            }
            AggregationKind::Merged | AggregationKind::ParentSummary => &self.parent_id,
        }
    }

    /// Turn the result into a candidate for prioritization
    pub fn to_candidate(&self, last_accessed: DateTime<Utc>) -> RetrievalCandidate {
        RetrievalCandidate::new(self.node_id(), self.score.clamp(0.0, 1.0), last_accessed)
            .with_content(self.text.clone())
            .with_tokens(self.tokens)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Aggregation {
    pub results: Vec<AggregatedResult>,
    /// Single matches that pulled in at least one neighbour
    pub expansion_count: usize,
}

/// Groups chunk matches into retrieval units
pub struct ChunkAggregator {
    config: ChunkingConfig,
    estimator: Arc<dyn TokenEstimator>,
}

impl ChunkAggregator {
    pub fn new(config: ChunkingConfig, estimator: Arc<dyn TokenEstimator>) -> Self {
        Self { config, estimator }
    }

    pub fn aggregate_matches(&self, graph: &dyn ChunkGraph, matches: &[ChunkMatch]) -> Aggregation {
        let mut groups: IndexMap<String, Vec<(ChunkRecord, f32)>> = IndexMap::new();
        for matched in matches {
            let Some(chunk) = graph.chunk(&matched.chunk_id) else {
                warn!(chunk_id = %matched.chunk_id, "Matched chunk not found in graph");
                continue;
            };
            let group = groups.entry(chunk.fields.parent_id.clone()).or_default();
            match group.iter_mut().find(|(existing, _)| existing.id == chunk.id) {
                Some((_, score)) => *score = score.max(matched.score),
                None => group.push((chunk, matched.score)),
            }
        }

        let mut aggregation = Aggregation::default();
        for (parent_id, mut matched) in groups {
            matched.sort_by_key(|(chunk, _)| chunk.fields.chunk_index);
            let summary = graph.parent(&parent_id).and_then(|parent| parent.fields.summary);

            let result = if matched.len() >= self.config.summary_threshold && summary.is_some() {
                self.summarize(parent_id, &matched, summary.unwrap_or_default())
            } else if matched.len() >= self.config.merge_threshold {
                self.merge(parent_id, &matched, summary.as_deref())
            } else {
                let (chunk, score) = &matched[0];
                let result = self.expand(graph, parent_id, chunk, *score, summary.as_deref());
                if result.kind == AggregationKind::Expanded {
                    aggregation.expansion_count += 1;
                }
                result
            };
            debug!(
                parent_id = %result.parent_id,
                kind = ?result.kind,
                matched = result.matched_ids.len(),
                tokens = result.tokens,
                "Aggregated chunk matches"
            );
            aggregation.results.push(result);
        }
        aggregation
    }

    fn build(
        &self,
        kind: AggregationKind,
        parent_id: String,
        matched: &[(ChunkRecord, f32)],
        included_ids: Vec<String>,
        text: String,
    ) -> AggregatedResult {
        AggregatedResult {
            kind,
            parent_id,
            matched_ids: matched.iter().map(|(chunk, _)| chunk.id.clone()).collect(),
            included_ids,
            tokens: self.estimator.estimate(&text),
            text,
            score: matched.iter().map(|(_, score)| *score).fold(0.0, f32::max),
        }
    }

    fn parent_summary<'a>(&self, summary: Option<&'a str>) -> Option<&'a str> {
        summary.filter(|_| self.config.include_parent_summary)
    }

    /// One match, with neighbours added while they fit the expansion cap
    fn expand(
        &self,
        graph: &dyn ChunkGraph,
        parent_id: String,
        chunk: &ChunkRecord,
        score: f32,
        summary: Option<&str>,
    ) -> AggregatedResult {
        let matched = [(chunk.clone(), score)];
        if !self.config.expansion_enabled {
            return self.build(AggregationKind::Single, parent_id, &matched, vec![chunk.id.clone()], chunk.content());
        }

        let cap = self.config.expansion_cap;
        let previous = chunk
            .fields
            .previous_chunk_id
            .as_deref()
            .and_then(|id| graph.chunk(id))
            .filter(|previous| previous.tokens <= cap);
        let used = previous.as_ref().map_or(0, |previous| previous.tokens);
        let next = chunk
            .fields
            .next_chunk_id
            .as_deref()
            .and_then(|id| graph.chunk(id))
            .filter(|next| used + next.tokens <= cap);

        if previous.is_none() && next.is_none() {
            return self.build(AggregationKind::Single, parent_id, &matched, vec![chunk.id.clone()], chunk.content());
        }

        let mut parts: Vec<String> = Vec::new();
        let mut included_ids = Vec::new();
        if let Some(summary) = self.parent_summary(summary) {
            parts.push(summary.to_string());
        }
        match &previous {
            Some(previous) => {
                // The cap was checked against the body alone; its own overlap stays out
                parts.push(previous.body.clone());
                parts.push(chunk.body.clone());
                included_ids.push(previous.id.clone());
            }
            None => parts.push(chunk.content()),
        }
        included_ids.push(chunk.id.clone());
        if let Some(next) = &next {
            parts.push(next.body.clone());
            included_ids.push(next.id.clone());
        }

        self.build(AggregationKind::Expanded, parent_id, &matched, included_ids, parts.join("\n\n"))
    }

    /// Several matches joined in document order; adjacent chunks skip their
    /// overlap since the predecessor already carries it
    fn merge(&self, parent_id: String, matched: &[(ChunkRecord, f32)], summary: Option<&str>) -> AggregatedResult {
        let mut parts: Vec<String> = Vec::new();
        if let Some(summary) = self.parent_summary(summary) {
            parts.push(summary.to_string());
        }

        let mut previous_index: Option<usize> = None;
        for (chunk, _) in matched {
            let adjacent = previous_index.is_some_and(|index| index + 1 == chunk.fields.chunk_index);
            parts.push(if adjacent { chunk.body.clone() } else { chunk.content() });
            previous_index = Some(chunk.fields.chunk_index);
        }

        let included_ids = matched.iter().map(|(chunk, _)| chunk.id.clone()).collect();
        self.build(AggregationKind::Merged, parent_id, matched, included_ids, parts.join("\n\n"))
    }

    /// Parent summary followed by the best-scoring highlights
    fn summarize(&self, parent_id: String, matched: &[(ChunkRecord, f32)], summary: String) -> AggregatedResult {
        let mut best: Vec<&(ChunkRecord, f32)> = matched.iter().collect();
        best.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.fields.chunk_index.cmp(&b.0.fields.chunk_index))
        });
        best.truncate(self.config.max_highlights);
        best.sort_by_key(|(chunk, _)| chunk.fields.chunk_index);

        let per_highlight = self.config.expansion_cap / self.config.max_highlights.max(1);
        let mut text = summary;
        let mut included_ids = Vec::new();
        if !best.is_empty() {
            text.push_str("\n\nHighlights:");
        }
        for (chunk, _) in best {
            text.push_str("\n- ");
            text.push_str(&self.highlight(&chunk.body, per_highlight));
            included_ids.push(chunk.id.clone());
        }

        self.build(AggregationKind::ParentSummary, parent_id, matched, included_ids, text)
    }

    /// Leading sentences of `body` within `max_tokens`, at least one
    fn highlight(&self, body: &str, max_tokens: usize) -> String {
        let mut taken: Vec<String> = Vec::new();
        let mut tokens = 0;
        for sentence in split_sentences(body) {
            let sentence_tokens = self.estimator.estimate(&sentence);
            if !taken.is_empty() && tokens + sentence_tokens > max_tokens {
                break;
            }
            tokens += sentence_tokens;
            taken.push(sentence);
        }
        taken.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::chunker::SemanticChunker;
    use crate::chunking::models::{ChunkFields, DocumentType, ParentFields};
    use crate::context::token_estimator::HeuristicEstimator;

    fn sentence_document(count: usize) -> String {
        (0..count)
            .map(|i| {
                let mut sentence = format!("Entry {i:04} notes a finding from the field study");
                while sentence.len() < 159 {
                    sentence.push_str(" y");
                }
                sentence.truncate(159);
                sentence.push('.');
                sentence
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn setup() -> (InMemoryChunkGraph, ChunkedDocument, ChunkAggregator) {
        let estimator: Arc<dyn TokenEstimator> = Arc::new(HeuristicEstimator::default());
        let chunker = SemanticChunker::new(ChunkingConfig::default(), Arc::clone(&estimator)).unwrap();
        let document = chunker
            .chunk_document(&sentence_document(120), DocumentType::Article)
            .unwrap();
        let graph = InMemoryChunkGraph::new();
        graph.insert_document(document.clone());
        (graph, document, ChunkAggregator::new(ChunkingConfig::default(), estimator))
    }

    #[test]
    fn test_single_match_expands_to_neighbours() {
        let (graph, document, aggregator) = setup();
        let middle = &document.chunks[2];
        let aggregation = aggregator.aggregate_matches(&graph, &[ChunkMatch::new(&middle.id, 0.8)]);

        assert_eq!(aggregation.results.len(), 1);
        assert_eq!(aggregation.expansion_count, 1);
        let result = &aggregation.results[0];
        assert_eq!(result.kind, AggregationKind::Expanded);
        assert_eq!(result.node_id(), middle.id);
        // Each neighbour is ~966 tokens, so only the previous one fits 1500
        assert_eq!(result.included_ids, vec![document.chunks[1].id.clone(), middle.id.clone()]);
    }

    fn hand_chunk(id: &str, index: usize, overlap: &str, body: String) -> ChunkRecord {
        let ids = ["a", "b", "c"];
        ChunkRecord {
            id: id.to_string(),
            fields: ChunkFields {
                parent_id: "doc".to_string(),
                chunk_index: index,
                total_chunks: ids.len(),
                level: 1,
                previous_chunk_id: index.checked_sub(1).map(|i| ids[i].to_string()),
                next_chunk_id: ids.get(index + 1).map(|id| id.to_string()),
                overlap_tokens: overlap.len() / 4,
                overlap_hash: None,
            },
            overlap_text: overlap.to_string(),
            tokens: body.len() / 4,
            body,
        }
    }

    #[test]
    fn test_expansion_stays_within_cap_when_neighbour_has_overlap() {
        let a = hand_chunk("a", 0, "", "a".repeat(400));
        let b = hand_chunk("b", 1, &"o".repeat(400), "b".repeat(1450 * 4));
        let c = hand_chunk("c", 2, &"t".repeat(400), "c".repeat(800));
        let parent = ParentRecord {
            id: "doc".to_string(),
            fields: ParentFields {
                child_ids: vec!["a".into(), "b".into(), "c".into()],
                total_tokens: 100 + 1450 + 200,
                document_type: DocumentType::Note,
                summary: None,
            },
        };
        let graph = InMemoryChunkGraph::new();
        graph.insert_document(ChunkedDocument {
            parent,
            chunks: vec![a, b.clone(), c.clone()],
        });

        let estimator = HeuristicEstimator::default();
        let aggregator = ChunkAggregator::new(ChunkingConfig::default(), Arc::new(estimator.clone()));
        let result = &aggregator.aggregate_matches(&graph, &[ChunkMatch::new("c", 0.9)]).results[0];

        assert_eq!(result.kind, AggregationKind::Expanded);
        assert_eq!(result.included_ids, vec!["b".to_string(), "c".to_string()]);
        assert!(!result.text.contains(&b.overlap_text));
        assert_eq!(result.text, format!("{}\n\n{}", b.body, c.body));
        let added = result.tokens - estimator.estimate(&c.content());
        assert!(added <= ChunkingConfig::default().expansion_cap, "added {added}");
    }

    #[test]
    fn test_expansion_disabled_returns_single() {
        let (graph, document, _) = setup();
        let config = ChunkingConfig {
            expansion_enabled: false,
            ..ChunkingConfig::default()
        };
        let aggregator = ChunkAggregator::new(config, Arc::new(HeuristicEstimator::default()));
        let aggregation = aggregator.aggregate_matches(&graph, &[ChunkMatch::new(&document.chunks[0].id, 0.5)]);
        assert_eq!(aggregation.results[0].kind, AggregationKind::Single);
        assert_eq!(aggregation.expansion_count, 0);
    }

    #[test]
    fn test_two_matches_merge_in_document_order() {
        let (graph, document, aggregator) = setup();
        let matches = vec![
            ChunkMatch::new(&document.chunks[3].id, 0.6),
            ChunkMatch::new(&document.chunks[2].id, 0.9),
        ];
        let aggregation = aggregator.aggregate_matches(&graph, &matches);
        let result = &aggregation.results[0];

        assert_eq!(result.kind, AggregationKind::Merged);
        assert_eq!(result.node_id(), document.parent.id);
        assert_eq!(result.matched_ids, vec![document.chunks[2].id.clone(), document.chunks[3].id.clone()]);
        assert!((result.score - 0.9).abs() < 1e-6);
        // The adjacent chunk's overlap is not repeated
        assert_eq!(result.text.matches(&document.chunks[3].overlap_text).count(), 1);
    }

    #[test]
    fn test_many_matches_use_parent_summary() {
        let (graph, document, aggregator) = setup();
        graph.set_summary(&document.parent.id, "A field study in five parts.");
        let matches: Vec<_> = document
            .chunks
            .iter()
            .enumerate()
            .map(|(i, chunk)| ChunkMatch::new(&chunk.id, 0.5 + i as f32 * 0.1))
            .collect();

        let result = &aggregator.aggregate_matches(&graph, &matches).results[0];
        assert_eq!(result.kind, AggregationKind::ParentSummary);
        assert!(result.text.starts_with("A field study in five parts."));
        assert_eq!(result.included_ids.len(), 3);
        assert_eq!(result.included_ids[0], document.chunks[2].id);
        assert!(result.tokens < document.parent.fields.total_tokens);
    }

    #[test]
    fn test_many_matches_without_summary_merge() {
        let (graph, document, aggregator) = setup();
        let matches: Vec<_> = document.chunks.iter().map(|c| ChunkMatch::new(&c.id, 0.5)).collect();
        let result = &aggregator.aggregate_matches(&graph, &matches).results[0];
        assert_eq!(result.kind, AggregationKind::Merged);
    }

    #[test]
    fn test_unknown_chunks_skipped() {
        let (graph, _, aggregator) = setup();
        let aggregation = aggregator.aggregate_matches(&graph, &[ChunkMatch::new("missing", 0.9)]);
        assert!(aggregation.results.is_empty());
    }

    #[test]
    fn test_candidate_conversion() {
        let (graph, document, aggregator) = setup();
        let aggregation = aggregator.aggregate_matches(&graph, &[ChunkMatch::new(&document.chunks[0].id, 0.7)]);
        let candidate = aggregation.results[0].to_candidate(Utc::now());
        assert_eq!(candidate.node_id, document.chunks[0].id);
        assert_eq!(candidate.tokens, Some(aggregation.results[0].tokens));
    }
}
