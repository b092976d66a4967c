//! Sentence-unit document chunker
//!
//! Documents above the chunk threshold are cut into `ceil(tokens / target)`
//! linked chunks. Sentences are the unit of distribution; a sentence above
//! `hard_split` is broken on whitespace and one above `emergency_split` on
//! fixed character windows. Each chunk after the first repeats the tail of
//! its predecessor as overlap, kept out of the searchable body.

use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use super::models::{ChunkFields, ChunkRecord, ChunkedDocument, DocumentType, ParentFields, ParentRecord};
use super::validation::validate_chunk_graph;
use crate::config::ChunkingConfig;
use crate::context::token_estimator::TokenEstimator;
use crate::error::ValidationError;
use crate::text::{split_sentences, suffix_chars};

/// Level assigned to chunks under a level-0 parent
const CHUNK_LEVEL: u8 = 1;

/// Chunking errors
#[derive(Debug, Error)]
pub enum ChunkError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Document has {tokens} tokens, chunking starts above {threshold}")]
    BelowThreshold { tokens: usize, threshold: usize },

    #[error("Document is empty")]
    EmptyDocument,
}

/// Whether a document of `tokens` should be split
pub fn should_chunk(tokens: usize, config: &ChunkingConfig) -> bool {
    tokens > config.chunk_threshold
}

/// Number of chunks for a document of `total_tokens`
pub fn chunk_count(total_tokens: usize, target: usize) -> usize {
    total_tokens.div_ceil(target.max(1)).max(1)
}

/// SHA-256 hex digest of an overlap span
pub fn overlap_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

struct Unit {
    text: String,
    tokens: usize,
}

fn group_tokens(group: &[Unit]) -> usize {
    group.iter().map(|unit| unit.tokens).sum()
}

/// Splits oversized documents into linked chunks
pub struct SemanticChunker {
    config: ChunkingConfig,
    estimator: Arc<dyn TokenEstimator>,
}

impl SemanticChunker {
    pub fn new(config: ChunkingConfig, estimator: Arc<dyn TokenEstimator>) -> Result<Self, ValidationError> {
        config.validate()?;
        Ok(Self { config, estimator })
    }

    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    /// Split `text` into a parent and its chunks
    pub fn chunk_document(&self, text: &str, document_type: DocumentType) -> Result<ChunkedDocument, ChunkError> {
        if text.trim().is_empty() {
            return Err(ChunkError::EmptyDocument);
        }
        let total_tokens = self.estimator.estimate(text);
        if !should_chunk(total_tokens, &self.config) {
            return Err(ChunkError::BelowThreshold {
                tokens: total_tokens,
                threshold: self.config.chunk_threshold,
            });
        }

        let target_count = chunk_count(total_tokens, self.config.target);
        let mut groups = self.distribute(self.units(text), target_count);
        self.merge_undersized(&mut groups);

        let bodies: Vec<String> = groups
            .iter()
            .map(|group| {
                group
                    .iter()
                    .map(|unit| unit.text.as_str())
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .collect();

        let parent_id = Uuid::new_v4().to_string();
        let ids: Vec<String> = bodies.iter().map(|_| Uuid::new_v4().to_string()).collect();
        let total_chunks = bodies.len();

        let chunks: Vec<ChunkRecord> = bodies
            .iter()
            .enumerate()
            .map(|(index, body)| {
                let overlap = match index.checked_sub(1) {
                    Some(previous) => self.overlap_from(&bodies[previous]),
                    None => String::new(),
                };
                let fields = ChunkFields {
                    parent_id: parent_id.clone(),
                    chunk_index: index,
                    total_chunks,
                    level: CHUNK_LEVEL,
                    previous_chunk_id: index.checked_sub(1).map(|i| ids[i].clone()),
                    next_chunk_id: ids.get(index + 1).cloned(),
                    overlap_tokens: if overlap.is_empty() { 0 } else { self.estimator.estimate(&overlap) },
                    overlap_hash: (!overlap.is_empty()).then(|| overlap_hash(&overlap)),
                };
                ChunkRecord {
                    id: ids[index].clone(),
                    fields,
                    overlap_text: overlap,
                    body: body.clone(),
                    tokens: self.estimator.estimate(body),
                }
            })
            .collect();

        let parent = ParentRecord {
            id: parent_id,
            fields: ParentFields {
                child_ids: ids,
                total_tokens,
                document_type,
                summary: None,
            },
        };
        validate_chunk_graph(&parent, &chunks)?;

        info!(
            parent_id = %parent.id,
            total_tokens,
            target_count,
            chunks = total_chunks,
            "Chunked document"
        );
        Ok(ChunkedDocument { parent, chunks })
    }

    /// Whether `chunk`'s overlap no longer matches the tail of `previous_body`
    pub fn overlap_is_stale(&self, chunk: &ChunkRecord, previous_body: &str) -> bool {
        let expected = self.overlap_from(previous_body);
        let expected_hash = (!expected.is_empty()).then(|| overlap_hash(&expected));
        chunk.fields.overlap_hash != expected_hash
    }

    fn units(&self, text: &str) -> Vec<Unit> {
        let mut units = Vec::new();
        for sentence in split_sentences(text) {
            let tokens = self.estimator.estimate(&sentence);
            if tokens > self.config.emergency_split {
                self.push_char_windows(&sentence, tokens, &mut units);
            } else if tokens > self.config.hard_split {
                self.push_word_groups(&sentence, tokens, &mut units);
            } else if tokens > 0 {
                units.push(Unit { text: sentence, tokens });
            }
        }
        units
    }

    fn push_word_groups(&self, sentence: &str, tokens: usize, units: &mut Vec<Unit>) {
        let words: Vec<&str> = sentence.split_whitespace().collect();
        let pieces = chunk_count(tokens, self.config.target);
        let per_piece = words.len().div_ceil(pieces).max(1);
        for group in words.chunks(per_piece) {
            let text = group.join(" ");
            let tokens = self.estimator.estimate(&text);
            // Too few spaces to help
            if tokens > self.config.hard_split {
                self.push_char_windows(&text, tokens, units);
            } else {
                units.push(Unit { text, tokens });
            }
        }
    }

    fn push_char_windows(&self, text: &str, tokens: usize, units: &mut Vec<Unit>) {
        let chars: Vec<char> = text.chars().collect();
        let pieces = chunk_count(tokens, self.config.target);
        let window = chars.len().div_ceil(pieces).max(1);
        debug!(tokens, pieces, window, "Emergency split on character windows");
        for piece in chars.chunks(window) {
            let text: String = piece.iter().collect();
            let tokens = self.estimator.estimate(&text);
            units.push(Unit { text, tokens });
        }
    }

    /// Assign each unit to the chunk its token midpoint falls into
    fn distribute(&self, units: Vec<Unit>, count: usize) -> Vec<Vec<Unit>> {
        let total = group_tokens(&units);
        let mut groups: Vec<Vec<Unit>> = (0..count).map(|_| Vec::new()).collect();
        if total == 0 {
            return Vec::new();
        }

        let per_chunk = total as f64 / count as f64;
        let mut position = 0usize;
        for unit in units {
            let midpoint = position as f64 + unit.tokens as f64 / 2.0;
            let index = ((midpoint / per_chunk) as usize).min(count - 1);
            position += unit.tokens;
            groups[index].push(unit);
        }
        groups.retain(|group| !group.is_empty());
        groups
    }

    /// Too few tokens, or too few sentences for a chunk below `min_chunk`
    fn is_undersized(&self, group: &[Unit]) -> bool {
        let tokens = group_tokens(group);
        tokens < self.config.min_tokens
            || (group.len() < self.config.min_sentences && tokens < self.config.min_chunk)
    }

    /// Fold undersized chunks into their smaller neighbour while the merge
    /// stays within `hard_split`
    fn merge_undersized(&self, groups: &mut Vec<Vec<Unit>>) {
        while groups.len() > 1 {
            let merge = (0..groups.len())
                .filter(|&i| self.is_undersized(&groups[i]))
                .find_map(|i| self.merge_partner(groups, i).map(|j| (i, j)));
            let Some((i, j)) = merge else {
                break;
            };
            let (keep, absorb) = (i.min(j), i.max(j));
            let absorbed = groups.remove(absorb);
            groups[keep].extend(absorbed);
        }
    }

    fn merge_partner(&self, groups: &[Vec<Unit>], index: usize) -> Option<usize> {
        let own = group_tokens(&groups[index]);
        [index.checked_sub(1), Some(index + 1).filter(|&j| j < groups.len())]
            .into_iter()
            .flatten()
            .filter(|&j| own + group_tokens(&groups[j]) <= self.config.hard_split)
            .min_by_key(|&j| group_tokens(&groups[j]))
    }

    /// Trailing sentences of `body` within the overlap budget
    fn overlap_from(&self, body: &str) -> String {
        if self.config.overlap_tokens == 0 {
            return String::new();
        }

        let sentences = split_sentences(body);
        let mut taken: Vec<&str> = Vec::new();
        let mut tokens = 0;
        for sentence in sentences.iter().rev() {
            let sentence_tokens = self.estimator.estimate(sentence);
            if tokens + sentence_tokens > self.config.overlap_tokens {
                break;
            }
            tokens += sentence_tokens;
            taken.push(sentence);
        }

        if taken.is_empty() {
            // Last sentence alone is too long: fall back to a character tail
            let body_tokens = self.estimator.estimate(body).max(1);
            let chars = body.chars().count() * self.config.overlap_tokens / body_tokens;
            return suffix_chars(body, chars).trim().to_string();
        }
        taken.reverse();
        taken.join(" ")
    }
}
