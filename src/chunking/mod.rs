//! Semantic chunking of oversized documents
//!
//! Ingestion splits large documents into linked chunks ahead of retrieval;
//! retrieval groups matched chunks back into expanded, merged or summarized
//! units.

pub mod aggregation;
pub mod chunker;
pub mod models;
pub mod validation;

pub use aggregation::{
    AggregatedResult, Aggregation, AggregationKind, ChunkAggregator, ChunkGraph, ChunkMatch, InMemoryChunkGraph,
};
pub use chunker::{chunk_count, overlap_hash, should_chunk, ChunkError, SemanticChunker};
pub use models::{ChunkFields, ChunkRecord, ChunkedDocument, DocumentType, ParentFields, ParentRecord};
pub use validation::validate_chunk_graph;
