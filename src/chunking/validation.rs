//! Structural checks for a parent and its chunks

use super::models::{ChunkRecord, ParentRecord};
use crate::error::ValidationError;

fn broken(message: String) -> ValidationError {
    ValidationError::BrokenChunkSequence(message)
}

/// Check that `chunks` form a well-linked sequence under `parent`.
///
/// Chunks may be passed in any order. Every chunk must point at the parent,
/// agree on `total_chunks`, occupy a distinct index in `0..n`, appear in
/// `child_ids` at its index, and link to exactly its neighbours.
pub fn validate_chunk_graph(parent: &ParentRecord, chunks: &[ChunkRecord]) -> Result<(), ValidationError> {
    let child_ids = &parent.fields.child_ids;
    if chunks.len() != child_ids.len() {
        return Err(broken(format!(
            "parent {} lists {} children but {} chunks were given",
            parent.id,
            child_ids.len(),
            chunks.len()
        )));
    }

    let mut ordered: Vec<&ChunkRecord> = chunks.iter().collect();
    ordered.sort_by_key(|chunk| chunk.fields.chunk_index);

    for (position, chunk) in ordered.iter().enumerate() {
        let fields = &chunk.fields;
        if fields.parent_id != parent.id {
            return Err(broken(format!(
                "chunk {} belongs to {}, expected {}",
                chunk.id, fields.parent_id, parent.id
            )));
        }
        if fields.total_chunks != child_ids.len() {
            return Err(broken(format!(
                "chunk {} reports total_chunks {} but parent has {} children",
                chunk.id,
                fields.total_chunks,
                child_ids.len()
            )));
        }
        if fields.chunk_index != position {
            return Err(broken(format!(
                "expected chunk index {position}, found {}",
                fields.chunk_index
            )));
        }
        if child_ids[position] != chunk.id {
            return Err(broken(format!(
                "child {position} of {} is {}, found chunk {}",
                parent.id, child_ids[position], chunk.id
            )));
        }

        let expected_previous = position.checked_sub(1).map(|i| child_ids[i].as_str());
        if fields.previous_chunk_id.as_deref() != expected_previous {
            return Err(broken(format!("chunk {} has a wrong previous link", chunk.id)));
        }
        let expected_next = child_ids.get(position + 1).map(String::as_str);
        if fields.next_chunk_id.as_deref() != expected_next {
            return Err(broken(format!("chunk {} has a wrong next link", chunk.id)));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::models::{ChunkFields, DocumentType, ParentFields};

    fn graph(n: usize) -> (ParentRecord, Vec<ChunkRecord>) {
        let ids: Vec<String> = (0..n).map(|i| format!("c{i}")).collect();
        let parent = ParentRecord {
            id: "p".to_string(),
            fields: ParentFields {
                child_ids: ids.clone(),
                total_tokens: n * 1000,
                document_type: DocumentType::Note,
                summary: None,
            },
        };
        let chunks = (0..n)
            .map(|i| ChunkRecord {
                id: ids[i].clone(),
                fields: ChunkFields {
                    parent_id: "p".to_string(),
                    chunk_index: i,
                    total_chunks: n,
                    level: 1,
                    previous_chunk_id: i.checked_sub(1).map(|j| ids[j].clone()),
                    next_chunk_id: ids.get(i + 1).cloned(),
                    overlap_tokens: 0,
                    overlap_hash: None,
                },
                overlap_text: String::new(),
                body: format!("body {i}"),
                tokens: 1000,
            })
            .collect();
        (parent, chunks)
    }

    #[test]
    fn test_valid_graph_any_order() {
        let (parent, mut chunks) = graph(4);
        chunks.reverse();
        assert!(validate_chunk_graph(&parent, &chunks).is_ok());
    }

    #[test]
    fn test_missing_index_rejected() {
        let (parent, mut chunks) = graph(4);
        chunks[2].fields.chunk_index = 5;
        assert!(matches!(
            validate_chunk_graph(&parent, &chunks),
            Err(ValidationError::BrokenChunkSequence(_))
        ));
    }

    #[test]
    fn test_extra_previous_link_rejected() {
        let (parent, mut chunks) = graph(3);
        chunks[0].fields.previous_chunk_id = Some("c2".to_string());
        assert!(validate_chunk_graph(&parent, &chunks).is_err());
    }

    #[test]
    fn test_total_chunks_mismatch_rejected() {
        let (parent, mut chunks) = graph(3);
        chunks[1].fields.total_chunks = 4;
        assert!(validate_chunk_graph(&parent, &chunks).is_err());
    }

    #[test]
    fn test_child_count_mismatch_rejected() {
        let (parent, chunks) = graph(3);
        assert!(validate_chunk_graph(&parent, &chunks[..2]).is_err());
    }
}
