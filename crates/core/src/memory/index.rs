//! Semantic index over memory records
//!
//! Maps embedding vectors to record ids and answers k-NN queries by cosine
//! similarity. The index is derived state: it can be rebuilt from the
//! long-term log at any time.

use crate::types::MemoryRecord;
use uuid::Uuid;

pub struct SemanticIndex {
    entries: Vec<(Uuid, Vec<f32>)>,
}

impl SemanticIndex {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Insert or replace the embedding for a record id.
    pub fn insert(&mut self, id: Uuid, embedding: Vec<f32>) {
        if let Some(entry) = self.entries.iter_mut().find(|(eid, _)| *eid == id) {
            entry.1 = embedding;
        } else {
            self.entries.push((id, embedding));
        }
    }

    /// Top-k ids by cosine similarity, highest first. Zero vectors and
    /// dimension mismatches score 0.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(Uuid, f32)> {
        let mut scored: Vec<(Uuid, f32)> = self
            .entries
            .iter()
            .map(|(id, emb)| (*id, cosine_similarity(query, emb)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        scored
    }

    /// Drop everything and re-index from a record iterator.
    pub fn rebuild<'a>(&mut self, records: impl Iterator<Item = &'a MemoryRecord>) {
        self.entries.clear();
        for record in records {
            if let Some(embedding) = &record.embedding {
                self.entries.push((record.id, embedding.clone()));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for SemanticIndex {
    fn default() -> Self {
        Self::new()
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RecordKind;

    #[test]
    fn test_search_ranks_by_cosine() {
        let mut index = SemanticIndex::new();
        let near = Uuid::new_v4();
        let far = Uuid::new_v4();
        let opposite = Uuid::new_v4();
        index.insert(near, vec![1.0, 0.0, 0.1]);
        index.insert(far, vec![0.0, 1.0, 0.0]);
        index.insert(opposite, vec![-1.0, 0.0, 0.0]);

        let results = index.search(&[1.0, 0.0, 0.0], 2);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, near);
        assert_eq!(results[1].0, far);
        assert!(results[0].1 > 0.9);
    }

    #[test]
    fn test_insert_replaces_existing() {
        let mut index = SemanticIndex::new();
        let id = Uuid::new_v4();
        index.insert(id, vec![1.0, 0.0]);
        index.insert(id, vec![0.0, 1.0]);
        assert_eq!(index.len(), 1);
        let results = index.search(&[0.0, 1.0], 1);
        assert!(results[0].1 > 0.99);
    }

    #[test]
    fn test_mismatched_dimensions_score_zero() {
        let mut index = SemanticIndex::new();
        let id = Uuid::new_v4();
        index.insert(id, vec![1.0, 0.0]);
        let results = index.search(&[1.0, 0.0, 0.0], 1);
        assert_eq!(results[0].1, 0.0);
    }

    #[test]
    fn test_rebuild_from_records() {
        let mut index = SemanticIndex::new();
        index.insert(Uuid::new_v4(), vec![1.0]);

        let with_embedding = MemoryRecord::new(RecordKind::Observation, serde_json::json!({}))
            .with_embedding(vec![0.5, 0.5]);
        let without = MemoryRecord::new(RecordKind::Observation, serde_json::json!({}));
        index.rebuild([&with_embedding, &without].into_iter());

        assert_eq!(index.len(), 1);
        assert_eq!(index.search(&[0.5, 0.5], 5)[0].0, with_embedding.id);
    }
}
