use crate::error::StoreError;
use crate::models::{ChunkRecord, EmbeddingSet, FacetWeights, Relationship, RelationshipType};
use crate::store::{weighted_similarity, ChunkStore, MetadataFilters, RelatedRecord, ScoredChunk, StoredChunk};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct Entry {
    record: ChunkRecord,
    embeddings: EmbeddingSet,
    outgoing: Vec<Relationship>,
}

/// Process-local [`ChunkStore`]. Every read is ordered by `(chunk index, document id)`.
#[derive(Debug, Default)]
pub struct InMemoryChunkStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl InMemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn embeddings(&self, chunk_id: &str) -> Option<EmbeddingSet> {
        self.entries
            .read()
            .await
            .get(chunk_id)
            .map(|entry| entry.embeddings.clone())
    }
}

fn ordered<'a>(entries: impl Iterator<Item = &'a Entry>) -> Vec<&'a Entry> {
    let mut ordered: Vec<&Entry> = entries.collect();
    ordered.sort_by(|left, right| {
        let left = &left.record.chunk;
        let right = &right.record.chunk;
        left.index
            .cmp(&right.index)
            .then_with(|| left.document_id.cmp(&right.document_id))
    });
    ordered
}

#[async_trait]
impl ChunkStore for InMemoryChunkStore {
    fn backend(&self) -> &str {
        "memory"
    }

    async fn store_chunk(&self, entry: &StoredChunk, outgoing: &[Relationship]) -> Result<(), StoreError> {
        let chunk = &entry.record.chunk;
        if chunk.id.is_empty() {
            return Err(StoreError::InvalidArgument("chunk id is empty".to_string()));
        }
        if let Some(edge) = outgoing.iter().find(|edge| edge.chunk_id != chunk.id) {
            return Err(StoreError::InvalidArgument(format!(
                "edge from {} stored with chunk {}",
                edge.chunk_id, chunk.id
            )));
        }

        self.entries.write().await.insert(
            chunk.id.clone(),
            Entry {
                record: entry.record.clone(),
                embeddings: entry.embeddings.clone(),
                outgoing: outgoing.to_vec(),
            },
        );
        Ok(())
    }

    async fn filter_chunks(
        &self,
        chatbot_id: &str,
        filters: &MetadataFilters,
        limit: usize,
    ) -> Result<Vec<ChunkRecord>, StoreError> {
        let entries = self.entries.read().await;
        Ok(ordered(entries.values())
            .into_iter()
            .filter(|entry| entry.record.chunk.chatbot_id == chatbot_id)
            .filter(|entry| filters.matches(&entry.record.metadata))
            .take(limit)
            .map(|entry| entry.record.clone())
            .collect())
    }

    async fn list_chunks(&self, chatbot_id: &str, limit: usize) -> Result<Vec<ChunkRecord>, StoreError> {
        let entries = self.entries.read().await;
        Ok(ordered(entries.values())
            .into_iter()
            .filter(|entry| entry.record.chunk.chatbot_id == chatbot_id)
            .take(limit)
            .map(|entry| entry.record.clone())
            .collect())
    }

    async fn multi_embedding_search(
        &self,
        chatbot_id: &str,
        query: &EmbeddingSet,
        weights: &FacetWeights,
        threshold: f32,
        limit: usize,
        candidate_ids: Option<&[String]>,
    ) -> Result<Vec<ScoredChunk>, StoreError> {
        let allowed: Option<HashSet<&str>> =
            candidate_ids.map(|ids| ids.iter().map(String::as_str).collect());
        let entries = self.entries.read().await;

        let mut scored: Vec<ScoredChunk> = ordered(entries.values())
            .into_iter()
            .filter(|entry| entry.record.chunk.chatbot_id == chatbot_id)
            .filter(|entry| {
                allowed
                    .as_ref()
                    .map_or(true, |allowed| allowed.contains(entry.record.chunk.id.as_str()))
            })
            .filter_map(|entry| {
                weighted_similarity(query, &entry.embeddings, weights)
                    .filter(|similarity| *similarity > threshold)
                    .map(|similarity| ScoredChunk {
                        record: entry.record.clone(),
                        similarity,
                    })
            })
            .collect();

        scored.sort_by(|left, right| right.similarity.total_cmp(&left.similarity));
        scored.truncate(limit);
        Ok(scored)
    }

    async fn get_related_chunks(
        &self,
        chunk_id: &str,
        types: &[RelationshipType],
        limit: usize,
    ) -> Result<Vec<RelatedRecord>, StoreError> {
        let entries = self.entries.read().await;
        let Some(source) = entries.get(chunk_id) else {
            return Ok(Vec::new());
        };

        let mut edges: Vec<&Relationship> = source
            .outgoing
            .iter()
            .filter(|edge| types.is_empty() || types.contains(&edge.relationship_type))
            .collect();
        edges.sort_by(|left, right| right.strength.total_cmp(&left.strength));

        Ok(edges
            .into_iter()
            .filter_map(|edge| {
                entries.get(&edge.related_chunk_id).map(|target| RelatedRecord {
                    relationship: edge.clone(),
                    record: target.record.clone(),
                })
            })
            .take(limit)
            .collect())
    }

    async fn fetch_all_records(&self, chatbot_id: &str) -> Result<Vec<ChunkRecord>, StoreError> {
        let entries = self.entries.read().await;
        Ok(ordered(entries.values())
            .into_iter()
            .filter(|entry| entry.record.chunk.chatbot_id == chatbot_id)
            .map(|entry| entry.record.clone())
            .collect())
    }

    async fn delete_document(&self, chatbot_id: &str, document_id: &str) -> Result<usize, StoreError> {
        let mut entries = self.entries.write().await;
        let doomed: HashSet<String> = entries
            .values()
            .filter(|entry| entry.record.chunk.chatbot_id == chatbot_id && entry.record.chunk.document_id == document_id)
            .map(|entry| entry.record.chunk.id.clone())
            .collect();

        entries.retain(|id, _| !doomed.contains(id));
        for entry in entries.values_mut() {
            entry.outgoing.retain(|edge| !doomed.contains(&edge.related_chunk_id));
        }
        Ok(doomed.len())
    }
}
