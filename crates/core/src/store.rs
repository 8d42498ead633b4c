//! Persistence seam for chunks, metadata, embeddings and relationship edges.

use crate::error::StoreError;
use crate::models::{
    ChunkMetadata, ChunkRecord, ComplexityLevel, EmbeddingSet, FacetWeights, QueryMetadata, Relationship,
    RelationshipType,
};
use async_trait::async_trait;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Everything written for one chunk. Written atomically.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredChunk {
    pub record: ChunkRecord,
    pub embeddings: EmbeddingSet,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoreFailure {
    pub chunk_index: usize,
    pub chunk_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreReport {
    pub stored_chunk_ids: Vec<String>,
    pub relationships_stored: usize,
    pub failures: Vec<StoreFailure>,
}

/// Metadata pre-filter: any value may match within a field, every non-empty field must match.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataFilters {
    pub topics: Vec<String>,
    pub question_types: Vec<String>,
    pub audience: Vec<String>,
    pub complexity: Option<ComplexityLevel>,
    pub keywords: Vec<String>,
}

impl MetadataFilters {
    /// Filters from extracted query metadata. Complexity is left to scoring.
    pub fn from_query(metadata: &QueryMetadata) -> Self {
        Self {
            topics: metadata.topics.clone(),
            question_types: metadata.question_types.clone(),
            audience: Vec::new(),
            complexity: None,
            keywords: metadata.keywords.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
            && self.question_types.is_empty()
            && self.audience.is_empty()
            && self.complexity.is_none()
            && self.keywords.is_empty()
    }

    pub fn matches(&self, metadata: &ChunkMetadata) -> bool {
        any_match(&self.topics, &metadata.topics)
            && any_match(&self.question_types, &metadata.question_types)
            && any_match(&self.audience, &metadata.audience)
            && any_match(&self.keywords, &metadata.keywords)
            && self
                .complexity
                .map_or(true, |complexity| complexity == metadata.complexity_level)
    }
}

fn any_match(wanted: &[String], present: &[String]) -> bool {
    wanted.is_empty()
        || wanted
            .iter()
            .any(|value| present.iter().any(|candidate| candidate.eq_ignore_ascii_case(value)))
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub record: ChunkRecord,
    pub similarity: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelatedRecord {
    pub relationship: Relationship,
    pub record: ChunkRecord,
}

#[async_trait]
pub trait ChunkStore: Send + Sync {
    fn backend(&self) -> &str;

    /// Writes one chunk together with its outgoing edges.
    async fn store_chunk(&self, entry: &StoredChunk, outgoing: &[Relationship]) -> Result<(), StoreError>;

    async fn filter_chunks(
        &self,
        chatbot_id: &str,
        filters: &MetadataFilters,
        limit: usize,
    ) -> Result<Vec<ChunkRecord>, StoreError>;

    /// Filter-free read used when a filtered query fails.
    async fn list_chunks(&self, chatbot_id: &str, limit: usize) -> Result<Vec<ChunkRecord>, StoreError>;

    async fn multi_embedding_search(
        &self,
        chatbot_id: &str,
        query: &EmbeddingSet,
        weights: &FacetWeights,
        threshold: f32,
        limit: usize,
        candidate_ids: Option<&[String]>,
    ) -> Result<Vec<ScoredChunk>, StoreError>;

    /// Edges out of `chunk_id` of the given types, strongest first. Empty `types` means all.
    async fn get_related_chunks(
        &self,
        chunk_id: &str,
        types: &[RelationshipType],
        limit: usize,
    ) -> Result<Vec<RelatedRecord>, StoreError>;

    /// Every chunk of a knowledge base with metadata and no embeddings, ordered by chunk index.
    async fn fetch_all_records(&self, chatbot_id: &str) -> Result<Vec<ChunkRecord>, StoreError>;

    /// Removes a document's chunks, metadata, embeddings and edges. Returns the chunk count removed.
    async fn delete_document(&self, chatbot_id: &str, document_id: &str) -> Result<usize, StoreError>;

    /// Writes each chunk independently; one failure is recorded and the rest proceed.
    async fn store_chunks(&self, entries: &[StoredChunk], relationships: &[Relationship]) -> StoreReport {
        let mut outgoing: HashMap<&str, Vec<Relationship>> = HashMap::new();
        for relationship in relationships {
            outgoing
                .entry(relationship.chunk_id.as_str())
                .or_default()
                .push(relationship.clone());
        }

        let mut report = StoreReport::default();
        for entry in entries {
            let chunk = &entry.record.chunk;
            let edges = outgoing.get(chunk.id.as_str()).map(Vec::as_slice).unwrap_or_default();
            match self.store_chunk(entry, edges).await {
                Ok(()) => {
                    report.stored_chunk_ids.push(chunk.id.clone());
                    report.relationships_stored += edges.len();
                }
                Err(error) => {
                    warn!(backend = self.backend(), chunk_index = chunk.index, %error, "chunk write failed");
                    report.failures.push(StoreFailure {
                        chunk_index: chunk.index,
                        chunk_id: chunk.id.clone(),
                        reason: error.to_string(),
                    });
                }
            }
        }
        debug!(
            backend = self.backend(),
            stored = report.stored_chunk_ids.len(),
            failed = report.failures.len(),
            "chunk batch written"
        );
        report
    }

    /// Filtered read that degrades to [`ChunkStore::list_chunks`] when the filtered query errors.
    async fn query_by_metadata(
        &self,
        chatbot_id: &str,
        filters: &MetadataFilters,
        limit: usize,
    ) -> Result<Vec<ChunkRecord>, StoreError> {
        match self.filter_chunks(chatbot_id, filters, limit).await {
            Ok(records) => Ok(records),
            Err(error) => {
                warn!(backend = self.backend(), %chatbot_id, %error, "filtered query failed; using unfiltered read");
                self.list_chunks(chatbot_id, limit).await
            }
        }
    }
}

pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f32 {
    if left.len() != right.len() || left.is_empty() {
        return 0.0;
    }
    let mut dot = 0f32;
    let mut left_norm = 0f32;
    let mut right_norm = 0f32;
    for (a, b) in left.iter().zip(right) {
        dot += a * b;
        left_norm += a * a;
        right_norm += b * b;
    }
    if left_norm == 0.0 || right_norm == 0.0 {
        return 0.0;
    }
    dot / (left_norm.sqrt() * right_norm.sqrt())
}

/// Weighted mean of per-facet cosine similarity over facets present in both
/// sets with positive weight. `None` when no facet qualifies, which is not the
/// same as zero similarity.
pub fn weighted_similarity(query: &EmbeddingSet, chunk: &EmbeddingSet, weights: &FacetWeights) -> Option<f32> {
    let mut total = 0f32;
    let mut weight_sum = 0f32;
    for (facet, query_vector) in &query.vectors {
        let weight = weights.weight(*facet);
        if weight <= 0.0 {
            continue;
        }
        if let Some(chunk_vector) = chunk.get(*facet) {
            total += weight * cosine_similarity(query_vector, chunk_vector);
            weight_sum += weight;
        }
    }
    (weight_sum > 0.0).then(|| total / weight_sum)
}
