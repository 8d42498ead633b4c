use crate::cache::MetadataCache;
use crate::error::SearchError;
use crate::keywords::overlap_count;
use crate::models::{
    ChunkRecord, ChunkType, QueryIntent, QueryMetadata, QueryScope, RankedChunk, RelatedChunk, RelationshipType,
    ScoreBreakdown, SearchMetadata, SearchRequest, SearchResponse, SearchStrategy, SectionGroup,
};
use crate::multi_embedding::EmbeddingStrategy;
use crate::query::{QueryOutcome, QueryProcessor};
use crate::store::{ChunkStore, MetadataFilters, RelatedRecord, ScoredChunk};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Candidates requested from the metadata pre-filter per final result.
pub const CANDIDATE_MULTIPLIER: usize = 3;

/// Lowest cosine similarity; asking the store for scores above it returns every scorable candidate.
const MIN_SIMILARITY: f32 = -1.0;

/// Blend of the four ranking signals. Without query vectors the vector share is
/// spread over the remaining signals in proportion to their weights.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoringWeights {
    pub vector: f32,
    pub metadata: f32,
    pub relationship: f32,
    pub type_affinity: f32,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            vector: 0.5,
            metadata: 0.3,
            relationship: 0.1,
            type_affinity: 0.1,
        }
    }
}

impl ScoringWeights {
    fn composite(&self, vector: Option<f32>, metadata: f32, relationship: f32, type_affinity: f32) -> f32 {
        let rest = metadata * self.metadata + relationship * self.relationship + type_affinity * self.type_affinity;
        match vector {
            Some(vector) => vector * self.vector + rest,
            None => {
                let rest_weight = self.metadata + self.relationship + self.type_affinity;
                if rest_weight > 0.0 {
                    rest / rest_weight
                } else {
                    0.0
                }
            }
        }
    }
}

struct Candidate {
    record: ChunkRecord,
    vector: Option<f32>,
    related: Vec<RelatedRecord>,
}

pub struct HybridSearchEngine {
    store: Arc<dyn ChunkStore>,
    cache: Arc<MetadataCache>,
    queries: Arc<QueryProcessor>,
    embeddings: Arc<dyn EmbeddingStrategy>,
    scoring: ScoringWeights,
}

impl HybridSearchEngine {
    pub fn new(
        store: Arc<dyn ChunkStore>,
        cache: Arc<MetadataCache>,
        queries: Arc<QueryProcessor>,
        embeddings: Arc<dyn EmbeddingStrategy>,
    ) -> Self {
        Self {
            store,
            cache,
            queries,
            embeddings,
            scoring: ScoringWeights::default(),
        }
    }

    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResponse, SearchError> {
        validate(request)?;
        let chatbot_id = request.chatbot_id.as_str();

        let snapshot = self.cache.get(chatbot_id).await?;
        let processed = match self
            .queries
            .process(&request.query_text, request.conversation_id.as_deref(), &snapshot.vocabulary)
            .await
        {
            QueryOutcome::Clarification { message, suggestions } => {
                info!(%chatbot_id, "query needs clarification");
                return Ok(SearchResponse::ClarificationNeeded { message, suggestions });
            }
            QueryOutcome::Search(processed) => processed,
        };

        let strategy = processed.strategy.clone();
        let mut search_metadata = SearchMetadata {
            query_state: processed.state,
            effective_query: processed.effective_query.clone(),
            extracted: processed.metadata.clone(),
            strategy: strategy.clone(),
            ..SearchMetadata::default()
        };

        let query_vectors = if self.embeddings.is_enabled() {
            self.embeddings
                .embed_query(&processed.effective_query, &processed.metadata, &strategy.weights.active_facets())
                .await
        } else {
            None
        };

        let filters = MetadataFilters::from_query(&processed.metadata);
        let prefiltered = if filters.is_empty() {
            Vec::new()
        } else {
            let limit = request.max_results.saturating_mul(CANDIDATE_MULTIPLIER);
            self.store.query_by_metadata(chatbot_id, &filters, limit).await?
        };
        search_metadata.candidate_count = prefiltered.len();

        if prefiltered.is_empty() {
            info!(%chatbot_id, query = %processed.effective_query, "no metadata candidates");
            return Ok(SearchResponse::NoResults { search_metadata });
        }

        let candidates = match &query_vectors {
            Some(vectors) => {
                let ids: Vec<String> = prefiltered.iter().map(|record| record.chunk.id.clone()).collect();
                match self
                    .store
                    .multi_embedding_search(
                        chatbot_id,
                        vectors,
                        &strategy.weights,
                        MIN_SIMILARITY,
                        ids.len(),
                        Some(ids.as_slice()),
                    )
                    .await
                {
                    Ok(scored) => {
                        search_metadata.embeddings_used = true;
                        with_vector_scores(prefiltered, scored, request.similarity_threshold)
                    }
                    Err(error) => {
                        warn!(%chatbot_id, %error, "vector search failed; ranking by metadata");
                        unscored(prefiltered)
                    }
                }
            }
            None => unscored(prefiltered),
        };

        if candidates.is_empty() {
            info!(%chatbot_id, "no candidates above similarity threshold");
            return Ok(SearchResponse::NoResults { search_metadata });
        }

        // Relationship expansion only runs for the chunks that make the cut.
        let mut shortlist: Vec<(f32, Candidate)> = candidates
            .into_iter()
            .map(|candidate| (self.signals(&candidate, &processed.metadata, &strategy, 0).composite, candidate))
            .collect();
        shortlist.sort_by(|(left_score, left), (right_score, right)| {
            right_score
                .total_cmp(left_score)
                .then_with(|| left.record.chunk.index.cmp(&right.record.chunk.index))
                .then_with(|| left.record.chunk.document_id.cmp(&right.record.chunk.document_id))
        });
        shortlist.truncate(request.max_results);

        let mut results = Vec::with_capacity(shortlist.len());
        for (_, mut candidate) in shortlist {
            if request.include_related && request.context_window > 0 {
                candidate.related = self.related_for(&candidate.record, &strategy, request.context_window).await;
            }
            results.push(self.rank(candidate, &processed.metadata, &strategy, request.context_window));
        }
        results.sort_by(compare_ranked);

        search_metadata.sections = group_by_section(&results);
        debug!(%chatbot_id, results = results.len(), "search ranked");
        Ok(SearchResponse::Results { results, search_metadata })
    }

    /// Related chunks ordered by strength scaled by how well the edge type suits the query.
    async fn related_for(&self, record: &ChunkRecord, strategy: &SearchStrategy, window: usize) -> Vec<RelatedRecord> {
        let fetched = match self
            .store
            .get_related_chunks(&record.chunk.id, &[], window.saturating_mul(CANDIDATE_MULTIPLIER))
            .await
        {
            Ok(related) => related,
            Err(error) => {
                warn!(chunk_id = %record.chunk.id, %error, "relationship expansion failed");
                return Vec::new();
            }
        };

        let mut related = fetched;
        related.sort_by(|left, right| {
            let left_score = left.relationship.strength * relationship_weight(left.relationship.relationship_type, strategy);
            let right_score = right.relationship.strength * relationship_weight(right.relationship.relationship_type, strategy);
            right_score
                .total_cmp(&left_score)
                .then_with(|| left.record.chunk.index.cmp(&right.record.chunk.index))
        });
        related.truncate(window);
        related
    }

    fn signals(&self, candidate: &Candidate, query: &QueryMetadata, strategy: &SearchStrategy, window: usize) -> ScoreBreakdown {
        let metadata = metadata_overlap(query, &candidate.record);
        let relationship = relationship_richness(&candidate.related, strategy, window);
        let type_affinity = type_affinity(candidate.record.chunk.chunk_type, strategy.intent);
        ScoreBreakdown {
            vector: candidate.vector.unwrap_or(0.0),
            metadata,
            relationship,
            type_affinity,
            composite: self.scoring.composite(candidate.vector, metadata, relationship, type_affinity),
        }
    }

    fn rank(&self, candidate: Candidate, query: &QueryMetadata, strategy: &SearchStrategy, window: usize) -> RankedChunk {
        let score = self.signals(&candidate, query, strategy, window);

        RankedChunk {
            related: candidate
                .related
                .into_iter()
                .map(|related| RelatedChunk {
                    chunk_id: related.record.chunk.id.clone(),
                    index: related.record.chunk.index,
                    relationship_type: related.relationship.relationship_type,
                    direction: related.relationship.direction,
                    strength: related.relationship.strength,
                    content: related.record.chunk.body().to_string(),
                })
                .collect(),
            chunk: candidate.record.chunk,
            metadata: candidate.record.metadata,
            score,
        }
    }
}

fn validate(request: &SearchRequest) -> Result<(), SearchError> {
    if request.chatbot_id.trim().is_empty() {
        return Err(SearchError::Request("chatbot id is required".to_string()));
    }
    if request.query_text.trim().is_empty() {
        return Err(SearchError::Request("query is empty".to_string()));
    }
    if request.max_results == 0 {
        return Err(SearchError::Request("max_results must be positive".to_string()));
    }
    if !(0.0..=1.0).contains(&request.similarity_threshold) {
        return Err(SearchError::Request(format!(
            "similarity threshold {} is outside [0, 1]",
            request.similarity_threshold
        )));
    }
    Ok(())
}

/// Applies vector scores to the metadata candidates. A candidate at or below the
/// threshold is dropped; one the store could not score (no shared facet) stays
/// and is ranked on the remaining signals.
fn with_vector_scores(records: Vec<ChunkRecord>, scored: Vec<ScoredChunk>, threshold: f32) -> Vec<Candidate> {
    let similarities: HashMap<String, f32> = scored
        .into_iter()
        .map(|hit| (hit.record.chunk.id, hit.similarity))
        .collect();

    records
        .into_iter()
        .filter_map(|record| match similarities.get(&record.chunk.id) {
            Some(&similarity) if similarity > threshold => Some(Candidate {
                record,
                vector: Some(similarity),
                related: Vec::new(),
            }),
            Some(_) => None,
            None => Some(Candidate { record, vector: None, related: Vec::new() }),
        })
        .collect()
}

fn unscored(records: Vec<ChunkRecord>) -> Vec<Candidate> {
    records
        .into_iter()
        .map(|record| Candidate { record, vector: None, related: Vec::new() })
        .collect()
}

fn compare_ranked(left: &RankedChunk, right: &RankedChunk) -> Ordering {
    right
        .score
        .composite
        .total_cmp(&left.score.composite)
        .then_with(|| left.chunk.index.cmp(&right.chunk.index))
        .then_with(|| left.chunk.document_id.cmp(&right.chunk.document_id))
}

/// Edge types favoured per intent; comprehensive scope always favours topical edges.
pub fn preferred_relationships(strategy: &SearchStrategy) -> Vec<RelationshipType> {
    let mut preferred = match strategy.intent {
        QueryIntent::Procedural => vec![RelationshipType::Hierarchical, RelationshipType::Sequential],
        QueryIntent::Troubleshooting => vec![RelationshipType::Sequential, RelationshipType::Topical],
        QueryIntent::Conceptual => vec![RelationshipType::Hierarchical, RelationshipType::Topical],
        QueryIntent::Comparative => vec![RelationshipType::Topical],
        QueryIntent::Factual => vec![RelationshipType::Sequential],
    };
    if strategy.scope == QueryScope::Comprehensive && !preferred.contains(&RelationshipType::Topical) {
        preferred.push(RelationshipType::Topical);
    }
    preferred
}

fn relationship_weight(relationship_type: RelationshipType, strategy: &SearchStrategy) -> f32 {
    if preferred_relationships(strategy).contains(&relationship_type) {
        1.0
    } else {
        0.5
    }
}

fn relationship_richness(related: &[RelatedRecord], strategy: &SearchStrategy, window: usize) -> f32 {
    if related.is_empty() || window == 0 {
        return 0.0;
    }
    let total: f32 = related
        .iter()
        .map(|item| item.relationship.strength * relationship_weight(item.relationship.relationship_type, strategy))
        .sum();
    (total / window as f32).clamp(0.0, 1.0)
}

/// Mean match ratio over the query fields that carry values.
fn metadata_overlap(query: &QueryMetadata, record: &ChunkRecord) -> f32 {
    let metadata = &record.metadata;
    let entity_names: Vec<String> = metadata.entities.iter().map(|entity| entity.name.clone()).collect();

    let mut ratios = Vec::new();
    for (wanted, present) in [
        (&query.topics, &metadata.topics),
        (&query.keywords, &metadata.keywords),
        (&query.question_types, &metadata.question_types),
        (&query.entities, &entity_names),
    ] {
        if !wanted.is_empty() {
            ratios.push(overlap_count(wanted, present) as f32 / wanted.len() as f32);
        }
    }
    if let Some(complexity) = query.complexity {
        ratios.push(if complexity == metadata.complexity_level { 1.0 } else { 0.0 });
    }

    if ratios.is_empty() {
        0.0
    } else {
        ratios.iter().sum::<f32>() / ratios.len() as f32
    }
}

pub fn type_affinity(chunk_type: ChunkType, intent: QueryIntent) -> f32 {
    use ChunkType::*;
    match (intent, chunk_type) {
        (QueryIntent::Procedural, Code | List) => 1.0,
        (QueryIntent::Procedural, Mixed) => 0.8,
        (QueryIntent::Procedural, Text | Table) => 0.6,
        (QueryIntent::Troubleshooting, Code) => 0.9,
        (QueryIntent::Troubleshooting, Text | List | Mixed) => 0.8,
        (QueryIntent::Troubleshooting, Table) => 0.6,
        (QueryIntent::Comparative, Table) => 1.0,
        (QueryIntent::Comparative, List) => 0.8,
        (QueryIntent::Comparative, Text | Mixed) => 0.7,
        (QueryIntent::Comparative, Code) => 0.4,
        (QueryIntent::Conceptual, Text) => 1.0,
        (QueryIntent::Conceptual, Mixed) => 0.8,
        (QueryIntent::Conceptual, List | Table) => 0.6,
        (QueryIntent::Conceptual, Code) => 0.4,
        (QueryIntent::Factual, Table) => 0.9,
        (QueryIntent::Factual, Text | List) => 0.8,
        (QueryIntent::Factual, Mixed) => 0.7,
        (QueryIntent::Factual, Code) => 0.6,
        (_, Image) => 0.3,
    }
}

/// Sections in order of their best-ranked chunk.
fn group_by_section(results: &[RankedChunk]) -> Vec<SectionGroup> {
    let mut groups: Vec<SectionGroup> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();
    for result in results {
        let section = match result.chunk.document_section.trim() {
            "" => "General".to_string(),
            section => section.to_string(),
        };
        match positions.get(&section) {
            Some(position) => groups[*position].chunk_ids.push(result.chunk.id.clone()),
            None => {
                positions.insert(section.clone(), groups.len());
                groups.push(SectionGroup {
                    section,
                    chunk_ids: vec![result.chunk.id.clone()],
                });
            }
        }
    }
    groups
}
