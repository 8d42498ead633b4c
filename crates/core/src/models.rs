use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DocumentMetadata {
    pub title: String,
    pub source_type: String,
    pub byte_length: u64,
}

/// A parsed document. Every ingestion gets a fresh id; the text is never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub text: String,
    pub metadata: DocumentMetadata,
    pub ingested_at: DateTime<Utc>,
}

impl Document {
    pub fn new(text: impl Into<String>, metadata: DocumentMetadata) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            text: text.into(),
            metadata,
            ingested_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChunkType {
    #[default]
    Text,
    Code,
    List,
    Table,
    Image,
    Mixed,
}

impl ChunkType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Code => "code",
            Self::List => "list",
            Self::Table => "table",
            Self::Image => "image",
            Self::Mixed => "mixed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct HeadingRef {
    pub level: u8,
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub chatbot_id: String,
    pub document_id: String,
    /// Stored content: `overlap_len` bytes of the previous chunk's tail, then the body.
    pub content: String,
    pub overlap_len: usize,
    pub chunk_type: ChunkType,
    pub index: usize,
    pub heading_context: Vec<HeadingRef>,
    pub size_chars: usize,
    pub word_count: usize,
    pub document_section: String,
}

impl Chunk {
    /// Content without the injected overlap prefix.
    pub fn body(&self) -> &str {
        self.content.get(self.overlap_len..).unwrap_or(&self.content)
    }

    /// Deepest (numerically largest) heading level active for this chunk, 0 when none.
    pub fn max_heading_level(&self) -> u8 {
        self.heading_context
            .iter()
            .map(|heading| heading.level)
            .max()
            .unwrap_or(0)
    }

    pub fn heading_path(&self) -> String {
        self.heading_context
            .iter()
            .map(|heading| heading.title.as_str())
            .collect::<Vec<_>>()
            .join(" > ")
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RelationshipType {
    Sequential,
    Hierarchical,
    Topical,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Previous,
    Next,
    Parent,
    Sibling,
    Bidirectional,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Relationship {
    pub chunk_id: String,
    pub related_chunk_id: String,
    pub relationship_type: RelationshipType,
    pub direction: Direction,
    pub strength: f32,
    /// Keywords both chunks share; only populated for topical edges.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shared_keywords: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ComplexityLevel {
    #[default]
    Beginner,
    Intermediate,
    Advanced,
}

impl ComplexityLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Beginner => "beginner",
            Self::Intermediate => "intermediate",
            Self::Advanced => "advanced",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "beginner" => Some(Self::Beginner),
            "intermediate" => Some(Self::Intermediate),
            "advanced" => Some(Self::Advanced),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Entity {
    pub name: String,
    #[serde(rename = "type", default)]
    pub entity_type: String,
}

pub const METADATA_PROCESSING_VERSION: &str = "2.0";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ChunkMetadata {
    pub topics: Vec<String>,
    pub keywords: Vec<String>,
    pub entities: Vec<Entity>,
    pub complexity_level: ComplexityLevel,
    pub question_types: Vec<String>,
    pub audience: Vec<String>,
    pub prerequisites: Vec<String>,
    pub related_concepts: Vec<String>,
    pub content_characteristics: Vec<String>,
    pub llm_processed: bool,
    pub processing_version: String,
}

/// Chunk plus its metadata, without embeddings. The unit held by the metadata cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkRecord {
    pub chunk: Chunk,
    pub metadata: ChunkMetadata,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Facet {
    Content,
    Topics,
    Keywords,
    HeadingContext,
    DocumentSection,
    Audience,
    QuestionType,
}

impl Facet {
    pub const ALL: [Facet; 7] = [
        Facet::Content,
        Facet::Topics,
        Facet::Keywords,
        Facet::HeadingContext,
        Facet::DocumentSection,
        Facet::Audience,
        Facet::QuestionType,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Content => "content",
            Self::Topics => "topics",
            Self::Keywords => "keywords",
            Self::HeadingContext => "heading_context",
            Self::DocumentSection => "document_section",
            Self::Audience => "audience",
            Self::QuestionType => "question_type",
        }
    }
}

/// Named vectors for one chunk. A facet with no source text has no entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct EmbeddingSet {
    pub vectors: BTreeMap<Facet, Vec<f32>>,
}

impl EmbeddingSet {
    pub fn get(&self, facet: Facet) -> Option<&[f32]> {
        self.vectors.get(&facet).map(Vec::as_slice)
    }

    pub fn insert(&mut self, facet: Facet, vector: Vec<f32>) {
        self.vectors.insert(facet, vector);
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }
}

/// Per-facet weights for the composite vector score.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FacetWeights(pub BTreeMap<Facet, f32>);

impl Default for FacetWeights {
    fn default() -> Self {
        Self(BTreeMap::from([
            (Facet::Content, 0.4),
            (Facet::Topics, 0.2),
            (Facet::Keywords, 0.15),
            (Facet::HeadingContext, 0.1),
            (Facet::QuestionType, 0.1),
            (Facet::DocumentSection, 0.05),
            (Facet::Audience, 0.0),
        ]))
    }
}

impl FacetWeights {
    pub fn weight(&self, facet: Facet) -> f32 {
        self.0.get(&facet).copied().unwrap_or(0.0)
    }

    /// Facets that contribute to the score, in canonical order.
    pub fn active_facets(&self) -> Vec<Facet> {
        Facet::ALL
            .into_iter()
            .filter(|facet| self.weight(*facet) > 0.0)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum QueryState {
    #[default]
    Clear,
    Contextual,
    Unclear,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum QueryIntent {
    #[default]
    Factual,
    Procedural,
    Conceptual,
    Troubleshooting,
    Comparative,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum QueryScope {
    #[default]
    Specific,
    Comprehensive,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SearchStrategy {
    pub weights: FacetWeights,
    pub intent: QueryIntent,
    pub scope: QueryScope,
}

/// Search metadata extracted from a query, restricted to the knowledge base's vocabulary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct QueryMetadata {
    pub topics: Vec<String>,
    pub question_types: Vec<String>,
    pub keywords: Vec<String>,
    pub entities: Vec<String>,
    pub complexity: Option<ComplexityLevel>,
}

impl QueryMetadata {
    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
            && self.question_types.is_empty()
            && self.keywords.is_empty()
            && self.entities.is_empty()
            && self.complexity.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchRequest {
    pub chatbot_id: String,
    pub query_text: String,
    pub conversation_id: Option<String>,
    pub max_results: usize,
    pub similarity_threshold: f32,
    pub include_related: bool,
    pub context_window: usize,
}

impl SearchRequest {
    pub fn new(chatbot_id: impl Into<String>, query_text: impl Into<String>) -> Self {
        Self {
            chatbot_id: chatbot_id.into(),
            query_text: query_text.into(),
            conversation_id: None,
            max_results: 5,
            similarity_threshold: 0.3,
            include_related: true,
            context_window: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ScoreBreakdown {
    pub vector: f32,
    pub metadata: f32,
    pub relationship: f32,
    pub type_affinity: f32,
    pub composite: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelatedChunk {
    pub chunk_id: String,
    pub index: usize,
    pub relationship_type: RelationshipType,
    pub direction: Direction,
    pub strength: f32,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RankedChunk {
    pub chunk: Chunk,
    pub metadata: ChunkMetadata,
    pub score: ScoreBreakdown,
    pub related: Vec<RelatedChunk>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SectionGroup {
    pub section: String,
    pub chunk_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SearchMetadata {
    pub query_state: QueryState,
    pub effective_query: String,
    pub extracted: QueryMetadata,
    pub strategy: SearchStrategy,
    pub candidate_count: usize,
    pub embeddings_used: bool,
    pub sections: Vec<SectionGroup>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SearchResponse {
    Results {
        results: Vec<RankedChunk>,
        search_metadata: SearchMetadata,
    },
    ClarificationNeeded {
        message: String,
        suggestions: Vec<String>,
    },
    NoResults {
        search_metadata: SearchMetadata,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_body_skips_overlap_prefix() {
        let chunk = Chunk {
            id: "c1".to_string(),
            chatbot_id: "kb".to_string(),
            document_id: "d1".to_string(),
            content: "tail. Body text".to_string(),
            overlap_len: 6,
            chunk_type: ChunkType::Text,
            index: 1,
            heading_context: vec![
                HeadingRef { level: 1, title: "Guide".to_string() },
                HeadingRef { level: 2, title: "Setup".to_string() },
            ],
            size_chars: 9,
            word_count: 2,
            document_section: "Setup".to_string(),
        };

        assert_eq!(chunk.body(), "Body text");
        assert_eq!(chunk.max_heading_level(), 2);
        assert_eq!(chunk.heading_path(), "Guide > Setup");
    }

    #[test]
    fn default_weights_skip_zero_facets() {
        let weights = FacetWeights::default();
        let active = weights.active_facets();
        assert!(active.contains(&Facet::Content));
        assert!(!active.contains(&Facet::Audience));
    }

    #[test]
    fn search_response_is_tagged_by_type() {
        let response = SearchResponse::NoResults {
            search_metadata: SearchMetadata::default(),
        };
        let json = serde_json::to_value(&response).expect("serializable");
        assert_eq!(json["type"], "no_results");
    }
}
