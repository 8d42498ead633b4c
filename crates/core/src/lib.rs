pub mod cache;
pub mod chunking;
pub mod config;
pub mod conversion;
pub mod embeddings;
pub mod enrichment;
pub mod error;
pub mod ingest;
pub mod keywords;
pub mod llm;
pub mod models;
pub mod multi_embedding;
pub mod query;
pub mod relationships;
pub mod search;
pub mod store;
pub mod stores;
pub mod structure;

pub use cache::{CacheEntry, CacheStats, MetadataCache, MetadataVocabulary};
pub use chunking::{ChunkBuilder, ChunkSource, ChunkingConfig};
pub use config::{EngineConfig, RetryPolicy};
pub use conversion::{discover_documents, DocumentConverter};
pub use embeddings::{CharacterNgramEmbedder, Embedder, HttpEmbedder, DEFAULT_EMBEDDING_DIMENSIONS};
pub use enrichment::{DocumentContext, MetadataEnricher};
pub use error::{CapabilityError, IngestError, SearchError, StoreError};
pub use ingest::{ChunkFailure, FailureStage, FolderReport, IngestionPipeline, IngestionReport};
pub use llm::{DisabledLlm, OpenAiCompatibleLlm, TextCapability};
pub use models::{
    Chunk, ChunkMetadata, ChunkRecord, ChunkType, ComplexityLevel, Document, DocumentMetadata, EmbeddingSet,
    Facet, FacetWeights, QueryIntent, QueryMetadata, QueryState, RankedChunk, Relationship, RelationshipType,
    SearchRequest, SearchResponse,
};
pub use multi_embedding::{EmbeddingCache, EmbeddingStrategy, MultiEmbeddingGenerator, NoEmbeddings};
pub use query::{QueryOutcome, QueryProcessor};
pub use relationships::RelationshipGraph;
pub use search::{HybridSearchEngine, ScoringWeights};
pub use store::{ChunkStore, MetadataFilters, StoredChunk};
pub use stores::{InMemoryChunkStore, QdrantChunkStore};
pub use structure::{AnalysisSource, DocumentStructure, StructureAnalyzer};
