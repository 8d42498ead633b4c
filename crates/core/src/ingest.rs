//! Write path: analyse, chunk, relate, enrich, embed, store, invalidate.

use crate::cache::MetadataCache;
use crate::chunking::{ChunkBuilder, ChunkSource};
use crate::config::EngineConfig;
use crate::conversion::{discover_documents, DocumentConverter};
use crate::enrichment::{DocumentContext, MetadataEnricher};
use crate::error::{IngestError, StoreError};
use crate::llm::TextCapability;
use crate::models::{ChunkRecord, Document, EmbeddingSet};
use crate::multi_embedding::EmbeddingStrategy;
use crate::relationships::RelationshipGraph;
use crate::store::{ChunkStore, StoredChunk};
use crate::structure::{AnalysisSource, StructureAnalyzer};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Embedding,
    Store,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkFailure {
    pub chunk_index: usize,
    pub stage: FailureStage,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestionReport {
    pub document_id: String,
    pub title: String,
    pub chunks_stored: usize,
    pub relationships_stored: usize,
    pub failures: Vec<ChunkFailure>,
    pub structure_source: AnalysisSource,
    pub metadata_fallbacks: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedDocument {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FolderReport {
    pub documents: Vec<IngestionReport>,
    pub skipped_files: Vec<SkippedDocument>,
}

pub struct IngestionPipeline {
    analyzer: StructureAnalyzer,
    builder: ChunkBuilder,
    graph: RelationshipGraph,
    enricher: MetadataEnricher,
    embeddings: Arc<dyn EmbeddingStrategy>,
    store: Arc<dyn ChunkStore>,
    cache: Arc<MetadataCache>,
    llm: Arc<dyn TextCapability>,
}

impl IngestionPipeline {
    pub fn new(
        config: &EngineConfig,
        llm: Arc<dyn TextCapability>,
        embeddings: Arc<dyn EmbeddingStrategy>,
        store: Arc<dyn ChunkStore>,
        cache: Arc<MetadataCache>,
    ) -> Result<Self, IngestError> {
        Ok(Self {
            analyzer: StructureAnalyzer::new(config.max_prompt_chars)?,
            builder: ChunkBuilder::new(config.chunking)?,
            graph: RelationshipGraph::default().with_max_topical_chunks(config.max_topical_chunks),
            enricher: MetadataEnricher::new(Arc::clone(&llm), config),
            embeddings,
            store,
            cache,
            llm,
        })
    }

    /// Ingests one document. Per-chunk embedding and write failures are
    /// collected in the report; only invalid input is an error.
    pub async fn ingest_document(&self, chatbot_id: &str, document: &Document) -> Result<IngestionReport, IngestError> {
        if chatbot_id.trim().is_empty() {
            return Err(IngestError::InvalidArgument("chatbot id is empty".to_string()));
        }
        if document.text.trim().is_empty() {
            return Err(IngestError::InvalidArgument(format!(
                "document {} has no text",
                document.metadata.title
            )));
        }

        let structure = self
            .analyzer
            .analyze(&document.text, &document.metadata, self.builder.config(), self.llm.as_ref())
            .await;
        let blocks = self.analyzer.parse_blocks(&document.text);
        let source = ChunkSource {
            chatbot_id,
            document_id: &document.id,
            document_title: &document.metadata.title,
            text: &document.text,
        };
        let chunks = self.builder.build(&source, &blocks, &structure);
        let relationships = self.graph.build(&chunks);

        let context = DocumentContext {
            title: document.metadata.title.clone(),
            document_type: structure.document_type.clone(),
        };
        let metadata = self.enricher.enrich_chunks(&chunks, &context).await;
        let metadata_fallbacks = metadata.iter().filter(|record| !record.llm_processed).count();

        let records: Vec<ChunkRecord> = chunks
            .into_iter()
            .zip(metadata)
            .map(|(chunk, metadata)| ChunkRecord { chunk, metadata })
            .collect();

        let mut failures = Vec::new();
        let embedded = self.embeddings.embed_records(&records).await;
        let entries: Vec<StoredChunk> = records
            .into_iter()
            .zip(embedded)
            .map(|(record, embeddings)| {
                let embeddings = embeddings.unwrap_or_else(|error| {
                    warn!(chunk_index = record.chunk.index, document_id = %document.id, %error, "storing chunk without embeddings");
                    failures.push(ChunkFailure {
                        chunk_index: record.chunk.index,
                        stage: FailureStage::Embedding,
                        reason: error.to_string(),
                    });
                    EmbeddingSet::default()
                });
                StoredChunk { record, embeddings }
            })
            .collect();

        let stored = self.store.store_chunks(&entries, &relationships).await;
        failures.extend(stored.failures.into_iter().map(|failure| ChunkFailure {
            chunk_index: failure.chunk_index,
            stage: FailureStage::Store,
            reason: failure.reason,
        }));
        failures.sort_by_key(|failure| failure.chunk_index);

        if !stored.stored_chunk_ids.is_empty() {
            self.cache.invalidate(chatbot_id).await;
        }

        let report = IngestionReport {
            document_id: document.id.clone(),
            title: document.metadata.title.clone(),
            chunks_stored: stored.stored_chunk_ids.len(),
            relationships_stored: stored.relationships_stored,
            failures,
            structure_source: structure.source,
            metadata_fallbacks,
        };
        info!(
            %chatbot_id,
            document_id = %report.document_id,
            chunks = report.chunks_stored,
            relationships = report.relationships_stored,
            failures = report.failures.len(),
            "document ingested"
        );
        Ok(report)
    }

    /// Converts and ingests every supported file under `folder`. Files that fail
    /// conversion or ingestion are skipped and reported.
    pub async fn ingest_folder(
        &self,
        chatbot_id: &str,
        folder: &Path,
        converter: &DocumentConverter,
    ) -> Result<FolderReport, IngestError> {
        let files = discover_documents(folder);
        if files.is_empty() {
            return Err(IngestError::InvalidArgument(format!(
                "no supported documents found in {}",
                folder.display()
            )));
        }

        let mut report = FolderReport::default();
        for path in files {
            let outcome = match converter.convert(&path).await {
                Ok(document) => self.ingest_document(chatbot_id, &document).await,
                Err(error) => Err(error),
            };
            match outcome {
                Ok(document_report) => report.documents.push(document_report),
                Err(error) => {
                    warn!(path = %path.display(), %error, "skipping document");
                    report.skipped_files.push(SkippedDocument {
                        path,
                        reason: error.to_string(),
                    });
                }
            }
        }
        Ok(report)
    }

    /// Removes a document and drops the knowledge base's cached metadata.
    pub async fn delete_document(&self, chatbot_id: &str, document_id: &str) -> Result<usize, StoreError> {
        let removed = self.store.delete_document(chatbot_id, document_id).await?;
        self.cache.invalidate(chatbot_id).await;
        info!(%chatbot_id, %document_id, removed, "document deleted");
        Ok(removed)
    }
}
