use crate::config::EngineConfig;
use crate::keywords::{dedup_preserving_order, extract_keywords};
use crate::llm::{complete_json, truncate_chars, TextCapability};
use crate::models::{Chunk, ChunkMetadata, ChunkType, ComplexityLevel, Entity, METADATA_PROCESSING_VERSION};
use futures::future::join_all;
use serde::Deserialize;
use serde_with::{serde_as, DefaultOnError, VecSkipError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Per-field caps applied to every metadata record.
#[derive(Debug, Clone, Copy)]
pub struct FieldLimits {
    pub topics: usize,
    pub keywords: usize,
    pub entities: usize,
    pub audience: usize,
    pub question_types: usize,
    pub prerequisites: usize,
    pub related_concepts: usize,
    pub content_characteristics: usize,
}

impl Default for FieldLimits {
    fn default() -> Self {
        Self {
            topics: 5,
            keywords: 10,
            entities: 10,
            audience: 3,
            question_types: 5,
            prerequisites: 5,
            related_concepts: 5,
            content_characteristics: 5,
        }
    }
}

/// Document-level facts handed to the extractor alongside each chunk.
#[derive(Debug, Clone, Default)]
pub struct DocumentContext {
    pub title: String,
    pub document_type: String,
}

#[serde_as]
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MetadataReply {
    #[serde_as(deserialize_as = "DefaultOnError<VecSkipError<_>>")]
    topics: Vec<String>,
    #[serde_as(deserialize_as = "DefaultOnError<VecSkipError<_>>")]
    keywords: Vec<String>,
    #[serde_as(deserialize_as = "DefaultOnError<VecSkipError<_>>")]
    entities: Vec<ReplyEntity>,
    #[serde_as(deserialize_as = "DefaultOnError<VecSkipError<_>>")]
    audience: Vec<String>,
    #[serde_as(deserialize_as = "DefaultOnError<VecSkipError<_>>")]
    question_types: Vec<String>,
    #[serde_as(deserialize_as = "DefaultOnError")]
    complexity_level: Option<String>,
    #[serde_as(deserialize_as = "DefaultOnError<VecSkipError<_>>")]
    content_characteristics: Vec<String>,
    #[serde_as(deserialize_as = "DefaultOnError<VecSkipError<_>>")]
    prerequisites: Vec<String>,
    #[serde_as(deserialize_as = "DefaultOnError<VecSkipError<_>>")]
    related_concepts: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ReplyEntity {
    Named {
        name: String,
        #[serde(rename = "type", default)]
        entity_type: Option<String>,
    },
    Bare(String),
}

const METADATA_SYSTEM_PROMPT: &str = "You extract retrieval metadata from documentation excerpts. \
Reply with a single JSON object and nothing else.";

pub struct MetadataEnricher {
    llm: Arc<dyn TextCapability>,
    llm_enabled: bool,
    batch_size: usize,
    batch_delay: Duration,
    max_prompt_chars: usize,
    limits: FieldLimits,
}

impl MetadataEnricher {
    pub fn new(llm: Arc<dyn TextCapability>, config: &EngineConfig) -> Self {
        Self {
            llm,
            llm_enabled: config.llm_metadata_enabled,
            batch_size: config.enrichment_batch_size.max(1),
            batch_delay: config.batch_delay,
            max_prompt_chars: config.max_prompt_chars,
            limits: config.metadata_limits,
        }
    }

    /// One metadata record per chunk, in input order. Fixed-size batches run
    /// concurrently inside and are separated by the configured delay.
    pub async fn enrich_chunks(&self, chunks: &[Chunk], context: &DocumentContext) -> Vec<ChunkMetadata> {
        let mut records = Vec::with_capacity(chunks.len());
        let batch_count = chunks.len().div_ceil(self.batch_size);

        for (batch_index, batch) in chunks.chunks(self.batch_size).enumerate() {
            if batch_index > 0 && !self.batch_delay.is_zero() && self.llm_enabled {
                tokio::time::sleep(self.batch_delay).await;
            }
            let batch_records = join_all(batch.iter().map(|chunk| self.enrich_chunk(chunk, context))).await;
            records.extend(batch_records);
            debug!(batch = batch_index + 1, batch_count, "metadata batch enriched");
        }

        let fallbacks = records.iter().filter(|record| !record.llm_processed).count();
        info!(chunk_count = chunks.len(), fallbacks, "metadata enrichment finished");
        records
    }

    /// Never fails: any extraction problem yields the rule-based record.
    pub async fn enrich_chunk(&self, chunk: &Chunk, context: &DocumentContext) -> ChunkMetadata {
        if !self.llm_enabled {
            return self.fallback_metadata(chunk);
        }

        let prompt = self.prompt(chunk, context);
        match complete_json::<MetadataReply>(self.llm.as_ref(), METADATA_SYSTEM_PROMPT, &prompt).await {
            Ok(reply) => self.validate(reply),
            Err(error) => {
                warn!(chunk_index = chunk.index, document_id = %chunk.document_id, %error, "metadata extraction fell back to rules");
                self.fallback_metadata(chunk)
            }
        }
    }

    /// Frequency keywords plus heading-derived topics.
    pub fn fallback_metadata(&self, chunk: &Chunk) -> ChunkMetadata {
        let body = chunk.body();
        let keywords = extract_keywords(body, self.limits.keywords);

        let mut topics = dedup_preserving_order(
            chunk
                .heading_context
                .iter()
                .rev()
                .map(|heading| heading.title.to_lowercase()),
        );
        if topics.is_empty() {
            topics = keywords.iter().take(3).cloned().collect();
        }
        if topics.is_empty() && !chunk.document_section.trim().is_empty() {
            topics.push(chunk.document_section.to_lowercase());
        }
        if topics.is_empty() {
            topics.push("general".to_string());
        }
        topics.truncate(self.limits.topics);

        let lowered = body.to_lowercase();
        let mut question_types = Vec::new();
        if matches!(chunk.chunk_type, ChunkType::Code | ChunkType::List) || lowered.contains("step") {
            question_types.push("how-to".to_string());
        }
        if ["error", "fail", "issue", "problem", "troubleshoot"]
            .iter()
            .any(|marker| lowered.contains(marker))
        {
            question_types.push("troubleshooting".to_string());
        }
        if body.contains('?') {
            question_types.push("faq".to_string());
        }
        if question_types.is_empty() {
            question_types.push("what".to_string());
        }

        let complexity_level = match chunk.chunk_type {
            ChunkType::Code => ComplexityLevel::Intermediate,
            _ => ComplexityLevel::Beginner,
        };

        ChunkMetadata {
            topics,
            keywords,
            entities: Vec::new(),
            complexity_level,
            question_types,
            audience: vec!["general".to_string()],
            prerequisites: Vec::new(),
            related_concepts: Vec::new(),
            content_characteristics: vec![chunk.chunk_type.as_str().to_string()],
            llm_processed: false,
            processing_version: METADATA_PROCESSING_VERSION.to_string(),
        }
    }

    fn validate(&self, reply: MetadataReply) -> ChunkMetadata {
        let limits = self.limits;
        let clean = |values: Vec<String>, limit: usize| {
            let mut values = dedup_preserving_order(values.into_iter().map(|value| value.trim().to_string()));
            values.truncate(limit);
            values
        };
        let clean_lower = |values: Vec<String>, limit: usize| {
            clean(values.into_iter().map(|value| value.to_lowercase()).collect(), limit)
        };

        let mut seen = std::collections::BTreeSet::new();
        let entities: Vec<Entity> = reply
            .entities
            .into_iter()
            .map(|entity| match entity {
                ReplyEntity::Named { name, entity_type } => Entity {
                    name: name.trim().to_string(),
                    entity_type: entity_type.unwrap_or_default().trim().to_lowercase(),
                },
                ReplyEntity::Bare(name) => Entity {
                    name: name.trim().to_string(),
                    entity_type: String::new(),
                },
            })
            .filter(|entity| !entity.name.is_empty() && seen.insert(entity.name.to_lowercase()))
            .take(limits.entities)
            .collect();

        ChunkMetadata {
            topics: clean_lower(reply.topics, limits.topics),
            keywords: clean_lower(reply.keywords, limits.keywords),
            entities,
            complexity_level: reply
                .complexity_level
                .as_deref()
                .and_then(ComplexityLevel::parse)
                .unwrap_or_default(),
            question_types: clean_lower(reply.question_types, limits.question_types),
            audience: clean_lower(reply.audience, limits.audience),
            prerequisites: clean(reply.prerequisites, limits.prerequisites),
            related_concepts: clean(reply.related_concepts, limits.related_concepts),
            content_characteristics: clean_lower(reply.content_characteristics, limits.content_characteristics),
            llm_processed: true,
            processing_version: METADATA_PROCESSING_VERSION.to_string(),
        }
    }

    fn prompt(&self, chunk: &Chunk, context: &DocumentContext) -> String {
        format!(
            "Document: {title} ({kind})\nSection: {section}\nHeadings: {headings}\nChunk type: {chunk_type}\n\n\
Return JSON with keys topics, keywords, entities ([{{\"name\", \"type\"}}]), audience, question_types \
(what, how-to, why, troubleshooting, comparison, faq), complexity_level (beginner|intermediate|advanced), \
content_characteristics, prerequisites, related_concepts. Use short lowercase phrases.\n\nCONTENT:\n{content}",
            title = context.title,
            kind = context.document_type,
            section = chunk.document_section,
            headings = chunk.heading_path(),
            chunk_type = chunk.chunk_type.as_str(),
            content = truncate_chars(chunk.body(), self.max_prompt_chars),
        )
    }
}
