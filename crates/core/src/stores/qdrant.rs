use crate::error::StoreError;
use crate::models::{ChunkRecord, EmbeddingSet, Facet, FacetWeights, Relationship, RelationshipType};
use crate::store::{weighted_similarity, ChunkStore, MetadataFilters, RelatedRecord, ScoredChunk, StoredChunk};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::{debug, info};
use uuid::Uuid;

const SCROLL_PAGE: usize = 256;

/// [`ChunkStore`] over Qdrant's HTTP API. One named vector per facet; the chunk
/// record and its outgoing edges live in the point payload, so a chunk write is
/// a single upsert.
pub struct QdrantChunkStore {
    endpoint: String,
    collection: String,
    client: Client,
    vector_size: usize,
}

impl QdrantChunkStore {
    pub fn new(endpoint: impl Into<String>, collection: impl Into<String>, vector_size: usize) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            collection: collection.into(),
            client: Client::new(),
            vector_size,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/collections/{}{}", self.endpoint, self.collection, path)
    }

    /// Creates the collection and its payload indexes when missing.
    pub async fn ensure_collection(&self) -> Result<(), StoreError> {
        let existing = self.client.get(self.url("")).send().await?;
        if existing.status().is_success() {
            return Ok(());
        }
        if existing.status() != StatusCode::NOT_FOUND {
            return Err(backend_error(existing).await);
        }

        let vectors: serde_json::Map<String, Value> = Facet::ALL
            .iter()
            .map(|facet| {
                (
                    facet.as_str().to_string(),
                    json!({ "size": self.vector_size, "distance": "Cosine" }),
                )
            })
            .collect();
        let response = self
            .client
            .put(self.url(""))
            .json(&json!({ "vectors": vectors }))
            .send()
            .await?;
        check(response).await?;

        for field in ["chatbot_id", "document_id", "topics", "keywords", "question_types", "audience", "complexity_level"] {
            let response = self
                .client
                .put(self.url("/index?wait=true"))
                .json(&json!({ "field_name": field, "field_schema": "keyword" }))
                .send()
                .await?;
            check(response).await?;
        }
        info!(collection = %self.collection, vector_size = self.vector_size, "qdrant collection created");
        Ok(())
    }

    async fn scroll(&self, filter: Value, limit: Option<usize>) -> Result<Vec<Value>, StoreError> {
        let mut points = Vec::new();
        let mut offset = Value::Null;
        loop {
            let page = limit.map_or(SCROLL_PAGE, |limit| (limit - points.len()).min(SCROLL_PAGE));
            let mut body = json!({
                "filter": filter,
                "limit": page,
                "with_payload": true,
                "with_vector": false,
            });
            if !offset.is_null() {
                body["offset"] = offset.clone();
            }

            let response = self.client.post(self.url("/points/scroll")).json(&body).send().await?;
            let parsed: Value = check(response).await?.json().await?;
            points.extend(
                parsed
                    .pointer("/result/points")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default(),
            );

            offset = parsed.pointer("/result/next_page_offset").cloned().unwrap_or(Value::Null);
            let filled = limit.is_some_and(|limit| points.len() >= limit);
            if offset.is_null() || filled {
                return Ok(points);
            }
        }
    }

    async fn retrieve(&self, chunk_ids: &[String], with_vector: bool) -> Result<Vec<Value>, StoreError> {
        if chunk_ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<String> = chunk_ids.iter().map(|id| point_id(id)).collect();
        let response = self
            .client
            .post(self.url("/points"))
            .json(&json!({ "ids": ids, "with_payload": true, "with_vector": with_vector }))
            .send()
            .await?;
        let parsed: Value = check(response).await?.json().await?;
        Ok(parsed
            .pointer("/result")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    /// Per-facet nearest neighbours, used to seed an unrestricted vector search.
    async fn facet_candidates(
        &self,
        chatbot_id: &str,
        query: &EmbeddingSet,
        weights: &FacetWeights,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        let mut ids = Vec::new();
        for (facet, vector) in &query.vectors {
            if weights.weight(*facet) <= 0.0 {
                continue;
            }
            let response = self
                .client
                .post(self.url("/points/search"))
                .json(&json!({
                    "vector": { "name": facet.as_str(), "vector": vector },
                    "filter": tenant_filter(chatbot_id),
                    "limit": limit,
                    "with_payload": ["chunk_id"],
                }))
                .send()
                .await?;
            let parsed: Value = check(response).await?.json().await?;
            for hit in parsed.pointer("/result").and_then(Value::as_array).into_iter().flatten() {
                if let Some(id) = hit.pointer("/payload/chunk_id").and_then(Value::as_str) {
                    if !ids.iter().any(|known: &String| known == id) {
                        ids.push(id.to_string());
                    }
                }
            }
        }
        Ok(ids)
    }
}

/// Qdrant ids must be integers or UUIDs; chunk ids are hashed into a UUID.
fn point_id(chunk_id: &str) -> String {
    let digest = Sha256::digest(chunk_id.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes).to_string()
}

fn tenant_filter(chatbot_id: &str) -> Value {
    json!({ "must": [{ "key": "chatbot_id", "match": { "value": chatbot_id } }] })
}

fn metadata_filter(chatbot_id: &str, filters: &MetadataFilters) -> Value {
    let mut must = vec![json!({ "key": "chatbot_id", "match": { "value": chatbot_id } })];
    for (key, values) in [
        ("topics", &filters.topics),
        ("question_types", &filters.question_types),
        ("audience", &filters.audience),
        ("keywords", &filters.keywords),
    ] {
        if !values.is_empty() {
            let lowered: Vec<String> = values.iter().map(|value| value.to_lowercase()).collect();
            must.push(json!({ "key": key, "match": { "any": lowered } }));
        }
    }
    if let Some(complexity) = filters.complexity {
        must.push(json!({ "key": "complexity_level", "match": { "value": complexity.as_str() } }));
    }
    json!({ "must": must })
}

fn lowered(values: &[String]) -> Vec<String> {
    values.iter().map(|value| value.to_lowercase()).collect()
}

fn payload(entry: &StoredChunk, outgoing: &[Relationship]) -> Result<Value, StoreError> {
    let chunk = &entry.record.chunk;
    let metadata = &entry.record.metadata;
    Ok(json!({
        "chunk_id": chunk.id,
        "chatbot_id": chunk.chatbot_id,
        "document_id": chunk.document_id,
        "chunk_index": chunk.index,
        "chunk_type": chunk.chunk_type.as_str(),
        "content_length": chunk.size_chars,
        "document_section": chunk.document_section,
        "topics": lowered(&metadata.topics),
        "keywords": lowered(&metadata.keywords),
        "question_types": lowered(&metadata.question_types),
        "audience": lowered(&metadata.audience),
        "complexity_level": metadata.complexity_level.as_str(),
        "llm_processed": metadata.llm_processed,
        "processing_version": metadata.processing_version,
        "record": serde_json::to_value(&entry.record)?,
        "relationships": serde_json::to_value(outgoing)?,
    }))
}

fn record_from_point(point: &Value) -> Result<ChunkRecord, StoreError> {
    let record = point
        .pointer("/payload/record")
        .cloned()
        .ok_or_else(|| StoreError::Backend {
            backend: "qdrant".to_string(),
            details: "point payload has no record".to_string(),
        })?;
    Ok(serde_json::from_value(record)?)
}

fn count_from_response(response: &Value) -> Result<usize, StoreError> {
    response
        .pointer("/result/count")
        .and_then(Value::as_u64)
        .and_then(|count| usize::try_from(count).ok())
        .ok_or_else(|| StoreError::Backend {
            backend: "qdrant".to_string(),
            details: format!("count response has no usable result.count: {response}"),
        })
}

fn relationships_from_point(point: &Value) -> Result<Vec<Relationship>, StoreError> {
    match point.pointer("/payload/relationships") {
        Some(value) => Ok(serde_json::from_value(value.clone())?),
        None => Ok(Vec::new()),
    }
}

fn embeddings_from_point(point: &Value) -> EmbeddingSet {
    let mut set = EmbeddingSet::default();
    let Some(vectors) = point.pointer("/vector").and_then(Value::as_object) else {
        return set;
    };
    for facet in Facet::ALL {
        let vector: Option<Vec<f32>> = vectors.get(facet.as_str()).and_then(Value::as_array).map(|values| {
            values
                .iter()
                .filter_map(Value::as_f64)
                .map(|value| value as f32)
                .collect()
        });
        if let Some(vector) = vector.filter(|vector| !vector.is_empty()) {
            set.insert(facet, vector);
        }
    }
    set
}

fn sort_by_index(records: &mut [ChunkRecord]) {
    records.sort_by(|left, right| {
        left.chunk
            .index
            .cmp(&right.chunk.index)
            .then_with(|| left.chunk.document_id.cmp(&right.chunk.document_id))
    });
}

async fn backend_error(response: Response) -> StoreError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    StoreError::Backend {
        backend: "qdrant".to_string(),
        details: format!("{status}: {body}"),
    }
}

async fn check(response: Response) -> Result<Response, StoreError> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(backend_error(response).await)
    }
}

#[async_trait]
impl ChunkStore for QdrantChunkStore {
    fn backend(&self) -> &str {
        "qdrant"
    }

    async fn store_chunk(&self, entry: &StoredChunk, outgoing: &[Relationship]) -> Result<(), StoreError> {
        let mut vectors = serde_json::Map::new();
        for (facet, vector) in &entry.embeddings.vectors {
            if vector.len() != self.vector_size {
                return Err(StoreError::InvalidArgument(format!(
                    "{} embedding dimension {} != {}",
                    facet.as_str(),
                    vector.len(),
                    self.vector_size
                )));
            }
            vectors.insert(facet.as_str().to_string(), json!(vector));
        }

        let point = json!({
            "id": point_id(&entry.record.chunk.id),
            "vector": vectors,
            "payload": payload(entry, outgoing)?,
        });
        let response = self
            .client
            .put(self.url("/points?wait=true"))
            .json(&json!({ "points": [point] }))
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn filter_chunks(
        &self,
        chatbot_id: &str,
        filters: &MetadataFilters,
        limit: usize,
    ) -> Result<Vec<ChunkRecord>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let points = self.scroll(metadata_filter(chatbot_id, filters), Some(limit)).await?;
        let mut records = points.iter().map(record_from_point).collect::<Result<Vec<_>, _>>()?;
        sort_by_index(&mut records);
        Ok(records)
    }

    async fn list_chunks(&self, chatbot_id: &str, limit: usize) -> Result<Vec<ChunkRecord>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let points = self.scroll(tenant_filter(chatbot_id), Some(limit)).await?;
        let mut records = points.iter().map(record_from_point).collect::<Result<Vec<_>, _>>()?;
        sort_by_index(&mut records);
        Ok(records)
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
        let ids = match candidate_ids {
            Some(ids) => ids.to_vec(),
            None => self.facet_candidates(chatbot_id, query, weights, limit.saturating_mul(3)).await?,
        };

        let points = self.retrieve(&ids, true).await?;
        let mut scored = Vec::new();
        for point in &points {
            let record = record_from_point(point)?;
            if record.chunk.chatbot_id != chatbot_id {
                continue;
            }
            let embeddings = embeddings_from_point(point);
            if let Some(similarity) = weighted_similarity(query, &embeddings, weights).filter(|score| *score > threshold) {
                scored.push(ScoredChunk { record, similarity });
            }
        }

        scored.sort_by(|left, right| {
            right
                .similarity
                .total_cmp(&left.similarity)
                .then_with(|| left.record.chunk.index.cmp(&right.record.chunk.index))
        });
        scored.truncate(limit);
        debug!(%chatbot_id, candidates = ids.len(), hits = scored.len(), "qdrant multi-embedding search");
        Ok(scored)
    }

    async fn get_related_chunks(
        &self,
        chunk_id: &str,
        types: &[RelationshipType],
        limit: usize,
    ) -> Result<Vec<RelatedRecord>, StoreError> {
        let source = self.retrieve(&[chunk_id.to_string()], false).await?;
        let Some(source) = source.first() else {
            return Ok(Vec::new());
        };

        let mut edges: Vec<Relationship> = relationships_from_point(source)?
            .into_iter()
            .filter(|edge| types.is_empty() || types.contains(&edge.relationship_type))
            .collect();
        edges.sort_by(|left, right| right.strength.total_cmp(&left.strength));

        let target_ids: Vec<String> = edges.iter().map(|edge| edge.related_chunk_id.clone()).collect();
        let mut targets: HashMap<String, ChunkRecord> = HashMap::new();
        for point in self.retrieve(&target_ids, false).await? {
            let record = record_from_point(&point)?;
            targets.insert(record.chunk.id.clone(), record);
        }

        Ok(edges
            .into_iter()
            .filter_map(|edge| {
                targets.get(&edge.related_chunk_id).cloned().map(|record| RelatedRecord {
                    relationship: edge,
                    record,
                })
            })
            .take(limit)
            .collect())
    }

    async fn fetch_all_records(&self, chatbot_id: &str) -> Result<Vec<ChunkRecord>, StoreError> {
        let points = self.scroll(tenant_filter(chatbot_id), None).await?;
        let mut records = points.iter().map(record_from_point).collect::<Result<Vec<_>, _>>()?;
        sort_by_index(&mut records);
        Ok(records)
    }

    async fn delete_document(&self, chatbot_id: &str, document_id: &str) -> Result<usize, StoreError> {
        let filter = json!({
            "must": [
                { "key": "chatbot_id", "match": { "value": chatbot_id } },
                { "key": "document_id", "match": { "value": document_id } },
            ]
        });

        let response = self
            .client
            .post(self.url("/points/count"))
            .json(&json!({ "filter": filter, "exact": true }))
            .send()
            .await?;
        let parsed: Value = check(response).await?.json().await?;
        let count = count_from_response(&parsed)?;

        let response = self
            .client
            .post(self.url("/points/delete?wait=true"))
            .json(&json!({ "filter": filter }))
            .send()
            .await?;
        check(response).await?;
        info!(%chatbot_id, %document_id, removed = count, "document deleted from qdrant");
        Ok(count)
    }
}
