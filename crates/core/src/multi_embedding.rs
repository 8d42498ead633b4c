//! Per-facet embedding generation.
//!
//! Each chunk yields up to seven named vectors. Facet text is hashed and looked
//! up in a process-wide cache keyed by `(hash, facet)` before the embedder is
//! called. The cache is shared across knowledge bases.

use crate::chunking::normalize_whitespace;
use crate::embeddings::Embedder;
use crate::error::CapabilityError;
use crate::models::{Chunk, ChunkMetadata, ChunkRecord, EmbeddingSet, Facet, QueryMetadata};
use async_trait::async_trait;
use futures::future::join_all;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_EMBEDDING_CACHE_ENTRIES: usize = 50_000;

/// Source text for one facet of a chunk, or `None` when the facet has nothing to embed.
pub fn facet_text(chunk: &Chunk, metadata: &ChunkMetadata, facet: Facet) -> Option<String> {
    let text = match facet {
        Facet::Content => normalize_whitespace(chunk.body()),
        Facet::Topics => metadata.topics.join(", "),
        Facet::Keywords => metadata.keywords.join(", "),
        Facet::HeadingContext => chunk.heading_path(),
        Facet::DocumentSection => chunk.document_section.trim().to_string(),
        Facet::Audience => metadata.audience.join(", "),
        Facet::QuestionType => metadata.question_types.join(", "),
    };
    (!text.trim().is_empty()).then_some(text)
}

/// Query-side facet text. Facets without extracted metadata reuse the query itself.
pub fn query_facet_text(query: &str, metadata: &QueryMetadata, facet: Facet) -> Option<String> {
    let joined = match facet {
        Facet::Topics => metadata.topics.join(", "),
        Facet::Keywords => metadata.keywords.join(", "),
        Facet::QuestionType => metadata.question_types.join(", "),
        _ => String::new(),
    };
    let text = if joined.is_empty() { query.trim().to_string() } else { joined };
    (!text.is_empty()).then_some(text)
}

pub fn content_hash(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

#[derive(Debug)]
struct CachedVector {
    vector: Arc<Vec<f32>>,
    access_count: u64,
    last_used: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EmbeddingCacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

type CacheKey = (String, Facet);

/// Entries plus a recency index; `recency` maps each entry's last-use tick to its key.
#[derive(Debug, Default)]
struct LruEntries {
    entries: HashMap<CacheKey, CachedVector>,
    recency: BTreeMap<u64, CacheKey>,
    tick: u64,
}

impl LruEntries {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn evict_least_recent(&mut self) {
        if let Some((_, key)) = self.recency.pop_first() {
            self.entries.remove(&key);
        }
    }
}

/// Content-addressed vector cache with least-recently-used eviction. Entries are
/// immutable once written; a racing double computation simply overwrites with an
/// identical vector.
#[derive(Debug)]
pub struct EmbeddingCache {
    inner: Mutex<LruEntries>,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for EmbeddingCache {
    fn default() -> Self {
        Self::new(DEFAULT_EMBEDDING_CACHE_ENTRIES)
    }
}

impl EmbeddingCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(LruEntries::default()),
            max_entries: max_entries.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruEntries> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, hash: &str, facet: Facet) -> Option<Arc<Vec<f32>>> {
        let mut inner = self.lock();
        let key = (hash.to_string(), facet);
        let tick = inner.next_tick();
        let LruEntries { entries, recency, .. } = &mut *inner;
        match entries.get_mut(&key) {
            Some(entry) => {
                recency.remove(&entry.last_used);
                recency.insert(tick, key);
                entry.last_used = tick;
                entry.access_count += 1;
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(Arc::clone(&entry.vector))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Inserts a vector as the most recently used entry, evicting the least recently used one when full.
    pub fn insert(&self, hash: String, facet: Facet, vector: Vec<f32>) {
        let mut inner = self.lock();
        let key = (hash, facet);
        let tick = inner.next_tick();

        let access_count = match inner.entries.remove(&key) {
            Some(previous) => {
                inner.recency.remove(&previous.last_used);
                previous.access_count
            }
            None => {
                if inner.entries.len() >= self.max_entries {
                    inner.evict_least_recent();
                }
                1
            }
        };

        inner.recency.insert(tick, key.clone());
        inner.entries.insert(
            key,
            CachedVector {
                vector: Arc::new(vector),
                access_count,
                last_used: tick,
            },
        );
    }

    pub fn access_count(&self, hash: &str, facet: Facet) -> Option<u64> {
        self.lock().entries.get(&(hash.to_string(), facet)).map(|entry| entry.access_count)
    }

    pub fn stats(&self) -> EmbeddingCacheStats {
        let entries = self.lock().entries.len();
        EmbeddingCacheStats {
            entries,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

/// How embeddings are produced. Chosen once at startup: [`MultiEmbeddingGenerator`]
/// when embeddings are enabled, [`NoEmbeddings`] otherwise.
#[async_trait]
pub trait EmbeddingStrategy: Send + Sync {
    fn is_enabled(&self) -> bool;

    /// One result per record, in input order.
    async fn embed_records(&self, records: &[ChunkRecord]) -> Vec<Result<EmbeddingSet, CapabilityError>>;

    /// Query vectors for `facets`. `None` means search should run metadata-only.
    async fn embed_query(&self, query: &str, metadata: &QueryMetadata, facets: &[Facet]) -> Option<EmbeddingSet>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoEmbeddings;

#[async_trait]
impl EmbeddingStrategy for NoEmbeddings {
    fn is_enabled(&self) -> bool {
        false
    }

    async fn embed_records(&self, records: &[ChunkRecord]) -> Vec<Result<EmbeddingSet, CapabilityError>> {
        records.iter().map(|_| Ok(EmbeddingSet::default())).collect()
    }

    async fn embed_query(&self, _query: &str, _metadata: &QueryMetadata, _facets: &[Facet]) -> Option<EmbeddingSet> {
        None
    }
}

pub struct MultiEmbeddingGenerator {
    embedder: Arc<dyn Embedder>,
    cache: Arc<EmbeddingCache>,
    batch_size: usize,
    batch_delay: Duration,
}

impl MultiEmbeddingGenerator {
    pub fn new(embedder: Arc<dyn Embedder>, cache: Arc<EmbeddingCache>) -> Self {
        Self {
            embedder,
            cache,
            batch_size: crate::config::DEFAULT_BATCH_SIZE,
            batch_delay: Duration::ZERO,
        }
    }

    pub fn with_batching(mut self, batch_size: usize, batch_delay: Duration) -> Self {
        self.batch_size = batch_size.max(1);
        self.batch_delay = batch_delay;
        self
    }

    pub fn cache(&self) -> &Arc<EmbeddingCache> {
        &self.cache
    }

    /// Resolves every `(facet, text)` pair, calling the embedder once for all cache misses.
    async fn embed_facets(&self, facets: Vec<(Facet, String)>) -> Result<EmbeddingSet, CapabilityError> {
        let mut set = EmbeddingSet::default();
        let mut missing: Vec<(Facet, String, String)> = Vec::new();

        for (facet, text) in facets {
            let hash = content_hash(&text);
            match self.cache.get(&hash, facet) {
                Some(vector) => set.insert(facet, vector.as_ref().clone()),
                None => missing.push((facet, hash, text)),
            }
        }

        if missing.is_empty() {
            return Ok(set);
        }

        let texts: Vec<String> = missing.iter().map(|(_, _, text)| text.clone()).collect();
        let vectors = self.embedder.embed_batch(&texts).await?;
        if vectors.len() != missing.len() {
            return Err(CapabilityError::Malformed(format!(
                "embedder returned {} vectors for {} texts",
                vectors.len(),
                missing.len()
            )));
        }

        for ((facet, hash, _), vector) in missing.into_iter().zip(vectors) {
            self.cache.insert(hash, facet, vector.clone());
            set.insert(facet, vector);
        }
        Ok(set)
    }
}

#[async_trait]
impl EmbeddingStrategy for MultiEmbeddingGenerator {
    fn is_enabled(&self) -> bool {
        true
    }

    async fn embed_records(&self, records: &[ChunkRecord]) -> Vec<Result<EmbeddingSet, CapabilityError>> {
        let mut results = Vec::with_capacity(records.len());

        for (batch_index, batch) in records.chunks(self.batch_size).enumerate() {
            if batch_index > 0 && !self.batch_delay.is_zero() {
                tokio::time::sleep(self.batch_delay).await;
            }
            let batch_results = join_all(batch.iter().map(|record| {
                let facets = Facet::ALL
                    .into_iter()
                    .filter_map(|facet| facet_text(&record.chunk, &record.metadata, facet).map(|text| (facet, text)))
                    .collect();
                self.embed_facets(facets)
            }))
            .await;

            for (record, result) in batch.iter().zip(&batch_results) {
                match result {
                    Ok(set) => debug!(chunk_index = record.chunk.index, facets = set.len(), "chunk embedded"),
                    Err(error) => warn!(chunk_index = record.chunk.index, %error, "chunk embedding failed"),
                }
            }
            results.extend(batch_results);
        }

        results
    }

    async fn embed_query(&self, query: &str, metadata: &QueryMetadata, facets: &[Facet]) -> Option<EmbeddingSet> {
        let facets = facets
            .iter()
            .filter_map(|facet| query_facet_text(query, metadata, *facet).map(|text| (*facet, text)))
            .collect::<Vec<_>>();
        if facets.is_empty() {
            return None;
        }

        match self.embed_facets(facets).await {
            Ok(set) if !set.is_empty() => Some(set),
            Ok(_) => None,
            Err(error) => {
                warn!(%error, "query embedding failed; searching by metadata only");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::models::{ChunkType, HeadingRef};
    use std::sync::atomic::AtomicUsize;

    struct CountingEmbedder {
        inner: CharacterNgramEmbedder,
        texts_embedded: AtomicUsize,
        fail: bool,
    }

    impl CountingEmbedder {
        fn new(fail: bool) -> Self {
            Self {
                inner: CharacterNgramEmbedder { dimensions: 16 },
                texts_embedded: AtomicUsize::new(0),
                fail,
            }
        }
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        fn name(&self) -> &str {
            "counting"
        }

        fn dimensions(&self) -> usize {
            16
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CapabilityError> {
            if self.fail {
                return Err(CapabilityError::Status { service: "embed".to_string(), status: 500, body: String::new() });
            }
            self.texts_embedded.fetch_add(texts.len(), Ordering::SeqCst);
            self.inner.embed_batch(texts).await
        }
    }

    fn record(content: &str, topics: &[&str]) -> ChunkRecord {
        ChunkRecord {
            chunk: Chunk {
                id: content.to_string(),
                chatbot_id: "kb".to_string(),
                document_id: "doc".to_string(),
                content: content.to_string(),
                overlap_len: 0,
                chunk_type: ChunkType::Text,
                index: 0,
                heading_context: vec![HeadingRef { level: 1, title: "Guide".to_string() }],
                size_chars: content.len(),
                word_count: 2,
                document_section: "Guide".to_string(),
            },
            metadata: ChunkMetadata {
                topics: topics.iter().map(|topic| topic.to_string()).collect(),
                ..ChunkMetadata::default()
            },
        }
    }

    #[test]
    fn empty_facets_have_no_text() {
        let record = record("Backups run nightly.", &[]);
        assert!(facet_text(&record.chunk, &record.metadata, Facet::Topics).is_none());
        assert!(facet_text(&record.chunk, &record.metadata, Facet::Audience).is_none());
        assert_eq!(
            facet_text(&record.chunk, &record.metadata, Facet::HeadingContext).as_deref(),
            Some("Guide")
        );
    }

    #[test]
    fn warm_cache_still_retains_new_vectors() {
        let cache = EmbeddingCache::new(3);
        for key in ["a", "b", "c"] {
            cache.insert(key.to_string(), Facet::Content, vec![1.0]);
        }
        for _ in 0..3 {
            for key in ["a", "b", "c"] {
                assert!(cache.get(key, Facet::Content).is_some());
            }
        }

        cache.insert("d".to_string(), Facet::Content, vec![2.0]);
        cache.insert("e".to_string(), Facet::Content, vec![3.0]);

        assert_eq!(cache.stats().entries, 3);
        assert_eq!(cache.access_count("d", Facet::Content), Some(1));
        assert_eq!(cache.access_count("e", Facet::Content), Some(1));
        assert!(cache.access_count("a", Facet::Content).is_none());
        assert!(cache.access_count("b", Facet::Content).is_none());
        assert_eq!(cache.access_count("c", Facet::Content), Some(4));
    }

    #[test]
    fn reading_an_entry_protects_it_from_eviction() {
        let cache = EmbeddingCache::new(2);
        cache.insert("old".to_string(), Facet::Topics, vec![1.0]);
        cache.insert("newer".to_string(), Facet::Topics, vec![1.0]);
        assert!(cache.get("old", Facet::Topics).is_some());

        cache.insert("newest".to_string(), Facet::Topics, vec![1.0]);
        assert!(cache.access_count("old", Facet::Topics).is_some());
        assert!(cache.access_count("newer", Facet::Topics).is_none());
    }

    #[test]
    fn content_hash_is_stable_hex() {
        let hash = content_hash("abc");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, content_hash("abc"));
        assert_ne!(hash, content_hash("abd"));
    }

    #[tokio::test]
    async fn null_facets_are_absent_and_cache_prevents_recompute() {
        let embedder = Arc::new(CountingEmbedder::new(false));
        let generator = MultiEmbeddingGenerator::new(embedder.clone(), Arc::new(EmbeddingCache::default()));

        let records = vec![record("Backups run nightly.", &["backups"]), record("Backups run nightly.", &["backups"])];
        let results = generator.embed_records(&records).await;

        let first = results[0].as_ref().expect("embedded");
        assert!(first.get(Facet::Content).is_some());
        assert!(first.get(Facet::Topics).is_some());
        assert!(first.get(Facet::Audience).is_none());
        assert!(first.get(Facet::Keywords).is_none());

        // Content, topics, heading context and section for the first record; the
        // second record is identical and may race, so at most double.
        let embedded = embedder.texts_embedded.load(Ordering::SeqCst);
        assert!((4..=8).contains(&embedded), "embedded {embedded}");

        let again = generator.embed_records(&records[..1]).await;
        assert!(again[0].is_ok());
        assert_eq!(embedder.texts_embedded.load(Ordering::SeqCst), embedded);
        let hash = content_hash("backups");
        assert!(generator.cache().access_count(&hash, Facet::Topics).unwrap_or(0) >= 1);
    }

    #[tokio::test]
    async fn embedder_failure_is_reported_per_record() {
        let generator = MultiEmbeddingGenerator::new(Arc::new(CountingEmbedder::new(true)), Arc::new(EmbeddingCache::default()));
        let results = generator.embed_records(&[record("text", &[])]).await;
        assert!(results[0].is_err());

        let query = generator.embed_query("backups", &QueryMetadata::default(), &[Facet::Content]).await;
        assert!(query.is_none());
    }

    #[tokio::test]
    async fn query_embeddings_cover_requested_facets() {
        let generator = MultiEmbeddingGenerator::new(
            Arc::new(CountingEmbedder::new(false)),
            Arc::new(EmbeddingCache::default()),
        );
        let metadata = QueryMetadata { topics: vec!["backups".to_string()], ..QueryMetadata::default() };
        let set = generator
            .embed_query("how do backups work", &metadata, &[Facet::Content, Facet::Topics])
            .await
            .expect("embeddings");
        assert_eq!(set.len(), 2);
        assert_ne!(set.get(Facet::Content), set.get(Facet::Topics));
    }

    #[tokio::test]
    async fn disabled_strategy_is_a_no_op() {
        let results = NoEmbeddings.embed_records(&[record("text", &[])]).await;
        assert!(results[0].as_ref().map(EmbeddingSet::is_empty).unwrap_or(false));
        assert!(NoEmbeddings.embed_query("q", &QueryMetadata::default(), &Facet::ALL).await.is_none());
    }

    #[test]
    fn cache_evicts_least_accessed_entry() {
        let cache = EmbeddingCache::new(2);
        cache.insert("a".to_string(), Facet::Content, vec![1.0]);
        cache.insert("b".to_string(), Facet::Content, vec![2.0]);
        assert!(cache.get("a", Facet::Content).is_some());
        cache.insert("c".to_string(), Facet::Content, vec![3.0]);

        assert!(cache.get("b", Facet::Content).is_none());
        assert!(cache.get("a", Facet::Content).is_some());
        assert_eq!(cache.stats().entries, 2);
    }
}
