//! Per-knowledge-base snapshot of chunk metadata.
//!
//! Each knowledge base owns a slot guarded by an async mutex. A caller that
//! finds the slot empty or expired builds while holding the lock, so concurrent
//! callers wait for that one build and then read its result. The guard is
//! released on every exit path, including a failed build.

use crate::config::DEFAULT_CACHE_TTL;
use crate::error::StoreError;
use crate::models::ChunkRecord;
use crate::store::ChunkStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

/// Metadata values actually observed in a knowledge base, lowercased.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetadataVocabulary {
    pub topic_counts: BTreeMap<String, usize>,
    pub question_types: BTreeSet<String>,
    pub keywords: BTreeSet<String>,
    pub entities: BTreeSet<String>,
    pub audience: BTreeSet<String>,
}

impl MetadataVocabulary {
    pub fn from_records(records: &[ChunkRecord]) -> Self {
        let mut vocabulary = Self::default();
        for record in records {
            let metadata = &record.metadata;
            for topic in &metadata.topics {
                *vocabulary.topic_counts.entry(topic.to_lowercase()).or_default() += 1;
            }
            vocabulary
                .question_types
                .extend(metadata.question_types.iter().map(|value| value.to_lowercase()));
            vocabulary
                .keywords
                .extend(metadata.keywords.iter().map(|value| value.to_lowercase()));
            vocabulary
                .entities
                .extend(metadata.entities.iter().map(|entity| entity.name.to_lowercase()));
            vocabulary
                .audience
                .extend(metadata.audience.iter().map(|value| value.to_lowercase()));
        }
        vocabulary
    }

    pub fn has_topic(&self, topic: &str) -> bool {
        self.topic_counts.contains_key(&topic.to_lowercase())
    }

    /// Most frequent topics first; ties in alphabetical order.
    pub fn top_topics(&self, limit: usize) -> Vec<String> {
        let mut topics: Vec<(&String, &usize)> = self.topic_counts.iter().collect();
        topics.sort_by(|left, right| right.1.cmp(left.1).then_with(|| left.0.cmp(right.0)));
        topics.into_iter().take(limit).map(|(topic, _)| topic.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.topic_counts.is_empty() && self.keywords.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub id: String,
    pub chatbot_id: String,
    pub built_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub records: Vec<ChunkRecord>,
    pub vocabulary: MetadataVocabulary,
}

impl CacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KnowledgeBaseCacheStats {
    pub chatbot_id: String,
    pub building: bool,
    pub chunk_count: usize,
    pub built_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub expired: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub ttl_secs: u64,
    pub hits: u64,
    pub misses: u64,
    pub builds: u64,
    pub knowledge_bases: Vec<KnowledgeBaseCacheStats>,
}

type Slot = Arc<AsyncMutex<Option<Arc<CacheEntry>>>>;

pub struct MetadataCache {
    store: Arc<dyn ChunkStore>,
    ttl: Duration,
    slots: Mutex<HashMap<String, Slot>>,
    hits: AtomicU64,
    misses: AtomicU64,
    builds: AtomicU64,
}

impl MetadataCache {
    pub fn new(store: Arc<dyn ChunkStore>) -> Self {
        Self::with_ttl(store, DEFAULT_CACHE_TTL)
    }

    pub fn with_ttl(store: Arc<dyn ChunkStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            slots: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            builds: AtomicU64::new(0),
        }
    }

    fn slot(&self, chatbot_id: &str) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(slots.entry(chatbot_id.to_string()).or_default())
    }

    /// A non-expired snapshot, building it when absent or stale. Concurrent
    /// callers for the same knowledge base share a single build.
    pub async fn get(&self, chatbot_id: &str) -> Result<Arc<CacheEntry>, StoreError> {
        let slot = self.slot(chatbot_id);
        let mut guard = slot.lock().await;

        if let Some(entry) = guard.as_ref().filter(|entry| !entry.is_expired(Utc::now())) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(entry));
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let records = self.store.fetch_all_records(chatbot_id).await?;
        self.builds.fetch_add(1, Ordering::Relaxed);

        let built_at = Utc::now();
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::hours(1));
        let entry = Arc::new(CacheEntry {
            id: uuid::Uuid::new_v4().to_string(),
            chatbot_id: chatbot_id.to_string(),
            built_at,
            expires_at: built_at + ttl,
            vocabulary: MetadataVocabulary::from_records(&records),
            records,
        });
        info!(%chatbot_id, chunk_count = entry.records.len(), "metadata cache built");

        *guard = Some(Arc::clone(&entry));
        Ok(entry)
    }

    /// Drops the snapshot. Waits for an in-flight build so its result cannot outlive the mutation.
    /// The slot itself is released when no other caller holds it.
    pub async fn invalidate(&self, chatbot_id: &str) {
        let slot = self.slot(chatbot_id);
        {
            let mut guard = slot.lock().await;
            if guard.take().is_some() {
                debug!(%chatbot_id, "metadata cache invalidated");
            }
        }
        self.release_slot(chatbot_id, &slot);
    }

    /// Removes an empty slot owned only by the map and `slot`. Clones are taken
    /// under the map lock, so the count cannot grow while it is held.
    fn release_slot(&self, chatbot_id: &str, slot: &Slot) {
        let mut slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let unshared = slots
            .get(chatbot_id)
            .is_some_and(|current| Arc::ptr_eq(current, slot) && Arc::strong_count(slot) == 2);
        if unshared && slot.try_lock().is_ok_and(|guard| guard.is_none()) {
            slots.remove(chatbot_id);
        }
    }

    pub async fn refresh(&self, chatbot_id: &str) -> Result<Arc<CacheEntry>, StoreError> {
        self.invalidate(chatbot_id).await;
        self.get(chatbot_id).await
    }

    /// Point-in-time view. Slots that are building right now are reported as such.
    pub fn stats(&self) -> CacheStats {
        let slots: Vec<(String, Slot)> = {
            let slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            slots.iter().map(|(id, slot)| (id.clone(), Arc::clone(slot))).collect()
        };

        let now = Utc::now();
        let mut knowledge_bases: Vec<KnowledgeBaseCacheStats> = slots
            .iter()
            .map(|(chatbot_id, slot)| slot_stats(chatbot_id, slot, now))
            .collect();
        knowledge_bases.sort_by(|left, right| left.chatbot_id.cmp(&right.chatbot_id));

        CacheStats {
            ttl_secs: self.ttl.as_secs(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            builds: self.builds.load(Ordering::Relaxed),
            knowledge_bases,
        }
    }
}

fn slot_stats(chatbot_id: &str, slot: &Slot, now: DateTime<Utc>) -> KnowledgeBaseCacheStats {
    let mut stats = KnowledgeBaseCacheStats {
        chatbot_id: chatbot_id.to_string(),
        building: false,
        chunk_count: 0,
        built_at: None,
        expires_at: None,
        expired: false,
    };
    match slot.try_lock() {
        Ok(guard) => {
            if let Some(entry) = guard.as_ref() {
                stats.chunk_count = entry.records.len();
                stats.built_at = Some(entry.built_at);
                stats.expires_at = Some(entry.expires_at);
                stats.expired = entry.is_expired(now);
            }
        }
        Err(_) => stats.building = true,
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        Chunk, ChunkMetadata, ChunkType, EmbeddingSet, FacetWeights, Relationship, RelationshipType,
    };
    use crate::store::{MetadataFilters, RelatedRecord, ScoredChunk, StoredChunk};
    use crate::stores::InMemoryChunkStore;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;

    /// Counts full-knowledge-base reads and can be told to fail them.
    struct CountingStore {
        inner: InMemoryChunkStore,
        fetches: AtomicU64,
        fail: AtomicBool,
    }

    impl CountingStore {
        fn new() -> Self {
            Self {
                inner: InMemoryChunkStore::new(),
                fetches: AtomicU64::new(0),
                fail: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl ChunkStore for CountingStore {
        fn backend(&self) -> &str {
            "counting"
        }

        async fn store_chunk(&self, entry: &StoredChunk, outgoing: &[Relationship]) -> Result<(), StoreError> {
            self.inner.store_chunk(entry, outgoing).await
        }

        async fn filter_chunks(
            &self,
            chatbot_id: &str,
            filters: &MetadataFilters,
            limit: usize,
        ) -> Result<Vec<ChunkRecord>, StoreError> {
            self.inner.filter_chunks(chatbot_id, filters, limit).await
        }

        async fn list_chunks(&self, chatbot_id: &str, limit: usize) -> Result<Vec<ChunkRecord>, StoreError> {
            self.inner.list_chunks(chatbot_id, limit).await
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
            self.inner
                .multi_embedding_search(chatbot_id, query, weights, threshold, limit, candidate_ids)
                .await
        }

        async fn get_related_chunks(
            &self,
            chunk_id: &str,
            types: &[RelationshipType],
            limit: usize,
        ) -> Result<Vec<RelatedRecord>, StoreError> {
            self.inner.get_related_chunks(chunk_id, types, limit).await
        }

        async fn fetch_all_records(&self, chatbot_id: &str) -> Result<Vec<ChunkRecord>, StoreError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.fail.load(Ordering::SeqCst) {
                return Err(StoreError::Backend {
                    backend: "counting".to_string(),
                    details: "offline".to_string(),
                });
            }
            self.inner.fetch_all_records(chatbot_id).await
        }

        async fn delete_document(&self, chatbot_id: &str, document_id: &str) -> Result<usize, StoreError> {
            self.inner.delete_document(chatbot_id, document_id).await
        }
    }

    fn stored(id: &str, index: usize, topics: &[&str]) -> StoredChunk {
        StoredChunk {
            record: ChunkRecord {
                chunk: Chunk {
                    id: id.to_string(),
                    chatbot_id: "kb1".to_string(),
                    document_id: "doc".to_string(),
                    content: "body".to_string(),
                    overlap_len: 0,
                    chunk_type: ChunkType::Text,
                    index,
                    heading_context: Vec::new(),
                    size_chars: 4,
                    word_count: 1,
                    document_section: String::new(),
                },
                metadata: ChunkMetadata {
                    topics: topics.iter().map(|topic| topic.to_string()).collect(),
                    ..ChunkMetadata::default()
                },
            },
            embeddings: EmbeddingSet::default(),
        }
    }

    async fn seeded() -> Arc<CountingStore> {
        let store = Arc::new(CountingStore::new());
        store
            .store_chunks(
                &[
                    stored("b", 1, &["Restore", "backups"]),
                    stored("a", 0, &["backups"]),
                ],
                &[],
            )
            .await;
        store
    }

    #[tokio::test]
    async fn concurrent_cold_reads_share_one_build() {
        let store = seeded().await;
        let cache = MetadataCache::new(store.clone());

        let (first, second) = tokio::join!(cache.get("kb1"), cache.get("kb1"));
        let first = first.expect("first read");
        let second = second.expect("second read");

        assert_eq!(store.fetches.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.records[0].chunk.id, "a");

        let stats = cache.stats();
        assert_eq!(stats.builds, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.knowledge_bases[0].chunk_count, 2);
    }

    #[tokio::test]
    async fn expired_entries_are_never_returned() {
        let store = seeded().await;
        let cache = MetadataCache::with_ttl(store.clone(), Duration::ZERO);

        let first = cache.get("kb1").await.expect("read");
        let second = cache.get("kb1").await.expect("read");
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(store.fetches.load(Ordering::SeqCst), 2);
        assert!(cache.stats().knowledge_bases[0].expired);
    }

    #[tokio::test]
    async fn invalidation_forces_rebuild() {
        let store = seeded().await;
        let cache = MetadataCache::new(store.clone());

        let before = cache.get("kb1").await.expect("read");
        store.store_chunk(&stored("c", 2, &["billing"]), &[]).await.expect("write");
        cache.invalidate("kb1").await;
        let after = cache.get("kb1").await.expect("read");

        assert_eq!(before.records.len(), 2);
        assert_eq!(after.records.len(), 3);
        assert_ne!(before.id, after.id);

        let refreshed = cache.refresh("kb1").await.expect("refresh");
        assert_ne!(refreshed.id, after.id);
        assert_eq!(store.fetches.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn invalidated_knowledge_base_leaves_no_slot_behind() {
        let store = seeded().await;
        let cache = MetadataCache::new(store.clone());

        cache.get("kb1").await.expect("read");
        cache.get("kb2").await.expect("read");
        cache.invalidate("kb1").await;
        cache.invalidate("never-read").await;

        let ids: Vec<String> =
            cache.stats().knowledge_bases.into_iter().map(|kb| kb.chatbot_id).collect();
        assert_eq!(ids, vec!["kb2".to_string()]);

        let rebuilt = cache.get("kb1").await.expect("read");
        assert_eq!(rebuilt.records.len(), 2);
        assert_eq!(store.fetches.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn invalidation_keeps_a_slot_that_is_still_shared() {
        let store = seeded().await;
        let cache = MetadataCache::new(store);
        cache.get("kb1").await.expect("read");

        let held = cache.slot("kb1");
        cache.invalidate("kb1").await;
        assert_eq!(cache.stats().knowledge_bases.len(), 1);
        assert!(held.lock().await.is_none());

        drop(held);
        cache.invalidate("kb1").await;
        assert!(cache.stats().knowledge_bases.is_empty());
    }

    #[tokio::test]
    async fn failed_build_releases_the_slot() {
        let store = seeded().await;
        let cache = MetadataCache::new(store.clone());

        store.fail.store(true, Ordering::SeqCst);
        assert!(cache.get("kb1").await.is_err());

        store.fail.store(false, Ordering::SeqCst);
        let entry = cache.get("kb1").await.expect("recovered");
        assert_eq!(entry.records.len(), 2);
        assert!(!cache.stats().knowledge_bases[0].building);
    }

    #[tokio::test]
    async fn vocabulary_ranks_topics_by_frequency() {
        let store = seeded().await;
        let cache = MetadataCache::new(store);
        let entry = cache.get("kb1").await.expect("read");

        assert_eq!(entry.vocabulary.top_topics(5), vec!["backups", "restore"]);
        assert!(entry.vocabulary.has_topic("Restore"));
        assert!(!entry.vocabulary.has_topic("billing"));
    }
}
