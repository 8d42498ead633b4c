//! Query classification, rewriting and metadata extraction.
//!
//! A query is classified as clear, contextual or unclear. Unclear queries end
//! with a clarification; contextual ones are rewritten into a standalone query
//! and then follow the clear path. Extracted metadata is always restricted to
//! the vocabulary the knowledge base actually contains.

use crate::cache::MetadataVocabulary;
use crate::keywords::{dedup_preserving_order, tokenize};
use crate::llm::{complete_json, TextCapability};
use crate::models::{ComplexityLevel, Facet, FacetWeights, QueryIntent, QueryMetadata, QueryScope, QueryState, SearchStrategy};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_with::{serde_as, DefaultOnError, VecSkipError};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

pub const MAX_CONVERSATION_TURNS: usize = 5;
pub const MAX_SUGGESTIONS: usize = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct ConversationTurn {
    pub query: String,
    pub effective_query: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationContext {
    pub turns: VecDeque<ConversationTurn>,
    pub topics: Vec<String>,
    pub entities: Vec<String>,
}

/// Recent turns per conversation id, capped at [`MAX_CONVERSATION_TURNS`].
#[derive(Debug, Default)]
pub struct ConversationStore {
    conversations: Mutex<HashMap<String, ConversationContext>>,
}

impl ConversationStore {
    pub fn context(&self, conversation_id: &str) -> ConversationContext {
        let conversations = self.conversations.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        conversations.get(conversation_id).cloned().unwrap_or_default()
    }

    pub fn record(&self, conversation_id: &str, turn: ConversationTurn, topics: &[String], entities: &[String]) {
        let mut conversations = self.conversations.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let context = conversations.entry(conversation_id.to_string()).or_default();

        context.turns.push_back(turn);
        while context.turns.len() > MAX_CONVERSATION_TURNS {
            context.turns.pop_front();
        }
        context.topics = dedup_preserving_order(context.topics.drain(..).chain(topics.iter().cloned()));
        context.entities = dedup_preserving_order(context.entities.drain(..).chain(entities.iter().cloned()));
    }
}

/// A query ready for retrieval.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedQuery {
    pub state: QueryState,
    pub effective_query: String,
    pub metadata: QueryMetadata,
    pub strategy: SearchStrategy,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    Clarification { message: String, suggestions: Vec<String> },
    Search(ProcessedQuery),
}

#[serde_as]
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ClassificationReply {
    #[serde_as(deserialize_as = "DefaultOnError")]
    state: Option<QueryState>,
    #[serde_as(deserialize_as = "DefaultOnError")]
    rewritten_query: Option<String>,
}

#[serde_as]
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RewriteReply {
    #[serde_as(deserialize_as = "DefaultOnError")]
    rewritten_query: Option<String>,
}

#[serde_as]
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ExtractionReply {
    #[serde_as(deserialize_as = "DefaultOnError<VecSkipError<_>>")]
    topics: Vec<String>,
    #[serde_as(deserialize_as = "DefaultOnError<VecSkipError<_>>")]
    question_types: Vec<String>,
    #[serde_as(deserialize_as = "DefaultOnError<VecSkipError<_>>")]
    keywords: Vec<String>,
    #[serde_as(deserialize_as = "DefaultOnError<VecSkipError<_>>")]
    entities: Vec<String>,
    #[serde_as(deserialize_as = "DefaultOnError")]
    complexity: Option<String>,
    #[serde_as(deserialize_as = "DefaultOnError")]
    intent: Option<QueryIntent>,
    #[serde_as(deserialize_as = "DefaultOnError")]
    scope: Option<QueryScope>,
    #[serde_as(deserialize_as = "DefaultOnError")]
    facet_weights: BTreeMap<String, f32>,
}

const CLASSIFY_SYSTEM_PROMPT: &str = "You decide whether a user question can be searched as-is. \
Reply with a single JSON object and nothing else.";
const REWRITE_SYSTEM_PROMPT: &str = "You rewrite follow-up questions into standalone questions. \
Reply with a single JSON object and nothing else.";
const EXTRACT_SYSTEM_PROMPT: &str = "You extract search metadata from a question using only the allowed values. \
Reply with a single JSON object and nothing else.";

pub struct QueryProcessor {
    llm: Arc<dyn TextCapability>,
    conversations: ConversationStore,
}

impl QueryProcessor {
    pub fn new(llm: Arc<dyn TextCapability>) -> Self {
        Self {
            llm,
            conversations: ConversationStore::default(),
        }
    }

    pub fn conversations(&self) -> &ConversationStore {
        &self.conversations
    }

    pub async fn process(&self, query: &str, conversation_id: Option<&str>, vocabulary: &MetadataVocabulary) -> QueryOutcome {
        let context = conversation_id
            .map(|id| self.conversations.context(id))
            .unwrap_or_default();

        let (state, classifier_rewrite) = self.classify(query, &context).await;
        debug!(?state, "query classified");

        let outcome = match state {
            QueryState::Unclear => QueryOutcome::Clarification {
                message: "Could you say a bit more about what you are looking for?".to_string(),
                suggestions: clarification_suggestions(vocabulary),
            },
            QueryState::Contextual => {
                let rewritten = match classifier_rewrite {
                    Some(rewritten) => rewritten,
                    None => self.rewrite(query, &context).await,
                };
                QueryOutcome::Search(self.extract(state, rewritten, vocabulary).await)
            }
            QueryState::Clear => QueryOutcome::Search(self.extract(state, query.trim().to_string(), vocabulary).await),
        };

        if let Some(conversation_id) = conversation_id {
            let (effective_query, topics, entities) = match &outcome {
                QueryOutcome::Search(processed) => (
                    processed.effective_query.clone(),
                    processed.metadata.topics.clone(),
                    processed.metadata.entities.clone(),
                ),
                QueryOutcome::Clarification { .. } => (query.to_string(), Vec::new(), Vec::new()),
            };
            self.conversations.record(
                conversation_id,
                ConversationTurn {
                    query: query.to_string(),
                    effective_query,
                    at: Utc::now(),
                },
                &topics,
                &entities,
            );
        }

        outcome
    }

    /// Classification never fails: any capability problem means `Clear`.
    async fn classify(&self, query: &str, context: &ConversationContext) -> (QueryState, Option<String>) {
        let prompt = format!(
            "Conversation so far (oldest first):\n{history}\n\nNew question: {query}\n\n\
Return JSON {{\"state\": \"clear\"|\"contextual\"|\"unclear\", \"rewritten_query\": string|null}}. \
Use contextual only when the question depends on the conversation; include the standalone rewrite in that case.",
            history = history_lines(context),
        );

        match complete_json::<ClassificationReply>(self.llm.as_ref(), CLASSIFY_SYSTEM_PROMPT, &prompt).await {
            Ok(reply) => {
                let state = reply.state.unwrap_or_default();
                if state == QueryState::Contextual && context.turns.is_empty() {
                    return (QueryState::Clear, None);
                }
                let rewrite = reply
                    .rewritten_query
                    .map(|text| text.trim().to_string())
                    .filter(|text| !text.is_empty());
                (state, rewrite)
            }
            Err(error) => {
                warn!(%error, "query classification unavailable; treating as clear");
                (QueryState::Clear, None)
            }
        }
    }

    async fn rewrite(&self, query: &str, context: &ConversationContext) -> String {
        let prompt = format!(
            "Conversation so far (oldest first):\n{history}\n\nFollow-up: {query}\n\n\
Return JSON {{\"rewritten_query\": string}} containing a standalone version of the follow-up.",
            history = history_lines(context),
        );

        match complete_json::<RewriteReply>(self.llm.as_ref(), REWRITE_SYSTEM_PROMPT, &prompt).await {
            Ok(RewriteReply { rewritten_query: Some(text) }) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => fallback_rewrite(query, context),
            Err(error) => {
                warn!(%error, "query rewrite unavailable; folding in conversation topics");
                fallback_rewrite(query, context)
            }
        }
    }

    async fn extract(&self, state: QueryState, effective_query: String, vocabulary: &MetadataVocabulary) -> ProcessedQuery {
        let mut metadata = rule_based_metadata(&effective_query, vocabulary);
        let mut intent = infer_intent(&effective_query);
        let mut scope = infer_scope(&effective_query);
        let mut weights = weights_for_intent(intent);

        let prompt = extraction_prompt(&effective_query, vocabulary);
        match complete_json::<ExtractionReply>(self.llm.as_ref(), EXTRACT_SYSTEM_PROMPT, &prompt).await {
            Ok(reply) => {
                let restricted = restrict_to_vocabulary(&reply, vocabulary);
                metadata.topics = dedup_preserving_order(restricted.topics.into_iter().chain(metadata.topics));
                metadata.question_types =
                    dedup_preserving_order(restricted.question_types.into_iter().chain(metadata.question_types));
                metadata.keywords = dedup_preserving_order(restricted.keywords.into_iter().chain(metadata.keywords));
                metadata.entities = dedup_preserving_order(restricted.entities.into_iter().chain(metadata.entities));
                metadata.complexity = restricted.complexity.or(metadata.complexity);

                intent = reply.intent.unwrap_or(intent);
                scope = reply.scope.unwrap_or(scope);
                weights = validated_weights(&reply.facet_weights).unwrap_or_else(|| weights_for_intent(intent));
            }
            Err(error) => warn!(%error, "query metadata extraction unavailable; using rules"),
        }

        ProcessedQuery {
            state,
            effective_query,
            metadata,
            strategy: SearchStrategy { weights, intent, scope },
        }
    }
}

fn history_lines(context: &ConversationContext) -> String {
    if context.turns.is_empty() {
        return "(none)".to_string();
    }
    context
        .turns
        .iter()
        .map(|turn| format!("- {}", turn.effective_query))
        .collect::<Vec<_>>()
        .join("\n")
}

fn fallback_rewrite(query: &str, context: &ConversationContext) -> String {
    let mut rewritten = query.trim().to_string();
    for topic in context.topics.iter().rev().take(3) {
        if !rewritten.to_lowercase().contains(&topic.to_lowercase()) {
            rewritten.push(' ');
            rewritten.push_str(topic);
        }
    }
    rewritten
}

pub fn clarification_suggestions(vocabulary: &MetadataVocabulary) -> Vec<String> {
    vocabulary
        .top_topics(MAX_SUGGESTIONS)
        .into_iter()
        .map(|topic| format!("Tell me about {topic}"))
        .collect()
}

fn extraction_prompt(query: &str, vocabulary: &MetadataVocabulary) -> String {
    format!(
        "Question: {query}\n\nAllowed topics: {topics}\nAllowed question types: {question_types}\n\
Allowed entities: {entities}\n\nReturn JSON with keys topics, question_types, keywords, entities, \
complexity (beginner|intermediate|advanced|null), intent (factual|procedural|conceptual|troubleshooting|comparative), \
scope (specific|comprehensive), facet_weights (object mapping content, topics, keywords, heading_context, \
document_section, audience, question_type to numbers between 0 and 1).",
        topics = joined(vocabulary.topic_counts.keys(), 200),
        question_types = joined(vocabulary.question_types.iter(), 50),
        entities = joined(vocabulary.entities.iter(), 100),
    )
}

fn joined<'a>(values: impl Iterator<Item = &'a String>, limit: usize) -> String {
    values.take(limit).map(String::as_str).collect::<Vec<_>>().join(", ")
}

/// Matches the query against observed vocabulary without any external call.
pub fn rule_based_metadata(query: &str, vocabulary: &MetadataVocabulary) -> QueryMetadata {
    let lowered = query.to_lowercase();
    let tokens = tokenize(query);

    let topics = vocabulary
        .topic_counts
        .keys()
        .filter(|topic| phrase_in_query(topic, &lowered, &tokens))
        .cloned()
        .collect();
    let keywords = dedup_preserving_order(
        tokens
            .iter()
            .filter(|token| vocabulary.keywords.contains(*token))
            .cloned(),
    );
    let entities = vocabulary
        .entities
        .iter()
        .filter(|entity| phrase_in_query(entity, &lowered, &tokens))
        .cloned()
        .collect();
    let question_types = inferred_question_types(&lowered)
        .into_iter()
        .filter(|question_type| vocabulary.question_types.contains(*question_type))
        .map(str::to_string)
        .collect();

    QueryMetadata {
        topics,
        question_types,
        keywords,
        entities,
        complexity: None,
    }
}

/// A multi-word phrase must appear verbatim; a single word must be a query token.
fn phrase_in_query(phrase: &str, lowered_query: &str, tokens: &[String]) -> bool {
    if phrase.contains(char::is_whitespace) {
        lowered_query.contains(phrase)
    } else {
        tokens.iter().any(|token| token == phrase)
    }
}

fn inferred_question_types(lowered: &str) -> Vec<&'static str> {
    let mut types = Vec::new();
    if lowered.starts_with("how") || lowered.contains("how to") || lowered.contains("steps") {
        types.push("how-to");
    }
    if lowered.starts_with("what") {
        types.push("what");
    }
    if lowered.starts_with("why") {
        types.push("why");
    }
    if ["error", "fail", "not working", "broken", "issue"].iter().any(|marker| lowered.contains(marker)) {
        types.push("troubleshooting");
    }
    if [" vs ", "versus", "compare", "difference"].iter().any(|marker| lowered.contains(marker)) {
        types.push("comparison");
    }
    types
}

fn restrict_to_vocabulary(reply: &ExtractionReply, vocabulary: &MetadataVocabulary) -> QueryMetadata {
    let lowered = |values: &[String]| values.iter().map(|value| value.trim().to_lowercase()).collect::<Vec<_>>();
    QueryMetadata {
        topics: lowered(&reply.topics)
            .into_iter()
            .filter(|topic| vocabulary.topic_counts.contains_key(topic))
            .collect(),
        question_types: lowered(&reply.question_types)
            .into_iter()
            .filter(|value| vocabulary.question_types.contains(value))
            .collect(),
        keywords: lowered(&reply.keywords)
            .into_iter()
            .filter(|value| vocabulary.keywords.contains(value))
            .collect(),
        entities: lowered(&reply.entities)
            .into_iter()
            .filter(|value| vocabulary.entities.contains(value))
            .collect(),
        complexity: reply.complexity.as_deref().and_then(ComplexityLevel::parse),
    }
}

pub fn infer_intent(query: &str) -> QueryIntent {
    let lowered = query.to_lowercase();
    let has = |markers: &[&str]| markers.iter().any(|marker| lowered.contains(marker));
    if has(&["error", "fail", "not working", "broken", "fix", "troubleshoot"]) {
        QueryIntent::Troubleshooting
    } else if has(&[" vs ", "versus", "compare", "difference between"]) {
        QueryIntent::Comparative
    } else if has(&["how to", "how do", "how can", "steps", "install", "configure", "set up", "setup"]) {
        QueryIntent::Procedural
    } else if has(&["why", "explain", "concept", "overview", "what is"]) {
        QueryIntent::Conceptual
    } else {
        QueryIntent::Factual
    }
}

pub fn infer_scope(query: &str) -> QueryScope {
    let lowered = query.to_lowercase();
    if ["all ", "every", "overview", "everything", "comprehensive", "list of"]
        .iter()
        .any(|marker| lowered.contains(marker))
    {
        QueryScope::Comprehensive
    } else {
        QueryScope::Specific
    }
}

pub fn weights_for_intent(intent: QueryIntent) -> FacetWeights {
    let weights: [(Facet, f32); 7] = match intent {
        QueryIntent::Factual => return FacetWeights::default(),
        QueryIntent::Procedural => [
            (Facet::Content, 0.35),
            (Facet::Topics, 0.15),
            (Facet::Keywords, 0.15),
            (Facet::HeadingContext, 0.15),
            (Facet::QuestionType, 0.15),
            (Facet::DocumentSection, 0.05),
            (Facet::Audience, 0.0),
        ],
        QueryIntent::Conceptual => [
            (Facet::Content, 0.35),
            (Facet::Topics, 0.3),
            (Facet::Keywords, 0.1),
            (Facet::HeadingContext, 0.1),
            (Facet::QuestionType, 0.1),
            (Facet::DocumentSection, 0.05),
            (Facet::Audience, 0.0),
        ],
        QueryIntent::Troubleshooting => [
            (Facet::Content, 0.35),
            (Facet::Topics, 0.15),
            (Facet::Keywords, 0.25),
            (Facet::HeadingContext, 0.05),
            (Facet::QuestionType, 0.15),
            (Facet::DocumentSection, 0.05),
            (Facet::Audience, 0.0),
        ],
        QueryIntent::Comparative => [
            (Facet::Content, 0.35),
            (Facet::Topics, 0.25),
            (Facet::Keywords, 0.15),
            (Facet::HeadingContext, 0.1),
            (Facet::QuestionType, 0.05),
            (Facet::DocumentSection, 0.1),
            (Facet::Audience, 0.0),
        ],
    };
    FacetWeights(weights.into_iter().collect())
}

/// Clamps each weight to [0, 1] and normalises to sum 1. `None` if nothing usable remains.
fn validated_weights(raw: &BTreeMap<String, f32>) -> Option<FacetWeights> {
    let mut weights = BTreeMap::new();
    for facet in Facet::ALL {
        let weight = raw
            .get(facet.as_str())
            .copied()
            .filter(|weight| weight.is_finite())
            .unwrap_or(0.0)
            .clamp(0.0, 1.0);
        weights.insert(facet, weight);
    }
    let total: f32 = weights.values().sum();
    if total <= 0.0 {
        return None;
    }
    for weight in weights.values_mut() {
        *weight /= total;
    }
    Some(FacetWeights(weights))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CapabilityError;
    use crate::llm::DisabledLlm;
    use crate::models::{Chunk, ChunkMetadata, ChunkRecord, ChunkType, Entity};
    use async_trait::async_trait;

    /// Answers by system prompt so one fake can serve every stage.
    struct RoutedLlm {
        classify: &'static str,
        rewrite: &'static str,
        extract: &'static str,
    }

    #[async_trait]
    impl TextCapability for RoutedLlm {
        fn name(&self) -> &str {
            "routed"
        }

        async fn complete(&self, system: &str, _prompt: &str) -> Result<String, CapabilityError> {
            let reply = if system == CLASSIFY_SYSTEM_PROMPT {
                self.classify
            } else if system == REWRITE_SYSTEM_PROMPT {
                self.rewrite
            } else {
                self.extract
            };
            Ok(reply.to_string())
        }
    }

    fn vocabulary() -> MetadataVocabulary {
        let record = |topics: &[&str], keywords: &[&str], question_types: &[&str]| ChunkRecord {
            chunk: Chunk {
                id: "c".to_string(),
                chatbot_id: "kb".to_string(),
                document_id: "doc".to_string(),
                content: String::new(),
                overlap_len: 0,
                chunk_type: ChunkType::Text,
                index: 0,
                heading_context: Vec::new(),
                size_chars: 0,
                word_count: 0,
                document_section: String::new(),
            },
            metadata: ChunkMetadata {
                topics: topics.iter().map(|value| value.to_string()).collect(),
                keywords: keywords.iter().map(|value| value.to_string()).collect(),
                question_types: question_types.iter().map(|value| value.to_string()).collect(),
                entities: vec![Entity { name: "PostgreSQL".to_string(), entity_type: "product".to_string() }],
                ..ChunkMetadata::default()
            },
        };
        MetadataVocabulary::from_records(&[
            record(&["backups", "disaster recovery"], &["snapshot", "retention"], &["how-to"]),
            record(&["backups"], &["restore"], &["what"]),
            record(&["billing"], &["invoice"], &["what"]),
        ])
    }

    #[tokio::test]
    async fn classifier_outage_defaults_to_clear_with_rule_metadata() {
        let processor = QueryProcessor::new(Arc::new(DisabledLlm));
        let outcome = processor
            .process("How do I restore a snapshot with PostgreSQL?", None, &vocabulary())
            .await;

        let QueryOutcome::Search(processed) = outcome else {
            panic!("expected search outcome");
        };
        assert_eq!(processed.state, QueryState::Clear);
        assert_eq!(processed.metadata.keywords, vec!["restore", "snapshot"]);
        assert_eq!(processed.metadata.entities, vec!["postgresql"]);
        assert_eq!(processed.metadata.question_types, vec!["how-to"]);
        assert_eq!(processed.strategy.intent, QueryIntent::Procedural);
    }

    #[tokio::test]
    async fn unmatched_query_extracts_nothing() {
        let processor = QueryProcessor::new(Arc::new(DisabledLlm));
        let QueryOutcome::Search(processed) = processor.process("hello", None, &vocabulary()).await else {
            panic!("expected search outcome");
        };
        assert!(processed.metadata.is_empty());
    }

    #[tokio::test]
    async fn unclear_query_returns_topic_suggestions() {
        let processor = QueryProcessor::new(Arc::new(RoutedLlm {
            classify: r#"{"state": "unclear"}"#,
            rewrite: "{}",
            extract: "{}",
        }));
        let outcome = processor.process("it?", Some("conv"), &vocabulary()).await;

        let QueryOutcome::Clarification { suggestions, .. } = outcome else {
            panic!("expected clarification");
        };
        assert_eq!(suggestions[0], "Tell me about backups");
        assert!(suggestions.len() <= MAX_SUGGESTIONS);
        assert_eq!(processor.conversations().context("conv").turns.len(), 1);
    }

    #[tokio::test]
    async fn contextual_query_is_rewritten_before_extraction() {
        let processor = QueryProcessor::new(Arc::new(RoutedLlm {
            classify: r#"{"state": "contextual"}"#,
            rewrite: r#"{"rewritten_query": "How long is backups retention?"}"#,
            extract: r#"{"topics": ["Backups", "invented topic"], "intent": "factual", "facet_weights": {"content": 2, "topics": 1}}"#,
        }));
        processor.conversations().record(
            "conv",
            ConversationTurn {
                query: "tell me about backups".to_string(),
                effective_query: "tell me about backups".to_string(),
                at: Utc::now(),
            },
            &["backups".to_string()],
            &[],
        );

        let QueryOutcome::Search(processed) = processor.process("how long is it kept?", Some("conv"), &vocabulary()).await
        else {
            panic!("expected search outcome");
        };
        assert_eq!(processed.state, QueryState::Contextual);
        assert_eq!(processed.effective_query, "How long is backups retention?");
        assert_eq!(processed.metadata.topics, vec!["backups"]);
        assert!(processed.metadata.keywords.contains(&"retention".to_string()));
        assert!((processed.strategy.weights.weight(Facet::Content) - 0.5).abs() < 1e-6);
        assert_eq!(processed.strategy.weights.weight(Facet::Keywords), 0.0);
    }

    #[tokio::test]
    async fn contextual_without_history_is_clear() {
        let processor = QueryProcessor::new(Arc::new(RoutedLlm {
            classify: r#"{"state": "contextual", "rewritten_query": "x"}"#,
            rewrite: "{}",
            extract: "{}",
        }));
        let QueryOutcome::Search(processed) = processor.process("what about billing", None, &vocabulary()).await else {
            panic!("expected search outcome");
        };
        assert_eq!(processed.state, QueryState::Clear);
        assert_eq!(processed.effective_query, "what about billing");
        assert_eq!(processed.metadata.topics, vec!["billing"]);
    }

    #[test]
    fn conversation_keeps_last_five_turns_and_dedups_topics() {
        let store = ConversationStore::default();
        for i in 0..7 {
            store.record(
                "c",
                ConversationTurn { query: format!("q{i}"), effective_query: format!("q{i}"), at: Utc::now() },
                &["backups".to_string(), format!("t{}", i % 2)],
                &[],
            );
        }
        let context = store.context("c");
        assert_eq!(context.turns.len(), MAX_CONVERSATION_TURNS);
        assert_eq!(context.turns[0].query, "q2");
        assert_eq!(context.topics, vec!["backups", "t0", "t1"]);
    }

    #[test]
    fn fallback_rewrite_appends_recent_topics() {
        let context = ConversationContext {
            topics: vec!["backups".to_string(), "retention".to_string()],
            ..ConversationContext::default()
        };
        assert_eq!(fallback_rewrite("how long?", &context), "how long? retention backups");
    }

    #[test]
    fn intent_weights_sum_to_one() {
        for intent in [
            QueryIntent::Factual,
            QueryIntent::Procedural,
            QueryIntent::Conceptual,
            QueryIntent::Troubleshooting,
            QueryIntent::Comparative,
        ] {
            let total: f32 = weights_for_intent(intent).0.values().sum();
            assert!((total - 1.0).abs() < 1e-5, "{intent:?} sums to {total}");
        }
    }
}
