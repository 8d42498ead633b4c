use chrono::Utc;
use clap::{Parser, Subcommand};
use kb_retrieval_core::{
    CharacterNgramEmbedder, DisabledLlm, DocumentConverter, Embedder, EmbeddingCache, EmbeddingStrategy,
    EngineConfig, HttpEmbedder, HybridSearchEngine, IngestionPipeline, MetadataCache, MultiEmbeddingGenerator,
    NoEmbeddings, OpenAiCompatibleLlm, QdrantChunkStore, QueryProcessor, SearchRequest, SearchResponse,
    TextCapability,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "kb-retrieval", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Qdrant base URL
    #[arg(long, env = "KB_QDRANT_URL", default_value = "http://localhost:6333")]
    qdrant_url: String,

    /// Qdrant collection
    #[arg(long, env = "KB_QDRANT_COLLECTION", default_value = "kb_chunks")]
    qdrant_collection: String,

    /// Document conversion service base URL. Without it only .md/.txt files ingest.
    #[arg(long, env = "KB_CONVERTER_URL")]
    converter_url: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Convert, chunk, enrich, embed and store documents.
    Ingest {
        /// Knowledge base (chatbot) id.
        #[arg(long)]
        chatbot: String,
        /// A single document.
        #[arg(long, conflicts_with = "folder", required_unless_present = "folder")]
        file: Option<PathBuf>,
        /// Folder scanned recursively for supported documents.
        #[arg(long)]
        folder: Option<PathBuf>,
    },
    /// Run hybrid retrieval against a knowledge base.
    Search {
        #[arg(long)]
        chatbot: String,
        #[arg(long)]
        query: String,
        #[arg(long, default_value = "5")]
        max_results: usize,
        #[arg(long, default_value = "0.3")]
        threshold: f32,
        /// Skip related-chunk expansion.
        #[arg(long, default_value_t = false)]
        no_related: bool,
        #[arg(long, default_value = "3")]
        context_window: usize,
        /// Print the raw response as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Build the metadata cache for a knowledge base and print cache statistics.
    CacheStats {
        #[arg(long)]
        chatbot: String,
        /// Drop any cached entry and rebuild it from the store.
        #[arg(long, default_value_t = false)]
        refresh: bool,
    },
    /// Remove a document's chunks, embeddings and relationships.
    Delete {
        #[arg(long)]
        chatbot: String,
        #[arg(long)]
        document_id: String,
    },
}

fn text_capability(config: &EngineConfig) -> Arc<dyn TextCapability> {
    match (&config.llm_endpoint, config.llm_metadata_enabled) {
        (Some(endpoint), true) => Arc::new(OpenAiCompatibleLlm::from_config(endpoint, config)),
        _ => Arc::new(DisabledLlm),
    }
}

fn embedder(config: &EngineConfig) -> Arc<dyn Embedder> {
    match &config.embedding_endpoint {
        Some(endpoint) => Arc::new(
            HttpEmbedder::new(
                endpoint,
                &config.embedding_model,
                config.embedding_api_key.clone(),
                config.embedding_dimensions,
            )
            .with_retry(config.retry),
        ),
        None => Arc::new(CharacterNgramEmbedder::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::from_env();

    let llm = text_capability(&config);
    let embedder = embedder(&config);
    let embeddings: Arc<dyn EmbeddingStrategy> = if config.embeddings_enabled {
        Arc::new(
            MultiEmbeddingGenerator::new(Arc::clone(&embedder), Arc::new(EmbeddingCache::default()))
                .with_batching(config.embedding_batch_size, config.batch_delay),
        )
    } else {
        Arc::new(NoEmbeddings)
    };

    let store = Arc::new(QdrantChunkStore::new(
        &cli.qdrant_url,
        &cli.qdrant_collection,
        embedder.dimensions(),
    ));
    let cache = Arc::new(MetadataCache::with_ttl(store.clone(), config.cache_ttl));

    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        llm = llm.name(),
        embedder = embedder.name(),
        embeddings_enabled = config.embeddings_enabled,
        "kb-retrieval boot"
    );

    match cli.command {
        Command::Ingest { chatbot, file, folder } => {
            store.ensure_collection().await?;
            let pipeline = IngestionPipeline::new(&config, llm, embeddings, store.clone(), cache)?;
            let converter = match &cli.converter_url {
                Some(url) => DocumentConverter::new(url),
                None => DocumentConverter::local_only(),
            };

            let reports = match (file, folder) {
                (Some(file), _) => {
                    let document = converter.convert(&file).await?;
                    vec![pipeline.ingest_document(&chatbot, &document).await?]
                }
                (None, Some(folder)) => {
                    let report = pipeline.ingest_folder(&chatbot, &folder, &converter).await?;
                    for skipped in &report.skipped_files {
                        warn!(path = %skipped.path.display(), reason = %skipped.reason, "skipped document");
                    }
                    report.documents
                }
                (None, None) => anyhow::bail!("either --file or --folder is required"),
            };

            for report in &reports {
                println!(
                    "{} document_id={} chunks={} relationships={} failures={} structure={:?} metadata_fallbacks={}",
                    report.title,
                    report.document_id,
                    report.chunks_stored,
                    report.relationships_stored,
                    report.failures.len(),
                    report.structure_source,
                    report.metadata_fallbacks
                );
                for failure in &report.failures {
                    println!("  chunk={} stage={:?} reason={}", failure.chunk_index, failure.stage, failure.reason);
                }
            }
            let total: usize = reports.iter().map(|report| report.chunks_stored).sum();
            println!("{} chunks ingested at {}", total, Utc::now().to_rfc3339());
        }
        Command::Search {
            chatbot,
            query,
            max_results,
            threshold,
            no_related,
            context_window,
            json,
        } => {
            let engine = HybridSearchEngine::new(store, cache, Arc::new(QueryProcessor::new(llm)), embeddings);
            let mut request = SearchRequest::new(chatbot, query);
            request.max_results = max_results;
            request.similarity_threshold = threshold;
            request.include_related = !no_related;
            request.context_window = context_window;

            let response = engine.search(&request).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
                return Ok(());
            }
            print_response(&response);
        }
        Command::CacheStats { chatbot, refresh } => {
            let entry = if refresh {
                cache.refresh(&chatbot).await?
            } else {
                cache.get(&chatbot).await?
            };
            println!("{}", serde_json::to_string_pretty(&cache.stats())?);
            println!("top topics: {}", entry.vocabulary.top_topics(10).join(", "));
        }
        Command::Delete { chatbot, document_id } => {
            let pipeline = IngestionPipeline::new(&config, llm, embeddings, store, cache)?;
            let removed = pipeline.delete_document(&chatbot, &document_id).await?;
            println!("{removed} chunks removed from document {document_id}");
        }
    }

    Ok(())
}

fn print_response(response: &SearchResponse) {
    match response {
        SearchResponse::Results { results, search_metadata } => {
            println!(
                "query: {} (state={:?}, intent={:?}, candidates={}, vectors={})",
                search_metadata.effective_query,
                search_metadata.query_state,
                search_metadata.strategy.intent,
                search_metadata.candidate_count,
                search_metadata.embeddings_used
            );
            for ranked in results {
                println!(
                    "[{:.4}] chunk={} document_id={} section={}",
                    ranked.score.composite, ranked.chunk.id, ranked.chunk.document_id, ranked.chunk.document_section
                );
                println!(
                    "  vector={:.3} metadata={:.3} relationship={:.3} type={:.3}",
                    ranked.score.vector, ranked.score.metadata, ranked.score.relationship, ranked.score.type_affinity
                );
                println!("  {}", ranked.chunk.body());
                for related in &ranked.related {
                    println!(
                        "  related: chunk={} {:?}/{:?} strength={:.2}",
                        related.chunk_id, related.relationship_type, related.direction, related.strength
                    );
                }
            }
        }
        SearchResponse::ClarificationNeeded { message, suggestions } => {
            println!("{message}");
            for suggestion in suggestions {
                println!("  - {suggestion}");
            }
        }
        SearchResponse::NoResults { search_metadata } => {
            println!("no results for: {}", search_metadata.effective_query);
        }
    }
}
