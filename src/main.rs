use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use log::info;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use page_rag::chunking::DEFAULT_CHUNK_SIZE;
use page_rag::database::{QdrantClient, QdrantConfig};
use page_rag::document::DocumentFetcher;
use page_rag::embeddings::{Embedder, SentenceEmbedder};
use page_rag::generator::{GeneratorConfig, T5Generator};
use page_rag::rag::{RagEngine, RagSettings};
use page_rag::server;

/// Answers questions about a web page using retrieval-augmented generation
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Address to bind the HTTP server to (host:port)
    #[arg(long, env = "RAG_BIND", default_value = "127.0.0.1:5000")]
    bind: String,

    /// Directory with the sentence-embedding model (config.json, tokenizer.json, model.safetensors)
    #[arg(long, env = "RAG_EMBEDDING_MODEL_DIR")]
    embedding_model: PathBuf,

    /// Directory with the seq2seq generation model (config.json, tokenizer.json, model.safetensors)
    #[arg(long, env = "RAG_GENERATOR_MODEL_DIR")]
    generator_model: PathBuf,

    /// Seconds before a page fetch gives up
    #[arg(long, env = "RAG_FETCH_TIMEOUT_SECS", default_value_t = 30)]
    fetch_timeout_secs: u64,

    /// Maximum characters per indexed chunk
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,

    /// Chunks embedded and upserted per index request
    #[arg(long, default_value_t = 500)]
    upsert_batch_size: usize,

    /// Chunks retrieved per question
    #[arg(long, default_value_t = 10)]
    top_k: u64,

    /// Token budget for the retrieved context
    #[arg(long, default_value_t = 512)]
    max_context_tokens: usize,

    /// Prompt tokens kept before truncation
    #[arg(long, default_value_t = 512)]
    max_input_tokens: usize,

    /// Maximum tokens in a generated answer
    #[arg(long, default_value_t = 500)]
    max_answer_tokens: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize environment
    dotenv().ok();
    env_logger::init();

    let args = Args::parse();

    // Load configuration from environment
    let qdrant_config = QdrantConfig::from_env().context("Missing QDRANT_URL")?;

    let embedder = SentenceEmbedder::load(&args.embedding_model)
        .context("Failed to load embedding model")?;
    let generator = T5Generator::load(
        &args.generator_model,
        GeneratorConfig {
            max_input_tokens: args.max_input_tokens.max(1),
            max_answer_tokens: args.max_answer_tokens.max(1),
        },
    )
    .context("Failed to load generation model")?;

    let qdrant = QdrantClient::new(qdrant_config).context("Failed to initialize Qdrant client")?;
    qdrant
        .ensure_collection(embedder.dimension())
        .await
        .with_context(|| format!("Failed to prepare collection {}", qdrant.collection()))?;

    let fetcher = DocumentFetcher::new(Duration::from_secs(args.fetch_timeout_secs.max(1)))
        .context("Failed to build HTTP client")?;

    // Initialize RAG engine
    let engine = RagEngine::new(
        fetcher,
        Arc::new(embedder),
        Arc::new(qdrant),
        Arc::new(generator),
        RagSettings {
            chunk_size: args.chunk_size.max(1),
            upsert_batch_size: args.upsert_batch_size.max(1),
            top_k: args.top_k.max(1),
            max_context_tokens: args.max_context_tokens,
        },
    );

    let addr: SocketAddr = args
        .bind
        .parse()
        .with_context(|| format!("Invalid bind address {}", args.bind))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Listening on http://{}", addr);
    axum::serve(listener, server::router(Arc::new(engine)))
        .await
        .context("Server error")?;

    Ok(())
}
