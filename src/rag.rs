use crate::chunking::{split_into_chunks, TextChunk, DEFAULT_CHUNK_SIZE};
use crate::database::{ChunkRecord, VectorIndex};
use crate::document::DocumentFetcher;
use crate::embeddings::Embedder;
use crate::error::{RagError, Result};
use crate::generator::AnswerGenerator;
use log::{debug, info};
use std::sync::Arc;
use uuid::Uuid;

/// Tunables for one pass through the pipeline
#[derive(Debug, Clone, Copy)]
pub struct RagSettings {
    /// Maximum characters per chunk
    pub chunk_size: usize,
    /// Chunks embedded and written per index request
    pub upsert_batch_size: usize,
    /// Chunks retrieved per question
    pub top_k: u64,
    /// Token budget for the assembled context
    pub max_context_tokens: usize,
}

impl Default for RagSettings {
    fn default() -> Self {
        RagSettings {
            chunk_size: DEFAULT_CHUNK_SIZE,
            upsert_batch_size: 500,
            top_k: 10,
            max_context_tokens: 512,
        }
    }
}

/// RAG (Retrieval-Augmented Generation) engine
pub struct RagEngine {
    fetcher: DocumentFetcher,
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    generator: Arc<dyn AnswerGenerator>,
    settings: RagSettings,
}

impl RagEngine {
    /// Create a new RAG engine
    pub fn new(
        fetcher: DocumentFetcher,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        generator: Arc<dyn AnswerGenerator>,
        settings: RagSettings,
    ) -> Self {
        RagEngine {
            fetcher,
            embedder,
            index,
            generator,
            settings,
        }
    }

    /// Fetch, index, retrieve and generate. Nothing is cached between calls
    pub async fn answer(&self, url: &str, question: &str) -> Result<String> {
        self.index_url(url).await?;

        let chunks = self.retrieve(url, question).await?;
        let context = self.assemble_context(&chunks)?;

        let answer = self.generator.generate(question, &context).await?;
        info!("Answered question about {} ({} chars)", url, answer.len());

        Ok(answer)
    }

    /// Fetch a page, chunk it and write every chunk to the index under fresh ids.
    ///
    /// Indexing the same URL twice stores its chunks twice. Batches are written in
    /// order and a failing batch stops the rest; earlier batches stay in the index.
    pub async fn index_url(&self, url: &str) -> Result<Vec<TextChunk>> {
        let document = self.fetcher.fetch(url).await?;

        let chunks = split_into_chunks(&document.content, url, self.settings.chunk_size);
        info!("Split {} into {} chunks", url, chunks.len());

        let batch_size = self.settings.upsert_batch_size.max(1);
        for (batch_number, batch) in chunks.chunks(batch_size).enumerate() {
            let texts = batch.iter().map(|chunk| chunk.text.clone()).collect();
            let embeddings = self.embedder.embed(texts).await?;
            if embeddings.len() != batch.len() {
                return Err(RagError::Embedding(format!(
                    "expected {} vectors, got {}",
                    batch.len(),
                    embeddings.len()
                )));
            }

            let records = batch
                .iter()
                .zip(embeddings)
                .map(|(chunk, embedding)| ChunkRecord {
                    id: Uuid::new_v4().to_string(),
                    vector: embedding.values,
                    content: chunk.text.clone(),
                    url: chunk.url.clone(),
                })
                .collect();

            self.index.upsert(records).await?;
            debug!("Indexed batch {} ({} chunks)", batch_number + 1, batch.len());
        }

        Ok(chunks)
    }

    /// Texts of the chunks from `url` closest to `question`, best first
    pub async fn retrieve(&self, url: &str, question: &str) -> Result<Vec<String>> {
        let query = self.embedder.embed_one(question).await?;
        let matches = self
            .index
            .query(query.values, url, self.settings.top_k)
            .await?;

        info!("Retrieved {} chunks for {}", matches.len(), url);
        Ok(matches.into_iter().map(|m| m.content).collect())
    }

    /// Join retrieved chunks with spaces and cut the result to the context token budget.
    ///
    /// The cut is token-based and may land mid-sentence.
    pub fn assemble_context(&self, chunks: &[String]) -> Result<String> {
        let context = chunks.join(" ");
        self.generator
            .truncate_to_tokens(&context, self.settings.max_context_tokens)
    }
}
