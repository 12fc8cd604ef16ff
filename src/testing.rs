//! In-process fakes for exercising the pipeline without models or a Qdrant server.

use crate::database::{ChunkRecord, RetrievedChunk, VectorIndex};
use crate::document::DocumentFetcher;
use crate::embeddings::{Embedder, Embedding};
use crate::error::{RagError, Result};
use crate::generator::AnswerGenerator;
use crate::rag::{RagEngine, RagSettings};
use async_trait::async_trait;
use axum::extract::State;
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use serde_json::json;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokenizers::Tokenizer;

/// Cosine-similarity index held in memory
#[derive(Default)]
pub struct MemoryIndex {
    records: Mutex<Vec<ChunkRecord>>,
    batches: Mutex<Vec<usize>>,
}

impl MemoryIndex {
    pub fn records(&self) -> Vec<ChunkRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    async fn upsert(&self, records: Vec<ChunkRecord>) -> Result<()> {
        self.batches.lock().unwrap().push(records.len());
        self.records.lock().unwrap().extend(records);
        Ok(())
    }

    async fn query(&self, vector: Vec<f32>, url: &str, top_k: u64) -> Result<Vec<RetrievedChunk>> {
        let mut hits: Vec<RetrievedChunk> = self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|record| record.url == url)
            .map(|record| RetrievedChunk {
                content: record.content.clone(),
                url: record.url.clone(),
                score: cosine(&vector, &record.vector),
            })
            .collect();

        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(top_k as usize);
        Ok(hits)
    }
}

/// Index whose every call fails
pub struct FailingIndex;

#[async_trait]
impl VectorIndex for FailingIndex {
    async fn upsert(&self, _records: Vec<ChunkRecord>) -> Result<()> {
        Err(RagError::IndexWrite("collection unavailable".to_string()))
    }

    async fn query(
        &self,
        _vector: Vec<f32>,
        _url: &str,
        _top_k: u64,
    ) -> Result<Vec<RetrievedChunk>> {
        Err(RagError::IndexQuery("collection unavailable".to_string()))
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Bag-of-words embedder hashing lowercase words into a fixed number of buckets
pub struct HashEmbedder {
    dimension: usize,
}

impl Default for HashEmbedder {
    fn default() -> Self {
        HashEmbedder { dimension: 64 }
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Embedding>> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut values = vec![0.0; self.dimension];
                for word in text.split(|c: char| !c.is_alphanumeric()) {
                    if word.is_empty() {
                        continue;
                    }
                    let mut hasher = DefaultHasher::new();
                    word.to_lowercase().hash(&mut hasher);
                    values[(hasher.finish() % self.dimension as u64) as usize] += 1.0;
                }
                Embedding { values }
            })
            .collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Generator that answers with its context and records every call.
///
/// Tokens are whitespace-separated words.
#[derive(Default)]
pub struct RecordingGenerator {
    calls: Mutex<Vec<(String, String)>>,
    fail: bool,
}

impl RecordingGenerator {
    pub fn failing() -> Self {
        RecordingGenerator {
            calls: Mutex::default(),
            fail: true,
        }
    }

    /// (question, context) pairs seen so far
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl AnswerGenerator for RecordingGenerator {
    fn truncate_to_tokens(&self, text: &str, max_tokens: usize) -> Result<String> {
        Ok(text
            .split_whitespace()
            .take(max_tokens)
            .collect::<Vec<_>>()
            .join(" "))
    }

    async fn generate(&self, question: &str, context: &str) -> Result<String> {
        self.calls
            .lock()
            .unwrap()
            .push((question.to_string(), context.to_string()));
        if self.fail {
            return Err(RagError::Generation("model crashed".to_string()));
        }
        Ok(context.to_string())
    }
}

/// Whitespace word-level tokenizer over `w0..w{vocab_size}`.
///
/// The post-processor wraps every sequence as `[cls] $A sep`, the way T5 appends
/// `</s>` and BERT wraps with `[CLS]`/`[SEP]`.
pub fn word_tokenizer(cls: Option<&str>, sep: &str, vocab_size: usize) -> Tokenizer {
    let mut specials = vec![sep.to_string(), "<unk>".to_string()];
    if let Some(cls) = cls {
        specials.push(cls.to_string());
    }

    let mut vocab: HashMap<String, u32> = specials
        .iter()
        .enumerate()
        .map(|(id, token)| (token.clone(), id as u32))
        .collect();
    for i in 0..vocab_size {
        vocab.insert(format!("w{}", i), (specials.len() + i) as u32);
    }

    let added_tokens: Vec<_> = specials
        .iter()
        .enumerate()
        .map(|(id, token)| {
            json!({
                "id": id,
                "content": token,
                "single_word": false,
                "lstrip": false,
                "rstrip": false,
                "normalized": false,
                "special": true
            })
        })
        .collect();

    let special = |token: &str| json!({ "SpecialToken": { "id": token, "type_id": 0 } });
    let sequence = |id: &str| json!({ "Sequence": { "id": id, "type_id": 0 } });
    let wrap = |ids: &[&str]| {
        let mut template = Vec::new();
        if let Some(cls) = cls {
            template.push(special(cls));
        }
        for id in ids {
            template.push(sequence(id));
            template.push(special(sep));
        }
        template
    };

    let mut special_tokens = serde_json::Map::new();
    for token in specials.iter().filter(|t| t.as_str() != "<unk>") {
        special_tokens.insert(
            token.clone(),
            json!({ "id": token, "ids": [vocab[token]], "tokens": [token] }),
        );
    }

    let config = json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": added_tokens,
        "normalizer": null,
        "pre_tokenizer": { "type": "WhitespaceSplit" },
        "post_processor": {
            "type": "TemplateProcessing",
            "single": wrap(&["A"][..]),
            "pair": wrap(&["A", "B"][..]),
            "special_tokens": special_tokens
        },
        "decoder": null,
        "model": { "type": "WordLevel", "vocab": vocab, "unk_token": "<unk>" }
    });

    Tokenizer::from_str(&config.to_string()).unwrap()
}

/// Engine wired to in-memory fakes, with handles to inspect them
pub struct Harness {
    pub engine: RagEngine,
    pub index: Arc<MemoryIndex>,
    pub generator: Arc<RecordingGenerator>,
}

pub fn test_engine(settings: RagSettings) -> Harness {
    let index = Arc::new(MemoryIndex::default());
    let generator = Arc::new(RecordingGenerator::default());
    let engine = RagEngine::new(
        DocumentFetcher::new(Duration::from_secs(5)).unwrap(),
        Arc::new(HashEmbedder::default()),
        index.clone(),
        generator.clone(),
        settings,
    );

    Harness {
        engine,
        index,
        generator,
    }
}

/// A local web server serving one HTML page at `/page`
pub struct TestSite {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
}

impl TestSite {
    pub fn page_url(&self) -> String {
        format!("http://{}/page", self.addr)
    }

    /// A path the server answers with 404
    pub fn missing_url(&self) -> String {
        format!("http://{}/missing", self.addr)
    }

    /// Number of times `/page` was requested
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

pub async fn spawn_site(body: &str) -> TestSite {
    let hits = Arc::new(AtomicUsize::new(0));
    let html = Arc::new(format!("<html><body>{}</body></html>", body));

    let app = Router::new()
        .route(
            "/page",
            get(|State((html, hits)): State<(Arc<String>, Arc<AtomicUsize>)>| async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Html(html.as_str().to_string())
            }),
        )
        .with_state((html, hits.clone()));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestSite { addr, hits }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_of_orthogonal_vectors_is_zero() {
        assert_eq!(cosine(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[tokio::test]
    async fn test_memory_index_filters_and_ranks() {
        let index = MemoryIndex::default();
        let record = |content: &str, url: &str, vector: Vec<f32>| ChunkRecord {
            id: content.to_string(),
            vector,
            content: content.to_string(),
            url: url.to_string(),
        };
        index
            .upsert(vec![
                record("far", "a", vec![0.0, 1.0]),
                record("near", "a", vec![1.0, 0.1]),
                record("elsewhere", "b", vec![1.0, 0.0]),
            ])
            .await
            .unwrap();

        let hits = index.query(vec![1.0, 0.0], "a", 10).await.unwrap();
        let order: Vec<&str> = hits.iter().map(|h| h.content.as_str()).collect();
        assert_eq!(order, vec!["near", "far"]);
        assert!(index.query(vec![1.0, 0.0], "c", 10).await.unwrap().is_empty());
    }
}
